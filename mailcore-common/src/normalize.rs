//! Address normalization (§3): PRECIS UsernameCaseMapped for the local
//! part, IDNA-to-Unicode-then-NFC-then-lowercase for the domain.

use unicode_normalization::UnicodeNormalization;

use crate::{envelope, error::NormalizeError};

/// Normalizes a user-part string per a PRECIS `UsernameCaseMapped`-style
/// profile: NFC-normalize, then case-fold to lowercase. Full PRECIS also
/// forbids certain bidi and disallowed codepoints; those checks are left
/// to the embedding acceptor's validation layer, which is out of scope
/// here (§1).
#[must_use]
pub fn normalize_user(user: &str) -> String {
    user.nfc().collect::<String>().to_lowercase()
}

/// Normalizes a domain: IDNA-to-Unicode, then NFC, then lowercase.
///
/// Non-local domains kept for forwarding are normalized the same way;
/// the caller decides whether to re-encode to A-labels for the wire.
///
/// # Errors
///
/// Returns [`NormalizeError::InvalidDomain`] if the domain cannot be
/// decoded as IDNA.
pub fn normalize_domain(domain: &str) -> Result<String, NormalizeError> {
    if domain.is_empty() {
        return Ok(String::new());
    }

    let (unicode, result) = idna::domain_to_unicode(domain);
    if let Err(errors) = result {
        return Err(NormalizeError::InvalidDomain(
            domain.to_string(),
            format!("{errors:?}"),
        ));
    }

    Ok(unicode.nfc().collect::<String>().to_lowercase())
}

/// Normalizes a domain to IDNA A-labels (ASCII), for use on the wire
/// (e.g. `EHLO`/SRS rewriting of non-ASCII domains).
///
/// # Errors
///
/// Returns [`NormalizeError::InvalidDomain`] if the domain cannot be
/// converted to A-labels.
pub fn to_ascii(domain: &str) -> Result<String, NormalizeError> {
    idna::domain_to_ascii(domain)
        .map_err(|e| NormalizeError::InvalidDomain(domain.to_string(), e.to_string()))
}

/// Full address normalization: split, normalize each half, rejoin.
///
/// The empty address `<>` is passed through unchanged (it denotes the
/// null reverse-path and has no user/domain structure to normalize).
///
/// # Errors
///
/// Returns [`NormalizeError::InvalidDomain`] if the domain half fails
/// IDNA decoding.
pub fn normalize_address(addr: &str) -> Result<String, NormalizeError> {
    if addr.is_empty() || addr == "<>" {
        return Ok(addr.to_string());
    }

    let (user, domain) = envelope::split(addr);
    let user = normalize_user(&user);

    if domain.is_empty() {
        return Ok(user);
    }

    let domain = normalize_domain(&domain)?;
    Ok(format!("{user}@{domain}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_user_lowercases() {
        assert_eq!(normalize_user("Bob"), "bob");
    }

    #[test]
    fn normalize_domain_lowercases_ascii() {
        assert_eq!(normalize_domain("EXAMPLE.com").unwrap(), "example.com");
    }

    #[test]
    fn normalize_address_is_idempotent() {
        let addr = "Bob.Smith@EXAMPLE.com";
        let once = normalize_address(addr).unwrap();
        let twice = normalize_address(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn normalize_address_passes_through_null_sender() {
        assert_eq!(normalize_address("<>").unwrap(), "<>");
    }

    #[test]
    fn normalize_unqualified_address_has_no_domain() {
        assert_eq!(normalize_address("Postmaster").unwrap(), "postmaster");
    }

    #[test]
    fn to_ascii_round_trips_unicode_domain() {
        let ascii = to_ascii("müller.example").unwrap();
        assert!(ascii.starts_with("xn--"));
    }
}
