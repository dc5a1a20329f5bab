//! Envelope utilities (C1): splitting, domain membership, and header folding.

use std::collections::HashSet;

use crate::domain::Domain;

/// Splits `user@domain` on the first `@`.
///
/// An address with no `@` is treated as having an empty domain (i.e. it
/// is unqualified and local per [`domain_in`]).
#[must_use]
pub fn split(addr: &str) -> (String, String) {
    match addr.find('@') {
        Some(pos) => (addr[..pos].to_string(), addr[pos + 1..].to_string()),
        None => (addr.to_string(), String::new()),
    }
}

/// Returns `true` if `addr`'s domain is empty (unqualified, treated as
/// local) or present in `set`.
#[must_use]
pub fn domain_in(addr: &str, set: &HashSet<Domain>) -> bool {
    let (_, domain) = split(addr);
    if domain.is_empty() {
        return true;
    }
    set.contains(&Domain::new(domain))
}

/// Prepends a header of the form `Key: value\r\n` to `data`.
///
/// Embedded newlines in `value` are folded onto continuation lines with a
/// leading tab, matching RFC 5322 header folding. A trailing newline in
/// `value` is stripped before folding so the header block itself always
/// ends with exactly one CRLF.
#[must_use]
pub fn add_header(data: &[u8], key: &str, value: &str) -> Vec<u8> {
    let value = value.strip_suffix("\r\n").unwrap_or(value);
    let value = value.strip_suffix('\n').unwrap_or(value);

    let folded = value.replace('\n', "\r\n\t");
    let mut header = format!("{key}: {folded}\r\n").into_bytes();

    header.extend_from_slice(data);
    header
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_first_at() {
        assert_eq!(
            split("user@example.com"),
            ("user".to_string(), "example.com".to_string())
        );
        assert_eq!(
            split("a@b@example.com"),
            ("a".to_string(), "b@example.com".to_string())
        );
    }

    #[test]
    fn split_with_no_at_is_unqualified() {
        assert_eq!(split("postmaster"), ("postmaster".to_string(), String::new()));
    }

    #[test]
    fn domain_in_treats_unqualified_as_local() {
        let set = HashSet::new();
        assert!(domain_in("postmaster", &set));
    }

    #[test]
    fn domain_in_checks_membership() {
        let mut set = HashSet::new();
        set.insert(Domain::new("example.com"));
        assert!(domain_in("user@example.com", &set));
        assert!(!domain_in("user@other.com", &set));
    }

    #[test]
    fn add_header_prepends_and_folds() {
        let data = b"body\r\n";
        let out = add_header(data, "X-Test", "line1\nline2");
        assert_eq!(out, b"X-Test: line1\r\n\tline2\r\nbody\r\n".to_vec());
    }

    #[test]
    fn add_header_strips_trailing_newline() {
        let out = add_header(b"body", "X-Test", "value\n");
        assert_eq!(out, b"X-Test: value\r\nbody".to_vec());
    }

    #[test]
    fn add_header_strips_trailing_crlf() {
        let out = add_header(b"body", "X-Test", "value\r\n");
        assert_eq!(out, b"X-Test: value\r\nbody".to_vec());
    }
}
