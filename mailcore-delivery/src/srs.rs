//! Sender Rewriting Scheme for forwarded mail.
//!
//! When this hop forwards someone else's mail to a third domain, the
//! bounce needs to come back here rather than to the original sender's
//! server (which would reject it, since we're not their MX). Rewriting
//! the envelope sender to point at the original recipient's mailbox,
//! tagged with the real sender, lets a later bounce be routed back and
//! unwrapped.

use mailcore_common::{envelope, normalize};

/// Rewrites `from` for forwarding mail that was originally addressed to
/// `original_recipient`, per the scheme: `<local>+fwd_from=<from, @→=>@<IDNA
/// domain of original_recipient>`.
///
/// Returns `from` unchanged if it is the empty reverse path (`<>`) or if
/// `original_recipient` has no domain part.
///
/// # Errors
///
/// Returns an error if the original recipient's domain fails IDNA
/// conversion.
pub fn rewrite(from: &str, original_recipient: &str) -> Result<String, normalize::NormalizeError> {
    if from.is_empty() || from == "<>" {
        return Ok(from.to_string());
    }

    let (local, domain) = envelope::split(original_recipient);
    if domain.is_empty() {
        return Ok(from.to_string());
    }

    let ascii_domain = normalize::to_ascii(&domain)?;
    let tagged_from = from.replace('@', "=");

    Ok(format!("{local}+fwd_from={tagged_from}@{ascii_domain}"))
}

/// Whether `from`'s domain falls outside the given set of local domains,
/// i.e. whether this delivery is a forward of someone else's mail rather
/// than mail this server originates.
#[must_use]
pub fn is_foreign_sender(from: &str, local_domains: &std::collections::HashSet<mailcore_common::Domain>) -> bool {
    if from.is_empty() || from == "<>" {
        return false;
    }
    let (_, domain) = envelope::split(from);
    if domain.is_empty() {
        return false;
    }
    !envelope::domain_in(from, local_domains)
}
