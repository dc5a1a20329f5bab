//! Delivery Status Notification generation (§4.7).
//!
//! ```text
//! multipart/report; report-type="delivery-status"
//! ├── text/plain                human-readable explanation
//! ├── message/delivery-status   machine-readable per-recipient status
//! └── text/rfc822-headers       headers of the original message
//! ```
//!
//! A DSN is itself built as a fresh [`QueueItem`] with an empty reverse
//! path, so it can never generate a DSN of its own (§8 invariant 6).

use std::collections::HashSet;
use std::fmt::Write as _;

use mailcore_common::{Domain, envelope};
use mailcore_spool::item::{QueueItem, QueuedRecipient, RecipientKind, RecipientStatus};

const BOUNDARY: &str = "==mailcore-dsn-boundary==";

#[derive(Debug, Clone)]
pub struct DsnConfig {
    /// Hostname reported as `Reporting-MTA`.
    pub reporting_mta: String,
}

impl Default for DsnConfig {
    fn default() -> Self {
        Self {
            reporting_mta: "localhost".to_string(),
        }
    }
}

/// Builds a bounce for `item`'s non-SENT recipients, or `None` if there's
/// nothing to report (every recipient succeeded) or the original sender
/// was the null reverse path.
#[must_use]
pub fn build(item: &QueueItem, local_domains: &HashSet<Domain>, config: &DsnConfig) -> Option<QueueItem> {
    if item.from.is_empty() || item.from == "<>" {
        return None;
    }

    let unsent: Vec<&QueuedRecipient> = item
        .rcpt
        .iter()
        .filter(|r| r.status != RecipientStatus::Sent)
        .collect();
    if unsent.is_empty() {
        return None;
    }

    let from_domain = pick_from_domain(item, local_domains);
    let body = render(item, &unsent, config, &from_domain);

    Some(QueueItem::new(
        "<>",
        vec![item.from.clone()],
        vec![QueuedRecipient::new(RecipientKind::Email, &item.from, &item.from)],
        body.into_bytes(),
    ))
}

/// Prefers the sender's own domain if it's local, else the first
/// original recipient whose domain is local, else a synthesized
/// placeholder — there's always *some* local domain to speak as.
fn pick_from_domain(item: &QueueItem, local_domains: &HashSet<Domain>) -> String {
    let (_, sender_domain) = envelope::split(&item.from);
    if !sender_domain.is_empty() && local_domains.contains(&Domain::new(sender_domain.as_str())) {
        return sender_domain;
    }

    for rcpt in &item.rcpt {
        let (_, domain) = envelope::split(&rcpt.original);
        if !domain.is_empty() && local_domains.contains(&Domain::new(domain.as_str())) {
            return domain;
        }
    }

    "localhost".to_string()
}

fn render(item: &QueueItem, unsent: &[&QueuedRecipient], config: &DsnConfig, from_domain: &str) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "From: Mail Delivery System <postmaster@{from_domain}>");
    let _ = writeln!(out, "To: {}", item.from);
    let _ = writeln!(out, "Subject: Undelivered Mail Returned to Sender");
    let _ = writeln!(out, "MIME-Version: 1.0");
    let _ = writeln!(
        out,
        "Content-Type: multipart/report; report-type=\"delivery-status\"; boundary=\"{BOUNDARY}\""
    );
    out.push_str("\r\n");

    let _ = writeln!(out, "--{BOUNDARY}");
    let _ = writeln!(out, "Content-Type: text/plain; charset=utf-8");
    out.push_str("\r\n");
    out.push_str("This is an automatically generated delivery status notification.\r\n\r\n");
    out.push_str("Delivery failed for the following recipient(s):\r\n\r\n");
    for rcpt in unsent {
        let reason = rcpt.last_failure_message.as_deref().unwrap_or("no further detail available");
        let _ = writeln!(out, "  {}: {reason}", rcpt.target);
    }
    out.push_str("\r\n");

    let _ = writeln!(out, "--{BOUNDARY}");
    let _ = writeln!(out, "Content-Type: message/delivery-status");
    out.push_str("\r\n");
    let _ = writeln!(out, "Reporting-MTA: dns; {}", config.reporting_mta);
    out.push_str("\r\n");
    for rcpt in unsent {
        let _ = writeln!(out, "Final-Recipient: rfc822; {}", rcpt.target);
        let _ = writeln!(out, "Action: failed");
        let _ = writeln!(out, "Status: 5.0.0");
        if let Some(reason) = &rcpt.last_failure_message {
            let _ = writeln!(out, "Diagnostic-Code: smtp; {reason}");
        }
        out.push_str("\r\n");
    }

    let _ = writeln!(out, "--{BOUNDARY}");
    let _ = writeln!(out, "Content-Type: text/rfc822-headers");
    out.push_str("\r\n");
    out.push_str(original_headers(item));
    out.push_str("\r\n");

    let _ = writeln!(out, "--{BOUNDARY}--");

    out
}

/// The header block of the original message: everything up to the
/// first blank line.
fn original_headers(item: &QueueItem) -> &str {
    let text = std::str::from_utf8(&item.data).unwrap_or_default();
    text.split("\r\n\r\n")
        .next()
        .or_else(|| text.split("\n\n").next())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item_with(from: &str, rcpt_status: RecipientStatus) -> QueueItem {
        let mut recipient = QueuedRecipient::new(RecipientKind::Email, "bob@ex", "bob@ex");
        recipient.status = rcpt_status;
        recipient.last_failure_message = Some("550 no such user".to_string());
        QueueItem::new(
            from,
            vec!["bob@ex".to_string()],
            vec![recipient],
            b"Subject: hi\r\n\r\nbody".to_vec(),
        )
    }

    #[test]
    fn no_dsn_for_null_sender() {
        let item = item_with("<>", RecipientStatus::Failed);
        let locals = HashSet::new();
        assert!(build(&item, &locals, &DsnConfig::default()).is_none());
    }

    #[test]
    fn no_dsn_when_everything_sent() {
        let item = item_with("s@ex", RecipientStatus::Sent);
        let locals = HashSet::new();
        assert!(build(&item, &locals, &DsnConfig::default()).is_none());
    }

    #[test]
    fn dsn_built_for_failed_recipient() {
        let item = item_with("s@ex", RecipientStatus::Failed);
        let mut locals = HashSet::new();
        locals.insert(Domain::new("ex"));

        let dsn = build(&item, &locals, &DsnConfig::default()).unwrap();
        assert_eq!(dsn.from, "<>");
        assert_eq!(dsn.rcpt.len(), 1);
        assert_eq!(dsn.rcpt[0].target, "s@ex");

        let body = String::from_utf8(dsn.data).unwrap();
        assert!(body.contains("bob@ex"));
        assert!(body.contains("550 no such user"));
        assert!(body.contains("multipart/report"));
    }

    #[test]
    fn picks_recipient_domain_when_sender_domain_not_local() {
        let item = item_with("s@other", RecipientStatus::Failed);
        let mut locals = HashSet::new();
        locals.insert(Domain::new("ex"));

        let dsn = build(&item, &locals, &DsnConfig::default()).unwrap();
        let body = String::from_utf8(dsn.data).unwrap();
        assert!(body.contains("postmaster@ex"));
    }
}
