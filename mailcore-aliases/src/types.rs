//! The `Recipient` data model (§3): a tagged record produced by alias
//! expansion.

use serde::{Deserialize, Serialize};

/// Which courier a [`Recipient`] must be dispatched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecipientKind {
    /// Deliver via local MDA (C5) or remote SMTP (C6), depending on
    /// whether `address`'s domain is local.
    Email,
    /// Feed the message to an external command's stdin.
    Pipe,
    /// Deliver via remote SMTP (C6) against an explicit host list,
    /// bypassing MX lookup and STS.
    Forward,
}

/// A single concrete delivery target produced by resolving one envelope
/// recipient through the alias table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipient {
    pub kind: RecipientKind,
    /// The delivery address (EMAIL/FORWARD) or command line (PIPE).
    pub target: String,
    /// Explicit relay hosts to try in order (FORWARD only).
    pub via: Option<Vec<String>>,
    /// The address this recipient was ultimately expanded from, before
    /// any alias substitution. Used to compute the SRS rewrite (§4.6).
    pub original: String,
}

impl Recipient {
    #[must_use]
    pub fn email(address: impl Into<String>, original: impl Into<String>) -> Self {
        Self {
            kind: RecipientKind::Email,
            target: address.into(),
            via: None,
            original: original.into(),
        }
    }

    #[must_use]
    pub fn pipe(command: impl Into<String>, original: impl Into<String>) -> Self {
        Self {
            kind: RecipientKind::Pipe,
            target: command.into(),
            via: None,
            original: original.into(),
        }
    }

    #[must_use]
    pub fn forward(
        address: impl Into<String>,
        via: Vec<String>,
        original: impl Into<String>,
    ) -> Self {
        Self {
            kind: RecipientKind::Forward,
            target: address.into(),
            via: Some(via),
            original: original.into(),
        }
    }

    #[must_use]
    pub const fn is_email(&self) -> bool {
        matches!(self.kind, RecipientKind::Email)
    }
}
