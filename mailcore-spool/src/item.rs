//! The queue item data model (§3): one in-flight message plus the
//! per-recipient delivery state the queue engine (C7) tracks for it.
//!
//! This crate stores items but has no opinion on alias semantics, so a
//! [`QueuedRecipient`] mirrors the shape of an alias-resolved recipient
//! rather than depending on `mailcore-aliases` directly.

use std::fmt;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Unique queue item identifier: a short URL-safe base64 encoding of 8
/// random bytes. Also doubles as the on-disk filename stem (§6):
/// the backing file is named `m:<id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueItemId(String);

const FILE_PREFIX: &str = "m:";

impl QueueItemId {
    /// Generates a new random identifier.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; 8];
        rand::rng().fill(&mut bytes);
        Self(URL_SAFE_NO_PAD.encode(bytes))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The on-disk filename for this item: `m:<id>`.
    #[must_use]
    pub fn filename(&self) -> String {
        format!("{FILE_PREFIX}{}", self.0)
    }

    /// Recovers an id from a filename produced by [`filename`](Self::filename).
    ///
    /// Rejects anything that isn't a bare `m:`-prefixed base64 stem, to
    /// prevent path traversal via a crafted filename during the crash
    /// recovery scan.
    #[must_use]
    pub fn from_filename(filename: &str) -> Option<Self> {
        let stem = filename.strip_prefix(FILE_PREFIX)?;
        if stem.is_empty() || stem.contains(['/', '\\']) || stem.contains("..") {
            return None;
        }
        URL_SAFE_NO_PAD.decode(stem).ok()?;
        Some(Self(stem.to_string()))
    }
}

impl fmt::Display for QueueItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which courier a recipient is ultimately dispatched to. Mirrors
/// `mailcore_aliases::RecipientKind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecipientKind {
    Email,
    Pipe,
    Forward,
}

/// Per-recipient delivery state tracked across retry attempts (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecipientStatus {
    Pending,
    Sent,
    Failed,
}

/// One recipient of a queue item, with its delivery progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedRecipient {
    pub kind: RecipientKind,
    /// The delivery address (EMAIL/FORWARD) or command line (PIPE).
    pub target: String,
    /// Explicit relay hosts to try in order (FORWARD only).
    pub via: Option<Vec<String>>,
    /// The address this recipient was originally addressed to, before
    /// alias expansion. Used to compute the SRS rewrite (§4.6).
    pub original: String,
    pub status: RecipientStatus,
    pub last_failure_message: Option<String>,
}

impl QueuedRecipient {
    #[must_use]
    pub fn new(kind: RecipientKind, target: impl Into<String>, original: impl Into<String>) -> Self {
        Self {
            kind,
            target: target.into(),
            via: None,
            original: original.into(),
            status: RecipientStatus::Pending,
            last_failure_message: None,
        }
    }

    #[must_use]
    pub const fn is_pending(&self) -> bool {
        matches!(self.status, RecipientStatus::Pending)
    }
}

/// A message awaiting delivery, plus the delivery state of each of its
/// recipients. This is exactly what a `m:<id>` file on disk holds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: QueueItemId,
    /// Envelope sender (the MAIL FROM reverse-path).
    pub from: String,
    /// The original envelope recipient list, before alias expansion.
    /// Kept for diagnostics; delivery itself only ever looks at `rcpt`.
    pub to: Vec<String>,
    pub rcpt: Vec<QueuedRecipient>,
    /// The raw message (headers + body), unmodified since acceptance.
    pub data: Vec<u8>,
    /// Unix timestamp (seconds) the item was first queued.
    pub created_at: u64,
}

impl QueueItem {
    #[must_use]
    pub fn new(
        from: impl Into<String>,
        to: Vec<String>,
        rcpt: Vec<QueuedRecipient>,
        data: Vec<u8>,
    ) -> Self {
        let created_at = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        Self {
            id: QueueItemId::generate(),
            from: from.into(),
            to,
            rcpt,
            data,
            created_at,
        }
    }

    /// Whether any recipient is still awaiting delivery.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.rcpt.iter().any(QueuedRecipient::is_pending)
    }

    /// Whether every recipient has reached a terminal state.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        !self.has_pending()
    }
}
