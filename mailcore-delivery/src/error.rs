//! Error taxonomy for delivery attempts.
//!
//! The split is by retry disposition, not by origin: a [`PermanentError`]
//! means "don't try this recipient again", a [`TemporaryError`] means
//! "the next scheduled attempt may succeed", and a [`SystemError`] means
//! something on this side is broken (spool I/O, bad configuration).

use thiserror::Error;

use crate::dns::DnsError;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("permanent failure: {0}")]
    Permanent(#[from] PermanentError),

    #[error("temporary failure: {0}")]
    Temporary(#[from] TemporaryError),

    #[error("system error: {0}")]
    System(#[from] SystemError),
}

/// Failures that should move a recipient straight to FAILED.
#[derive(Debug, Error)]
pub enum PermanentError {
    #[error("invalid recipient: {0}")]
    InvalidRecipient(String),

    #[error("domain not found: {0}")]
    DomainNotFound(String),

    #[error("message rejected: {0}")]
    MessageRejected(String),

    #[error("no mail servers for domain: {0}")]
    NoMailServers(String),

    #[error("policy refused delivery: {0}")]
    PolicyRefused(String),
}

/// Failures that leave a recipient PENDING for the next retry.
#[derive(Debug, Error)]
pub enum TemporaryError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("dns lookup failed: {0}")]
    DnsLookupFailed(String),

    #[error("connection timed out: {0}")]
    Timeout(String),

    #[error("temporary smtp error: {0}")]
    SmtpTemporary(String),

    #[error("tls handshake failed: {0}")]
    TlsHandshakeFailed(String),

    #[error("security level downgrade refused: {0}")]
    DowngradeRefused(String),

    #[error("mta-sts fetch failed: {0}")]
    StsFetchFailed(String),
}

/// Problems on our own side, not the remote peer's.
#[derive(Debug, Error)]
pub enum SystemError {
    #[error("spool read error: {0}")]
    SpoolRead(String),

    #[error("spool write error: {0}")]
    SpoolWrite(String),

    #[error("queue is full")]
    QueueFull,

    #[error("alias recursion limit exceeded: {0}")]
    AliasRecursion(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl DeliveryError {
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        matches!(self, Self::Temporary(_))
    }

    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }

    #[must_use]
    pub const fn is_system(&self) -> bool {
        matches!(self, Self::System(_))
    }
}

impl From<DnsError> for DeliveryError {
    fn from(error: DnsError) -> Self {
        match error {
            DnsError::NoMailServers(domain) => {
                Self::Permanent(PermanentError::NoMailServers(domain))
            }
            DnsError::NullMx(domain) => Self::Permanent(PermanentError::NoMailServers(domain)),
            DnsError::DomainNotFound(domain) => {
                Self::Permanent(PermanentError::DomainNotFound(domain))
            }
            DnsError::Timeout(msg) => Self::Temporary(TemporaryError::Timeout(msg)),
            DnsError::LookupFailed(err) => {
                Self::Temporary(TemporaryError::DnsLookupFailed(err.to_string()))
            }
        }
    }
}

impl From<mailcore_smtp::client::ClientError> for DeliveryError {
    fn from(error: mailcore_smtp::client::ClientError) -> Self {
        use mailcore_smtp::client::ClientError;

        match error {
            ClientError::SmtpError { code, message } if (400..500).contains(&code) => {
                Self::Temporary(TemporaryError::SmtpTemporary(format!("{code} {message}")))
            }
            ClientError::SmtpError { code, message } if (500..600).contains(&code) => {
                Self::Permanent(PermanentError::MessageRejected(format!("{code} {message}")))
            }
            ClientError::SmtpError { code, message }
            | ClientError::UnexpectedResponse { code, message } => Self::System(
                SystemError::Internal(format!("unexpected smtp response: {code} {message}")),
            ),
            ClientError::Io(e) => {
                Self::Temporary(TemporaryError::ConnectionFailed(format!("i/o error: {e}")))
            }
            ClientError::ConnectionClosed => Self::Temporary(TemporaryError::ConnectionFailed(
                "connection closed unexpectedly".to_string(),
            )),
            ClientError::TlsError(msg) => Self::Temporary(TemporaryError::TlsHandshakeFailed(msg)),
            ClientError::ParseError(msg) => Self::System(SystemError::Internal(format!(
                "smtp protocol parse error: {msg}"
            ))),
            ClientError::BuilderError(msg) => Self::System(SystemError::Configuration(format!(
                "smtp client config error: {msg}"
            ))),
            ClientError::Utf8Error(e) => {
                Self::System(SystemError::Internal(format!("utf-8 decoding error: {e}")))
            }
        }
    }
}

impl From<mailcore_spool::SpoolError> for DeliveryError {
    fn from(error: mailcore_spool::SpoolError) -> Self {
        Self::System(SystemError::SpoolWrite(error.to_string()))
    }
}

impl From<mailcore_common::NormalizeError> for DeliveryError {
    fn from(error: mailcore_common::NormalizeError) -> Self {
        Self::Permanent(PermanentError::InvalidRecipient(error.to_string()))
    }
}

impl From<mailcore_aliases::AliasError> for DeliveryError {
    fn from(error: mailcore_aliases::AliasError) -> Self {
        match error {
            mailcore_aliases::AliasError::RecursionLimitExceeded(addr) => {
                Self::System(SystemError::AliasRecursion(addr))
            }
            other => Self::System(SystemError::Internal(other.to_string())),
        }
    }
}
