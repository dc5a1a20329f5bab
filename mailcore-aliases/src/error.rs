//! Error types for alias loading and resolution.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AliasError {
    #[error("I/O error reading alias file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("alias recursion limit exceeded resolving {0:?}")]
    RecursionLimitExceeded(String),

    #[error("resolve hook failed: {0}")]
    HookFailed(String),

    #[error("resolve hook timed out")]
    HookTimeout,

    /// The configured hook path doesn't exist. Never surfaced to a
    /// caller — treated as "no hook configured" at the call site.
    #[error("resolve hook not found")]
    HookMissing,
}

pub type Result<T> = std::result::Result<T, AliasError>;
