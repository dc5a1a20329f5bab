//! Error types for envelope/address normalization.

use thiserror::Error;

/// Errors that can occur while normalizing an envelope address.
#[derive(Debug, Error)]
pub enum NormalizeError {
    /// The domain could not be converted to IDNA A-labels / Unicode.
    #[error("invalid domain {0:?}: {1}")]
    InvalidDomain(String, String),
}

pub type Result<T> = std::result::Result<T, NormalizeError>;
