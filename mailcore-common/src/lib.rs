//! Shared envelope, address, and domain types for the mailcore workspace.
//!
//! This crate implements the envelope utilities component: splitting and
//! normalizing addresses, testing domain membership, and folding message
//! headers. Everything here is pure and synchronous; it has no knowledge
//! of the queue, couriers, or the wire protocol.

pub mod domain;
pub mod envelope;
pub mod error;
pub mod normalize;

pub use domain::Domain;
pub use error::NormalizeError;
pub use tracing;
