//! Crash-safe on-disk stores: queue items (§6), the domaininfo security
//! level record (C3), and the MTA-STS policy cache (C4).
//!
//! Everything here is storage plus the small amount of logic that's
//! really about *when a stored record is still valid* (domaininfo's
//! downgrade check, the STS cache's expiration check). Alias semantics
//! and the send loop live in other crates; this one doesn't know what
//! a retry schedule is.

#![deny(clippy::pedantic, clippy::all, clippy::nursery)]
#![allow(clippy::must_use_candidate)]

pub mod domaininfo;
pub mod error;
pub mod item;
pub mod mta_sts;
pub mod store;

pub use domaininfo::{DomaininfoStore, SecurityLevel};
pub use error::{Result, SerializationError, SpoolError, ValidationError};
pub use item::{QueueItem, QueueItemId, QueuedRecipient, RecipientKind, RecipientStatus};
pub use mta_sts::{CacheLookup, StsCache, StsMode, StsPolicy};
pub use store::{FileItemStore, ItemStore};
