//! Local and remote couriers (C5/C6) and the queue engine that drives
//! them (C7): the send loop, the retry schedule, and bounce generation.
//!
//! This crate has no opinion on how a message arrives — that's the
//! acceptor's job. What's here starts at `Put`: given an envelope and a
//! message body already accepted onto disk, get it to every recipient,
//! retrying on the fixed schedule in [`queue::retry`] and bouncing
//! whatever's left once [`queue::QueueConfig::give_up_after`] elapses.

pub mod dns;
pub mod dsn;
pub mod error;
pub mod local;
pub mod queue;
pub mod remote;
pub mod srs;

pub use error::{DeliveryError, PermanentError, SystemError, TemporaryError};
pub use queue::{QueueConfig, QueueEngine};
