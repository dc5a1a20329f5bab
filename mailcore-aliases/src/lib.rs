//! Alias file parsing and recursive alias expansion.
//!
//! This crate implements the alias-resolution component: mapping a
//! local envelope recipient to the concrete set of mailboxes, piped
//! commands, or forwarding targets it actually expands to, following
//! alias entries depth-first and stopping at a recursion cap.

pub mod error;
pub mod parse;
pub mod table;
pub mod types;

pub use error::AliasError;
pub use table::{AliasTable, AliasTableConfig, UserExists};
pub use types::{Recipient, RecipientKind};
