//! Server directory and change tracker.
//!
//! [`ServerDirectory`] is the eventually-consistent local mirror of the
//! coordinator's authoritative server list. [`ChangeTracker`] gives each
//! subscriber (the backup selector, the failure detector) its own ordered
//! view of directory mutations plus a dense per-entry annotation slot,
//! following the dense-index-plus-generation discipline described in the
//! teacher's design notes rather than an id→index hashmap.

mod directory;
mod tracker;

pub use directory::ServerDirectory;
pub use tracker::{ChangeEvent, ChangeTracker};

use thiserror::Error;

/// Errors raised by directory and tracker lookups.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The given id does not currently occupy any known slot (either it
    /// was never seen, or its generation no longer matches).
    #[error("unknown server: {0}")]
    UnknownServer(embervault_types::ServerId),
}

/// Result type for directory and tracker operations.
pub type Result<T> = std::result::Result<T, Error>;
