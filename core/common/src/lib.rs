//! Common utilities and types shared across ledgersync crates.
//!
//! This module provides the error taxonomy and the identifier types used by
//! the storage layer, the sync engine and the CLI.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{ChangeId, ClientId, EntityId, Timestamp, UserId};
