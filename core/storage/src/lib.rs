//! Durable key-value storage for ledgersync.
//!
//! The sync engine persists two records per session (the change queue and
//! the conflict map) through the [`StateStore`] trait. [`LocalStore`] keeps
//! one file per key on disk and [`MemoryStore`] serves tests.
//!
//! # Design Principles
//! - Port isolation: the sync engine never touches the filesystem directly
//! - Async operations: all I/O is async
//! - Whole-record writes: a `set` either replaces the value or fails

pub mod local;
pub mod memory;
pub mod provider;

pub use local::LocalStore;
pub use memory::MemoryStore;
pub use provider::StateStore;
