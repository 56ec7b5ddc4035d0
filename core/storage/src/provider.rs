//! Storage port trait definition.

use async_trait::async_trait;

use ledgersync_common::Result;

/// String-keyed durable blob store.
///
/// Values survive process restarts for durable backends. Implementations
/// must report a failed write as an error; callers rely on `set` returning
/// `Ok` only once the value is durably stored.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Get the backend name (e.g., "memory", "local").
    fn name(&self) -> &str;

    /// Read the value stored under `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Replace the value stored under `key`.
    ///
    /// # Postconditions
    /// - On `Ok`, a subsequent `get` returns `value`, also after a restart
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Remove `key`. Removing a missing key is not an error.
    async fn remove(&self, key: &str) -> Result<()>;
}
