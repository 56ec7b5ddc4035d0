//! Coordinator configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use ledgersync_common::{Error, Result, UserId};

use crate::merge::MergePolicy;
use crate::model::EntityType;
use crate::retry::Backoff;

/// What to do when a queued change no longer matches its checksum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecksumPolicy {
    /// Refuse to send the change and report an integrity error.
    #[default]
    Enforce,
    /// Log a warning and send it anyway.
    Advisory,
}

/// Configuration for a sync coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Retries for transient gateway failures.
    pub max_retries: u32,
    /// First backoff delay for gateway retries, in milliseconds.
    pub retry_initial_delay_ms: u64,
    pub checksum_policy: ChecksumPolicy,
    /// How long resolved changes are kept before pruning, in seconds.
    pub resolved_retention_secs: u64,
    /// Prefix for every key written to the state store.
    pub storage_namespace: String,
    /// Per-entity-type replacements for the default merge policies.
    pub merge_overrides: HashMap<EntityType, MergePolicy>,
    /// Run a pass on this interval while online, in addition to reconnects.
    pub periodic_interval_secs: Option<u64>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_initial_delay_ms: 200,
            checksum_policy: ChecksumPolicy::Enforce,
            resolved_retention_secs: 7 * 24 * 60 * 60,
            storage_namespace: "ledgersync".to_string(),
            merge_overrides: HashMap::new(),
            periodic_interval_secs: None,
        }
    }
}

impl SyncConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::InvalidInput(format!("Invalid sync config: {}", e)))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Read a JSON config file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = tokio::fs::read_to_string(path.as_ref()).await?;
        Self::from_json(&json)
    }

    /// Backoff for gateway calls.
    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.max_retries)
            .with_initial_delay(Duration::from_millis(self.retry_initial_delay_ms))
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.resolved_retention_secs)
    }

    pub fn periodic_interval(&self) -> Option<Duration> {
        self.periodic_interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    /// Store key of a user's change queue.
    pub fn queue_key(&self, user_id: &UserId) -> String {
        format!("{}:{}:changes", self.storage_namespace, user_id)
    }

    /// Store key of a user's conflict map.
    pub fn conflicts_key(&self, user_id: &UserId) -> String {
        format!("{}:{}:conflicts", self.storage_namespace, user_id)
    }
}
