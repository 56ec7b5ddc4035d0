//! Durable map of conflicting versions per entity.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::error;

use ledgersync_common::{EntityId, Error, Result};
use ledgersync_storage::StateStore;

use crate::model::ConflictInfo;

/// Conflicts recorded for one entity, as surfaced to the application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingConflict {
    pub entity_id: EntityId,
    pub conflicts: Vec<ConflictInfo>,
}

/// Conflict map: `entity_id -> [ConflictInfo]`.
///
/// A list only grows until a merge for its entity commits, at which point
/// it is cleared.
pub struct ConflictLedger {
    store: Arc<dyn StateStore>,
    key: String,
    entries: BTreeMap<EntityId, Vec<ConflictInfo>>,
}

impl ConflictLedger {
    /// Load the conflict map persisted under `key`, or start empty.
    pub async fn load(store: Arc<dyn StateStore>, key: impl Into<String>) -> Result<Self> {
        let key = key.into();
        let entries = match store.get(&key).await? {
            Some(json) => serde_json::from_str(&json).map_err(|e| {
                Error::Serialization(format!("Corrupt conflict map '{}': {}", key, e))
            })?,
            None => BTreeMap::new(),
        };

        Ok(Self {
            store,
            key,
            entries,
        })
    }

    /// Add a version to an entity's list.
    ///
    /// Returns `false` without writing if a version with the same change id
    /// is already recorded.
    pub async fn record(&mut self, entity_id: &EntityId, info: ConflictInfo) -> Result<bool> {
        let known = self
            .entries
            .get(entity_id)
            .map(|list| list.iter().any(|c| c.change_id == info.change_id))
            .unwrap_or(false);
        if known {
            return Ok(false);
        }

        let mut next = self.entries.clone();
        next.entry(entity_id.clone()).or_default().push(info);
        self.persist(next).await?;
        Ok(true)
    }

    /// Versions recorded for an entity, oldest first.
    pub fn versions(&self, entity_id: &EntityId) -> &[ConflictInfo] {
        self.entries
            .get(entity_id)
            .map(|list| list.as_slice())
            .unwrap_or(&[])
    }

    /// Forget an entity's conflicts. A no-op when none are recorded.
    pub async fn clear(&mut self, entity_id: &EntityId) -> Result<()> {
        if !self.entries.contains_key(entity_id) {
            return Ok(());
        }
        let mut next = self.entries.clone();
        next.remove(entity_id);
        self.persist(next).await
    }

    /// Entities with at least one recorded conflict, ordered by entity id.
    pub fn pending(&self) -> Vec<PendingConflict> {
        self.entries
            .iter()
            .filter(|(_, list)| !list.is_empty())
            .map(|(entity_id, list)| PendingConflict {
                entity_id: entity_id.clone(),
                conflicts: list.clone(),
            })
            .collect()
    }

    /// Number of entities with pending conflicts.
    pub fn entity_count(&self) -> usize {
        self.entries.values().filter(|list| !list.is_empty()).count()
    }

    async fn persist(&mut self, next: BTreeMap<EntityId, Vec<ConflictInfo>>) -> Result<()> {
        let json = serde_json::to_string(&next)?;
        if let Err(e) = self.store.set(&self.key, &json).await {
            error!("Failed to persist conflict map '{}': {}", self.key, e);
            return Err(e);
        }
        self.entries = next;
        Ok(())
    }
}
