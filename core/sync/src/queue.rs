//! Durable, append-only queue of pending local changes.

use std::sync::Arc;
use tracing::{debug, error};
use uuid::Uuid;

use ledgersync_common::{ChangeId, ClientId, Error, Result, Timestamp, UserId};
use ledgersync_storage::StateStore;

use crate::checksum;
use crate::clock::LogicalClock;
use crate::model::{ConflictInfo, NewChange, OfflineChange};

/// Queue of local mutations awaiting reconciliation.
///
/// The in-memory order is the enqueue order. Every mutation is persisted
/// before it becomes visible in memory, so a failed write leaves the queue
/// exactly as it was.
pub struct ChangeQueue {
    store: Arc<dyn StateStore>,
    key: String,
    user_id: UserId,
    client_id: ClientId,
    clock: Arc<LogicalClock>,
    changes: Vec<OfflineChange>,
}

impl ChangeQueue {
    /// Load the queue persisted under `key`, or start empty.
    ///
    /// # Errors
    /// - Storage read failure
    /// - A persisted queue that cannot be parsed (never silently dropped)
    pub async fn load(
        store: Arc<dyn StateStore>,
        key: impl Into<String>,
        user_id: UserId,
        client_id: ClientId,
        clock: Arc<LogicalClock>,
    ) -> Result<Self> {
        let key = key.into();
        let changes = read_changes(store.as_ref(), &key).await?;
        debug!("Loaded {} queued changes from '{}'", changes.len(), key);

        Ok(Self {
            store,
            key,
            user_id,
            client_id,
            clock,
            changes,
        })
    }

    /// Append a change.
    ///
    /// Assigns id, timestamp and checksum, then persists the whole queue.
    /// Returns only once the change is durably stored.
    ///
    /// # Errors
    /// - Checksum/serialization failure
    /// - Storage write failure; the change is not queued
    pub async fn enqueue(&mut self, change: NewChange) -> Result<ChangeId> {
        let change = self.prepare(change)?;
        let id = change.id.clone();
        self.commit_with(|changes| {
            changes.push(change);
            Ok(())
        })
        .await?;

        debug!("Queued change {}", id);
        Ok(id)
    }

    /// Append a change and mark every earlier unresolved change for the
    /// same entity as resolved, in a single write.
    ///
    /// Returns the new change id and the number of superseded changes.
    pub async fn supersede(
        &mut self,
        change: NewChange,
        at: Timestamp,
    ) -> Result<(ChangeId, usize)> {
        let change = self.prepare(change)?;
        let id = change.id.clone();
        let superseded = self
            .commit_with(|changes| {
                let mut count = 0;
                for existing in changes
                    .iter_mut()
                    .filter(|c| !c.resolved && c.entity_id == change.entity_id)
                {
                    existing.conflicts.clear();
                    existing.resolved = true;
                    existing.resolved_at = Some(at);
                    count += 1;
                }
                changes.push(change);
                Ok(count)
            })
            .await?;

        Ok((id, superseded))
    }

    /// Unresolved changes in enqueue order.
    pub fn drain(&self) -> Vec<OfflineChange> {
        self.changes.iter().filter(|c| !c.resolved).cloned().collect()
    }

    /// Re-read the durable queue.
    ///
    /// # Errors
    /// - Storage read failure; the in-memory queue is left unchanged
    pub async fn refresh(&mut self) -> Result<()> {
        self.changes = read_changes(self.store.as_ref(), &self.key).await?;
        Ok(())
    }

    /// Get a change by id.
    pub fn get(&self, id: &ChangeId) -> Option<&OfflineChange> {
        self.changes.iter().find(|c| &c.id == id)
    }

    /// Mark a change resolved. Its conflict list is cleared in the same write.
    ///
    /// Marking an already-resolved change is a no-op.
    pub async fn mark_resolved(&mut self, id: &ChangeId, at: Timestamp) -> Result<()> {
        if self.get(id).map(|c| c.resolved).unwrap_or(false) {
            return Ok(());
        }
        self.commit_with(|changes| {
            let change = find_mut(changes, id)?;
            change.conflicts.clear();
            change.resolved = true;
            change.resolved_at = Some(at);
            Ok(())
        })
        .await
    }

    /// Replace the conflict list of an unresolved change.
    ///
    /// # Errors
    /// - Change not found
    /// - Change already resolved (resolved changes are immutable)
    pub async fn set_conflicts(&mut self, id: &ChangeId, conflicts: Vec<ConflictInfo>) -> Result<()> {
        self.commit_with(|changes| {
            let change = find_mut(changes, id)?;
            if change.resolved {
                return Err(Error::InvalidInput(format!(
                    "Change {} is resolved and cannot be modified",
                    id
                )));
            }
            change.conflicts = conflicts;
            Ok(())
        })
        .await
    }

    /// Drop resolved changes resolved before `before`.
    ///
    /// Returns the number of pruned changes.
    pub async fn prune_resolved(&mut self, before: Timestamp) -> Result<usize> {
        let prunable = self
            .changes
            .iter()
            .filter(|c| is_prunable(c, before))
            .count();
        if prunable == 0 {
            return Ok(0);
        }

        self.commit_with(|changes| {
            changes.retain(|c| !is_prunable(c, before));
            Ok(())
        })
        .await?;
        debug!("Pruned {} resolved changes", prunable);
        Ok(prunable)
    }

    /// All changes, resolved ones included, in enqueue order.
    pub fn all(&self) -> &[OfflineChange] {
        &self.changes
    }

    /// Count of `resolved=false` entries.
    pub fn unresolved_count(&self) -> usize {
        self.changes.iter().filter(|c| !c.resolved).count()
    }

    /// Highest timestamp held, resolved changes included.
    pub fn latest_timestamp(&self) -> Option<Timestamp> {
        self.changes.iter().map(|c| c.timestamp).max()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    fn prepare(&self, change: NewChange) -> Result<OfflineChange> {
        let checksum = checksum::compute(&change.data)?;
        let timestamp = self.clock.tick();
        let suffix = Uuid::new_v4().simple().to_string();
        let id = ChangeId::compose(&self.client_id, timestamp, &suffix[..8]);

        Ok(OfflineChange {
            id,
            change_type: change.change_type,
            entity_id: change.entity_id,
            data: change.data,
            timestamp,
            user_id: self.user_id.clone(),
            client_id: self.client_id.clone(),
            checksum,
            resolved: false,
            resolved_at: None,
            conflicts: Vec::new(),
        })
    }

    /// Apply `f` to a copy of the queue, persist the copy, then adopt it.
    async fn commit_with<T>(
        &mut self,
        f: impl FnOnce(&mut Vec<OfflineChange>) -> Result<T>,
    ) -> Result<T> {
        let mut next = self.changes.clone();
        let out = f(&mut next)?;

        let json = serde_json::to_string(&next)?;
        if let Err(e) = self.store.set(&self.key, &json).await {
            error!("Failed to persist change queue '{}': {}", self.key, e);
            return Err(e);
        }

        self.changes = next;
        Ok(out)
    }
}

fn is_prunable(change: &OfflineChange, before: Timestamp) -> bool {
    change.resolved && change.resolved_at.map(|at| at < before).unwrap_or(true)
}

fn find_mut<'a>(changes: &'a mut [OfflineChange], id: &ChangeId) -> Result<&'a mut OfflineChange> {
    changes
        .iter_mut()
        .find(|c| &c.id == id)
        .ok_or_else(|| Error::NotFound(format!("Queued change not found: {}", id)))
}

async fn read_changes(store: &dyn StateStore, key: &str) -> Result<Vec<OfflineChange>> {
    match store.get(key).await? {
        Some(json) => serde_json::from_str(&json).map_err(|e| {
            Error::Serialization(format!("Corrupt change queue '{}': {}", key, e))
        }),
        None => Ok(Vec::new()),
    }
}
