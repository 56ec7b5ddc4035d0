//! Conflict detection between a queued change and the remote entity.

use crate::gateway::RemoteState;
use crate::model::{ChangeType, ConflictInfo, ConflictType, OfflineChange};

/// Compares queued changes against remote metadata.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConflictDetector;

impl ConflictDetector {
    pub fn new() -> Self {
        Self
    }

    /// Detect whether `change` diverges from the remote entity.
    ///
    /// No conflict when the remote entity does not exist or was last
    /// modified at or before the change's timestamp.
    pub fn detect(&self, change: &OfflineChange, remote: &RemoteState) -> Option<ConflictInfo> {
        if !remote.exists || remote.last_modified <= change.timestamp {
            return None;
        }
        Some(ConflictInfo::from_change(change, self.classify(change, remote)))
    }

    /// Classify a divergence.
    ///
    /// A create collides with a remote create when the remote record was
    /// created at or after the local one (or its creation time is unknown);
    /// it collides with a remote update when the record predates it.
    pub fn classify(&self, change: &OfflineChange, remote: &RemoteState) -> ConflictType {
        match change.change_type {
            ChangeType::Create => match remote.created_at {
                Some(created_at) if created_at < change.timestamp => ConflictType::CreateUpdate,
                _ => ConflictType::CreateCreate,
            },
            ChangeType::Update => ConflictType::UpdateUpdate,
            ChangeType::Delete => ConflictType::DeleteUpdate,
        }
    }
}
