//! Sync coordinator: one instance per authenticated session.
//!
//! The coordinator owns the session's change queue and conflict ledger and
//! runs reconciliation passes against the remote authority. A pass walks
//! the unresolved changes in enqueue order; a failure on one change is
//! recorded and the pass moves on.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use ledgersync_common::{ChangeId, ClientId, EntityId, Error, Result, Timestamp, UserId};
use ledgersync_storage::StateStore;

use crate::checksum;
use crate::clock::{Clock, LogicalClock, SystemClock};
use crate::config::{ChecksumPolicy, SyncConfig};
use crate::conflict::ConflictDetector;
use crate::connectivity::ConnectivityPort;
use crate::gateway::{RemoteGateway, RemoteState};
use crate::ledger::{ConflictLedger, PendingConflict};
use crate::merge::{MergePolicy, MergeRegistry};
use crate::model::{
    remote_version_id, ChangeState, ChangeType, ConflictInfo, EntityPayload, EntityType,
    NewChange, OfflineChange,
};
use crate::queue::ChangeQueue;
use crate::retry::GatewayRetry;

/// Identity of the session a coordinator serves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub user_id: UserId,
    pub client_id: ClientId,
}

impl SessionInfo {
    pub fn new(user_id: UserId, client_id: ClientId) -> Self {
        Self { user_id, client_id }
    }
}

/// External collaborators of a coordinator.
#[derive(Clone)]
pub struct SyncPorts {
    pub store: Arc<dyn StateStore>,
    pub gateway: Arc<dyn RemoteGateway>,
    pub connectivity: Arc<dyn ConnectivityPort>,
    pub clock: Arc<dyn Clock>,
}

impl SyncPorts {
    /// Ports driven by the system wall clock.
    pub fn new(
        store: Arc<dyn StateStore>,
        gateway: Arc<dyn RemoteGateway>,
        connectivity: Arc<dyn ConnectivityPort>,
    ) -> Self {
        Self {
            store,
            gateway,
            connectivity,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Serialize)]
pub struct SyncResult {
    /// No errors and no conflicts.
    pub success: bool,
    /// Conflicts detected this pass, plus changes still awaiting a human.
    pub conflicts: usize,
    /// One entry per failed change, `"{change_id}: {error}"`.
    pub errors: Vec<String>,
    /// Changes marked resolved this pass.
    pub resolved: usize,
    pub duration: Duration,
}

impl SyncResult {
    fn failed(error: impl Into<String>, duration: Duration) -> Self {
        Self {
            success: false,
            conflicts: 0,
            errors: vec![error.into()],
            resolved: 0,
            duration,
        }
    }
}

/// Snapshot of a coordinator's backlog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    /// Unresolved changes.
    pub queued: usize,
    /// Entities with pending conflicts.
    pub conflicts: usize,
    pub online: bool,
}

/// What happened to one change during a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChangeOutcome {
    /// Written to the remote without divergence.
    Committed,
    /// Remote already reflects the change (deleting a missing entity).
    AlreadySatisfied,
    /// Diverged and was merged; the merge is now resolved.
    Merged,
    /// Diverged under a manual policy; left for a human.
    AwaitingManual,
}

struct SessionState {
    queue: ChangeQueue,
    ledger: ConflictLedger,
    /// `last_modified` of this session's most recent commit per entity.
    own_writes: HashMap<(EntityType, EntityId), Timestamp>,
}

/// Offline-first sync coordinator.
pub struct SyncCoordinator {
    session: SessionInfo,
    config: SyncConfig,
    gateway: Arc<dyn RemoteGateway>,
    connectivity: Arc<dyn ConnectivityPort>,
    clock: Arc<LogicalClock>,
    registry: MergeRegistry,
    detector: ConflictDetector,
    retry: GatewayRetry,
    state: Mutex<SessionState>,
    /// Held for the whole of a pass or a manual resolution.
    pass_guard: Mutex<()>,
}

impl SyncCoordinator {
    /// Open a coordinator over the session's persisted queue and conflicts.
    ///
    /// The logical clock is seeded above every timestamp already persisted,
    /// so changes enqueued after a restart still order after earlier ones.
    ///
    /// # Errors
    /// - Storage read failure
    /// - Corrupt persisted queue or conflict map
    pub async fn open(session: SessionInfo, ports: SyncPorts, config: SyncConfig) -> Result<Self> {
        let clock = Arc::new(LogicalClock::new(ports.clock.clone(), None));

        let queue = ChangeQueue::load(
            ports.store.clone(),
            config.queue_key(&session.user_id),
            session.user_id.clone(),
            session.client_id.clone(),
            clock.clone(),
        )
        .await?;
        let ledger =
            ConflictLedger::load(ports.store.clone(), config.conflicts_key(&session.user_id))
                .await?;

        if let Some(latest) = queue.latest_timestamp() {
            clock.observe(latest);
        }
        for pending in ledger.pending() {
            for info in &pending.conflicts {
                clock.observe(info.timestamp);
            }
        }

        info!(
            "Opened sync session for {} on {}: {} queued, {} conflicted entities",
            session.user_id,
            session.client_id,
            queue.unresolved_count(),
            ledger.entity_count()
        );

        Ok(Self {
            registry: MergeRegistry::with_overrides(&config.merge_overrides),
            retry: GatewayRetry::new(config.backoff()),
            detector: ConflictDetector::new(),
            session,
            config,
            gateway: ports.gateway,
            connectivity: ports.connectivity,
            clock,
            state: Mutex::new(SessionState {
                queue,
                ledger,
                own_writes: HashMap::new(),
            }),
            pass_guard: Mutex::new(()),
        })
    }

    pub fn session(&self) -> &SessionInfo {
        &self.session
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn connectivity(&self) -> Arc<dyn ConnectivityPort> {
        self.connectivity.clone()
    }

    pub fn merge_policy(&self, entity_type: EntityType) -> MergePolicy {
        self.registry.policy_for(entity_type)
    }

    /// Queue a local mutation. Returns once the change is durably stored.
    ///
    /// # Errors
    /// - Storage write failure; nothing is queued
    pub async fn queue_change(
        &self,
        change_type: ChangeType,
        entity_id: EntityId,
        data: EntityPayload,
    ) -> Result<ChangeId> {
        let mut state = self.state.lock().await;
        state
            .queue
            .enqueue(NewChange::new(change_type, entity_id, data))
            .await
    }

    /// Run one reconciliation pass.
    ///
    /// Never fails as a whole: per-change failures are collected in
    /// `errors`. Concurrent calls run one after the other.
    pub async fn sync_with_server(&self) -> SyncResult {
        let start = Instant::now();
        if !self.connectivity.is_online() {
            debug!("Skipping sync pass: offline");
            return SyncResult::failed("no connectivity", start.elapsed());
        }

        let _pass = self.pass_guard.lock().await;

        let pending = {
            let mut state = self.state.lock().await;
            if let Err(e) = state.queue.refresh().await {
                error!("Failed to read change queue: {}", e);
                return SyncResult::failed(format!("queue refresh failed: {}", e), start.elapsed());
            }
            state.queue.drain()
        };

        info!("Starting sync pass over {} queued changes", pending.len());

        let mut resolved = 0;
        let mut conflicts = 0;
        let mut errors = Vec::new();
        let mut blocked: HashSet<EntityId> = HashSet::new();

        for change in pending {
            if blocked.contains(&change.entity_id) {
                debug!(
                    "Deferring {}: earlier change for {} is unresolved",
                    change.id, change.entity_id
                );
                continue;
            }

            let policy = self.registry.policy_for(change.entity_type());
            if policy.is_manual() && change.state() == ChangeState::Conflicted {
                debug!("Change {} is awaiting manual resolution", change.id);
                conflicts += 1;
                blocked.insert(change.entity_id.clone());
                continue;
            }

            match self.reconcile(&change, policy).await {
                Ok(ChangeOutcome::Committed) | Ok(ChangeOutcome::AlreadySatisfied) => {
                    resolved += 1;
                }
                Ok(ChangeOutcome::Merged) => {
                    conflicts += 1;
                    resolved += 1;
                }
                Ok(ChangeOutcome::AwaitingManual) => {
                    conflicts += 1;
                    blocked.insert(change.entity_id.clone());
                }
                Err(e) => {
                    warn!("Failed to sync change {}: {}", change.id, e);
                    errors.push(format!("{}: {}", change.id, e));
                    blocked.insert(change.entity_id.clone());
                }
            }
        }

        if let Err(e) = self.prune_resolved().await {
            warn!("Failed to prune resolved changes: {}", e);
        }

        let duration = start.elapsed();
        info!(
            "Sync pass completed in {:?}: {} resolved, {} conflicts, {} errors",
            duration,
            resolved,
            conflicts,
            errors.len()
        );

        SyncResult {
            success: errors.is_empty() && conflicts == 0,
            conflicts,
            errors,
            resolved,
            duration,
        }
    }

    /// Backlog counts and connectivity.
    pub async fn get_sync_status(&self) -> SyncStatus {
        let state = self.state.lock().await;
        SyncStatus {
            queued: state.queue.unresolved_count(),
            conflicts: state.ledger.entity_count(),
            online: self.connectivity.is_online(),
        }
    }

    /// Entities with recorded conflicts and their competing versions.
    pub async fn get_pending_conflicts(&self) -> Vec<PendingConflict> {
        self.state.lock().await.ledger.pending()
    }

    /// Queued changes in enqueue order.
    pub async fn changes(&self, include_resolved: bool) -> Vec<OfflineChange> {
        let state = self.state.lock().await;
        if include_resolved {
            state.queue.all().to_vec()
        } else {
            state.queue.drain()
        }
    }

    /// Submit a human-chosen version for an entity with pending conflicts.
    ///
    /// Every unresolved change for the entity is superseded and the
    /// entity's conflicts are cleared. The chosen version is queued as an
    /// update stamped after every version in the conflict, so the next
    /// pass commits it unless the remote moves again.
    ///
    /// # Errors
    /// - `NotFound` if the entity has no pending conflicts
    /// - `InvalidInput` if `chosen` is for a different entity type
    /// - Storage write failure
    pub async fn resolve_conflict(&self, entity_id: &EntityId, chosen: EntityPayload) -> Result<ChangeId> {
        let _pass = self.pass_guard.lock().await;
        let mut state = self.state.lock().await;

        let versions = state.ledger.versions(entity_id);
        let Some(first) = versions.first() else {
            return Err(Error::NotFound(format!("No pending conflicts for {}", entity_id)));
        };
        let expected = first.data.entity_type();
        if chosen.entity_type() != expected {
            return Err(Error::InvalidInput(format!(
                "{} is a {}, not a {}",
                entity_id,
                expected,
                chosen.entity_type()
            )));
        }
        for info in versions {
            self.clock.observe(info.timestamp);
        }

        let (id, superseded) = state
            .queue
            .supersede(
                NewChange::new(ChangeType::Update, entity_id.clone(), chosen),
                self.clock.wall_now(),
            )
            .await?;
        state.ledger.clear(entity_id).await?;

        info!(
            "Resolved conflict for {} manually: queued {}, superseded {}",
            entity_id, id, superseded
        );
        Ok(id)
    }

    /// Drop resolved changes older than the retention window.
    pub async fn prune_resolved(&self) -> Result<usize> {
        let retention_ms = i64::try_from(self.config.retention().as_millis()).unwrap_or(i64::MAX);
        let before = self.clock.wall_now().saturating_sub(retention_ms);
        self.state.lock().await.queue.prune_resolved(before).await
    }

    async fn reconcile(&self, change: &OfflineChange, policy: MergePolicy) -> Result<ChangeOutcome> {
        if let Err(e) = checksum::verify(change) {
            match self.config.checksum_policy {
                ChecksumPolicy::Enforce => return Err(e),
                ChecksumPolicy::Advisory => warn!("Sending {} despite: {}", change.id, e),
            }
        }

        let entity_type = change.entity_type();
        let remote = self.fetch_remote(entity_type, &change.entity_id).await?;

        if !remote.exists {
            if change.change_type == ChangeType::Delete {
                debug!("{} {} already absent remotely", entity_type, change.entity_id);
                self.finish(change, None).await?;
                return Ok(ChangeOutcome::AlreadySatisfied);
            }
            let committed = self.create_remote(entity_type, &change.entity_id, &change.data).await?;
            self.finish(change, Some(committed)).await?;
            return Ok(ChangeOutcome::Committed);
        }

        let conflict = if self.is_own_write(entity_type, &change.entity_id, &remote).await {
            None
        } else {
            self.detector.detect(change, &remote)
        };

        let Some(info) = conflict else {
            let committed = self
                .commit(change.change_type, entity_type, &change.entity_id, &change.data)
                .await?;
            self.finish(change, Some(committed)).await?;
            return Ok(ChangeOutcome::Committed);
        };

        debug!(
            "Conflict on {} {}: {:?}",
            entity_type, change.entity_id, info.conflict_type
        );
        let versions = self.record_conflict(change, &remote, info).await?;

        let candidates: Vec<OfflineChange> = versions.iter().map(|v| v.to_version(change)).collect();
        let merged = policy.resolve(&candidates)?;
        if policy.is_manual() {
            info!("{} {} awaits manual resolution", entity_type, change.entity_id);
            return Ok(ChangeOutcome::AwaitingManual);
        }

        let remote_id = remote_version_id(&change.entity_id, remote.last_modified);
        let remote_unchanged =
            merged.id == remote_id && remote.payload.as_ref() == Some(&merged.data);
        if remote_unchanged {
            debug!("Remote version of {} wins, nothing to write", change.entity_id);
            self.finish(change, None).await?;
        } else {
            let committed = self
                .commit(merged.change_type, entity_type, &change.entity_id, &merged.data)
                .await?;
            self.finish(change, Some(committed)).await?;
        }
        Ok(ChangeOutcome::Merged)
    }

    /// Record the local version (and the remote one, when known) and return
    /// every version now on file for the entity.
    async fn record_conflict(
        &self,
        change: &OfflineChange,
        remote: &RemoteState,
        info: ConflictInfo,
    ) -> Result<Vec<ConflictInfo>> {
        let mut state = self.state.lock().await;
        let conflict_type = info.conflict_type;
        state.ledger.record(&change.entity_id, info).await?;
        if let Some(payload) = &remote.payload {
            let remote_info = ConflictInfo::from_remote(
                &change.entity_id,
                remote.last_modified,
                payload.clone(),
                conflict_type,
            );
            state.ledger.record(&change.entity_id, remote_info).await?;
        }

        let versions = state.ledger.versions(&change.entity_id).to_vec();
        state.queue.set_conflicts(&change.id, versions.clone()).await?;
        Ok(versions)
    }

    async fn is_own_write(&self, entity_type: EntityType, entity_id: &EntityId, remote: &RemoteState) -> bool {
        let state = self.state.lock().await;
        state.own_writes.get(&(entity_type, entity_id.clone())) == Some(&remote.last_modified)
    }

    /// Mark a change resolved and clear its entity's conflicts.
    async fn finish(&self, change: &OfflineChange, committed_at: Option<Timestamp>) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(at) = committed_at {
            self.clock.observe(at);
            state
                .own_writes
                .insert((change.entity_type(), change.entity_id.clone()), at);
        }
        state.queue.mark_resolved(&change.id, self.clock.wall_now()).await?;
        state.ledger.clear(&change.entity_id).await?;
        debug!("Resolved change {}", change.id);
        Ok(())
    }

    async fn fetch_remote(&self, entity_type: EntityType, entity_id: &EntityId) -> Result<RemoteState> {
        let gateway = self.gateway.clone();
        let id = entity_id.clone();
        let remote = self
            .retry
            .run(move || {
                let gateway = gateway.clone();
                let id = id.clone();
                async move { gateway.get_entity_state(entity_type, &id).await }
            })
            .await?;

        if remote.exists {
            self.clock.observe(remote.last_modified);
        }
        Ok(remote)
    }

    async fn create_remote(
        &self,
        entity_type: EntityType,
        entity_id: &EntityId,
        payload: &EntityPayload,
    ) -> Result<Timestamp> {
        let gateway = self.gateway.clone();
        let id = entity_id.clone();
        let payload = payload.clone();
        self.retry
            .run(move || {
                let gateway = gateway.clone();
                let id = id.clone();
                let payload = payload.clone();
                async move { gateway.create_entity(entity_type, &id, &payload).await }
            })
            .await
    }

    /// Write a version to an entity that exists remotely.
    async fn commit(
        &self,
        change_type: ChangeType,
        entity_type: EntityType,
        entity_id: &EntityId,
        payload: &EntityPayload,
    ) -> Result<Timestamp> {
        let gateway = self.gateway.clone();
        let id = entity_id.clone();
        let payload = payload.clone();
        self.retry
            .run(move || {
                let gateway = gateway.clone();
                let id = id.clone();
                let payload = payload.clone();
                async move {
                    match change_type {
                        ChangeType::Delete => gateway.delete_entity(entity_type, &id).await,
                        ChangeType::Create | ChangeType::Update => {
                            gateway.update_entity(entity_type, &id, &payload).await
                        }
                    }
                }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::connectivity::ManualConnectivity;
    use crate::gateway::MemoryGateway;
    use crate::model::fixtures::*;
    use crate::model::ConflictType;
    use chrono::NaiveDate;
    use ledgersync_storage::MemoryStore;

    struct Harness {
        store: MemoryStore,
        gateway: Arc<MemoryGateway>,
        connectivity: Arc<ManualConnectivity>,
        wall: Arc<ManualClock>,
        config: SyncConfig,
    }

    impl Harness {
        /// Local wall clock at 1000, remote commits stamped at 5000.
        fn new() -> Self {
            Self::with_config(fast_config())
        }

        fn with_config(config: SyncConfig) -> Self {
            Self {
                store: MemoryStore::new(),
                gateway: Arc::new(MemoryGateway::with_clock(Arc::new(ManualClock::new(5000)))),
                connectivity: Arc::new(ManualConnectivity::new(true)),
                wall: Arc::new(ManualClock::new(1000)),
                config,
            }
        }

        async fn open(&self) -> SyncCoordinator {
            let ports = SyncPorts::new(
                Arc::new(self.store.clone()),
                self.gateway.clone(),
                self.connectivity.clone(),
            )
            .with_clock(self.wall.clone());
            SyncCoordinator::open(session(), ports, self.config.clone())
                .await
                .unwrap()
        }
    }

    fn fast_config() -> SyncConfig {
        SyncConfig {
            max_retries: 1,
            retry_initial_delay_ms: 1,
            ..SyncConfig::default()
        }
    }

    fn session() -> SessionInfo {
        SessionInfo::new(UserId::new("user-1").unwrap(), ClientId::new("phone").unwrap())
    }

    fn entity(id: &str) -> EntityId {
        EntityId::new(id).unwrap()
    }

    #[tokio::test]
    async fn test_remote_older_commits_without_conflict() {
        let h = Harness::new();
        h.gateway.seed(&entity("tx-1"), transaction(50), 900).await;
        let coordinator = h.open().await;

        coordinator
            .queue_change(ChangeType::Update, entity("tx-1"), transaction(100))
            .await
            .unwrap();
        let result = coordinator.sync_with_server().await;

        assert!(result.success);
        assert_eq!(result.conflicts, 0);
        assert_eq!(result.resolved, 1);
        assert_eq!(
            h.gateway.payload(EntityType::Transaction, &entity("tx-1")).await,
            Some(transaction(100))
        );
        assert_eq!(coordinator.get_sync_status().await.queued, 0);
    }

    #[tokio::test]
    async fn test_remote_newer_reports_update_conflict() {
        let h = Harness::new();
        h.gateway.seed(&entity("tx-1"), transaction(50), 2000).await;
        let coordinator = h.open().await;

        coordinator
            .queue_change(ChangeType::Update, entity("tx-1"), transaction(100))
            .await
            .unwrap();
        let result = coordinator.sync_with_server().await;

        assert!(!result.success);
        assert_eq!(result.conflicts, 1);
        assert!(result.errors.is_empty());

        // Last writer wins among the versions known locally.
        assert_eq!(result.resolved, 1);
        let resolved = coordinator.changes(true).await;
        assert!(resolved[0].resolved);
        assert!(coordinator.get_pending_conflicts().await.is_empty());
    }

    #[tokio::test]
    async fn test_remote_newer_transaction_is_update_update() {
        let mut config = fast_config();
        config
            .merge_overrides
            .insert(EntityType::Transaction, MergePolicy::Manual);
        let h = Harness::with_config(config);
        h.gateway.seed(&entity("tx-1"), transaction(50), 2000).await;
        let coordinator = h.open().await;

        coordinator
            .queue_change(ChangeType::Update, entity("tx-1"), transaction(100))
            .await
            .unwrap();
        let result = coordinator.sync_with_server().await;

        assert_eq!(result.conflicts, 1);
        let pending = coordinator.get_pending_conflicts().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].entity_id, entity("tx-1"));
        assert_eq!(pending[0].conflicts[0].conflict_type, ConflictType::UpdateUpdate);
        assert_eq!(pending[0].conflicts[0].data, transaction(100));

        let queued = coordinator.changes(false).await;
        assert_eq!(queued[0].conflicts[0].conflict_type, ConflictType::UpdateUpdate);
    }

    #[tokio::test]
    async fn test_conflict_type_recorded_for_manual_entity() {
        let h = Harness::new();
        h.gateway.seed(&entity("acct-1"), account(500), 2000).await;
        let coordinator = h.open().await;

        coordinator
            .queue_change(ChangeType::Update, entity("acct-1"), account(450))
            .await
            .unwrap();
        let result = coordinator.sync_with_server().await;

        assert!(!result.success);
        assert_eq!(result.conflicts, 1);
        assert_eq!(result.resolved, 0);
        assert_eq!(h.gateway.commit_count(), 0);

        let pending = coordinator.get_pending_conflicts().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].entity_id, entity("acct-1"));
        assert_eq!(pending[0].conflicts[0].conflict_type, ConflictType::UpdateUpdate);

        let queued = coordinator.changes(false).await;
        assert_eq!(queued[0].state(), ChangeState::Conflicted);
    }

    #[tokio::test]
    async fn test_second_pass_is_idempotent() {
        let h = Harness::new();
        h.gateway.seed(&entity("tx-1"), transaction(50), 2000).await;
        let coordinator = h.open().await;
        coordinator
            .queue_change(ChangeType::Update, entity("tx-1"), transaction(100))
            .await
            .unwrap();
        coordinator
            .queue_change(ChangeType::Create, entity("tx-2"), transaction(7))
            .await
            .unwrap();

        let first = coordinator.sync_with_server().await;
        let commits = h.gateway.commit_count();
        let second = coordinator.sync_with_server().await;

        assert_eq!(first.resolved, 2);
        assert_eq!(second.resolved, 0);
        assert_eq!(second.conflicts, 0);
        assert!(second.success);
        assert_eq!(h.gateway.commit_count(), commits);
    }

    #[tokio::test]
    async fn test_queued_count_tracks_enqueues() {
        let h = Harness::new();
        let coordinator = h.open().await;

        for i in 0..4 {
            coordinator
                .queue_change(ChangeType::Create, entity(&format!("tx-{}", i)), transaction(i))
                .await
                .unwrap();
        }

        let status = coordinator.get_sync_status().await;
        assert_eq!(status.queued, 4);
        assert_eq!(status.conflicts, 0);
        assert!(status.online);
    }

    #[tokio::test]
    async fn test_offline_pass_leaves_queue_untouched() {
        let h = Harness::new();
        h.connectivity.set_online(false);
        let coordinator = h.open().await;
        coordinator
            .queue_change(ChangeType::Create, entity("tx-1"), transaction(1))
            .await
            .unwrap();

        let result = coordinator.sync_with_server().await;

        assert!(!result.success);
        assert_eq!(result.errors, vec!["no connectivity".to_string()]);
        assert_eq!(h.gateway.fetch_count(), 0);
        assert_eq!(coordinator.get_sync_status().await.queued, 1);
    }

    #[tokio::test]
    async fn test_enqueue_storage_failure_is_reported() {
        let h = Harness::new();
        let coordinator = h.open().await;
        h.store.set_fail_writes(true);

        let result = coordinator
            .queue_change(ChangeType::Create, entity("tx-1"), transaction(1))
            .await;

        assert!(matches!(result, Err(Error::Storage(_))));
        assert_eq!(coordinator.get_sync_status().await.queued, 0);
    }

    #[tokio::test]
    async fn test_refresh_failure_ends_pass() {
        let h = Harness::new();
        let coordinator = h.open().await;
        coordinator
            .queue_change(ChangeType::Create, entity("tx-1"), transaction(1))
            .await
            .unwrap();
        h.store.set_fail_reads(true);

        let result = coordinator.sync_with_server().await;

        assert!(!result.success);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(h.gateway.fetch_count(), 0);
    }

    #[tokio::test]
    async fn test_failure_is_isolated_per_change() {
        let h = Harness::new();
        h.gateway.reject(&entity("tx-1")).await;
        let coordinator = h.open().await;
        let failing = coordinator
            .queue_change(ChangeType::Create, entity("tx-1"), transaction(1))
            .await
            .unwrap();
        coordinator
            .queue_change(ChangeType::Create, entity("tx-2"), transaction(2))
            .await
            .unwrap();

        let result = coordinator.sync_with_server().await;

        assert!(!result.success);
        assert_eq!(result.resolved, 1);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].starts_with(failing.as_str()));
        let queued = coordinator.changes(false).await;
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].id, failing);
    }

    #[tokio::test]
    async fn test_network_failure_keeps_change_queued() {
        let h = Harness::new();
        let coordinator = h.open().await;
        coordinator
            .queue_change(ChangeType::Create, entity("tx-1"), transaction(1))
            .await
            .unwrap();
        h.gateway.set_offline(true);

        let result = coordinator.sync_with_server().await;

        assert_eq!(result.errors.len(), 1);
        assert_eq!(coordinator.get_sync_status().await.queued, 1);

        h.gateway.set_offline(false);
        assert!(coordinator.sync_with_server().await.success);
    }

    #[tokio::test]
    async fn test_per_entity_order_is_preserved() {
        let h = Harness::new();
        h.gateway.reject(&entity("tx-1")).await;
        let coordinator = h.open().await;
        coordinator
            .queue_change(ChangeType::Create, entity("tx-1"), transaction(1))
            .await
            .unwrap();
        coordinator
            .queue_change(ChangeType::Update, entity("tx-1"), transaction(2))
            .await
            .unwrap();

        let blocked = coordinator.sync_with_server().await;
        assert_eq!(blocked.errors.len(), 1);
        assert_eq!(blocked.resolved, 0);
        assert_eq!(h.gateway.commit_count(), 0);

        h.gateway.accept(&entity("tx-1")).await;
        let result = coordinator.sync_with_server().await;

        assert!(result.success);
        assert_eq!(result.resolved, 2);
        assert_eq!(
            h.gateway.payload(EntityType::Transaction, &entity("tx-1")).await,
            Some(transaction(2))
        );
    }

    #[tokio::test]
    async fn test_delete_of_missing_entity_is_satisfied() {
        let h = Harness::new();
        let coordinator = h.open().await;
        coordinator
            .queue_change(ChangeType::Delete, entity("tx-1"), transaction(1))
            .await
            .unwrap();

        let result = coordinator.sync_with_server().await;

        assert!(result.success);
        assert_eq!(result.resolved, 1);
        assert_eq!(h.gateway.commit_count(), 0);
    }

    #[tokio::test]
    async fn test_delete_commits() {
        let h = Harness::new();
        h.gateway.seed(&entity("tx-1"), transaction(1), 900).await;
        let coordinator = h.open().await;
        coordinator
            .queue_change(ChangeType::Delete, entity("tx-1"), transaction(1))
            .await
            .unwrap();

        assert!(coordinator.sync_with_server().await.success);
        assert!(h
            .gateway
            .payload(EntityType::Transaction, &entity("tx-1"))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_manual_conflict_resolution() {
        let h = Harness::new();
        h.gateway.seed(&entity("acct-1"), account(500), 2000).await;
        let coordinator = h.open().await;
        coordinator
            .queue_change(ChangeType::Update, entity("acct-1"), account(450))
            .await
            .unwrap();

        coordinator.sync_with_server().await;
        let waiting = coordinator.sync_with_server().await;
        assert_eq!(waiting.conflicts, 1);
        assert_eq!(waiting.resolved, 0);
        assert_eq!(h.gateway.commit_count(), 0);

        let chosen = coordinator
            .resolve_conflict(&entity("acct-1"), account(475))
            .await
            .unwrap();
        let status = coordinator.get_sync_status().await;
        assert_eq!(status.queued, 1);
        assert_eq!(status.conflicts, 0);
        assert_eq!(coordinator.changes(false).await[0].id, chosen);

        let result = coordinator.sync_with_server().await;
        assert!(result.success);
        assert_eq!(
            h.gateway.payload(EntityType::Account, &entity("acct-1")).await,
            Some(account(475))
        );
    }

    #[tokio::test]
    async fn test_resolve_conflict_requires_pending_conflict() {
        let h = Harness::new();
        let coordinator = h.open().await;

        let result = coordinator.resolve_conflict(&entity("acct-1"), account(1)).await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_numeric_merge_keeps_remote_progress() {
        let h = Harness::new();
        h.gateway.set_expose_payloads(true);
        h.gateway.seed(&entity("goal-1"), goal(300), 2000).await;
        let coordinator = h.open().await;
        coordinator
            .queue_change(ChangeType::Update, entity("goal-1"), goal(250))
            .await
            .unwrap();

        let result = coordinator.sync_with_server().await;

        assert_eq!(result.conflicts, 1);
        assert_eq!(result.resolved, 1);
        assert_eq!(h.gateway.commit_count(), 0);
        assert_eq!(
            h.gateway.payload(EntityType::SavingsGoal, &entity("goal-1")).await,
            Some(goal(300))
        );
    }

    #[tokio::test]
    async fn test_numeric_merge_writes_local_progress() {
        let h = Harness::new();
        h.gateway.set_expose_payloads(true);
        h.gateway.seed(&entity("goal-1"), goal(300), 2000).await;
        let coordinator = h.open().await;
        coordinator
            .queue_change(ChangeType::Update, entity("goal-1"), goal(400))
            .await
            .unwrap();

        let result = coordinator.sync_with_server().await;

        assert_eq!(result.resolved, 1);
        assert_eq!(h.gateway.commit_count(), 1);
        assert_eq!(
            h.gateway.payload(EntityType::SavingsGoal, &entity("goal-1")).await,
            Some(goal(400))
        );
    }

    #[tokio::test]
    async fn test_rotating_group_merge_commits_furthest_rounds() {
        let h = Harness::new();
        h.gateway.set_expose_payloads(true);
        h.gateway.seed(&entity("group-1"), group(3, 4), 2000).await;
        let coordinator = h.open().await;
        coordinator
            .queue_change(ChangeType::Update, entity("group-1"), group(2, 5))
            .await
            .unwrap();

        let result = coordinator.sync_with_server().await;

        assert_eq!(result.conflicts, 1);
        assert_eq!(result.resolved, 1);
        assert_eq!(h.gateway.commit_count(), 1);
        assert_eq!(
            h.gateway
                .payload(EntityType::RotatingSavingsGroup, &entity("group-1"))
                .await,
            Some(group(3, 5))
        );
        assert!(coordinator.get_pending_conflicts().await.is_empty());
    }

    #[tokio::test]
    async fn test_community_fund_merge_keeps_latest_payment() {
        let march = NaiveDate::from_ymd_opt(2024, 3, 1);
        let may = NaiveDate::from_ymd_opt(2024, 5, 1);

        let h = Harness::new();
        h.gateway.set_expose_payloads(true);
        h.gateway.seed(&entity("fund-1"), fund(march), 2000).await;
        let coordinator = h.open().await;
        coordinator
            .queue_change(ChangeType::Update, entity("fund-1"), fund(may))
            .await
            .unwrap();

        let result = coordinator.sync_with_server().await;

        assert_eq!(result.conflicts, 1);
        assert_eq!(result.resolved, 1);
        assert_eq!(h.gateway.commit_count(), 1);
        assert_eq!(
            h.gateway.payload(EntityType::CommunityFund, &entity("fund-1")).await,
            Some(fund(may))
        );
    }

    #[tokio::test]
    async fn test_checksum_mismatch_is_enforced() {
        let h = Harness::new();
        let coordinator = h.open().await;
        coordinator
            .queue_change(ChangeType::Create, entity("goal-1"), goal(100))
            .await
            .unwrap();

        let key = h.config.queue_key(&session().user_id);
        let json = h.store.get(&key).await.unwrap().unwrap();
        let mut queue: serde_json::Value = serde_json::from_str(&json).unwrap();
        queue[0]["data"]["current_amount"] = serde_json::json!(999);
        h.store.set(&key, &queue.to_string()).await.unwrap();

        let result = coordinator.sync_with_server().await;

        assert!(!result.success);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].contains("Integrity"));
        assert_eq!(h.gateway.commit_count(), 0);
        assert_eq!(coordinator.get_sync_status().await.queued, 1);
    }

    #[tokio::test]
    async fn test_checksum_advisory_sends_anyway() {
        let h = Harness::with_config(SyncConfig {
            checksum_policy: ChecksumPolicy::Advisory,
            ..fast_config()
        });
        let coordinator = h.open().await;
        coordinator
            .queue_change(ChangeType::Create, entity("goal-1"), goal(100))
            .await
            .unwrap();

        let key = h.config.queue_key(&session().user_id);
        let json = h.store.get(&key).await.unwrap().unwrap();
        let mut queue: serde_json::Value = serde_json::from_str(&json).unwrap();
        queue[0]["data"]["current_amount"] = serde_json::json!(999);
        h.store.set(&key, &queue.to_string()).await.unwrap();

        assert!(coordinator.sync_with_server().await.success);
        assert_eq!(
            h.gateway.payload(EntityType::SavingsGoal, &entity("goal-1")).await,
            Some(goal(999))
        );
    }

    #[tokio::test]
    async fn test_prune_after_retention() {
        let h = Harness::with_config(SyncConfig {
            resolved_retention_secs: 60,
            ..fast_config()
        });
        let coordinator = h.open().await;
        coordinator
            .queue_change(ChangeType::Create, entity("tx-1"), transaction(1))
            .await
            .unwrap();
        coordinator.sync_with_server().await;
        assert_eq!(coordinator.changes(true).await.len(), 1);

        assert_eq!(coordinator.prune_resolved().await.unwrap(), 0);
        h.wall.advance(61_000);
        assert_eq!(coordinator.prune_resolved().await.unwrap(), 1);
        assert!(coordinator.changes(true).await.is_empty());
    }

    #[tokio::test]
    async fn test_queue_survives_restart() {
        let h = Harness::new();
        let first_stamp = {
            let coordinator = h.open().await;
            coordinator
                .queue_change(ChangeType::Create, entity("tx-1"), transaction(1))
                .await
                .unwrap();
            coordinator
                .queue_change(ChangeType::Create, entity("tx-2"), transaction(2))
                .await
                .unwrap();
            coordinator.changes(false).await[1].timestamp
        };

        h.wall.set(10);
        let coordinator = h.open().await;
        assert_eq!(coordinator.get_sync_status().await.queued, 2);

        coordinator
            .queue_change(ChangeType::Create, entity("tx-3"), transaction(3))
            .await
            .unwrap();
        let changes = coordinator.changes(false).await;
        assert!(changes[2].timestamp > first_stamp);
    }

    #[tokio::test]
    async fn test_concurrent_passes_do_not_double_commit() {
        let h = Harness::new();
        let coordinator = Arc::new(h.open().await);
        for i in 0..3 {
            coordinator
                .queue_change(ChangeType::Create, entity(&format!("tx-{}", i)), transaction(i))
                .await
                .unwrap();
        }

        let a = coordinator.clone();
        let b = coordinator.clone();
        let (first, second) = tokio::join!(a.sync_with_server(), b.sync_with_server());

        assert_eq!(first.resolved + second.resolved, 3);
        assert!(first.errors.is_empty() && second.errors.is_empty());
        assert_eq!(h.gateway.commit_count(), 3);
    }

    #[tokio::test]
    async fn test_merge_override_from_config() {
        let mut config = fast_config();
        config
            .merge_overrides
            .insert(EntityType::Account, MergePolicy::LastWriterWins);
        let h = Harness::with_config(config);
        h.gateway.seed(&entity("acct-1"), account(500), 2000).await;
        let coordinator = h.open().await;
        coordinator
            .queue_change(ChangeType::Update, entity("acct-1"), account(450))
            .await
            .unwrap();

        let result = coordinator.sync_with_server().await;

        assert_eq!(result.conflicts, 1);
        assert_eq!(result.resolved, 1);
        assert!(coordinator.get_pending_conflicts().await.is_empty());
    }
}
