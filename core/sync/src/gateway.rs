//! Remote data gateway port and an in-memory authority for tests.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use ledgersync_common::{EntityId, Error, Result, Timestamp};

use crate::clock::{Clock, SystemClock};
use crate::model::{EntityPayload, EntityType};

/// Existence and recency of an entity at the remote authority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteState {
    pub exists: bool,
    pub last_modified: Timestamp,
    /// When the remote record was created, if the gateway reports it.
    pub created_at: Option<Timestamp>,
    /// Current remote payload, if the gateway returns it.
    pub payload: Option<EntityPayload>,
}

impl RemoteState {
    /// The entity is unknown to the remote.
    pub fn missing() -> Self {
        Self {
            exists: false,
            last_modified: 0,
            created_at: None,
            payload: None,
        }
    }

    /// The entity exists and was last modified at `last_modified`.
    pub fn modified_at(last_modified: Timestamp) -> Self {
        Self {
            exists: true,
            last_modified,
            created_at: None,
            payload: None,
        }
    }

    pub fn with_created_at(mut self, created_at: Timestamp) -> Self {
        self.created_at = Some(created_at);
        self
    }

    pub fn with_payload(mut self, payload: EntityPayload) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// Access to the remote system of record.
///
/// Commits return the entity's new `last_modified`. Transient transport
/// failures should be reported as `Error::Network`, rejections as
/// `Error::RemoteCommit`.
#[async_trait]
pub trait RemoteGateway: Send + Sync {
    async fn get_entity_state(
        &self,
        entity_type: EntityType,
        entity_id: &EntityId,
    ) -> Result<RemoteState>;

    async fn create_entity(
        &self,
        entity_type: EntityType,
        entity_id: &EntityId,
        payload: &EntityPayload,
    ) -> Result<Timestamp>;

    async fn update_entity(
        &self,
        entity_type: EntityType,
        entity_id: &EntityId,
        payload: &EntityPayload,
    ) -> Result<Timestamp>;

    async fn delete_entity(&self, entity_type: EntityType, entity_id: &EntityId)
        -> Result<Timestamp>;
}

#[derive(Debug, Clone)]
struct RemoteRecord {
    payload: EntityPayload,
    created_at: Timestamp,
    last_modified: Timestamp,
}

/// In-memory remote authority.
///
/// Useful for testing and development. Commits are stamped with the
/// gateway's own clock. Payloads are only reported back when
/// `set_expose_payloads(true)` is set, mirroring a metadata-only backend
/// by default.
pub struct MemoryGateway {
    records: RwLock<HashMap<(EntityType, EntityId), RemoteRecord>>,
    clock: Arc<dyn Clock>,
    offline: AtomicBool,
    expose_payloads: AtomicBool,
    rejected: RwLock<HashSet<EntityId>>,
    commits: AtomicUsize,
    fetches: AtomicUsize,
}

impl MemoryGateway {
    /// Create an empty gateway stamped by the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty gateway stamped by `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            clock,
            offline: AtomicBool::new(false),
            expose_payloads: AtomicBool::new(false),
            rejected: RwLock::new(HashSet::new()),
            commits: AtomicUsize::new(0),
            fetches: AtomicUsize::new(0),
        }
    }

    /// Put a record in place as if another client had written it.
    pub async fn seed(&self, entity_id: &EntityId, payload: EntityPayload, last_modified: Timestamp) {
        let record = RemoteRecord {
            payload,
            created_at: last_modified,
            last_modified,
        };
        let key = (record.payload.entity_type(), entity_id.clone());
        self.records.write().await.insert(key, record);
    }

    /// Current remote payload of an entity.
    pub async fn payload(&self, entity_type: EntityType, entity_id: &EntityId) -> Option<EntityPayload> {
        self.records
            .read()
            .await
            .get(&(entity_type, entity_id.clone()))
            .map(|r| r.payload.clone())
    }

    /// Make every call fail with `Error::Network`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Include payloads in `get_entity_state` responses.
    pub fn set_expose_payloads(&self, expose: bool) {
        self.expose_payloads.store(expose, Ordering::SeqCst);
    }

    /// Reject every commit for an entity with `Error::RemoteCommit`.
    pub async fn reject(&self, entity_id: &EntityId) {
        self.rejected.write().await.insert(entity_id.clone());
    }

    /// Stop rejecting commits for an entity.
    pub async fn accept(&self, entity_id: &EntityId) {
        self.rejected.write().await.remove(entity_id);
    }

    /// Successful create/update/delete calls so far.
    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    /// `get_entity_state` calls so far.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn check_reachable(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(Error::Network("remote unreachable".to_string()))
        } else {
            Ok(())
        }
    }

    async fn check_accepted(&self, entity_id: &EntityId) -> Result<()> {
        if self.rejected.read().await.contains(entity_id) {
            Err(Error::RemoteCommit(format!("commit for {} rejected", entity_id)))
        } else {
            Ok(())
        }
    }
}

impl Default for MemoryGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteGateway for MemoryGateway {
    async fn get_entity_state(
        &self,
        entity_type: EntityType,
        entity_id: &EntityId,
    ) -> Result<RemoteState> {
        self.check_reachable()?;
        self.fetches.fetch_add(1, Ordering::SeqCst);

        let records = self.records.read().await;
        let Some(record) = records.get(&(entity_type, entity_id.clone())) else {
            return Ok(RemoteState::missing());
        };

        let mut state =
            RemoteState::modified_at(record.last_modified).with_created_at(record.created_at);
        if self.expose_payloads.load(Ordering::SeqCst) {
            state = state.with_payload(record.payload.clone());
        }
        Ok(state)
    }

    async fn create_entity(
        &self,
        entity_type: EntityType,
        entity_id: &EntityId,
        payload: &EntityPayload,
    ) -> Result<Timestamp> {
        self.check_reachable()?;
        self.check_accepted(entity_id).await?;

        let mut records = self.records.write().await;
        let key = (entity_type, entity_id.clone());
        if records.contains_key(&key) {
            return Err(Error::RemoteCommit(format!("{} {} already exists", entity_type, entity_id)));
        }

        let now = self.clock.now();
        records.insert(
            key,
            RemoteRecord {
                payload: payload.clone(),
                created_at: now,
                last_modified: now,
            },
        );
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(now)
    }

    async fn update_entity(
        &self,
        entity_type: EntityType,
        entity_id: &EntityId,
        payload: &EntityPayload,
    ) -> Result<Timestamp> {
        self.check_reachable()?;
        self.check_accepted(entity_id).await?;

        let mut records = self.records.write().await;
        let record = records
            .get_mut(&(entity_type, entity_id.clone()))
            .ok_or_else(|| Error::RemoteCommit(format!("{} {} does not exist", entity_type, entity_id)))?;

        let now = self.clock.now();
        record.payload = payload.clone();
        record.last_modified = now;
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(now)
    }

    async fn delete_entity(&self, entity_type: EntityType, entity_id: &EntityId) -> Result<Timestamp> {
        self.check_reachable()?;
        self.check_accepted(entity_id).await?;

        self.records
            .write()
            .await
            .remove(&(entity_type, entity_id.clone()));
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(self.clock.now())
    }
}
