//! ledgersync sync engine
//!
//! Offline-first reconciliation of local ledger mutations with a single
//! remote authority:
//! - Durable change queue with logical timestamps and checksums
//! - Conflict detection and per-entity-type merge policies
//! - A per-session coordinator that runs serialized sync passes
//! - Background passes on reconnect and on a timer

pub mod checksum;
pub mod clock;
pub mod config;
pub mod conflict;
pub mod connectivity;
pub mod engine;
pub mod gateway;
pub mod ledger;
pub mod merge;
pub mod model;
pub mod monitor;
pub mod queue;
pub mod retry;

pub use clock::{Clock, LogicalClock, ManualClock, SystemClock};
pub use config::{ChecksumPolicy, SyncConfig};
pub use conflict::ConflictDetector;
pub use connectivity::{ConnectivityPort, ManualConnectivity};
pub use engine::{SessionInfo, SyncCoordinator, SyncPorts, SyncResult, SyncStatus};
pub use gateway::{MemoryGateway, RemoteGateway, RemoteState};
pub use ledger::{ConflictLedger, PendingConflict};
pub use merge::{MergePolicy, MergeRegistry};
pub use model::{
    AccountData, ChangeState, ChangeType, CommunityFundData, ConflictInfo, ConflictType,
    EntityPayload, EntityType, NewChange, OfflineChange, RotatingSavingsGroupData,
    SavingsGoalData, TransactionData,
};
pub use monitor::{ConnectivityMonitor, MonitorHandle, PassTrigger, SyncEvent};
pub use queue::ChangeQueue;
pub use retry::{Backoff, GatewayRetry, MAX_BACKOFF};
