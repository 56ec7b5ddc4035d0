//! Queued changes, domain payloads and conflict records.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

use ledgersync_common::{ChangeId, ClientId, EntityId, Timestamp, UserId};

/// Kind of local mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    /// New record.
    Create,
    /// Existing record modified.
    Update,
    /// Record removed.
    Delete,
}

/// Domain category of a record. Selects the payload shape and merge policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Transaction,
    Account,
    SavingsGoal,
    RotatingSavingsGroup,
    CommunityFund,
}

impl EntityType {
    /// All entity types, in declaration order.
    pub const ALL: [EntityType; 5] = [
        EntityType::Transaction,
        EntityType::Account,
        EntityType::SavingsGoal,
        EntityType::RotatingSavingsGroup,
        EntityType::CommunityFund,
    ];

    /// Wire name, as used in configuration files and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Transaction => "transaction",
            EntityType::Account => "account",
            EntityType::SavingsGoal => "savings_goal",
            EntityType::RotatingSavingsGroup => "rotating_savings_group",
            EntityType::CommunityFund => "community_fund",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A ledger entry. Amounts are in minor currency units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionData {
    pub account_id: String,
    pub amount: i64,
    pub currency: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub occurred_on: NaiveDate,
}

/// A money account. Its balance is only ever merged by a human.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountData {
    pub name: String,
    pub balance: i64,
    pub currency: String,
    pub kind: String,
}

/// A savings goal with monotonically increasing progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavingsGoalData {
    pub name: String,
    pub target_amount: i64,
    pub current_amount: i64,
    #[serde(default)]
    pub deadline: Option<NaiveDate>,
}

/// A pooled savings commitment paid out in rounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotatingSavingsGroupData {
    pub name: String,
    pub contribution_amount: i64,
    pub member_count: u32,
    pub paid_rounds: u32,
    pub current_round: u32,
}

/// A recurring contribution to a community fund.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommunityFundData {
    pub name: String,
    pub contribution_amount: i64,
    #[serde(default)]
    pub last_paid_date: Option<NaiveDate>,
}

/// Change payload, tagged by entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "entity_type", rename_all = "snake_case")]
pub enum EntityPayload {
    Transaction(TransactionData),
    Account(AccountData),
    SavingsGoal(SavingsGoalData),
    RotatingSavingsGroup(RotatingSavingsGroupData),
    CommunityFund(CommunityFundData),
}

impl EntityPayload {
    /// Entity type carried by this payload.
    pub fn entity_type(&self) -> EntityType {
        match self {
            EntityPayload::Transaction(_) => EntityType::Transaction,
            EntityPayload::Account(_) => EntityType::Account,
            EntityPayload::SavingsGoal(_) => EntityType::SavingsGoal,
            EntityPayload::RotatingSavingsGroup(_) => EntityType::RotatingSavingsGroup,
            EntityPayload::CommunityFund(_) => EntityType::CommunityFund,
        }
    }
}

/// A mutation as submitted by the application, before the queue assigns
/// its id, timestamp and checksum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewChange {
    pub change_type: ChangeType,
    pub entity_id: EntityId,
    pub data: EntityPayload,
}

impl NewChange {
    pub fn new(change_type: ChangeType, entity_id: EntityId, data: EntityPayload) -> Self {
        Self {
            change_type,
            entity_id,
            data,
        }
    }
}

/// Where a change is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeState {
    /// Waiting for the next sync pass.
    Queued,
    /// Diverged from the remote; either retried next pass or awaiting a
    /// human decision, depending on the entity's merge policy.
    Conflicted,
    /// Committed (or superseded). Never resent.
    Resolved,
}

/// A queued local mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfflineChange {
    pub id: ChangeId,
    pub change_type: ChangeType,
    pub entity_id: EntityId,
    pub data: EntityPayload,
    /// Logical clock value at enqueue time.
    pub timestamp: Timestamp,
    pub user_id: UserId,
    pub client_id: ClientId,
    /// Hex BLAKE2b-256 digest of `data`.
    pub checksum: String,
    pub resolved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<ConflictInfo>,
}

impl OfflineChange {
    pub fn entity_type(&self) -> EntityType {
        self.data.entity_type()
    }

    pub fn state(&self) -> ChangeState {
        if self.resolved {
            ChangeState::Resolved
        } else if self.conflicts.is_empty() {
            ChangeState::Queued
        } else {
            ChangeState::Conflicted
        }
    }
}

/// How a queued change diverged from the remote entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    CreateCreate,
    UpdateUpdate,
    CreateUpdate,
    DeleteUpdate,
}

/// One divergent version of an entity discovered during reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictInfo {
    pub change_id: ChangeId,
    pub timestamp: Timestamp,
    pub data: EntityPayload,
    /// `None` for the remote authority's own version.
    pub user_id: Option<UserId>,
    /// `None` for the remote authority's own version.
    pub client_id: Option<ClientId>,
    pub conflict_type: ConflictType,
}

impl ConflictInfo {
    /// Conflict record for a local change.
    pub fn from_change(change: &OfflineChange, conflict_type: ConflictType) -> Self {
        Self {
            change_id: change.id.clone(),
            timestamp: change.timestamp,
            data: change.data.clone(),
            user_id: Some(change.user_id.clone()),
            client_id: Some(change.client_id.clone()),
            conflict_type,
        }
    }

    /// Conflict record for the version currently held by the remote.
    pub fn from_remote(
        entity_id: &EntityId,
        last_modified: Timestamp,
        data: EntityPayload,
        conflict_type: ConflictType,
    ) -> Self {
        Self {
            change_id: remote_version_id(entity_id, last_modified),
            timestamp: last_modified,
            data,
            user_id: None,
            client_id: None,
            conflict_type,
        }
    }

    pub fn is_remote(&self) -> bool {
        self.client_id.is_none()
    }

    /// View this record as a change so it can be fed to a merge policy.
    ///
    /// Fields the record does not carry are taken from `base`.
    pub fn to_version(&self, base: &OfflineChange) -> OfflineChange {
        OfflineChange {
            id: self.change_id.clone(),
            change_type: if self.is_remote() {
                ChangeType::Update
            } else if self.change_id == base.id {
                base.change_type
            } else {
                ChangeType::Update
            },
            entity_id: base.entity_id.clone(),
            data: self.data.clone(),
            timestamp: self.timestamp,
            user_id: self.user_id.clone().unwrap_or_else(|| base.user_id.clone()),
            client_id: self
                .client_id
                .clone()
                .unwrap_or_else(|| base.client_id.clone()),
            checksum: base.checksum.clone(),
            resolved: false,
            resolved_at: None,
            conflicts: Vec::new(),
        }
    }
}

/// Id given to the remote's version of an entity in the conflict map.
pub fn remote_version_id(entity_id: &EntityId, last_modified: Timestamp) -> ChangeId {
    ChangeId::from_raw(format!("remote:{}@{}", entity_id, last_modified))
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn goal(current_amount: i64) -> EntityPayload {
        EntityPayload::SavingsGoal(SavingsGoalData {
            name: "Emergency fund".to_string(),
            target_amount: 1_000,
            current_amount,
            deadline: None,
        })
    }

    pub fn transaction(amount: i64) -> EntityPayload {
        EntityPayload::Transaction(TransactionData {
            account_id: "acct-1".to_string(),
            amount,
            currency: "KES".to_string(),
            category: None,
            description: None,
            occurred_on: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
        })
    }

    pub fn account(balance: i64) -> EntityPayload {
        EntityPayload::Account(AccountData {
            name: "Wallet".to_string(),
            balance,
            currency: "KES".to_string(),
            kind: "cash".to_string(),
        })
    }

    pub fn group(paid_rounds: u32, current_round: u32) -> EntityPayload {
        EntityPayload::RotatingSavingsGroup(RotatingSavingsGroupData {
            name: "Chama".to_string(),
            contribution_amount: 500,
            member_count: 10,
            paid_rounds,
            current_round,
        })
    }

    pub fn fund(last_paid_date: Option<NaiveDate>) -> EntityPayload {
        EntityPayload::CommunityFund(CommunityFundData {
            name: "Harambee".to_string(),
            contribution_amount: 200,
            last_paid_date,
        })
    }

    /// A queued change at `timestamp`, with a placeholder checksum.
    pub fn change(
        id: &str,
        change_type: ChangeType,
        entity_id: &str,
        data: EntityPayload,
        timestamp: Timestamp,
    ) -> OfflineChange {
        OfflineChange {
            id: ChangeId::from_raw(id),
            change_type,
            entity_id: EntityId::new(entity_id).unwrap(),
            data,
            timestamp,
            user_id: UserId::new("user-1").unwrap(),
            client_id: ClientId::new("client-1").unwrap(),
            checksum: String::new(),
            resolved: false,
            resolved_at: None,
            conflicts: Vec::new(),
        }
    }
}
