//! Per-entity-type merge policies.
//!
//! Every policy is a pure function from a non-empty list of conflicting
//! versions to one resolved version. Ties on timestamp go to the version
//! that comes later in the input.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use ledgersync_common::{Error, Result};

use crate::checksum;
use crate::model::{EntityPayload, EntityType, OfflineChange};

/// Merge policy applied to conflicting versions of one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// Keep the version with the latest timestamp.
    LastWriterWins,
    /// Pick the latest version but leave it for a human to confirm.
    Manual,
    /// Latest version, with savings progress set to the maximum seen.
    NumericMax,
    /// Latest version, with paid and current rounds set to the maximum seen.
    RotatingGroup,
    /// Latest version, with the chronologically latest payment date seen.
    CommunityContribution,
}

impl MergePolicy {
    /// Whether this policy defers to a human instead of committing.
    pub fn is_manual(&self) -> bool {
        matches!(self, MergePolicy::Manual)
    }

    /// Resolve a set of conflicting versions.
    ///
    /// The result is a copy of the most recent version with merged fields
    /// and a fresh checksum. `resolved` is `false` only for `Manual`.
    ///
    /// # Errors
    /// - `InvalidInput` if `versions` is empty
    pub fn resolve(&self, versions: &[OfflineChange]) -> Result<OfflineChange> {
        let latest = versions
            .iter()
            .max_by_key(|v| v.timestamp)
            .ok_or_else(|| Error::InvalidInput("No versions to merge".to_string()))?;

        let mut merged = latest.clone();
        match self {
            MergePolicy::LastWriterWins | MergePolicy::Manual => {}
            MergePolicy::NumericMax => {
                if let EntityPayload::SavingsGoal(goal) = &mut merged.data {
                    goal.current_amount = versions
                        .iter()
                        .filter_map(|v| match &v.data {
                            EntityPayload::SavingsGoal(g) => Some(g.current_amount),
                            _ => None,
                        })
                        .fold(goal.current_amount, i64::max);
                }
            }
            MergePolicy::RotatingGroup => {
                if let EntityPayload::RotatingSavingsGroup(group) = &mut merged.data {
                    for v in versions {
                        if let EntityPayload::RotatingSavingsGroup(g) = &v.data {
                            group.paid_rounds = group.paid_rounds.max(g.paid_rounds);
                            group.current_round = group.current_round.max(g.current_round);
                        }
                    }
                }
            }
            MergePolicy::CommunityContribution => {
                if let EntityPayload::CommunityFund(fund) = &mut merged.data {
                    fund.last_paid_date = versions
                        .iter()
                        .filter_map(|v| match &v.data {
                            EntityPayload::CommunityFund(f) => f.last_paid_date,
                            _ => None,
                        })
                        .chain(fund.last_paid_date)
                        .max();
                }
            }
        }

        if merged.data != latest.data {
            merged.checksum = checksum::compute(&merged.data)?;
        }
        merged.conflicts.clear();
        merged.resolved = !self.is_manual();
        merged.resolved_at = None;
        Ok(merged)
    }
}

/// Maps each entity type to exactly one merge policy.
#[derive(Debug, Clone)]
pub struct MergeRegistry {
    policies: HashMap<EntityType, MergePolicy>,
}

impl MergeRegistry {
    /// Registry with the default policy for every entity type.
    pub fn new() -> Self {
        let policies = EntityType::ALL
            .iter()
            .map(|t| (*t, Self::default_policy(*t)))
            .collect();
        Self { policies }
    }

    /// Registry with defaults, then `overrides` applied on top.
    pub fn with_overrides(overrides: &HashMap<EntityType, MergePolicy>) -> Self {
        let mut registry = Self::new();
        for (entity_type, policy) in overrides {
            registry.set_policy(*entity_type, *policy);
        }
        registry
    }

    /// Built-in policy for an entity type.
    pub fn default_policy(entity_type: EntityType) -> MergePolicy {
        match entity_type {
            EntityType::Transaction => MergePolicy::LastWriterWins,
            EntityType::Account => MergePolicy::Manual,
            EntityType::SavingsGoal => MergePolicy::NumericMax,
            EntityType::RotatingSavingsGroup => MergePolicy::RotatingGroup,
            EntityType::CommunityFund => MergePolicy::CommunityContribution,
        }
    }

    pub fn set_policy(&mut self, entity_type: EntityType, policy: MergePolicy) {
        self.policies.insert(entity_type, policy);
    }

    pub fn policy_for(&self, entity_type: EntityType) -> MergePolicy {
        self.policies
            .get(&entity_type)
            .copied()
            .unwrap_or(MergePolicy::LastWriterWins)
    }
}

impl Default for MergeRegistry {
    fn default() -> Self {
        Self::new()
    }
}
