pub use spotfill_core::{MarkedInstance, PoolState, Settings, SpotPool, StackStatus};

use serde::Serialize;
use std::fmt;

/// Why a scale-up was skipped
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum GuardReason {
    /// The owning stack is mid-update; capacity must not change out of band.
    StackUpdating { stack: String, status: StackStatus },
    /// The fleet has more than two placement pools and can replace lost capacity itself.
    SufficientFleetPools { fleet_id: String },
}

impl fmt::Display for GuardReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuardReason::StackUpdating { stack, status } => {
                write!(f, "stack {stack} is in status {status}")
            }
            GuardReason::SufficientFleetPools { fleet_id } => {
                write!(f, "fleet {fleet_id} has more than 2 eligible pools")
            }
        }
    }
}

/// Capacity change applied to the on-demand group
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CapacityChange {
    pub group: String,
    pub previous_desired: u32,
    pub final_desired: u32,
    pub lost_capacity: u64,
    pub replacements: u64,
    /// Instances whose marker was cleared.
    pub cleared: Vec<String>,
}

impl CapacityChange {
    /// The requested capacity exceeded the group's max size.
    pub fn truncated(&self) -> bool {
        u64::from(self.previous_desired) + self.replacements > u64::from(self.final_desired)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ScaleUpOutcome {
    Blocked { reasons: Vec<GuardReason> },
    Adjusted(CapacityChange),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ScaleDownOutcome {
    /// The spot pool is not back at full strength.
    NotRecommended,
    ScaledDown { policy: String },
    /// The provider refused because the group is still cooling down.
    CooldownActive { policy: String },
}

/// Result of one reconciliation pass
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "pass", rename_all = "snake_case")]
pub enum PassOutcome {
    ScaleUp {
        marked: Vec<MarkedInstance>,
        outcome: ScaleUpOutcome,
    },
    ScaleDown(ScaleDownOutcome),
}

impl PassOutcome {
    /// True when the pass changed nothing.
    pub fn is_noop(&self) -> bool {
        matches!(
            self,
            PassOutcome::ScaleUp {
                outcome: ScaleUpOutcome::Blocked { .. },
                ..
            } | PassOutcome::ScaleDown(
                ScaleDownOutcome::NotRecommended | ScaleDownOutcome::CooldownActive { .. }
            )
        )
    }
}
