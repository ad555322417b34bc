//! Cloud inventory contract.
//!
//! Every provider call the control plane and the agent make goes through
//! [`InventoryClient`]. Transports live outside this workspace; the
//! [`InMemoryInventory`] implementation backs tests and offline runs.

mod memory;

pub use memory::{
    FleetRecord, FunctionInvocationRecord, InMemoryInventory, InstanceRecord, InventorySnapshot,
    PolicyKind, ScalingPolicyRecord,
};

use crate::settings::FunctionTarget;
use crate::{InstanceState, MarkedInstance, PoolState, StackStatus, Tag};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub const RATE_LIMIT_CODES: [&str; 2] = ["RequestLimitExceeded", "Throttling"];
pub const COOLDOWN_CODE: &str = "ScalingActivityInProgress";
pub const VALIDATION_CODE: &str = "ValidationError";
const STEP_SCALING_MARKER: &str = "StepScaling";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InventoryError {
    #[error("{code}: {message}")]
    Provider { code: String, message: String },
    #[error("Transport error: {0}")]
    Transport(String),
}

impl InventoryError {
    pub fn provider(code: impl Into<String>, message: impl Into<String>) -> Self {
        InventoryError::Provider {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn code(&self) -> Option<&str> {
        match self {
            InventoryError::Provider { code, .. } => Some(code),
            InventoryError::Transport(_) => None,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        self.code()
            .map(|code| RATE_LIMIT_CODES.contains(&code))
            .unwrap_or(false)
    }

    pub fn is_cooldown_active(&self) -> bool {
        self.code() == Some(COOLDOWN_CODE)
    }

    /// The provider refused to execute a step scaling policy directly.
    pub fn is_step_scaling_rejection(&self) -> bool {
        match self {
            InventoryError::Provider { code, message } => {
                code == VALIDATION_CODE && message.contains(STEP_SCALING_MARKER)
            }
            InventoryError::Transport(_) => false,
        }
    }
}

pub type InventoryResult<T> = std::result::Result<T, InventoryError>;

/// Names of the inventory operations, used for call context in errors and call logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    DescribeGroup,
    SetDesiredCapacity,
    DescribeFleetInstances,
    DescribeInstances,
    DeleteTags,
    CreateTags,
    DescribeStackStatus,
    MetricMinimums,
    DescribeFleetRequest,
    ExecutePolicy,
    TerminateInGroup,
    TerminateInstances,
    InvokeFunction,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::DescribeGroup => "describe_group",
            Operation::SetDesiredCapacity => "set_desired_capacity",
            Operation::DescribeFleetInstances => "describe_fleet_instances",
            Operation::DescribeInstances => "describe_instances",
            Operation::DeleteTags => "delete_tags",
            Operation::CreateTags => "create_tags",
            Operation::DescribeStackStatus => "describe_stack_status",
            Operation::MetricMinimums => "metric_minimums",
            Operation::DescribeFleetRequest => "describe_fleet_request",
            Operation::ExecutePolicy => "execute_policy",
            Operation::TerminateInGroup => "terminate_in_group",
            Operation::TerminateInstances => "terminate_instances",
            Operation::InvokeFunction => "invoke_function",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One page of a paginated listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_token: Option<String>,
}

impl<T> Page<T> {
    pub fn last(items: Vec<T>) -> Self {
        Self {
            items,
            next_token: None,
        }
    }
}

/// Instances among `instance_ids` in `state` that carry a tag with `tag_key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceFilter {
    pub instance_ids: Vec<String>,
    pub state: InstanceState,
    pub tag_key: String,
}

impl InstanceFilter {
    pub fn running_with_tag(instance_ids: Vec<String>, tag_key: impl Into<String>) -> Self {
        Self {
            instance_ids,
            state: InstanceState::Running,
            tag_key: tag_key.into(),
        }
    }
}

/// Per-period minimums of a metric over a time window.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricQuery {
    pub namespace: String,
    pub metric_name: String,
    pub dimension_name: String,
    pub dimension_value: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub period_secs: u32,
}

impl MetricQuery {
    /// Eligible placement pool count of a spot fleet over the `window` ending at `end`,
    /// one datapoint per minute.
    pub fn eligible_pool_count(fleet_id: &str, window: ChronoDuration, end: DateTime<Utc>) -> Self {
        Self {
            namespace: "AWS/EC2Spot".to_string(),
            metric_name: "EligibleInstancePoolCount".to_string(),
            dimension_name: "FleetRequestId".to_string(),
            dimension_value: fleet_id.to_string(),
            start: end - window,
            end,
            period_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetRequest {
    pub fleet_id: String,
    pub activity_status: Option<String>,
}

/// Execute a named scaling policy, honoring its cooldown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyExecution {
    pub policy_name: String,
    pub group_name: Option<String>,
    pub honor_cooldown: bool,
}

impl PolicyExecution {
    /// A policy given by full resource name already identifies its group.
    pub fn honoring_cooldown(policy_name: &str, group_name: &str) -> Self {
        let group_name = if policy_name.starts_with("arn:") {
            None
        } else {
            Some(group_name.to_string())
        };

        Self {
            policy_name: policy_name.to_string(),
            group_name,
            honor_cooldown: true,
        }
    }
}

/// A call made against an inventory, as recorded by [`InMemoryInventory`].
#[derive(Debug, Clone, PartialEq)]
pub enum InventoryCall {
    DescribeGroup { name: String },
    SetDesiredCapacity { group: String, desired: u32 },
    DescribeFleetInstances { fleet_id: String, next_token: Option<String> },
    DescribeInstances { filter: InstanceFilter, next_token: Option<String> },
    DeleteTags { instance_ids: Vec<String>, tag_key: String },
    CreateTags { instance_ids: Vec<String>, tag: Tag },
    DescribeStackStatus { stack_name: String },
    MetricMinimums { query: MetricQuery },
    DescribeFleetRequest { fleet_id: String },
    ExecutePolicy { request: PolicyExecution },
    TerminateInGroup { instance_id: String, decrement_desired: bool },
    TerminateInstances { instance_ids: Vec<String> },
    InvokeFunction { target: FunctionTarget, payload: serde_json::Value },
}

impl InventoryCall {
    pub fn operation(&self) -> Operation {
        match self {
            InventoryCall::DescribeGroup { .. } => Operation::DescribeGroup,
            InventoryCall::SetDesiredCapacity { .. } => Operation::SetDesiredCapacity,
            InventoryCall::DescribeFleetInstances { .. } => Operation::DescribeFleetInstances,
            InventoryCall::DescribeInstances { .. } => Operation::DescribeInstances,
            InventoryCall::DeleteTags { .. } => Operation::DeleteTags,
            InventoryCall::CreateTags { .. } => Operation::CreateTags,
            InventoryCall::DescribeStackStatus { .. } => Operation::DescribeStackStatus,
            InventoryCall::MetricMinimums { .. } => Operation::MetricMinimums,
            InventoryCall::DescribeFleetRequest { .. } => Operation::DescribeFleetRequest,
            InventoryCall::ExecutePolicy { .. } => Operation::ExecutePolicy,
            InventoryCall::TerminateInGroup { .. } => Operation::TerminateInGroup,
            InventoryCall::TerminateInstances { .. } => Operation::TerminateInstances,
            InventoryCall::InvokeFunction { .. } => Operation::InvokeFunction,
        }
    }
}

/// Inventory operations the control plane and the agent depend on.
#[async_trait]
pub trait InventoryClient: Send + Sync {
    /// Describe a managed group by name. `None` when no such group exists.
    async fn describe_group(&self, name: &str) -> InventoryResult<Option<PoolState>>;

    async fn set_desired_capacity(&self, group: &str, desired: u32) -> InventoryResult<()>;

    /// Active instance ids of a fleet request, one page at a time.
    async fn describe_fleet_instances(
        &self,
        fleet_id: &str,
        next_token: Option<String>,
    ) -> InventoryResult<Page<String>>;

    async fn describe_instances(
        &self,
        filter: &InstanceFilter,
        next_token: Option<String>,
    ) -> InventoryResult<Page<MarkedInstance>>;

    async fn delete_tags(&self, instance_ids: &[String], tag_key: &str) -> InventoryResult<()>;

    async fn create_tags(&self, instance_ids: &[String], tag: &Tag) -> InventoryResult<()>;

    /// `None` when the stack does not exist.
    async fn describe_stack_status(&self, stack_name: &str) -> InventoryResult<Option<StackStatus>>;

    async fn metric_minimums(&self, query: &MetricQuery) -> InventoryResult<Vec<f64>>;

    /// `None` when the fleet request does not exist.
    async fn describe_fleet_request(&self, fleet_id: &str) -> InventoryResult<Option<FleetRequest>>;

    async fn execute_policy(&self, request: &PolicyExecution) -> InventoryResult<()>;

    async fn terminate_in_group(
        &self,
        instance_id: &str,
        decrement_desired: bool,
    ) -> InventoryResult<()>;

    async fn terminate_instances(&self, instance_ids: &[String]) -> InventoryResult<()>;

    /// Invoke a function synchronously and return its response payload.
    async fn invoke_function(
        &self,
        target: &FunctionTarget,
        payload: &serde_json::Value,
    ) -> InventoryResult<serde_json::Value>;
}
