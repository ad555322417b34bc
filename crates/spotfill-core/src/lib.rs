pub mod inventory;
pub mod pagination;
pub mod settings;
pub mod template;
pub mod weighting;

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

pub use inventory::{
    FleetRequest, InMemoryInventory, InstanceFilter, InventoryCall, InventoryClient,
    InventoryError, InventoryResult, InventorySnapshot, MetricQuery, Operation, Page,
    PolicyExecution,
};
pub use settings::{FunctionTarget, PollSettings, RawPollSettings, RawSettings, Settings, SpotPool};
pub use weighting::WeightTable;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Unknown instance type: {0} has no configured weight")]
    UnknownInstanceType(String),
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;

/// Tag key written to a spot instance once it has received a termination notice.
pub const MARKER_TAG_KEY: &str = "SpotTermination";
pub const MARKER_TAG_VALUE: &str = "true";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// The replacement marker shared by the agent (writer) and the control plane
    /// (reader and clearer).
    pub fn marker() -> Self {
        Self::new(MARKER_TAG_KEY, MARKER_TAG_VALUE)
    }
}

/// A spot instance flagged for imminent loss.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkedInstance {
    pub id: String,
    pub instance_type: String,
}

impl MarkedInstance {
    pub fn new(id: impl Into<String>, instance_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            instance_type: instance_type.into(),
        }
    }
}

/// Capacity settings and membership of a managed group.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PoolState {
    pub desired_capacity: u32,
    pub min_size: u32,
    pub max_size: u32,
    #[serde(default)]
    pub members: BTreeSet<String>,
}

impl PoolState {
    pub fn new(desired_capacity: u32, min_size: u32, max_size: u32) -> Self {
        Self {
            desired_capacity,
            min_size,
            max_size,
            members: BTreeSet::new(),
        }
    }

    pub fn with_members<I, S>(mut self, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.members = members.into_iter().map(Into::into).collect();
        self
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Pending,
    Running,
    ShuttingDown,
    Terminated,
    Stopping,
    Stopped,
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Pending => "pending",
            InstanceState::Running => "running",
            InstanceState::ShuttingDown => "shutting-down",
            InstanceState::Terminated => "terminated",
            InstanceState::Stopping => "stopping",
            InstanceState::Stopped => "stopped",
        }
    }
}

/// Deployment stack statuses during which capacity must not be changed out of band.
pub const IN_FLUX_STACK_STATUSES: [&str; 7] = [
    "CREATE_IN_PROGRESS",
    "ROLLBACK_IN_PROGRESS",
    "DELETE_IN_PROGRESS",
    "UPDATE_IN_PROGRESS",
    "UPDATE_COMPLETE_CLEANUP_IN_PROGRESS",
    "UPDATE_ROLLBACK_IN_PROGRESS",
    "UPDATE_ROLLBACK_COMPLETE_CLEANUP_IN_PROGRESS",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StackStatus(String);

impl StackStatus {
    pub fn new(status: impl Into<String>) -> Self {
        Self(status.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_in_flux(&self) -> bool {
        IN_FLUX_STACK_STATUSES.contains(&self.0.as_str())
    }
}

impl fmt::Display for StackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Activity status a spot fleet reports once its size reaches its target capacity.
pub const FLEET_FULFILLED: &str = "fulfilled";
