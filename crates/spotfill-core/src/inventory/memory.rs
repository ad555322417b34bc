use super::{
    FleetRequest, InstanceFilter, InventoryCall, InventoryClient, InventoryError, InventoryResult,
    MetricQuery, Operation, Page, PolicyExecution, COOLDOWN_CODE, VALIDATION_CODE,
};
use crate::settings::FunctionTarget;
use crate::{CoreError, InstanceState, MarkedInstance, PoolState, StackStatus, Tag};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, RwLock, RwLockWriteGuard};
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FleetRecord {
    #[serde(default)]
    pub activity_status: Option<String>,
    #[serde(default)]
    pub active_instances: Vec<String>,
    /// Per-minute minimums of the fleet's eligible placement pool count.
    #[serde(default)]
    pub eligible_pool_counts: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub instance_type: String,
    pub state: InstanceState,
    #[serde(default)]
    pub availability_zone: Option<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl InstanceRecord {
    pub fn running(instance_type: impl Into<String>) -> Self {
        Self {
            instance_type: instance_type.into(),
            state: InstanceState::Running,
            availability_zone: None,
            tags: BTreeMap::new(),
        }
    }

    pub fn with_tag(mut self, tag: &Tag) -> Self {
        self.tags.insert(tag.key.clone(), tag.value.clone());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    Simple,
    Step,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScalingPolicyRecord {
    pub group: String,
    pub kind: PolicyKind,
    pub adjustment: i64,
    #[serde(default)]
    pub cooldown_active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionInvocationRecord {
    pub function: String,
    pub region: String,
    pub payload: serde_json::Value,
}

/// Serializable state of an in-memory inventory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InventorySnapshot {
    #[serde(default)]
    pub groups: BTreeMap<String, PoolState>,
    #[serde(default)]
    pub fleets: BTreeMap<String, FleetRecord>,
    #[serde(default)]
    pub instances: BTreeMap<String, InstanceRecord>,
    #[serde(default)]
    pub stacks: BTreeMap<String, StackStatus>,
    #[serde(default)]
    pub policies: BTreeMap<String, ScalingPolicyRecord>,
    #[serde(default)]
    pub invocations: Vec<FunctionInvocationRecord>,
}

#[derive(Default)]
struct MemoryState {
    snapshot: InventorySnapshot,
    calls: Vec<InventoryCall>,
    failures: HashMap<Operation, InventoryError>,
    page_size: Option<usize>,
}

/// In-memory inventory that applies mutations to a snapshot and records every call.
#[derive(Clone, Default)]
pub struct InMemoryInventory {
    state: Arc<RwLock<MemoryState>>,
}

impl InMemoryInventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: InventorySnapshot) -> Self {
        Self {
            state: Arc::new(RwLock::new(MemoryState {
                snapshot,
                ..Default::default()
            })),
        }
    }

    pub fn load(path: &Path) -> crate::Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            CoreError::SerializationError(format!("failed to read {}: {e}", path.display()))
        })?;
        let snapshot = serde_json::from_str(&raw).map_err(|e| {
            CoreError::SerializationError(format!("failed to parse {}: {e}", path.display()))
        })?;
        Ok(Self::from_snapshot(snapshot))
    }

    pub fn save(&self, path: &Path) -> crate::Result<()> {
        let json = serde_json::to_string_pretty(&self.snapshot())
            .map_err(|e| CoreError::SerializationError(e.to_string()))?;
        std::fs::write(path, json).map_err(|e| {
            CoreError::SerializationError(format!("failed to write {}: {e}", path.display()))
        })
    }

    /// Limit listings to `page_size` items per page.
    pub fn with_page_size(self, page_size: usize) -> Self {
        if let Ok(mut state) = self.state.write() {
            state.page_size = Some(page_size.max(1));
        }
        self
    }

    /// Make every subsequent call of `operation` fail with `error`.
    pub fn fail_on(&self, operation: Operation, error: InventoryError) {
        if let Ok(mut state) = self.state.write() {
            state.failures.insert(operation, error);
        }
    }

    pub fn clear_failure(&self, operation: Operation) {
        if let Ok(mut state) = self.state.write() {
            state.failures.remove(&operation);
        }
    }

    pub fn snapshot(&self) -> InventorySnapshot {
        self.state
            .read()
            .map(|state| state.snapshot.clone())
            .unwrap_or_default()
    }

    pub fn calls(&self) -> Vec<InventoryCall> {
        self.state
            .read()
            .map(|state| state.calls.clone())
            .unwrap_or_default()
    }

    pub fn calls_of(&self, operation: Operation) -> Vec<InventoryCall> {
        self.calls()
            .into_iter()
            .filter(|call| call.operation() == operation)
            .collect()
    }

    pub fn call_count(&self, operation: Operation) -> usize {
        self.calls_of(operation).len()
    }

    /// Record `call`, then fail it if a failure is injected for its operation.
    fn begin(&self, call: InventoryCall) -> InventoryResult<RwLockWriteGuard<'_, MemoryState>> {
        let mut state = self
            .state
            .write()
            .map_err(|_| InventoryError::Transport("Lock poisoned".to_string()))?;
        let operation = call.operation();
        debug!(%operation, "inventory call");
        state.calls.push(call);

        if let Some(error) = state.failures.get(&operation) {
            return Err(error.clone());
        }
        Ok(state)
    }
}

fn paginate<T: Clone>(
    items: &[T],
    page_size: Option<usize>,
    token: Option<&str>,
) -> InventoryResult<Page<T>> {
    let start = match token {
        None => 0,
        Some(token) => token.parse::<usize>().map_err(|_| {
            InventoryError::provider("InvalidNextToken", format!("invalid next token {token}"))
        })?,
    };
    let start = start.min(items.len());
    let end = start
        .saturating_add(page_size.unwrap_or(usize::MAX))
        .min(items.len());

    Ok(Page {
        items: items[start..end].to_vec(),
        next_token: (end < items.len()).then(|| end.to_string()),
    })
}

fn instance_not_found(instance_id: &str) -> InventoryError {
    InventoryError::provider(
        "InvalidInstanceID.NotFound",
        format!("The instance ID '{instance_id}' does not exist"),
    )
}

#[async_trait]
impl InventoryClient for InMemoryInventory {
    async fn describe_group(&self, name: &str) -> InventoryResult<Option<PoolState>> {
        let state = self.begin(InventoryCall::DescribeGroup {
            name: name.to_string(),
        })?;
        Ok(state.snapshot.groups.get(name).cloned())
    }

    async fn set_desired_capacity(&self, group: &str, desired: u32) -> InventoryResult<()> {
        let mut state = self.begin(InventoryCall::SetDesiredCapacity {
            group: group.to_string(),
            desired,
        })?;
        let pool = state.snapshot.groups.get_mut(group).ok_or_else(|| {
            InventoryError::provider(VALIDATION_CODE, format!("AutoScalingGroup name not found - {group}"))
        })?;

        if desired < pool.min_size || desired > pool.max_size {
            return Err(InventoryError::provider(
                VALIDATION_CODE,
                format!(
                    "New SetDesiredCapacity value {desired} is outside of the group's min size {} and max size {}",
                    pool.min_size, pool.max_size
                ),
            ));
        }
        pool.desired_capacity = desired;
        Ok(())
    }

    async fn describe_fleet_instances(
        &self,
        fleet_id: &str,
        next_token: Option<String>,
    ) -> InventoryResult<Page<String>> {
        let state = self.begin(InventoryCall::DescribeFleetInstances {
            fleet_id: fleet_id.to_string(),
            next_token: next_token.clone(),
        })?;
        let fleet = state.snapshot.fleets.get(fleet_id).ok_or_else(|| {
            InventoryError::provider(
                "InvalidSpotFleetRequestId.NotFound",
                format!("The spot fleet request ID '{fleet_id}' does not exist"),
            )
        })?;
        paginate(&fleet.active_instances, state.page_size, next_token.as_deref())
    }

    async fn describe_instances(
        &self,
        filter: &InstanceFilter,
        next_token: Option<String>,
    ) -> InventoryResult<Page<MarkedInstance>> {
        let state = self.begin(InventoryCall::DescribeInstances {
            filter: filter.clone(),
            next_token: next_token.clone(),
        })?;

        let matching: Vec<MarkedInstance> = filter
            .instance_ids
            .iter()
            .filter_map(|id| {
                state
                    .snapshot
                    .instances
                    .get(id)
                    .filter(|record| {
                        record.state == filter.state && record.tags.contains_key(&filter.tag_key)
                    })
                    .map(|record| MarkedInstance::new(id.clone(), record.instance_type.clone()))
            })
            .collect();

        paginate(&matching, state.page_size, next_token.as_deref())
    }

    async fn delete_tags(&self, instance_ids: &[String], tag_key: &str) -> InventoryResult<()> {
        let mut state = self.begin(InventoryCall::DeleteTags {
            instance_ids: instance_ids.to_vec(),
            tag_key: tag_key.to_string(),
        })?;
        for id in instance_ids {
            let record = state
                .snapshot
                .instances
                .get_mut(id)
                .ok_or_else(|| instance_not_found(id))?;
            record.tags.remove(tag_key);
        }
        Ok(())
    }

    async fn create_tags(&self, instance_ids: &[String], tag: &Tag) -> InventoryResult<()> {
        let mut state = self.begin(InventoryCall::CreateTags {
            instance_ids: instance_ids.to_vec(),
            tag: tag.clone(),
        })?;
        for id in instance_ids {
            let record = state
                .snapshot
                .instances
                .get_mut(id)
                .ok_or_else(|| instance_not_found(id))?;
            record.tags.insert(tag.key.clone(), tag.value.clone());
        }
        Ok(())
    }

    async fn describe_stack_status(&self, stack_name: &str) -> InventoryResult<Option<StackStatus>> {
        let state = self.begin(InventoryCall::DescribeStackStatus {
            stack_name: stack_name.to_string(),
        })?;
        Ok(state.snapshot.stacks.get(stack_name).cloned())
    }

    async fn metric_minimums(&self, query: &MetricQuery) -> InventoryResult<Vec<f64>> {
        let state = self.begin(InventoryCall::MetricMinimums {
            query: query.clone(),
        })?;
        if query.metric_name != "EligibleInstancePoolCount" {
            return Ok(Vec::new());
        }
        Ok(state
            .snapshot
            .fleets
            .get(&query.dimension_value)
            .map(|fleet| fleet.eligible_pool_counts.clone())
            .unwrap_or_default())
    }

    async fn describe_fleet_request(&self, fleet_id: &str) -> InventoryResult<Option<FleetRequest>> {
        let state = self.begin(InventoryCall::DescribeFleetRequest {
            fleet_id: fleet_id.to_string(),
        })?;
        Ok(state.snapshot.fleets.get(fleet_id).map(|fleet| FleetRequest {
            fleet_id: fleet_id.to_string(),
            activity_status: fleet.activity_status.clone(),
        }))
    }

    async fn execute_policy(&self, request: &PolicyExecution) -> InventoryResult<()> {
        let mut state = self.begin(InventoryCall::ExecutePolicy {
            request: request.clone(),
        })?;
        let policy = state
            .snapshot
            .policies
            .get(&request.policy_name)
            .cloned()
            .ok_or_else(|| {
                InventoryError::provider(
                    VALIDATION_CODE,
                    format!("No such policy {}", request.policy_name),
                )
            })?;

        if let Some(group) = &request.group_name {
            if *group != policy.group {
                return Err(InventoryError::provider(
                    VALIDATION_CODE,
                    format!("Policy {} does not belong to group {group}", request.policy_name),
                ));
            }
        }
        if policy.kind == PolicyKind::Step {
            return Err(InventoryError::provider(
                VALIDATION_CODE,
                format!(
                    "Policy {} is of type StepScaling and cannot be executed without a metric value",
                    request.policy_name
                ),
            ));
        }
        if policy.cooldown_active && request.honor_cooldown {
            return Err(InventoryError::provider(
                COOLDOWN_CODE,
                format!("Scaling activity for {} is in progress or in cooldown", policy.group),
            ));
        }

        let pool = state.snapshot.groups.get_mut(&policy.group).ok_or_else(|| {
            InventoryError::provider(
                VALIDATION_CODE,
                format!("AutoScalingGroup name not found - {}", policy.group),
            )
        })?;
        let adjusted = (i64::from(pool.desired_capacity) + policy.adjustment)
            .clamp(i64::from(pool.min_size), i64::from(pool.max_size));
        pool.desired_capacity = adjusted as u32;
        Ok(())
    }

    async fn terminate_in_group(
        &self,
        instance_id: &str,
        decrement_desired: bool,
    ) -> InventoryResult<()> {
        let mut state = self.begin(InventoryCall::TerminateInGroup {
            instance_id: instance_id.to_string(),
            decrement_desired,
        })?;
        let pool = state
            .snapshot
            .groups
            .values_mut()
            .find(|pool| pool.members.contains(instance_id))
            .ok_or_else(|| {
                InventoryError::provider(
                    VALIDATION_CODE,
                    format!("Instance Id not found - No managed instance found for instance ID {instance_id}"),
                )
            })?;

        pool.members.remove(instance_id);
        if decrement_desired {
            pool.desired_capacity = pool.desired_capacity.saturating_sub(1).max(pool.min_size);
        }
        if let Some(record) = state.snapshot.instances.get_mut(instance_id) {
            record.state = InstanceState::ShuttingDown;
        }
        Ok(())
    }

    async fn terminate_instances(&self, instance_ids: &[String]) -> InventoryResult<()> {
        let mut state = self.begin(InventoryCall::TerminateInstances {
            instance_ids: instance_ids.to_vec(),
        })?;
        for id in instance_ids {
            let record = state
                .snapshot
                .instances
                .get_mut(id)
                .ok_or_else(|| instance_not_found(id))?;
            record.state = InstanceState::ShuttingDown;

            for fleet in state.snapshot.fleets.values_mut() {
                fleet.active_instances.retain(|active| active != id);
            }
            for pool in state.snapshot.groups.values_mut() {
                pool.members.remove(id);
            }
        }
        Ok(())
    }

    async fn invoke_function(
        &self,
        target: &FunctionTarget,
        payload: &serde_json::Value,
    ) -> InventoryResult<serde_json::Value> {
        let mut state = self.begin(InventoryCall::InvokeFunction {
            target: target.clone(),
            payload: payload.clone(),
        })?;
        state.snapshot.invocations.push(FunctionInvocationRecord {
            function: target.identifier().to_string(),
            region: target.region().to_string(),
            payload: payload.clone(),
        });
        Ok(serde_json::json!({ "status_code": 200 }))
    }
}
