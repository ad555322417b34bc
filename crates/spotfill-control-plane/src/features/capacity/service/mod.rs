use crate::shared::error::{ControlPlaneError, ControlPlaneResult};
use crate::shared::types::{
    CapacityChange, GuardReason, MarkedInstance, ScaleUpOutcome, Settings, SpotPool,
};
use chrono::{Duration as ChronoDuration, Utc};
use spotfill_core::weighting::{clamp_desired, replacement_for};
use spotfill_core::{InventoryClient, MetricQuery, Operation, MARKER_TAG_KEY};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Trailing window over which fleet pool health is judged.
pub const FLEET_HEALTH_WINDOW_MINUTES: i64 = 10;
/// A fleet with more eligible pools than this replaces lost capacity on its own.
pub const SUFFICIENT_POOL_COUNT: f64 = 2.0;

/// Grows the on-demand group to cover capacity lost by marked spot instances
pub struct CapacityService {
    inventory: Arc<dyn InventoryClient>,
    settings: Arc<Settings>,
}

impl CapacityService {
    pub fn new(inventory: Arc<dyn InventoryClient>, settings: Arc<Settings>) -> Self {
        Self {
            inventory,
            settings,
        }
    }

    /// Replace the capacity of `instances` in the on-demand group and clear their markers.
    ///
    /// Both guards are evaluated before anything changes. A blocked pass
    /// changes nothing, including the markers, so the next pass sees the same
    /// instances again.
    pub async fn up(&self, instances: &[MarkedInstance]) -> ControlPlaneResult<ScaleUpOutcome> {
        let (stack, fleet) = tokio::join!(self.stack_guard(), self.fleet_guard());
        let reasons: Vec<GuardReason> = [stack?, fleet].into_iter().flatten().collect();
        if !reasons.is_empty() {
            for reason in &reasons {
                info!(%reason, "Skipping on-demand scale-up");
            }
            return Ok(ScaleUpOutcome::Blocked { reasons });
        }

        let group = self.settings.on_demand_group.as_str();
        let pool = self
            .inventory
            .describe_group(group)
            .await
            .map_err(ControlPlaneError::inventory(Operation::DescribeGroup))?
            .ok_or_else(|| ControlPlaneError::GroupNotFound(group.to_string()))?;

        let replacement = replacement_for(instances, self.settings.weights.as_ref())?;
        let final_desired = clamp_desired(pool.desired_capacity, replacement.instances, pool.max_size);
        info!(
            group = %group,
            lost_capacity = replacement.lost_capacity,
            replacements = replacement.instances,
            current_desired = pool.desired_capacity,
            final_desired,
            "Replacing lost spot capacity"
        );

        self.inventory
            .set_desired_capacity(group, final_desired)
            .await
            .map_err(ControlPlaneError::inventory(Operation::SetDesiredCapacity))?;

        let cleared: Vec<String> = instances.iter().map(|instance| instance.id.clone()).collect();
        if !cleared.is_empty() {
            self.inventory
                .delete_tags(&cleared, MARKER_TAG_KEY)
                .await
                .map_err(ControlPlaneError::inventory(Operation::DeleteTags))?;
            debug!(count = cleared.len(), "Cleared termination markers");
        }

        let change = CapacityChange {
            group: group.to_string(),
            previous_desired: pool.desired_capacity,
            final_desired,
            lost_capacity: replacement.lost_capacity,
            replacements: replacement.instances,
            cleared,
        };
        if change.truncated() {
            warn!(group = %group, max_size = pool.max_size, "Desired capacity capped at group max size");
        }

        Ok(ScaleUpOutcome::Adjusted(change))
    }

    async fn stack_guard(&self) -> ControlPlaneResult<Option<GuardReason>> {
        let stack = self.settings.stack_name.as_str();
        let status = self
            .inventory
            .describe_stack_status(stack)
            .await
            .map_err(ControlPlaneError::inventory(Operation::DescribeStackStatus))?
            .ok_or_else(|| ControlPlaneError::StackNotFound(stack.to_string()))?;

        Ok(status.is_in_flux().then(|| GuardReason::StackUpdating {
            stack: stack.to_string(),
            status,
        }))
    }

    async fn fleet_guard(&self) -> Option<GuardReason> {
        let SpotPool::Fleet(fleet_id) = &self.settings.spot_pool else {
            return None;
        };

        self.sufficient_fleet_pools(fleet_id)
            .await
            .then(|| GuardReason::SufficientFleetPools {
                fleet_id: fleet_id.clone(),
            })
    }

    /// True when every per-minute minimum in the window is above the pool threshold.
    /// A window with no datapoints counts as sufficient. A failed lookup counts as
    /// insufficient so that scale-up is not blocked by metrics trouble.
    pub async fn sufficient_fleet_pools(&self, fleet_id: &str) -> bool {
        let query = MetricQuery::eligible_pool_count(
            fleet_id,
            ChronoDuration::minutes(FLEET_HEALTH_WINDOW_MINUTES),
            Utc::now(),
        );

        match self.inventory.metric_minimums(&query).await {
            Ok(minimums) => minimums.iter().all(|minimum| *minimum > SUFFICIENT_POOL_COUNT),
            Err(error) => {
                warn!(fleet_id = %fleet_id, error = %error, "Fleet pool health unavailable, assuming insufficient pools");
                false
            }
        }
    }
}
