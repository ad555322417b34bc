use crate::shared::error::{ControlPlaneError, ControlPlaneResult};
use crate::shared::types::{ScaleDownOutcome, Settings, SpotPool};
use spotfill_core::{InventoryClient, Operation, PolicyExecution, FLEET_FULFILLED};
use std::sync::Arc;
use tracing::{info, warn};

/// Shrinks the on-demand group once the spot pool is back at full strength
pub struct ScaleDownService {
    inventory: Arc<dyn InventoryClient>,
    settings: Arc<Settings>,
}

impl ScaleDownService {
    pub fn new(inventory: Arc<dyn InventoryClient>, settings: Arc<Settings>) -> Self {
        Self {
            inventory,
            settings,
        }
    }

    pub async fn down(&self) -> ControlPlaneResult<ScaleDownOutcome> {
        if !self.spot_pool_fulfilled().await? {
            info!(pool = %self.settings.spot_pool.name(), "Spot pool below target, keeping on-demand capacity");
            return Ok(ScaleDownOutcome::NotRecommended);
        }

        self.execute_scale_down_policy().await
    }

    /// Whether the spot side has reached its target size.
    pub async fn spot_pool_fulfilled(&self) -> ControlPlaneResult<bool> {
        match &self.settings.spot_pool {
            SpotPool::Group(name) => self.group_fulfilled(name).await,
            SpotPool::Fleet(fleet_id) => self.fleet_fulfilled(fleet_id).await,
        }
    }

    async fn group_fulfilled(&self, name: &str) -> ControlPlaneResult<bool> {
        info!(group = %name, "Checking spot group for scale-down");
        let pool = self
            .inventory
            .describe_group(name)
            .await
            .map_err(ControlPlaneError::inventory(Operation::DescribeGroup))?
            .ok_or_else(|| ControlPlaneError::GroupNotFound(name.to_string()))?;

        Ok(pool.member_count() >= pool.desired_capacity as usize)
    }

    async fn fleet_fulfilled(&self, fleet_id: &str) -> ControlPlaneResult<bool> {
        info!(fleet_id = %fleet_id, "Checking spot fleet for scale-down");
        match self.inventory.describe_fleet_request(fleet_id).await {
            Ok(Some(fleet)) => Ok(fleet.activity_status.as_deref() == Some(FLEET_FULFILLED)),
            Ok(None) => Err(ControlPlaneError::FleetNotFound(fleet_id.to_string())),
            Err(error) if error.is_rate_limited() => {
                warn!(fleet_id = %fleet_id, error = %error, "Fleet lookup rate limited, treating as not fulfilled");
                Ok(false)
            }
            Err(error) => Err(ControlPlaneError::inventory(Operation::DescribeFleetRequest)(error)),
        }
    }

    async fn execute_scale_down_policy(&self) -> ControlPlaneResult<ScaleDownOutcome> {
        let policy = self.settings.scale_down_policy.as_str();
        let request = PolicyExecution::honoring_cooldown(policy, &self.settings.on_demand_group);
        info!(group = %self.settings.on_demand_group, policy = %policy, "Scaling down on-demand group");

        match self.inventory.execute_policy(&request).await {
            Ok(()) => Ok(ScaleDownOutcome::ScaledDown {
                policy: policy.to_string(),
            }),
            Err(error) if error.is_cooldown_active() => {
                info!(policy = %policy, "Scale-down prevented by cooldown period");
                Ok(ScaleDownOutcome::CooldownActive {
                    policy: policy.to_string(),
                })
            }
            Err(error) if error.is_step_scaling_rejection() => {
                Err(ControlPlaneError::PolicyMisconfigured {
                    policy: policy.to_string(),
                    source: error,
                })
            }
            Err(error) => Err(ControlPlaneError::inventory(Operation::ExecutePolicy)(error)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spotfill_core::inventory::{FleetRecord, PolicyKind, ScalingPolicyRecord};
    use spotfill_core::{
        InMemoryInventory, InventoryCall, InventoryError, InventorySnapshot, PoolState,
    };

    fn settings(spot_pool: SpotPool, policy: &str) -> Arc<Settings> {
        Arc::new(Settings {
            region: Some("us-east-1".to_string()),
            spot_pool,
            on_demand_group: "od-asg".to_string(),
            scale_down_policy: policy.to_string(),
            stack_name: "my-stack".to_string(),
            weights: None,
        })
    }

    fn snapshot(spot_members: &[&str], spot_desired: u32) -> InventorySnapshot {
        let mut snapshot = InventorySnapshot::default();
        snapshot.groups.insert(
            "spot-asg".to_string(),
            PoolState::new(spot_desired, 0, 10).with_members(spot_members.iter().copied()),
        );
        snapshot
            .groups
            .insert("od-asg".to_string(), PoolState::new(4, 1, 10));
        snapshot.policies.insert(
            "od-down".to_string(),
            ScalingPolicyRecord {
                group: "od-asg".to_string(),
                kind: PolicyKind::Simple,
                adjustment: -1,
                cooldown_active: false,
            },
        );
        snapshot
    }

    fn fleet(snapshot: &mut InventorySnapshot, status: Option<&str>) {
        snapshot.fleets.insert(
            "sfr-1".to_string(),
            FleetRecord {
                activity_status: status.map(str::to_string),
                ..Default::default()
            },
        );
    }

    fn service(inventory: &InMemoryInventory, settings: Arc<Settings>) -> ScaleDownService {
        ScaleDownService::new(Arc::new(inventory.clone()), settings)
    }

    fn group() -> SpotPool {
        SpotPool::Group("spot-asg".to_string())
    }

    #[tokio::test]
    async fn test_full_group_scales_down() {
        let inventory = InMemoryInventory::from_snapshot(snapshot(&["i-1", "i-2"], 2));
        let outcome = service(&inventory, settings(group(), "od-down")).down().await.unwrap();

        assert_eq!(
            outcome,
            ScaleDownOutcome::ScaledDown {
                policy: "od-down".to_string()
            }
        );
        assert_eq!(inventory.snapshot().groups["od-asg"].desired_capacity, 3);
        assert_eq!(
            inventory.calls_of(Operation::ExecutePolicy),
            vec![InventoryCall::ExecutePolicy {
                request: PolicyExecution {
                    policy_name: "od-down".to_string(),
                    group_name: Some("od-asg".to_string()),
                    honor_cooldown: true,
                }
            }]
        );
    }

    #[tokio::test]
    async fn test_short_group_does_not_scale_down() {
        let inventory = InMemoryInventory::from_snapshot(snapshot(&["i-1", "i-2"], 3));
        let outcome = service(&inventory, settings(group(), "od-down")).down().await.unwrap();

        assert_eq!(outcome, ScaleDownOutcome::NotRecommended);
        assert_eq!(inventory.call_count(Operation::ExecutePolicy), 0);
    }

    #[tokio::test]
    async fn test_fleet_fulfilled_scales_down() {
        let mut snap = snapshot(&[], 0);
        fleet(&mut snap, Some("fulfilled"));
        let inventory = InMemoryInventory::from_snapshot(snap);
        let outcome = service(&inventory, settings(SpotPool::Fleet("sfr-1".to_string()), "od-down"))
            .down()
            .await
            .unwrap();

        assert!(matches!(outcome, ScaleDownOutcome::ScaledDown { .. }));
    }

    #[tokio::test]
    async fn test_fleet_other_statuses_do_not_scale_down() {
        for status in [Some("pending_fulfillment"), Some("error"), Some("Fulfilled"), None] {
            let mut snap = snapshot(&[], 0);
            fleet(&mut snap, status);
            let inventory = InMemoryInventory::from_snapshot(snap);
            let outcome =
                service(&inventory, settings(SpotPool::Fleet("sfr-1".to_string()), "od-down"))
                    .down()
                    .await
                    .unwrap();

            assert_eq!(outcome, ScaleDownOutcome::NotRecommended, "status {status:?}");
        }
    }

    #[tokio::test]
    async fn test_fleet_rate_limit_is_not_fulfilled() {
        let mut snap = snapshot(&[], 0);
        fleet(&mut snap, Some("fulfilled"));
        let inventory = InMemoryInventory::from_snapshot(snap);
        inventory.fail_on(
            Operation::DescribeFleetRequest,
            InventoryError::provider("RequestLimitExceeded", "Request limit exceeded."),
        );

        let outcome = service(&inventory, settings(SpotPool::Fleet("sfr-1".to_string()), "od-down"))
            .down()
            .await
            .unwrap();
        assert_eq!(outcome, ScaleDownOutcome::NotRecommended);
    }

    #[tokio::test]
    async fn test_fleet_lookup_failure_is_fatal() {
        let inventory = InMemoryInventory::from_snapshot(snapshot(&[], 0));
        inventory.fail_on(
            Operation::DescribeFleetRequest,
            InventoryError::Transport("connection reset".to_string()),
        );

        let err = service(&inventory, settings(SpotPool::Fleet("sfr-1".to_string()), "od-down"))
            .down()
            .await
            .unwrap_err();
        assert_eq!(err.operation(), Some(Operation::DescribeFleetRequest));
    }

    #[tokio::test]
    async fn test_cooldown_is_success_with_single_attempt() {
        let mut snap = snapshot(&["i-1"], 1);
        snap.policies.get_mut("od-down").unwrap().cooldown_active = true;
        let inventory = InMemoryInventory::from_snapshot(snap);

        let outcome = service(&inventory, settings(group(), "od-down")).down().await.unwrap();
        assert!(matches!(outcome, ScaleDownOutcome::CooldownActive { .. }));
        assert_eq!(inventory.call_count(Operation::ExecutePolicy), 1);
        assert_eq!(inventory.snapshot().groups["od-asg"].desired_capacity, 4);
    }

    #[tokio::test]
    async fn test_step_scaling_policy_is_misconfigured() {
        let mut snap = snapshot(&["i-1"], 1);
        snap.policies.get_mut("od-down").unwrap().kind = PolicyKind::Step;
        let inventory = InMemoryInventory::from_snapshot(snap);

        let err = service(&inventory, settings(group(), "od-down")).down().await.unwrap_err();
        assert!(matches!(err, ControlPlaneError::PolicyMisconfigured { .. }));
        let message = err.to_string();
        assert!(message.contains("only simple scaling policies are supported"));
        assert!(message.contains("StepScaling"));
    }

    #[tokio::test]
    async fn test_other_policy_failures_carry_context() {
        let inventory = InMemoryInventory::from_snapshot(snapshot(&["i-1"], 1));
        let err = service(&inventory, settings(group(), "missing-policy"))
            .down()
            .await
            .unwrap_err();

        assert_eq!(err.operation(), Some(Operation::ExecutePolicy));
        assert!(err.to_string().contains("No such policy"));
    }

    #[tokio::test]
    async fn test_arn_policy_omits_group_name() {
        let arn = "arn:aws:autoscaling:us-east-1:123:scalingPolicy:abc:autoScalingGroupName/od-asg:policyName/od-down";
        let mut snap = snapshot(&["i-1"], 1);
        let record = snap.policies.remove("od-down").unwrap();
        snap.policies.insert(arn.to_string(), record);
        let inventory = InMemoryInventory::from_snapshot(snap);

        service(&inventory, settings(group(), arn)).down().await.unwrap();
        let calls = inventory.calls_of(Operation::ExecutePolicy);
        let InventoryCall::ExecutePolicy { request } = &calls[0] else {
            panic!("unexpected call");
        };
        assert!(request.group_name.is_none());
    }
}
