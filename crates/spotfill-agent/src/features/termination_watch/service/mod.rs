use crate::features::termination_watch::repo::{
    InstanceIdentity, InstanceMetadataSource, MetadataRepoError, TerminationSemaphore,
};
use regex::Regex;
use serde_json::json;
use spotfill_core::{
    FunctionTarget, InventoryClient, InventoryError, Operation, PollSettings, SpotPool, Tag,
};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{info, instrument, warn};

/// Caller name reported to an override function.
pub const HANDOFF_CALLER: &str = "self-poll";

#[derive(Debug, thiserror::Error)]
pub enum TerminationWatchError {
    #[error("Termination notice poll failed: {0}")]
    Notice(#[source] MetadataRepoError),
    #[error("Instance metadata unavailable: {0}")]
    Metadata(#[source] MetadataRepoError),
    #[error("Inventory call {operation} failed: {source}")]
    Inventory {
        operation: Operation,
        #[source]
        source: InventoryError,
    },
    #[error("Failed to write termination semaphore {path}: {source}")]
    Semaphore {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl TerminationWatchError {
    fn inventory(operation: Operation) -> impl FnOnce(InventoryError) -> Self {
        move |source| TerminationWatchError::Inventory { operation, source }
    }
}

pub type TerminationWatchResult<T> = std::result::Result<T, TerminationWatchError>;

/// How a tagged instance leaves its spot pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitStrategy {
    /// Hand off to a function and leave the instance running.
    LambdaHandoff(FunctionTarget),
    /// Give the reconciliation pass time to replace capacity, then leave the
    /// group without shrinking it.
    DelayedGroupTerminate { group: String, delay: Duration },
    ImmediateFleetTerminate { fleet_id: String },
    Unconfigured,
}

impl ExitStrategy {
    /// An override target wins over the spot pool kind.
    pub fn select(settings: &PollSettings) -> Self {
        if let Some(target) = &settings.override_target {
            return ExitStrategy::LambdaHandoff(target.clone());
        }
        match &settings.spot_pool {
            Some(SpotPool::Group(group)) => ExitStrategy::DelayedGroupTerminate {
                group: group.clone(),
                delay: settings.termination_delay,
            },
            Some(SpotPool::Fleet(fleet_id)) => ExitStrategy::ImmediateFleetTerminate {
                fleet_id: fleet_id.clone(),
            },
            None => ExitStrategy::Unconfigured,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ExitStrategy::LambdaHandoff(_) => "lambda_handoff",
            ExitStrategy::DelayedGroupTerminate { .. } => "delayed_group_terminate",
            ExitStrategy::ImmediateFleetTerminate { .. } => "immediate_fleet_terminate",
            ExitStrategy::Unconfigured => "unconfigured",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    NoNotice,
    /// The notice endpoint answered with something other than a timestamp.
    NoticeUnintelligible { body: String },
    /// The exit action ran and the semaphore is written.
    Exited(ExitStrategy),
    /// Tagged, but no exit path is configured. The semaphore is not written.
    Unconfigured,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollState {
    Idle,
    NoticeReceived {
        notice: String,
    },
    Tagged {
        identity: InstanceIdentity,
    },
    Exiting {
        strategy: ExitStrategy,
        identity: InstanceIdentity,
    },
    Done(PollOutcome),
}

fn notice_timestamp() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}Z").expect("notice timestamp pattern")
    })
}

pub struct TerminationWatchService {
    metadata: Arc<dyn InstanceMetadataSource>,
    inventory: Arc<dyn InventoryClient>,
    semaphore: TerminationSemaphore,
    settings: Arc<PollSettings>,
}

impl TerminationWatchService {
    pub fn new(
        metadata: Arc<dyn InstanceMetadataSource>,
        inventory: Arc<dyn InventoryClient>,
        settings: Arc<PollSettings>,
    ) -> Self {
        let semaphore = TerminationSemaphore::new(settings.semaphore_path.clone());
        Self {
            metadata,
            inventory,
            semaphore,
            settings,
        }
    }

    pub fn semaphore(&self) -> &TerminationSemaphore {
        &self.semaphore
    }

    /// Drive one poll from `Idle` to `Done`.
    #[instrument(skip(self), fields(instance_id = %self.settings.instance_id))]
    pub async fn run(&self) -> TerminationWatchResult<PollOutcome> {
        let mut state = PollState::Idle;
        loop {
            state = match self.step(state).await? {
                PollState::Done(outcome) => return Ok(outcome),
                next => next,
            };
        }
    }

    /// Perform the transition out of `state`. `Done` is terminal.
    pub async fn step(&self, state: PollState) -> TerminationWatchResult<PollState> {
        match state {
            PollState::Idle => self.poll_notice().await,
            PollState::NoticeReceived { notice } => {
                info!(%notice, "Tagging self with termination notice");
                let (_, identity) = tokio::try_join!(self.tag_self(), self.identity())?;
                Ok(PollState::Tagged { identity })
            }
            PollState::Tagged { identity } => Ok(PollState::Exiting {
                strategy: ExitStrategy::select(&self.settings),
                identity,
            }),
            PollState::Exiting { strategy, identity } => self.exit(strategy, &identity).await,
            done @ PollState::Done(_) => Ok(done),
        }
    }

    async fn poll_notice(&self) -> TerminationWatchResult<PollState> {
        let Some(body) = self
            .metadata
            .termination_notice()
            .await
            .map_err(TerminationWatchError::Notice)?
        else {
            return Ok(PollState::Done(PollOutcome::NoNotice));
        };

        info!(notice = %body, "Received termination notice");
        if !notice_timestamp().is_match(&body) {
            info!("Termination notice is present but not a timestamp, ignoring");
            return Ok(PollState::Done(PollOutcome::NoticeUnintelligible { body }));
        }
        Ok(PollState::NoticeReceived { notice: body })
    }

    async fn tag_self(&self) -> TerminationWatchResult<()> {
        self.inventory
            .create_tags(&[self.settings.instance_id.clone()], &Tag::marker())
            .await
            .map_err(TerminationWatchError::inventory(Operation::CreateTags))
    }

    async fn identity(&self) -> TerminationWatchResult<InstanceIdentity> {
        let instance_type = self
            .metadata
            .instance_type()
            .await
            .map_err(TerminationWatchError::Metadata)?;
        let availability_zone = self
            .metadata
            .availability_zone()
            .await
            .map_err(TerminationWatchError::Metadata)?;

        Ok(InstanceIdentity {
            instance_id: self.settings.instance_id.clone(),
            instance_type,
            availability_zone,
        })
    }

    async fn exit(
        &self,
        strategy: ExitStrategy,
        identity: &InstanceIdentity,
    ) -> TerminationWatchResult<PollState> {
        let instance_id = &identity.instance_id;
        match &strategy {
            ExitStrategy::LambdaHandoff(target) => {
                info!(function = target.identifier(), region = target.region(), "Invoking termination override");
                let payload = json!({
                    "instanceId": instance_id,
                    "availabilityZone": identity.availability_zone,
                    "instanceType": identity.instance_type,
                    "caller": HANDOFF_CALLER,
                    "noTermination": true,
                });
                self.inventory
                    .invoke_function(target, &payload)
                    .await
                    .map_err(TerminationWatchError::inventory(Operation::InvokeFunction))?;
            }
            ExitStrategy::DelayedGroupTerminate { group, delay } => {
                info!(%group, delay = ?delay, "Pausing before leaving the spot group");
                tokio::time::sleep(*delay).await;
                info!(%group, "Terminating self in group");
                self.inventory
                    .terminate_in_group(instance_id, false)
                    .await
                    .map_err(TerminationWatchError::inventory(Operation::TerminateInGroup))?;
            }
            ExitStrategy::ImmediateFleetTerminate { fleet_id } => {
                info!(%fleet_id, "Terminating self");
                self.inventory
                    .terminate_instances(&[instance_id.clone()])
                    .await
                    .map_err(TerminationWatchError::inventory(Operation::TerminateInstances))?;
            }
            ExitStrategy::Unconfigured => {
                warn!(%instance_id, "Tagged, but no override target, spot group or spot fleet is configured; not exiting");
                return Ok(PollState::Done(PollOutcome::Unconfigured));
            }
        }

        self.semaphore
            .write()
            .await
            .map_err(|source| TerminationWatchError::Semaphore {
                path: self.semaphore.path().display().to_string(),
                source,
            })?;
        info!(strategy = strategy.name(), path = %self.semaphore.path().display(), "Termination semaphore written");
        Ok(PollState::Done(PollOutcome::Exited(strategy)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::termination_watch::repo::MockInstanceMetadataSource;
    use spotfill_core::inventory::{InstanceRecord, InventoryCall};
    use spotfill_core::{InMemoryInventory, InventorySnapshot, PoolState, MARKER_TAG_KEY};
    use tempfile::TempDir;

    const NOTICE: &str = "2017-02-24T00:54:10Z";
    const OVERRIDE: &str = "arn:aws:lambda:eu-west-1:123456789012:function:drain";

    fn metadata(notice: Option<&str>) -> MockInstanceMetadataSource {
        let notice = notice.map(str::to_string);
        let mut mock = MockInstanceMetadataSource::new();
        mock.expect_termination_notice()
            .returning(move || Ok(notice.clone()));
        mock.expect_instance_type()
            .returning(|| Ok("r3.8xlarge".to_string()));
        mock.expect_availability_zone()
            .returning(|| Ok("us-east-1a".to_string()));
        mock
    }

    fn inventory() -> InMemoryInventory {
        let mut snapshot = InventorySnapshot::default();
        snapshot
            .instances
            .insert("i-123".to_string(), InstanceRecord::running("r3.8xlarge"));
        snapshot.groups.insert(
            "spot-asg".to_string(),
            PoolState::new(2, 0, 4).with_members(["i-123", "i-456"]),
        );
        InMemoryInventory::from_snapshot(snapshot)
    }

    fn settings(dir: &TempDir, spot_pool: Option<SpotPool>, override_target: Option<&str>) -> PollSettings {
        PollSettings {
            instance_id: "i-123".to_string(),
            region: Some("us-east-1".to_string()),
            spot_pool,
            termination_delay: Duration::from_secs(90),
            override_target: override_target.map(|t| FunctionTarget::parse(t).unwrap()),
            notice_endpoint: "http://localhost/notice".to_string(),
            metadata_base: "http://localhost/meta-data/".to_string(),
            semaphore_path: dir.path().join("give-up"),
        }
    }

    fn service(
        metadata: MockInstanceMetadataSource,
        inventory: &InMemoryInventory,
        settings: PollSettings,
    ) -> TerminationWatchService {
        TerminationWatchService::new(
            Arc::new(metadata),
            Arc::new(inventory.clone()),
            Arc::new(settings),
        )
    }

    fn is_tagged(inventory: &InMemoryInventory) -> bool {
        inventory.snapshot().instances["i-123"]
            .tags
            .contains_key(MARKER_TAG_KEY)
    }

    #[test]
    fn test_strategy_selection_order() {
        let dir = tempfile::tempdir().unwrap();
        let group = Some(SpotPool::Group("spot-asg".to_string()));
        let fleet = Some(SpotPool::Fleet("sfr-1".to_string()));

        assert!(matches!(
            ExitStrategy::select(&settings(&dir, group.clone(), Some(OVERRIDE))),
            ExitStrategy::LambdaHandoff(_)
        ));
        assert_eq!(
            ExitStrategy::select(&settings(&dir, group, None)),
            ExitStrategy::DelayedGroupTerminate {
                group: "spot-asg".to_string(),
                delay: Duration::from_secs(90),
            }
        );
        assert_eq!(
            ExitStrategy::select(&settings(&dir, fleet, None)),
            ExitStrategy::ImmediateFleetTerminate {
                fleet_id: "sfr-1".to_string()
            }
        );
        assert_eq!(
            ExitStrategy::select(&settings(&dir, None, None)),
            ExitStrategy::Unconfigured
        );
    }

    #[tokio::test]
    async fn test_no_notice_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let inventory = inventory();
        let service = service(metadata(None), &inventory, settings(&dir, None, None));

        assert_eq!(service.run().await.unwrap(), PollOutcome::NoNotice);
        assert!(inventory.calls().is_empty());
        assert!(!service.semaphore().is_present());
    }

    #[tokio::test]
    async fn test_non_timestamp_notice_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let inventory = inventory();
        let fleet = Some(SpotPool::Fleet("sfr-1".to_string()));
        let service = service(metadata(Some("<html>ok</html>")), &inventory, settings(&dir, fleet, None));

        assert_eq!(
            service.run().await.unwrap(),
            PollOutcome::NoticeUnintelligible {
                body: "<html>ok</html>".to_string()
            }
        );
        assert!(inventory.calls().is_empty());
        assert!(!service.semaphore().is_present());
    }

    #[tokio::test]
    async fn test_notice_poll_failure_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut mock = MockInstanceMetadataSource::new();
        mock.expect_termination_notice().returning(|| {
            Err(MetadataRepoError::Transport {
                url: "http://localhost/notice".to_string(),
                message: "connection refused".to_string(),
            })
        });
        let inventory = inventory();
        let service = service(mock, &inventory, settings(&dir, None, None));

        let err = service.run().await.unwrap_err();
        assert!(matches!(err, TerminationWatchError::Notice(_)));
        assert!(!service.semaphore().is_present());
    }

    #[tokio::test]
    async fn test_unconfigured_tags_without_exiting() {
        let dir = tempfile::tempdir().unwrap();
        let inventory = inventory();
        let service = service(metadata(Some(NOTICE)), &inventory, settings(&dir, None, None));

        assert_eq!(service.run().await.unwrap(), PollOutcome::Unconfigured);
        assert!(is_tagged(&inventory));
        assert_eq!(inventory.call_count(Operation::TerminateInstances), 0);
        assert_eq!(inventory.call_count(Operation::TerminateInGroup), 0);
        // Known gap: the instance stays tagged with no semaphore.
        assert!(!service.semaphore().is_present());
    }

    #[tokio::test]
    async fn test_fleet_terminates_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let inventory = inventory();
        let fleet = Some(SpotPool::Fleet("sfr-1".to_string()));
        let service = service(metadata(Some(NOTICE)), &inventory, settings(&dir, fleet, None));

        let outcome = service.run().await.unwrap();
        assert!(matches!(
            outcome,
            PollOutcome::Exited(ExitStrategy::ImmediateFleetTerminate { .. })
        ));
        assert!(is_tagged(&inventory));
        assert_eq!(
            inventory.calls_of(Operation::TerminateInstances),
            vec![InventoryCall::TerminateInstances {
                instance_ids: vec!["i-123".to_string()]
            }]
        );
        assert!(service.semaphore().is_present());
    }

    #[tokio::test(start_paused = true)]
    async fn test_group_waits_then_terminates_without_decrement() {
        let dir = tempfile::tempdir().unwrap();
        let inventory = inventory();
        let group = Some(SpotPool::Group("spot-asg".to_string()));
        let service = service(metadata(Some(NOTICE)), &inventory, settings(&dir, group, None));

        let started = tokio::time::Instant::now();
        let outcome = service.run().await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(90));
        assert!(matches!(
            outcome,
            PollOutcome::Exited(ExitStrategy::DelayedGroupTerminate { .. })
        ));
        assert_eq!(
            inventory.calls_of(Operation::TerminateInGroup),
            vec![InventoryCall::TerminateInGroup {
                instance_id: "i-123".to_string(),
                decrement_desired: false,
            }]
        );
        let pool = &inventory.snapshot().groups["spot-asg"];
        assert_eq!(pool.desired_capacity, 2);
        assert!(!pool.members.contains("i-123"));
        assert!(service.semaphore().is_present());
    }

    #[tokio::test]
    async fn test_override_hands_off_with_identity() {
        let dir = tempfile::tempdir().unwrap();
        let inventory = inventory();
        let group = Some(SpotPool::Group("spot-asg".to_string()));
        let service = service(metadata(Some(NOTICE)), &inventory, settings(&dir, group, Some(OVERRIDE)));

        let outcome = service.run().await.unwrap();
        assert!(matches!(outcome, PollOutcome::Exited(ExitStrategy::LambdaHandoff(_))));
        assert_eq!(inventory.call_count(Operation::TerminateInGroup), 0);

        let invocations = inventory.snapshot().invocations;
        assert_eq!(invocations.len(), 1);
        assert_eq!(invocations[0].region, "eu-west-1");
        assert_eq!(
            invocations[0].payload,
            json!({
                "instanceId": "i-123",
                "availabilityZone": "us-east-1a",
                "instanceType": "r3.8xlarge",
                "caller": "self-poll",
                "noTermination": true,
            })
        );
        assert!(service.semaphore().is_present());
    }

    #[tokio::test]
    async fn test_failed_handoff_skips_semaphore() {
        let dir = tempfile::tempdir().unwrap();
        let inventory = inventory();
        inventory.fail_on(
            Operation::InvokeFunction,
            InventoryError::provider("ResourceNotFoundException", "Function not found"),
        );
        let service = service(metadata(Some(NOTICE)), &inventory, settings(&dir, None, Some(OVERRIDE)));

        let err = service.run().await.unwrap_err();
        assert!(matches!(
            err,
            TerminationWatchError::Inventory {
                operation: Operation::InvokeFunction,
                ..
            }
        ));
        assert!(is_tagged(&inventory));
        assert!(!service.semaphore().is_present());
    }

    #[tokio::test]
    async fn test_tag_failure_stops_before_exit() {
        let dir = tempfile::tempdir().unwrap();
        let inventory = inventory();
        inventory.fail_on(
            Operation::CreateTags,
            InventoryError::provider("UnauthorizedOperation", "not allowed"),
        );
        let fleet = Some(SpotPool::Fleet("sfr-1".to_string()));
        let service = service(metadata(Some(NOTICE)), &inventory, settings(&dir, fleet, None));

        let err = service.run().await.unwrap_err();
        assert!(err.to_string().contains("create_tags"));
        assert_eq!(inventory.call_count(Operation::TerminateInstances), 0);
        assert!(!service.semaphore().is_present());
    }

    #[tokio::test]
    async fn test_metadata_failure_stops_before_exit() {
        let dir = tempfile::tempdir().unwrap();
        let mut mock = MockInstanceMetadataSource::new();
        mock.expect_termination_notice()
            .returning(|| Ok(Some(NOTICE.to_string())));
        mock.expect_instance_type().returning(|| {
            Err(MetadataRepoError::EmptyBody {
                url: "http://localhost/meta-data/instance-type".to_string(),
            })
        });
        mock.expect_availability_zone()
            .returning(|| Ok("us-east-1a".to_string()));
        let inventory = inventory();
        let fleet = Some(SpotPool::Fleet("sfr-1".to_string()));
        let service = service(mock, &inventory, settings(&dir, fleet, None));

        let err = service.run().await.unwrap_err();
        assert!(matches!(err, TerminationWatchError::Metadata(_)));
        assert_eq!(inventory.call_count(Operation::TerminateInstances), 0);
        assert!(!service.semaphore().is_present());
    }

    #[tokio::test]
    async fn test_step_walks_the_states() {
        let dir = tempfile::tempdir().unwrap();
        let inventory = inventory();
        let fleet = Some(SpotPool::Fleet("sfr-1".to_string()));
        let service = service(metadata(Some(NOTICE)), &inventory, settings(&dir, fleet, None));

        let state = service.step(PollState::Idle).await.unwrap();
        assert_eq!(
            state,
            PollState::NoticeReceived {
                notice: NOTICE.to_string()
            }
        );
        let state = service.step(state).await.unwrap();
        let PollState::Tagged { identity } = &state else {
            panic!("expected tagged state");
        };
        assert_eq!(identity.availability_zone, "us-east-1a");
        assert_eq!(inventory.call_count(Operation::TerminateInstances), 0);

        let state = service.step(state).await.unwrap();
        assert!(matches!(state, PollState::Exiting { .. }));
        let state = service.step(state).await.unwrap();
        assert!(matches!(state, PollState::Done(PollOutcome::Exited(_))));
        assert_eq!(service.step(state.clone()).await.unwrap(), state);
    }
}
