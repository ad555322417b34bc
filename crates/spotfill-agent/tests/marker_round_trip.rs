use async_trait::async_trait;
use spotfill_agent::{
    ExitStrategy, InstanceMetadataSource, MetadataRepoError, PollOutcome, PollState,
    TerminationWatchService,
};
use spotfill_control_plane::{PassOutcome, ReconciliationController, ScaleUpOutcome};
use spotfill_core::inventory::InstanceRecord;
use spotfill_core::{
    InMemoryInventory, InventoryCall, InventorySnapshot, MarkedInstance, Operation, PollSettings,
    PoolState, RawSettings, Settings, SpotPool, StackStatus, Tag,
};
use std::sync::Arc;
use std::time::Duration;

struct NoticeStub;

#[async_trait]
impl InstanceMetadataSource for NoticeStub {
    async fn termination_notice(&self) -> Result<Option<String>, MetadataRepoError> {
        Ok(Some("2017-02-24T00:54:10Z".to_string()))
    }

    async fn instance_type(&self) -> Result<String, MetadataRepoError> {
        Ok("m3.medium".to_string())
    }

    async fn availability_zone(&self) -> Result<String, MetadataRepoError> {
        Ok("us-east-1a".to_string())
    }
}

fn snapshot() -> InventorySnapshot {
    let mut snapshot = InventorySnapshot::default();
    snapshot.groups.insert(
        "spot-asg".to_string(),
        PoolState::new(2, 0, 4).with_members(["i-123", "i-456"]),
    );
    snapshot
        .groups
        .insert("od-asg".to_string(), PoolState::new(0, 0, 4));
    snapshot
        .stacks
        .insert("my-stack".to_string(), StackStatus::new("CREATE_COMPLETE"));
    snapshot
        .instances
        .insert("i-123".to_string(), InstanceRecord::running("m3.medium"));
    snapshot
        .instances
        .insert("i-456".to_string(), InstanceRecord::running("m3.medium"));
    snapshot
}

#[tokio::test(start_paused = true)]
async fn test_agent_marker_is_found_and_cleared_by_the_pass() {
    let inventory = InMemoryInventory::from_snapshot(snapshot());
    let dir = tempfile::tempdir().unwrap();
    let agent = TerminationWatchService::new(
        Arc::new(NoticeStub),
        Arc::new(inventory.clone()),
        Arc::new(PollSettings {
            instance_id: "i-123".to_string(),
            region: Some("us-east-1".to_string()),
            spot_pool: Some(SpotPool::Group("spot-asg".to_string())),
            termination_delay: Duration::from_secs(90),
            override_target: None,
            notice_endpoint: "http://localhost/notice".to_string(),
            metadata_base: "http://localhost/meta-data/".to_string(),
            semaphore_path: dir.path().join("give-up"),
        }),
    );

    let state = agent.step(PollState::Idle).await.unwrap();
    let tagged = agent.step(state).await.unwrap();
    assert!(matches!(tagged, PollState::Tagged { .. }));

    // The pass runs while the agent waits out its delay.
    let settings = Settings::from_raw(&RawSettings {
        region: Some("us-east-1".to_string()),
        spot_group: Some("spot-asg".to_string()),
        on_demand_group: Some("od-asg".to_string()),
        scale_down_policy: Some("od-down".to_string()),
        stack_name: Some("my-stack".to_string()),
        ..Default::default()
    })
    .unwrap();
    let controller = ReconciliationController::from_settings(Arc::new(inventory.clone()), settings);
    let outcome = controller.run_pass().await.unwrap();

    let PassOutcome::ScaleUp {
        marked,
        outcome: ScaleUpOutcome::Adjusted(change),
    } = outcome
    else {
        panic!("expected the marked instance to be replaced");
    };
    assert_eq!(marked, vec![MarkedInstance::new("i-123", "m3.medium")]);
    assert_eq!(change.final_desired, 1);

    let written = inventory.calls_of(Operation::CreateTags);
    let cleared = inventory.calls_of(Operation::DeleteTags);
    let [InventoryCall::CreateTags { instance_ids: tagged_ids, tag }] = &written[..] else {
        panic!("expected one tag write");
    };
    let [InventoryCall::DeleteTags { instance_ids: cleared_ids, tag_key }] = &cleared[..] else {
        panic!("expected one tag delete");
    };
    assert_eq!(tag, &Tag::new("SpotTermination", "true"));
    assert_eq!(tag.key.as_bytes(), tag_key.as_bytes());
    assert_eq!(tagged_ids, cleared_ids);
    assert!(inventory.snapshot().instances["i-123"].tags.is_empty());

    let exiting = agent.step(tagged).await.unwrap();
    let done = agent.step(exiting).await.unwrap();
    assert!(matches!(
        done,
        PollState::Done(PollOutcome::Exited(ExitStrategy::DelayedGroupTerminate { .. }))
    ));
    assert!(agent.semaphore().is_present());
    assert_eq!(inventory.snapshot().groups["spot-asg"].desired_capacity, 2);
}
