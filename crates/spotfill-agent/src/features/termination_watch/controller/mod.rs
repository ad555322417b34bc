use std::sync::Arc;

use spotfill_core::{InventoryClient, PollSettings};
use tracing::{info, warn};

use crate::features::termination_watch::repo::{MetadataRepoError, ReqwestMetadataSource};
use crate::features::termination_watch::service::{
    PollOutcome, TerminationWatchResult, TerminationWatchService,
};

#[derive(Clone)]
pub struct TerminationWatchController {
    service: Arc<TerminationWatchService>,
}

impl TerminationWatchController {
    pub fn new(service: Arc<TerminationWatchService>) -> Self {
        Self { service }
    }

    /// Poll the instance's own metadata service over HTTP.
    pub fn from_settings(
        inventory: Arc<dyn InventoryClient>,
        settings: PollSettings,
    ) -> Result<Self, MetadataRepoError> {
        let metadata = ReqwestMetadataSource::new(
            settings.notice_endpoint.clone(),
            settings.metadata_base.clone(),
        )?;
        let service = TerminationWatchService::new(
            Arc::new(metadata),
            inventory,
            Arc::new(settings),
        );
        Ok(Self::new(Arc::new(service)))
    }

    /// One pass through the poll state machine. Scheduling the next poll is up to the caller.
    pub async fn poll_once(&self) -> TerminationWatchResult<PollOutcome> {
        let outcome = self.service.run().await?;
        match &outcome {
            PollOutcome::NoNotice => info!("No termination notice"),
            PollOutcome::NoticeUnintelligible { body } => {
                info!(%body, "Ignored termination notice")
            }
            PollOutcome::Exited(strategy) => info!(strategy = strategy.name(), "Exit initiated"),
            PollOutcome::Unconfigured => {
                warn!("Instance tagged but left running; configure a spot pool or override target")
            }
        }
        Ok(outcome)
    }
}
