//! Command-line surface of the agent binary.

use crate::features::termination_watch::controller::TerminationWatchController;
use crate::features::termination_watch::service::PollOutcome;
use clap::Parser;
use spotfill_core::{InMemoryInventory, PollSettings, RawPollSettings};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

pub type CliResult<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Watch for a spot termination notice, mark this instance and leave gracefully.
#[derive(Debug, Parser)]
#[command(name = "spotfill-agent")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[arg(long, env = "INSTANCE_ID")]
    pub instance_id: Option<String>,

    #[arg(long, env = "AWS_REGION")]
    pub region: Option<String>,

    #[arg(long, env = "SPOT_GROUP")]
    pub spot_group: Option<String>,

    #[arg(long, env = "SPOT_FLEET")]
    pub spot_fleet: Option<String>,

    /// Wait before leaving a spot group, e.g. `90s`. Bare numbers are milliseconds.
    #[arg(long, env = "TERMINATION_POLL_DELAY")]
    pub termination_delay: Option<String>,

    /// Function to hand termination over to instead of exiting.
    #[arg(long, env = "TERMINATION_OVERRIDE_TARGET")]
    pub override_target: Option<String>,

    #[arg(long, env = "SPOTFILL_NOTICE_ENDPOINT")]
    pub notice_endpoint: Option<String>,

    #[arg(long, env = "SPOTFILL_METADATA_BASE")]
    pub metadata_base: Option<String>,

    #[arg(long, env = "SPOTFILL_SEMAPHORE_PATH")]
    pub semaphore_path: Option<PathBuf>,

    /// Inventory snapshot file the tag and exit calls are applied to.
    #[arg(long, env = "SPOTFILL_INVENTORY")]
    pub inventory: PathBuf,

    /// Write the mutated snapshot back to the inventory file.
    #[arg(long)]
    pub write_back: bool,
}

impl Cli {
    pub fn raw_settings(&self) -> RawPollSettings {
        RawPollSettings {
            instance_id: self.instance_id.clone(),
            region: self.region.clone(),
            spot_group: self.spot_group.clone(),
            spot_fleet: self.spot_fleet.clone(),
            termination_delay: self.termination_delay.clone(),
            override_target: self.override_target.clone(),
            notice_endpoint: self.notice_endpoint.clone(),
            metadata_base: self.metadata_base.clone(),
            semaphore_path: self.semaphore_path.clone(),
        }
    }

    pub async fn run(self) -> CliResult<PollOutcome> {
        let settings = PollSettings::from_raw(&self.raw_settings())?;
        info!(
            instance_id = %settings.instance_id,
            region = settings.region.as_deref().unwrap_or("default"),
            spot_pool = settings.spot_pool.as_ref().map(|pool| pool.name()).unwrap_or("none"),
            override_target = settings.override_target.is_some(),
            "Polling for termination notice"
        );

        let inventory = InMemoryInventory::load(&self.inventory)?;
        let controller = TerminationWatchController::from_settings(Arc::new(inventory.clone()), settings)?;
        let outcome = controller.poll_once().await?;

        if self.write_back {
            inventory.save(&self.inventory)?;
            info!(path = %self.inventory.display(), "Inventory snapshot written");
        }
        Ok(outcome)
    }
}
