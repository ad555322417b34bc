//! Command-line surface of the control plane binary.

use crate::features::reconciliation::controller::ReconciliationController;
use crate::shared::types::PassOutcome;
use clap::{Args, Parser, Subcommand};
use spotfill_core::template::{self, TemplateOptions};
use spotfill_core::{CoreError, InMemoryInventory, RawSettings, Settings};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

pub type CliResult<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Keep an on-demand group sized for capacity lost from its spot pool.
#[derive(Debug, Parser)]
#[command(name = "spotfill-control-plane")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run one reconciliation pass.
    Reconcile(ReconcileArgs),
    /// Print the deployment template fragment for the scheduled pass.
    Template(TemplateArgs),
}

#[derive(Debug, Args)]
pub struct ReconcileArgs {
    #[arg(long, env = "AWS_REGION")]
    pub region: Option<String>,

    /// Spot auto scaling group name. Exclusive with --spot-fleet.
    #[arg(long, env = "SPOT_GROUP")]
    pub spot_group: Option<String>,

    /// Spot fleet request id. Exclusive with --spot-group.
    #[arg(long, env = "SPOT_FLEET")]
    pub spot_fleet: Option<String>,

    #[arg(long, env = "ON_DEMAND_GROUP")]
    pub on_demand_group: Option<String>,

    /// Simple scaling policy that shrinks the on-demand group.
    #[arg(long, env = "ON_DEMAND_SCALE_DOWN_POLICY")]
    pub scale_down_policy: Option<String>,

    #[arg(long, env = "STACK_NAME")]
    pub stack_name: Option<String>,

    /// Space-separated spot instance types, aligned with --spot-instance-weights.
    #[arg(long, env = "SPOT_INSTANCE_TYPES")]
    pub spot_instance_types: Option<String>,

    #[arg(long, env = "SPOT_INSTANCE_WEIGHTS")]
    pub spot_instance_weights: Option<String>,

    #[arg(long, env = "ON_DEMAND_WEIGHT")]
    pub on_demand_weight: Option<String>,

    /// Inventory snapshot file to reconcile against.
    #[arg(long, env = "SPOTFILL_INVENTORY")]
    pub inventory: PathBuf,

    /// Write the mutated snapshot back to the inventory file.
    #[arg(long)]
    pub write_back: bool,
}

impl ReconcileArgs {
    pub fn raw_settings(&self) -> RawSettings {
        RawSettings {
            region: self.region.clone(),
            spot_group: self.spot_group.clone(),
            spot_fleet: self.spot_fleet.clone(),
            on_demand_group: self.on_demand_group.clone(),
            scale_down_policy: self.scale_down_policy.clone(),
            stack_name: self.stack_name.clone(),
            spot_instance_types: self.spot_instance_types.clone(),
            spot_instance_weights: self.spot_instance_weights.clone(),
            on_demand_weight: self.on_demand_weight.clone(),
        }
    }
}

#[derive(Debug, Args)]
pub struct TemplateArgs {
    /// JSON file holding the template options.
    #[arg(long)]
    pub options: PathBuf,
}

impl Cli {
    /// Run the selected command and return what it prints.
    pub async fn run(self) -> CliResult<String> {
        match self.command {
            Command::Reconcile(args) => {
                let outcome = reconcile(&args).await?;
                Ok(serde_json::to_string_pretty(&outcome)?)
            }
            Command::Template(args) => {
                let rendered = render_template(&args.options)?;
                Ok(serde_json::to_string_pretty(&rendered)?)
            }
        }
    }
}

pub async fn reconcile(args: &ReconcileArgs) -> CliResult<PassOutcome> {
    let settings = Settings::from_raw(&args.raw_settings())?;
    info!(
        region = settings.region.as_deref().unwrap_or("default"),
        spot_pool = %settings.spot_pool.name(),
        kind = settings.spot_pool.kind(),
        on_demand_group = %settings.on_demand_group,
        weighted = settings.weights.is_some(),
        "Starting reconciliation pass"
    );

    let inventory = InMemoryInventory::load(&args.inventory)?;
    let controller = ReconciliationController::from_settings(Arc::new(inventory.clone()), settings);
    let outcome = controller.run_pass().await?;

    if args.write_back {
        inventory.save(&args.inventory)?;
        info!(path = %args.inventory.display(), "Inventory snapshot written");
    }
    Ok(outcome)
}

pub fn render_template(path: &Path) -> CliResult<serde_json::Value> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        CoreError::SerializationError(format!("failed to read {}: {e}", path.display()))
    })?;
    let options: TemplateOptions = serde_json::from_str(&raw).map_err(|e| {
        CoreError::SerializationError(format!("failed to parse {}: {e}", path.display()))
    })?;
    Ok(template::render(&options)?)
}
