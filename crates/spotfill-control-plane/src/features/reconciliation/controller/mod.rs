use crate::features::capacity::service::CapacityService;
use crate::features::scale_down::service::ScaleDownService;
use crate::features::scanning::service::ScanService;
use crate::shared::error::ControlPlaneResult;
use crate::shared::types::{PassOutcome, Settings};
use spotfill_core::InventoryClient;
use std::sync::Arc;
use tracing::{info, instrument};

/// Entry point for one reconciliation pass per scheduling tick
pub struct ReconciliationController {
    scanner: Arc<ScanService>,
    capacity: Arc<CapacityService>,
    scale_down: Arc<ScaleDownService>,
}

impl ReconciliationController {
    pub fn new(
        scanner: Arc<ScanService>,
        capacity: Arc<CapacityService>,
        scale_down: Arc<ScaleDownService>,
    ) -> Self {
        Self {
            scanner,
            capacity,
            scale_down,
        }
    }

    /// Wire every service against one inventory.
    pub fn from_settings(inventory: Arc<dyn InventoryClient>, settings: Settings) -> Self {
        let settings = Arc::new(settings);
        let scanner = Arc::new(ScanService::new(
            inventory.clone(),
            settings.spot_pool.clone(),
        ));
        let capacity = Arc::new(CapacityService::new(inventory.clone(), settings.clone()));
        let scale_down = Arc::new(ScaleDownService::new(inventory, settings));

        Self::new(scanner, capacity, scale_down)
    }

    /// Scale up for marked instances, or assess scale-down when there are none.
    #[instrument(skip(self))]
    pub async fn run_pass(&self) -> ControlPlaneResult<PassOutcome> {
        let marked = self.scanner.scan().await?;

        let outcome = if marked.is_empty() {
            PassOutcome::ScaleDown(self.scale_down.down().await?)
        } else {
            let outcome = self.capacity.up(&marked).await?;
            PassOutcome::ScaleUp { marked, outcome }
        };

        info!(noop = outcome.is_noop(), "Reconciliation pass complete");
        Ok(outcome)
    }
}
