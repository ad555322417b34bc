use crate::shared::error::{ControlPlaneError, ControlPlaneResult};
use crate::shared::types::{MarkedInstance, SpotPool};
use spotfill_core::pagination;
use spotfill_core::{InstanceFilter, InventoryClient, Operation, MARKER_TAG_KEY};
use std::sync::Arc;
use tracing::{debug, info};

/// Finds spot instances carrying the replacement marker
pub struct ScanService {
    inventory: Arc<dyn InventoryClient>,
    spot_pool: SpotPool,
}

impl ScanService {
    pub fn new(inventory: Arc<dyn InventoryClient>, spot_pool: SpotPool) -> Self {
        Self {
            inventory,
            spot_pool,
        }
    }

    /// Running members of the spot pool that carry the marker tag, in listing order.
    pub async fn scan(&self) -> ControlPlaneResult<Vec<MarkedInstance>> {
        let members = self.member_ids().await?;
        if members.is_empty() {
            info!(pool = %self.spot_pool.name(), "Spot pool has no members");
            return Ok(Vec::new());
        }

        debug!(count = members.len(), "Checking spot instances for termination marker");
        let inventory = self.inventory.as_ref();
        let filter = InstanceFilter::running_with_tag(members, MARKER_TAG_KEY);
        let filter = &filter;
        let marked = pagination::collect_all(move |token| inventory.describe_instances(filter, token))
            .await
            .map_err(ControlPlaneError::inventory(Operation::DescribeInstances))?;

        info!(count = marked.len(), "Found instances with termination marker");
        Ok(marked)
    }

    async fn member_ids(&self) -> ControlPlaneResult<Vec<String>> {
        let inventory = self.inventory.as_ref();
        match &self.spot_pool {
            SpotPool::Group(name) => {
                debug!(group = %name, "Listing spot group members");
                let pool = inventory
                    .describe_group(name)
                    .await
                    .map_err(ControlPlaneError::inventory(Operation::DescribeGroup))?
                    .ok_or_else(|| ControlPlaneError::GroupNotFound(name.clone()))?;
                Ok(pool.members.into_iter().collect())
            }
            SpotPool::Fleet(fleet_id) => {
                debug!(fleet_id = %fleet_id, "Listing spot fleet instances");
                let fleet_id = fleet_id.as_str();
                pagination::collect_all(move |token| {
                    inventory.describe_fleet_instances(fleet_id, token)
                })
                .await
                .map_err(ControlPlaneError::inventory(Operation::DescribeFleetInstances))
            }
        }
    }
}
