pub mod cli;
pub mod features;
pub mod shared;

pub use features::reconciliation::controller::ReconciliationController;
pub use shared::error::{ControlPlaneError, ControlPlaneResult};
pub use shared::types::{
    CapacityChange, GuardReason, PassOutcome, ScaleDownOutcome, ScaleUpOutcome,
};
