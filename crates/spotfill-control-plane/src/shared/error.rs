use spotfill_core::{CoreError, InventoryError, Operation};
use thiserror::Error;

/// Control plane specific errors
#[derive(Debug, Error)]
pub enum ControlPlaneError {
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error("Stack not found: {0}")]
    StackNotFound(String),
    #[error("Group not found: {0}")]
    GroupNotFound(String),
    #[error("Spot fleet request not found: {0}")]
    FleetNotFound(String),
    #[error("Scaling policy {policy} cannot be executed: only simple scaling policies are supported ({source})")]
    PolicyMisconfigured {
        policy: String,
        #[source]
        source: InventoryError,
    },
    #[error("Inventory call {operation} failed: {source}")]
    InventoryCall {
        operation: Operation,
        #[source]
        source: InventoryError,
    },
}

impl ControlPlaneError {
    /// Attach call context to an inventory failure, for use with `map_err`.
    pub fn inventory(operation: Operation) -> impl FnOnce(InventoryError) -> Self {
        move |source| ControlPlaneError::InventoryCall { operation, source }
    }

    /// The inventory operation that failed, if this error came from one.
    pub fn operation(&self) -> Option<Operation> {
        match self {
            ControlPlaneError::InventoryCall { operation, .. } => Some(*operation),
            _ => None,
        }
    }
}

pub type ControlPlaneResult<T> = std::result::Result<T, ControlPlaneError>;
