pub mod capacity;
pub mod reconciliation;
pub mod scale_down;
pub mod scanning;
