//! Utility modules shared by the synchronizer.

pub mod errors;
pub mod logger;
pub mod prompt;
pub mod shutdown;

pub use errors::{HostError, InventoryError, PlanningError, Result, SyncError, TransferError};
