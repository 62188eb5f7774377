//! Subvolume hierarchy synchronizer
//!
//! Clones a btrfs backup tree (snapshots linked by parent uuids) onto an
//! independent btrfs filesystem using incremental send/receive, preserving
//! the parent relationships so later runs stay incremental.

pub mod btrfs;
pub mod config;
pub mod executor;
pub mod inventory;
pub mod planner;
pub mod recovery;
pub mod stats;
pub mod stray;
pub mod transfer;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use executor::{RunSummary, Synchronizer};
pub use utils::errors::{Result, SyncError};
