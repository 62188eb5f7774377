//! Error types for subvolume synchronization.
//!
//! Each stage of a run has its own error enum so callers can tell fatal
//! failures (inventory, planning) from per-task ones (transfer).

use thiserror::Error;

/// Top-level error for one synchronization run
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Inventory error: {0}")]
    Inventory(#[from] InventoryError),

    #[error("Planning error: {0}")]
    Planning(#[from] PlanningError),

    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("Deletion of \"{path}\" failed: {source}")]
    Delete {
        path: String,
        #[source]
        source: HostError,
    },

    #[error("Run interrupted by operator")]
    Interrupted,
}

/// A command issued against a source or destination host failed
#[derive(Error, Debug, Clone)]
pub enum HostError {
    #[error("could not start `{command}`: {reason}")]
    Spawn { command: String, reason: String },

    #[error("`{command}` exited with {status}: {stderr}")]
    Failed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("unexpected output from `{command}`: {reason}")]
    Output { command: String, reason: String },
}

/// Enumerating a filesystem's subvolumes failed
#[derive(Error, Debug)]
pub enum InventoryError {
    #[error("could not enumerate subvolumes of {root}: {source}")]
    Enumerate {
        root: String,
        #[source]
        source: HostError,
    },

    #[error("{root} is not a btrfs filesystem (no filesystem uuid)")]
    NotBtrfs { root: String },

    #[error("{source_root} and {destination_root} are the same filesystem")]
    SameFilesystem {
        source_root: String,
        destination_root: String,
    },

    #[error("malformed subvolume listing line {line:?}: {reason}")]
    Parse { line: String, reason: String },

    #[error("duplicate subvolume path \"{path}\" on {root}")]
    DuplicatePath { root: String, path: String },
}

/// The relationship graph cannot be ordered
#[derive(Error, Debug, PartialEq, Eq)]
pub enum PlanningError {
    #[error("cyclic parent reference reached from \"{path}\"")]
    Cycle { path: String },
}

/// One send/receive pipeline failed
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("send/receive of \"{path}\" failed: {reason}")]
    Pipeline { path: String, reason: String },

    #[error("verification of \"{path}\" failed: {reason}")]
    Verification { path: String, reason: String },

    #[error("could not prepare \"{path}\": {source}")]
    Prepare {
        path: String,
        #[source]
        source: HostError,
    },

    #[error("transfer of \"{path}\" interrupted")]
    Interrupted { path: String },
}

impl HostError {
    /// The command ran and reported that its target does not exist
    pub fn is_not_found(&self) -> bool {
        match self {
            HostError::Failed { stderr, .. } => {
                stderr.contains("No such file or directory") || stderr.contains("not a subvolume")
            }
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
