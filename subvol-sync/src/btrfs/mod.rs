//! Access to a btrfs filesystem holding the backup hierarchy.
//!
//! Everything the synchronizer does to a filesystem goes through
//! [`SubvolumeHost`]. [`command::CommandHost`] implements it by running
//! `btrfs` and a few coreutils, locally or over ssh.

pub mod command;
pub mod endpoint;
pub mod parse;

#[cfg(test)]
pub mod memory;

pub use command::CommandHost;
pub use endpoint::Endpoint;

use crate::utils::HostError;
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use uuid::Uuid;

/// One entry of a subvolume listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedSubvolume {
    pub id: u64,
    /// Path relative to the filesystem root
    pub path: String,
    pub uuid: Uuid,
    pub parent_uuid: Option<Uuid>,
    pub received_uuid: Option<Uuid>,
}

/// Details of a single subvolume, used to verify a finished receive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShownSubvolume {
    pub uuid: Uuid,
    pub parent_uuid: Option<Uuid>,
    pub received_uuid: Option<Uuid>,
    pub read_only: bool,
}

/// Filesystem fill level
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DiskUsage {
    pub total: u64,
    pub used: u64,
    pub available: u64,
    pub used_percent: f64,
}

/// Resolves once the producing or consuming side of a stream has exited
pub type Completion = BoxFuture<'static, Result<(), HostError>>;

/// Output side of `btrfs send`
pub struct SendStream {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub completion: Completion,
}

/// Input side of `btrfs receive`
pub struct ReceiveStream {
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
    pub completion: Completion,
}

/// Operations on one filesystem root. All paths are relative to the root.
#[async_trait]
pub trait SubvolumeHost: Send + Sync {
    fn endpoint(&self) -> &Endpoint;

    /// Filesystem uuid, `None` if the root is not on btrfs
    async fn filesystem_uuid(&self) -> Result<Option<Uuid>, HostError>;

    /// All subvolumes, or only the read-only ones
    async fn list_subvolumes(&self, read_only: bool) -> Result<Vec<ListedSubvolume>, HostError>;

    async fn show_subvolume(&self, path: &str) -> Result<ShownSubvolume, HostError>;

    async fn delete_subvolume(&self, path: &str) -> Result<(), HostError>;

    /// `mkdir -p`
    async fn create_dir_all(&self, path: &str) -> Result<(), HostError>;

    /// Names of the directories directly below the root
    async fn list_top_dirs(&self) -> Result<Vec<String>, HostError>;

    /// Remove an empty top-level directory
    async fn remove_dir(&self, name: &str) -> Result<(), HostError>;

    async fn disk_usage(&self) -> Result<DiskUsage, HostError>;

    /// Start streaming `path`, as a delta against `parent` when given
    async fn send(&self, path: &str, parent: Option<&str>) -> Result<SendStream, HostError>;

    /// Start materializing a stream as a new subvolume inside `dir`
    async fn receive(&self, dir: &str) -> Result<ReceiveStream, HostError>;
}
