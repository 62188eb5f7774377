//! Subvolume inventory of one filesystem.
//!
//! A scan merges two listings (all subvolumes, read-only subvolumes) into
//! [`SubvolumeNode`]s in enumeration order. Nodes are rebuilt on every run.

pub mod graph;

pub use graph::RelationshipGraph;

use crate::btrfs::SubvolumeHost;
use crate::utils::{InventoryError, SyncError};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tracing::debug;
use uuid::Uuid;

/// Receive leaves a writable staging copy; only a clean finish commits it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    Staging,
    Committed,
}

/// One subvolume as seen during this run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubvolumeNode {
    pub id: u64,
    /// Path relative to the filesystem root, unique per filesystem
    pub path: String,
    pub uuid: Uuid,
    pub parent_uuid: Option<Uuid>,
    pub received_uuid: Option<Uuid>,
    pub read_only: bool,
    pub filesystem_id: Uuid,
}

impl SubvolumeNode {
    pub fn state(&self) -> NodeState {
        if self.read_only {
            NodeState::Committed
        } else {
            NodeState::Staging
        }
    }

    /// Identity a send stream of this node carries, and that a received copy
    /// records as its `received_uuid`
    pub fn stream_uuid(&self) -> Uuid {
        self.received_uuid.unwrap_or(self.uuid)
    }

    /// True if `self` (destination) is a complete received copy of `source`
    pub fn is_copy_of(&self, source: &SubvolumeNode) -> bool {
        self.state() == NodeState::Committed
            && self
                .received_uuid
                .is_some_and(|r| r == source.uuid || Some(r) == source.received_uuid)
    }
}

/// Filesystem uuid of the host's root
pub async fn filesystem_id(host: &dyn SubvolumeHost) -> Result<Uuid, InventoryError> {
    let root = host.endpoint().origin.clone();
    host.filesystem_uuid()
        .await
        .map_err(|source| InventoryError::Enumerate {
            root: root.clone(),
            source,
        })?
        .ok_or(InventoryError::NotBtrfs { root })
}

/// Refuse to run against two remote endpoints or twice the same filesystem.
/// Returns the source and destination filesystem ids.
pub async fn preflight(
    source: &dyn SubvolumeHost,
    destination: &dyn SubvolumeHost,
) -> Result<(Uuid, Uuid), SyncError> {
    if source.endpoint().is_remote() && destination.endpoint().is_remote() {
        return Err(SyncError::Config(
            "the source and destination cannot both be remote".to_string(),
        ));
    }

    let source_id = filesystem_id(source).await?;
    let destination_id = filesystem_id(destination).await?;
    debug!("     Source btrfs uuid {} path {}", source_id, source.endpoint());
    debug!("Destination btrfs uuid {} path {}", destination_id, destination.endpoint());

    if source_id == destination_id {
        return Err(InventoryError::SameFilesystem {
            source_root: source.endpoint().origin.clone(),
            destination_root: destination.endpoint().origin.clone(),
        }
        .into());
    }
    Ok((source_id, destination_id))
}

/// Enumerate every subvolume under the host's root, sorted by subvolume id
pub async fn scan(
    host: &dyn SubvolumeHost,
    filesystem_id: Uuid,
) -> Result<Vec<SubvolumeNode>, InventoryError> {
    let root = host.endpoint().origin.clone();
    let enumerate_err = |source| InventoryError::Enumerate {
        root: root.clone(),
        source,
    };

    debug!("building subvolumes for {}", root);
    let all = host.list_subvolumes(false).await.map_err(enumerate_err)?;
    let read_only: HashSet<u64> = host
        .list_subvolumes(true)
        .await
        .map_err(enumerate_err)?
        .into_iter()
        .map(|s| s.id)
        .collect();

    let mut seen: HashMap<String, u64> = HashMap::with_capacity(all.len());
    let mut nodes = Vec::with_capacity(all.len());
    for listed in all {
        if seen.insert(listed.path.clone(), listed.id).is_some() {
            return Err(InventoryError::DuplicatePath {
                root: root.clone(),
                path: listed.path,
            });
        }
        nodes.push(SubvolumeNode {
            read_only: read_only.contains(&listed.id),
            id: listed.id,
            path: listed.path,
            uuid: listed.uuid,
            parent_uuid: listed.parent_uuid,
            received_uuid: listed.received_uuid,
            filesystem_id,
        });
    }
    nodes.sort_by_key(|n| n.id);

    debug!("{} subvolumes on {}", nodes.len(), root);
    Ok(nodes)
}
