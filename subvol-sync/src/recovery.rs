//! Cleanup of receives that never finished.
//!
//! A receive that dies half way leaves a writable subvolume behind. Such a
//! staging node is neither trusted as a copy nor used as a parent; it is
//! deleted before planning so the path is free for a fresh transfer.

use crate::btrfs::SubvolumeHost;
use crate::config::SyncConfig;
use crate::inventory::{NodeState, SubvolumeNode};
use crate::utils::{Result, SyncError};
use tracing::{debug, info, warn};

/// Outcome of one recovery pass
#[derive(Debug, Default)]
pub struct Recovery {
    /// Destination nodes still present afterwards
    pub remaining: Vec<SubvolumeNode>,
    /// Paths of the staging nodes that were (or, in a dry run, would be) deleted
    pub removed: Vec<String>,
    /// Staging nodes that could not be deleted
    pub failed: Vec<String>,
}

pub struct RecoveryGuard<'a> {
    destination: &'a dyn SubvolumeHost,
    sync: &'a SyncConfig,
}

impl<'a> RecoveryGuard<'a> {
    pub fn new(destination: &'a dyn SubvolumeHost, sync: &'a SyncConfig) -> Self {
        Self { destination, sync }
    }

    /// Delete every staging node of `nodes`, deepest path first.
    ///
    /// A failed deletion aborts the run unless errors are ignored, in which
    /// case the node stays in `remaining` and the planner sees it as stale.
    pub async fn recover(&self, nodes: Vec<SubvolumeNode>) -> Result<Recovery> {
        let (mut staging, mut remaining): (Vec<_>, Vec<_>) = nodes
            .into_iter()
            .partition(|n| n.state() == NodeState::Staging && !self.sync.is_protected(&n.path));
        staging.sort_by(|a, b| depth(&b.path).cmp(&depth(&a.path)).then(b.path.cmp(&a.path)));

        let mut recovery = Recovery::default();
        for node in staging {
            let location = self.destination.endpoint().display_path(&node.path);
            if self.sync.dry_run {
                info!("(dry run) NOT deleting incomplete subvolume {}", location);
                recovery.removed.push(node.path);
                continue;
            }

            info!("deleting incomplete subvolume {}", location);
            match self.destination.delete_subvolume(&node.path).await {
                Ok(()) => recovery.removed.push(node.path),
                Err(source) if self.sync.ignore_errors => {
                    warn!("could not delete {}: {} (continuing)", location, source);
                    recovery.failed.push(node.path.clone());
                    remaining.push(node);
                }
                Err(source) => {
                    return Err(SyncError::Delete {
                        path: location,
                        source,
                    })
                }
            }
        }

        remaining.sort_by_key(|n| n.id);
        debug!(
            "recovery: {} removed, {} failed, {} remaining",
            recovery.removed.len(),
            recovery.failed.len(),
            remaining.len()
        );
        recovery.remaining = remaining;
        Ok(recovery)
    }
}

fn depth(path: &str) -> usize {
    path.matches('/').count()
}
