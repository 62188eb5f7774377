//! Destination entries with no source counterpart.
//!
//! A stray subvolume is a destination path the source no longer has (its
//! retention expired it, usually). Top-level directories that no source
//! subvolume lives under are strays too. Both are only reported unless
//! deletion was asked for.

use crate::btrfs::SubvolumeHost;
use crate::config::SyncConfig;
use crate::inventory::RelationshipGraph;
use crate::utils::prompt::Confirm;
use crate::utils::{InventoryError, Result, SyncError};
use serde::Serialize;
use std::collections::BTreeSet;
use tracing::{info, warn};

#[derive(Debug, Default, Clone, Serialize)]
pub struct StrayReport {
    /// Stray subvolume paths, deepest first
    pub subvolumes: Vec<String>,
    /// Stray top-level directory names
    pub dirs: Vec<String>,
    pub deleted: usize,
    pub failed: usize,
    /// The operator refused the batch
    pub declined: bool,
}

impl StrayReport {
    pub fn is_empty(&self) -> bool {
        self.subvolumes.is_empty() && self.dirs.is_empty()
    }
}

pub struct StrayReconciler<'a> {
    source: &'a dyn SubvolumeHost,
    destination: &'a dyn SubvolumeHost,
    sync: &'a SyncConfig,
    confirm: &'a dyn Confirm,
}

impl<'a> StrayReconciler<'a> {
    pub fn new(
        source: &'a dyn SubvolumeHost,
        destination: &'a dyn SubvolumeHost,
        sync: &'a SyncConfig,
        confirm: &'a dyn Confirm,
    ) -> Self {
        Self {
            source,
            destination,
            sync,
            confirm,
        }
    }

    /// Destination subvolumes whose path does not exist on the source
    pub fn find_strays(&self, source: &RelationshipGraph, destination: &RelationshipGraph) -> Vec<String> {
        let mut strays: Vec<String> = destination
            .nodes()
            .iter()
            .filter(|n| !source.contains_path(&n.path) && !self.sync.is_protected(&n.path))
            .map(|n| n.path.clone())
            .collect();
        strays.sort_by(|a, b| depth(b).cmp(&depth(a)).then(a.cmp(b)));
        strays
    }

    /// Top-level destination directories with no source counterpart
    pub async fn find_stray_dirs(
        &self,
        source: &RelationshipGraph,
        destination: &RelationshipGraph,
    ) -> Result<Vec<String>> {
        let mut wanted: BTreeSet<String> = self
            .source
            .list_top_dirs()
            .await
            .map_err(|e| enumerate(self.source, e))?
            .into_iter()
            .collect();
        wanted.extend(source.nodes().iter().map(|n| top_component(&n.path).to_string()));

        let found = self
            .destination
            .list_top_dirs()
            .await
            .map_err(|e| enumerate(self.destination, e))?;

        Ok(found
            .into_iter()
            .filter(|d| !wanted.contains(d))
            .filter(|d| !self.sync.keep_dirs.iter().any(|k| k == d))
            .filter(|d| !self.sync.is_protected(d))
            // a top-level subvolume shows up as a directory; it is handled as a subvolume
            .filter(|d| !destination.contains_path(d))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect())
    }

    /// Report strays and, when enabled, delete them
    pub async fn reconcile(
        &self,
        source: &RelationshipGraph,
        destination: &RelationshipGraph,
    ) -> Result<StrayReport> {
        let mut report = StrayReport {
            subvolumes: self.find_strays(source, destination),
            dirs: self.find_stray_dirs(source, destination).await?,
            ..StrayReport::default()
        };
        if report.is_empty() {
            return Ok(report);
        }

        let endpoint = self.destination.endpoint();
        if !self.sync.delete_strays {
            for path in &report.subvolumes {
                info!("stray subvolume {} (not deleting)", endpoint.display_path(path));
            }
            for dir in &report.dirs {
                info!("stray directory {} (not deleting)", endpoint.display_path(dir));
            }
            return Ok(report);
        }

        if self.sync.dry_run {
            for path in &report.subvolumes {
                info!("(dry run) NOT deleting stray subvolume {}", endpoint.display_path(path));
            }
            for dir in &report.dirs {
                info!("(dry run) NOT removing stray directory {}", endpoint.display_path(dir));
            }
            return Ok(report);
        }

        if self.sync.interactive {
            let prompt = format!(
                "Delete {} stray subvolume(s) and {} stray directory(ies) on {}?",
                report.subvolumes.len(),
                report.dirs.len(),
                endpoint
            );
            if !self.confirm.confirm(&prompt).await {
                info!("stray deletion declined");
                report.declined = true;
                return Ok(report);
            }
        }

        for path in &report.subvolumes {
            let location = endpoint.display_path(path);
            info!("deleting stray subvolume {}", location);
            match self.destination.delete_subvolume(path).await {
                Ok(()) => report.deleted += 1,
                Err(source) if self.sync.ignore_errors => {
                    warn!("could not delete {}: {} (continuing)", location, source);
                    report.failed += 1;
                }
                Err(source) => {
                    return Err(SyncError::Delete {
                        path: location,
                        source,
                    })
                }
            }
        }

        for dir in &report.dirs {
            let location = endpoint.display_path(dir);
            info!("removing stray directory {}", location);
            match self.destination.remove_dir(dir).await {
                Ok(()) => report.deleted += 1,
                // may hold plain files; never removed recursively
                Err(e) => {
                    warn!("could not remove {}: {}", location, e);
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }
}

fn enumerate(host: &dyn SubvolumeHost, source: crate::utils::HostError) -> SyncError {
    InventoryError::Enumerate {
        root: host.endpoint().origin.clone(),
        source,
    }
    .into()
}

fn depth(path: &str) -> usize {
    path.matches('/').count()
}

fn top_component(path: &str) -> &str {
    path.split('/').next().unwrap_or(path)
}
