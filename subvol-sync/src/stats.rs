//! Periodic summary of both filesystems.

use crate::btrfs::SubvolumeHost;
use crate::config::StatsConfig;
use crate::inventory::RelationshipGraph;
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SideStats {
    pub subvolumes: usize,
    pub parents: usize,
    pub orphans: usize,
    /// `None` when the fill level could not be read
    pub used_percent: Option<f64>,
}

impl SideStats {
    pub async fn collect(host: &dyn SubvolumeHost, graph: &RelationshipGraph) -> Self {
        let used_percent = match host.disk_usage().await {
            Ok(usage) => Some(usage.used_percent),
            Err(e) => {
                warn!("could not read disk usage of {}: {}", host.endpoint(), e);
                None
            }
        };
        Self {
            subvolumes: graph.len(),
            parents: graph.parent_count(),
            orphans: graph.orphan_count(),
            used_percent,
        }
    }

    fn line(&self, label: &str, origin: &str) -> String {
        let full = self
            .used_percent
            .map(|p| format!("{:.1}%", p))
            .unwrap_or_else(|| "?%".to_string());
        format!(
            "{:>11} ({} subvols, {} parents, {} orphans, {} full): {}",
            label, self.subvolumes, self.parents, self.orphans, full, origin
        )
    }
}

pub struct StatsReporter<'a> {
    source: &'a dyn SubvolumeHost,
    destination: &'a dyn SubvolumeHost,
    config: &'a StatsConfig,
}

impl<'a> StatsReporter<'a> {
    pub fn new(
        source: &'a dyn SubvolumeHost,
        destination: &'a dyn SubvolumeHost,
        config: &'a StatsConfig,
    ) -> Self {
        Self {
            source,
            destination,
            config,
        }
    }

    /// A periodic report is due after `completed` tasks
    pub fn due(&self, completed: usize) -> bool {
        self.config.interval > 0 && completed > 0 && completed % self.config.interval == 0
    }

    /// Collect and log both sides
    pub async fn report(
        &self,
        source: &RelationshipGraph,
        destination: &RelationshipGraph,
    ) -> (SideStats, SideStats) {
        let src = SideStats::collect(self.source, source).await;
        let dst = SideStats::collect(self.destination, destination).await;
        info!("{}", src.line("Source", &self.source.endpoint().origin));
        info!("{}", dst.line("Destination", &self.destination.endpoint().origin));
        (src, dst)
    }
}
