//! Synchronization run - ties the stages together.
//!
//! One run: check both filesystems, enumerate them, clean up incomplete
//! receives, plan, execute the plan task by task, then deal with strays.
//! Tasks run one at a time; a task may depend on the copy produced by the
//! one before it.

pub mod context;

pub use context::{FailedTask, RunContext, RunSummary};

use crate::btrfs::SubvolumeHost;
use crate::config::Config;
use crate::inventory::{self, RelationshipGraph, SubvolumeNode};
use crate::planner::{Plan, PlanSkip, SyncPlanner, SyncTask};
use crate::recovery::RecoveryGuard;
use crate::stats::StatsReporter;
use crate::stray::StrayReconciler;
use crate::transfer::progress::format_bytes;
use crate::transfer::TransferExecutor;
use crate::utils::prompt::Confirm;
use crate::utils::{Result, SyncError, TransferError};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Plan of a run, as printed by `--json-plan`
#[derive(Debug, Serialize)]
pub struct PlanReport {
    pub source: String,
    pub destination: String,
    /// Incomplete receives a real run would delete first
    pub recover: Vec<String>,
    pub tasks: Vec<SyncTask>,
    pub skips: Vec<PlanSkip>,
    /// Mismatched destination subvolumes replaced by a task
    pub stale: Vec<String>,
    pub strays: Vec<String>,
}

pub struct Synchronizer<'a> {
    source: &'a dyn SubvolumeHost,
    destination: &'a dyn SubvolumeHost,
    config: &'a Config,
    confirm: &'a dyn Confirm,
    cancel: CancellationToken,
}

struct Prepared {
    source_graph: RelationshipGraph,
    destination_graph: RelationshipGraph,
    destination_fs: Uuid,
    recovered: Vec<String>,
    plan: Plan,
}

impl<'a> Synchronizer<'a> {
    pub fn new(
        source: &'a dyn SubvolumeHost,
        destination: &'a dyn SubvolumeHost,
        config: &'a Config,
        confirm: &'a dyn Confirm,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            source,
            destination,
            config,
            confirm,
            cancel,
        }
    }

    /// Execute one full run
    pub async fn run(&self) -> Result<RunSummary> {
        let sync = &self.config.sync;
        let mut ctx = RunContext::new(sync.dry_run);
        info!(
            "synchronizing {} -> {}{}",
            self.source.endpoint(),
            self.destination.endpoint(),
            if sync.dry_run { " (dry run)" } else { "" }
        );

        let stats = StatsReporter::new(self.source, self.destination, &self.config.stats);
        let Prepared {
            source_graph,
            mut destination_graph,
            destination_fs,
            recovered,
            plan,
        } = self.prepare(sync.dry_run).await?;
        ctx.recovered = recovered;
        stats.report(&source_graph, &destination_graph).await;

        info!(
            "{} subvolumes to send ({} full, {} incremental), {} stale, {} skipped",
            plan.tasks.len(),
            plan.full_count(),
            plan.incremental_count(),
            plan.stale().len(),
            plan.skips.len()
        );
        for skip in &plan.skips {
            debug!("skipping {}: {}", skip.path, skip.reason);
        }
        ctx.planned = plan.tasks.len();
        ctx.verified = plan.verified.clone();

        let executor = TransferExecutor::new(
            self.source,
            self.destination,
            sync,
            &self.config.transfer,
            self.cancel.clone(),
        );

        for (index, task) in plan.tasks.iter().enumerate() {
            if self.cancel.is_cancelled() {
                return Err(SyncError::Interrupted);
            }
            debug!("task {}/{}: {}", index + 1, plan.tasks.len(), task.destination_path);

            let parent = self.resolve_parent(task, &ctx);
            match executor.execute(task, parent.as_ref()).await {
                Ok(result) => ctx.record(task.source.uuid, result),
                Err(TransferError::Interrupted { path }) => {
                    warn!("interrupted during {}", path);
                    return Err(SyncError::Interrupted);
                }
                Err(e) if sync.ignore_errors => {
                    error!("{} (continuing)", e);
                    ctx.record_failure(&task.destination_path, e.to_string());
                }
                Err(e) => return Err(e.into()),
            }

            if stats.due(ctx.completed()) {
                if !sync.dry_run {
                    destination_graph = self.rescan(destination_fs, destination_graph).await;
                }
                stats.report(&source_graph, &destination_graph).await;
            }
        }

        let reconciler = StrayReconciler::new(self.source, self.destination, sync, self.confirm);
        let strays = reconciler
            .reconcile(&source_graph, &destination_graph)
            .await?;

        if !sync.dry_run {
            destination_graph = self.rescan(destination_fs, destination_graph).await;
        }
        stats.report(&source_graph, &destination_graph).await;

        let summary = ctx.finish(strays);
        let elapsed = summary.finished - summary.started;
        info!(
            "done in {}s: {} sent ({} full, {} incremental, {}), {} skipped, {} failed, {} stray",
            elapsed.num_seconds(),
            summary.transferred,
            summary.full,
            summary.incremental,
            format_bytes(summary.bytes),
            summary.skipped,
            summary.failed.len(),
            summary.strays.subvolumes.len()
        );
        Ok(summary)
    }

    /// Plan without touching the destination
    pub async fn plan_only(&self) -> Result<PlanReport> {
        let prepared = self.prepare(true).await?;
        let sync = &self.config.sync;
        let reconciler = StrayReconciler::new(self.source, self.destination, sync, self.confirm);
        let strays = reconciler.find_strays(&prepared.source_graph, &prepared.destination_graph);

        Ok(PlanReport {
            source: self.source.endpoint().origin.clone(),
            destination: self.destination.endpoint().origin.clone(),
            recover: prepared.recovered,
            stale: prepared.plan.stale(),
            tasks: prepared.plan.tasks,
            skips: prepared.plan.skips,
            strays,
        })
    }

    async fn prepare(&self, dry_run: bool) -> Result<Prepared> {
        let (source_fs, destination_fs) = inventory::preflight(self.source, self.destination).await?;
        let source_nodes = inventory::scan(self.source, source_fs).await?;
        let destination_nodes = inventory::scan(self.destination, destination_fs).await?;

        let mut sync = self.config.sync.clone();
        sync.dry_run = dry_run;
        let recovery = RecoveryGuard::new(self.destination, &sync)
            .recover(destination_nodes)
            .await?;

        let source_graph = RelationshipGraph::new(source_nodes);
        let destination_graph = RelationshipGraph::new(recovery.remaining);
        let plan = SyncPlanner::new(&source_graph, &destination_graph, &self.config.sync).plan()?;

        Ok(Prepared {
            source_graph,
            destination_graph,
            destination_fs,
            recovered: recovery.removed,
            plan,
        })
    }

    /// Parent for `task` given what has actually reached the destination
    fn resolve_parent(&self, task: &SyncTask, ctx: &RunContext) -> Option<SubvolumeNode> {
        let resolved = task.resolve_parent(&ctx.verified).cloned();
        let planned = task.parent.as_ref().map(|p| p.uuid);
        if resolved.as_ref().map(|p| p.uuid) != planned {
            match &resolved {
                Some(p) => info!("rebasing {} onto {}", task.destination_path, p.path),
                None => info!("rebasing {} to a full send", task.destination_path),
            }
        }
        resolved
    }

    async fn rescan(&self, filesystem_id: Uuid, previous: RelationshipGraph) -> RelationshipGraph {
        match inventory::scan(self.destination, filesystem_id).await {
            Ok(nodes) => RelationshipGraph::new(nodes),
            Err(e) => {
                warn!("could not refresh destination inventory: {}", e);
                previous
            }
        }
    }
}
