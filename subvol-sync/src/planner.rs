//! Turns the source and destination graphs into an ordered work list.
//!
//! Each read-only source node is classified against the destination:
//! already synchronized, missing, or present with the wrong identity
//! (stale, replaced). Missing nodes are sent incrementally against the
//! nearest ancestor that is available on both sides, or in full when none is.
//! Ancestors are always decided before their descendants, so a chosen parent
//! is either already on the destination or transferred earlier in the plan.

use crate::config::SyncConfig;
use crate::inventory::{RelationshipGraph, SubvolumeNode};
use crate::utils::PlanningError;
use serde::Serialize;
use std::collections::HashSet;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferMode {
    Full,
    Incremental,
}

/// One send/receive to perform
#[derive(Debug, Clone, Serialize)]
pub struct SyncTask {
    pub source: SubvolumeNode,
    pub destination_path: String,
    pub mode: TransferMode,
    pub parent: Option<SubvolumeNode>,
    /// Read-only source ancestors, nearest first; used to rebase the task if
    /// its chosen parent did not make it to the destination
    pub candidates: Vec<SubvolumeNode>,
    /// A destination node with a different identity occupies the path
    pub replaces_stale: bool,
}

impl SyncTask {
    /// Nearest candidate whose copy is known to be on the destination
    pub fn resolve_parent(&self, verified: &HashSet<Uuid>) -> Option<&SubvolumeNode> {
        self.candidates.iter().find(|c| verified.contains(&c.uuid))
    }
}

/// A source node that produces no task
#[derive(Debug, Clone, Serialize)]
pub struct PlanSkip {
    pub path: String,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SkipReason {
    NotReadOnly,
    AlreadySynchronized,
    DestinationProtected,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            SkipReason::NotReadOnly => "not read-only",
            SkipReason::AlreadySynchronized => "already synchronized",
            SkipReason::DestinationProtected => "destination path is protected",
        })
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Plan {
    pub tasks: Vec<SyncTask>,
    pub skips: Vec<PlanSkip>,
    /// Source uuids whose verified copy is already on the destination
    #[serde(skip)]
    pub verified: HashSet<Uuid>,
}

impl Plan {
    pub fn full_count(&self) -> usize {
        self.tasks.iter().filter(|t| t.mode == TransferMode::Full).count()
    }

    pub fn incremental_count(&self) -> usize {
        self.tasks.len() - self.full_count()
    }

    /// Destination paths deleted before their replacing transfer
    pub fn stale(&self) -> Vec<String> {
        self.tasks
            .iter()
            .filter(|t| t.replaces_stale)
            .map(|t| t.destination_path.clone())
            .collect()
    }
}

pub struct SyncPlanner<'a> {
    source: &'a RelationshipGraph,
    destination: &'a RelationshipGraph,
    sync: &'a SyncConfig,
}

impl<'a> SyncPlanner<'a> {
    pub fn new(
        source: &'a RelationshipGraph,
        destination: &'a RelationshipGraph,
        sync: &'a SyncConfig,
    ) -> Self {
        Self {
            source,
            destination,
            sync,
        }
    }

    pub fn plan(&self) -> Result<Plan, PlanningError> {
        let mut plan = Plan::default();
        let mut decided: HashSet<Uuid> = HashSet::new();
        let mut scheduled: HashSet<Uuid> = HashSet::new();
        let stale = self.stale_paths();

        let verified: HashSet<Uuid> = self
            .source
            .nodes()
            .iter()
            .filter(|n| self.on_destination(n, &stale))
            .map(|n| n.uuid)
            .collect();

        for node in self.source.nodes() {
            let chain = self.source.ancestors(&node.uuid)?;
            for current in chain.iter().rev().copied().chain(std::iter::once(node)) {
                if decided.insert(current.uuid) {
                    self.decide(current, &verified, &mut scheduled, &mut plan)?;
                }
            }
        }

        plan.verified = verified;
        debug!(
            "plan: {} tasks ({} full, {} incremental), {} skipped",
            plan.tasks.len(),
            plan.full_count(),
            plan.incremental_count(),
            plan.skips.len()
        );
        Ok(plan)
    }

    fn decide(
        &self,
        node: &SubvolumeNode,
        verified: &HashSet<Uuid>,
        scheduled: &mut HashSet<Uuid>,
        plan: &mut Plan,
    ) -> Result<(), PlanningError> {
        if !node.read_only {
            plan.skips.push(PlanSkip {
                path: node.path.clone(),
                reason: SkipReason::NotReadOnly,
            });
            return Ok(());
        }

        let existing = self.destination.by_path(&node.path);
        if existing.is_some_and(|d| d.is_copy_of(node)) {
            plan.skips.push(PlanSkip {
                path: node.path.clone(),
                reason: SkipReason::AlreadySynchronized,
            });
            return Ok(());
        }
        if existing.is_some() && self.sync.is_protected(&node.path) {
            plan.skips.push(PlanSkip {
                path: node.path.clone(),
                reason: SkipReason::DestinationProtected,
            });
            return Ok(());
        }

        let candidates: Vec<SubvolumeNode> = self
            .source
            .ancestors(&node.uuid)?
            .into_iter()
            .filter(|a| a.read_only)
            .cloned()
            .collect();
        let parent = candidates
            .iter()
            .find(|a| verified.contains(&a.uuid) || scheduled.contains(&a.uuid))
            .cloned();
        let mode = if parent.is_some() {
            TransferMode::Incremental
        } else {
            TransferMode::Full
        };

        scheduled.insert(node.uuid);
        plan.tasks.push(SyncTask {
            source: node.clone(),
            destination_path: node.path.clone(),
            mode,
            parent,
            candidates,
            replaces_stale: existing.is_some(),
        });
        Ok(())
    }

    /// Destination paths occupied by a node that is not a copy of the source
    /// node at the same path
    fn stale_paths(&self) -> HashSet<String> {
        self.source
            .nodes()
            .iter()
            .filter(|n| n.read_only && !self.sync.is_protected(&n.path))
            .filter_map(|n| {
                self.destination
                    .by_path(&n.path)
                    .filter(|d| !d.is_copy_of(n))
                    .map(|d| d.path.clone())
            })
            .collect()
    }

    /// A committed copy of `node` exists on the destination and survives
    /// the stale replacements of this plan
    fn on_destination(&self, node: &SubvolumeNode, stale: &HashSet<String>) -> bool {
        let mut identities = vec![node.uuid];
        identities.extend(node.received_uuid);
        identities.iter().any(|identity| {
            self.destination
                .received_from(identity)
                .any(|d| !stale.contains(&d.path))
        })
    }
}
