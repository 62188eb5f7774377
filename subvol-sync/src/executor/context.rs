//! Bookkeeping for one synchronization run.

use crate::planner::TransferMode;
use crate::stray::StrayReport;
use crate::transfer::{TransferOutcome, TransferResult};
use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::HashSet;
use uuid::Uuid;

/// A task that failed while errors were being ignored
#[derive(Debug, Clone, Serialize)]
pub struct FailedTask {
    pub path: String,
    pub error: String,
}

/// What a run did, returned to the caller
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub started: DateTime<Local>,
    pub finished: DateTime<Local>,
    pub dry_run: bool,
    pub planned: usize,
    pub transferred: usize,
    pub full: usize,
    pub incremental: usize,
    pub bytes: u64,
    pub skipped: usize,
    pub failed: Vec<FailedTask>,
    pub recovered: Vec<String>,
    pub strays: StrayReport,
}

impl RunSummary {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    /// Process exit status for a run that finished. Failures that were
    /// ignored on request do not make the run fail.
    pub fn exit_status(&self, ignore_errors: bool) -> u8 {
        if self.is_clean() || ignore_errors {
            0
        } else {
            1
        }
    }
}

pub struct RunContext {
    pub started: DateTime<Local>,
    pub dry_run: bool,
    pub planned: usize,
    pub results: Vec<TransferResult>,
    pub failed: Vec<FailedTask>,
    pub recovered: Vec<String>,
    /// Source uuids whose copy is on the destination, as of now
    pub verified: HashSet<Uuid>,
}

impl RunContext {
    pub fn new(dry_run: bool) -> Self {
        Self {
            started: Local::now(),
            dry_run,
            planned: 0,
            results: Vec::new(),
            failed: Vec::new(),
            recovered: Vec::new(),
            verified: HashSet::new(),
        }
    }

    /// Tasks finished so far, successful or not
    pub fn completed(&self) -> usize {
        self.results.len() + self.failed.len()
    }

    pub fn record(&mut self, source_uuid: Uuid, result: TransferResult) {
        if result.outcome != TransferOutcome::Skipped {
            self.verified.insert(source_uuid);
        }
        self.results.push(result);
    }

    pub fn record_failure(&mut self, path: &str, error: String) {
        self.failed.push(FailedTask {
            path: path.to_string(),
            error,
        });
    }

    pub fn finish(self, strays: StrayReport) -> RunSummary {
        let done = |r: &&TransferResult| r.outcome != TransferOutcome::Skipped;
        RunSummary {
            started: self.started,
            finished: Local::now(),
            dry_run: self.dry_run,
            planned: self.planned,
            transferred: self.results.iter().filter(done).count(),
            full: self
                .results
                .iter()
                .filter(done)
                .filter(|r| r.mode == TransferMode::Full)
                .count(),
            incremental: self
                .results
                .iter()
                .filter(done)
                .filter(|r| r.mode == TransferMode::Incremental)
                .count(),
            bytes: self.results.iter().map(|r| r.bytes).sum(),
            skipped: self
                .results
                .iter()
                .filter(|r| r.outcome == TransferOutcome::Skipped)
                .count(),
            failed: self.failed,
            recovered: self.recovered,
            strays,
        }
    }
}
