//! Send/receive of a single planned task.
//!
//! The send side's output is pumped into the receive side's input by this
//! process, so the same code path serves local and ssh endpoints and the
//! throughput meter sees every byte. A receive only counts once the new
//! subvolume is read-only and carries the source's identity.

pub mod progress;

use crate::btrfs::SubvolumeHost;
use crate::config::{SyncConfig, TransferConfig};
use crate::inventory::SubvolumeNode;
use crate::planner::{SyncTask, TransferMode};
use crate::utils::{HostError, TransferError};
use bytes::BytesMut;
use progress::{format_bytes, format_duration, format_speed, ThroughputMeter};
use serde::Serialize;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const CHUNK_SIZE: usize = 256 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransferOutcome {
    Transferred,
    DryRun,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransferResult {
    pub path: String,
    pub mode: TransferMode,
    /// Parent actually used, after rebasing
    pub parent: Option<String>,
    pub outcome: TransferOutcome,
    pub reason: Option<String>,
    pub bytes: u64,
    #[serde(skip)]
    pub duration: Duration,
}

pub struct TransferExecutor<'a> {
    source: &'a dyn SubvolumeHost,
    destination: &'a dyn SubvolumeHost,
    sync: &'a SyncConfig,
    transfer: &'a TransferConfig,
    cancel: CancellationToken,
}

impl<'a> TransferExecutor<'a> {
    pub fn new(
        source: &'a dyn SubvolumeHost,
        destination: &'a dyn SubvolumeHost,
        sync: &'a SyncConfig,
        transfer: &'a TransferConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            source,
            destination,
            sync,
            transfer,
            cancel,
        }
    }

    /// Run `task`, sending against `parent` when given (full otherwise)
    pub async fn execute(
        &self,
        task: &SyncTask,
        parent: Option<&SubvolumeNode>,
    ) -> Result<TransferResult, TransferError> {
        let path = task.destination_path.as_str();
        let mode = if parent.is_some() {
            TransferMode::Incremental
        } else {
            TransferMode::Full
        };
        let mut result = TransferResult {
            path: path.to_string(),
            mode,
            parent: parent.map(|p| p.path.clone()),
            outcome: TransferOutcome::Transferred,
            reason: None,
            bytes: 0,
            duration: Duration::ZERO,
        };

        if self.cancel.is_cancelled() {
            return Err(TransferError::Interrupted {
                path: path.to_string(),
            });
        }

        let target = self.destination.endpoint().display_path(path);
        if self.sync.dry_run {
            match parent {
                Some(p) => info!("(dry run) NOT sending {} incrementally from {}", target, p.path),
                None => info!("(dry run) NOT sending {} in full", target),
            }
            result.outcome = TransferOutcome::DryRun;
            return Ok(result);
        }

        let prepare = |source: HostError| TransferError::Prepare {
            path: path.to_string(),
            source,
        };

        // the source may have been rotated away since it was listed
        let vanished = match self.source.show_subvolume(&task.source.path).await {
            Ok(shown) if shown.uuid == task.source.uuid => None,
            Ok(shown) => Some(format!("source subvolume was replaced (uuid {})", shown.uuid)),
            Err(e) if e.is_not_found() => Some(format!("source subvolume no longer available: {}", e)),
            Err(e) => return Err(prepare(e)),
        };
        if let Some(reason) = vanished {
            warn!("skipping {}: {}", target, reason);
            result.outcome = TransferOutcome::Skipped;
            result.reason = Some(reason);
            return Ok(result);
        }
        if task.replaces_stale {
            info!("deleting stale subvolume {}", target);
            self.destination.delete_subvolume(path).await.map_err(prepare)?;
        }
        let dir = parent_dir(path);
        if !dir.is_empty() {
            self.destination.create_dir_all(dir).await.map_err(prepare)?;
        }

        match parent {
            Some(p) => info!("sending {} (incremental from {})", target, p.path),
            None => info!("sending {} (full)", target),
        }
        let started = std::time::Instant::now();
        result.bytes = self.stream(task, parent, dir, &target).await?;
        result.duration = started.elapsed();

        self.verify(task).await?;
        let secs = result.duration.as_secs_f64();
        let rate = if secs > 0.0 {
            (result.bytes as f64 / secs) as u64
        } else {
            0
        };
        info!(
            "received {} -- {} in {} ({})",
            target,
            format_bytes(result.bytes),
            format_duration(result.duration.as_secs()),
            format_speed(rate)
        );
        Ok(result)
    }

    async fn stream(
        &self,
        task: &SyncTask,
        parent: Option<&SubvolumeNode>,
        dir: &str,
        label: &str,
    ) -> Result<u64, TransferError> {
        let path = task.destination_path.clone();
        let pipeline = |stage: &str, reason: String| TransferError::Pipeline {
            path: path.clone(),
            reason: format!("{}: {}", stage, reason),
        };

        let send = self
            .source
            .send(&task.source.path, parent.map(|p| p.path.as_str()))
            .await
            .map_err(|e| pipeline("send", e.to_string()))?;
        let receive = self
            .destination
            .receive(dir)
            .await
            .map_err(|e| pipeline("receive", e.to_string()))?;

        let interval = self
            .transfer
            .progress
            .then(|| Duration::from_millis(self.transfer.progress_interval_ms));
        let meter = ThroughputMeter::new(label, interval);

        let running = async {
            tokio::join!(
                pump(send.reader, receive.writer, meter),
                send.completion,
                receive.completion
            )
        };

        tokio::select! {
            _ = self.cancel.cancelled() => {
                warn!("interrupted while sending {}", label);
                Err(TransferError::Interrupted { path: path.clone() })
            }
            (pumped, sent, received) = running => {
                // a dying receive takes the send down with SIGPIPE; its stderr is the real cause
                match (received, sent) {
                    (Err(r), Err(s)) => Err(pipeline("receive", format!("{} (send: {})", r, s))),
                    (Err(r), Ok(())) => Err(pipeline("receive", r.to_string())),
                    (Ok(()), Err(s)) => Err(pipeline("send", s.to_string())),
                    (Ok(()), Ok(())) => pumped.map_err(|e| pipeline("stream", e.to_string())),
                }
            }
        }
    }

    /// The new subvolume must be committed and carry the source identity
    async fn verify(&self, task: &SyncTask) -> Result<(), TransferError> {
        let path = task.destination_path.as_str();
        let fail = |reason: String| TransferError::Verification {
            path: path.to_string(),
            reason,
        };

        let shown = self
            .destination
            .show_subvolume(path)
            .await
            .map_err(|e| fail(e.to_string()))?;
        if !shown.read_only {
            return Err(fail("received subvolume is not read-only".to_string()));
        }
        let expected = task.source.stream_uuid();
        if shown.received_uuid != Some(expected) {
            return Err(fail(format!(
                "received uuid {} does not match {}",
                shown
                    .received_uuid
                    .map(|u| u.to_string())
                    .unwrap_or_else(|| "-".to_string()),
                expected
            )));
        }
        debug!("verified {} (received uuid {})", path, expected);
        Ok(())
    }
}

/// Forward everything from `reader` to `writer`, then close `writer`
async fn pump(
    mut reader: Box<dyn AsyncRead + Send + Unpin>,
    mut writer: Box<dyn AsyncWrite + Send + Unpin>,
    mut meter: ThroughputMeter,
) -> std::io::Result<u64> {
    let mut buf = BytesMut::with_capacity(CHUNK_SIZE);
    loop {
        buf.clear();
        let n = reader.read_buf(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf).await?;
        meter.record(n);
    }
    writer.shutdown().await?;
    Ok(meter.bytes())
}

/// Directory part of a relative subvolume path, empty at the root
fn parent_dir(path: &str) -> &str {
    path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btrfs::memory::MemoryHost;
    use crate::inventory::{filesystem_id, scan, RelationshipGraph};
    use crate::planner::SyncPlanner;
    use std::collections::HashSet;
    use uuid::Uuid;

    struct Fixture {
        source: MemoryHost,
        destination: MemoryHost,
        sync: SyncConfig,
        transfer: TransferConfig,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                source: MemoryHost::new("/src"),
                destination: MemoryHost::new("/dst"),
                sync: SyncConfig::default(),
                transfer: TransferConfig {
                    progress: false,
                    ..TransferConfig::default()
                },
            }
        }

        async fn plan(&self) -> Vec<SyncTask> {
            let s = scan(&self.source, filesystem_id(&self.source).await.unwrap())
                .await
                .unwrap();
            let d = scan(&self.destination, filesystem_id(&self.destination).await.unwrap())
                .await
                .unwrap();
            let (s, d) = (RelationshipGraph::new(s), RelationshipGraph::new(d));
            SyncPlanner::new(&s, &d, &self.sync).plan().unwrap().tasks
        }

        fn executor(&self, cancel: CancellationToken) -> TransferExecutor<'_> {
            TransferExecutor::new(&self.source, &self.destination, &self.sync, &self.transfer, cancel)
        }
    }

    #[test]
    fn test_parent_dir() {
        assert_eq!(parent_dir("client1/100"), "client1");
        assert_eq!(parent_dir("a/b/c"), "a/b");
        assert_eq!(parent_dir("top"), "");
    }

    #[tokio::test]
    async fn test_full_then_incremental() {
        let fx = Fixture::new();
        let a = fx.source.add("client1/100", None, true);
        let b = fx.source.add("client1/101", Some(a), true);
        let tasks = fx.plan().await;
        let executor = fx.executor(CancellationToken::new());

        let first = executor.execute(&tasks[0], None).await.unwrap();
        assert_eq!(first.outcome, TransferOutcome::Transferred);
        assert_eq!(first.mode, TransferMode::Full);
        assert!(first.bytes > 0);

        let second = executor
            .execute(&tasks[1], tasks[1].parent.as_ref())
            .await
            .unwrap();
        assert_eq!(second.mode, TransferMode::Incremental);
        assert_eq!(second.parent.as_deref(), Some("client1/100"));

        let copy_a = fx.destination.get("client1/100").unwrap();
        let copy_b = fx.destination.get("client1/101").unwrap();
        assert!(copy_a.read_only && copy_b.read_only);
        assert_eq!(copy_a.received_uuid, Some(a));
        assert_eq!(copy_b.received_uuid, Some(b));
        assert_eq!(copy_b.parent_uuid, Some(copy_a.uuid));
    }

    #[tokio::test]
    async fn test_dry_run_changes_nothing() {
        let mut fx = Fixture::new();
        fx.source.add("client1/100", None, true);
        fx.sync.dry_run = true;
        let tasks = fx.plan().await;

        let result = fx
            .executor(CancellationToken::new())
            .execute(&tasks[0], None)
            .await
            .unwrap();
        assert_eq!(result.outcome, TransferOutcome::DryRun);
        assert!(fx.destination.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_vanished_source_is_skipped() {
        let fx = Fixture::new();
        fx.source.add("client1/100", None, true);
        let tasks = fx.plan().await;
        fx.source.state().subvolumes.clear();

        let result = fx
            .executor(CancellationToken::new())
            .execute(&tasks[0], None)
            .await
            .unwrap();
        assert_eq!(result.outcome, TransferOutcome::Skipped);
        assert!(fx.destination.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_send_failure_is_pipeline_error() {
        let fx = Fixture::new();
        fx.source.add("client1/100", None, true);
        fx.source.state().fail_send.insert("client1/100".to_string());
        let tasks = fx.plan().await;

        let err = fx
            .executor(CancellationToken::new())
            .execute(&tasks[0], None)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Pipeline { .. }));
        assert!(fx.destination.get("client1/100").is_none());
    }

    #[tokio::test]
    async fn test_truncated_receive_leaves_staging_node() {
        let fx = Fixture::new();
        fx.source.add("client1/100", None, true);
        fx.destination.state().interrupt_receive.insert("100".to_string());
        let tasks = fx.plan().await;

        let err = fx
            .executor(CancellationToken::new())
            .execute(&tasks[0], None)
            .await
            .unwrap_err();
        match err {
            TransferError::Pipeline { reason, .. } => assert!(reason.contains("stream truncated")),
            other => panic!("unexpected error: {:?}", other),
        }
        let left = fx.destination.get("client1/100").unwrap();
        assert!(!left.read_only);
    }

    #[tokio::test]
    async fn test_unreachable_source_is_an_error() {
        let fx = Fixture::new();
        fx.source.add("client1/100", None, true);
        let tasks = fx.plan().await;
        fx.source.state().fail_show.insert("client1/100".to_string());

        let err = fx
            .executor(CancellationToken::new())
            .execute(&tasks[0], None)
            .await
            .unwrap_err();
        match err {
            TransferError::Prepare { source, .. } => {
                assert!(source.to_string().contains("Connection refused"))
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(fx.destination.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_replaced_source_is_skipped() {
        let fx = Fixture::new();
        fx.source.add("client1/100", None, true);
        let tasks = fx.plan().await;
        fx.source.state().subvolumes.clear();
        fx.source.add("client1/100", None, true);

        let result = fx
            .executor(CancellationToken::new())
            .execute(&tasks[0], None)
            .await
            .unwrap();
        assert_eq!(result.outcome, TransferOutcome::Skipped);
        assert!(result.reason.unwrap().contains("replaced"));
    }

    #[tokio::test]
    async fn test_receive_error_is_reported() {
        let fx = Fixture::new();
        fx.source.add("client1/100", None, true);
        fx.destination.state().reject_receive.insert("100".to_string());
        let tasks = fx.plan().await;

        let err = fx
            .executor(CancellationToken::new())
            .execute(&tasks[0], None)
            .await
            .unwrap_err();
        match err {
            TransferError::Pipeline { reason, .. } => {
                assert!(reason.starts_with("receive: "), "{}", reason);
                assert!(reason.contains("No space left on device"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_receive_error_wins_over_broken_pipe() {
        let fx = Fixture::new();
        fx.source.add("client1/100", None, true);
        fx.source.state().sigpipe_send.insert("client1/100".to_string());
        fx.destination.state().reject_receive.insert("100".to_string());
        let tasks = fx.plan().await;

        let err = fx
            .executor(CancellationToken::new())
            .execute(&tasks[0], None)
            .await
            .unwrap_err();
        match err {
            TransferError::Pipeline { reason, .. } => {
                assert!(reason.starts_with("receive: "), "{}", reason);
                assert!(reason.contains("No space left on device"));
                assert!(reason.contains("signal: 13"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_writable_result_fails_verification() {
        let fx = Fixture::new();
        fx.source.add("client1/100", None, true);
        fx.destination.state().skip_readonly.insert("100".to_string());
        let tasks = fx.plan().await;

        let err = fx
            .executor(CancellationToken::new())
            .execute(&tasks[0], None)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Verification { .. }));
    }

    #[tokio::test]
    async fn test_stale_destination_is_replaced() {
        let fx = Fixture::new();
        let a = fx.source.add("client1/100", None, true);
        fx.destination
            .add_with("client1/100", Uuid::new_v4(), None, Some(Uuid::new_v4()), true);
        let tasks = fx.plan().await;
        assert!(tasks[0].replaces_stale);

        fx.executor(CancellationToken::new())
            .execute(&tasks[0], None)
            .await
            .unwrap();
        assert_eq!(
            fx.destination.mutations(),
            vec!["delete client1/100", "mkdir client1", "receive client1/100"]
        );
        assert_eq!(fx.destination.get("client1/100").unwrap().received_uuid, Some(a));
    }

    #[tokio::test]
    async fn test_cancelled_run_is_interrupted() {
        let fx = Fixture::new();
        fx.source.add("client1/100", None, true);
        let tasks = fx.plan().await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = fx.executor(cancel).execute(&tasks[0], None).await.unwrap_err();
        assert!(matches!(err, TransferError::Interrupted { .. }));
        assert!(fx.destination.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_rebased_task_sends_full() {
        let fx = Fixture::new();
        let a = fx.source.add("client1/100", None, true);
        fx.source.add("client1/101", Some(a), true);
        let tasks = fx.plan().await;

        // the parent never arrived, so nothing is verified
        let parent = tasks[1].resolve_parent(&HashSet::new());
        assert!(parent.is_none());
        let result = fx
            .executor(CancellationToken::new())
            .execute(&tasks[1], parent)
            .await
            .unwrap();
        assert_eq!(result.mode, TransferMode::Full);
        assert!(fx.destination.get("client1/101").unwrap().read_only);
    }
}
