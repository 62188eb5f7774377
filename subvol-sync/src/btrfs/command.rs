//! [`SubvolumeHost`] backed by the `btrfs` command line tool.

use super::parse::{parse_df, parse_filesystem_uuid, parse_list, parse_show};
use super::{
    DiskUsage, Endpoint, ListedSubvolume, ReceiveStream, SendStream, ShownSubvolume,
    SubvolumeHost,
};
use crate::utils::HostError;
use async_trait::async_trait;
use std::process::{Output, Stdio};
use tokio::process::Child;
use tracing::trace;
use uuid::Uuid;

/// Runs commands against a local or ssh endpoint
#[derive(Debug, Clone)]
pub struct CommandHost {
    endpoint: Endpoint,
}

impl CommandHost {
    pub fn new(endpoint: Endpoint) -> Self {
        Self { endpoint }
    }

    /// Run to completion and return stdout, failing on a non-zero exit
    async fn run(&self, args: Vec<String>) -> Result<String, HostError> {
        let described = self.endpoint.describe(&args);
        trace!("running: {}", described);

        let output = self
            .endpoint
            .command(&args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| HostError::Spawn {
                command: described.clone(),
                reason: e.to_string(),
            })?;

        check_output(&described, &output)?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn spawn(&self, args: &[String], stdin: Stdio, stdout: Stdio) -> Result<(Child, String), HostError> {
        let described = self.endpoint.describe(args);
        trace!("spawning: {}", described);

        let child = self
            .endpoint
            .command(args)
            .stdin(stdin)
            .stdout(stdout)
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| HostError::Spawn {
                command: described.clone(),
                reason: e.to_string(),
            })?;
        Ok((child, described))
    }

    fn btrfs(&self, args: &[&str]) -> Vec<String> {
        std::iter::once("btrfs")
            .chain(args.iter().copied())
            .map(str::to_string)
            .collect()
    }
}

fn check_output(described: &str, output: &Output) -> Result<(), HostError> {
    if output.status.success() {
        return Ok(());
    }
    Err(HostError::Failed {
        command: described.to_string(),
        status: output.status.to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}

#[async_trait]
impl SubvolumeHost for CommandHost {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn filesystem_uuid(&self) -> Result<Option<Uuid>, HostError> {
        let root = self.endpoint.root.clone();
        let out = self.run(self.btrfs(&["filesystem", "show", &root])).await?;
        Ok(parse_filesystem_uuid(&out))
    }

    async fn list_subvolumes(&self, read_only: bool) -> Result<Vec<ListedSubvolume>, HostError> {
        let root = self.endpoint.root.clone();
        let flags = if read_only { "-qRur" } else { "-qRu" };
        let args = self.btrfs(&["subvolume", "list", flags, &root]);
        let described = self.endpoint.describe(&args);
        let out = self.run(args).await?;
        parse_list(&out).map_err(|e| HostError::Output {
            command: described,
            reason: e.to_string(),
        })
    }

    async fn show_subvolume(&self, path: &str) -> Result<ShownSubvolume, HostError> {
        let full = self.endpoint.join(path);
        let args = self.btrfs(&["subvolume", "show", &full]);
        let described = self.endpoint.describe(&args);
        let out = self.run(args).await?;
        parse_show(&out).map_err(|reason| HostError::Output {
            command: described,
            reason,
        })
    }

    async fn delete_subvolume(&self, path: &str) -> Result<(), HostError> {
        let full = self.endpoint.join(path);
        self.run(self.btrfs(&["subvolume", "delete", &full])).await?;
        Ok(())
    }

    async fn create_dir_all(&self, path: &str) -> Result<(), HostError> {
        let full = self.endpoint.join(path);
        self.run(vec!["mkdir".to_string(), "-p".to_string(), full]).await?;
        Ok(())
    }

    async fn list_top_dirs(&self) -> Result<Vec<String>, HostError> {
        let args = [
            "find",
            self.endpoint.root.as_str(),
            "-mindepth",
            "1",
            "-maxdepth",
            "1",
            "-type",
            "d",
            "-printf",
            "%f\\n",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let out = self.run(args).await?;
        Ok(out
            .lines()
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn remove_dir(&self, name: &str) -> Result<(), HostError> {
        let full = self.endpoint.join(name);
        self.run(vec!["rmdir".to_string(), full]).await?;
        Ok(())
    }

    async fn disk_usage(&self) -> Result<DiskUsage, HostError> {
        let args: Vec<String> = vec![
            "df".to_string(),
            "-P".to_string(),
            "-B1".to_string(),
            self.endpoint.root.clone(),
        ];
        let described = self.endpoint.describe(&args);
        let out = self.run(args).await?;
        parse_df(&out).map_err(|reason| HostError::Output {
            command: described,
            reason,
        })
    }

    async fn send(&self, path: &str, parent: Option<&str>) -> Result<SendStream, HostError> {
        let mut args = self.btrfs(&["-q", "send"]);
        if let Some(parent) = parent {
            args.push("-p".to_string());
            args.push(self.endpoint.join(parent));
        }
        args.push(self.endpoint.join(path));

        let (mut child, described) = self.spawn(&args, Stdio::null(), Stdio::piped())?;
        let stdout = child.stdout.take().ok_or_else(|| HostError::Spawn {
            command: described.clone(),
            reason: "stdout not captured".to_string(),
        })?;

        Ok(SendStream {
            reader: Box::new(stdout),
            completion: Box::pin(async move {
                let output = child.wait_with_output().await.map_err(|e| HostError::Spawn {
                    command: described.clone(),
                    reason: e.to_string(),
                })?;
                check_output(&described, &output)
            }),
        })
    }

    async fn receive(&self, dir: &str) -> Result<ReceiveStream, HostError> {
        let args = self.btrfs(&["-q", "receive", &self.endpoint.join(dir)]);

        let (mut child, described) = self.spawn(&args, Stdio::piped(), Stdio::null())?;
        let stdin = child.stdin.take().ok_or_else(|| HostError::Spawn {
            command: described.clone(),
            reason: "stdin not captured".to_string(),
        })?;

        Ok(ReceiveStream {
            writer: Box::new(stdin),
            completion: Box::pin(async move {
                let output = child.wait_with_output().await.map_err(|e| HostError::Spawn {
                    command: described.clone(),
                    reason: e.to_string(),
                })?;
                check_output(&described, &output)
            }),
        })
    }
}
