//! Source/destination locations, local or reached over ssh.
//!
//! Accepted forms:
//! - `/mnt/backup/urbackup`
//! - `ssh://[user@]host[:port]/remote/path`

use crate::utils::SyncError;
use std::fmt;
use tokio::process::Command;

const SSH_DEFAULT_PORT: u16 = 22;

/// Connection details for a remote endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub user: String,
    pub host: String,
    pub port: u16,
}

/// A filesystem root plus the way to run commands against it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Argument as given by the operator, without trailing slashes
    pub origin: String,
    /// Absolute root path on the (possibly remote) machine
    pub root: String,
    pub ssh: Option<SshTarget>,
}

impl Endpoint {
    /// Parse a local path or an `ssh://` url
    pub fn parse(origin: &str) -> Result<Self, SyncError> {
        let origin = trim_trailing_slashes(origin);
        if origin.is_empty() {
            return Err(SyncError::Config("empty path".to_string()));
        }

        let Some(rest) = origin.strip_prefix("ssh://") else {
            return Ok(Self {
                root: normalize(&origin),
                origin,
                ssh: None,
            });
        };

        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, "/"),
        };

        let (user, host_port) = match authority.rsplit_once('@') {
            Some((user, host_port)) => (user.to_string(), host_port),
            None => (default_user(), authority),
        };
        if user.contains(':') {
            return Err(SyncError::Config(format!(
                "embedded passwords are not supported in {}, use ssh keys",
                origin
            )));
        }

        let (host, port) = match host_port.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| SyncError::Config(format!("invalid ssh port in {}", origin)))?;
                (host.to_string(), port)
            }
            None => (host_port.to_string(), SSH_DEFAULT_PORT),
        };
        let host = if host.is_empty() { "localhost".to_string() } else { host };

        Ok(Self {
            root: normalize(path),
            ssh: Some(SshTarget { user, host, port }),
            origin,
        })
    }

    /// Local endpoint rooted at `root`
    pub fn local(root: &str) -> Self {
        let origin = trim_trailing_slashes(root);
        Self {
            root: normalize(&origin),
            origin,
            ssh: None,
        }
    }

    pub fn is_remote(&self) -> bool {
        self.ssh.is_some()
    }

    /// Absolute path of `rel` on the endpoint's machine
    pub fn join(&self, rel: &str) -> String {
        join_paths(&self.root, rel)
    }

    /// Operator-facing location of `rel`, used in log lines
    pub fn display_path(&self, rel: &str) -> String {
        join_paths(&self.origin, rel)
    }

    /// Build the process that runs `args` on this endpoint
    pub fn command(&self, args: &[String]) -> Command {
        let (program, rest) = self.argv(args);
        let mut cmd = Command::new(program);
        cmd.args(rest);
        cmd
    }

    /// Full argv, including the ssh wrapper for remote endpoints
    pub fn argv(&self, args: &[String]) -> (String, Vec<String>) {
        match &self.ssh {
            None => {
                let (program, rest) = args.split_first().map_or_else(
                    || (String::new(), Vec::new()),
                    |(p, r)| (p.clone(), r.to_vec()),
                );
                (program, rest)
            }
            Some(target) => (
                "ssh".to_string(),
                vec![
                    "-p".to_string(),
                    target.port.to_string(),
                    format!("{}@{}", target.user, target.host),
                    shell_join(args),
                ],
            ),
        }
    }

    /// Human-readable rendering of the command for logs and errors
    pub fn describe(&self, args: &[String]) -> String {
        let (program, rest) = self.argv(args);
        let mut all = vec![program];
        all.extend(rest);
        shell_join(&all)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.origin)
    }
}

fn default_user() -> String {
    std::env::var("USER")
        .ok()
        .filter(|u| !u.is_empty())
        .unwrap_or_else(|| "root".to_string())
}

fn trim_trailing_slashes(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() && path.starts_with('/') {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Collapse `//`, `.` and `..` components without touching the filesystem
fn normalize(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if parts.last().is_some_and(|p| *p != "..") {
                    parts.pop();
                } else if !absolute {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }
    let joined = parts.join("/");
    match (absolute, joined.is_empty()) {
        (true, _) => format!("/{}", joined),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}

fn join_paths(base: &str, rel: &str) -> String {
    let rel = rel.trim_start_matches('/');
    if rel.is_empty() {
        base.to_string()
    } else if base.ends_with('/') {
        format!("{}{}", base, rel)
    } else {
        format!("{}/{}", base, rel)
    }
}

/// Quote one argument for a POSIX shell
pub fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_@%+=:,./-".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r#"'"'"'"#))
    }
}

pub fn shell_join(args: &[String]) -> String {
    args.iter()
        .map(|a| shell_quote(a))
        .collect::<Vec<_>>()
        .join(" ")
}
