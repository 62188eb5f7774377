//! In-memory [`SubvolumeHost`] for tests.
//!
//! Models just enough of btrfs send/receive semantics: received subvolumes
//! get a fresh uuid and carry the sender's identity as `received_uuid`, an
//! incremental receive needs its parent to be present, and a receive only
//! turns the new subvolume read-only once the stream finished cleanly.

use super::{
    DiskUsage, Endpoint, ListedSubvolume, ReceiveStream, SendStream, ShownSubvolume,
    SubvolumeHost,
};
use crate::utils::HostError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::AsyncReadExt;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct MemorySubvolume {
    pub id: u64,
    pub path: String,
    pub uuid: Uuid,
    pub parent_uuid: Option<Uuid>,
    pub received_uuid: Option<Uuid>,
    pub read_only: bool,
}

impl MemorySubvolume {
    /// Identity a send stream of this subvolume carries
    fn stream_uuid(&self) -> Uuid {
        self.received_uuid.unwrap_or(self.uuid)
    }
}

#[derive(Debug)]
pub struct MemoryState {
    pub fs_uuid: Option<Uuid>,
    pub subvolumes: Vec<MemorySubvolume>,
    pub dirs: BTreeSet<String>,
    pub next_id: u64,
    pub used_percent: f64,
    /// Paths whose send fails to start
    pub fail_send: HashSet<String>,
    /// Paths whose send streams fully but then exits as if killed by SIGPIPE
    pub sigpipe_send: HashSet<String>,
    /// Paths whose `show` cannot be run at all
    pub fail_show: HashSet<String>,
    /// Received names the receive side rejects without creating anything
    pub reject_receive: HashSet<String>,
    /// Received names that are left writable and reported as failed
    pub interrupt_receive: HashSet<String>,
    /// Received names that complete but are never made read-only
    pub skip_readonly: HashSet<String>,
    pub fail_list: bool,
    /// Every mutating call, in order
    pub mutations: Vec<String>,
}

#[derive(Serialize, Deserialize)]
struct StreamPayload {
    name: String,
    identity: Uuid,
    parent_identity: Option<Uuid>,
}

/// Cloneable handle; clones share state so tests can inspect it afterwards
#[derive(Debug, Clone)]
pub struct MemoryHost {
    endpoint: Endpoint,
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryHost {
    pub fn new(root: &str) -> Self {
        Self {
            endpoint: Endpoint::local(root),
            state: Arc::new(Mutex::new(MemoryState {
                fs_uuid: Some(Uuid::new_v4()),
                subvolumes: Vec::new(),
                dirs: BTreeSet::new(),
                next_id: 256,
                used_percent: 42.0,
                fail_send: HashSet::new(),
                sigpipe_send: HashSet::new(),
                fail_show: HashSet::new(),
                reject_receive: HashSet::new(),
                interrupt_receive: HashSet::new(),
                skip_readonly: HashSet::new(),
                fail_list: false,
                mutations: Vec::new(),
            })),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap()
    }

    /// Create a snapshot at `path`; returns its uuid
    pub fn add(&self, path: &str, parent: Option<Uuid>, read_only: bool) -> Uuid {
        let uuid = Uuid::new_v4();
        self.add_with(path, uuid, parent, None, read_only);
        uuid
    }

    pub fn add_with(
        &self,
        path: &str,
        uuid: Uuid,
        parent_uuid: Option<Uuid>,
        received_uuid: Option<Uuid>,
        read_only: bool,
    ) {
        let mut state = self.state();
        let id = state.next_id;
        state.next_id += 1;
        insert_parent_dirs(&mut state.dirs, path);
        state.subvolumes.push(MemorySubvolume {
            id,
            path: path.to_string(),
            uuid,
            parent_uuid,
            received_uuid,
            read_only,
        });
    }

    pub fn get(&self, path: &str) -> Option<MemorySubvolume> {
        self.state().subvolumes.iter().find(|s| s.path == path).cloned()
    }

    pub fn paths(&self) -> Vec<String> {
        self.state().subvolumes.iter().map(|s| s.path.clone()).collect()
    }

    pub fn mutations(&self) -> Vec<String> {
        self.state().mutations.clone()
    }

    fn missing(&self, what: &str, path: &str) -> HostError {
        HostError::Failed {
            command: format!("{} {}", what, path),
            status: "exit status: 1".to_string(),
            stderr: format!("ERROR: cannot access '{}': No such file or directory", path),
        }
    }
}

fn insert_parent_dirs(dirs: &mut BTreeSet<String>, path: &str) {
    let mut prefix = String::new();
    let parts: Vec<&str> = path.split('/').collect();
    for part in &parts[..parts.len().saturating_sub(1)] {
        if !prefix.is_empty() {
            prefix.push('/');
        }
        prefix.push_str(part);
        dirs.insert(prefix.clone());
    }
}

#[async_trait]
impl SubvolumeHost for MemoryHost {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn filesystem_uuid(&self) -> Result<Option<Uuid>, HostError> {
        Ok(self.state().fs_uuid)
    }

    async fn list_subvolumes(&self, read_only: bool) -> Result<Vec<ListedSubvolume>, HostError> {
        let state = self.state();
        if state.fail_list {
            return Err(HostError::Failed {
                command: "btrfs subvolume list".to_string(),
                status: "exit status: 1".to_string(),
                stderr: "ERROR: can't perform the search: Operation not permitted".to_string(),
            });
        }
        let mut listed: Vec<ListedSubvolume> = state
            .subvolumes
            .iter()
            .filter(|s| !read_only || s.read_only)
            .map(|s| ListedSubvolume {
                id: s.id,
                path: s.path.clone(),
                uuid: s.uuid,
                parent_uuid: s.parent_uuid,
                received_uuid: s.received_uuid,
            })
            .collect();
        listed.sort_by_key(|s| s.id);
        Ok(listed)
    }

    async fn show_subvolume(&self, path: &str) -> Result<ShownSubvolume, HostError> {
        if self.state().fail_show.contains(path) {
            return Err(HostError::Spawn {
                command: format!("ssh backup@offsite btrfs subvolume show {}", path),
                reason: "Connection refused".to_string(),
            });
        }
        let sv = self.get(path).ok_or_else(|| self.missing("btrfs subvolume show", path))?;
        Ok(ShownSubvolume {
            uuid: sv.uuid,
            parent_uuid: sv.parent_uuid,
            received_uuid: sv.received_uuid,
            read_only: sv.read_only,
        })
    }

    async fn delete_subvolume(&self, path: &str) -> Result<(), HostError> {
        let mut state = self.state();
        let before = state.subvolumes.len();
        state.subvolumes.retain(|s| s.path != path);
        if state.subvolumes.len() == before {
            drop(state);
            return Err(self.missing("btrfs subvolume delete", path));
        }
        state.mutations.push(format!("delete {}", path));
        Ok(())
    }

    async fn create_dir_all(&self, path: &str) -> Result<(), HostError> {
        let mut state = self.state();
        insert_parent_dirs(&mut state.dirs, &format!("{}/x", path));
        state.mutations.push(format!("mkdir {}", path));
        Ok(())
    }

    async fn list_top_dirs(&self) -> Result<Vec<String>, HostError> {
        Ok(self
            .state()
            .dirs
            .iter()
            .filter(|d| !d.contains('/'))
            .cloned()
            .collect())
    }

    async fn remove_dir(&self, name: &str) -> Result<(), HostError> {
        let mut state = self.state();
        let prefix = format!("{}/", name);
        if state.subvolumes.iter().any(|s| s.path.starts_with(&prefix))
            || state.dirs.iter().any(|d| d.starts_with(&prefix))
        {
            return Err(HostError::Failed {
                command: format!("rmdir {}", name),
                status: "exit status: 1".to_string(),
                stderr: "Directory not empty".to_string(),
            });
        }
        if !state.dirs.remove(name) {
            drop(state);
            return Err(self.missing("rmdir", name));
        }
        state.mutations.push(format!("rmdir {}", name));
        Ok(())
    }

    async fn disk_usage(&self) -> Result<DiskUsage, HostError> {
        let used_percent = self.state().used_percent;
        Ok(DiskUsage {
            total: 1000,
            used: (used_percent * 10.0) as u64,
            available: 1000 - (used_percent * 10.0) as u64,
            used_percent,
        })
    }

    async fn send(&self, path: &str, parent: Option<&str>) -> Result<SendStream, HostError> {
        let state = self.state();
        if state.fail_send.contains(path) {
            return Err(HostError::Failed {
                command: format!("btrfs send {}", path),
                status: "exit status: 1".to_string(),
                stderr: "ERROR: send ioctl failed".to_string(),
            });
        }
        let find = |p: &str| state.subvolumes.iter().find(|s| s.path == p).cloned();
        let source = find(path).ok_or_else(|| self.missing("btrfs send", path))?;
        if !source.read_only {
            return Err(HostError::Failed {
                command: format!("btrfs send {}", path),
                status: "exit status: 1".to_string(),
                stderr: "ERROR: subvolume is not read-only".to_string(),
            });
        }
        let parent_identity = match parent {
            Some(p) => Some(find(p).ok_or_else(|| self.missing("btrfs send -p", p))?.stream_uuid()),
            None => None,
        };
        let payload = StreamPayload {
            name: path.rsplit('/').next().unwrap_or(path).to_string(),
            identity: source.stream_uuid(),
            parent_identity,
        };
        let bytes = serde_json::to_vec(&payload).map_err(|e| HostError::Output {
            command: "btrfs send".to_string(),
            reason: e.to_string(),
        })?;

        let completion = if state.sigpipe_send.contains(path) {
            let command = format!("btrfs send {}", path);
            Err(HostError::Failed {
                command,
                status: "signal: 13 (SIGPIPE)".to_string(),
                stderr: String::new(),
            })
        } else {
            Ok(())
        };
        Ok(SendStream {
            reader: Box::new(std::io::Cursor::new(bytes)),
            completion: Box::pin(async move { completion }),
        })
    }

    async fn receive(&self, dir: &str) -> Result<ReceiveStream, HostError> {
        let (writer, mut reader) = tokio::io::duplex(64 * 1024);
        let state = Arc::clone(&self.state);
        let dir = dir.trim_matches('/').to_string();

        let completion = async move {
            let fail = |reason: String| HostError::Failed {
                command: format!("btrfs receive {}", dir),
                status: "exit status: 1".to_string(),
                stderr: reason,
            };

            let mut buf = Vec::new();
            reader
                .read_to_end(&mut buf)
                .await
                .map_err(|e| fail(e.to_string()))?;
            let payload: StreamPayload =
                serde_json::from_slice(&buf).map_err(|e| fail(format!("bad stream: {}", e)))?;

            let mut state = state.lock().unwrap();
            if state.reject_receive.contains(&payload.name) {
                return Err(fail("ERROR: No space left on device".to_string()));
            }
            if !dir.is_empty() && !state.dirs.contains(&dir) {
                return Err(fail(format!("cannot open {}: No such file or directory", dir)));
            }
            let path = if dir.is_empty() {
                payload.name.clone()
            } else {
                format!("{}/{}", dir, payload.name)
            };
            if state.subvolumes.iter().any(|s| s.path == path) {
                return Err(fail(format!("{} already exists", path)));
            }

            let parent_uuid = match payload.parent_identity {
                None => None,
                Some(identity) => {
                    let parent = state
                        .subvolumes
                        .iter()
                        .find(|s| s.read_only && (s.received_uuid == Some(identity) || s.uuid == identity))
                        .ok_or_else(|| fail(format!("cannot find parent subvolume {}", identity)))?;
                    Some(parent.uuid)
                }
            };

            let interrupted = state.interrupt_receive.contains(&payload.name);
            let read_only = !interrupted && !state.skip_readonly.contains(&payload.name);
            let id = state.next_id;
            state.next_id += 1;
            state.subvolumes.push(MemorySubvolume {
                id,
                path: path.clone(),
                uuid: Uuid::new_v4(),
                parent_uuid,
                received_uuid: (!interrupted).then_some(payload.identity),
                read_only,
            });
            state.mutations.push(format!("receive {}", path));

            if interrupted {
                return Err(fail("stream truncated".to_string()));
            }
            Ok(())
        };

        Ok(ReceiveStream {
            writer: Box::new(writer),
            completion: Box::pin(completion),
        })
    }
}
