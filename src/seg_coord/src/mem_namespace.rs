use crate::namespace::{parent_path, validate_path, CoordNamespace, NodeEvent, NodeStat};
use async_trait::async_trait;
use log::{debug, info};
use segdir_lib::{SegError, SegResult};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;

struct MemNode {
    data: Vec<u8>,
    version: i32,
    czxid: i64,
    ephemeral_owner: Option<u64>,
    seq_counter: u64,
}

struct MemCoordState {
    nodes: BTreeMap<String, MemNode>,
    live_sessions: HashSet<u64>,
    next_session_id: u64,
    next_zxid: i64,
}

impl MemCoordState {
    fn children_of(&self, path: &str) -> Vec<String> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path)
        };
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(p, _)| p.starts_with(&prefix))
            .filter(|(p, _)| p.len() > prefix.len() && !p[prefix.len()..].contains('/'))
            .map(|(p, _)| p[prefix.len()..].to_string())
            .collect()
    }

    fn stat_of(&self, path: &str) -> Option<NodeStat> {
        self.nodes.get(path).map(|node| NodeStat {
            version: node.version,
            czxid: node.czxid,
            ephemeral_owner: node.ephemeral_owner,
            num_children: self.children_of(path).len(),
        })
    }

    fn check_session(&self, session_id: u64) -> SegResult<()> {
        if !self.live_sessions.contains(&session_id) {
            return Err(SegError::Unavailable(format!(
                "coord session {} expired",
                session_id
            )));
        }
        Ok(())
    }

    fn create_node(&mut self, path: &str, data: &[u8], owner: Option<u64>) -> SegResult<()> {
        validate_path(path)?;
        if self.nodes.contains_key(path) {
            return Err(SegError::AlreadyExists(path.to_string()));
        }
        let parent = parent_path(path)
            .ok_or_else(|| SegError::AlreadyExists(path.to_string()))?;
        match self.nodes.get(parent) {
            None => return Err(SegError::NotFound(format!("parent of {}", path))),
            Some(node) if node.ephemeral_owner.is_some() => {
                return Err(SegError::InvalidState(format!(
                    "ephemeral node {} cannot have children",
                    parent
                )))
            }
            Some(_) => {}
        }
        self.next_zxid += 1;
        self.nodes.insert(
            path.to_string(),
            MemNode {
                data: data.to_vec(),
                version: 0,
                czxid: self.next_zxid,
                ephemeral_owner: owner,
                seq_counter: 0,
            },
        );
        Ok(())
    }

    fn remove_session(&mut self, session_id: u64) -> Vec<String> {
        self.live_sessions.remove(&session_id);
        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.ephemeral_owner == Some(session_id))
            .map(|(path, _)| path.clone())
            .collect();
        for path in owned.iter() {
            self.nodes.remove(path);
        }
        owned
    }
}

/// In-process coordination service. Each [`MemCoordSession`] it hands out
/// plays the role of one client process.
pub struct MemCoordService {
    state: Mutex<MemCoordState>,
    events: broadcast::Sender<NodeEvent>,
}

impl MemCoordService {
    pub fn new() -> Arc<Self> {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            "/".to_string(),
            MemNode {
                data: Vec::new(),
                version: 0,
                czxid: 0,
                ephemeral_owner: None,
                seq_counter: 0,
            },
        );
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            state: Mutex::new(MemCoordState {
                nodes,
                live_sessions: HashSet::new(),
                next_session_id: 1,
                next_zxid: 0,
            }),
            events,
        })
    }

    pub fn connect(self: &Arc<Self>) -> SegResult<MemCoordSession> {
        let session_id = {
            let mut state = self.lock_state()?;
            let session_id = state.next_session_id;
            state.next_session_id += 1;
            state.live_sessions.insert(session_id);
            session_id
        };
        debug!("MemCoordService: session {} connected", session_id);
        Ok(MemCoordSession {
            service: self.clone(),
            session_id,
        })
    }

    /// Ends a session as if its client stopped heartbeating.
    pub fn expire_session(&self, session_id: u64) -> SegResult<()> {
        let removed = {
            let mut state = self.lock_state()?;
            if !state.live_sessions.contains(&session_id) {
                return Ok(());
            }
            state.remove_session(session_id)
        };
        info!(
            "MemCoordService: session {} ended, removed {} ephemeral nodes",
            session_id,
            removed.len()
        );
        for path in removed {
            self.notify(NodeEvent::Deleted(path));
        }
        Ok(())
    }

    pub fn node_count(&self) -> usize {
        self.state
            .lock()
            .map(|state| state.nodes.len())
            .unwrap_or_default()
    }

    fn lock_state(&self) -> SegResult<MutexGuard<'_, MemCoordState>> {
        self.state
            .lock()
            .map_err(|e| SegError::Internal(format!("coord state lock poisoned: {}", e)))
    }

    fn notify(&self, event: NodeEvent) {
        // no receivers is fine
        let _ = self.events.send(event);
    }
}

pub struct MemCoordSession {
    service: Arc<MemCoordService>,
    session_id: u64,
}

impl MemCoordSession {
    pub fn service(&self) -> &Arc<MemCoordService> {
        &self.service
    }

    fn live_state(&self) -> SegResult<MutexGuard<'_, MemCoordState>> {
        let state = self.service.lock_state()?;
        state.check_session(self.session_id)?;
        Ok(state)
    }
}

#[async_trait]
impl CoordNamespace for MemCoordSession {
    fn session_id(&self) -> u64 {
        self.session_id
    }

    async fn create_persistent(&self, path: &str, data: &[u8]) -> SegResult<()> {
        self.live_state()?.create_node(path, data, None)?;
        self.service.notify(NodeEvent::Created(path.to_string()));
        Ok(())
    }

    async fn create_ephemeral(&self, path: &str, data: &[u8]) -> SegResult<()> {
        self.live_state()?
            .create_node(path, data, Some(self.session_id))?;
        self.service.notify(NodeEvent::Created(path.to_string()));
        Ok(())
    }

    async fn create_ephemeral_sequential(&self, prefix: &str, data: &[u8]) -> SegResult<String> {
        let path = {
            let mut state = self.live_state()?;
            let parent = parent_path(prefix)
                .ok_or_else(|| SegError::InvalidParam(format!("bad prefix {}", prefix)))?
                .to_string();
            let seq = match state.nodes.get_mut(&parent) {
                Some(node) => {
                    let seq = node.seq_counter;
                    node.seq_counter += 1;
                    seq
                }
                None => return Err(SegError::NotFound(format!("parent of {}", prefix))),
            };
            let path = format!("{}{:010}", prefix, seq);
            state.create_node(&path, data, Some(self.session_id))?;
            path
        };
        self.service.notify(NodeEvent::Created(path.clone()));
        Ok(path)
    }

    async fn delete(&self, path: &str, expected_version: Option<i32>) -> SegResult<()> {
        validate_path(path)?;
        {
            let mut state = self.live_state()?;
            let version = match state.nodes.get(path) {
                Some(node) => node.version,
                None => return Err(SegError::NotFound(path.to_string())),
            };
            if let Some(expected) = expected_version {
                if expected != version {
                    return Err(SegError::VersionConflict(format!(
                        "{} is at version {}, expected {}",
                        path, version, expected
                    )));
                }
            }
            if !state.children_of(path).is_empty() {
                return Err(SegError::NotEmpty(path.to_string()));
            }
            state.nodes.remove(path);
        }
        self.service.notify(NodeEvent::Deleted(path.to_string()));
        Ok(())
    }

    async fn exists(&self, path: &str) -> SegResult<bool> {
        validate_path(path)?;
        Ok(self.live_state()?.nodes.contains_key(path))
    }

    async fn stat(&self, path: &str) -> SegResult<Option<NodeStat>> {
        validate_path(path)?;
        Ok(self.live_state()?.stat_of(path))
    }

    async fn get_data(&self, path: &str) -> SegResult<Vec<u8>> {
        validate_path(path)?;
        self.live_state()?
            .nodes
            .get(path)
            .map(|node| node.data.clone())
            .ok_or_else(|| SegError::NotFound(path.to_string()))
    }

    async fn set_data(
        &self,
        path: &str,
        data: &[u8],
        expected_version: Option<i32>,
    ) -> SegResult<NodeStat> {
        validate_path(path)?;
        let stat = {
            let mut state = self.live_state()?;
            let node = state
                .nodes
                .get_mut(path)
                .ok_or_else(|| SegError::NotFound(path.to_string()))?;
            if let Some(expected) = expected_version {
                if expected != node.version {
                    return Err(SegError::VersionConflict(format!(
                        "{} is at version {}, expected {}",
                        path, node.version, expected
                    )));
                }
            }
            node.data = data.to_vec();
            node.version += 1;
            state
                .stat_of(path)
                .ok_or_else(|| SegError::Internal(format!("node {} vanished", path)))?
        };
        self.service
            .notify(NodeEvent::DataChanged(path.to_string()));
        Ok(stat)
    }

    async fn list_children(&self, path: &str) -> SegResult<Vec<String>> {
        validate_path(path)?;
        let state = self.live_state()?;
        if !state.nodes.contains_key(path) {
            return Err(SegError::NotFound(path.to_string()));
        }
        Ok(state.children_of(path))
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<NodeEvent>> {
        Some(self.service.events.subscribe())
    }

    async fn close(&self) -> SegResult<()> {
        self.service.expire_session(self.session_id)
    }
}

impl Drop for MemCoordSession {
    fn drop(&mut self) {
        let _ = self.service.expire_session(self.session_id);
    }
}
