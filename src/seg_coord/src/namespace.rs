use async_trait::async_trait;
use log::debug;
use segdir_lib::{SegError, SegResult};
use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeStat {
    /// Bumped by every `set_data`.
    pub version: i32,
    /// Creation id. A node deleted and created again gets a new one.
    pub czxid: i64,
    pub ephemeral_owner: Option<u64>,
    pub num_children: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    Created(String),
    Deleted(String),
    DataChanged(String),
}

/// One session on a hierarchical coordination namespace.
///
/// Paths are absolute (`/a/b`), the root `/` always exists, and every create
/// needs an existing parent. Ephemeral nodes belong to the session that made
/// them and vanish when it ends, whether by `close`, drop or expiry.
#[async_trait]
pub trait CoordNamespace: Send + Sync {
    fn session_id(&self) -> u64;

    /// `AlreadyExists` when the node is present, `NotFound` when the parent is missing.
    async fn create_persistent(&self, path: &str, data: &[u8]) -> SegResult<()>;
    async fn create_ephemeral(&self, path: &str, data: &[u8]) -> SegResult<()>;
    /// Appends a 10-digit per-parent counter to `prefix` and returns the full path.
    async fn create_ephemeral_sequential(&self, prefix: &str, data: &[u8]) -> SegResult<String>;

    /// `expected_version` of `None` deletes whatever version is present.
    async fn delete(&self, path: &str, expected_version: Option<i32>) -> SegResult<()>;
    async fn exists(&self, path: &str) -> SegResult<bool>;
    async fn stat(&self, path: &str) -> SegResult<Option<NodeStat>>;
    async fn get_data(&self, path: &str) -> SegResult<Vec<u8>>;
    async fn set_data(
        &self,
        path: &str,
        data: &[u8],
        expected_version: Option<i32>,
    ) -> SegResult<NodeStat>;
    /// Child names (not paths), sorted.
    async fn list_children(&self, path: &str) -> SegResult<Vec<String>>;

    fn subscribe(&self) -> Option<broadcast::Receiver<NodeEvent>> {
        None
    }

    async fn close(&self) -> SegResult<()>;
}

pub type CoordNamespaceRef = Arc<dyn CoordNamespace>;

pub fn join_path(base: &str, name: &str) -> String {
    let name = name.trim_start_matches('/');
    if base.ends_with('/') {
        format!("{}{}", base, name)
    } else {
        format!("{}/{}", base, name)
    }
}

/// Parent of an absolute path; `None` for the root.
pub fn parent_path(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(index) => Some(&path[..index]),
        None => None,
    }
}

pub fn node_name(path: &str) -> &str {
    match path.rfind('/') {
        Some(index) => &path[index + 1..],
        None => path,
    }
}

pub fn validate_path(path: &str) -> SegResult<()> {
    if !path.starts_with('/') {
        return Err(SegError::InvalidParam(format!(
            "namespace path must be absolute: {}",
            path
        )));
    }
    if path.len() > 1 && (path.ends_with('/') || path.contains("//")) {
        return Err(SegError::InvalidParam(format!(
            "malformed namespace path: {}",
            path
        )));
    }
    Ok(())
}

/// Creates every missing node along `path`. Nodes that already exist are kept.
pub async fn mk_nodes(ns: &dyn CoordNamespace, path: &str) -> SegResult<()> {
    validate_path(path)?;
    let mut current = String::new();
    for part in path.split('/').filter(|p| !p.is_empty()) {
        current.push('/');
        current.push_str(part);
        match ns.create_persistent(&current, &[]).await {
            Ok(()) => debug!("mk_nodes: created {}", current),
            Err(e) if e.is_already_exists() => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Deletes `path` and everything below it. A missing node is not an error.
pub async fn delete_recursive(ns: &dyn CoordNamespace, path: &str) -> SegResult<()> {
    validate_path(path)?;
    // parents come before their children, so deleting in reverse order is bottom-up
    let mut ordered = Vec::new();
    let mut pending = vec![path.to_string()];
    while let Some(current) = pending.pop() {
        match ns.list_children(&current).await {
            Ok(children) => {
                for child in children {
                    pending.push(join_path(&current, &child));
                }
            }
            Err(e) if e.is_not_found() => continue,
            Err(e) => return Err(e),
        }
        ordered.push(current);
    }

    for node in ordered.iter().rev() {
        if node == "/" {
            continue;
        }
        match ns.delete(node, None).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
    }
    debug!("delete_recursive: removed {} nodes under {}", ordered.len(), path);
    Ok(())
}
