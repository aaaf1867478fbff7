use crate::namespace::{join_path, mk_nodes, CoordNamespace};
use log::{debug, info, warn};
use segdir_lib::{SegError, SegResult};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
struct HeldLock {
    token: String,
    czxid: i64,
    version: i32,
}

/// Exclusive advisory lock: an ephemeral node at `<lock_dir>/<name>`.
///
/// The node data is a token unique to this holder. Release checks the token
/// and the creation id seen at acquire time before deleting, so a node that
/// another holder recreated in the meantime is never removed.
pub struct CoordLock {
    ns: Arc<dyn CoordNamespace>,
    lock_dir: String,
    path: String,
    held: Mutex<Option<HeldLock>>,
}

impl CoordLock {
    pub fn new(ns: Arc<dyn CoordNamespace>, lock_dir: impl Into<String>, name: &str) -> Self {
        let lock_dir = lock_dir.into();
        let path = join_path(&lock_dir, name);
        Self {
            ns,
            lock_dir,
            path,
            held: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn held_guard(&self) -> SegResult<std::sync::MutexGuard<'_, Option<HeldLock>>> {
        self.held
            .lock()
            .map_err(|e| SegError::Internal(format!("lock state poisoned: {}", e)))
    }

    /// Returns `false` when someone else holds the lock.
    pub async fn acquire(&self) -> SegResult<bool> {
        if self.is_held() {
            return Ok(false);
        }
        mk_nodes(self.ns.as_ref(), &self.lock_dir).await?;

        let token = format!("{}:{:016x}", self.ns.session_id(), rand::random::<u64>());
        match self.ns.create_ephemeral(&self.path, token.as_bytes()).await {
            Ok(()) => {}
            Err(e) if e.is_already_exists() => {
                debug!("CoordLock: {} held by someone else", self.path);
                return Ok(false);
            }
            Err(e) => return Err(e),
        }

        let stat = self.ns.stat(&self.path).await?.ok_or_else(|| {
            SegError::Unavailable(format!("lock node {} vanished after create", self.path))
        })?;
        *self.held_guard()? = Some(HeldLock {
            token,
            czxid: stat.czxid,
            version: stat.version,
        });
        info!("CoordLock: acquired {}", self.path);
        Ok(true)
    }

    /// Polls [`acquire`](Self::acquire) until it succeeds or `timeout` passes.
    pub async fn acquire_timeout(&self, timeout: Duration) -> SegResult<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.acquire().await? {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                warn!("CoordLock: timed out waiting for {}", self.path);
                return Ok(false);
            }
            tokio::time::sleep(LOCK_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    pub async fn release(&self) -> SegResult<()> {
        let held = self
            .held_guard()?
            .take()
            .ok_or_else(|| SegError::InvalidState(format!("lock {} is not held", self.path)))?;

        let stat = self.ns.stat(&self.path).await?.ok_or_else(|| {
            SegError::VersionConflict(format!("lock node {} is gone", self.path))
        })?;
        if stat.czxid != held.czxid {
            return Err(SegError::VersionConflict(format!(
                "lock node {} was recreated by another holder",
                self.path
            )));
        }
        let data = match self.ns.get_data(&self.path).await {
            Ok(data) => data,
            Err(e) if e.is_not_found() => {
                return Err(SegError::VersionConflict(format!(
                    "lock node {} is gone",
                    self.path
                )))
            }
            Err(e) => return Err(e),
        };
        if data != held.token.as_bytes() {
            return Err(SegError::VersionConflict(format!(
                "lock node {} holds a different token",
                self.path
            )));
        }

        match self.ns.delete(&self.path, Some(held.version)).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                return Err(SegError::VersionConflict(format!(
                    "lock node {} is gone",
                    self.path
                )))
            }
            Err(e) => return Err(e),
        }
        info!("CoordLock: released {}", self.path);
        Ok(())
    }

    /// Whether anyone (this holder included) currently holds the lock.
    pub async fn is_locked(&self) -> SegResult<bool> {
        self.ns.exists(&self.path).await
    }

    /// Whether this instance believes it holds the lock.
    pub fn is_held(&self) -> bool {
        self.held
            .lock()
            .map(|held| held.is_some())
            .unwrap_or_default()
    }
}
