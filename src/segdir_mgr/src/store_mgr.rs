use crate::config::{CoordConfig, RemoteStoreConfig, SegStoreConfig};
use crate::replicated_dir::ReplicatedDirectory;
use crate::replication::{bootstrap_local, ReplicationPolicy};
use block_store::{
    DirectoryFactory, FsDirectory, FsDirectoryFactory, MemDirectoryFactory, SqliteBlockStoreDB,
    SqliteDirectoryFactory,
};
use log::{debug, info, warn};
use once_cell::sync::Lazy;
use rand::seq::SliceRandom;
use seg_coord::{
    delete_recursive, mk_nodes, CoordNamespace, MemCoordService, RefDeletionPolicy,
    RefTrackingDirectory, SqliteCoordNamespace,
};
use segdir_lib::{directory_key, SegDirectory, SegError, SegResult};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::fs;

// One connection pool per database file, shared by every manager in the process.
static BLOCK_DB_REGISTRY: Lazy<Mutex<HashMap<String, Arc<SqliteBlockStoreDB>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

fn shared_block_db(db_path: &Path, config: &SegStoreConfig) -> SegResult<Arc<SqliteBlockStoreDB>> {
    let key = db_path.to_string_lossy().to_string();
    let mut registry = BLOCK_DB_REGISTRY
        .lock()
        .map_err(|e| SegError::Internal(format!("block db registry poisoned: {}", e)))?;
    if let Some(db) = registry.get(&key) {
        return Ok(db.clone());
    }
    let db = Arc::new(SqliteBlockStoreDB::new(key.clone(), config.busy_timeout())?);
    registry.insert(key, db.clone());
    Ok(db)
}

async fn ensure_parent_dir(path: &Path) -> SegResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    Ok(())
}

fn validate_name(kind: &str, name: &str) -> SegResult<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\\')
    {
        return Err(SegError::InvalidParam(format!(
            "invalid {} name: {:?}",
            kind, name
        )));
    }
    Ok(())
}

struct OpenedDirectory {
    local: Arc<dyn SegDirectory>,
    remote: Arc<dyn SegDirectory>,
    dir: Arc<RefTrackingDirectory>,
}

/// Entry point for clusters of replicated directories.
///
/// Clusters and directories are registered as persistent nodes under
/// `base_coord_path`. Opening a directory yields a reference tracking view
/// of its local working copy; the matching deletion policy keeps the remote
/// copy in step after every commit.
pub struct SegStoreMgr {
    config: SegStoreConfig,
    ns: Arc<dyn CoordNamespace>,
    remote_factory: Arc<dyn DirectoryFactory>,
    opened: tokio::sync::Mutex<HashMap<String, OpenedDirectory>>,
}

impl SegStoreMgr {
    pub fn new(
        config: SegStoreConfig,
        ns: Arc<dyn CoordNamespace>,
        remote_factory: Arc<dyn DirectoryFactory>,
    ) -> Self {
        Self {
            config,
            ns,
            remote_factory,
            opened: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub async fn from_config(config: SegStoreConfig) -> SegResult<Self> {
        config.validate()?;

        let ns: Arc<dyn CoordNamespace> = match &config.coord {
            CoordConfig::Memory => Arc::new(MemCoordService::new().connect()?),
            CoordConfig::Sqlite { db_path } => {
                ensure_parent_dir(db_path).await?;
                Arc::new(SqliteCoordNamespace::open(
                    db_path.to_string_lossy().to_string(),
                    config.session_timeout(),
                    config.busy_timeout(),
                )?)
            }
        };

        let remote_factory: Arc<dyn DirectoryFactory> = match &config.remote {
            RemoteStoreConfig::Fs { base_path } => {
                fs::create_dir_all(base_path).await?;
                Arc::new(FsDirectoryFactory::new(base_path.clone()))
            }
            RemoteStoreConfig::Sqlite { db_path } => {
                ensure_parent_dir(db_path).await?;
                let db = shared_block_db(db_path, &config)?;
                Arc::new(SqliteDirectoryFactory::new(db, config.block_size))
            }
            RemoteStoreConfig::Memory => Arc::new(MemDirectoryFactory::new(config.block_size)),
        };

        info!(
            "SegStoreMgr: base {} remote {} session {}",
            config.base_coord_path,
            remote_factory.describe(),
            ns.session_id()
        );
        Ok(Self::new(config, ns, remote_factory))
    }

    pub fn config(&self) -> &SegStoreConfig {
        &self.config
    }

    pub fn namespace(&self) -> &Arc<dyn CoordNamespace> {
        &self.ns
    }

    pub async fn create_cluster(&self, cluster: &str) -> SegResult<()> {
        validate_name("cluster", cluster)?;
        let path = self.config.cluster_path(cluster);
        if self.ns.exists(&path).await? {
            info!("SegStoreMgr: cluster [{}] already exists", cluster);
        }
        mk_nodes(self.ns.as_ref(), &path).await
    }

    pub async fn create_directory(&self, cluster: &str, dir: &str) -> SegResult<()> {
        validate_name("cluster", cluster)?;
        validate_name("directory", dir)?;
        let path = self.config.directory_path(cluster, dir);
        if self.ns.exists(&path).await? {
            info!(
                "SegStoreMgr: directory [{}] in cluster [{}] already exists",
                dir, cluster
            );
        }
        mk_nodes(self.ns.as_ref(), &path).await
    }

    pub async fn list_clusters(&self) -> SegResult<Vec<String>> {
        if !self.ns.exists(&self.config.base_coord_path).await? {
            return Ok(Vec::new());
        }
        self.ns.list_children(&self.config.base_coord_path).await
    }

    pub async fn list_directories(&self, cluster: &str) -> SegResult<Vec<String>> {
        validate_name("cluster", cluster)?;
        let path = self.config.cluster_path(cluster);
        if !self.ns.exists(&path).await? {
            return Err(SegError::NotFound(format!(
                "cluster [{}] does not exist",
                cluster
            )));
        }
        self.ns.list_children(&path).await
    }

    /// Directories of `cluster` that have a working copy under any local root.
    pub async fn list_local_directories(&self, cluster: &str) -> SegResult<Vec<String>> {
        validate_name("cluster", cluster)?;
        let mut names = BTreeSet::new();
        for root in self.config.local_paths.iter() {
            let cluster_path = root.join(cluster);
            let mut entries = match fs::read_dir(&cluster_path).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                if entry.file_type().await?.is_dir() {
                    names.insert(entry.file_name().to_string_lossy().to_string());
                }
            }
        }
        Ok(names.into_iter().collect())
    }

    pub async fn open(&self, cluster: &str, dir: &str) -> SegResult<Arc<RefTrackingDirectory>> {
        validate_name("cluster", cluster)?;
        validate_name("directory", dir)?;
        let key = directory_key(cluster, dir);
        let mut opened = self.opened.lock().await;
        if let Some(entry) = opened.get(&key) {
            debug!("SegStoreMgr: open {} hit cache", key);
            return Ok(entry.dir.clone());
        }

        if !self
            .ns
            .exists(&self.config.directory_path(cluster, dir))
            .await?
        {
            return Err(SegError::NotFound(format!(
                "directory [{}] in cluster [{}] is not registered",
                dir, cluster
            )));
        }

        let local_path = self.select_local_path(cluster, dir).await?;
        let local: Arc<dyn SegDirectory> = Arc::new(FsDirectory::open(local_path).await?);
        let remote = self.remote_factory.open_directory(cluster, dir).await?;
        bootstrap_local(remote.as_ref(), local.as_ref(), self.config.copy_buffer_size).await?;

        let ref_dir = Arc::new(
            RefTrackingDirectory::new(
                local.clone(),
                self.ns.clone(),
                self.config.ref_path(cluster, dir),
                self.config.lock_path(cluster, dir),
            )
            .await?,
        );
        info!("SegStoreMgr: opened {} as {}", key, ref_dir.describe());
        opened.insert(
            key,
            OpenedDirectory {
                local,
                remote,
                dir: ref_dir.clone(),
            },
        );
        Ok(ref_dir)
    }

    /// Local/remote pair of an opened directory for callers that move single
    /// files by hand instead of committing through a deletion policy.
    pub async fn open_replicated(
        &self,
        cluster: &str,
        dir: &str,
        writing: bool,
    ) -> SegResult<ReplicatedDirectory> {
        self.open(cluster, dir).await?;
        let (local, remote) = {
            let opened = self.opened.lock().await;
            let entry = opened.get(&directory_key(cluster, dir)).ok_or_else(|| {
                SegError::InvalidState(format!(
                    "directory [{}] in cluster [{}] was closed concurrently",
                    dir, cluster
                ))
            })?;
            (entry.local.clone(), entry.remote.clone())
        };
        ReplicatedDirectory::new(local, remote, writing, self.config.copy_buffer_size).await
    }

    /// Policy for the producer writing `cluster/dir`. The directory must have
    /// been opened through this manager first.
    pub async fn deletion_policy(
        &self,
        cluster: &str,
        dir: &str,
    ) -> SegResult<Arc<ReplicationPolicy>> {
        let key = directory_key(cluster, dir);
        let opened = self.opened.lock().await;
        let entry = opened.get(&key).ok_or_else(|| {
            SegError::InvalidState(format!(
                "directory [{}] in cluster [{}] has not been opened",
                dir, cluster
            ))
        })?;
        let primary = Arc::new(RefDeletionPolicy::new(
            self.ns.clone(),
            self.config.ref_path(cluster, dir),
        ));
        Ok(Arc::new(ReplicationPolicy::new(
            primary,
            entry.local.clone(),
            entry.remote.clone(),
            self.config.copy_buffer_size,
        )))
    }

    pub async fn remove_directory(&self, cluster: &str, dir: &str) -> SegResult<()> {
        validate_name("cluster", cluster)?;
        validate_name("directory", dir)?;
        let path = self.config.directory_path(cluster, dir);
        if !self.ns.exists(&path).await? {
            return Err(SegError::NotFound(format!(
                "directory [{}] in cluster [{}] does not exist",
                dir, cluster
            )));
        }
        delete_recursive(self.ns.as_ref(), &path).await?;

        let key = directory_key(cluster, dir);
        if let Some(entry) = self.opened.lock().await.remove(&key) {
            if let Err(e) = entry.dir.close().await {
                warn!("SegStoreMgr: close {} failed: {}", key, e);
            }
        }

        for root in self.config.local_paths.iter() {
            let local_path = root.join(cluster).join(dir);
            match fs::remove_dir_all(&local_path).await {
                Ok(()) => debug!("SegStoreMgr: removed local copy {}", local_path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.remote_factory.remove_directory(cluster, dir).await?;
        info!(
            "SegStoreMgr: removed directory [{}] in cluster [{}]",
            dir, cluster
        );
        Ok(())
    }

    pub async fn remove_cluster(&self, cluster: &str) -> SegResult<()> {
        validate_name("cluster", cluster)?;
        let path = self.config.cluster_path(cluster);
        if !self.ns.exists(&path).await? {
            return Err(SegError::NotFound(format!(
                "cluster [{}] does not exist",
                cluster
            )));
        }
        for dir in self.list_directories(cluster).await? {
            self.remove_directory(cluster, &dir).await?;
        }
        match self.ns.delete(&path, None).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        info!("SegStoreMgr: removed cluster [{}]", cluster);
        Ok(())
    }

    /// Closes every opened directory and ends the namespace session.
    pub async fn close(&self) -> SegResult<()> {
        let opened: Vec<(String, OpenedDirectory)> = self.opened.lock().await.drain().collect();
        for (key, entry) in opened {
            if let Err(e) = entry.dir.close().await {
                warn!("SegStoreMgr: close {} failed: {}", key, e);
            }
        }
        self.ns.close().await
    }

    async fn select_local_path(&self, cluster: &str, dir: &str) -> SegResult<PathBuf> {
        if self.config.local_paths.is_empty() {
            return Err(SegError::InvalidState(
                "no local_paths configured".to_string(),
            ));
        }
        for root in self.config.local_paths.iter() {
            let existing = root.join(cluster).join(dir);
            if let Ok(meta) = fs::metadata(&existing).await {
                if meta.is_dir() {
                    debug!("SegStoreMgr: reuse local copy {}", existing.display());
                    return Ok(existing);
                }
            }
        }

        let mut roots: Vec<&PathBuf> = self.config.local_paths.iter().collect();
        roots.shuffle(&mut rand::thread_rng());
        for root in roots {
            if is_writable(root).await {
                return Ok(root.join(cluster).join(dir));
            }
            warn!("SegStoreMgr: local root {} is not writable", root.display());
        }
        Err(SegError::Unavailable(format!(
            "no writable local root for [{}/{}]",
            cluster, dir
        )))
    }
}

async fn is_writable(root: &Path) -> bool {
    if fs::create_dir_all(root).await.is_err() {
        return false;
    }
    let probe = root.join(format!(".segdir_probe_{:016x}", rand::random::<u64>()));
    if fs::write(&probe, b"").await.is_err() {
        return false;
    }
    fs::remove_file(&probe).await.is_ok()
}
