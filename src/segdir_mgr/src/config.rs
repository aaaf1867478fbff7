use seg_coord::join_path;
use segdir_lib::{
    BlockSize, SegError, SegResult, DEFAULT_BASE_COORD_PATH, DEFAULT_COPY_BUFFER_SIZE,
    DEFAULT_LOCKS_NAME, DEFAULT_REFS_NAME,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_SEGDIR_CONFIG_PATH: &str = "/opt/segdir/etc/segdir.json";
pub const DEFAULT_SESSION_TIMEOUT_MS: u64 = 3000;
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5000;

/// Where the durable copy of every directory lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RemoteStoreConfig {
    Fs {
        #[serde(alias = "path", alias = "base_dir")]
        base_path: PathBuf,
    },
    Sqlite {
        #[serde(alias = "path")]
        db_path: PathBuf,
    },
    Memory,
}

impl Default for RemoteStoreConfig {
    fn default() -> Self {
        RemoteStoreConfig::Memory
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CoordConfig {
    Memory,
    Sqlite {
        #[serde(alias = "path")]
        db_path: PathBuf,
    },
}

impl Default for CoordConfig {
    fn default() -> Self {
        CoordConfig::Memory
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegStoreConfig {
    #[serde(alias = "base_zk_path", alias = "coord_base_path")]
    pub base_coord_path: String,
    #[serde(alias = "reference_node_name")]
    pub refs_name: String,
    #[serde(alias = "lock_node_name")]
    pub locks_name: String,
    #[serde(alias = "local_replication_paths", alias = "local_dirs")]
    pub local_paths: Vec<PathBuf>,
    pub block_size: BlockSize,
    #[serde(alias = "buffer_size")]
    pub copy_buffer_size: usize,
    pub remote: RemoteStoreConfig,
    pub coord: CoordConfig,
    pub session_timeout_ms: u64,
    pub busy_timeout_ms: u64,
}

impl Default for SegStoreConfig {
    fn default() -> Self {
        Self {
            base_coord_path: DEFAULT_BASE_COORD_PATH.to_string(),
            refs_name: DEFAULT_REFS_NAME.to_string(),
            locks_name: DEFAULT_LOCKS_NAME.to_string(),
            local_paths: Vec::new(),
            block_size: BlockSize::default(),
            copy_buffer_size: DEFAULT_COPY_BUFFER_SIZE,
            remote: RemoteStoreConfig::default(),
            coord: CoordConfig::default(),
            session_timeout_ms: DEFAULT_SESSION_TIMEOUT_MS,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }
}

impl SegStoreConfig {
    pub fn load_from_file(path: &Path) -> SegResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                SegError::NotFound(format!("config {} not found", path.display()))
            }
            _ => SegError::IoError(format!("read {} failed: {}", path.display(), e)),
        })?;
        let config = serde_json::from_str::<SegStoreConfig>(&content).map_err(|e| {
            SegError::InvalidParam(format!("parse {} failed: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> SegResult<()> {
        if !self.base_coord_path.starts_with('/') {
            return Err(SegError::InvalidParam(format!(
                "base_coord_path must be absolute: {}",
                self.base_coord_path
            )));
        }
        for name in [&self.refs_name, &self.locks_name] {
            if name.is_empty() || name.contains('/') {
                return Err(SegError::InvalidParam(format!(
                    "invalid namespace node name: {:?}",
                    name
                )));
            }
        }
        if self.refs_name == self.locks_name {
            return Err(SegError::InvalidParam(
                "refs_name and locks_name must differ".to_string(),
            ));
        }
        if self.copy_buffer_size == 0 {
            return Err(SegError::InvalidParam(
                "copy_buffer_size must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn cluster_path(&self, cluster: &str) -> String {
        join_path(&self.base_coord_path, cluster)
    }

    pub fn directory_path(&self, cluster: &str, dir: &str) -> String {
        join_path(&self.cluster_path(cluster), dir)
    }

    pub fn ref_path(&self, cluster: &str, dir: &str) -> String {
        join_path(&self.directory_path(cluster, dir), &self.refs_name)
    }

    pub fn lock_path(&self, cluster: &str, dir: &str) -> String {
        join_path(&self.directory_path(cluster, dir), &self.locks_name)
    }
}
