use crate::{ChunkedDirectory, FsDirectory, MemBlockStore, SqliteBlockStore, SqliteBlockStoreDB};
use async_trait::async_trait;
use log::info;
use segdir_lib::{directory_key, BlockSize, SegDirectory, SegError, SegResult};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::fs;

/// Opens the per-(cluster, directory) storage of one backend.
#[async_trait]
pub trait DirectoryFactory: Send + Sync {
    async fn open_directory(&self, cluster: &str, dir: &str) -> SegResult<Arc<dyn SegDirectory>>;
    /// Drops all files of the directory. Removing a directory that holds nothing succeeds.
    async fn remove_directory(&self, cluster: &str, dir: &str) -> SegResult<()>;
    fn describe(&self) -> String;
}

/// `<base_path>/<cluster>/<dir>` folders on local disk.
pub struct FsDirectoryFactory {
    base_path: PathBuf,
}

impl FsDirectoryFactory {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn directory_path(&self, cluster: &str, dir: &str) -> PathBuf {
        self.base_path.join(cluster).join(dir)
    }
}

#[async_trait]
impl DirectoryFactory for FsDirectoryFactory {
    async fn open_directory(&self, cluster: &str, dir: &str) -> SegResult<Arc<dyn SegDirectory>> {
        let fs_dir = FsDirectory::open(self.directory_path(cluster, dir)).await?;
        Ok(Arc::new(fs_dir))
    }

    async fn remove_directory(&self, cluster: &str, dir: &str) -> SegResult<()> {
        let path = self.directory_path(cluster, dir);
        match fs::remove_dir_all(&path).await {
            Ok(_) => {
                info!("FsDirectoryFactory: removed {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn describe(&self) -> String {
        format!("fs:{}", self.base_path.display())
    }
}

/// Chunked directories sharing one SQLite database.
pub struct SqliteDirectoryFactory {
    db: Arc<SqliteBlockStoreDB>,
    block_size: BlockSize,
}

impl SqliteDirectoryFactory {
    pub fn new(db: Arc<SqliteBlockStoreDB>, block_size: BlockSize) -> Self {
        Self { db, block_size }
    }
}

#[async_trait]
impl DirectoryFactory for SqliteDirectoryFactory {
    async fn open_directory(&self, cluster: &str, dir: &str) -> SegResult<Arc<dyn SegDirectory>> {
        let store = SqliteBlockStore::new(self.db.clone(), directory_key(cluster, dir));
        Ok(Arc::new(ChunkedDirectory::new(
            Arc::new(store),
            self.block_size,
        )))
    }

    async fn remove_directory(&self, cluster: &str, dir: &str) -> SegResult<()> {
        self.db.remove_directory(&directory_key(cluster, dir))
    }

    fn describe(&self) -> String {
        format!("sqlite:{} ({})", self.db.db_path, self.block_size)
    }
}

/// Chunked directories over in-process block stores. Stores live as long as
/// the factory, so reopening a directory sees earlier writes.
pub struct MemDirectoryFactory {
    block_size: BlockSize,
    stores: Mutex<HashMap<String, Arc<MemBlockStore>>>,
}

impl MemDirectoryFactory {
    pub fn new(block_size: BlockSize) -> Self {
        Self {
            block_size,
            stores: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self, cluster: &str, dir: &str) -> Option<Arc<MemBlockStore>> {
        let stores = self.stores.lock().ok()?;
        stores.get(&directory_key(cluster, dir)).cloned()
    }
}

#[async_trait]
impl DirectoryFactory for MemDirectoryFactory {
    async fn open_directory(&self, cluster: &str, dir: &str) -> SegResult<Arc<dyn SegDirectory>> {
        let key = directory_key(cluster, dir);
        let store = {
            let mut stores = self
                .stores
                .lock()
                .map_err(|e| SegError::Internal(e.to_string()))?;
            stores
                .entry(key.clone())
                .or_insert_with(|| Arc::new(MemBlockStore::new(key)))
                .clone()
        };
        Ok(Arc::new(ChunkedDirectory::new(store, self.block_size)))
    }

    async fn remove_directory(&self, cluster: &str, dir: &str) -> SegResult<()> {
        let mut stores = self
            .stores
            .lock()
            .map_err(|e| SegError::Internal(e.to_string()))?;
        stores.remove(&directory_key(cluster, dir));
        Ok(())
    }

    fn describe(&self) -> String {
        format!("memory ({})", self.block_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use segdir_lib::{read_file, write_file};
    use std::time::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_fs_factory_remove() {
        let tmp = TempDir::new().unwrap();
        let factory = FsDirectoryFactory::new(tmp.path());
        let dir = factory.open_directory("c1", "d1").await.unwrap();
        write_file(dir.as_ref(), "seg.0", b"abc").await.unwrap();
        assert!(tmp.path().join("c1").join("d1").join("seg.0").exists());

        factory.remove_directory("c1", "d1").await.unwrap();
        assert!(!tmp.path().join("c1").join("d1").exists());
        factory.remove_directory("c1", "d1").await.unwrap();
    }

    #[tokio::test]
    async fn test_sqlite_factory_reopen() {
        let tmp = TempDir::new().unwrap();
        let db_path = tmp.path().join("remote.db").to_string_lossy().to_string();
        let db = Arc::new(SqliteBlockStoreDB::new(db_path, Duration::from_secs(1)).unwrap());
        let factory = SqliteDirectoryFactory::new(db, BlockSize::Size1K);

        let dir = factory.open_directory("c1", "d1").await.unwrap();
        let data = vec![7u8; 3000];
        write_file(dir.as_ref(), "seg.0", &data).await.unwrap();

        let again = factory.open_directory("c1", "d1").await.unwrap();
        assert_eq!(read_file(again.as_ref(), "seg.0").await.unwrap(), data);
        let other = factory.open_directory("c1", "d2").await.unwrap();
        assert!(other.list_all().await.unwrap().is_empty());

        factory.remove_directory("c1", "d1").await.unwrap();
        assert!(again.list_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mem_factory_shares_store() {
        let factory = MemDirectoryFactory::new(BlockSize::Size4K);
        let dir = factory.open_directory("c1", "d1").await.unwrap();
        write_file(dir.as_ref(), "a", b"123").await.unwrap();
        let again = factory.open_directory("c1", "d1").await.unwrap();
        assert_eq!(again.file_length("a").await.unwrap(), 3);
        assert!(factory.store("c1", "d1").is_some());

        factory.remove_directory("c1", "d1").await.unwrap();
        assert!(factory.store("c1", "d1").is_none());
    }
}
