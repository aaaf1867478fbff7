use crate::BlockStore;
use async_trait::async_trait;
use segdir_lib::{unix_timestamp_millis, FileMeta, SegError, SegResult};
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

#[derive(Default)]
struct MemStoreInner {
    blocks: HashMap<(String, u64), Vec<u8>>,
    metas: BTreeMap<String, FileMeta>,
}

/// Block store held entirely in process memory.
pub struct MemBlockStore {
    store_id: String,
    inner: RwLock<MemStoreInner>,
}

impl MemBlockStore {
    pub fn new(store_id: impl Into<String>) -> Self {
        Self {
            store_id: store_id.into(),
            inner: RwLock::new(MemStoreInner::default()),
        }
    }

    pub fn block_count(&self) -> usize {
        self.inner
            .read()
            .map(|inner| inner.blocks.len())
            .unwrap_or_default()
    }

    fn read_inner(&self) -> SegResult<std::sync::RwLockReadGuard<'_, MemStoreInner>> {
        self.inner
            .read()
            .map_err(|e| SegError::Internal(format!("mem store lock poisoned: {}", e)))
    }

    fn write_inner(&self) -> SegResult<std::sync::RwLockWriteGuard<'_, MemStoreInner>> {
        self.inner
            .write()
            .map_err(|e| SegError::Internal(format!("mem store lock poisoned: {}", e)))
    }
}

#[async_trait]
impl BlockStore for MemBlockStore {
    fn store_id(&self) -> &str {
        &self.store_id
    }

    async fn get_block(&self, file_name: &str, block_id: u64) -> SegResult<Option<Vec<u8>>> {
        let inner = self.read_inner()?;
        Ok(inner
            .blocks
            .get(&(file_name.to_string(), block_id))
            .cloned())
    }

    async fn put_block(&self, file_name: &str, block_id: u64, data: &[u8]) -> SegResult<()> {
        let mut inner = self.write_inner()?;
        inner
            .blocks
            .insert((file_name.to_string(), block_id), data.to_vec());
        Ok(())
    }

    async fn delete_block(&self, file_name: &str, block_id: u64) -> SegResult<()> {
        let mut inner = self.write_inner()?;
        inner.blocks.remove(&(file_name.to_string(), block_id));
        Ok(())
    }

    async fn get_file_meta(&self, file_name: &str) -> SegResult<FileMeta> {
        let inner = self.read_inner()?;
        inner
            .metas
            .get(file_name)
            .copied()
            .ok_or_else(|| SegError::NotFound(format!("file not found: {}", file_name)))
    }

    async fn set_length(&self, file_name: &str, length: u64) -> SegResult<()> {
        let mut inner = self.write_inner()?;
        inner.metas.insert(
            file_name.to_string(),
            FileMeta {
                length,
                modified: unix_timestamp_millis(),
            },
        );
        Ok(())
    }

    async fn delete_meta(&self, file_name: &str) -> SegResult<()> {
        let mut inner = self.write_inner()?;
        inner.metas.remove(file_name);
        Ok(())
    }

    async fn list_files(&self) -> SegResult<Vec<String>> {
        let inner = self.read_inner()?;
        Ok(inner.metas.keys().cloned().collect())
    }

    async fn exists(&self, file_name: &str) -> SegResult<bool> {
        let inner = self.read_inner()?;
        Ok(inner.metas.contains_key(file_name))
    }
}
