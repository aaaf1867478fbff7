use async_trait::async_trait;
use segdir_lib::{FileMeta, SegResult};

/// Key/value storage of fixed-size blocks plus per-file metadata.
///
/// Every single call is atomic for its key; there is no multi-key transaction.
#[async_trait]
pub trait BlockStore: Send + Sync {
    fn store_id(&self) -> &str;

    /// Returns `None` when the block was never stored.
    async fn get_block(&self, file_name: &str, block_id: u64) -> SegResult<Option<Vec<u8>>>;
    async fn put_block(&self, file_name: &str, block_id: u64, data: &[u8]) -> SegResult<()>;
    async fn delete_block(&self, file_name: &str, block_id: u64) -> SegResult<()>;

    /// `NotFound` when no metadata is recorded for the file.
    async fn get_file_meta(&self, file_name: &str) -> SegResult<FileMeta>;
    /// Records the length and stamps the modification time.
    async fn set_length(&self, file_name: &str, length: u64) -> SegResult<()>;
    async fn delete_meta(&self, file_name: &str) -> SegResult<()>;

    async fn list_files(&self) -> SegResult<Vec<String>>;
    async fn exists(&self, file_name: &str) -> SegResult<bool>;

    async fn get_length(&self, file_name: &str) -> SegResult<u64> {
        Ok(self.get_file_meta(file_name).await?.length)
    }

    async fn flush(&self, _file_name: &str) -> SegResult<()> {
        Ok(())
    }

    async fn close(&self) -> SegResult<()> {
        Ok(())
    }
}
