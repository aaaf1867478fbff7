use crate::BlockStore;
use async_trait::async_trait;
use log::{debug, info};
use segdir_lib::{
    BlockSize, SegDirectory, SegError, SegFileReader, SegFileReaderBox, SegFileWriter,
    SegFileWriterBox, SegResult,
};
use std::sync::Arc;

/// Directory that maps random-access file I/O onto fixed-size blocks of a [`BlockStore`].
///
/// Block `n` of a file holds bytes `[n << shift, (n + 1) << shift)`. The file
/// length lives in the store's metadata and only grows after the blocks it
/// covers were stored, so a reader never sees a length beyond written data.
/// No locks are taken here; single-writer-per-file is enforced above.
#[derive(Clone)]
pub struct ChunkedDirectory {
    store: Arc<dyn BlockStore>,
    block_size: BlockSize,
}

impl ChunkedDirectory {
    pub fn new(store: Arc<dyn BlockStore>, block_size: BlockSize) -> Self {
        Self { store, block_size }
    }

    pub fn block_size(&self) -> BlockSize {
        self.block_size
    }

    pub fn store(&self) -> &Arc<dyn BlockStore> {
        &self.store
    }

    async fn remove_blocks(&self, name: &str, length: u64) -> SegResult<()> {
        if let Some(last_block_id) = self.block_size.last_block_id(length) {
            for block_id in 0..=last_block_id {
                self.store.delete_block(name, block_id).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SegDirectory for ChunkedDirectory {
    async fn list_all(&self) -> SegResult<Vec<String>> {
        self.store.list_files().await
    }

    async fn file_exists(&self, name: &str) -> SegResult<bool> {
        self.store.exists(name).await
    }

    async fn file_length(&self, name: &str) -> SegResult<u64> {
        self.store.get_length(name).await
    }

    async fn file_modified(&self, name: &str) -> SegResult<u64> {
        Ok(self.store.get_file_meta(name).await?.modified)
    }

    async fn touch_file(&self, name: &str) -> SegResult<()> {
        let length = match self.store.get_length(name).await {
            Ok(length) => length,
            Err(e) if e.is_not_found() => 0,
            Err(e) => return Err(e),
        };
        self.store.set_length(name, length).await
    }

    async fn delete_file(&self, name: &str) -> SegResult<()> {
        let length = self.store.get_length(name).await?;
        // metadata goes first: a racing reader sees NotFound, never a half-deleted file
        self.store.delete_meta(name).await?;
        self.remove_blocks(name, length).await?;
        debug!(
            "ChunkedDirectory: deleted file {} ({} bytes) from {}",
            name,
            length,
            self.store.store_id()
        );
        Ok(())
    }

    async fn create_output(&self, name: &str) -> SegResult<SegFileWriterBox> {
        if let Ok(old_length) = self.store.get_length(name).await {
            self.store.delete_meta(name).await?;
            self.remove_blocks(name, old_length).await?;
        }
        self.store.set_length(name, 0).await?;
        Ok(Box::new(ChunkedFileWriter::new(
            self.store.clone(),
            self.block_size,
            name.to_string(),
        )))
    }

    async fn open_input(&self, name: &str) -> SegResult<SegFileReaderBox> {
        if !self.store.exists(name).await? {
            // the producer probes for files by opening them; an absent file reads as empty
            self.touch_file(name).await?;
        }
        let length = self.store.get_length(name).await?;
        Ok(Box::new(ChunkedFileReader::new(
            self.store.clone(),
            self.block_size,
            name.to_string(),
            length,
        )))
    }

    async fn close(&self) -> SegResult<()> {
        self.store.close().await
    }

    fn describe(&self) -> String {
        format!(
            "chunked:{{\"store\":\"{}\",\"block_size\":\"{}\"}}",
            self.store.store_id(),
            self.block_size
        )
    }
}

/// Buffers up to one block of data, then writes it through to the store.
pub struct ChunkedFileWriter {
    store: Arc<dyn BlockStore>,
    block_size: BlockSize,
    name: String,
    buffer: Vec<u8>,
    // file position of buffer[0]
    buffer_start: u64,
    file_length: u64,
    closed: bool,
}

impl ChunkedFileWriter {
    fn new(store: Arc<dyn BlockStore>, block_size: BlockSize, name: String) -> Self {
        Self {
            store,
            block_size,
            name,
            buffer: Vec::with_capacity(block_size.size()),
            buffer_start: 0,
            file_length: 0,
            closed: false,
        }
    }

    fn check_open(&self) -> SegResult<()> {
        if self.closed {
            return Err(SegError::InvalidState(format!(
                "writer for {} already closed",
                self.name
            )));
        }
        Ok(())
    }

    async fn flush_buffer(&mut self) -> SegResult<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let mut position = self.buffer_start;
        let mut offset = 0usize;
        while offset < self.buffer.len() {
            let block_id = self.block_size.block_id(position);
            let inner_pos = self.block_size.offset_in_block(position);
            let len = (self.buffer.len() - offset).min(self.block_size.size() - inner_pos);

            let mut block = if inner_pos == 0 && len == self.block_size.size() {
                vec![0u8; self.block_size.size()]
            } else {
                match self.store.get_block(&self.name, block_id).await? {
                    Some(mut block) => {
                        block.resize(self.block_size.size(), 0);
                        block
                    }
                    None => vec![0u8; self.block_size.size()],
                }
            };
            block[inner_pos..inner_pos + len].copy_from_slice(&self.buffer[offset..offset + len]);
            self.store.put_block(&self.name, block_id, &block).await?;

            position += len as u64;
            offset += len;
        }

        if position > self.file_length {
            self.file_length = position;
            self.store.set_length(&self.name, position).await?;
        }
        self.buffer_start = position;
        self.buffer.clear();
        Ok(())
    }
}

#[async_trait]
impl SegFileWriter for ChunkedFileWriter {
    fn position(&self) -> u64 {
        self.buffer_start + self.buffer.len() as u64
    }

    fn length(&self) -> u64 {
        self.file_length.max(self.position())
    }

    async fn seek(&mut self, pos: u64) -> SegResult<()> {
        self.check_open()?;
        self.flush_buffer().await?;
        self.buffer_start = pos;
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> SegResult<()> {
        self.check_open()?;
        let mut remaining = data;
        while !remaining.is_empty() {
            let room = self.block_size.size() - self.buffer.len();
            let take = room.min(remaining.len());
            self.buffer.extend_from_slice(&remaining[..take]);
            remaining = &remaining[take..];
            if self.buffer.len() == self.block_size.size() {
                self.flush_buffer().await?;
            }
        }
        Ok(())
    }

    async fn flush(&mut self) -> SegResult<()> {
        self.check_open()?;
        self.flush_buffer().await?;
        self.store.flush(&self.name).await
    }

    async fn close(&mut self) -> SegResult<()> {
        if self.closed {
            return Ok(());
        }
        self.flush_buffer().await?;
        self.store.flush(&self.name).await?;
        self.closed = true;
        info!(
            "ChunkedFileWriter: closed {} at length {}",
            self.name, self.file_length
        );
        Ok(())
    }
}

/// Reads blocks on demand, keeping the most recently fetched one.
pub struct ChunkedFileReader {
    store: Arc<dyn BlockStore>,
    block_size: BlockSize,
    name: String,
    length: u64,
    position: u64,
    cached_block: Option<(u64, Vec<u8>)>,
}

impl ChunkedFileReader {
    fn new(store: Arc<dyn BlockStore>, block_size: BlockSize, name: String, length: u64) -> Self {
        Self {
            store,
            block_size,
            name,
            length,
            position: 0,
            cached_block: None,
        }
    }

    async fn load_block(&mut self, block_id: u64) -> SegResult<&[u8]> {
        let cached = matches!(&self.cached_block, Some((id, _)) if *id == block_id);
        if !cached {
            // a block the store never persisted reads as zeros
            let mut block = self
                .store
                .get_block(&self.name, block_id)
                .await?
                .unwrap_or_default();
            block.resize(self.block_size.size(), 0);
            self.cached_block = Some((block_id, block));
        }
        match &self.cached_block {
            Some((_, block)) => Ok(block.as_slice()),
            None => Err(SegError::Internal("block cache empty".to_string())),
        }
    }
}

#[async_trait]
impl SegFileReader for ChunkedFileReader {
    fn length(&self) -> u64 {
        self.length
    }

    fn position(&self) -> u64 {
        self.position
    }

    async fn seek(&mut self, pos: u64) -> SegResult<()> {
        if pos > self.length {
            return Err(SegError::OffsetTooLarge(format!(
                "seek to {} beyond length {} of {}",
                pos, self.length, self.name
            )));
        }
        self.position = pos;
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> SegResult<usize> {
        let available = self.length.saturating_sub(self.position);
        let mut len = (buf.len() as u64).min(available) as usize;
        let mut off = 0usize;
        while len > 0 {
            let block_id = self.block_size.block_id(self.position);
            let inner_pos = self.block_size.offset_in_block(self.position);
            let block_size = self.block_size.size();
            let block = self.load_block(block_id).await?;
            let n = len.min(block_size - inner_pos);
            buf[off..off + n].copy_from_slice(&block[inner_pos..inner_pos + n]);
            self.position += n as u64;
            off += n;
            len -= n;
        }
        Ok(off)
    }

    async fn close(&mut self) -> SegResult<()> {
        self.cached_block = None;
        Ok(())
    }
}
