use crate::{SegError, SegResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FileMeta {
    pub length: u64,
    /// Milliseconds since the unix epoch.
    pub modified: u64,
}

/// Random-access read handle on one file of a directory.
#[async_trait]
pub trait SegFileReader: Send {
    /// Length of the file as observed when the handle was opened.
    fn length(&self) -> u64;
    fn position(&self) -> u64;
    async fn seek(&mut self, pos: u64) -> SegResult<()>;
    /// Reads at most `buf.len()` bytes from the current position. Returns 0 at end of file.
    async fn read(&mut self, buf: &mut [u8]) -> SegResult<usize>;
    async fn close(&mut self) -> SegResult<()>;

    async fn read_exact(&mut self, buf: &mut [u8]) -> SegResult<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read(&mut buf[filled..]).await?;
            if n == 0 {
                return Err(SegError::OffsetTooLarge(format!(
                    "read past end of file: position {} length {}",
                    self.position(),
                    self.length()
                )));
            }
            filled += n;
        }
        Ok(())
    }

    async fn read_at(&mut self, offset: u64, len: usize) -> SegResult<Vec<u8>> {
        self.seek(offset).await?;
        let mut buf = vec![0u8; len];
        self.read_exact(&mut buf).await?;
        Ok(buf)
    }
}

/// Sequential (seekable) write handle on one file of a directory.
#[async_trait]
pub trait SegFileWriter: Send {
    fn position(&self) -> u64;
    fn length(&self) -> u64;
    async fn seek(&mut self, pos: u64) -> SegResult<()>;
    async fn write(&mut self, data: &[u8]) -> SegResult<()>;
    async fn flush(&mut self) -> SegResult<()>;
    async fn close(&mut self) -> SegResult<()>;
}

pub type SegFileReaderBox = Box<dyn SegFileReader>;
pub type SegFileWriterBox = Box<dyn SegFileWriter>;

/// A flat namespace of byte files. Every storage variant (chunked block store,
/// local filesystem, replicated pair, reference tracking wrapper) implements it.
#[async_trait]
pub trait SegDirectory: Send + Sync {
    async fn list_all(&self) -> SegResult<Vec<String>>;
    async fn file_exists(&self, name: &str) -> SegResult<bool>;
    async fn file_length(&self, name: &str) -> SegResult<u64>;
    async fn file_modified(&self, name: &str) -> SegResult<u64>;
    async fn touch_file(&self, name: &str) -> SegResult<()>;
    async fn delete_file(&self, name: &str) -> SegResult<()>;
    async fn create_output(&self, name: &str) -> SegResult<SegFileWriterBox>;
    async fn open_input(&self, name: &str) -> SegResult<SegFileReaderBox>;

    async fn sync(&self, _name: &str) -> SegResult<()> {
        Ok(())
    }

    async fn close(&self) -> SegResult<()> {
        Ok(())
    }

    fn describe(&self) -> String;
}

/// Reads a whole file into memory.
pub async fn read_file(dir: &dyn SegDirectory, name: &str) -> SegResult<Vec<u8>> {
    let mut reader = dir.open_input(name).await?;
    let mut data = vec![0u8; reader.length() as usize];
    let result = reader.read_exact(&mut data).await;
    let close_result = reader.close().await;
    result?;
    close_result?;
    Ok(data)
}

/// Creates (or replaces) a file with the given content.
pub async fn write_file(dir: &dyn SegDirectory, name: &str, data: &[u8]) -> SegResult<()> {
    let mut writer = dir.create_output(name).await?;
    let result = writer.write(data).await;
    let close_result = writer.close().await;
    result?;
    close_result
}
