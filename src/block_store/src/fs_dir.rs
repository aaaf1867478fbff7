use async_trait::async_trait;
use log::{debug, warn};
use segdir_lib::{
    SegDirectory, SegError, SegFileReader, SegFileReaderBox, SegFileWriter, SegFileWriterBox,
    SegResult,
};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};

/// Directory backed by a plain folder on the local filesystem.
#[derive(Debug, Clone)]
pub struct FsDirectory {
    root: PathBuf,
}

impl FsDirectory {
    pub async fn open(root: impl Into<PathBuf>) -> SegResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await.map_err(|e| {
            warn!(
                "FsDirectory: create dir {} failed! {}",
                root.display(),
                e.to_string()
            );
            SegError::from(e)
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn file_path(&self, name: &str) -> SegResult<PathBuf> {
        if name.is_empty() || name.contains('/') || name.contains('\\') || name == ".." {
            return Err(SegError::InvalidParam(format!("invalid file name: {}", name)));
        }
        Ok(self.root.join(name))
    }
}

#[async_trait]
impl SegDirectory for FsDirectory {
    async fn list_all(&self) -> SegResult<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                names.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    async fn file_exists(&self, name: &str) -> SegResult<bool> {
        let path = self.file_path(name)?;
        match fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn file_length(&self, name: &str) -> SegResult<u64> {
        let path = self.file_path(name)?;
        Ok(fs::metadata(&path).await?.len())
    }

    async fn file_modified(&self, name: &str) -> SegResult<u64> {
        let path = self.file_path(name)?;
        let modified = fs::metadata(&path).await?.modified()?;
        Ok(modified
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default())
    }

    async fn touch_file(&self, name: &str) -> SegResult<()> {
        let path = self.file_path(name)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.into_std()
            .await
            .set_modified(std::time::SystemTime::now())?;
        Ok(())
    }

    async fn delete_file(&self, name: &str) -> SegResult<()> {
        let path = self.file_path(name)?;
        fs::remove_file(&path).await?;
        debug!("FsDirectory: deleted {}", path.display());
        Ok(())
    }

    async fn create_output(&self, name: &str) -> SegResult<SegFileWriterBox> {
        let path = self.file_path(name)?;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .await
            .map_err(|e| {
                warn!(
                    "FsDirectory: create output {} failed! {}",
                    path.display(),
                    e.to_string()
                );
                SegError::from(e)
            })?;
        Ok(Box::new(FsFileWriter {
            file: Some(file),
            position: 0,
            length: 0,
        }))
    }

    async fn open_input(&self, name: &str) -> SegResult<SegFileReaderBox> {
        let path = self.file_path(name)?;
        let file = File::open(&path).await?;
        let length = file.metadata().await?.len();
        Ok(Box::new(FsFileReader {
            file: Some(file),
            position: 0,
            length,
        }))
    }

    async fn sync(&self, name: &str) -> SegResult<()> {
        let path = self.file_path(name)?;
        let file = File::open(&path).await?;
        file.sync_all().await?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("fs:{}", self.root.display())
    }
}

struct FsFileWriter {
    file: Option<File>,
    position: u64,
    length: u64,
}

impl FsFileWriter {
    fn file_mut(&mut self) -> SegResult<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| SegError::InvalidState("writer already closed".to_string()))
    }
}

#[async_trait]
impl SegFileWriter for FsFileWriter {
    fn position(&self) -> u64 {
        self.position
    }

    fn length(&self) -> u64 {
        self.length
    }

    async fn seek(&mut self, pos: u64) -> SegResult<()> {
        self.file_mut()?.seek(SeekFrom::Start(pos)).await?;
        self.position = pos;
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> SegResult<()> {
        self.file_mut()?.write_all(data).await?;
        self.position += data.len() as u64;
        self.length = self.length.max(self.position);
        Ok(())
    }

    async fn flush(&mut self) -> SegResult<()> {
        self.file_mut()?.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> SegResult<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        Ok(())
    }
}

struct FsFileReader {
    file: Option<File>,
    position: u64,
    length: u64,
}

#[async_trait]
impl SegFileReader for FsFileReader {
    fn length(&self) -> u64 {
        self.length
    }

    fn position(&self) -> u64 {
        self.position
    }

    async fn seek(&mut self, pos: u64) -> SegResult<()> {
        if pos > self.length {
            return Err(SegError::OffsetTooLarge(format!(
                "seek to {} beyond length {}",
                pos, self.length
            )));
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| SegError::InvalidState("reader already closed".to_string()))?;
        file.seek(SeekFrom::Start(pos)).await?;
        self.position = pos;
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> SegResult<usize> {
        let available = self.length.saturating_sub(self.position);
        let len = (buf.len() as u64).min(available) as usize;
        if len == 0 {
            return Ok(0);
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| SegError::InvalidState("reader already closed".to_string()))?;
        let n = file.read(&mut buf[..len]).await?;
        self.position += n as u64;
        Ok(n)
    }

    async fn close(&mut self) -> SegResult<()> {
        self.file.take();
        Ok(())
    }
}
