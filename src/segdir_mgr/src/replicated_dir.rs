use crate::replication::{bootstrap_local, copy_file};
use async_trait::async_trait;
use log::{debug, info, warn};
use segdir_lib::{
    SegDirectory, SegError, SegFileWriter, SegFileReaderBox, SegFileWriterBox, SegResult,
};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

type NameCache = Arc<Mutex<BTreeSet<String>>>;

/// A local working copy paired with its remote copy.
///
/// In writing mode the local copy is authoritative: files are written
/// locally and `sync` pushes them out. In read-only mode the remote copy is
/// authoritative: `sync` pulls files in and drops local files the remote no
/// longer has.
pub struct ReplicatedDirectory {
    local: Arc<dyn SegDirectory>,
    remote: Arc<dyn SegDirectory>,
    writing: bool,
    buffer_size: usize,
    names: NameCache,
}

impl ReplicatedDirectory {
    pub async fn new(
        local: Arc<dyn SegDirectory>,
        remote: Arc<dyn SegDirectory>,
        writing: bool,
        buffer_size: usize,
    ) -> SegResult<Self> {
        let names = if writing {
            bootstrap_local(remote.as_ref(), local.as_ref(), buffer_size).await?;
            local.list_all().await?
        } else {
            remote.list_all().await?
        };
        info!(
            "ReplicatedDirectory: opened {} <-> {} ({} mode, {} files)",
            local.describe(),
            remote.describe(),
            if writing { "writing" } else { "read-only" },
            names.len()
        );
        Ok(Self {
            local,
            remote,
            writing,
            buffer_size,
            names: Arc::new(Mutex::new(names.into_iter().collect())),
        })
    }

    pub fn is_writing(&self) -> bool {
        self.writing
    }

    pub fn local(&self) -> &Arc<dyn SegDirectory> {
        &self.local
    }

    pub fn remote(&self) -> &Arc<dyn SegDirectory> {
        &self.remote
    }

    fn cache(&self) -> SegResult<std::sync::MutexGuard<'_, BTreeSet<String>>> {
        self.names
            .lock()
            .map_err(|e| SegError::Internal(format!("name cache poisoned: {}", e)))
    }

    fn set_cached(&self, name: &str, present: bool) -> SegResult<()> {
        let mut names = self.cache()?;
        if present {
            names.insert(name.to_string());
        } else {
            names.remove(name);
        }
        Ok(())
    }

    async fn pull(&self, name: &str) -> SegResult<()> {
        match copy_file(
            name,
            self.remote.as_ref(),
            self.local.as_ref(),
            self.buffer_size,
        )
        .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => {
                debug!("ReplicatedDirectory: {} not on either side, skip", name);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn prune_local(&self) -> SegResult<()> {
        let remote_names: BTreeSet<String> = self.remote.list_all().await?.into_iter().collect();
        for name in self.local.list_all().await? {
            if remote_names.contains(&name) {
                continue;
            }
            if let Err(e) = self.local.delete_file(&name).await {
                if !e.is_not_found() {
                    warn!(
                        "ReplicatedDirectory: prune local {} failed: {}",
                        name, e
                    );
                }
            }
        }
        *self.cache()? = remote_names;
        Ok(())
    }
}

#[async_trait]
impl SegDirectory for ReplicatedDirectory {
    async fn list_all(&self) -> SegResult<Vec<String>> {
        if self.writing {
            return Ok(self.cache()?.iter().cloned().collect());
        }
        let names = self.remote.list_all().await?;
        *self.cache()? = names.iter().cloned().collect();
        Ok(names)
    }

    async fn file_exists(&self, name: &str) -> SegResult<bool> {
        let local_exists = self.local.file_exists(name).await?;
        let remote_exists = self.remote.file_exists(name).await?;
        if local_exists == remote_exists {
            return Ok(local_exists);
        }
        debug!(
            "ReplicatedDirectory: {} local={} remote={}, reconciling",
            name, local_exists, remote_exists
        );
        self.sync(name).await?;
        let exists = self.local.file_exists(name).await?;
        self.set_cached(name, exists)?;
        Ok(exists)
    }

    async fn file_length(&self, name: &str) -> SegResult<u64> {
        self.local.file_length(name).await
    }

    async fn file_modified(&self, name: &str) -> SegResult<u64> {
        self.local.file_modified(name).await
    }

    async fn touch_file(&self, name: &str) -> SegResult<()> {
        if !self.writing {
            return Ok(());
        }
        self.local.touch_file(name).await?;
        self.set_cached(name, true)
    }

    async fn delete_file(&self, name: &str) -> SegResult<()> {
        let local_result = self.local.delete_file(name).await;
        let remote_result = self.remote.delete_file(name).await;
        self.set_cached(name, false)?;
        match (local_result, remote_result) {
            (Err(l), Err(r)) if l.is_not_found() && r.is_not_found() => Err(l),
            (Err(e), _) if !e.is_not_found() => Err(e),
            (_, Err(e)) if !e.is_not_found() => Err(e),
            _ => Ok(()),
        }
    }

    async fn create_output(&self, name: &str) -> SegResult<SegFileWriterBox> {
        if !self.writing {
            return Err(SegError::InvalidState(format!(
                "create_output {} on read-only replicated directory",
                name
            )));
        }
        let inner = self.local.create_output(name).await?;
        Ok(Box::new(CachingFileWriter {
            inner,
            name: name.to_string(),
            names: self.names.clone(),
        }))
    }

    async fn open_input(&self, name: &str) -> SegResult<SegFileReaderBox> {
        if !self.writing && !self.local.file_exists(name).await? {
            self.pull(name).await?;
        }
        self.local.open_input(name).await
    }

    async fn sync(&self, name: &str) -> SegResult<()> {
        if self.writing {
            copy_file(
                name,
                self.local.as_ref(),
                self.remote.as_ref(),
                self.buffer_size,
            )
            .await?;
            return Ok(());
        }
        self.pull(name).await?;
        self.prune_local().await
    }

    async fn close(&self) -> SegResult<()> {
        debug!("ReplicatedDirectory: close {}", self.describe());
        Ok(())
    }

    fn describe(&self) -> String {
        format!(
            "replicated({}):{}<->{}",
            if self.writing { "rw" } else { "ro" },
            self.local.describe(),
            self.remote.describe()
        )
    }
}

/// Records the file in the name cache once its content is complete.
struct CachingFileWriter {
    inner: SegFileWriterBox,
    name: String,
    names: NameCache,
}

#[async_trait]
impl SegFileWriter for CachingFileWriter {
    fn position(&self) -> u64 {
        self.inner.position()
    }

    fn length(&self) -> u64 {
        self.inner.length()
    }

    async fn seek(&mut self, pos: u64) -> SegResult<()> {
        self.inner.seek(pos).await
    }

    async fn write(&mut self, data: &[u8]) -> SegResult<()> {
        self.inner.write(data).await
    }

    async fn flush(&mut self) -> SegResult<()> {
        self.inner.flush().await
    }

    async fn close(&mut self) -> SegResult<()> {
        self.inner.close().await?;
        let mut names = self
            .names
            .lock()
            .map_err(|e| SegError::Internal(format!("name cache poisoned: {}", e)))?;
        names.insert(self.name.clone());
        Ok(())
    }
}
