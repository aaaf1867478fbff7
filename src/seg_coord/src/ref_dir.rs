use crate::lock::CoordLock;
use crate::namespace::{join_path, mk_nodes, CoordNamespace};
use async_trait::async_trait;
use log::{debug, info, warn};
use segdir_lib::{SegDirectory, SegFileReader, SegFileReaderBox, SegFileWriterBox, SegResult};
use std::sync::Arc;

/// Wraps a directory so that every open read handle is announced as an
/// ephemeral `<ref_path>/<name>.<seq>` node for as long as it stays open.
pub struct RefTrackingDirectory {
    inner: Arc<dyn SegDirectory>,
    ns: Arc<dyn CoordNamespace>,
    ref_path: String,
    lock_path: String,
}

impl RefTrackingDirectory {
    pub async fn new(
        inner: Arc<dyn SegDirectory>,
        ns: Arc<dyn CoordNamespace>,
        ref_path: impl Into<String>,
        lock_path: impl Into<String>,
    ) -> SegResult<Self> {
        let ref_path = ref_path.into();
        let lock_path = lock_path.into();
        mk_nodes(ns.as_ref(), &ref_path).await?;
        mk_nodes(ns.as_ref(), &lock_path).await?;
        Ok(Self {
            inner,
            ns,
            ref_path,
            lock_path,
        })
    }

    pub fn inner(&self) -> &Arc<dyn SegDirectory> {
        &self.inner
    }

    pub fn namespace(&self) -> &Arc<dyn CoordNamespace> {
        &self.ns
    }

    pub fn ref_path(&self) -> &str {
        &self.ref_path
    }

    pub fn lock_path(&self) -> &str {
        &self.lock_path
    }

    pub fn make_lock(&self, name: &str) -> CoordLock {
        CoordLock::new(self.ns.clone(), self.lock_path.clone(), name)
    }

    /// Lock nodes are ephemeral and go away with their session, so there is
    /// nothing to clear by hand.
    pub fn clear_lock(&self, name: &str) {
        info!(
            "RefTrackingDirectory: clear_lock {} ignored, {} nodes are ephemeral",
            name, self.lock_path
        );
    }
}

#[async_trait]
impl SegDirectory for RefTrackingDirectory {
    async fn list_all(&self) -> SegResult<Vec<String>> {
        self.inner.list_all().await
    }

    async fn file_exists(&self, name: &str) -> SegResult<bool> {
        self.inner.file_exists(name).await
    }

    async fn file_length(&self, name: &str) -> SegResult<u64> {
        self.inner.file_length(name).await
    }

    async fn file_modified(&self, name: &str) -> SegResult<u64> {
        self.inner.file_modified(name).await
    }

    async fn touch_file(&self, name: &str) -> SegResult<()> {
        self.inner.touch_file(name).await
    }

    async fn delete_file(&self, name: &str) -> SegResult<()> {
        self.inner.delete_file(name).await
    }

    async fn create_output(&self, name: &str) -> SegResult<SegFileWriterBox> {
        self.inner.create_output(name).await
    }

    async fn open_input(&self, name: &str) -> SegResult<SegFileReaderBox> {
        let prefix = format!("{}.", join_path(&self.ref_path, name));
        let marker = self.ns.create_ephemeral_sequential(&prefix, &[]).await?;
        match self.inner.open_input(name).await {
            Ok(reader) => {
                debug!("RefTrackingDirectory: opened {} with marker {}", name, marker);
                Ok(Box::new(RefTrackedReader {
                    inner: reader,
                    ns: self.ns.clone(),
                    marker: Some(marker),
                }))
            }
            Err(e) => {
                if let Err(del_err) = remove_marker(self.ns.as_ref(), &marker).await {
                    warn!(
                        "RefTrackingDirectory: remove marker {} after failed open failed: {}",
                        marker, del_err
                    );
                }
                Err(e)
            }
        }
    }

    async fn sync(&self, name: &str) -> SegResult<()> {
        self.inner.sync(name).await
    }

    async fn close(&self) -> SegResult<()> {
        self.inner.close().await
    }

    fn describe(&self) -> String {
        format!("refs:{}@{}", self.ref_path, self.inner.describe())
    }
}

async fn remove_marker(ns: &dyn CoordNamespace, marker: &str) -> SegResult<()> {
    match ns.delete(marker, None).await {
        Ok(()) => Ok(()),
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e),
    }
}

/// Read handle that owns its reference marker.
struct RefTrackedReader {
    inner: SegFileReaderBox,
    ns: Arc<dyn CoordNamespace>,
    marker: Option<String>,
}

#[async_trait]
impl SegFileReader for RefTrackedReader {
    fn length(&self) -> u64 {
        self.inner.length()
    }

    fn position(&self) -> u64 {
        self.inner.position()
    }

    async fn seek(&mut self, pos: u64) -> SegResult<()> {
        self.inner.seek(pos).await
    }

    async fn read(&mut self, buf: &mut [u8]) -> SegResult<usize> {
        self.inner.read(buf).await
    }

    async fn close(&mut self) -> SegResult<()> {
        let result = self.inner.close().await;
        if let Some(marker) = self.marker.take() {
            remove_marker(self.ns.as_ref(), &marker).await?;
            debug!("RefTrackedReader: released marker {}", marker);
        }
        result
    }
}

impl Drop for RefTrackedReader {
    fn drop(&mut self) {
        let marker = match self.marker.take() {
            Some(marker) => marker,
            None => return,
        };
        // dropped without close; session expiry covers the no-runtime case
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let ns = self.ns.clone();
                handle.spawn(async move {
                    if let Err(e) = remove_marker(ns.as_ref(), &marker).await {
                        warn!("RefTrackedReader: remove marker {} failed: {}", marker, e);
                    }
                });
            }
            Err(_) => warn!(
                "RefTrackedReader: dropped outside a runtime, marker {} left to session expiry",
                marker
            ),
        }
    }
}
