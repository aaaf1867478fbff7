use async_trait::async_trait;
use log::{debug, info, warn};
use segdir_lib::{
    live_commit_files, DeletionPolicy, IndexCommitRef, SegDirectory, SegError, SegFileReader,
    SegFileWriter, SegResult, SEGMENTS_GEN_FILE,
};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyOutcome {
    /// Both sides hold the file with the same length.
    Skipped,
    Copied { bytes: u64 },
    /// The source no longer has the file, so the destination copy was dropped.
    DeletedDest,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub copied: usize,
    pub bytes: u64,
    pub skipped: usize,
    pub deleted: usize,
    pub pruned: usize,
    pub prune_failures: usize,
}

impl SyncReport {
    fn record(&mut self, outcome: CopyOutcome) {
        match outcome {
            CopyOutcome::Skipped => self.skipped += 1,
            CopyOutcome::Copied { bytes } => {
                self.copied += 1;
                self.bytes += bytes;
            }
            CopyOutcome::DeletedDest => self.deleted += 1,
        }
    }
}

/// Brings `dest`'s copy of `name` in line with `src`.
///
/// Change detection is by length only: equal lengths on both sides mean the
/// file is already there. Both handles are closed even when the copy fails,
/// the destination first.
pub async fn copy_file(
    name: &str,
    src: &dyn SegDirectory,
    dest: &dyn SegDirectory,
    buffer_size: usize,
) -> SegResult<CopyOutcome> {
    let src_exists = src.file_exists(name).await?;
    let dest_exists = dest.file_exists(name).await?;
    match (src_exists, dest_exists) {
        (true, true) => {
            if src.file_length(name).await? == dest.file_length(name).await? {
                return Ok(CopyOutcome::Skipped);
            }
            dest.delete_file(name).await?;
        }
        (false, true) => {
            dest.delete_file(name).await?;
            debug!("copy_file: {} gone from {}, removed from {}", name, src.describe(), dest.describe());
            return Ok(CopyOutcome::DeletedDest);
        }
        (false, false) => {
            return Err(SegError::NotFound(format!(
                "{} exists in neither {} nor {}",
                name,
                src.describe(),
                dest.describe()
            )));
        }
        (true, false) => {}
    }

    info!(
        "copying file [{}] from {} to {}",
        name,
        src.describe(),
        dest.describe()
    );
    let start = Instant::now();
    let mut output = dest.create_output(name).await?;
    let mut input = match src.open_input(name).await {
        Ok(input) => input,
        Err(e) => {
            if let Err(close_err) = output.close().await {
                warn!("copy_file: close output {} failed: {}", name, close_err);
            }
            return Err(e);
        }
    };

    let result = stream_copy(input.as_mut(), output.as_mut(), buffer_size).await;
    let output_closed = output.close().await;
    let input_closed = input.close().await;
    let bytes = result?;
    output_closed?;
    input_closed?;

    let elapsed = start.elapsed().as_secs_f64().max(1e-6);
    info!(
        "copied file [{}] {} bytes in {:.3}s ({:.2} MB/s)",
        name,
        bytes,
        elapsed,
        bytes as f64 / elapsed / (1024.0 * 1024.0)
    );
    Ok(CopyOutcome::Copied { bytes })
}

async fn stream_copy(
    input: &mut dyn SegFileReader,
    output: &mut dyn SegFileWriter,
    buffer_size: usize,
) -> SegResult<u64> {
    let length = input.length();
    let mut buf = vec![0u8; buffer_size.max(1)];
    let mut copied = 0u64;
    while copied < length {
        let to_read = (buf.len() as u64).min(length - copied) as usize;
        input.read_exact(&mut buf[..to_read]).await?;
        output.write(&buf[..to_read]).await?;
        copied += to_read as u64;
    }
    Ok(copied)
}

/// Pulls every remote file into the local copy, except the generation file
/// the producer rewrites on its own.
pub async fn bootstrap_local(
    remote: &dyn SegDirectory,
    local: &dyn SegDirectory,
    buffer_size: usize,
) -> SegResult<SyncReport> {
    let mut report = SyncReport::default();
    for name in remote.list_all().await? {
        if name == SEGMENTS_GEN_FILE {
            continue;
        }
        report.record(copy_file(&name, remote, local, buffer_size).await?);
    }
    info!(
        "bootstrap {} from {}: copied {} files ({} bytes), {} already present",
        local.describe(),
        remote.describe(),
        report.copied,
        report.bytes,
        report.skipped
    );
    Ok(report)
}

/// Deletion policy that mirrors the local copy to the remote copy after the
/// wrapped policy has decided which commits survive.
pub struct ReplicationPolicy {
    primary: Arc<dyn DeletionPolicy>,
    local: Arc<dyn SegDirectory>,
    remote: Arc<dyn SegDirectory>,
    buffer_size: usize,
}

impl ReplicationPolicy {
    pub fn new(
        primary: Arc<dyn DeletionPolicy>,
        local: Arc<dyn SegDirectory>,
        remote: Arc<dyn SegDirectory>,
        buffer_size: usize,
    ) -> Self {
        Self {
            primary,
            local,
            remote,
            buffer_size,
        }
    }

    pub async fn bootstrap(&self) -> SegResult<SyncReport> {
        bootstrap_local(self.remote.as_ref(), self.local.as_ref(), self.buffer_size).await
    }

    /// Pushes every file of a live commit, then prunes remote files no live commit names.
    pub async fn sync_to_remote(&self, commits: &[IndexCommitRef]) -> SegResult<SyncReport> {
        let mut report = SyncReport::default();
        let files_in_play = live_commit_files(commits);
        for name in files_in_play.iter() {
            let outcome = copy_file(
                name,
                self.local.as_ref(),
                self.remote.as_ref(),
                self.buffer_size,
            )
            .await?;
            report.record(outcome);
        }

        for name in self.remote.list_all().await? {
            if files_in_play.contains(&name) {
                continue;
            }
            match self.remote.delete_file(&name).await {
                Ok(()) => report.pruned += 1,
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    warn!(
                        "ReplicationPolicy: prune {} from {} failed: {}",
                        name,
                        self.remote.describe(),
                        e
                    );
                    report.prune_failures += 1;
                }
            }
        }

        debug!("ReplicationPolicy: sync to remote done, {:?}", report);
        Ok(report)
    }
}

#[async_trait]
impl DeletionPolicy for ReplicationPolicy {
    async fn on_init(&self, commits: &[IndexCommitRef]) -> SegResult<()> {
        self.primary.on_init(commits).await?;
        self.sync_to_remote(commits).await.map(|_| ())
    }

    async fn on_commit(&self, commits: &[IndexCommitRef]) -> SegResult<()> {
        self.primary.on_commit(commits).await?;
        self.sync_to_remote(commits).await.map(|_| ())
    }
}
