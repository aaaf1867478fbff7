use crate::SegResult;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A generation-numbered snapshot of the file set, owned by the producer.
#[async_trait]
pub trait IndexCommit: Send + Sync {
    fn generation(&self) -> u64;
    fn file_names(&self) -> BTreeSet<String>;
    fn is_deleted(&self) -> bool;
    /// Asks the producer to discard this commit. The producer removes files no
    /// other retained commit names.
    async fn delete(&self) -> SegResult<()>;
}

pub type IndexCommitRef = Arc<dyn IndexCommit>;

/// Decides which commits to discard. Called once when the producer opens the
/// directory and after every commit, with the full list of known commits.
#[async_trait]
pub trait DeletionPolicy: Send + Sync {
    async fn on_init(&self, commits: &[IndexCommitRef]) -> SegResult<()>;
    async fn on_commit(&self, commits: &[IndexCommitRef]) -> SegResult<()>;
}

/// Commit whose delete action only flips a flag. Producers that track their
/// own file reclamation poll `is_deleted` after the policy ran.
#[derive(Debug)]
pub struct FileSetCommit {
    generation: u64,
    files: BTreeSet<String>,
    deleted: AtomicBool,
}

impl FileSetCommit {
    pub fn new<I, S>(generation: u64, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            generation,
            files: files.into_iter().map(Into::into).collect(),
            deleted: AtomicBool::new(false),
        }
    }

    pub fn new_ref<I, S>(generation: u64, files: I) -> Arc<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Arc::new(Self::new(generation, files))
    }
}

#[async_trait]
impl IndexCommit for FileSetCommit {
    fn generation(&self) -> u64 {
        self.generation
    }

    fn file_names(&self) -> BTreeSet<String> {
        self.files.clone()
    }

    fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::SeqCst)
    }

    async fn delete(&self) -> SegResult<()> {
        self.deleted.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Names of every file referenced by a commit that has not been deleted.
pub fn live_commit_files(commits: &[IndexCommitRef]) -> BTreeSet<String> {
    commits
        .iter()
        .filter(|c| !c.is_deleted())
        .flat_map(|c| c.file_names())
        .collect()
}
