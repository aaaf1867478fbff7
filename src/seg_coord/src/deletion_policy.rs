use crate::namespace::CoordNamespace;
use async_trait::async_trait;
use log::{debug, info};
use segdir_lib::{strip_sequence_suffix, DeletionPolicy, IndexCommitRef, SegResult};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Deletes superseded commits once none of their files is held open by a
/// reader anywhere, as seen through the reference markers under `ref_path`.
pub struct RefDeletionPolicy {
    ns: Arc<dyn CoordNamespace>,
    ref_path: String,
}

impl RefDeletionPolicy {
    pub fn new(ns: Arc<dyn CoordNamespace>, ref_path: impl Into<String>) -> Self {
        Self {
            ns,
            ref_path: ref_path.into(),
        }
    }

    pub fn ref_path(&self) -> &str {
        &self.ref_path
    }

    /// Names of files with at least one open reader.
    pub async fn live_files(&self) -> SegResult<BTreeSet<String>> {
        let children = match self.ns.list_children(&self.ref_path).await {
            Ok(children) => children,
            Err(e) if e.is_not_found() => Vec::new(),
            Err(e) => return Err(e),
        };
        Ok(children
            .iter()
            .map(|child| strip_sequence_suffix(child).to_string())
            .collect())
    }

    /// Returns how many commits were deleted in this pass.
    pub async fn reclaim(&self, commits: &[IndexCommitRef]) -> SegResult<usize> {
        let live = self.live_files().await?;

        let mut ordered: Vec<&IndexCommitRef> = commits.iter().collect();
        ordered.sort_by_key(|c| c.generation());
        if ordered.len() < 2 {
            return Ok(0);
        }

        // the newest generation is never a candidate
        let candidates = &ordered[..ordered.len() - 1];
        let mut keep_names: BTreeSet<String> = BTreeSet::new();
        let mut deleted = 0;
        for commit in candidates.iter().rev() {
            if commit.is_deleted() {
                continue;
            }
            let names = commit.file_names();
            let referenced: Vec<&String> = names
                .iter()
                .filter(|name| !keep_names.contains(*name) && live.contains(*name))
                .collect();
            if !referenced.is_empty() {
                debug!(
                    "RefDeletionPolicy: keep generation {}, open readers on {:?}",
                    commit.generation(),
                    referenced
                );
                keep_names.extend(names.iter().cloned());
                continue;
            }

            commit.delete().await?;
            deleted += 1;
            info!(
                "RefDeletionPolicy: deleted generation {} ({} files)",
                commit.generation(),
                names.len()
            );
        }
        Ok(deleted)
    }
}

#[async_trait]
impl DeletionPolicy for RefDeletionPolicy {
    async fn on_init(&self, commits: &[IndexCommitRef]) -> SegResult<()> {
        self.reclaim(commits).await.map(|_| ())
    }

    async fn on_commit(&self, commits: &[IndexCommitRef]) -> SegResult<()> {
        self.reclaim(commits).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem_namespace::MemCoordService;
    use segdir_lib::{FileSetCommit, IndexCommit};

    async fn setup() -> (Arc<dyn CoordNamespace>, RefDeletionPolicy) {
        let service = MemCoordService::new();
        let ns: Arc<dyn CoordNamespace> = Arc::new(service.connect().unwrap());
        crate::mk_nodes(ns.as_ref(), "/segdir/c1/d1/refs").await.unwrap();
        let policy = RefDeletionPolicy::new(ns.clone(), "/segdir/c1/d1/refs");
        (ns, policy)
    }

    #[tokio::test]
    async fn test_newest_commit_never_deleted() {
        let (_ns, policy) = setup().await;
        let only = FileSetCommit::new_ref(1, ["a"]);
        let commits: Vec<IndexCommitRef> = vec![only.clone()];
        assert_eq!(policy.reclaim(&commits).await.unwrap(), 0);
        assert!(!only.is_deleted());
    }

    #[tokio::test]
    async fn test_unreferenced_old_commits_deleted() {
        let (_ns, policy) = setup().await;
        let c1 = FileSetCommit::new_ref(1, ["a"]);
        let c2 = FileSetCommit::new_ref(2, ["a", "b"]);
        let c3 = FileSetCommit::new_ref(3, ["c"]);
        // unordered on purpose
        let commits: Vec<IndexCommitRef> = vec![c3.clone(), c1.clone(), c2.clone()];
        assert_eq!(policy.reclaim(&commits).await.unwrap(), 2);
        assert!(c1.is_deleted());
        assert!(c2.is_deleted());
        assert!(!c3.is_deleted());
    }

    #[tokio::test]
    async fn test_keep_names_carry_forward() {
        let (ns, policy) = setup().await;
        // reader on "b" pins generation 2; generation 1 only shares "b" with it
        ns.create_ephemeral_sequential("/segdir/c1/d1/refs/b.", b"")
            .await
            .unwrap();
        let c1 = FileSetCommit::new_ref(1, ["b"]);
        let c2 = FileSetCommit::new_ref(2, ["b", "x"]);
        let c3 = FileSetCommit::new_ref(3, ["y"]);
        let commits: Vec<IndexCommitRef> = vec![c1.clone(), c2.clone(), c3.clone()];

        assert_eq!(policy.reclaim(&commits).await.unwrap(), 1);
        assert!(!c2.is_deleted());
        assert!(c1.is_deleted());
        assert_eq!(
            policy.live_files().await.unwrap().into_iter().collect::<Vec<_>>(),
            vec!["b".to_string()]
        );
    }

    #[tokio::test]
    async fn test_deleted_commits_skipped() {
        let (_ns, policy) = setup().await;
        let c1 = FileSetCommit::new_ref(1, ["a"]);
        c1.delete().await.unwrap();
        let c2 = FileSetCommit::new_ref(2, ["b"]);
        let commits: Vec<IndexCommitRef> = vec![c1, c2.clone()];
        assert_eq!(policy.reclaim(&commits).await.unwrap(), 0);
        assert!(!c2.is_deleted());
    }
}
