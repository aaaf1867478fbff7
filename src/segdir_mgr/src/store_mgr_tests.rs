use super::*;
use block_store::{DirectoryFactory, MemDirectoryFactory};
use seg_coord::{CoordNamespace, MemCoordService};
use segdir_lib::{
    read_file, write_file, BlockSize, DeletionPolicy, FileSetCommit, IndexCommit,
    IndexCommitRef, SegDirectory, SegError,
};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

fn test_config(local_roots: &[&Path]) -> SegStoreConfig {
    SegStoreConfig {
        local_paths: local_roots.iter().map(|p| p.to_path_buf()).collect(),
        block_size: BlockSize::Size1K,
        copy_buffer_size: 700,
        ..Default::default()
    }
}

struct Cluster {
    service: Arc<MemCoordService>,
    remote: Arc<MemDirectoryFactory>,
}

impl Cluster {
    fn new() -> Self {
        Self {
            service: MemCoordService::new(),
            remote: Arc::new(MemDirectoryFactory::new(BlockSize::Size1K)),
        }
    }

    // each manager stands in for one process on its own host
    fn manager(&self, local_root: &Path) -> SegStoreMgr {
        let ns: Arc<dyn CoordNamespace> = Arc::new(self.service.connect().unwrap());
        SegStoreMgr::new(test_config(&[local_root]), ns, self.remote.clone())
    }
}

#[tokio::test]
async fn test_cluster_and_directory_registration() {
    let tmp = TempDir::new().unwrap();
    let cluster = Cluster::new();
    let mgr = cluster.manager(tmp.path());

    assert!(mgr.list_clusters().await.unwrap().is_empty());
    mgr.create_cluster("c1").await.unwrap();
    mgr.create_cluster("c1").await.unwrap();
    mgr.create_directory("c1", "d1").await.unwrap();
    mgr.create_directory("c1", "d2").await.unwrap();
    mgr.create_directory("c2", "d1").await.unwrap();

    assert_eq!(
        mgr.list_clusters().await.unwrap(),
        vec!["c1".to_string(), "c2".to_string()]
    );
    assert_eq!(
        mgr.list_directories("c1").await.unwrap(),
        vec!["d1".to_string(), "d2".to_string()]
    );
    let err = mgr.list_directories("missing").await.unwrap_err();
    assert!(err.is_not_found());
    assert!(err.to_string().contains("missing"));

    assert!(matches!(
        mgr.create_cluster("a/b").await,
        Err(SegError::InvalidParam(_))
    ));
    assert!(matches!(
        mgr.create_directory("c1", "..").await,
        Err(SegError::InvalidParam(_))
    ));
}

#[tokio::test]
async fn test_open_requires_registration_and_caches() {
    let tmp = TempDir::new().unwrap();
    let cluster = Cluster::new();
    let mgr = cluster.manager(tmp.path());

    let err = mgr.open("c1", "d1").await.err().unwrap();
    assert!(err.is_not_found());
    assert!(err.to_string().contains("c1"));
    assert!(err.to_string().contains("d1"));
    assert!(matches!(
        mgr.deletion_policy("c1", "d1").await.err().unwrap(),
        SegError::InvalidState(_)
    ));

    mgr.create_directory("c1", "d1").await.unwrap();
    let first = mgr.open("c1", "d1").await.unwrap();
    let second = mgr.open("c1", "d1").await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first.ref_path(), "/segdir/c1/d1/refs");
    assert_eq!(first.lock_path(), "/segdir/c1/d1/locks");
    assert!(tmp.path().join("c1").join("d1").is_dir());
    assert_eq!(
        mgr.list_local_directories("c1").await.unwrap(),
        vec!["d1".to_string()]
    );
    assert!(mgr.deletion_policy("c1", "d1").await.is_ok());
}

#[tokio::test]
async fn test_commit_replicates_and_second_host_bootstraps() {
    let host_a = TempDir::new().unwrap();
    let host_b = TempDir::new().unwrap();
    let cluster = Cluster::new();
    let writer = cluster.manager(host_a.path());
    writer.create_directory("c1", "d1").await.unwrap();

    let dir = writer.open("c1", "d1").await.unwrap();
    let policy = writer.deletion_policy("c1", "d1").await.unwrap();
    let segment: Vec<u8> = (0..5000u32).map(|i| (i % 199) as u8).collect();
    write_file(&*dir, "_0.cfs", &segment).await.unwrap();
    write_file(&*dir, "segments_1", b"gen 1").await.unwrap();
    write_file(&*dir, "segments.gen", b"1").await.unwrap();

    let gen1 = FileSetCommit::new_ref(1, ["_0.cfs", "segments_1", "segments.gen"]);
    policy.on_init(&[gen1.clone() as IndexCommitRef]).await.unwrap();

    let remote = cluster.remote.open_directory("c1", "d1").await.unwrap();
    assert_eq!(read_file(remote.as_ref(), "_0.cfs").await.unwrap(), segment);

    let reader = cluster.manager(host_b.path());
    let replica = reader.open("c1", "d1").await.unwrap();
    assert_eq!(read_file(&*replica, "_0.cfs").await.unwrap(), segment);
    assert_eq!(
        read_file(&*replica, "segments_1").await.unwrap(),
        b"gen 1".to_vec()
    );
    // regenerated by the producer, never pulled
    assert!(!host_b.path().join("c1/d1/segments.gen").exists());
}

#[tokio::test]
async fn test_open_reader_on_other_host_keeps_generation() {
    let host_a = TempDir::new().unwrap();
    let host_b = TempDir::new().unwrap();
    let cluster = Cluster::new();
    let writer = cluster.manager(host_a.path());
    writer.create_directory("c1", "d1").await.unwrap();
    let dir = writer.open("c1", "d1").await.unwrap();
    let policy = writer.deletion_policy("c1", "d1").await.unwrap();

    write_file(&*dir, "a", b"aaaa").await.unwrap();
    write_file(&*dir, "b", b"bbbb").await.unwrap();
    let gen1 = FileSetCommit::new_ref(1, ["a", "b"]);
    policy.on_commit(&[gen1.clone() as IndexCommitRef]).await.unwrap();

    let reader_mgr = cluster.manager(host_b.path());
    let replica = reader_mgr.open("c1", "d1").await.unwrap();
    let mut handle = replica.open_input("a").await.unwrap();

    write_file(&*dir, "c", b"cccc").await.unwrap();
    let gen2 = FileSetCommit::new_ref(2, ["b", "c"]);
    let commits: Vec<IndexCommitRef> = vec![gen1.clone(), gen2.clone()];
    policy.on_commit(&commits).await.unwrap();
    assert!(!gen1.is_deleted());
    let remote = cluster.remote.open_directory("c1", "d1").await.unwrap();
    assert!(remote.file_exists("a").await.unwrap());

    handle.close().await.unwrap();
    policy.on_commit(&commits).await.unwrap();
    assert!(gen1.is_deleted());
    assert!(!remote.file_exists("a").await.unwrap());
    assert_eq!(
        remote.list_all().await.unwrap(),
        vec!["b".to_string(), "c".to_string()]
    );

    // nothing changed since, so the next pass transfers nothing
    let report = policy.sync_to_remote(&commits).await.unwrap();
    assert_eq!(report.copied, 0);
    assert_eq!(report.skipped, 2);
}

#[tokio::test]
async fn test_lock_through_opened_directory() {
    let host_a = TempDir::new().unwrap();
    let host_b = TempDir::new().unwrap();
    let cluster = Cluster::new();
    let a = cluster.manager(host_a.path());
    let b = cluster.manager(host_b.path());
    a.create_directory("c1", "d1").await.unwrap();

    let lock_a = a.open("c1", "d1").await.unwrap().make_lock("write.lock");
    let lock_b = b.open("c1", "d1").await.unwrap().make_lock("write.lock");
    assert!(lock_a.acquire().await.unwrap());
    assert!(!lock_b.acquire().await.unwrap());
    a.close().await.unwrap();
    assert!(lock_b.acquire().await.unwrap());
}

#[tokio::test]
async fn test_remove_directory_and_cluster() {
    let tmp = TempDir::new().unwrap();
    let cluster = Cluster::new();
    let mgr = cluster.manager(tmp.path());
    mgr.create_directory("c1", "d1").await.unwrap();
    mgr.create_directory("c1", "d2").await.unwrap();

    let dir = mgr.open("c1", "d1").await.unwrap();
    write_file(&*dir, "a", b"a").await.unwrap();
    let policy = mgr.deletion_policy("c1", "d1").await.unwrap();
    policy
        .on_commit(&[FileSetCommit::new_ref(1, ["a"]) as IndexCommitRef])
        .await
        .unwrap();
    assert!(cluster.remote.store("c1", "d1").is_some());

    mgr.remove_directory("c1", "d1").await.unwrap();
    assert!(!tmp.path().join("c1").join("d1").exists());
    assert!(cluster.remote.store("c1", "d1").is_none());
    assert_eq!(
        mgr.list_directories("c1").await.unwrap(),
        vec!["d2".to_string()]
    );
    assert!(mgr.open("c1", "d1").await.err().unwrap().is_not_found());
    assert!(mgr
        .remove_directory("c1", "d1")
        .await
        .unwrap_err()
        .is_not_found());

    mgr.remove_cluster("c1").await.unwrap();
    assert!(mgr.list_clusters().await.unwrap().is_empty());
    assert!(mgr.remove_cluster("c1").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_existing_local_copy_is_reused() {
    let root1 = TempDir::new().unwrap();
    let root2 = TempDir::new().unwrap();
    std::fs::create_dir_all(root2.path().join("c1").join("d1")).unwrap();
    std::fs::write(root2.path().join("c1").join("d1").join("kept"), b"kept").unwrap();

    let service = MemCoordService::new();
    let ns: Arc<dyn CoordNamespace> = Arc::new(service.connect().unwrap());
    let mgr = SegStoreMgr::new(
        test_config(&[root1.path(), root2.path()]),
        ns,
        Arc::new(MemDirectoryFactory::new(BlockSize::Size1K)),
    );
    mgr.create_directory("c1", "d1").await.unwrap();
    let dir = mgr.open("c1", "d1").await.unwrap();
    assert_eq!(read_file(&*dir, "kept").await.unwrap(), b"kept".to_vec());
    assert!(!root1.path().join("c1").join("d1").exists());
}

#[tokio::test]
async fn test_no_writable_local_root() {
    let tmp = TempDir::new().unwrap();
    let not_a_dir = tmp.path().join("plain_file");
    std::fs::write(&not_a_dir, b"x").unwrap();

    let cluster = Cluster::new();
    let mgr = cluster.manager(&not_a_dir);
    mgr.create_directory("c1", "d1").await.unwrap();
    assert!(mgr.open("c1", "d1").await.err().unwrap().is_unavailable());
}

#[tokio::test]
async fn test_from_config_with_sqlite_backends() {
    let tmp = TempDir::new().unwrap();
    let host_a = tmp.path().join("host_a");
    let mut config = test_config(&[host_a.as_path()]);
    config.remote = RemoteStoreConfig::Sqlite {
        db_path: tmp.path().join("remote").join("blocks.db"),
    };
    config.coord = CoordConfig::Sqlite {
        db_path: tmp.path().join("coord").join("coord.db"),
    };

    let writer = SegStoreMgr::from_config(config.clone()).await.unwrap();
    writer.create_directory("c1", "d1").await.unwrap();
    let dir = writer.open("c1", "d1").await.unwrap();
    write_file(&*dir, "_0.cfs", &[5u8; 2500]).await.unwrap();
    writer
        .deletion_policy("c1", "d1")
        .await
        .unwrap()
        .on_commit(&[FileSetCommit::new_ref(1, ["_0.cfs"]) as IndexCommitRef])
        .await
        .unwrap();

    let mut reader_config = config.clone();
    reader_config.local_paths = vec![tmp.path().join("host_b")];
    let reader = SegStoreMgr::from_config(reader_config).await.unwrap();
    assert_eq!(reader.list_clusters().await.unwrap(), vec!["c1".to_string()]);
    let replica = reader.open("c1", "d1").await.unwrap();
    assert_eq!(replica.file_length("_0.cfs").await.unwrap(), 2500);

    reader.close().await.unwrap();
    writer.close().await.unwrap();
}

#[tokio::test]
async fn test_open_replicated_pushes_and_pulls_single_files() {
    let host_a = TempDir::new().unwrap();
    let host_b = TempDir::new().unwrap();
    let cluster = Cluster::new();
    let writer = cluster.manager(host_a.path());
    let reader = cluster.manager(host_b.path());
    writer.create_directory("c1", "d1").await.unwrap();

    let rw = writer.open_replicated("c1", "d1", true).await.unwrap();
    assert!(rw.is_writing());
    write_file(&rw, "blob", b"payload").await.unwrap();
    rw.sync("blob").await.unwrap();

    let ro = reader.open_replicated("c1", "d1", false).await.unwrap();
    assert_eq!(ro.list_all().await.unwrap(), vec!["blob".to_string()]);
    assert!(ro.file_exists("blob").await.unwrap());
    assert_eq!(read_file(&ro, "blob").await.unwrap(), b"payload".to_vec());
    assert!(host_b.path().join("c1/d1/blob").exists());
}
