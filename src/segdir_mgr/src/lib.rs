mod config;
mod replicated_dir;
mod replication;
mod store_mgr;

pub use config::*;
pub use replicated_dir::ReplicatedDirectory;
pub use replication::{bootstrap_local, copy_file, CopyOutcome, ReplicationPolicy, SyncReport};
pub use store_mgr::SegStoreMgr;

#[cfg(test)]
mod store_mgr_tests;
