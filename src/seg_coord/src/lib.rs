mod deletion_policy;
mod lock;
mod mem_namespace;
mod namespace;
mod ref_dir;
mod sqlite_namespace;

pub use deletion_policy::RefDeletionPolicy;
pub use lock::{CoordLock, LOCK_POLL_INTERVAL};
pub use mem_namespace::{MemCoordService, MemCoordSession};
pub use namespace::*;
pub use ref_dir::RefTrackingDirectory;
pub use sqlite_namespace::SqliteCoordNamespace;
