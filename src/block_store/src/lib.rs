mod block_store;
mod chunked_dir;
mod dir_factory;
mod fs_dir;
mod mem_store;
mod store_db;

pub use block_store::*;
pub use chunked_dir::{ChunkedDirectory, ChunkedFileReader, ChunkedFileWriter};
pub use dir_factory::*;
pub use fs_dir::FsDirectory;
pub use mem_store::MemBlockStore;
pub use store_db::{SqliteBlockStore, SqliteBlockStoreDB};

#[cfg(test)]
mod test_chunked_dir;
