use crate::BlockStore;
use async_trait::async_trait;
use log::{debug, warn};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use segdir_lib::{unix_timestamp_millis, FileMeta, SegError, SegResult};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

fn map_db_err(e: rusqlite::Error) -> SegError {
    match &e {
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == ErrorCode::DatabaseBusy || err.code == ErrorCode::DatabaseLocked =>
        {
            SegError::Unavailable(e.to_string())
        }
        _ => SegError::DbError(e.to_string()),
    }
}

/// SQLite database holding the blocks and file metadata of many directories.
/// Rows are keyed by a directory key (`cluster/directory`), then by file name.
pub struct SqliteBlockStoreDB {
    pub db_path: String,
    conn: Mutex<Connection>,
}

impl SqliteBlockStoreDB {
    pub fn new(db_path: String, busy_timeout: Duration) -> SegResult<Self> {
        debug!("SqliteBlockStoreDB: open db path: {}", db_path);
        let conn = Connection::open(&db_path).map_err(|e| {
            warn!("SqliteBlockStoreDB: open db failed! {}", e.to_string());
            map_db_err(e)
        })?;
        conn.busy_timeout(busy_timeout).map_err(map_db_err)?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS blocks (
                dir_key TEXT NOT NULL,
                file_name TEXT NOT NULL,
                block_id INTEGER NOT NULL,
                data BLOB NOT NULL,
                PRIMARY KEY (dir_key, file_name, block_id)
            )",
            [],
        )
        .map_err(|e| {
            warn!(
                "SqliteBlockStoreDB: create table blocks failed! {}",
                e.to_string()
            );
            map_db_err(e)
        })?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS file_meta (
                dir_key TEXT NOT NULL,
                file_name TEXT NOT NULL,
                length INTEGER NOT NULL,
                modified INTEGER NOT NULL,
                PRIMARY KEY (dir_key, file_name)
            )",
            [],
        )
        .map_err(|e| {
            warn!(
                "SqliteBlockStoreDB: create table file_meta failed! {}",
                e.to_string()
            );
            map_db_err(e)
        })?;

        Ok(Self {
            db_path,
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> SegResult<Self> {
        Self::new(":memory:".to_string(), Duration::from_secs(5))
    }

    fn lock_conn(&self) -> SegResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| SegError::Internal(format!("conn lock poisoned: {}", e)))
    }

    pub fn get_block(&self, dir_key: &str, file_name: &str, block_id: u64) -> SegResult<Option<Vec<u8>>> {
        let conn = self.lock_conn()?;
        conn.query_row(
            "SELECT data FROM blocks WHERE dir_key = ?1 AND file_name = ?2 AND block_id = ?3",
            params![dir_key, file_name, block_id as i64],
            |row| row.get::<_, Vec<u8>>(0),
        )
        .optional()
        .map_err(|e| {
            warn!("SqliteBlockStoreDB: get block failed! {}", e.to_string());
            map_db_err(e)
        })
    }

    pub fn put_block(&self, dir_key: &str, file_name: &str, block_id: u64, data: &[u8]) -> SegResult<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO blocks (dir_key, file_name, block_id, data)
             VALUES (?1, ?2, ?3, ?4)",
            params![dir_key, file_name, block_id as i64, data],
        )
        .map_err(|e| {
            warn!("SqliteBlockStoreDB: put block failed! {}", e.to_string());
            map_db_err(e)
        })?;
        Ok(())
    }

    pub fn delete_block(&self, dir_key: &str, file_name: &str, block_id: u64) -> SegResult<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "DELETE FROM blocks WHERE dir_key = ?1 AND file_name = ?2 AND block_id = ?3",
            params![dir_key, file_name, block_id as i64],
        )
        .map_err(|e| {
            warn!("SqliteBlockStoreDB: delete block failed! {}", e.to_string());
            map_db_err(e)
        })?;
        Ok(())
    }

    pub fn get_file_meta(&self, dir_key: &str, file_name: &str) -> SegResult<FileMeta> {
        let conn = self.lock_conn()?;
        conn.query_row(
            "SELECT length, modified FROM file_meta WHERE dir_key = ?1 AND file_name = ?2",
            params![dir_key, file_name],
            |row| {
                Ok(FileMeta {
                    length: row.get::<_, i64>(0)? as u64,
                    modified: row.get::<_, i64>(1)? as u64,
                })
            },
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => {
                SegError::NotFound(format!("file not found: {}/{}", dir_key, file_name))
            }
            _ => {
                warn!("SqliteBlockStoreDB: get file meta failed! {}", e.to_string());
                map_db_err(e)
            }
        })
    }

    pub fn set_length(&self, dir_key: &str, file_name: &str, length: u64) -> SegResult<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO file_meta (dir_key, file_name, length, modified)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                dir_key,
                file_name,
                length as i64,
                unix_timestamp_millis() as i64
            ],
        )
        .map_err(|e| {
            warn!("SqliteBlockStoreDB: set length failed! {}", e.to_string());
            map_db_err(e)
        })?;
        Ok(())
    }

    pub fn delete_meta(&self, dir_key: &str, file_name: &str) -> SegResult<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "DELETE FROM file_meta WHERE dir_key = ?1 AND file_name = ?2",
            params![dir_key, file_name],
        )
        .map_err(|e| {
            warn!("SqliteBlockStoreDB: delete meta failed! {}", e.to_string());
            map_db_err(e)
        })?;
        Ok(())
    }

    pub fn list_files(&self, dir_key: &str) -> SegResult<Vec<String>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn
            .prepare("SELECT file_name FROM file_meta WHERE dir_key = ?1 ORDER BY file_name")
            .map_err(map_db_err)?;
        let rows = stmt
            .query_map(params![dir_key], |row| row.get::<_, String>(0))
            .map_err(map_db_err)?;
        let mut names = Vec::new();
        for row in rows {
            names.push(row.map_err(map_db_err)?);
        }
        Ok(names)
    }

    /// Drops every row of one directory.
    pub fn remove_directory(&self, dir_key: &str) -> SegResult<()> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction().map_err(|e| {
            warn!("SqliteBlockStoreDB: transaction failed! {}", e.to_string());
            map_db_err(e)
        })?;
        tx.execute("DELETE FROM blocks WHERE dir_key = ?1", params![dir_key])
            .map_err(map_db_err)?;
        tx.execute("DELETE FROM file_meta WHERE dir_key = ?1", params![dir_key])
            .map_err(map_db_err)?;
        tx.commit().map_err(|e| {
            warn!("SqliteBlockStoreDB: commit failed! {}", e.to_string());
            map_db_err(e)
        })?;
        Ok(())
    }
}

/// One directory's view of a shared [`SqliteBlockStoreDB`].
#[derive(Clone)]
pub struct SqliteBlockStore {
    dir_key: String,
    db: Arc<SqliteBlockStoreDB>,
}

impl SqliteBlockStore {
    pub fn new(db: Arc<SqliteBlockStoreDB>, dir_key: impl Into<String>) -> Self {
        Self {
            dir_key: dir_key.into(),
            db,
        }
    }

    pub fn dir_key(&self) -> &str {
        &self.dir_key
    }
}

#[async_trait]
impl BlockStore for SqliteBlockStore {
    fn store_id(&self) -> &str {
        &self.dir_key
    }

    async fn get_block(&self, file_name: &str, block_id: u64) -> SegResult<Option<Vec<u8>>> {
        self.db.get_block(&self.dir_key, file_name, block_id)
    }

    async fn put_block(&self, file_name: &str, block_id: u64, data: &[u8]) -> SegResult<()> {
        self.db.put_block(&self.dir_key, file_name, block_id, data)
    }

    async fn delete_block(&self, file_name: &str, block_id: u64) -> SegResult<()> {
        self.db.delete_block(&self.dir_key, file_name, block_id)
    }

    async fn get_file_meta(&self, file_name: &str) -> SegResult<FileMeta> {
        self.db.get_file_meta(&self.dir_key, file_name)
    }

    async fn set_length(&self, file_name: &str, length: u64) -> SegResult<()> {
        self.db.set_length(&self.dir_key, file_name, length)
    }

    async fn delete_meta(&self, file_name: &str) -> SegResult<()> {
        self.db.delete_meta(&self.dir_key, file_name)
    }

    async fn list_files(&self) -> SegResult<Vec<String>> {
        self.db.list_files(&self.dir_key)
    }

    async fn exists(&self, file_name: &str) -> SegResult<bool> {
        match self.db.get_file_meta(&self.dir_key, file_name) {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_sqlite_store_isolates_directories() {
        let db = Arc::new(SqliteBlockStoreDB::open_in_memory().unwrap());
        let a = SqliteBlockStore::new(db.clone(), "c1/a");
        let b = SqliteBlockStore::new(db.clone(), "c1/b");

        a.set_length("seg.0", 3).await.unwrap();
        a.put_block("seg.0", 0, b"xyz").await.unwrap();

        assert!(a.exists("seg.0").await.unwrap());
        assert!(!b.exists("seg.0").await.unwrap());
        assert_eq!(b.get_block("seg.0", 0).await.unwrap(), None);
        assert_eq!(a.get_block("seg.0", 0).await.unwrap(), Some(b"xyz".to_vec()));
        assert_eq!(a.list_files().await.unwrap(), vec!["seg.0".to_string()]);
        assert!(b.list_files().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sqlite_store_persists() {
        let tmp = TempDir::new().unwrap();
        let db_path = tmp.path().join("blocks.db").to_string_lossy().to_string();
        {
            let db = Arc::new(SqliteBlockStoreDB::new(db_path.clone(), Duration::from_secs(1)).unwrap());
            let store = SqliteBlockStore::new(db, "c1/d1");
            store.set_length("seg.0", 5).await.unwrap();
            store.put_block("seg.0", 0, b"hello").await.unwrap();
        }
        let db = Arc::new(SqliteBlockStoreDB::new(db_path, Duration::from_secs(1)).unwrap());
        let store = SqliteBlockStore::new(db.clone(), "c1/d1");
        assert_eq!(store.get_length("seg.0").await.unwrap(), 5);
        assert_eq!(store.get_block("seg.0", 0).await.unwrap(), Some(b"hello".to_vec()));

        db.remove_directory("c1/d1").unwrap();
        assert!(!store.exists("seg.0").await.unwrap());
        assert_eq!(store.get_block("seg.0", 0).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_sqlite_store_missing_meta() {
        let db = Arc::new(SqliteBlockStoreDB::open_in_memory().unwrap());
        let store = SqliteBlockStore::new(db, "c1/d1");
        assert!(store.get_file_meta("nope").await.unwrap_err().is_not_found());
    }
}
