use crate::namespace::{node_name, parent_path, validate_path, CoordNamespace, NodeStat};
use async_trait::async_trait;
use log::{debug, info, warn};
use rand::Rng;
use rusqlite::{
    params, Connection, ErrorCode, OpenFlags, OptionalExtension, Transaction, TransactionBehavior,
};
use segdir_lib::{unix_timestamp_millis, SegError, SegResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
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

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(e, rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::ConstraintViolation)
}

/// Coordination namespace kept in a SQLite file, shared by every process on
/// the host that opens the same file.
///
/// Each instance is one session. A keep-alive task pushes the session expiry
/// forward; sessions whose expiry passed are reaped (with their ephemeral
/// nodes) at the start of every operation of any session.
pub struct SqliteCoordNamespace {
    db_path: String,
    conn: Arc<Mutex<Connection>>,
    session_id: i64,
    closed: Arc<AtomicBool>,
    keep_alive_handle: Option<tokio::task::JoinHandle<()>>,
}

impl SqliteCoordNamespace {
    pub fn open(
        db_path: impl Into<String>,
        session_timeout: Duration,
        busy_timeout: Duration,
    ) -> SegResult<Self> {
        let db_path = db_path.into();
        let conn = Connection::open_with_flags(
            &db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        )
        .map_err(|e| {
            warn!("SqliteCoordNamespace: open db {} failed! {}", db_path, e);
            map_db_err(e)
        })?;
        conn.busy_timeout(busy_timeout).map_err(map_db_err)?;
        Self::init_connection(&conn)?;
        Self::create_schema(&conn)?;

        let session_id = rand::thread_rng().gen_range(1..i64::MAX);
        let timeout_ms = session_timeout.as_millis() as i64;
        conn.execute(
            "INSERT INTO coord_sessions (session_id, timeout_ms, expire_at) VALUES (?1, ?2, ?3)",
            params![
                session_id,
                timeout_ms,
                unix_timestamp_millis() as i64 + timeout_ms
            ],
        )
        .map_err(map_db_err)?;
        info!(
            "SqliteCoordNamespace: session {} opened on {}",
            session_id, db_path
        );

        let conn = Arc::new(Mutex::new(conn));
        let closed = Arc::new(AtomicBool::new(false));
        let keep_alive_handle =
            Self::start_keep_alive_task(conn.clone(), session_id, session_timeout, closed.clone());

        Ok(Self {
            db_path,
            conn,
            session_id,
            closed,
            keep_alive_handle: Some(keep_alive_handle),
        })
    }

    pub fn db_path(&self) -> &str {
        &self.db_path
    }

    fn init_connection(conn: &Connection) -> SegResult<()> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )
        .map_err(|e| {
            warn!("SqliteCoordNamespace: pragma failed! {}", e);
            map_db_err(e)
        })
    }

    fn create_schema(conn: &Connection) -> SegResult<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS coord_nodes (
                path TEXT PRIMARY KEY,
                parent TEXT NOT NULL,
                data BLOB NOT NULL,
                version INTEGER NOT NULL,
                czxid INTEGER NOT NULL,
                ephemeral_owner INTEGER,
                seq_counter INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS coord_nodes_parent ON coord_nodes(parent);
            CREATE TABLE IF NOT EXISTS coord_sessions (
                session_id INTEGER PRIMARY KEY,
                timeout_ms INTEGER NOT NULL,
                expire_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS coord_counters (
                name TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            );
            INSERT OR IGNORE INTO coord_counters (name, value) VALUES ('zxid', 0);
            INSERT OR IGNORE INTO coord_nodes (path, parent, data, version, czxid)
                VALUES ('/', '', x'', 0, 0);",
        )
        .map_err(|e| {
            warn!("SqliteCoordNamespace: create schema failed! {}", e);
            map_db_err(e)
        })
    }

    fn start_keep_alive_task(
        conn: Arc<Mutex<Connection>>,
        session_id: i64,
        session_timeout: Duration,
        closed: Arc<AtomicBool>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let period = (session_timeout / 3).max(Duration::from_millis(10));
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                if closed.load(Ordering::SeqCst) {
                    break;
                }

                let conn = conn.clone();
                let result = tokio::task::spawn_blocking(move || {
                    let conn_guard = conn.lock().map_err(|e| {
                        SegError::Internal(format!("conn lock poisoned: {}", e))
                    })?;
                    conn_guard
                        .execute(
                            "UPDATE coord_sessions SET expire_at = ?1 + timeout_ms
                             WHERE session_id = ?2",
                            params![unix_timestamp_millis() as i64, session_id],
                        )
                        .map_err(map_db_err)
                })
                .await;

                match result {
                    Ok(Ok(0)) => {
                        warn!(
                            "coord keep-alive: session {} already expired, stop renewing",
                            session_id
                        );
                        break;
                    }
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => warn!("coord keep-alive failed: {}", e),
                    Err(e) => warn!("coord keep-alive join failed: {}", e),
                }
            }
        })
    }

    #[cfg(test)]
    pub(crate) fn stop_keep_alive(&mut self) {
        if let Some(handle) = self.keep_alive_handle.take() {
            handle.abort();
        }
    }

    fn reap_expired_sessions(tx: &Transaction, now: i64) -> SegResult<usize> {
        let removed_nodes = tx
            .execute(
                "DELETE FROM coord_nodes WHERE ephemeral_owner IN
                    (SELECT session_id FROM coord_sessions WHERE expire_at <= ?1)",
                params![now],
            )
            .map_err(map_db_err)?;
        let removed_sessions = tx
            .execute(
                "DELETE FROM coord_sessions WHERE expire_at <= ?1",
                params![now],
            )
            .map_err(map_db_err)?;
        if removed_sessions > 0 {
            info!(
                "coord reaper: expired {} sessions, removed {} ephemeral nodes",
                removed_sessions, removed_nodes
            );
        }
        Ok(removed_sessions)
    }

    fn check_session(tx: &Transaction, session_id: i64) -> SegResult<()> {
        let alive: Option<i64> = tx
            .query_row(
                "SELECT session_id FROM coord_sessions WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(map_db_err)?;
        if alive.is_none() {
            return Err(SegError::Unavailable(format!(
                "coord session {} expired",
                session_id
            )));
        }
        Ok(())
    }

    fn read_stat(tx: &Transaction, path: &str) -> SegResult<Option<NodeStat>> {
        let row = tx
            .query_row(
                "SELECT version, czxid, ephemeral_owner FROM coord_nodes WHERE path = ?1",
                params![path],
                |row| {
                    Ok((
                        row.get::<_, i32>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, Option<i64>>(2)?,
                    ))
                },
            )
            .optional()
            .map_err(map_db_err)?;
        let (version, czxid, owner) = match row {
            Some(row) => row,
            None => return Ok(None),
        };
        let num_children: i64 = tx
            .query_row(
                "SELECT COUNT(*) FROM coord_nodes WHERE parent = ?1",
                params![path],
                |row| row.get(0),
            )
            .map_err(map_db_err)?;
        Ok(Some(NodeStat {
            version,
            czxid,
            ephemeral_owner: owner.map(|o| o as u64),
            num_children: num_children as usize,
        }))
    }

    fn insert_node(
        tx: &Transaction,
        path: &str,
        data: &[u8],
        owner: Option<i64>,
    ) -> SegResult<()> {
        validate_path(path)?;
        let parent = parent_path(path).ok_or_else(|| SegError::AlreadyExists(path.to_string()))?;
        let parent_owner: Option<Option<i64>> = tx
            .query_row(
                "SELECT ephemeral_owner FROM coord_nodes WHERE path = ?1",
                params![parent],
                |row| row.get(0),
            )
            .optional()
            .map_err(map_db_err)?;
        match parent_owner {
            None => return Err(SegError::NotFound(format!("parent of {}", path))),
            Some(Some(_)) => {
                return Err(SegError::InvalidState(format!(
                    "ephemeral node {} cannot have children",
                    parent
                )))
            }
            Some(None) => {}
        }

        tx.execute(
            "UPDATE coord_counters SET value = value + 1 WHERE name = 'zxid'",
            [],
        )
        .map_err(map_db_err)?;
        let czxid: i64 = tx
            .query_row(
                "SELECT value FROM coord_counters WHERE name = 'zxid'",
                [],
                |row| row.get(0),
            )
            .map_err(map_db_err)?;

        tx.execute(
            "INSERT INTO coord_nodes (path, parent, data, version, czxid, ephemeral_owner)
             VALUES (?1, ?2, ?3, 0, ?4, ?5)",
            params![path, parent, data, czxid, owner],
        )
        .map_err(|e| {
            if is_constraint_violation(&e) {
                SegError::AlreadyExists(path.to_string())
            } else {
                map_db_err(e)
            }
        })?;
        Ok(())
    }

    /// Runs `f` inside an immediate transaction after reaping expired sessions.
    async fn run<T, F>(&self, f: F) -> SegResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Transaction, i64) -> SegResult<T> + Send + 'static,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SegError::Unavailable(format!(
                "coord session {} closed",
                self.session_id
            )));
        }
        let conn = self.conn.clone();
        let session_id = self.session_id;
        tokio::task::spawn_blocking(move || {
            let mut conn_guard = conn
                .lock()
                .map_err(|e| SegError::Internal(format!("conn lock poisoned: {}", e)))?;
            let tx = conn_guard
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(map_db_err)?;
            Self::reap_expired_sessions(&tx, unix_timestamp_millis() as i64)?;
            Self::check_session(&tx, session_id)?;
            let result = f(&tx, session_id)?;
            tx.commit().map_err(map_db_err)?;
            Ok(result)
        })
        .await
        .map_err(|e| SegError::Internal(format!("db task join failed: {}", e)))?
    }

    fn end_session(conn: &Connection, session_id: i64) -> SegResult<usize> {
        let removed = conn
            .execute(
                "DELETE FROM coord_nodes WHERE ephemeral_owner = ?1",
                params![session_id],
            )
            .map_err(map_db_err)?;
        conn.execute(
            "DELETE FROM coord_sessions WHERE session_id = ?1",
            params![session_id],
        )
        .map_err(map_db_err)?;
        Ok(removed)
    }
}

#[async_trait]
impl CoordNamespace for SqliteCoordNamespace {
    fn session_id(&self) -> u64 {
        self.session_id as u64
    }

    async fn create_persistent(&self, path: &str, data: &[u8]) -> SegResult<()> {
        let path = path.to_string();
        let data = data.to_vec();
        self.run(move |tx, _| Self::insert_node(tx, &path, &data, None))
            .await
    }

    async fn create_ephemeral(&self, path: &str, data: &[u8]) -> SegResult<()> {
        let path = path.to_string();
        let data = data.to_vec();
        self.run(move |tx, session_id| Self::insert_node(tx, &path, &data, Some(session_id)))
            .await
    }

    async fn create_ephemeral_sequential(&self, prefix: &str, data: &[u8]) -> SegResult<String> {
        let prefix = prefix.to_string();
        let data = data.to_vec();
        self.run(move |tx, session_id| {
            let parent = parent_path(&prefix)
                .ok_or_else(|| SegError::InvalidParam(format!("bad prefix {}", prefix)))?;
            let seq: i64 = tx
                .query_row(
                    "SELECT seq_counter FROM coord_nodes WHERE path = ?1",
                    params![parent],
                    |row| row.get(0),
                )
                .optional()
                .map_err(map_db_err)?
                .ok_or_else(|| SegError::NotFound(format!("parent of {}", prefix)))?;
            tx.execute(
                "UPDATE coord_nodes SET seq_counter = seq_counter + 1 WHERE path = ?1",
                params![parent],
            )
            .map_err(map_db_err)?;
            let path = format!("{}{:010}", prefix, seq);
            Self::insert_node(tx, &path, &data, Some(session_id))?;
            Ok(path)
        })
        .await
    }

    async fn delete(&self, path: &str, expected_version: Option<i32>) -> SegResult<()> {
        validate_path(path)?;
        let path = path.to_string();
        self.run(move |tx, _| {
            let stat = Self::read_stat(tx, &path)?
                .ok_or_else(|| SegError::NotFound(path.clone()))?;
            if let Some(expected) = expected_version {
                if expected != stat.version {
                    return Err(SegError::VersionConflict(format!(
                        "{} is at version {}, expected {}",
                        path, stat.version, expected
                    )));
                }
            }
            if stat.num_children > 0 {
                return Err(SegError::NotEmpty(path.clone()));
            }
            tx.execute("DELETE FROM coord_nodes WHERE path = ?1", params![path])
                .map_err(map_db_err)?;
            Ok(())
        })
        .await
    }

    async fn exists(&self, path: &str) -> SegResult<bool> {
        Ok(self.stat(path).await?.is_some())
    }

    async fn stat(&self, path: &str) -> SegResult<Option<NodeStat>> {
        validate_path(path)?;
        let path = path.to_string();
        self.run(move |tx, _| Self::read_stat(tx, &path)).await
    }

    async fn get_data(&self, path: &str) -> SegResult<Vec<u8>> {
        validate_path(path)?;
        let path = path.to_string();
        self.run(move |tx, _| {
            tx.query_row(
                "SELECT data FROM coord_nodes WHERE path = ?1",
                params![path],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()
            .map_err(map_db_err)?
            .ok_or_else(|| SegError::NotFound(path.clone()))
        })
        .await
    }

    async fn set_data(
        &self,
        path: &str,
        data: &[u8],
        expected_version: Option<i32>,
    ) -> SegResult<NodeStat> {
        validate_path(path)?;
        let path = path.to_string();
        let data = data.to_vec();
        self.run(move |tx, _| {
            let stat = Self::read_stat(tx, &path)?
                .ok_or_else(|| SegError::NotFound(path.clone()))?;
            if let Some(expected) = expected_version {
                if expected != stat.version {
                    return Err(SegError::VersionConflict(format!(
                        "{} is at version {}, expected {}",
                        path, stat.version, expected
                    )));
                }
            }
            tx.execute(
                "UPDATE coord_nodes SET data = ?1, version = version + 1 WHERE path = ?2",
                params![data, path],
            )
            .map_err(map_db_err)?;
            Self::read_stat(tx, &path)?
                .ok_or_else(|| SegError::Internal(format!("node {} vanished", path)))
        })
        .await
    }

    async fn list_children(&self, path: &str) -> SegResult<Vec<String>> {
        validate_path(path)?;
        let path = path.to_string();
        self.run(move |tx, _| {
            if Self::read_stat(tx, &path)?.is_none() {
                return Err(SegError::NotFound(path.clone()));
            }
            let mut stmt = tx
                .prepare("SELECT path FROM coord_nodes WHERE parent = ?1 ORDER BY path")
                .map_err(map_db_err)?;
            let rows = stmt
                .query_map(params![path], |row| row.get::<_, String>(0))
                .map_err(map_db_err)?;
            let mut names = Vec::new();
            for row in rows {
                let child = row.map_err(map_db_err)?;
                names.push(node_name(&child).to_string());
            }
            names.sort();
            Ok(names)
        })
        .await
    }

    async fn close(&self) -> SegResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let conn = self.conn.clone();
        let session_id = self.session_id;
        let removed = tokio::task::spawn_blocking(move || {
            let conn_guard = conn
                .lock()
                .map_err(|e| SegError::Internal(format!("conn lock poisoned: {}", e)))?;
            Self::end_session(&conn_guard, session_id)
        })
        .await
        .map_err(|e| SegError::Internal(format!("db task join failed: {}", e)))??;
        info!(
            "SqliteCoordNamespace: session {} closed, removed {} ephemeral nodes",
            session_id, removed
        );
        Ok(())
    }
}

impl Drop for SqliteCoordNamespace {
    fn drop(&mut self) {
        if let Some(handle) = self.keep_alive_handle.take() {
            handle.abort();
        }
        if !self.closed.swap(true, Ordering::SeqCst) {
            if let Ok(conn) = self.conn.lock() {
                match Self::end_session(&conn, self.session_id) {
                    Ok(removed) => debug!(
                        "SqliteCoordNamespace: session {} dropped, removed {} ephemeral nodes",
                        self.session_id, removed
                    ),
                    Err(e) => warn!(
                        "SqliteCoordNamespace: end session {} failed: {}",
                        self.session_id, e
                    ),
                }
            }
        }
    }
}
