//! Durable session cursors
//!
//! A cursor records the last assistant message the client saw complete
//! for a session, so a later resync into an empty local history knows
//! where the stream left off. Cursors survive process restarts.

use crate::error::{Result, SyncError};
use anyhow::Context;
use chrono::{DateTime, Utc};
use directories::ProjectDirs;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Last synchronized position of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCursor {
    /// Session the cursor belongs to
    pub session_id: String,
    /// Last completed assistant message
    pub message_id: String,
    /// Completion time of that message (milliseconds since epoch)
    pub completed_at: i64,
}

/// Read/write access to durable cursors
///
/// Implementations are synchronous: a cursor is a single small row and
/// writes happen on message completion, not per event.
pub trait CursorStore: Send + Sync {
    /// Cursor for a session, if one was ever written
    fn read_cursor(&self, session_id: &str) -> Result<Option<SessionCursor>>;

    /// Insert or overwrite the cursor for `cursor.session_id`
    fn write_cursor(&self, cursor: &SessionCursor) -> Result<()>;
}

/// SQLite-backed cursor store
pub struct SqliteCursorStore {
    db_path: PathBuf,
}

impl SqliteCursorStore {
    /// Open the cursor database in the user's data directory.
    ///
    /// `OPENCHAMBER_CURSOR_DB` overrides the location.
    pub fn new() -> Result<Self> {
        if let Ok(override_path) = std::env::var("OPENCHAMBER_CURSOR_DB") {
            return Self::new_with_path(override_path);
        }

        let proj_dirs = ProjectDirs::from("ai", "openchamber", "openchamber-sync")
            .ok_or_else(|| SyncError::Storage("Could not determine data directory".into()))?;

        let data_dir = proj_dirs.data_dir();
        std::fs::create_dir_all(data_dir)
            .context("Failed to create data directory")
            .map_err(|e| SyncError::Storage(e.to_string()))?;

        Self::new_with_path(data_dir.join("cursors.db"))
    }

    /// Open (creating if needed) a cursor database at `db_path`.
    ///
    /// # Examples
    ///
    /// ```
    /// use openchamber_sync::storage::SqliteCursorStore;
    ///
    /// let dir = tempfile::tempdir().unwrap();
    /// let store = SqliteCursorStore::new_with_path(dir.path().join("cursors.db")).unwrap();
    /// ```
    pub fn new_with_path<P: Into<PathBuf>>(db_path: P) -> Result<Self> {
        let db_path = db_path.into();

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .context("Failed to create parent directory for database")
                .map_err(|e| SyncError::Storage(e.to_string()))?;
        }

        let store = Self { db_path };
        store.init()?;
        Ok(store)
    }

    /// Path of the backing database file
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn open(&self) -> Result<Connection> {
        Connection::open(&self.db_path)
            .context("Failed to open database")
            .map_err(|e| SyncError::Storage(e.to_string()).into())
    }

    fn init(&self) -> Result<()> {
        let conn = self.open()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS session_cursors (
                session_id TEXT PRIMARY KEY,
                message_id TEXT NOT NULL,
                completed_at INTEGER NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )
        .context("Failed to create tables")
        .map_err(|e| SyncError::Storage(e.to_string()))?;
        Ok(())
    }

    /// All stored cursors, most recently written first
    pub fn list_cursors(&self) -> Result<Vec<(SessionCursor, DateTime<Utc>)>> {
        let conn = self.open()?;
        let mut stmt = conn
            .prepare(
                "SELECT session_id, message_id, completed_at, updated_at
                 FROM session_cursors ORDER BY updated_at DESC",
            )
            .context("Failed to prepare query")
            .map_err(|e| SyncError::Storage(e.to_string()))?;

        let rows = stmt
            .query_map([], |row| {
                let updated_at: String = row.get(3)?;
                Ok((
                    SessionCursor {
                        session_id: row.get(0)?,
                        message_id: row.get(1)?,
                        completed_at: row.get(2)?,
                    },
                    updated_at,
                ))
            })
            .context("Failed to query cursors")
            .map_err(|e| SyncError::Storage(e.to_string()))?;

        let mut cursors = Vec::new();
        for row in rows {
            let (cursor, updated_at) = row
                .context("Failed to read cursor row")
                .map_err(|e| SyncError::Storage(e.to_string()))?;
            let updated_at = DateTime::parse_from_rfc3339(&updated_at)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now());
            cursors.push((cursor, updated_at));
        }
        Ok(cursors)
    }

    /// Delete the cursor of a session. Deleting a missing cursor is not an error.
    pub fn delete_cursor(&self, session_id: &str) -> Result<()> {
        let conn = self.open()?;
        conn.execute(
            "DELETE FROM session_cursors WHERE session_id = ?",
            params![session_id],
        )
        .context("Failed to delete cursor")
        .map_err(|e| SyncError::Storage(e.to_string()))?;
        Ok(())
    }
}

impl CursorStore for SqliteCursorStore {
    fn read_cursor(&self, session_id: &str) -> Result<Option<SessionCursor>> {
        let conn = self.open()?;
        let cursor = conn
            .query_row(
                "SELECT session_id, message_id, completed_at FROM session_cursors
                 WHERE session_id = ?",
                params![session_id],
                |row| {
                    Ok(SessionCursor {
                        session_id: row.get(0)?,
                        message_id: row.get(1)?,
                        completed_at: row.get(2)?,
                    })
                },
            )
            .optional()
            .context("Failed to query cursor")
            .map_err(|e| SyncError::Storage(e.to_string()))?;
        Ok(cursor)
    }

    fn write_cursor(&self, cursor: &SessionCursor) -> Result<()> {
        let conn = self.open()?;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO session_cursors (session_id, message_id, completed_at, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(session_id) DO UPDATE SET
                message_id = excluded.message_id,
                completed_at = excluded.completed_at,
                updated_at = excluded.updated_at",
            params![cursor.session_id, cursor.message_id, cursor.completed_at, now],
        )
        .context("Failed to write cursor")
        .map_err(|e| SyncError::Storage(e.to_string()))?;
        Ok(())
    }
}

/// In-memory cursor store for tests and ephemeral runs
#[derive(Debug, Default)]
pub struct MemoryCursorStore {
    cursors: Mutex<HashMap<String, SessionCursor>>,
}

impl MemoryCursorStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl CursorStore for MemoryCursorStore {
    fn read_cursor(&self, session_id: &str) -> Result<Option<SessionCursor>> {
        let cursors = self
            .cursors
            .lock()
            .map_err(|_| SyncError::Storage("cursor map poisoned".into()))?;
        Ok(cursors.get(session_id).cloned())
    }

    fn write_cursor(&self, cursor: &SessionCursor) -> Result<()> {
        let mut cursors = self
            .cursors
            .lock()
            .map_err(|_| SyncError::Storage("cursor map poisoned".into()))?;
        cursors.insert(cursor.session_id.clone(), cursor.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;
    use tempfile::tempdir;

    fn create_test_store() -> (SqliteCursorStore, tempfile::TempDir) {
        let dir = tempdir().expect("failed to create tempdir");
        let store = SqliteCursorStore::new_with_path(dir.path().join("cursors.db"))
            .expect("failed to create store");
        (store, dir)
    }

    fn cursor(session: &str, message: &str, completed_at: i64) -> SessionCursor {
        SessionCursor {
            session_id: session.to_string(),
            message_id: message.to_string(),
            completed_at,
        }
    }

    #[test]
    fn test_init_creates_table() {
        let (store, _dir) = create_test_store();
        let conn = Connection::open(store.db_path()).expect("open connection");
        let count: i64 = conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type='table' AND name='session_cursors'",
                [],
                |r| r.get(0),
            )
            .expect("query row");
        assert_eq!(count, 1);
    }

    #[test]
    fn test_read_missing_cursor_returns_none() {
        let (store, _dir) = create_test_store();
        assert!(store.read_cursor("ses_1").expect("read failed").is_none());
    }

    #[test]
    fn test_write_then_overwrite_cursor() {
        let (store, _dir) = create_test_store();
        store.write_cursor(&cursor("ses_1", "msg_a", 10)).unwrap();
        store.write_cursor(&cursor("ses_1", "msg_b", 20)).unwrap();

        let loaded = store.read_cursor("ses_1").unwrap().expect("cursor");
        assert_eq!(loaded, cursor("ses_1", "msg_b", 20));
        assert_eq!(store.list_cursors().unwrap().len(), 1);
    }

    #[test]
    fn test_cursor_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cursors.db");
        SqliteCursorStore::new_with_path(&path)
            .unwrap()
            .write_cursor(&cursor("ses_1", "msg_a", 10))
            .unwrap();

        let reopened = SqliteCursorStore::new_with_path(&path).unwrap();
        assert_eq!(
            reopened.read_cursor("ses_1").unwrap(),
            Some(cursor("ses_1", "msg_a", 10))
        );
    }

    #[test]
    fn test_delete_cursor_is_idempotent() {
        let (store, _dir) = create_test_store();
        store.write_cursor(&cursor("ses_1", "msg_a", 10)).unwrap();
        store.delete_cursor("ses_1").unwrap();
        store.delete_cursor("ses_1").unwrap();
        assert!(store.read_cursor("ses_1").unwrap().is_none());
    }

    #[test]
    fn test_memory_store_round_trip() {
        let store = MemoryCursorStore::new();
        assert!(store.read_cursor("ses_1").unwrap().is_none());
        store.write_cursor(&cursor("ses_1", "msg_a", 10)).unwrap();
        assert_eq!(
            store.read_cursor("ses_1").unwrap(),
            Some(cursor("ses_1", "msg_a", 10))
        );
    }

    #[test]
    #[serial]
    fn test_new_respects_env_override() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let db_path = dir.path().join("nested").join("cursors.db");
        env::set_var("OPENCHAMBER_CURSOR_DB", db_path.to_string_lossy().to_string());

        let store = SqliteCursorStore::new().expect("new failed with env override");
        assert_eq!(store.db_path(), db_path.as_path());
        assert!(db_path.parent().unwrap().exists());

        env::remove_var("OPENCHAMBER_CURSOR_DB");
    }
}
