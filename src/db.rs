//! Database module
//!
//! Persists threads and their checkpoint log. A thread's state can be
//! rebuilt entirely from its latest checkpoint, so any process holding the
//! database can resume it.

mod schema;

pub use schema::*;

use crate::state_machine::FlowState;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Thread not found: {0}")]
    ThreadNotFound(String),
    #[error("Corrupt checkpoint: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type DbResult<T> = Result<T, DbError>;

/// Thread-safe database handle
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    #[allow(dead_code)] // Used in tests
    pub fn open_in_memory() -> DbResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A panic while holding the lock cannot leave a half-applied
        // statement behind; sqlite rolls it back.
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn run_migrations(&self) -> DbResult<()> {
        let conn = self.conn();
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    // ==================== Thread Operations ====================

    /// Register a new thread with no checkpoints
    pub fn create_thread(&self, id: &str) -> DbResult<Thread> {
        let conn = self.conn();
        let now = Utc::now();
        conn.execute(
            "INSERT INTO threads (id, created_at, updated_at) VALUES (?1, ?2, ?2)",
            params![id, now.to_rfc3339()],
        )?;
        Ok(Thread {
            id: id.to_string(),
            created_at: now,
            updated_at: now,
            checkpoint_count: 0,
        })
    }

    pub fn get_thread(&self, id: &str) -> DbResult<Thread> {
        let conn = self.conn();
        conn.query_row(
            "SELECT t.id, t.created_at, t.updated_at,
                    (SELECT COUNT(*) FROM checkpoints c WHERE c.thread_id = t.id)
             FROM threads t WHERE t.id = ?1",
            params![id],
            |row| {
                Ok(Thread {
                    id: row.get(0)?,
                    created_at: parse_datetime(&row.get::<_, String>(1)?),
                    updated_at: parse_datetime(&row.get::<_, String>(2)?),
                    checkpoint_count: row.get(3)?,
                })
            },
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => DbError::ThreadNotFound(id.to_string()),
            other => DbError::Sqlite(other),
        })
    }

    /// Threads ordered by most recent activity
    pub fn list_threads(&self) -> DbResult<Vec<Thread>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT t.id, t.created_at, t.updated_at,
                    (SELECT COUNT(*) FROM checkpoints c WHERE c.thread_id = t.id)
             FROM threads t ORDER BY t.updated_at DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(Thread {
                id: row.get(0)?,
                created_at: parse_datetime(&row.get::<_, String>(1)?),
                updated_at: parse_datetime(&row.get::<_, String>(2)?),
                checkpoint_count: row.get(3)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    /// Drop every checkpoint for a thread, leaving it as freshly created
    pub fn reset_thread(&self, id: &str) -> DbResult<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let updated = tx.execute(
            "UPDATE threads SET updated_at = ?2 WHERE id = ?1",
            params![id, Utc::now().to_rfc3339()],
        )?;
        if updated == 0 {
            return Err(DbError::ThreadNotFound(id.to_string()));
        }
        tx.execute("DELETE FROM checkpoints WHERE thread_id = ?1", params![id])?;
        tx.commit()?;
        Ok(())
    }

    // ==================== Checkpoint Operations ====================

    /// Append a checkpoint, registering the thread if it is unknown.
    ///
    /// Returns the new checkpoint's sequence number.
    pub fn save_checkpoint(&self, thread_id: &str, state: &FlowState) -> DbResult<i64> {
        let position = serde_json::to_string(&state.position)?;
        let body = serde_json::to_string(state)?;
        let now = Utc::now().to_rfc3339();

        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO threads (id, created_at, updated_at) VALUES (?1, ?2, ?2)
             ON CONFLICT(id) DO UPDATE SET updated_at = excluded.updated_at",
            params![thread_id, now],
        )?;
        let sequence: i64 = tx.query_row(
            "SELECT COALESCE(MAX(sequence), 0) + 1 FROM checkpoints WHERE thread_id = ?1",
            params![thread_id],
            |row| row.get(0),
        )?;
        tx.execute(
            "INSERT INTO checkpoints (thread_id, sequence, position, state, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![thread_id, sequence, position, body, now],
        )?;
        tx.commit()?;
        Ok(sequence)
    }

    /// Most recent checkpoint for a thread, if any
    pub fn latest_checkpoint(&self, thread_id: &str) -> DbResult<Option<Checkpoint>> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT sequence, state, created_at FROM checkpoints
                 WHERE thread_id = ?1 ORDER BY sequence DESC LIMIT 1",
                params![thread_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(sequence, state, created_at)| -> DbResult<Checkpoint> {
            Ok(Checkpoint {
                thread_id: thread_id.to_string(),
                sequence,
                state: serde_json::from_str(&state)?,
                created_at: parse_datetime(&created_at),
            })
        })
        .transpose()
    }

    /// Full checkpoint log for a thread, oldest first
    pub fn checkpoint_history(&self, thread_id: &str) -> DbResult<Vec<Checkpoint>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT sequence, state, created_at FROM checkpoints
             WHERE thread_id = ?1 ORDER BY sequence ASC",
        )?;
        let rows = stmt
            .query_map(params![thread_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(sequence, state, created_at)| -> DbResult<Checkpoint> {
                Ok(Checkpoint {
                    thread_id: thread_id.to_string(),
                    sequence,
                    state: serde_json::from_str(&state)?,
                    created_at: parse_datetime(&created_at),
                })
            })
            .collect()
    }
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}
