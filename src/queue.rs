//! Local Durable Queue
//!
//! SQLite-backed store for scans captured while the record store is
//! unreachable. One row per buffered scan; a row disappears once the
//! record store has confirmed it.
//!
//! All access goes through a single connection mutex. The duplicate check
//! and the insert run in one transaction under that mutex, and a partial
//! unique index on pending tags backs it up, so two concurrent offline
//! scans of one tag can never both be buffered. The guard is never held
//! across an `.await`.

use crate::error::Result;
use crate::models::{EpcCode, PendingWrite, SyncState};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS pending_writes (
    id TEXT PRIMARY KEY,
    tag_id TEXT NOT NULL,
    station_id TEXT NOT NULL,
    origin_address TEXT NOT NULL,
    sync_state INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_pending_writes_tag
    ON pending_writes (tag_id) WHERE sync_state = 0;

CREATE INDEX IF NOT EXISTS idx_pending_writes_created
    ON pending_writes (created_at);
"#;

const SELECT_COLUMNS: &str =
    "id, tag_id, station_id, origin_address, sync_state, created_at";

/// Result of [`LocalQueue::insert_if_absent`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    /// A new pending row was written
    Inserted(PendingWrite),
    /// A pending row for the tag already exists; nothing was written
    DuplicatePending(PendingWrite),
}

pub struct LocalQueue {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl LocalQueue {
    /// Open (or create) the queue file
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        let queue = Self::with_connection(conn, Some(path.to_path_buf()))?;

        info!(path = %path.display(), pending = queue.pending_count()?, "offline queue opened");
        Ok(queue)
    }

    /// In-memory queue, lost on drop
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, None)
    }

    fn with_connection(conn: Connection, path: Option<PathBuf>) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    /// Backing file, if any
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Buffer a scan unless the tag already has a pending row
    pub fn insert_if_absent(
        &self,
        tag: &EpcCode,
        station_id: &str,
        origin_address: &str,
        created_at: DateTime<Utc>,
    ) -> Result<InsertOutcome> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if let Some(existing) = find_pending_in(&tx, tag)? {
            debug!(tag = %tag, id = %existing.id, "tag already buffered");
            return Ok(InsertOutcome::DuplicatePending(existing));
        }

        let write = PendingWrite {
            id: ulid::Ulid::new().to_string(),
            tag_id: tag.clone(),
            station_id: station_id.to_string(),
            origin_address: origin_address.to_string(),
            sync_state: SyncState::Pending,
            created_at,
        };

        let inserted = tx.execute(
            "INSERT INTO pending_writes (id, tag_id, station_id, origin_address, sync_state, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                write.id,
                write.tag_id.as_str(),
                write.station_id,
                write.origin_address,
                write.sync_state.as_i64(),
                write.created_at.timestamp_micros(),
            ],
        );

        match inserted {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(e, message)) if e.code == ErrorCode::ConstraintViolation => {
                // Unique index caught a pending row the lookup missed
                return match find_pending_in(&tx, tag)? {
                    Some(existing) => Ok(InsertOutcome::DuplicatePending(existing)),
                    None => Err(rusqlite::Error::SqliteFailure(e, message).into()),
                };
            }
            Err(e) => return Err(e.into()),
        }

        tx.commit()?;
        debug!(tag = %tag, id = %write.id, "scan buffered");
        Ok(InsertOutcome::Inserted(write))
    }

    /// All pending rows, oldest capture first
    pub fn snapshot_pending(&self) -> Result<Vec<PendingWrite>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM pending_writes WHERE sync_state = 0 ORDER BY created_at, id",
            SELECT_COLUMNS
        ))?;

        let rows = stmt
            .query_map([], row_to_write)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn find_pending(&self, tag: &EpcCode) -> Result<Option<PendingWrite>> {
        let conn = self.conn.lock();
        find_pending_in(&conn, tag)
    }

    /// Remove a delivered row by id. Returns false if it was already gone.
    pub fn remove(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let removed = conn.execute("DELETE FROM pending_writes WHERE id = ?1", params![id])?;
        Ok(removed > 0)
    }

    pub fn pending_count(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM pending_writes WHERE sync_state = 0",
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

fn find_pending_in(conn: &Connection, tag: &EpcCode) -> Result<Option<PendingWrite>> {
    let write = conn
        .query_row(
            &format!(
                "SELECT {} FROM pending_writes WHERE tag_id = ?1 AND sync_state = 0",
                SELECT_COLUMNS
            ),
            params![tag.as_str()],
            row_to_write,
        )
        .optional()?;
    Ok(write)
}

fn row_to_write(row: &Row<'_>) -> rusqlite::Result<PendingWrite> {
    let tag: String = row.get(1)?;
    let tag_id = EpcCode::parse(&tag).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
    })?;

    let micros: i64 = row.get(5)?;
    let created_at = DateTime::from_timestamp_micros(micros).ok_or_else(|| {
        rusqlite::Error::IntegralValueOutOfRange(5, micros)
    })?;

    Ok(PendingWrite {
        id: row.get(0)?,
        tag_id,
        station_id: row.get(2)?,
        origin_address: row.get(3)?,
        sync_state: SyncState::from_i64(row.get(4)?),
        created_at,
    })
}
