//! Segment index: the persistent, ordered record of completed segments.
//!
//! [`SegmentStore`] is the seam the retention engine and health monitor talk
//! to; [`SqliteSegmentStore`] is the SQLite-backed implementation.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use tracing::{info, warn};

use crate::error::CaptureError;
use crate::segment::{CallDirection, NewSegment, Segment};

pub trait SegmentStore: Send + Sync {
    /// Insert a segment and return its id. Re-inserting an already indexed
    /// path returns the existing id.
    fn insert(&self, segment: &NewSegment) -> Result<i64, CaptureError>;
    fn get_by_id(&self, id: i64) -> Result<Option<Segment>, CaptureError>;
    /// All segments, newest first.
    fn get_all(&self) -> Result<Vec<Segment>, CaptureError>;
    /// Segments overlapping `[from, to]`, newest first.
    fn get_in_range(&self, from: i64, to: i64) -> Result<Vec<Segment>, CaptureError>;
    /// Segments whose end time is before `timestamp`, oldest first.
    fn get_older_than(&self, timestamp: i64) -> Result<Vec<Segment>, CaptureError>;
    /// The `limit` segments with the earliest start time.
    fn get_oldest(&self, limit: usize) -> Result<Vec<Segment>, CaptureError>;
    fn get_all_paths(&self) -> Result<Vec<PathBuf>, CaptureError>;
    fn total_size(&self) -> Result<u64, CaptureError>;
    fn count(&self) -> Result<u64, CaptureError>;
    /// Returns `false` when no such segment exists.
    fn set_saved(&self, id: i64, saved: bool) -> Result<bool, CaptureError>;
    /// Returns `false` when the row was already gone.
    fn delete_by_id(&self, id: i64) -> Result<bool, CaptureError>;
    fn delete_by_ids(&self, ids: &[i64]) -> Result<usize, CaptureError>;
    fn delete_all(&self) -> Result<usize, CaptureError>;
}

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS segments (
        id             INTEGER PRIMARY KEY AUTOINCREMENT,
        file_path      TEXT    NOT NULL UNIQUE,
        start_time     INTEGER NOT NULL,
        end_time       INTEGER NOT NULL,
        duration       INTEGER NOT NULL,
        file_size      INTEGER NOT NULL,
        is_call        INTEGER NOT NULL DEFAULT 0,
        call_direction TEXT,
        call_number    TEXT,
        is_saved       INTEGER NOT NULL DEFAULT 0,
        created_at     INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS segments_start_time ON segments (start_time);
    CREATE INDEX IF NOT EXISTS segments_end_time   ON segments (end_time);
";

const COLUMNS: &str = "id, file_path, start_time, end_time, duration, file_size, \
                       is_call, call_direction, call_number, is_saved, created_at";

/// SQLite-backed [`SegmentStore`]. One connection, serialised by a mutex.
pub struct SqliteSegmentStore {
    conn: Mutex<Connection>,
}

impl SqliteSegmentStore {
    /// Open (or create) the index at `db_path` and make sure the schema exists.
    pub fn open(db_path: &Path) -> Result<Self, CaptureError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        conn.busy_timeout(Duration::from_secs(2))?;
        let store = Self::init(conn)?;
        info!("Segment index ready at {}", db_path.display());
        Ok(store)
    }

    /// A private in-memory index, used by tests and dry runs.
    pub fn open_in_memory() -> Result<Self, CaptureError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, CaptureError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Segment index mutex poisoned; recovering");
                poisoned.into_inner()
            }
        }
    }

    fn query(
        &self,
        sql: &str,
        args: impl rusqlite::Params,
    ) -> Result<Vec<Segment>, CaptureError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(args, row_to_segment)?;
        let segments = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(segments)
    }
}

fn row_to_segment(row: &Row<'_>) -> rusqlite::Result<Segment> {
    let path: String = row.get(1)?;
    let direction: Option<String> = row.get(7)?;
    Ok(Segment {
        id: row.get(0)?,
        file_path: PathBuf::from(path),
        start_time: row.get(2)?,
        end_time: row.get(3)?,
        duration: row.get(4)?,
        file_size: row.get::<_, i64>(5)?.max(0) as u64,
        is_call: row.get(6)?,
        call_direction: direction.as_deref().and_then(CallDirection::parse),
        call_number: row.get(8)?,
        is_saved: row.get(9)?,
        created_at: row.get(10)?,
    })
}

impl SegmentStore for SqliteSegmentStore {
    fn insert(&self, s: &NewSegment) -> Result<i64, CaptureError> {
        let conn = self.conn();
        let path = s.file_path.to_string_lossy().into_owned();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO segments (file_path, start_time, end_time, duration, \
             file_size, is_call, call_direction, call_number, is_saved, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?9)",
            params![
                path,
                s.start_time,
                s.end_time,
                s.duration,
                s.file_size as i64,
                s.call.is_some(),
                s.call.as_ref().map(|c| c.direction.as_str()),
                s.call.as_ref().and_then(|c| c.number.as_deref()),
                s.created_at,
            ],
        )?;
        if inserted == 1 {
            return Ok(conn.last_insert_rowid());
        }
        let id = conn.query_row(
            "SELECT id FROM segments WHERE file_path = ?1",
            params![path],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    fn get_by_id(&self, id: i64) -> Result<Option<Segment>, CaptureError> {
        let conn = self.conn();
        let seg = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM segments WHERE id = ?1"),
                params![id],
                row_to_segment,
            )
            .optional()?;
        Ok(seg)
    }

    fn get_all(&self) -> Result<Vec<Segment>, CaptureError> {
        self.query(
            &format!("SELECT {COLUMNS} FROM segments ORDER BY start_time DESC"),
            [],
        )
    }

    fn get_in_range(&self, from: i64, to: i64) -> Result<Vec<Segment>, CaptureError> {
        self.query(
            &format!(
                "SELECT {COLUMNS} FROM segments WHERE end_time >= ?1 AND start_time <= ?2 \
                 ORDER BY start_time DESC"
            ),
            params![from, to],
        )
    }

    fn get_older_than(&self, timestamp: i64) -> Result<Vec<Segment>, CaptureError> {
        self.query(
            &format!(
                "SELECT {COLUMNS} FROM segments WHERE end_time < ?1 ORDER BY start_time ASC"
            ),
            params![timestamp],
        )
    }

    fn get_oldest(&self, limit: usize) -> Result<Vec<Segment>, CaptureError> {
        self.query(
            &format!("SELECT {COLUMNS} FROM segments ORDER BY start_time ASC, id ASC LIMIT ?1"),
            params![limit as i64],
        )
    }

    fn get_all_paths(&self) -> Result<Vec<PathBuf>, CaptureError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT file_path FROM segments")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut paths = Vec::new();
        for path in rows {
            paths.push(PathBuf::from(path?));
        }
        Ok(paths)
    }

    fn total_size(&self) -> Result<u64, CaptureError> {
        let total: Option<i64> =
            self.conn()
                .query_row("SELECT SUM(file_size) FROM segments", [], |row| row.get(0))?;
        Ok(total.unwrap_or(0).max(0) as u64)
    }

    fn count(&self) -> Result<u64, CaptureError> {
        let n: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM segments", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    fn set_saved(&self, id: i64, saved: bool) -> Result<bool, CaptureError> {
        let n = self.conn().execute(
            "UPDATE segments SET is_saved = ?1 WHERE id = ?2",
            params![saved, id],
        )?;
        Ok(n == 1)
    }

    fn delete_by_id(&self, id: i64) -> Result<bool, CaptureError> {
        let n = self
            .conn()
            .execute("DELETE FROM segments WHERE id = ?1", params![id])?;
        Ok(n == 1)
    }

    fn delete_by_ids(&self, ids: &[i64]) -> Result<usize, CaptureError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let n = self.conn().execute(
            &format!("DELETE FROM segments WHERE id IN ({placeholders})"),
            params_from_iter(ids.iter()),
        )?;
        Ok(n)
    }

    fn delete_all(&self) -> Result<usize, CaptureError> {
        Ok(self.conn().execute("DELETE FROM segments", [])?)
    }
}
