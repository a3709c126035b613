//! Durable retry state store
//!
//! One row per (pipeline_name, original_run_id) in `pipeline_retry`, plus
//! the `settled_runs` ledger of run ids that must never open a record of
//! their own (remediation attempts, originals resolved through an attempt).
//!
//! The reconciliation loop is the single writer. Every operation runs as
//! one SQLite statement under the connection mutex, so single-key reads and
//! writes stay atomic even if callers were parallelized.

use crate::error::StoreError;
use crate::types::{RecordStatus, RecordUpdate, RunRecord, SettledReason};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::path::{Path, PathBuf};

/// Persistence contract of the reconciliation loop
pub trait RetryStore: Send + Sync {
    /// Create a pending record with `initial_budget` unless one exists.
    /// Returns whether a record was created.
    fn insert_if_absent(
        &self,
        pipeline_name: &str,
        run_id: &str,
        initial_budget: i64,
    ) -> Result<bool, StoreError>;

    fn get(&self, pipeline_name: &str, run_id: &str) -> Result<Option<RunRecord>, StoreError>;

    /// Write only the supplied fields; an empty update is a no-op
    fn update(
        &self,
        pipeline_name: &str,
        run_id: &str,
        update: &RecordUpdate,
    ) -> Result<(), StoreError>;

    /// Remove the record; absent records are fine
    fn delete(&self, pipeline_name: &str, run_id: &str) -> Result<(), StoreError>;

    /// All records ordered by key
    fn list(&self) -> Result<Vec<RunRecord>, StoreError>;

    fn mark_settled(
        &self,
        pipeline_name: &str,
        run_id: &str,
        reason: SettledReason,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    fn is_settled(&self, pipeline_name: &str, run_id: &str) -> Result<bool, StoreError>;

    /// Drop ledger entries recorded before `older_than`
    fn prune_settled(&self, older_than: DateTime<Utc>) -> Result<usize, StoreError>;
}

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS pipeline_retry (
        pipeline_name TEXT NOT NULL,
        original_run_id TEXT NOT NULL,
        retry_count INTEGER NOT NULL,
        last_attempt_run_id TEXT,
        status TEXT NOT NULL DEFAULT 'pending',
        notified INTEGER NOT NULL DEFAULT 0,
        last_notification_time TEXT,
        last_error TEXT,
        PRIMARY KEY (pipeline_name, original_run_id),
        CHECK (status IN ('pending', 'running')),
        CHECK (status <> 'running'
               OR (last_attempt_run_id IS NOT NULL AND last_attempt_run_id <> ''))
    );
    CREATE TABLE IF NOT EXISTS settled_runs (
        pipeline_name TEXT NOT NULL,
        run_id TEXT NOT NULL,
        reason TEXT NOT NULL,
        recorded_at INTEGER NOT NULL,
        PRIMARY KEY (pipeline_name, run_id)
    );
    CREATE INDEX IF NOT EXISTS idx_settled_runs_recorded_at
    ON settled_runs (recorded_at);
";

const SELECT_RECORD: &str = "
    SELECT pipeline_name, original_run_id, retry_count, last_attempt_run_id,
           status, notified, last_notification_time, last_error
    FROM pipeline_retry
";

/// Columns exactly as stored, decoded into a record outside the row closure
struct RawRecord {
    pipeline_name: String,
    original_run_id: String,
    retry_count: i64,
    last_attempt_run_id: Option<String>,
    status: String,
    notified: bool,
    last_notification_time: Option<String>,
    last_error: Option<String>,
}

impl RawRecord {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            pipeline_name: row.get(0)?,
            original_run_id: row.get(1)?,
            retry_count: row.get(2)?,
            last_attempt_run_id: row.get(3)?,
            status: row.get(4)?,
            notified: row.get(5)?,
            last_notification_time: row.get(6)?,
            last_error: row.get(7)?,
        })
    }

    fn into_record(self) -> Result<RunRecord, StoreError> {
        let status = self
            .status
            .parse::<RecordStatus>()
            .map_err(StoreError::CorruptRow)?;
        let last_notification_time = self
            .last_notification_time
            .map(|ts| {
                DateTime::parse_from_rfc3339(&ts)
                    .map(|t| t.with_timezone(&Utc))
                    .map_err(|e| StoreError::CorruptRow(format!("notification time '{ts}': {e}")))
            })
            .transpose()?;
        Ok(RunRecord {
            pipeline_name: self.pipeline_name,
            original_run_id: self.original_run_id,
            retry_count: self.retry_count,
            last_attempt_run_id: self.last_attempt_run_id,
            status,
            notified: self.notified,
            last_notification_time,
            last_error: self.last_error,
        })
    }
}

/// SQLite-backed retry state store
#[derive(Debug)]
pub struct SqliteRetryStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl SqliteRetryStore {
    /// Open (or create) the store file and ensure the schema
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let conn = Connection::open(path).map_err(|e| StoreError::open(path, e))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })
        .map_err(|e| StoreError::open(path, e))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|e| StoreError::open(path, e))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| StoreError::open(path, e))?;

        tracing::debug!(path = %path.display(), "retry store opened");
        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        })
    }

    /// Non-durable store for tests
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    /// Backing file, `None` for in-memory stores
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl RetryStore for SqliteRetryStore {
    fn insert_if_absent(
        &self,
        pipeline_name: &str,
        run_id: &str,
        initial_budget: i64,
    ) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO pipeline_retry
             (pipeline_name, original_run_id, retry_count, last_attempt_run_id, status, notified)
             VALUES (?1, ?2, ?3, NULL, 'pending', 0)",
            params![pipeline_name, run_id, initial_budget],
        )?;
        Ok(inserted == 1)
    }

    fn get(&self, pipeline_name: &str, run_id: &str) -> Result<Option<RunRecord>, StoreError> {
        let conn = self.conn.lock();
        let raw = conn
            .query_row(
                &format!("{SELECT_RECORD} WHERE pipeline_name = ?1 AND original_run_id = ?2"),
                params![pipeline_name, run_id],
                RawRecord::from_row,
            )
            .optional()?;
        raw.map(RawRecord::into_record).transpose()
    }

    fn update(
        &self,
        pipeline_name: &str,
        run_id: &str,
        update: &RecordUpdate,
    ) -> Result<(), StoreError> {
        let mut sets: Vec<&str> = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        if let Some(count) = update.retry_count {
            sets.push("retry_count = ?");
            values.push(Value::Integer(count));
        }
        if let Some(id) = &update.last_attempt_run_id {
            sets.push("last_attempt_run_id = ?");
            values.push(Value::Text(id.clone()));
        }
        if let Some(status) = update.status {
            sets.push("status = ?");
            values.push(Value::Text(status.as_str().to_string()));
        }
        if let Some(notified) = update.notified {
            sets.push("notified = ?");
            values.push(Value::Integer(i64::from(notified)));
        }
        if let Some(at) = update.last_notification_time {
            sets.push("last_notification_time = ?");
            values.push(Value::Text(at.to_rfc3339()));
        }
        if let Some(error) = &update.last_error {
            sets.push("last_error = ?");
            values.push(Value::Text(error.clone()));
        }

        if sets.is_empty() {
            return Ok(());
        }

        values.push(Value::Text(pipeline_name.to_string()));
        values.push(Value::Text(run_id.to_string()));
        let sql = format!(
            "UPDATE pipeline_retry SET {} WHERE pipeline_name = ? AND original_run_id = ?",
            sets.join(", ")
        );

        let conn = self.conn.lock();
        conn.execute(&sql, params_from_iter(values))?;
        Ok(())
    }

    fn delete(&self, pipeline_name: &str, run_id: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM pipeline_retry WHERE pipeline_name = ?1 AND original_run_id = ?2",
            params![pipeline_name, run_id],
        )?;
        Ok(())
    }

    fn list(&self) -> Result<Vec<RunRecord>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare(&format!("{SELECT_RECORD} ORDER BY pipeline_name, original_run_id"))?;
        let raws = stmt
            .query_map([], RawRecord::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        raws.into_iter().map(RawRecord::into_record).collect()
    }

    fn mark_settled(
        &self,
        pipeline_name: &str,
        run_id: &str,
        reason: SettledReason,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO settled_runs (pipeline_name, run_id, reason, recorded_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (pipeline_name, run_id)
             DO UPDATE SET reason = excluded.reason, recorded_at = excluded.recorded_at",
            params![pipeline_name, run_id, reason.as_str(), at.timestamp()],
        )?;
        Ok(())
    }

    fn is_settled(&self, pipeline_name: &str, run_id: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM settled_runs WHERE pipeline_name = ?1 AND run_id = ?2",
                params![pipeline_name, run_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn prune_settled(&self, older_than: DateTime<Utc>) -> Result<usize, StoreError> {
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM settled_runs WHERE recorded_at < ?1",
            params![older_than.timestamp()],
        )?;
        Ok(removed)
    }
}
