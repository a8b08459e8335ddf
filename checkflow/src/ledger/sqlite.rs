//! SQLite-backed attempt ledger.
//!
//! This module is feature-gated behind `sqlite`.

use super::{AttemptLedger, AttemptLogs, AttemptRecord};
use crate::core::RunId;
use crate::errors::LedgerError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use std::path::Path;
use std::sync::Arc;

fn map_storage_err(prefix: &str, err: impl std::fmt::Display) -> LedgerError {
    LedgerError::Storage(format!("{prefix}: {err}"))
}

const SELECT_COLUMNS: &str = "run_id, step_index, step_name, status, attempt, error, \
                              logs_json, snapshot_json, created_at";

/// Ledger stored in a single SQLite table keyed by
/// `(run_id, step_index, attempt)`.
///
/// Writes commit before `record` returns. Statements run on tokio's
/// blocking pool against a connection serialized behind a mutex.
pub struct SqliteLedger {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for SqliteLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteLedger").finish_non_exhaustive()
    }
}

impl SqliteLedger {
    /// Opens (or creates) a ledger database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| map_storage_err("create parent dir", e))?;
            }
        }
        let conn = Connection::open(path).map_err(|e| map_storage_err("open sqlite db", e))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| map_storage_err("set journal_mode", e))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|e| map_storage_err("set synchronous", e))?;
        Self::from_connection(conn)
    }

    /// Opens a private in-memory database.
    pub fn open_in_memory() -> Result<Self, LedgerError> {
        let conn =
            Connection::open_in_memory().map_err(|e| map_storage_err("open sqlite db", e))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, LedgerError> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS attempt_ledger (
                run_id TEXT NOT NULL,
                step_index INTEGER NOT NULL,
                step_name TEXT NOT NULL,
                status TEXT NOT NULL,
                attempt INTEGER NOT NULL,
                error TEXT,
                logs_json TEXT NOT NULL,
                snapshot_json TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (run_id, step_index, attempt)
            );
            ",
        )
        .map_err(|e| map_storage_err("ensure schema", e))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs `f` against the connection on a blocking thread.
    async fn call<F, R>(&self, f: F) -> Result<R, LedgerError>
    where
        F: FnOnce(&Connection) -> Result<R, LedgerError> + Send + 'static,
        R: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || f(&conn.lock()))
            .await
            .map_err(|e| map_storage_err("ledger task panicked", e))?
    }

    fn decode_row(row: &Row<'_>) -> rusqlite::Result<RawRow> {
        Ok(RawRow {
            run_id: row.get(0)?,
            step_index: row.get(1)?,
            step_name: row.get(2)?,
            status: row.get(3)?,
            attempt: row.get(4)?,
            error: row.get(5)?,
            logs_json: row.get(6)?,
            snapshot_json: row.get(7)?,
            created_at: row.get(8)?,
        })
    }
}

/// Column values as stored, before domain decoding.
struct RawRow {
    run_id: String,
    step_index: i64,
    step_name: String,
    status: String,
    attempt: i64,
    error: Option<String>,
    logs_json: String,
    snapshot_json: String,
    created_at: String,
}

impl RawRow {
    fn into_record(self) -> Result<AttemptRecord, LedgerError> {
        let logs: AttemptLogs = serde_json::from_str(&self.logs_json)?;
        let created_at = DateTime::parse_from_rfc3339(&self.created_at)
            .map_err(|e| LedgerError::Serialization(format!("created_at: {e}")))?
            .with_timezone(&Utc);
        Ok(AttemptRecord {
            run_id: RunId::new(self.run_id),
            step_index: u64::try_from(self.step_index)
                .map_err(|e| LedgerError::Serialization(format!("step_index: {e}")))?,
            step_name: self.step_name.parse().map_err(LedgerError::Serialization)?,
            status: self.status.parse().map_err(LedgerError::Serialization)?,
            attempt: u32::try_from(self.attempt)
                .map_err(|e| LedgerError::Serialization(format!("attempt: {e}")))?,
            error: self.error,
            logs,
            snapshot: serde_json::from_str(&self.snapshot_json)?,
            created_at,
        })
    }
}

#[async_trait]
impl AttemptLedger for SqliteLedger {
    async fn record(&self, record: AttemptRecord) -> Result<(), LedgerError> {
        let logs_json = serde_json::to_string(&record.logs)?;
        let snapshot_json = serde_json::to_string(&record.snapshot)?;
        let step_index = i64::try_from(record.step_index)
            .map_err(|e| LedgerError::Serialization(format!("step_index: {e}")))?;

        self.call(move |conn| {
            let result = conn.execute(
                "INSERT INTO attempt_ledger (run_id, step_index, step_name, status, attempt, error, \
                 logs_json, snapshot_json, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    record.run_id.as_str(),
                    step_index,
                    record.step_name.as_str(),
                    record.status.as_str(),
                    i64::from(record.attempt),
                    record.error,
                    logs_json,
                    snapshot_json,
                    record.created_at.to_rfc3339(),
                ],
            );

            match result {
                Ok(_) => Ok(()),
                Err(rusqlite::Error::SqliteFailure(err, _))
                    if err.code == ErrorCode::ConstraintViolation =>
                {
                    Err(LedgerError::DuplicateAttempt {
                        run_id: record.run_id,
                        step_index: record.step_index,
                        attempt: record.attempt,
                    })
                }
                Err(e) => Err(map_storage_err("insert attempt", e)),
            }
        })
        .await
    }

    async fn latest(&self, run_id: &RunId) -> Result<Option<AttemptRecord>, LedgerError> {
        let run_id = run_id.as_str().to_string();
        let raw = self
            .call(move |conn| {
                conn.query_row(
                    &format!(
                        "SELECT {SELECT_COLUMNS} FROM attempt_ledger WHERE run_id = ?1 \
                         ORDER BY step_index DESC, attempt DESC LIMIT 1"
                    ),
                    params![run_id],
                    Self::decode_row,
                )
                .optional()
                .map_err(|e| map_storage_err("query latest", e))
            })
            .await?;
        raw.map(RawRow::into_record).transpose()
    }

    async fn history(&self, run_id: &RunId) -> Result<Vec<AttemptRecord>, LedgerError> {
        let run_id = run_id.as_str().to_string();
        let raws = self
            .call(move |conn| {
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT {SELECT_COLUMNS} FROM attempt_ledger WHERE run_id = ?1 \
                         ORDER BY step_index ASC, attempt ASC"
                    ))
                    .map_err(|e| map_storage_err("prepare history", e))?;
                let rows = stmt
                    .query_map(params![run_id], Self::decode_row)
                    .map_err(|e| map_storage_err("query history", e))?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row.map_err(|e| map_storage_err("row decode", e))?);
                }
                Ok(out)
            })
            .await?;
        raws.into_iter().map(RawRow::into_record).collect()
    }
}
