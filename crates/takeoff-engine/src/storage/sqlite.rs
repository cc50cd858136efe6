//! SQLite-backed run registry
//!
//! One row per run. The guarded update is a single `UPDATE ... WHERE run_id = ? AND status = ?`
//! executed under the connection lock, so the status check and the write are atomic.

use chrono::{DateTime, SubsecRound, Utc};
use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, types::Value, Connection, OptionalExtension};
use std::path::Path;

use super::codec::{
    decode_opt_json, decode_opt_timestamp, decode_timestamp, encode_json, encode_timestamp,
};
use super::registry::{RunRegistry, ScanFilter};
use crate::error::{Error, Result};
use crate::types::{JobRecord, RecordPatch, RunId, RunStatus, Trigger};

const COLUMNS: &str = "run_id, status, input_ref, trigger_source, started_at, last_heartbeat, \
                       retry_count, result, confidence, error, ended_at, upload";

/// SQLite-based run registry
pub struct SqliteRunRegistry {
    conn: Mutex<Connection>,
}

impl SqliteRunRegistry {
    /// Create or open the registry at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)
            .map_err(|e| Error::storage(format!("Failed to open registry: {}", e)))?;

        let registry = Self {
            conn: Mutex::new(conn),
        };
        registry.migrate()?;
        Ok(registry)
    }

    /// Create an in-memory registry (for testing)
    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::storage(format!("Failed to open in-memory registry: {}", e)))?;

        let registry = Self {
            conn: Mutex::new(conn),
        };
        registry.migrate()?;
        Ok(registry)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA busy_timeout=5000;
            "#,
        )
        .map_err(|e| Error::storage(format!("Failed to set pragmas: {}", e)))?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS runs (
                run_id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                input_ref TEXT NOT NULL,
                trigger_source TEXT NOT NULL,
                started_at TEXT NOT NULL,
                last_heartbeat TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                result TEXT,
                confidence REAL,
                error TEXT,
                ended_at TEXT,
                upload TEXT
            );

            -- Monitor and recovery scans
            CREATE INDEX IF NOT EXISTS idx_runs_status_heartbeat ON runs(status, last_heartbeat);
            "#,
        )
        .map_err(|e| Error::storage(format!("Failed to run migrations: {}", e)))?;

        tracing::debug!("Run registry migrations complete");
        Ok(())
    }

    /// Number of records with the given status
    pub fn count_by_status(&self, status: RunStatus) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM runs WHERE status = ?1",
            params![status.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

impl RunRegistry for SqliteRunRegistry {
    fn create(&self, run_id: &RunId, input_ref: &str, trigger: Trigger) -> Result<JobRecord> {
        // Stored timestamps carry microseconds; keep the returned record identical
        let now = Utc::now().trunc_subsecs(6);
        let record = JobRecord::new(run_id.clone(), input_ref.to_string(), trigger, now);
        let conn = self.conn.lock();

        let inserted = conn
            .execute(
                r#"
                INSERT INTO runs (run_id, status, input_ref, trigger_source, started_at, last_heartbeat, retry_count)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)
                ON CONFLICT(run_id) DO NOTHING
                "#,
                params![
                    record.run_id.as_str(),
                    record.status.as_str(),
                    record.input_ref,
                    record.trigger.as_str(),
                    encode_timestamp(&record.started_at),
                    encode_timestamp(&record.last_heartbeat),
                ],
            )
            .map_err(|e| Error::storage(format!("Failed to create run {}: {}", run_id, e)))?;

        if inserted == 0 {
            return Err(Error::DuplicateRunId(run_id.to_string()));
        }
        Ok(record)
    }

    fn get(&self, run_id: &RunId) -> Result<JobRecord> {
        let conn = self.conn.lock();

        let row = conn
            .query_row(
                &format!("SELECT {} FROM runs WHERE run_id = ?1", COLUMNS),
                params![run_id.as_str()],
                RunRow::from_row,
            )
            .optional()
            .map_err(|e| Error::storage(format!("Failed to get run {}: {}", run_id, e)))?;

        match row {
            Some(row) => row.decode(),
            None => Err(Error::NotFound(run_id.to_string())),
        }
    }

    fn update_if_status(
        &self,
        run_id: &RunId,
        expected: RunStatus,
        patch: &RecordPatch,
    ) -> Result<bool> {
        patch.check_transition(expected)?;

        let mut sets: Vec<&str> = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        if let Some(status) = patch.status {
            sets.push("status = ?");
            values.push(Value::Text(status.as_str().to_string()));
        }
        if let Some(at) = &patch.last_heartbeat {
            sets.push("last_heartbeat = ?");
            values.push(Value::Text(encode_timestamp(at)));
        }
        if patch.increment_retry {
            sets.push("retry_count = retry_count + 1");
        }
        if let Some(result) = &patch.result {
            sets.push("result = ?");
            values.push(Value::Text(encode_json(result)?));
        }
        if let Some(confidence) = patch.confidence {
            sets.push("confidence = ?");
            values.push(Value::Real(confidence));
        }
        if let Some(error) = &patch.error {
            sets.push("error = ?");
            values.push(Value::Text(encode_json(error)?));
        }
        if let Some(at) = &patch.ended_at {
            sets.push("ended_at = ?");
            values.push(Value::Text(encode_timestamp(at)));
        }
        if let Some(upload) = &patch.upload {
            sets.push("upload = ?");
            values.push(Value::Text(encode_json(upload)?));
        }

        let conn = self.conn.lock();

        if sets.is_empty() {
            let current: Option<String> = conn
                .query_row(
                    "SELECT status FROM runs WHERE run_id = ?1",
                    params![run_id.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            return Ok(current.as_deref() == Some(expected.as_str()));
        }

        values.push(Value::Text(run_id.to_string()));
        values.push(Value::Text(expected.as_str().to_string()));

        let sql = format!(
            "UPDATE runs SET {} WHERE run_id = ? AND status = ?",
            sets.join(", ")
        );
        let changed = conn
            .execute(&sql, params_from_iter(values))
            .map_err(|e| Error::storage(format!("Failed to update run {}: {}", run_id, e)))?;

        Ok(changed == 1)
    }

    fn touch_heartbeat(&self, run_id: &RunId, at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock();

        let changed = conn
            .execute(
                "UPDATE runs SET last_heartbeat = MAX(last_heartbeat, ?1) WHERE run_id = ?2",
                params![encode_timestamp(&at), run_id.as_str()],
            )
            .map_err(|e| Error::storage(format!("Failed to write heartbeat for {}: {}", run_id, e)))?;

        if changed == 0 {
            return Err(Error::NotFound(run_id.to_string()));
        }
        Ok(())
    }

    fn scan_page(
        &self,
        filter: &ScanFilter,
        after: Option<&RunId>,
        limit: usize,
    ) -> Result<Vec<JobRecord>> {
        let mut clauses: Vec<&str> = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        if let Some(status) = filter.status {
            clauses.push("status = ?");
            values.push(Value::Text(status.as_str().to_string()));
        }
        if let Some(cutoff) = &filter.heartbeat_before {
            clauses.push("last_heartbeat < ?");
            values.push(Value::Text(encode_timestamp(cutoff)));
        }
        if let Some(after) = after {
            clauses.push("run_id > ?");
            values.push(Value::Text(after.to_string()));
        }
        values.push(Value::Integer(limit as i64));

        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let sql = format!(
            "SELECT {} FROM runs {} ORDER BY run_id LIMIT ?",
            COLUMNS, where_clause
        );

        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| Error::storage(format!("Failed to prepare scan: {}", e)))?;

        let rows = stmt
            .query_map(params_from_iter(values), RunRow::from_row)
            .map_err(|e| Error::storage(format!("Failed to scan runs: {}", e)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter().map(RunRow::decode).collect()
    }
}

/// Raw column values, decoded outside the rusqlite row callback
struct RunRow {
    run_id: String,
    status: String,
    input_ref: String,
    trigger: String,
    started_at: String,
    last_heartbeat: String,
    retry_count: i64,
    result: Option<String>,
    confidence: Option<f64>,
    error: Option<String>,
    ended_at: Option<String>,
    upload: Option<String>,
}

impl RunRow {
    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            run_id: row.get(0)?,
            status: row.get(1)?,
            input_ref: row.get(2)?,
            trigger: row.get(3)?,
            started_at: row.get(4)?,
            last_heartbeat: row.get(5)?,
            retry_count: row.get(6)?,
            result: row.get(7)?,
            confidence: row.get(8)?,
            error: row.get(9)?,
            ended_at: row.get(10)?,
            upload: row.get(11)?,
        })
    }

    fn decode(self) -> Result<JobRecord> {
        let status = RunStatus::parse(&self.status).ok_or_else(|| {
            Error::storage(format!("Unknown status '{}' for run {}", self.status, self.run_id))
        })?;

        Ok(JobRecord {
            status,
            input_ref: self.input_ref,
            trigger: Trigger::parse(&self.trigger),
            started_at: decode_timestamp(&self.started_at)?,
            last_heartbeat: decode_timestamp(&self.last_heartbeat)?,
            retry_count: self.retry_count.max(0) as u32,
            result: decode_opt_json(self.result)?,
            confidence: self.confidence,
            error: decode_opt_json(self.error)?,
            ended_at: decode_opt_timestamp(self.ended_at)?,
            upload: decode_opt_json(self.upload)?,
            run_id: RunId::from(self.run_id),
        })
    }
}
