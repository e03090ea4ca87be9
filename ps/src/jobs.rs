//! Durable job mirror
//!
//! Job records and their log lines are written to the database of the plan
//! they belong to. Jobs created before a plan id is known live in the
//! registry database until `attach_job` moves them. `job_index` in the
//! registry records where each job currently lives.

use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};
use crate::now_ms;
use crate::store::{PlanStore, json_column, json_column_opt};

const REDACTED: &str = "[REDACTED]";
const SENSITIVE_KEYS: &[&str] = &["api_key", "apikey", "token", "secret", "cookie", "password", "authorization"];

/// Persisted job row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    pub plan_id: Option<i64>,
    pub task_id: Option<i64>,
    pub mode: String,
    pub status: String,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub error: Option<String>,
    pub result: Option<Value>,
    pub stats: Map<String, Value>,
    pub params: Map<String, Value>,
    pub metadata: Map<String, Value>,
}

/// Persisted job log line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobLogRecord {
    pub seq: i64,
    pub timestamp: i64,
    pub level: String,
    pub message: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// Persisted action log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionLogRecord {
    pub seq: i64,
    pub action: String,
    pub payload: Value,
    pub created_at: i64,
}

fn is_sensitive(key: &str) -> bool {
    let normalized = key.to_lowercase().replace('-', "_");
    SENSITIVE_KEYS
        .iter()
        .any(|k| normalized == *k || normalized.ends_with(&format!("_{}", k)))
}

/// Replace values under sensitive keys, at any depth
pub fn redact_sensitive(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    let v = if is_sensitive(k) {
                        Value::String(REDACTED.to_string())
                    } else {
                        redact_sensitive(v)
                    };
                    (k.clone(), v)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact_sensitive).collect()),
        other => other.clone(),
    }
}

const JOB_COLUMNS: &str =
    "job_id, plan_id, task_id, mode, status, created_at, started_at, finished_at, error, result, stats, params, metadata";

fn parse_job_row(row: &Row<'_>) -> rusqlite::Result<JobRecord> {
    Ok(JobRecord {
        job_id: row.get(0)?,
        plan_id: row.get(1)?,
        task_id: row.get(2)?,
        mode: row.get(3)?,
        status: row.get(4)?,
        created_at: row.get(5)?,
        started_at: row.get(6)?,
        finished_at: row.get(7)?,
        error: row.get(8)?,
        result: json_column_opt(row, 9)?,
        stats: json_column(row, 10)?,
        params: json_column(row, 11)?,
        metadata: json_column(row, 12)?,
    })
}

fn write_job(conn: &Connection, job: &JobRecord) -> StoreResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO decomposition_jobs (job_id, plan_id, task_id, mode, status, created_at, started_at,
                                                    finished_at, error, result, stats, params, metadata)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            job.job_id,
            job.plan_id,
            job.task_id,
            job.mode,
            job.status,
            job.created_at,
            job.started_at,
            job.finished_at,
            job.error,
            job.result.as_ref().map(serde_json::to_string).transpose()?,
            serde_json::to_string(&job.stats)?,
            serde_json::to_string(&job.params)?,
            serde_json::to_string(&job.metadata)?,
        ],
    )?;
    Ok(())
}

fn write_log(conn: &Connection, job_id: &str, log: &JobLogRecord) -> StoreResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO decomposition_job_logs (job_id, seq, timestamp, level, message, metadata)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            job_id,
            log.seq,
            log.timestamp,
            log.level,
            log.message,
            serde_json::to_string(&log.metadata)?
        ],
    )?;
    Ok(())
}

fn read_job(conn: &Connection, job_id: &str) -> StoreResult<Option<JobRecord>> {
    let sql = format!("SELECT {} FROM decomposition_jobs WHERE job_id = ?1", JOB_COLUMNS);
    Ok(conn.query_row(&sql, params![job_id], parse_job_row).optional()?)
}

fn read_logs(conn: &Connection, job_id: &str) -> StoreResult<Vec<JobLogRecord>> {
    let mut stmt = conn.prepare(
        "SELECT seq, timestamp, level, message, metadata FROM decomposition_job_logs WHERE job_id = ?1 ORDER BY seq",
    )?;
    let logs = stmt
        .query_map(params![job_id], |row| {
            Ok(JobLogRecord {
                seq: row.get(0)?,
                timestamp: row.get(1)?,
                level: row.get(2)?,
                message: row.get(3)?,
                metadata: json_column(row, 4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(logs)
}

fn read_action_logs(conn: &Connection, job_id: &str) -> StoreResult<Vec<ActionLogRecord>> {
    let mut stmt =
        conn.prepare("SELECT seq, action, payload, created_at FROM action_logs WHERE job_id = ?1 ORDER BY seq")?;
    let rows = stmt
        .query_map(params![job_id], |row| {
            Ok(ActionLogRecord {
                seq: row.get(0)?,
                action: row.get(1)?,
                payload: json_column(row, 2)?,
                created_at: row.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

impl PlanStore {
    /// Where a job's mirror lives: `None` if unknown, `Some(None)` if unbound
    fn job_location(&self, job_id: &str) -> StoreResult<Option<Option<i64>>> {
        let conn = self.registry();
        Ok(conn
            .query_row(
                "SELECT plan_id FROM job_index WHERE job_id = ?1",
                params![job_id],
                |row| row.get::<_, Option<i64>>(0),
            )
            .optional()?)
    }

    fn with_job_db<T>(&self, plan_id: Option<i64>, f: impl FnOnce(&mut Connection) -> StoreResult<T>) -> StoreResult<T> {
        match plan_id {
            Some(pid) => self.with_plan(pid, f),
            None => {
                let mut conn = self.registry();
                f(&mut *conn)
            }
        }
    }

    fn located_job(&self, job_id: &str) -> StoreResult<Option<i64>> {
        self.job_location(job_id)?
            .ok_or_else(|| StoreError::NotFound(format!("Job {}", job_id)))
    }

    /// Register a new job; fails with `Duplicate` if the id is already indexed
    pub fn insert_job(&self, job: &JobRecord) -> StoreResult<()> {
        debug!(job_id = %job.job_id, plan_id = ?job.plan_id, "insert_job: called");
        {
            let conn = self.registry();
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO job_index (job_id, plan_id, created_at) VALUES (?1, ?2, ?3)",
                params![job.job_id, job.plan_id, job.created_at],
            )?;
            if inserted == 0 {
                return Err(StoreError::Duplicate(format!("Job {}", job.job_id)));
            }
        }
        let result = self.with_job_db(job.plan_id, |conn| write_job(conn, job));
        if result.is_err() {
            let conn = self.registry();
            conn.execute("DELETE FROM job_index WHERE job_id = ?1", params![job.job_id])?;
        }
        result
    }

    /// Overwrite the stored job row
    pub fn save_job(&self, job: &JobRecord) -> StoreResult<()> {
        debug!(job_id = %job.job_id, status = %job.status, "save_job: called");
        let plan_id = self.located_job(&job.job_id)?;
        self.with_job_db(plan_id, |conn| write_job(conn, job))
    }

    /// Persist one log line
    pub fn append_job_log(&self, job_id: &str, log: &JobLogRecord) -> StoreResult<()> {
        let plan_id = self.located_job(job_id)?;
        self.with_job_db(plan_id, |conn| write_log(conn, job_id, log))
    }

    /// Persist a batch of log lines in one transaction
    pub fn append_job_logs(&self, job_id: &str, logs: &[JobLogRecord]) -> StoreResult<()> {
        if logs.is_empty() {
            return Ok(());
        }
        let plan_id = self.located_job(job_id)?;
        self.with_job_db(plan_id, |conn| {
            let tx = conn.transaction()?;
            for log in logs {
                write_log(&tx, job_id, log)?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    /// Load a job and its full log history from wherever it lives
    pub fn load_job(&self, job_id: &str) -> StoreResult<Option<(JobRecord, Vec<JobLogRecord>)>> {
        debug!(%job_id, "load_job: called");
        let Some(plan_id) = self.job_location(job_id)? else {
            return Ok(None);
        };
        self.with_job_db(plan_id, |conn| {
            let Some(job) = read_job(conn, job_id)? else {
                return Ok(None);
            };
            let logs = read_logs(conn, job_id)?;
            Ok(Some((job, logs)))
        })
    }

    /// Move an unbound job's rows into a plan database
    ///
    /// Returns the log lines that were moved. Calling it for a job already
    /// bound to `plan_id` is a no-op; bound to another plan is `InvalidArgument`.
    pub fn attach_job(&self, job_id: &str, plan_id: i64) -> StoreResult<usize> {
        debug!(%job_id, plan_id, "attach_job: called");
        match self.located_job(job_id)? {
            Some(existing) if existing == plan_id => return Ok(0),
            Some(existing) => {
                return Err(StoreError::InvalidArgument(format!(
                    "job {} is already attached to plan {}",
                    job_id, existing
                )));
            }
            None => {}
        }

        let (mut job, logs, actions) = {
            let conn = self.registry();
            let job = read_job(&conn, job_id)?.ok_or_else(|| StoreError::NotFound(format!("Job {}", job_id)))?;
            (job, read_logs(&conn, job_id)?, read_action_logs(&conn, job_id)?)
        };

        job.plan_id = Some(plan_id);
        self.with_plan(plan_id, |conn| {
            let tx = conn.transaction()?;
            write_job(&tx, &job)?;
            for log in &logs {
                write_log(&tx, job_id, log)?;
            }
            for entry in &actions {
                tx.execute(
                    "INSERT OR REPLACE INTO action_logs (job_id, seq, action, payload, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        job_id,
                        entry.seq,
                        entry.action,
                        serde_json::to_string(&entry.payload)?,
                        entry.created_at
                    ],
                )?;
            }
            tx.commit()?;
            Ok(())
        })?;

        {
            let mut conn = self.registry();
            let tx = conn.transaction()?;
            tx.execute("UPDATE job_index SET plan_id = ?2 WHERE job_id = ?1", params![job_id, plan_id])?;
            tx.execute("DELETE FROM decomposition_job_logs WHERE job_id = ?1", params![job_id])?;
            tx.execute("DELETE FROM decomposition_jobs WHERE job_id = ?1", params![job_id])?;
            tx.execute("DELETE FROM action_logs WHERE job_id = ?1", params![job_id])?;
            tx.commit()?;
        }

        info!(%job_id, plan_id, moved_logs = logs.len(), "Attached job to plan");
        Ok(logs.len())
    }

    /// Append a redacted action log entry; returns its sequence number
    pub fn append_action_log(&self, job_id: &str, action: &str, payload: &Value) -> StoreResult<i64> {
        debug!(%job_id, %action, "append_action_log: called");
        let plan_id = self.located_job(job_id)?;
        let payload = redact_sensitive(payload);
        self.with_job_db(plan_id, |conn| {
            let tx = conn.transaction()?;
            let seq: i64 = tx.query_row(
                "SELECT COALESCE(MAX(seq), 0) + 1 FROM action_logs WHERE job_id = ?1",
                params![job_id],
                |row| row.get(0),
            )?;
            tx.execute(
                "INSERT INTO action_logs (job_id, seq, action, payload, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![job_id, seq, action, serde_json::to_string(&payload)?, now_ms()],
            )?;
            tx.commit()?;
            Ok(seq)
        })
    }

    /// Action log entries for a job, in sequence order
    pub fn list_action_logs(&self, job_id: &str) -> StoreResult<Vec<ActionLogRecord>> {
        let plan_id = self.located_job(job_id)?;
        self.with_job_db(plan_id, |conn| read_action_logs(conn, job_id))
    }
}
