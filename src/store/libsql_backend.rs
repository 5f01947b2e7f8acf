//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. All job transitions are
//! single `UPDATE ... WHERE status = ...` statements; the affected-row count
//! is the compare-and-swap result.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::autoscale::model::{AutoscaleDecision, AutoscaleState, GuardrailState};
use crate::error::DatabaseError;
use crate::jobs::model::{Job, JobOutcomeCounts, JobStatus, NewJob};
use crate::store::migrations;
use crate::store::traits::Database;

/// Appended to `last_error` when a stale lease is released.
pub const STALE_LOCK_MESSAGE: &str = "Released stale RUNNING lock";

/// Key of the single global autoscale state row.
const AUTOSCALE_STATE_ID: &str = "global";

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn get_job_by_dedupe_key(&self, key: &str) -> Result<Option<Job>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE dedupe_key = ?1"),
                params![key],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_job_by_dedupe_key: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_job(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_job_by_dedupe_key: {e}"))),
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

fn to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn from_ms(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn to_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

/// Convert `Option<i64>` to libsql Value.
fn opt_integer(v: Option<i64>) -> libsql::Value {
    match v {
        Some(v) => libsql::Value::Integer(v),
        None => libsql::Value::Null,
    }
}

/// Read the first column of the first row as an integer.
async fn scalar_i64(mut rows: libsql::Rows, context: &str) -> Result<i64, DatabaseError> {
    match rows.next().await {
        Ok(Some(row)) => row
            .get::<i64>(0)
            .map_err(|e| DatabaseError::Query(format!("{context}: {e}"))),
        Ok(None) => Ok(0),
        Err(e) => Err(DatabaseError::Query(format!("{context}: {e}"))),
    }
}

const JOB_COLUMNS: &str = "id, workspace_id, subject_id, kind, payload, status, attempts, max_attempts, run_at, locked_at, locked_by, started_at, finished_at, last_error, dedupe_key, created_at, updated_at";

const DECISION_COLUMNS: &str = "correlation_id, from_capacity, to_capacity, reason, global_target, guardrail_state, operator_override_active, decided_at";

/// Map a libsql Row to a Job. Column order matches JOB_COLUMNS.
fn row_to_job(row: &libsql::Row) -> Result<Job, DatabaseError> {
    let field = |e: libsql::Error| DatabaseError::Query(format!("job row parse: {e}"));

    let id_str: String = row.get(0).map_err(field)?;
    let id = id_str
        .parse::<Uuid>()
        .map_err(|e| DatabaseError::Serialization(format!("job id '{id_str}': {e}")))?;
    let payload_str: String = row.get(4).map_err(field)?;
    let payload = serde_json::from_str(&payload_str)
        .map_err(|e| DatabaseError::Serialization(format!("job {id} payload: {e}")))?;
    let status_str: String = row.get(5).map_err(field)?;
    let status: JobStatus = status_str.parse().map_err(DatabaseError::Serialization)?;

    Ok(Job {
        id,
        workspace_id: row.get(1).map_err(field)?,
        subject_id: row.get(2).map_err(field)?,
        kind: row.get(3).map_err(field)?,
        payload,
        status,
        attempts: row.get::<i64>(6).map_err(field)?.max(0) as u32,
        max_attempts: row.get::<i64>(7).map_err(field)?.max(0) as u32,
        run_at: from_ms(row.get(8).map_err(field)?),
        locked_at: row.get::<i64>(9).ok().map(from_ms),
        locked_by: row.get::<String>(10).ok(),
        started_at: row.get::<i64>(11).ok().map(from_ms),
        finished_at: row.get::<i64>(12).ok().map(from_ms),
        last_error: row.get::<String>(13).ok(),
        dedupe_key: row.get::<String>(14).ok(),
        created_at: from_ms(row.get(15).map_err(field)?),
        updated_at: from_ms(row.get(16).map_err(field)?),
    })
}

/// Map a libsql Row to an AutoscaleDecision. Column order matches DECISION_COLUMNS.
fn row_to_decision(row: &libsql::Row) -> Result<AutoscaleDecision, DatabaseError> {
    let field = |e: libsql::Error| DatabaseError::Query(format!("decision row parse: {e}"));

    let reason_str: String = row.get(3).map_err(field)?;
    let guardrails_str: String = row.get(5).map_err(field)?;
    let guardrail_state: GuardrailState = serde_json::from_str(&guardrails_str)
        .map_err(|e| DatabaseError::Serialization(format!("guardrail_state: {e}")))?;

    Ok(AutoscaleDecision {
        correlation_id: row.get(0).map_err(field)?,
        from_capacity: row.get::<i64>(1).map_err(field)?.max(0) as u64,
        to_capacity: row.get::<i64>(2).map_err(field)?.max(0) as u64,
        reason: reason_str.parse().map_err(DatabaseError::Serialization)?,
        global_target: row.get::<i64>(4).map_err(field)?.max(0) as u64,
        guardrail_state,
        operator_override_active: row.get::<i64>(6).map_err(field)? != 0,
        timestamp: from_ms(row.get(7).map_err(field)?),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Jobs ────────────────────────────────────────────────────────

    async fn enqueue_job(&self, job: &NewJob, now: DateTime<Utc>) -> Result<Job, DatabaseError> {
        let id = Uuid::new_v4();
        let payload = serde_json::to_string(&job.payload)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let run_at = job.run_at.unwrap_or(now);

        let inserted = self
            .conn()
            .execute(
                "INSERT INTO jobs (id, workspace_id, subject_id, kind, payload, status, attempts,
                    max_attempts, run_at, dedupe_key, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'pending', 0, ?6, ?7, ?8, ?9, ?9)
                 ON CONFLICT(dedupe_key) DO NOTHING",
                params![
                    id.to_string(),
                    job.workspace_id.clone(),
                    job.subject_id.clone(),
                    job.kind.clone(),
                    payload,
                    i64::from(job.max_attempts.max(1)),
                    to_ms(run_at),
                    opt_text(job.dedupe_key.as_deref()),
                    to_ms(now),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("enqueue_job: {e}")))?;

        if inserted == 0 {
            if let Some(key) = job.dedupe_key.as_deref()
                && let Some(existing) = self.get_job_by_dedupe_key(key).await?
            {
                debug!(job_id = %existing.id, dedupe_key = key, "Enqueue deduplicated");
                return Ok(existing);
            }
            return Err(DatabaseError::Query(format!(
                "enqueue_job: insert of {id} affected no rows"
            )));
        }

        debug!(job_id = %id, kind = %job.kind, workspace_id = %job.workspace_id, "Job enqueued");
        self.get_job(id).await?.ok_or_else(|| DatabaseError::NotFound {
            entity: "job".to_string(),
            id: id.to_string(),
        })
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_job: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_job(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_job: {e}"))),
        }
    }

    async fn find_due_jobs(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Job>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM jobs
                     WHERE status = 'pending' AND run_at <= ?1
                     ORDER BY run_at ASC, created_at ASC
                     LIMIT ?2"
                ),
                params![to_ms(now), i64::from(limit)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_due_jobs: {e}")))?;

        let mut jobs = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("find_due_jobs: {e}")))?
        {
            match row_to_job(&row) {
                Ok(job) => jobs.push(job),
                Err(e) => tracing::warn!("Skipping unreadable job row: {e}"),
            }
        }
        Ok(jobs)
    }

    async fn claim_if_pending(
        &self,
        id: Uuid,
        invocation_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE jobs
                 SET status = 'running', locked_at = ?3, locked_by = ?2, started_at = ?3,
                     finished_at = NULL, attempts = attempts + 1, updated_at = ?3
                 WHERE id = ?1 AND status = 'pending' AND run_at <= ?3",
                params![id.to_string(), invocation_id, to_ms(now)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("claim_if_pending: {e}")))?;
        Ok(count == 1)
    }

    async fn release_stale_locks(
        &self,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
        max_error_chars: usize,
    ) -> Result<u64, DatabaseError> {
        // substr with a negative start keeps the tail, so the newest note survives.
        let count = self
            .conn()
            .execute(
                "UPDATE jobs
                 SET status = 'pending', locked_at = NULL, locked_by = NULL, run_at = ?2,
                     updated_at = ?2,
                     last_error = substr(
                         CASE
                             WHEN last_error IS NULL OR last_error = '' THEN ?3
                             ELSE last_error || char(10) || ?3
                         END,
                         -?4
                     )
                 WHERE status = 'running' AND locked_at < ?1",
                params![
                    to_ms(stale_before),
                    to_ms(now),
                    STALE_LOCK_MESSAGE,
                    i64::try_from(max_error_chars.max(1)).unwrap_or(i64::MAX),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("release_stale_locks: {e}")))?;

        if count > 0 {
            info!(count, "Released stale job leases");
        }
        Ok(count)
    }

    async fn mark_succeeded(
        &self,
        id: Uuid,
        invocation_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE jobs
                 SET status = 'succeeded', finished_at = ?3, locked_at = NULL, locked_by = NULL,
                     last_error = NULL, updated_at = ?3
                 WHERE id = ?1 AND status = 'running' AND locked_by = ?2",
                params![id.to_string(), invocation_id, to_ms(now)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_succeeded: {e}")))?;
        Ok(count == 1)
    }

    async fn mark_retried(
        &self,
        id: Uuid,
        invocation_id: &str,
        next_run_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE jobs
                 SET status = 'pending', run_at = ?3, locked_at = NULL, locked_by = NULL,
                     last_error = ?4, finished_at = ?5, updated_at = ?5
                 WHERE id = ?1 AND status = 'running' AND locked_by = ?2",
                params![
                    id.to_string(),
                    invocation_id,
                    to_ms(next_run_at),
                    error,
                    to_ms(now)
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_retried: {e}")))?;
        Ok(count == 1)
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        invocation_id: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE jobs
                 SET status = 'failed', locked_at = NULL, locked_by = NULL,
                     last_error = ?3, finished_at = ?4, updated_at = ?4
                 WHERE id = ?1 AND status = 'running' AND locked_by = ?2",
                params![id.to_string(), invocation_id, error, to_ms(now)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_failed: {e}")))?;
        Ok(count == 1)
    }

    async fn count_due_pending(&self, now: DateTime<Utc>) -> Result<u64, DatabaseError> {
        let rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM jobs WHERE status = 'pending' AND run_at <= ?1",
                params![to_ms(now)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("count_due_pending: {e}")))?;
        Ok(scalar_i64(rows, "count_due_pending").await?.max(0) as u64)
    }

    async fn count_running_jobs(&self) -> Result<u64, DatabaseError> {
        let rows = self
            .conn()
            .query("SELECT COUNT(*) FROM jobs WHERE status = 'running'", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("count_running_jobs: {e}")))?;
        Ok(scalar_i64(rows, "count_running_jobs").await?.max(0) as u64)
    }

    async fn count_active_workspaces(&self, since: DateTime<Utc>) -> Result<i64, DatabaseError> {
        let rows = self
            .conn()
            .query(
                "SELECT COUNT(DISTINCT workspace_id) FROM jobs
                 WHERE status IN ('pending', 'running') OR finished_at >= ?1",
                params![to_ms(since)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("count_active_workspaces: {e}")))?;
        scalar_i64(rows, "count_active_workspaces").await
    }

    async fn job_outcomes_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<JobOutcomeCounts, DatabaseError> {
        // A job row only remembers its latest attempt, so this counts the
        // latest outcome of each job that finished in the window.
        let mut rows = self
            .conn()
            .query(
                "SELECT
                    COALESCE(SUM(CASE WHEN status = 'succeeded' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN status = 'pending' AND last_error IS NOT NULL THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0)
                 FROM jobs WHERE finished_at >= ?1",
                params![to_ms(since)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("job_outcomes_since: {e}")))?;

        let field = |e: libsql::Error| DatabaseError::Query(format!("job_outcomes_since: {e}"));
        match rows.next().await.map_err(field)? {
            Some(row) => Ok(JobOutcomeCounts {
                succeeded: row.get::<i64>(0).map_err(field)?.max(0) as u64,
                retried: row.get::<i64>(1).map_err(field)?.max(0) as u64,
                failed: row.get::<i64>(2).map_err(field)?.max(0) as u64,
            }),
            None => Ok(JobOutcomeCounts::default()),
        }
    }

    // ── Autoscale ───────────────────────────────────────────────────

    async fn load_autoscale_state(&self) -> Result<Option<AutoscaleState>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT current_capacity, last_scale_at FROM autoscale_state WHERE id = ?1",
                params![AUTOSCALE_STATE_ID],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("load_autoscale_state: {e}")))?;

        let field = |e: libsql::Error| DatabaseError::Query(format!("load_autoscale_state: {e}"));
        match rows.next().await.map_err(field)? {
            Some(row) => Ok(Some(AutoscaleState {
                current_capacity: row.get::<i64>(0).map_err(field)?.max(1) as u64,
                last_scale_at_ms: row.get::<i64>(1).ok(),
            })),
            None => Ok(None),
        }
    }

    async fn save_autoscale_state(
        &self,
        state: &AutoscaleState,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO autoscale_state (id, current_capacity, last_scale_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET
                     current_capacity = excluded.current_capacity,
                     last_scale_at = excluded.last_scale_at,
                     updated_at = excluded.updated_at",
                params![
                    AUTOSCALE_STATE_ID,
                    to_i64(state.current_capacity),
                    opt_integer(state.last_scale_at_ms),
                    to_ms(now),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("save_autoscale_state: {e}")))?;
        Ok(())
    }

    async fn record_autoscale_decision(
        &self,
        decision: &AutoscaleDecision,
    ) -> Result<(), DatabaseError> {
        let guardrails = serde_json::to_string(&decision.guardrail_state)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        self.conn()
            .execute(
                &format!(
                    "INSERT INTO autoscale_decisions ({DECISION_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
                ),
                params![
                    decision.correlation_id.clone(),
                    to_i64(decision.from_capacity),
                    to_i64(decision.to_capacity),
                    decision.reason.as_str(),
                    to_i64(decision.global_target),
                    guardrails,
                    decision.operator_override_active as i64,
                    to_ms(decision.timestamp),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_autoscale_decision: {e}")))?;
        Ok(())
    }

    async fn list_autoscale_decisions(
        &self,
        limit: u32,
    ) -> Result<Vec<AutoscaleDecision>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {DECISION_COLUMNS} FROM autoscale_decisions ORDER BY id DESC LIMIT ?1"
                ),
                params![i64::from(limit)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_autoscale_decisions: {e}")))?;

        let mut decisions = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_autoscale_decisions: {e}")))?
        {
            decisions.push(row_to_decision(&row)?);
        }
        Ok(decisions)
    }
}

// ── Tests ───────────────────────────────────────────────────────────
