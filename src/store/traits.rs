//! Unified `Database` trait: single async interface for all persistence.
//!
//! Every time-dependent operation takes `now` explicitly so callers decide
//! the clock, and every state transition on a job is a single conditional
//! `UPDATE`. A write that matches zero rows reports `false` rather than an
//! error: for a claim that means another runner won the race.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::autoscale::model::{AutoscaleDecision, AutoscaleState};
use crate::error::DatabaseError;
use crate::jobs::model::{Job, JobOutcomeCounts, NewJob};

/// Backend-agnostic database trait covering the job queue and autoscaling.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Jobs ────────────────────────────────────────────────────────

    /// Insert a new pending job. If `dedupe_key` is already taken, the
    /// existing job is returned unchanged.
    async fn enqueue_job(&self, job: &NewJob, now: DateTime<Utc>) -> Result<Job, DatabaseError>;

    /// Get a job by ID.
    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, DatabaseError>;

    /// Pending jobs with `run_at <= now`, oldest `run_at` first, up to `limit`.
    async fn find_due_jobs(&self, now: DateTime<Utc>, limit: u32)
    -> Result<Vec<Job>, DatabaseError>;

    /// Atomically move a pending, due job to running under `invocation_id`'s
    /// lease and increment `attempts`. Returns `false` if the job was no
    /// longer pending.
    async fn claim_if_pending(
        &self,
        id: Uuid,
        invocation_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Release every running job whose lease is older than `stale_before`
    /// back to pending, due at `now`. `attempts` is left as is.
    /// The release note is appended to `last_error`, which then keeps only
    /// its last `max_error_chars` characters.
    /// Returns the number of jobs released.
    async fn release_stale_locks(
        &self,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
        max_error_chars: usize,
    ) -> Result<u64, DatabaseError>;

    /// Mark a job held by `invocation_id` as succeeded.
    async fn mark_succeeded(
        &self,
        id: Uuid,
        invocation_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Return a job held by `invocation_id` to pending, due at `next_run_at`.
    async fn mark_retried(
        &self,
        id: Uuid,
        invocation_id: &str,
        next_run_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Mark a job held by `invocation_id` as failed.
    async fn mark_failed(
        &self,
        id: Uuid,
        invocation_id: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Number of pending jobs with `run_at <= now`.
    async fn count_due_pending(&self, now: DateTime<Utc>) -> Result<u64, DatabaseError>;

    /// Number of jobs currently running.
    async fn count_running_jobs(&self) -> Result<u64, DatabaseError>;

    /// Distinct workspaces with queued or running work, or with a job that
    /// finished at or after `since`.
    async fn count_active_workspaces(&self, since: DateTime<Utc>) -> Result<i64, DatabaseError>;

    /// Outcomes of attempts that finished at or after `since`.
    async fn job_outcomes_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<JobOutcomeCounts, DatabaseError>;

    // ── Autoscale ───────────────────────────────────────────────────

    /// Load the persisted controller state, if any.
    async fn load_autoscale_state(&self) -> Result<Option<AutoscaleState>, DatabaseError>;

    /// Persist the controller state.
    async fn save_autoscale_state(
        &self,
        state: &AutoscaleState,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// Append an applied decision to the audit log.
    async fn record_autoscale_decision(
        &self,
        decision: &AutoscaleDecision,
    ) -> Result<(), DatabaseError>;

    /// Most recent decisions first, up to `limit`.
    async fn list_autoscale_decisions(
        &self,
        limit: u32,
    ) -> Result<Vec<AutoscaleDecision>, DatabaseError>;
}
