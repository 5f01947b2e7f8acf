//! Job runner.
//!
//! One invocation recovers stale leases, selects a batch of due jobs and
//! works through it one job at a time until the batch is empty or the claim
//! cutoff (`deadline - safety_margin`) passes. Parallelism comes from running
//! several invocations; the conditional claim keeps them from double-running
//! a job.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::config::JobRunnerConfig;
use crate::error::DatabaseError;
use crate::jobs::backoff;
use crate::jobs::handler::HandlerRegistry;
use crate::jobs::model::Job;
use crate::store::Database;

/// Identity and deadline of one runner invocation.
#[derive(Debug, Clone)]
pub struct ProcessOptions {
    /// Lease holder id written to `locked_by`.
    pub invocation_id: String,
    /// Hard end of the invocation. Claiming stops `safety_margin` before it.
    pub deadline: DateTime<Utc>,
}

impl ProcessOptions {
    pub fn new(invocation_id: impl Into<String>, deadline: DateTime<Utc>) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            deadline,
        }
    }

    /// Fresh invocation id with a deadline `budget` from now.
    pub fn with_budget(budget: Duration) -> Self {
        Self::new(Uuid::new_v4().to_string(), add_std(Utc::now(), budget))
    }
}

/// Counters reported by one invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Stale leases returned to pending before selection.
    pub released_stale: u64,
    /// Jobs claimed and handed to a handler.
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub retried: u64,
    /// Selected jobs another invocation claimed first.
    pub skipped: u64,
    /// Due pending jobs left when the invocation finished.
    pub remaining: u64,
}

/// Committed result of one claimed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Succeeded,
    Retried,
    Failed,
}

/// Claims due jobs and runs them through the handler registry.
pub struct JobRunner {
    config: JobRunnerConfig,
    store: Arc<dyn Database>,
    handlers: Arc<HandlerRegistry>,
}

impl JobRunner {
    pub fn new(
        config: JobRunnerConfig,
        store: Arc<dyn Database>,
        handlers: Arc<HandlerRegistry>,
    ) -> Self {
        Self {
            config,
            store,
            handlers,
        }
    }

    pub fn config(&self) -> &JobRunnerConfig {
        &self.config
    }

    /// Options for a new invocation using the configured time budget.
    pub fn invocation(&self) -> ProcessOptions {
        ProcessOptions::with_budget(self.config.time_budget)
    }

    /// Run one invocation.
    ///
    /// Store errors during lease recovery, selection or the final count are
    /// returned. Errors while working on a single job are logged and the
    /// loop moves on to the next one.
    pub async fn process_due_jobs(
        &self,
        options: &ProcessOptions,
    ) -> Result<RunSummary, DatabaseError> {
        let mut summary = RunSummary::default();
        let invocation = options.invocation_id.as_str();

        let now = Utc::now();
        let stale_before = sub_std(now, self.config.stale_lock_threshold);
        summary.released_stale = self
            .store
            .release_stale_locks(stale_before, now, self.config.max_error_chars)
            .await?;

        let due = self
            .store
            .find_due_jobs(now, self.config.batch_limit)
            .await?;
        let cutoff = sub_std(options.deadline, self.config.safety_margin);

        tracing::debug!(
            invocation_id = invocation,
            selected = due.len(),
            released_stale = summary.released_stale,
            "Runner invocation started"
        );

        for job in due {
            let now = Utc::now();
            if now >= cutoff {
                tracing::info!(
                    invocation_id = invocation,
                    processed = summary.processed,
                    "Deadline reached, leaving remaining jobs for the next invocation"
                );
                break;
            }

            match self.store.claim_if_pending(job.id, invocation, now).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!(job_id = %job.id, "Job already claimed, skipping");
                    summary.skipped += 1;
                    continue;
                }
                Err(e) => {
                    tracing::warn!(job_id = %job.id, "Failed to claim job: {}", e);
                    continue;
                }
            }

            summary.processed += 1;
            match self.run_claimed(job.id, invocation).await {
                Some(Outcome::Succeeded) => summary.succeeded += 1,
                Some(Outcome::Retried) => summary.retried += 1,
                Some(Outcome::Failed) => summary.failed += 1,
                None => {}
            }
        }

        summary.remaining = self.store.count_due_pending(Utc::now()).await?;

        tracing::info!(
            invocation_id = invocation,
            released_stale = summary.released_stale,
            processed = summary.processed,
            succeeded = summary.succeeded,
            retried = summary.retried,
            failed = summary.failed,
            skipped = summary.skipped,
            remaining = summary.remaining,
            "Runner invocation finished"
        );
        Ok(summary)
    }

    /// Execute a job this invocation holds the lease on and commit the result.
    /// Returns `None` when nothing was committed.
    async fn run_claimed(&self, id: Uuid, invocation: &str) -> Option<Outcome> {
        // Re-read so the handler sees the post-claim row (attempts, lease).
        let job = match self.store.get_job(id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                tracing::warn!(job_id = %id, "Claimed job disappeared");
                return None;
            }
            Err(e) => {
                tracing::warn!(job_id = %id, "Failed to load claimed job: {}", e);
                return None;
            }
        };

        let result = self.handlers.dispatch(&job).await;
        let now = Utc::now();

        let (outcome, write) = match result {
            Ok(()) => (
                Outcome::Succeeded,
                self.store.mark_succeeded(job.id, invocation, now).await,
            ),
            Err(err) => {
                let message = truncate_error(&err.to_string(), self.config.max_error_chars);
                self.record_failure(&job, invocation, &message, now).await
            }
        };

        match write {
            Ok(true) => Some(outcome),
            Ok(false) => {
                tracing::warn!(
                    job_id = %job.id,
                    invocation_id = invocation,
                    "Lease lost before completion, result discarded"
                );
                None
            }
            Err(e) => {
                tracing::warn!(job_id = %job.id, "Failed to record job result: {}", e);
                None
            }
        }
    }

    async fn record_failure(
        &self,
        job: &Job,
        invocation: &str,
        message: &str,
        now: DateTime<Utc>,
    ) -> (Outcome, Result<bool, DatabaseError>) {
        if job.can_retry() {
            let delay = backoff::retry_delay(job.attempts, self.config.backoff_cap);
            let next_run_at = add_std(now, delay);
            tracing::warn!(
                job_id = %job.id,
                kind = %job.kind,
                attempts = job.attempts,
                max_attempts = job.max_attempts,
                retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = message,
                "Job failed, scheduling retry"
            );
            let write = self
                .store
                .mark_retried(job.id, invocation, next_run_at, message, now)
                .await;
            (Outcome::Retried, write)
        } else {
            tracing::error!(
                job_id = %job.id,
                kind = %job.kind,
                attempts = job.attempts,
                error = message,
                "Job failed permanently"
            );
            let write = self
                .store
                .mark_failed(job.id, invocation, message, now)
                .await;
            (Outcome::Failed, write)
        }
    }
}

/// Spawn a background task that starts a runner invocation every `interval`.
pub fn spawn_runner_ticker(
    runner: Arc<JobRunner>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // Skip immediate first tick
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let options = runner.invocation();
            if let Err(e) = runner.process_due_jobs(&options).await {
                tracing::error!(
                    invocation_id = %options.invocation_id,
                    "Runner invocation failed: {}",
                    e
                );
            }
        }
    })
}

/// Keep at most `max_chars` characters of `s`.
fn truncate_error(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((end, _)) => s[..end].to_string(),
        None => s.to_string(),
    }
}

fn add_std(t: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| t.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn sub_std(t: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| t.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
