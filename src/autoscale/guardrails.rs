//! Guardrail monitors sampled by the autoscale service on every tick.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;

use crate::autoscale::model::GuardrailState;
use crate::config::AutoscaleConfig;
use crate::error::Result;
use crate::store::Database;

/// Source of the current guardrail snapshot.
#[async_trait]
pub trait GuardrailMonitor: Send + Sync {
    async fn current_state(&self) -> Result<GuardrailState>;
}

/// Guardrails flipped by hand, e.g. from an operator endpoint or a test.
#[derive(Debug, Default)]
pub struct StaticGuardrails {
    contention: AtomicBool,
    failure_rate: AtomicBool,
}

impl StaticGuardrails {
    pub fn healthy() -> Self {
        Self::default()
    }

    pub fn set_contention(&self, breached: bool) {
        self.contention.store(breached, Ordering::Relaxed);
    }

    pub fn set_failure_rate(&self, breached: bool) {
        self.failure_rate.store(breached, Ordering::Relaxed);
    }
}

#[async_trait]
impl GuardrailMonitor for StaticGuardrails {
    async fn current_state(&self) -> Result<GuardrailState> {
        Ok(GuardrailState {
            contention_breached: self.contention.load(Ordering::Relaxed),
            failure_rate_breached: self.failure_rate.load(Ordering::Relaxed),
        })
    }
}

/// Guardrails derived from the job queue itself.
///
/// - failure rate: share of retried or failed outcomes inside the activity
///   window, once at least `failure_rate_min_samples` outcomes exist.
/// - contention: running jobs at or above `contention_running_limit`, when set.
pub struct JobStoreGuardrails {
    store: Arc<dyn Database>,
    config: AutoscaleConfig,
}

impl JobStoreGuardrails {
    pub fn new(store: Arc<dyn Database>, config: AutoscaleConfig) -> Self {
        Self { store, config }
    }
}

#[async_trait]
impl GuardrailMonitor for JobStoreGuardrails {
    async fn current_state(&self) -> Result<GuardrailState> {
        let since = Utc::now()
            - chrono::Duration::from_std(self.config.activity_window)
                .unwrap_or_else(|_| chrono::Duration::hours(1));
        let outcomes = self.store.job_outcomes_since(since).await?;
        let failure_rate_breached = outcomes.total() >= self.config.failure_rate_min_samples
            && outcomes.failure_rate() >= self.config.failure_rate_threshold;

        let contention_breached = match self.config.contention_running_limit {
            Some(limit) => self.store.count_running_jobs().await? >= limit,
            None => false,
        };

        if failure_rate_breached || contention_breached {
            tracing::warn!(
                failure_rate = outcomes.failure_rate(),
                samples = outcomes.total(),
                failure_rate_breached,
                contention_breached,
                "Autoscale guardrail breached"
            );
        }

        Ok(GuardrailState {
            contention_breached,
            failure_rate_breached,
        })
    }
}
