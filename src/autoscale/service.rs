//! Autoscale service: drives the controller against the store.
//!
//! Each tick reloads the persisted state, samples the guardrails and the
//! active workspace count, evaluates, applies, and writes both the new state
//! and the decision back. Ticks in one process are serialized by the state
//! mutex.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::autoscale::controller;
use crate::autoscale::guardrails::GuardrailMonitor;
use crate::autoscale::model::{AutoscaleDecision, AutoscaleState};
use crate::config::AutoscaleConfig;
use crate::error::Result;
use crate::store::Database;

pub struct AutoscaleService {
    config: AutoscaleConfig,
    store: Arc<dyn Database>,
    guardrails: Arc<dyn GuardrailMonitor>,
    state: Mutex<AutoscaleState>,
}

impl AutoscaleService {
    /// Without a persisted state, capacity starts at the global floor.
    pub fn new(
        config: AutoscaleConfig,
        store: Arc<dyn Database>,
        guardrails: Arc<dyn GuardrailMonitor>,
    ) -> Self {
        let state = AutoscaleState::new(config.global_floor);
        Self {
            config,
            store,
            guardrails,
            state: Mutex::new(state),
        }
    }

    /// Capacity as of the last completed tick.
    pub async fn current_capacity(&self) -> u64 {
        self.state.lock().await.current_capacity
    }

    pub async fn state(&self) -> AutoscaleState {
        *self.state.lock().await
    }

    /// Run one tick at the current time.
    pub async fn evaluate_and_apply(&self, correlation_id: &str) -> Result<AutoscaleDecision> {
        self.evaluate_and_apply_at(correlation_id, Utc::now()).await
    }

    /// Run one tick as of `now`.
    ///
    /// On any error the in-memory state is left as loaded and nothing is
    /// written.
    pub async fn evaluate_and_apply_at(
        &self,
        correlation_id: &str,
        now: DateTime<Utc>,
    ) -> Result<AutoscaleDecision> {
        let mut state = self.state.lock().await;
        if let Some(persisted) = self.store.load_autoscale_state().await? {
            *state = persisted;
        }

        let guardrails = self.guardrails.current_state().await?;
        let since = now
            - chrono::Duration::from_std(self.config.activity_window)
                .unwrap_or_else(|_| chrono::Duration::hours(1));
        let active_workspaces = self.store.count_active_workspaces(since).await?;

        let decision = controller::evaluate(
            &self.config,
            guardrails,
            active_workspaces,
            &state,
            now,
            correlation_id,
        );

        let mut next = *state;
        controller::apply(&mut next, &decision, now);
        self.store.save_autoscale_state(&next, now).await?;
        self.store.record_autoscale_decision(&decision).await?;
        *state = next;

        if decision.changes_capacity() {
            tracing::info!(
                correlation_id,
                from = decision.from_capacity,
                to = decision.to_capacity,
                reason = %decision.reason,
                global_target = decision.global_target,
                active_workspaces,
                "Autoscale capacity changed"
            );
        } else {
            tracing::debug!(
                correlation_id,
                capacity = decision.to_capacity,
                reason = %decision.reason,
                global_target = decision.global_target,
                "Autoscale holding"
            );
        }

        Ok(decision)
    }
}

/// Spawn a background task that runs one autoscale tick every `interval`.
/// The first tick fires one full interval after spawning.
pub fn spawn_autoscale_ticker(
    service: Arc<AutoscaleService>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // Skip immediate first tick
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let correlation_id = Uuid::new_v4().to_string();
            if let Err(e) = service.evaluate_and_apply(&correlation_id).await {
                tracing::error!(correlation_id = %correlation_id, "Autoscale tick failed: {}", e);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::autoscale::guardrails::StaticGuardrails;
    use crate::autoscale::model::{GuardrailState, ReasonCode};
    use crate::error::Error;
    use crate::jobs::model::NewJob;
    use crate::store::LibSqlBackend;

    struct Unreachable;

    #[async_trait]
    impl GuardrailMonitor for Unreachable {
        async fn current_state(&self) -> Result<GuardrailState> {
            Err(Error::Guardrail("metrics source unreachable".into()))
        }
    }

    async fn setup(
        guardrails: Arc<dyn GuardrailMonitor>,
    ) -> (Arc<dyn Database>, AutoscaleService) {
        let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let service = AutoscaleService::new(
            AutoscaleConfig::default(),
            Arc::clone(&store),
            guardrails,
        );
        (store, service)
    }

    async fn activate_workspaces(store: &Arc<dyn Database>, count: usize) {
        for i in 0..count {
            store
                .enqueue_job(
                    &NewJob::new(format!("ws-{i}"), "s", "sync", serde_json::json!({})),
                    Utc::now(),
                )
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn first_tick_starts_at_floor_and_ramps() {
        let (store, service) = setup(Arc::new(StaticGuardrails::healthy())).await;
        activate_workspaces(&store, 17).await;
        assert_eq!(service.current_capacity().await, 1024);

        let now = Utc::now();
        let decision = service.evaluate_and_apply_at("tick-1", now).await.unwrap();
        assert_eq!(decision.reason, ReasonCode::RampStep);
        assert_eq!(decision.from_capacity, 1024);
        assert_eq!(decision.to_capacity, 1088);
        assert_eq!(service.current_capacity().await, 1088);

        let persisted = store.load_autoscale_state().await.unwrap().unwrap();
        assert_eq!(persisted.current_capacity, 1088);
        assert_eq!(persisted.last_scale_at_ms, Some(now.timestamp_millis()));

        let audit = store.list_autoscale_decisions(10).await.unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].correlation_id, "tick-1");
    }

    #[tokio::test]
    async fn held_tick_keeps_ramp_timer() {
        let (store, service) = setup(Arc::new(StaticGuardrails::healthy())).await;
        activate_workspaces(&store, 40).await;

        let t0 = Utc::now();
        service.evaluate_and_apply_at("a", t0).await.unwrap();
        let t1 = t0 + chrono::Duration::minutes(2);
        let held = service.evaluate_and_apply_at("b", t1).await.unwrap();
        assert_eq!(held.reason, ReasonCode::HoldRampWindow);
        assert_eq!(
            service.state().await.last_scale_at_ms,
            Some(t0.timestamp_millis())
        );

        let t2 = t0 + chrono::Duration::minutes(5);
        let ramped = service.evaluate_and_apply_at("c", t2).await.unwrap();
        assert_eq!(ramped.reason, ReasonCode::RampStep);
        assert_eq!(ramped.to_capacity, 1152);
        assert_eq!(store.list_autoscale_decisions(10).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn breach_steps_down_to_floor() {
        let guardrails = Arc::new(StaticGuardrails::healthy());
        let (store, service) = setup(guardrails.clone()).await;
        store
            .save_autoscale_state(&AutoscaleState::new(1408), Utc::now())
            .await
            .unwrap();

        guardrails.set_contention(true);
        let decision = service.evaluate_and_apply("breach").await.unwrap();
        assert_eq!(decision.reason, ReasonCode::GuardrailStepDown);
        assert_eq!(decision.to_capacity, 1024);
        assert!(decision.guardrail_state.contention_breached);
    }

    #[tokio::test]
    async fn reloads_state_written_elsewhere() {
        let (store, service) = setup(Arc::new(StaticGuardrails::healthy())).await;
        store
            .save_autoscale_state(&AutoscaleState::new(2000), Utc::now())
            .await
            .unwrap();

        let decision = service.evaluate_and_apply("reload").await.unwrap();
        assert_eq!(decision.from_capacity, 2000);
        assert_eq!(decision.reason, ReasonCode::HoldTargetReached);
        assert_eq!(service.current_capacity().await, 2000);
    }

    #[tokio::test]
    async fn monitor_error_writes_nothing() {
        let (store, service) = setup(Arc::new(Unreachable)).await;
        let err = service.evaluate_and_apply("broken").await.unwrap_err();
        assert!(matches!(err, Error::Guardrail(_)));
        assert!(store.load_autoscale_state().await.unwrap().is_none());
        assert!(store.list_autoscale_decisions(10).await.unwrap().is_empty());
        assert_eq!(service.current_capacity().await, 1024);
    }

    #[tokio::test]
    async fn ticker_waits_one_interval_before_first_tick() {
        let (store, service) = setup(Arc::new(StaticGuardrails::healthy())).await;
        let handle = spawn_autoscale_ticker(Arc::new(service), Duration::from_millis(300));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(store.list_autoscale_decisions(10).await.unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(500)).await;
        handle.abort();
        assert!(!store.list_autoscale_decisions(10).await.unwrap().is_empty());
    }
}
