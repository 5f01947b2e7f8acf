//! Integration tests for the autoscale service fed by the job queue.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};

use deferred_core::autoscale::{
    AutoscaleService, GuardrailMonitor, JobStoreGuardrails, ReasonCode, StaticGuardrails,
};
use deferred_core::config::{AutoscaleConfig, JobRunnerConfig};
use deferred_core::error::HandlerError;
use deferred_core::jobs::{HandlerRegistry, Job, JobHandler, JobRunner, NewJob};
use deferred_core::store::{Database, LibSqlBackend};

struct AlwaysFails;

#[async_trait]
impl JobHandler for AlwaysFails {
    fn kind(&self) -> &str {
        "enrich_contact"
    }

    async fn execute(&self, _job: &Job) -> Result<(), HandlerError> {
        Err(HandlerError::failed("enrichment provider rejected request"))
    }
}

async fn memory_store() -> Arc<dyn Database> {
    Arc::new(LibSqlBackend::new_memory().await.unwrap())
}

async fn enqueue_for_workspaces(store: &Arc<dyn Database>, workspaces: usize, kind: &str) {
    for i in 0..workspaces {
        store
            .enqueue_job(
                &NewJob::new(
                    format!("ws-{i}"),
                    format!("contact-{i}"),
                    kind,
                    serde_json::json!({}),
                )
                .with_max_attempts(1),
                Utc::now(),
            )
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn ramps_toward_workspace_target_one_window_at_a_time() {
    let store = memory_store().await;
    enqueue_for_workspaces(&store, 20, "enrich_contact").await;

    let service = AutoscaleService::new(
        AutoscaleConfig::default(),
        Arc::clone(&store),
        Arc::new(StaticGuardrails::healthy()),
    );

    // Target is 20 * 64 = 1280; from the 1024 floor that is four steps.
    let start = Utc::now();
    let mut reasons = Vec::new();
    for minute in 0..=25 {
        let decision = service
            .evaluate_and_apply_at(&format!("tick-{minute}"), start + Duration::minutes(minute))
            .await
            .unwrap();
        assert_eq!(decision.global_target, 1280);
        reasons.push(decision.reason);
    }

    let ramps = reasons
        .iter()
        .filter(|r| **r == ReasonCode::RampStep)
        .count();
    assert_eq!(ramps, 4);
    assert_eq!(service.current_capacity().await, 1280);
    assert_eq!(reasons.last(), Some(&ReasonCode::HoldTargetReached));

    let audit = store.list_autoscale_decisions(100).await.unwrap();
    assert_eq!(audit.len(), 26);
    assert_eq!(audit[0].correlation_id, "tick-25");
}

#[tokio::test]
async fn failing_queue_trips_failure_rate_guardrail() {
    let store = memory_store().await;
    enqueue_for_workspaces(&store, 30, "enrich_contact").await;

    let config = AutoscaleConfig {
        failure_rate_min_samples: 20,
        ..AutoscaleConfig::default()
    };
    let guardrails: Arc<dyn GuardrailMonitor> =
        Arc::new(JobStoreGuardrails::new(Arc::clone(&store), config.clone()));
    let service = AutoscaleService::new(config, Arc::clone(&store), guardrails);

    store
        .save_autoscale_state(
            &deferred_core::autoscale::AutoscaleState::new(1920),
            Utc::now(),
        )
        .await
        .unwrap();

    // Before any outcomes the queue looks healthy.
    let before = service.evaluate_and_apply("before").await.unwrap();
    assert!(!before.guardrail_state.any_breached());
    assert_eq!(before.reason, ReasonCode::HoldTargetReached);

    let handlers = Arc::new(HandlerRegistry::new());
    handlers.register(Arc::new(AlwaysFails)).await;
    let runner = JobRunner::new(JobRunnerConfig::default(), Arc::clone(&store), handlers);
    let summary = runner.process_due_jobs(&runner.invocation()).await.unwrap();
    assert_eq!(summary.failed, 25);

    let after = service.evaluate_and_apply("after").await.unwrap();
    assert!(after.guardrail_state.failure_rate_breached);
    assert_eq!(after.reason, ReasonCode::GuardrailStepDown);
    assert_eq!(after.from_capacity, 1920);
    assert_eq!(after.to_capacity, 1024);
}

#[tokio::test]
async fn operator_override_pins_capacity() {
    let store = memory_store().await;
    enqueue_for_workspaces(&store, 50, "enrich_contact").await;

    let guardrails = Arc::new(StaticGuardrails::healthy());
    guardrails.set_contention(true);
    guardrails.set_failure_rate(true);
    let config = AutoscaleConfig {
        operator_override_capacity: Some(222),
        ..AutoscaleConfig::default()
    };
    let service = AutoscaleService::new(config, Arc::clone(&store), guardrails);

    let decision = service.evaluate_and_apply("incident-42").await.unwrap();
    assert_eq!(decision.reason, ReasonCode::OperatorOverride);
    assert_eq!(decision.global_target, 3200);
    assert_eq!(decision.to_capacity, 222);
    assert!(decision.operator_override_active);

    let persisted = store.load_autoscale_state().await.unwrap().unwrap();
    assert_eq!(persisted.current_capacity, 222);
}
