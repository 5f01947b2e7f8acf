//! Job handlers and the registry that maps a job `kind` to its handler.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::HandlerError;
use crate::jobs::model::Job;

/// A unit of work invoked for every claimed job of one `kind`.
///
/// Delivery is at-least-once: a crash after the work but before the status
/// commit runs the handler again, so handlers with side effects must check
/// their own "already done" condition first.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// The job kind this handler serves.
    fn kind(&self) -> &str;

    /// Execute the job. Any error is retried while attempts remain.
    async fn execute(&self, job: &Job) -> Result<(), HandlerError>;
}

/// Registry of handlers keyed by job kind.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
}

impl HandlerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. A later registration for the same kind replaces it.
    pub async fn register(&self, handler: Arc<dyn JobHandler>) {
        let kind = handler.kind().to_string();
        if self
            .handlers
            .write()
            .await
            .insert(kind.clone(), handler)
            .is_some()
        {
            tracing::warn!(kind = %kind, "Replaced existing job handler");
        } else {
            tracing::debug!(kind = %kind, "Registered job handler");
        }
    }

    /// Get a handler by kind.
    pub async fn get(&self, kind: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.read().await.get(kind).cloned()
    }

    /// Number of registered handlers.
    pub async fn count(&self) -> usize {
        self.handlers.read().await.len()
    }

    /// Run the handler registered for `job.kind`.
    pub async fn dispatch(&self, job: &Job) -> Result<(), HandlerError> {
        let handler = self
            .get(&job.kind)
            .await
            .ok_or_else(|| HandlerError::UnknownKind {
                kind: job.kind.clone(),
            })?;
        handler.execute(job).await
    }
}

/// Handler that accepts every job and does nothing. Useful for heartbeat
/// jobs that only prove the queue is draining.
pub struct NoopHandler {
    kind: String,
}

impl NoopHandler {
    pub fn new(kind: impl Into<String>) -> Self {
        Self { kind: kind.into() }
    }
}

#[async_trait]
impl JobHandler for NoopHandler {
    fn kind(&self) -> &str {
        &self.kind
    }

    async fn execute(&self, job: &Job) -> Result<(), HandlerError> {
        tracing::debug!(job_id = %job.id, kind = %self.kind, "Noop job executed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::*;
    use crate::jobs::model::JobStatus;

    struct Failing;

    #[async_trait]
    impl JobHandler for Failing {
        fn kind(&self) -> &str {
            "crm_sync"
        }

        async fn execute(&self, _job: &Job) -> Result<(), HandlerError> {
            Err(HandlerError::failed("crm returned 500"))
        }
    }

    fn job(kind: &str) -> Job {
        let now = Utc::now();
        Job {
            id: Uuid::new_v4(),
            workspace_id: "ws".into(),
            subject_id: "subject".into(),
            kind: kind.into(),
            payload: serde_json::json!({}),
            status: JobStatus::Running,
            attempts: 1,
            max_attempts: 3,
            run_at: now,
            locked_at: Some(now),
            locked_by: Some("inv".into()),
            started_at: Some(now),
            finished_at: None,
            last_error: None,
            dedupe_key: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn dispatch_routes_by_kind() {
        let registry = HandlerRegistry::new();
        registry.register(Arc::new(NoopHandler::new("heartbeat"))).await;
        registry.register(Arc::new(Failing)).await;
        assert_eq!(registry.count().await, 2);

        assert!(registry.dispatch(&job("heartbeat")).await.is_ok());
        let err = registry.dispatch(&job("crm_sync")).await.unwrap_err();
        assert_eq!(err.to_string(), "crm returned 500");
    }

    #[tokio::test]
    async fn dispatch_unknown_kind() {
        let registry = HandlerRegistry::new();
        let err = registry.dispatch(&job("missing")).await.unwrap_err();
        assert!(matches!(err, HandlerError::UnknownKind { ref kind } if kind == "missing"));
    }

    #[tokio::test]
    async fn later_registration_replaces_earlier() {
        struct Renamed;

        #[async_trait]
        impl JobHandler for Renamed {
            fn kind(&self) -> &str {
                "heartbeat"
            }

            async fn execute(&self, _job: &Job) -> Result<(), HandlerError> {
                Err(HandlerError::failed("replacement ran"))
            }
        }

        let registry = HandlerRegistry::new();
        registry.register(Arc::new(NoopHandler::new("heartbeat"))).await;
        registry.register(Arc::new(Renamed)).await;
        assert_eq!(registry.count().await, 1);

        let err = registry.dispatch(&job("heartbeat")).await.unwrap_err();
        assert_eq!(err.to_string(), "replacement ran");
    }
}
