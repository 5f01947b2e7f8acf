//! Error types for the deferred job core.

use uuid::Uuid;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Guardrail monitor error: {0}")]
    Guardrail(String),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Errors returned by a job handler.
///
/// Every variant is treated the same by the runner: the job is retried while
/// attempts remain and marked failed afterwards.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("No handler registered for job kind '{kind}'")]
    UnknownKind { kind: String },

    #[error("Invalid payload for job {id}: {reason}")]
    InvalidPayload { id: Uuid, reason: String },

    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HandlerError {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed(reason.into())
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
