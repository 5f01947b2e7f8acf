//! Deferred jobs: data model, handlers, backoff, and the runner.

pub mod backoff;
pub mod handler;
pub mod model;
pub mod runner;

pub use handler::{HandlerRegistry, JobHandler, NoopHandler};
pub use model::{Job, JobOutcomeCounts, JobStatus, NewJob};
pub use runner::{JobRunner, ProcessOptions, RunSummary, spawn_runner_ticker};
