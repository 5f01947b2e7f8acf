//! Global capacity autoscaling: a pure controller plus the service that
//! feeds it from the store and guardrail monitors.

pub mod controller;
pub mod guardrails;
pub mod model;
pub mod service;

pub use controller::{apply, evaluate};
pub use guardrails::{GuardrailMonitor, JobStoreGuardrails, StaticGuardrails};
pub use model::{AutoscaleDecision, AutoscaleState, GuardrailState, ReasonCode};
pub use service::{AutoscaleService, spawn_autoscale_ticker};
