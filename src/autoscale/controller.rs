//! Global capacity controller.
//!
//! `evaluate` is a pure function of config, guardrails, workspace count and
//! state. `apply` commits a decision. Priority, first match wins:
//!
//! 1. operator override
//! 2. guardrail step-down (immediate)
//! 3. hold when already at or above the workspace target
//! 4. ramp one step toward the target once the ramp window has elapsed
//! 5. hold inside the ramp window

use chrono::{DateTime, Utc};

use crate::autoscale::model::{AutoscaleDecision, AutoscaleState, GuardrailState, ReasonCode};
use crate::config::AutoscaleConfig;

/// Compute the next capacity decision without touching `state`.
pub fn evaluate(
    config: &AutoscaleConfig,
    guardrails: GuardrailState,
    active_workspace_count: i64,
    state: &AutoscaleState,
    now: DateTime<Utc>,
    correlation_id: impl Into<String>,
) -> AutoscaleDecision {
    let workspaces = active_workspace_count.max(0) as u64;
    let from = state.current_capacity.max(1);
    let floor = config.global_floor.max(1);
    let global_target = workspaces
        .saturating_mul(config.workspace_multiplier)
        .max(floor);

    let (to, reason) = if let Some(capacity) = config.operator_override_capacity {
        (capacity, ReasonCode::OperatorOverride)
    } else if guardrails.any_breached() {
        let stepped = (from as f64 * config.step_down_factor).floor() as u64;
        (stepped.max(floor), ReasonCode::GuardrailStepDown)
    } else if from >= global_target {
        (from, ReasonCode::HoldTargetReached)
    } else if ramp_window_elapsed(config, state, now) {
        (
            from.saturating_add(config.ramp_step).min(global_target),
            ReasonCode::RampStep,
        )
    } else {
        (from, ReasonCode::HoldRampWindow)
    };

    AutoscaleDecision {
        from_capacity: from,
        to_capacity: to.max(1),
        reason,
        guardrail_state: guardrails,
        operator_override_active: config.operator_override_capacity.is_some(),
        correlation_id: correlation_id.into(),
        global_target,
        timestamp: now,
    }
}

/// Commit `decision` into `state`.
///
/// The ramp timer only moves when capacity actually changes. A held decision
/// leaves `last_scale_at_ms` untouched.
pub fn apply(state: &mut AutoscaleState, decision: &AutoscaleDecision, now: DateTime<Utc>) {
    state.current_capacity = decision.to_capacity.max(1);
    if decision.changes_capacity() {
        state.last_scale_at_ms = Some(now.timestamp_millis());
    }
}

fn ramp_window_elapsed(config: &AutoscaleConfig, state: &AutoscaleState, now: DateTime<Utc>) -> bool {
    let last = state.last_scale_at_ms.unwrap_or(0);
    let window_ms = i64::try_from(config.ramp_window.as_millis()).unwrap_or(i64::MAX);
    now.timestamp_millis().saturating_sub(last) >= window_ms
}
