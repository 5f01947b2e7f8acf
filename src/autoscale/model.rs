//! Autoscale state, guardrail snapshots, and decisions.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Why a decision landed on its capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    OperatorOverride,
    GuardrailStepDown,
    HoldTargetReached,
    RampStep,
    HoldRampWindow,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OperatorOverride => "operator_override",
            Self::GuardrailStepDown => "guardrail_step_down",
            Self::HoldTargetReached => "hold_target_reached",
            Self::RampStep => "ramp_step",
            Self::HoldRampWindow => "hold_ramp_window",
        }
    }
}

impl std::fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReasonCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "operator_override" => Ok(Self::OperatorOverride),
            "guardrail_step_down" => Ok(Self::GuardrailStepDown),
            "hold_target_reached" => Ok(Self::HoldTargetReached),
            "ramp_step" => Ok(Self::RampStep),
            "hold_ramp_window" => Ok(Self::HoldRampWindow),
            other => Err(format!("unknown reason code: {other}")),
        }
    }
}

/// Health signals sampled once per tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardrailState {
    pub contention_breached: bool,
    pub failure_rate_breached: bool,
}

impl GuardrailState {
    pub fn healthy() -> Self {
        Self::default()
    }

    pub fn any_breached(&self) -> bool {
        self.contention_breached || self.failure_rate_breached
    }
}

/// Controller state carried between ticks. Only `controller::apply` writes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoscaleState {
    pub current_capacity: u64,
    /// Epoch millis of the last capacity change.
    pub last_scale_at_ms: Option<i64>,
}

impl AutoscaleState {
    /// Fresh state starting at `capacity` with no scaling history.
    pub fn new(capacity: u64) -> Self {
        Self {
            current_capacity: capacity.max(1),
            last_scale_at_ms: None,
        }
    }
}

/// One evaluation of the controller. Has no effect until applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoscaleDecision {
    pub from_capacity: u64,
    pub to_capacity: u64,
    pub reason: ReasonCode,
    pub guardrail_state: GuardrailState,
    pub operator_override_active: bool,
    pub correlation_id: String,
    /// Workspace-derived target, reported even when it did not decide.
    pub global_target: u64,
    pub timestamp: DateTime<Utc>,
}

impl AutoscaleDecision {
    pub fn changes_capacity(&self) -> bool {
        self.to_capacity != self.from_capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_code_roundtrip() {
        for reason in [
            ReasonCode::OperatorOverride,
            ReasonCode::GuardrailStepDown,
            ReasonCode::HoldTargetReached,
            ReasonCode::RampStep,
            ReasonCode::HoldRampWindow,
        ] {
            assert_eq!(reason.as_str().parse::<ReasonCode>().unwrap(), reason);
            let json = serde_json::to_string(&reason).unwrap();
            assert_eq!(json, format!("\"{}\"", reason.as_str()));
        }
    }

    #[test]
    fn new_state_is_at_least_one() {
        assert_eq!(AutoscaleState::new(0).current_capacity, 1);
        assert_eq!(AutoscaleState::new(1024).current_capacity, 1024);
    }

    #[test]
    fn guardrail_any_breached() {
        assert!(!GuardrailState::healthy().any_breached());
        assert!(
            GuardrailState {
                contention_breached: true,
                failure_rate_breached: false
            }
            .any_breached()
        );
    }
}
