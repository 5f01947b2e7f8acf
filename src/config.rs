//! Configuration types.
//!
//! Everything is read once at startup and normalized here, so the runner and
//! the autoscale controller never see out-of-range values. A value that fails
//! to parse or falls outside its range is logged and replaced by the default.

use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

/// Global capacity autoscaling configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct AutoscaleConfig {
    /// Minimum global capacity, regardless of workspace count.
    pub global_floor: u64,
    /// Capacity granted per active workspace.
    pub workspace_multiplier: u64,
    /// Maximum capacity increase per ramp window.
    pub ramp_step: u64,
    /// Minimum time between two ramp-ups.
    pub ramp_window: Duration,
    /// Multiplier applied to current capacity on a guardrail breach. In (0, 1).
    pub step_down_factor: f64,
    /// Forces an exact capacity when set.
    pub operator_override_capacity: Option<u64>,
    /// A workspace with work finished inside this window counts as active.
    pub activity_window: Duration,
    /// Failed share of recent outcomes that trips the failure-rate guardrail.
    pub failure_rate_threshold: f64,
    /// Outcomes required before the failure rate is trusted.
    pub failure_rate_min_samples: u64,
    /// Running-job count that trips the contention guardrail. `None` disables it.
    pub contention_running_limit: Option<u64>,
}

impl Default for AutoscaleConfig {
    fn default() -> Self {
        Self {
            global_floor: 1024,
            workspace_multiplier: 64,
            ramp_step: 64,
            ramp_window: Duration::from_secs(5 * 60),
            step_down_factor: 0.5,
            operator_override_capacity: None,
            activity_window: Duration::from_secs(60 * 60),
            failure_rate_threshold: 0.5,
            failure_rate_min_samples: 20,
            contention_running_limit: None,
        }
    }
}

impl AutoscaleConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        Self {
            global_floor: parse_or(&lookup, "AUTOSCALE_GLOBAL_FLOOR", d.global_floor, |v| *v >= 1),
            workspace_multiplier: parse_or(
                &lookup,
                "AUTOSCALE_WORKSPACE_MULTIPLIER",
                d.workspace_multiplier,
                |v| *v >= 1,
            ),
            ramp_step: parse_or(&lookup, "AUTOSCALE_RAMP_STEP", d.ramp_step, |v| *v >= 1),
            ramp_window: Duration::from_secs(
                60 * parse_or(
                    &lookup,
                    "AUTOSCALE_RAMP_WINDOW_MINUTES",
                    d.ramp_window.as_secs() / 60,
                    |_| true,
                ),
            ),
            step_down_factor: parse_or(
                &lookup,
                "AUTOSCALE_STEP_DOWN_FACTOR",
                d.step_down_factor,
                |v| *v > 0.0 && *v < 1.0,
            ),
            operator_override_capacity: parse_optional(
                &lookup,
                "AUTOSCALE_OPERATOR_OVERRIDE_CAPACITY",
                |v: &u64| *v >= 1,
            ),
            activity_window: Duration::from_secs(
                60 * parse_or(
                    &lookup,
                    "AUTOSCALE_ACTIVITY_WINDOW_MINUTES",
                    d.activity_window.as_secs() / 60,
                    |v| *v >= 1,
                ),
            ),
            failure_rate_threshold: parse_or(
                &lookup,
                "AUTOSCALE_FAILURE_RATE_THRESHOLD",
                d.failure_rate_threshold,
                |v| *v > 0.0 && *v <= 1.0,
            ),
            failure_rate_min_samples: parse_or(
                &lookup,
                "AUTOSCALE_FAILURE_RATE_MIN_SAMPLES",
                d.failure_rate_min_samples,
                |v| *v >= 1,
            ),
            contention_running_limit: parse_optional(
                &lookup,
                "AUTOSCALE_CONTENTION_RUNNING_LIMIT",
                |v: &u64| *v >= 1,
            ),
        }
    }
}

/// Job runner configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRunnerConfig {
    /// Maximum jobs selected per invocation.
    pub batch_limit: u32,
    /// A running job whose lease is older than this is released.
    pub stale_lock_threshold: Duration,
    /// Total time budget for one invocation.
    pub time_budget: Duration,
    /// Tail of the budget reserved for in-flight work.
    pub safety_margin: Duration,
    /// Upper bound on retry backoff.
    pub backoff_cap: Duration,
    /// `last_error` is truncated to this many characters.
    pub max_error_chars: usize,
}

impl Default for JobRunnerConfig {
    fn default() -> Self {
        Self {
            batch_limit: 25,
            stale_lock_threshold: Duration::from_millis(600_000), // 10 minutes
            time_budget: Duration::from_millis(240_000),          // 4 minutes
            safety_margin: Duration::from_millis(7_500),
            backoff_cap: Duration::from_millis(900_000), // 15 minutes
            max_error_chars: 10_000,
        }
    }
}

impl JobRunnerConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let time_budget_ms = parse_or(
            &lookup,
            "JOB_TIME_BUDGET_MS",
            d.time_budget.as_millis() as u64,
            |v| *v >= 1,
        );
        // The margin has to leave some of the budget for claiming.
        let safety_margin_ms = parse_or(
            &lookup,
            "JOB_SAFETY_MARGIN_MS",
            d.safety_margin.as_millis() as u64,
            |v| *v < time_budget_ms,
        )
        .min(time_budget_ms.saturating_sub(1));

        Self {
            batch_limit: parse_or(&lookup, "JOB_BATCH_LIMIT", d.batch_limit, |v| *v >= 1),
            stale_lock_threshold: Duration::from_millis(parse_or(
                &lookup,
                "JOB_STALE_LOCK_MS",
                d.stale_lock_threshold.as_millis() as u64,
                |v| *v >= 1,
            )),
            time_budget: Duration::from_millis(time_budget_ms),
            safety_margin: Duration::from_millis(safety_margin_ms),
            backoff_cap: Duration::from_millis(parse_or(
                &lookup,
                "JOB_BACKOFF_CAP_MS",
                d.backoff_cap.as_millis() as u64,
                |v| *v >= 1_000,
            )),
            max_error_chars: parse_or(&lookup, "JOB_MAX_ERROR_CHARS", d.max_error_chars, |v| {
                *v >= 1
            }),
        }
    }
}

fn parse_or<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
    valid: impl Fn(&T) -> bool,
) -> T
where
    T: FromStr + std::fmt::Debug,
{
    let Some(raw) = lookup(key) else {
        return default;
    };
    let raw = raw.trim();
    if raw.is_empty() {
        return default;
    }
    match raw.parse::<T>() {
        Ok(v) if valid(&v) => v,
        Ok(v) => {
            warn!(key, value = ?v, fallback = ?default, "Config value out of range, using default");
            default
        }
        Err(_) => {
            warn!(key, value = raw, fallback = ?default, "Unparsable config value, using default");
            default
        }
    }
}

fn parse_optional<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    valid: impl Fn(&T) -> bool,
) -> Option<T>
where
    T: FromStr + std::fmt::Debug,
{
    let raw = lookup(key)?;
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    match raw.parse::<T>() {
        Ok(v) if valid(&v) => Some(v),
        _ => {
            warn!(key, value = raw, "Ignoring invalid optional config value");
            None
        }
    }
}
