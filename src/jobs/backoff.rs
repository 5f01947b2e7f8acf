//! Retry backoff: exponential in the attempt count, with jitter, capped.

use std::time::Duration;

use rand::Rng;

/// Jitter is drawn uniformly from `[0, MAX_JITTER_MS)`.
pub const MAX_JITTER_MS: u64 = 1_000;

const BASE_MS: u64 = 1_000;
const MIN_EXPONENT: u32 = 1;
const MAX_EXPONENT: u32 = 10;

/// Backoff before the next attempt, with random jitter.
pub fn retry_delay(attempts: u32, cap: Duration) -> Duration {
    let jitter_ms = rand::thread_rng().gen_range(0..MAX_JITTER_MS);
    retry_delay_with_jitter(attempts, jitter_ms, cap)
}

/// `min(cap, 2^attempts * 1s + jitter)` with `attempts` clamped to `[1, 10]`.
pub fn retry_delay_with_jitter(attempts: u32, jitter_ms: u64, cap: Duration) -> Duration {
    let exponent = attempts.clamp(MIN_EXPONENT, MAX_EXPONENT);
    let delay_ms = (1u64 << exponent) * BASE_MS + jitter_ms;
    Duration::from_millis(delay_ms).min(cap)
}
