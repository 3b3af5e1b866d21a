//! Retry scheduling: exponential backoff with jitter.

use std::time::Duration;

use rand::Rng;

/// Deterministic part of the schedule: `base * 2^attempts`, clamped.
/// `attempts` is the number of deliveries already attempted.
pub fn backoff_delay_raw(attempts: i32, base: Duration, max: Duration) -> Duration {
    let shift = attempts.clamp(0, 32) as u32;
    base.checked_mul(1u32.checked_shl(shift).unwrap_or(u32::MAX))
        .unwrap_or(max)
        .min(max)
}

/// Next-attempt delay: a server-provided `Retry-After` wins outright
/// (still clamped); otherwise the exponential delay with ±50% jitter so
/// a burst of failures does not resynchronize into a thundering herd.
pub fn backoff_delay(
    attempts: i32,
    base: Duration,
    max: Duration,
    retry_after: Option<Duration>,
) -> Duration {
    if let Some(hint) = retry_after {
        return hint.min(max);
    }
    let raw = backoff_delay_raw(attempts, base, max);
    let jitter = rand::thread_rng().gen_range(0.5..1.5);
    raw.mul_f64(jitter).min(max)
}
