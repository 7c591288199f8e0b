// Time helpers used for scheduling and backoff math.
//
// IMPORTANT: this module is for scheduling and logging timestamps only. It is
// not consensus-critical anywhere in this crate; there is no consensus here.

use chrono::{DateTime, Utc};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub type TimestampSeconds = i64;

#[inline]
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

#[inline]
pub fn now_unix_seconds() -> TimestampSeconds {
    now().timestamp()
}

#[inline]
pub fn duration_since_unix_epoch() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the unix epoch")
}

/// Exponential backoff with a multiplier and a cap.
///
/// `attempt` is 1-based (the attempt number that just failed).
pub fn exponential_backoff(
    initial_seconds: u64,
    multiplier: u32,
    cap_seconds: u64,
    attempt: u32,
) -> Duration {
    let exp = attempt.saturating_sub(1);
    let factor = (multiplier as u64).saturating_pow(exp);
    let seconds = initial_seconds.saturating_mul(factor).min(cap_seconds);
    Duration::from_secs(seconds)
}

/// Convenience wrapper over [`exponential_backoff`] using the engine-wide
/// default multiplier and cap; used by callers (e.g. the Repeater) that only
/// carry a per-row initial delay and don't need to override the rest.
pub fn exponential_backoff_from(initial_seconds: u64, attempt: u32) -> Duration {
    exponential_backoff(
        initial_seconds,
        crate::config::DEFAULT_BACKOFF_MULTIPLIER,
        crate::config::DEFAULT_BACKOFF_CAP_SECONDS,
        attempt,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_then_caps() {
        assert_eq!(exponential_backoff(10, 2, 120, 1), Duration::from_secs(10));
        assert_eq!(exponential_backoff(10, 2, 120, 2), Duration::from_secs(20));
        assert_eq!(exponential_backoff(10, 2, 120, 3), Duration::from_secs(40));
        assert_eq!(exponential_backoff(10, 2, 120, 5), Duration::from_secs(120));
        assert_eq!(exponential_backoff(10, 2, 120, 20), Duration::from_secs(120));
    }

    #[test]
    fn backoff_from_uses_engine_defaults() {
        assert_eq!(exponential_backoff_from(10, 1), Duration::from_secs(10));
        assert_eq!(exponential_backoff_from(10, 2), Duration::from_secs(20));
    }
}
