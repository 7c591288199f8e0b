// Engine-wide defaults. Job classes may override any of these; these are the
// fallbacks the step store and job harness apply when a class does not.

/// Default batch size a dispatcher tick asks the store for.
pub const DEFAULT_BATCH_SIZE: u32 = 32;

/// Upper bound on the batch size a single tick may request.
pub const MAX_BATCH_SIZE: u32 = 64;

/// Cadence at which the coordinator enqueues `ProcessGroupTick(group)`.
pub const DEFAULT_TICK_INTERVAL_SECONDS: u64 = 1;

/// Wall-clock budget for a single dispatcher tick before it must stop
/// claiming new work and let the next tick pick up where it left off.
pub const DEFAULT_TICK_BUDGET_SECONDS: u64 = 25;

/// Per-step wall-clock timeout enforced by the job harness.
pub const DEFAULT_STEP_TIMEOUT_SECONDS: u64 = 120;

/// Default initial retry delay for a retryable fault.
pub const DEFAULT_BACKOFF_SECONDS: u64 = 10;

/// Default exponential backoff multiplier.
pub const DEFAULT_BACKOFF_MULTIPLIER: u32 = 2;

/// Default backoff cap.
pub const DEFAULT_BACKOFF_CAP_SECONDS: u64 = 120;

/// Default max attempts for a step before it is marked `failed`.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Max attempts allotted specifically to `doubleCheck` verification failures.
pub const DEFAULT_VERIFICATION_MAX_ATTEMPTS: u32 = 3;

/// Exchange-imposed per-connection WebSocket subscription caps.
pub fn websocket_group_capacity(canonical: crate::exchange::ApiCanonical) -> usize {
    use crate::exchange::ApiCanonical::*;
    match canonical {
        Kucoin => 100,
        Bitget => 45,
        // Binance, Bybit, Kraken and the market-data canonicals are not
        // subject to a documented per-connection symbol cap in this system;
        // use a generous default so grouping logic still terminates.
        _ => 200,
    }
}
