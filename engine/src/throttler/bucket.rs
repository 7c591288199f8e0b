use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// A named (capacity, window) pair governing weight accounting for a subset
/// of an exchange's endpoints.
#[derive(Debug, Clone)]
pub struct BucketSpec {
    pub name: String,
    pub window: Duration,
    pub capacity: u64,
}

/// Sliding-window accounting for one bucket. A deque of admitted
/// `(at, weight)` entries is pruned of anything older than `window` on
/// every check.
#[derive(Debug)]
pub struct BucketState {
    spec: BucketSpec,
    admitted: VecDeque<(Instant, u64)>,
    used: u64,
    /// Server-reported usage, clamped upward only. `None` until the first
    /// response arrives.
    server_reported: Option<u64>,
    /// Set by `onBackoffHint`: the bucket is treated as fully reserved
    /// until this instant regardless of local accounting.
    reserved_until: Option<Instant>,
}

impl BucketState {
    pub fn new(spec: BucketSpec) -> Self {
        Self {
            spec,
            admitted: VecDeque::new(),
            used: 0,
            server_reported: None,
            reserved_until: None,
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some((at, weight)) = self.admitted.front().copied() {
            if now.duration_since(at) >= self.spec.window {
                self.admitted.pop_front();
                self.used = self.used.saturating_sub(weight);
            } else {
                break;
            }
        }
    }

    fn effective_used(&self) -> u64 {
        self.used.max(self.server_reported.unwrap_or(0))
    }

    /// Duration until `weight` more units would fit within capacity. Zero
    /// means the weight fits right now.
    pub fn wait_for(&mut self, weight: u64, now: Instant) -> Duration {
        self.prune(now);

        if let Some(until) = self.reserved_until {
            if now < until {
                return until - now;
            }
            self.reserved_until = None;
        }

        if self.effective_used() + weight <= self.spec.capacity {
            return Duration::ZERO;
        }

        // Find the earliest admitted entry whose expiry would free enough
        // room. Entries are in arrival order, so walk them oldest-first.
        let mut freed = 0u64;
        let overflow = self.effective_used() + weight - self.spec.capacity;
        for (at, w) in &self.admitted {
            freed += w;
            if freed >= overflow {
                let expiry = *at + self.spec.window;
                return expiry.saturating_duration_since(now);
            }
        }
        // Nothing queued can free enough room (e.g. server_reported alone
        // exceeds capacity): fall back to a full window.
        self.spec.window
    }

    /// Commits `weight` against the bucket. Caller must have already
    /// confirmed `wait_for` returned zero (or waited it out).
    pub fn admit(&mut self, weight: u64, now: Instant) {
        self.prune(now);
        self.admitted.push_back((now, weight));
        self.used += weight;
    }

    /// Clamp the local counter upward to reconcile with the exchange's
    /// authoritative view. Never moves it down: a stale, smaller header
    /// value must not let other callers race ahead.
    pub fn record_server_usage(&mut self, used: u64) {
        self.server_reported = Some(self.server_reported.unwrap_or(0).max(used));
    }

    /// Forces the bucket fully reserved for `duration` (HTTP 418/429 and
    /// equivalents).
    pub fn reserve_for(&mut self, duration: Duration, now: Instant) {
        let until = now + duration;
        self.reserved_until = Some(match self.reserved_until {
            Some(existing) if existing > until => existing,
            _ => until,
        });
    }

    pub fn capacity(&self) -> u64 {
        self.spec.capacity
    }

    pub fn window(&self) -> Duration {
        self.spec.window
    }

    /// Sum of weight admitted within the trailing window, as of `now`.
    /// Exposed for the throttler-conservation property test.
    pub fn windowed_usage(&mut self, now: Instant) -> u64 {
        self.prune(now);
        self.effective_used()
    }
}
