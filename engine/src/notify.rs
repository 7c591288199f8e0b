//! Global notification throttle (spec.md §7 "admin notifications are
//! throttled per canonical context", §9 "Global notification throttle").
//!
//! A storm of identical failures must produce at most one alert per
//! throttle window. Windows are keyed by `(notification_canonical,
//! context_key)`, where the context key is produced by one of a small set
//! of key functions (per-account, per-exchange, per-symbol).

use dashmap::DashMap;
use std::time::{Duration, Instant};

/// How a notification's context key is derived from the step that
/// triggered it. Exactly one scheme applies per notification canonical.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextKeyScheme {
    PerAccount,
    PerExchange,
    PerSymbol,
}

/// Default window a notification canonical is silenced for after firing
/// once. Individual canonicals may register a different window.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct WindowKey {
    canonical: &'static str,
    context: u64,
}

/// Process-local (spec.md §9 "Global notification throttle... in a shared
/// cache"); externalise to a real shared cache if notifications must be
/// deduplicated across multiple engine processes.
#[derive(Default)]
pub struct NotificationThrottle {
    last_fired: DashMap<WindowKey, Instant>,
    windows: DashMap<&'static str, Duration>,
}

impl NotificationThrottle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_window(&self, canonical: &'static str, window: Duration) {
        self.windows.insert(canonical, window);
    }

    fn window_for(&self, canonical: &'static str) -> Duration {
        self.windows
            .get(canonical)
            .map(|w| *w.value())
            .unwrap_or(DEFAULT_WINDOW)
    }

    /// Returns `true` the first time `(canonical, context_key)` is seen
    /// within its window, and `false` for every subsequent call until the
    /// window elapses. Callers should only actually send a notification
    /// when this returns `true`.
    pub fn should_fire(&self, canonical: &'static str, context_key: impl std::hash::Hash) -> bool {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        context_key.hash(&mut hasher);
        let key = WindowKey {
            canonical,
            context: hasher.finish(),
        };

        let now = Instant::now();
        let window = self.window_for(canonical);

        match self.last_fired.get(&key) {
            Some(last) if now.duration_since(*last.value()) < window => false,
            _ => {
                self.last_fired.insert(key, now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_call_always_fires() {
        let throttle = NotificationThrottle::new();
        assert!(throttle.should_fire("order_failed", "account:42"));
    }

    #[test]
    fn repeat_within_window_is_silenced() {
        let throttle = NotificationThrottle::new();
        throttle.set_window("order_failed", Duration::from_secs(60));
        assert!(throttle.should_fire("order_failed", "account:42"));
        assert!(!throttle.should_fire("order_failed", "account:42"));
    }

    #[test]
    fn distinct_context_keys_are_independent() {
        let throttle = NotificationThrottle::new();
        assert!(throttle.should_fire("order_failed", "account:1"));
        assert!(throttle.should_fire("order_failed", "account:2"));
    }
}
