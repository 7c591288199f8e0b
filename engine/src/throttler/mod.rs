//! Per-API-canonical rate limiter.
//!
//! Each exchange gets one `Throttler`. It owns a small set of named buckets
//! (e.g. Binance's request weight and order-count buckets), a mapping from
//! endpoint signature to the buckets/weights that endpoint consumes, and a
//! strict FIFO admission queue: two concurrent `acquire` calls against the
//! same canonical never both observe headroom that only fits one of them.

pub mod bucket;
pub mod defaults;

use bucket::{BucketSpec, BucketState};
use dashmap::DashMap;
use engine_common::ApiCanonical;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// What a request against a given endpoint signature costs, per bucket.
#[derive(Debug, Clone)]
pub struct EndpointCost {
    pub bucket: String,
    pub weight: u64,
}

/// How a response header's value relates to bucket usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderSemantics {
    /// The header already reports the used weight directly, e.g. Binance's
    /// `X-MBX-USED-WEIGHT-1M`.
    Used,
    /// The header reports *remaining* headroom; used weight is derived as
    /// `capacity - remaining`, e.g. Bybit's `X-Bapi-Limit-Status` or the
    /// generic `RateLimit-Remaining`.
    Remaining,
}

#[derive(Debug, Clone)]
struct HeaderUsage {
    header: String,
    bucket: String,
    semantics: HeaderSemantics,
}

/// Held by a caller between `acquire` returning and the request actually
/// completing. Dropping it ends the caller's turn at the serialization
/// point; it carries no other state today but exists so call sites have a
/// concrete value to hand back to `record_response_headers`/`on_backoff_hint`.
#[must_use]
pub struct ReleaseToken {
    canonical: ApiCanonical,
}

impl ReleaseToken {
    pub fn canonical(&self) -> ApiCanonical {
        self.canonical
    }
}

struct Ticketed {
    buckets: DashMap<String, BucketState>,
    endpoints: HashMap<String, Vec<EndpointCost>>,
    header_usage: Vec<HeaderUsage>,
    next_ticket: AtomicU64,
    now_serving: AtomicU64,
    turn_advanced: Notify,
}

/// Rate limiter for a single exchange's API surface.
pub struct Throttler {
    canonical: ApiCanonical,
    inner: Arc<Ticketed>,
}

impl Throttler {
    pub fn new(canonical: ApiCanonical, bucket_specs: Vec<BucketSpec>) -> Self {
        let buckets = DashMap::new();
        for spec in bucket_specs {
            buckets.insert(spec.name.clone(), BucketState::new(spec));
        }
        Self {
            canonical,
            inner: Arc::new(Ticketed {
                buckets,
                endpoints: HashMap::new(),
                header_usage: Vec::new(),
                next_ticket: AtomicU64::new(0),
                now_serving: AtomicU64::new(0),
                turn_advanced: Notify::new(),
            }),
        }
    }

    /// Declares which buckets (and at what weight) a given endpoint signature
    /// consumes. Signatures not registered here are treated as free of any
    /// bucket accounting.
    pub fn with_endpoint(mut self, signature: &str, costs: Vec<EndpointCost>) -> Self {
        Arc::get_mut(&mut self.inner)
            .expect("with_endpoint must run before the throttler is shared")
            .endpoints
            .insert(signature.to_string(), costs);
        self
    }

    /// Declares that response header `header` (matched case-insensitively,
    /// per `http::HeaderName`) reports usage for `bucket`, with the given
    /// `semantics`. Registered headers are what `record_response_headers`
    /// reconciles against on every response.
    pub fn with_header_usage(mut self, header: &str, bucket: &str, semantics: HeaderSemantics) -> Self {
        Arc::get_mut(&mut self.inner)
            .expect("with_header_usage must run before the throttler is shared")
            .header_usage
            .push(HeaderUsage {
                header: header.to_string(),
                bucket: bucket.to_string(),
                semantics,
            });
        self
    }

    pub fn canonical(&self) -> ApiCanonical {
        self.canonical
    }

    /// Blocks until every bucket the endpoint draws on has headroom, then
    /// admits the weight against all of them atomically with respect to
    /// other callers. Calls are served strictly in arrival order.
    pub async fn acquire(&self, endpoint_signature: &str) -> ReleaseToken {
        let my_ticket = self.inner.next_ticket.fetch_add(1, Ordering::SeqCst);
        self.wait_for_turn(my_ticket).await;

        let costs = self
            .inner
            .endpoints
            .get(endpoint_signature)
            .cloned()
            .unwrap_or_default();

        loop {
            let now = Instant::now();
            let wait = costs
                .iter()
                .map(|cost| {
                    self.inner
                        .buckets
                        .get_mut(&cost.bucket)
                        .map(|mut b| b.wait_for(cost.weight, now))
                        .unwrap_or(Duration::ZERO)
                })
                .max()
                .unwrap_or(Duration::ZERO);

            if wait.is_zero() {
                break;
            }
            tokio::time::sleep(wait).await;
        }

        let now = Instant::now();
        for cost in &costs {
            if let Some(mut b) = self.inner.buckets.get_mut(&cost.bucket) {
                b.admit(cost.weight, now);
            }
        }

        self.advance_turn(my_ticket);
        ReleaseToken {
            canonical: self.canonical,
        }
    }

    /// The `Notified` future is created *before* checking `now_serving`:
    /// `Notify` guarantees a notification landing between that creation and
    /// the later `.await` is not lost, which checking-then-subscribing does
    /// not (a predecessor's `advance_turn` in that window would otherwise
    /// wake nobody, and no later call ever re-notifies this ticket).
    async fn wait_for_turn(&self, my_ticket: u64) {
        loop {
            let notified = self.inner.turn_advanced.notified();
            if self.inner.now_serving.load(Ordering::SeqCst) == my_ticket {
                return;
            }
            notified.await;
        }
    }

    fn advance_turn(&self, my_ticket: u64) {
        self.inner
            .now_serving
            .store(my_ticket + 1, Ordering::SeqCst);
        self.inner.turn_advanced.notify_waiters();
    }

    /// Reconciles local accounting with the exchange's authoritative
    /// response headers (e.g. `X-MBX-USED-WEIGHT-1M`). Never decreases a
    /// bucket's apparent usage.
    pub fn record_bucket_usage(&self, bucket: &str, used: u64) {
        if let Some(mut b) = self.inner.buckets.get_mut(bucket) {
            b.record_server_usage(used);
        }
    }

    /// Parses every header this throttler was told to watch
    /// (`with_header_usage`) out of a live response and clamps the
    /// corresponding bucket's local accounting upward. Unmapped headers,
    /// missing headers, and unparsable values are silently ignored; a
    /// response from an endpoint with no declared header usage is a no-op
    /// (spec.md §4.4 `recordResponseHeaders`).
    pub fn record_response_headers(&self, headers: &http::HeaderMap) {
        for usage in &self.inner.header_usage {
            let Ok(name) = http::header::HeaderName::from_bytes(usage.header.as_bytes()) else {
                continue;
            };
            let Some(value) = headers.get(&name) else {
                continue;
            };
            let Ok(text) = value.to_str() else { continue };
            let Ok(parsed) = text.trim().parse::<u64>() else {
                continue;
            };

            let used = match usage.semantics {
                HeaderSemantics::Used => parsed,
                HeaderSemantics::Remaining => {
                    let Some(capacity) = self.inner.buckets.get(&usage.bucket).map(|b| b.capacity())
                    else {
                        continue;
                    };
                    capacity.saturating_sub(parsed)
                }
            };
            self.record_bucket_usage(&usage.bucket, used);
        }
    }

    /// A 429/418-class response told us to back off `bucket` for
    /// `retry_after`. Every future `acquire` touching that bucket waits out
    /// the hint regardless of the bucket's own accounting.
    pub fn on_backoff_hint(&self, bucket: &str, retry_after: Duration) {
        if let Some(mut b) = self.inner.buckets.get_mut(bucket) {
            b.reserve_for(retry_after, Instant::now());
        }
    }

    /// Current windowed usage for a bucket, for metrics/introspection.
    pub fn bucket_usage(&self, bucket: &str) -> Option<(u64, u64)> {
        self.inner.buckets.get_mut(bucket).map(|mut b| {
            let used = b.windowed_usage(Instant::now());
            (used, b.capacity())
        })
    }

    /// Next instant at which `weight` more units would fit in `bucket`,
    /// without admitting anything (spec.md §4.4 `queryTime`). `None` if the
    /// bucket isn't registered. Callers that want to schedule their own
    /// retry instead of blocking in `acquire` use this; it does not reserve
    /// the headroom it reports, so a racing `acquire` may still consume it
    /// before the caller comes back.
    pub fn query_time(&self, bucket: &str, weight: u64) -> Option<Instant> {
        self.inner.buckets.get_mut(bucket).map(|mut b| {
            let now = Instant::now();
            now + b.wait_for(weight, now)
        })
    }
}

/// One throttler per exchange canonical, shared across every dispatcher
/// worker in this process. A single throttler instance within a dispatcher
/// worker is sufficient only when dispatchers are pinned one-per-group and
/// groups map one-per-exchange; coordinating across processes needs a
/// shared backend instead.
#[derive(Default)]
pub struct ThrottlerRegistry {
    throttlers: DashMap<ApiCanonical, Arc<Throttler>>,
}

impl ThrottlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, throttler: Throttler) {
        self.throttlers.insert(throttler.canonical(), Arc::new(throttler));
    }

    pub fn get(&self, canonical: ApiCanonical) -> Option<Arc<Throttler>> {
        self.throttlers.get(&canonical).map(|e| e.value().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn small_throttler() -> Throttler {
        Throttler::new(
            ApiCanonical::Binance,
            vec![BucketSpec {
                name: "weight".into(),
                window: Duration::from_millis(200),
                capacity: 2,
            }],
        )
        .with_endpoint(
            "GET /order",
            vec![EndpointCost {
                bucket: "weight".into(),
                weight: 1,
            }],
        )
    }

    #[tokio::test]
    async fn admits_up_to_capacity_without_waiting() {
        let throttler = small_throttler();
        let t0 = Instant::now();
        let _a = throttler.acquire("GET /order").await;
        let _b = throttler.acquire("GET /order").await;
        assert!(t0.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn fourth_caller_waits_for_window_to_clear() {
        let throttler = small_throttler();
        let _a = throttler.acquire("GET /order").await;
        let _b = throttler.acquire("GET /order").await;
        let t0 = Instant::now();
        let _c = throttler.acquire("GET /order").await;
        assert!(t0.elapsed() >= Duration::from_millis(150));
    }

    #[tokio::test]
    async fn completion_order_matches_arrival_order() {
        let throttler = Arc::new(small_throttler());
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let started = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..5u64 {
            let throttler = throttler.clone();
            let order = order.clone();
            let started = started.clone();
            handles.push(tokio::spawn(async move {
                // Stagger spawn order deterministically by waiting for a
                // monotonically increasing counter rather than real sleep.
                while started.load(Ordering::SeqCst) != i as usize {
                    tokio::task::yield_now().await;
                }
                started.fetch_add(1, Ordering::SeqCst);
                let _permit = throttler.acquire("GET /order").await;
                order.lock().unwrap().push(i);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let finished = order.lock().unwrap().clone();
        assert_eq!(finished, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn record_response_headers_clamps_a_used_style_header_upward() {
        let throttler = small_throttler().with_header_usage(
            "x-mbx-used-weight-200ms",
            "weight",
            HeaderSemantics::Used,
        );
        let mut headers = http::HeaderMap::new();
        headers.insert(
            "x-mbx-used-weight-200ms",
            http::HeaderValue::from_static("2"),
        );
        throttler.record_response_headers(&headers);
        let (used, capacity) = throttler.bucket_usage("weight").unwrap();
        assert_eq!(used, 2);
        assert_eq!(capacity, 2);

        // A smaller, stale value must not move usage back down.
        headers.insert(
            "x-mbx-used-weight-200ms",
            http::HeaderValue::from_static("0"),
        );
        throttler.record_response_headers(&headers);
        assert_eq!(throttler.bucket_usage("weight").unwrap().0, 2);
    }

    #[test]
    fn record_response_headers_derives_used_from_remaining() {
        let throttler =
            small_throttler().with_header_usage("ratelimit-remaining", "weight", HeaderSemantics::Remaining);
        let mut headers = http::HeaderMap::new();
        headers.insert("ratelimit-remaining", http::HeaderValue::from_static("0"));
        throttler.record_response_headers(&headers);
        // capacity=2, remaining=0 => used=2
        assert_eq!(throttler.bucket_usage("weight").unwrap().0, 2);
    }

    #[test]
    fn record_response_headers_ignores_unmapped_and_unparsable_headers() {
        let throttler = small_throttler();
        let mut headers = http::HeaderMap::new();
        headers.insert("x-unrelated", http::HeaderValue::from_static("not-a-number"));
        throttler.record_response_headers(&headers);
        assert_eq!(throttler.bucket_usage("weight").unwrap().0, 0);
    }

    #[tokio::test]
    async fn query_time_reports_headroom_without_admitting() {
        let throttler = small_throttler();
        assert!(
            throttler.query_time("weight", 1).unwrap() <= Instant::now(),
            "empty bucket has room now"
        );
        let _a = throttler.acquire("GET /order").await;
        let _b = throttler.acquire("GET /order").await;
        let later = throttler.query_time("weight", 1).unwrap();
        assert!(later > Instant::now(), "bucket is full, next slot is in the future");
        // query_time must not itself admit anything.
        assert_eq!(throttler.bucket_usage("weight").unwrap().0, 2);
    }

    #[tokio::test]
    async fn unregistered_endpoint_never_waits() {
        let throttler = small_throttler();
        for _ in 0..10 {
            let _permit = throttler.acquire("GET /unmetered").await;
        }
    }

    /// S4 (spec.md §8), scaled down by 300x to keep the test fast: a
    /// bucket's (capacity, window) ratio and the caller/capacity ratio from
    /// the spec (1200 per 60s, 2000 callers) are preserved at
    /// capacity=4/window=200ms with 7 callers. The bucket's accounting runs
    /// on real `std::time::Instant`, so the scenario runs over real
    /// wall-clock time rather than a paused tokio clock.
    #[tokio::test]
    async fn s4_throttler_under_pressure() {
        let throttler = Arc::new(
            Throttler::new(
                ApiCanonical::Binance,
                vec![BucketSpec {
                    name: "weight".into(),
                    window: Duration::from_millis(200),
                    capacity: 4,
                }],
            )
            .with_endpoint(
                "POST /fapi/v1/order",
                vec![EndpointCost {
                    bucket: "weight".into(),
                    weight: 1,
                }],
            ),
        );
        let completed = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..7 {
            let throttler = throttler.clone();
            let completed = completed.clone();
            handles.push(tokio::spawn(async move {
                let _permit = throttler.acquire("POST /fapi/v1/order").await;
                completed.fetch_add(1, Ordering::SeqCst);
            }));
        }

        // Just before the first window clears, no more than capacity may
        // have been admitted.
        tokio::time::sleep(Duration::from_millis(190)).await;
        let before_window_clears = completed.load(Ordering::SeqCst);
        assert!(
            before_window_clears <= 4,
            "at most capacity may complete before the first window clears: {before_window_clears}"
        );

        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(
            completed.load(Ordering::SeqCst),
            7,
            "every caller eventually completes once the window keeps clearing"
        );
    }
}
