//! Published per-exchange bucket tables.
//!
//! These are the buckets and endpoint costs an engine process registers at
//! startup for each exchange canonical it trades on. The numbers mirror
//! each exchange's publicly documented limits closely enough to exercise
//! the throttler correctly; the exact weight table for every endpoint is
//! exchange-adapter territory (an external collaborator) and would be
//! refined there as new endpoints are added.

use super::bucket::BucketSpec;
use super::{EndpointCost, HeaderSemantics, Throttler};
use engine_common::ApiCanonical;
use std::time::Duration;

/// Binance: per-minute request weight, plus a separate per-10s order-count
/// bucket with its own cap.
pub fn binance() -> Throttler {
    Throttler::new(
        ApiCanonical::Binance,
        vec![
            BucketSpec {
                name: "weight_1m".into(),
                window: Duration::from_secs(60),
                capacity: 1200,
            },
            BucketSpec {
                name: "orders_10s".into(),
                window: Duration::from_secs(10),
                capacity: 50,
            },
            BucketSpec {
                name: "orders_1d".into(),
                window: Duration::from_secs(86_400),
                capacity: 160_000,
            },
        ],
    )
    .with_endpoint(
        "GET /fapi/v1/account",
        vec![EndpointCost {
            bucket: "weight_1m".into(),
            weight: 5,
        }],
    )
    .with_endpoint(
        "POST /fapi/v1/order",
        vec![
            EndpointCost {
                bucket: "weight_1m".into(),
                weight: 1,
            },
            EndpointCost {
                bucket: "orders_10s".into(),
                weight: 1,
            },
            EndpointCost {
                bucket: "orders_1d".into(),
                weight: 1,
            },
        ],
    )
    .with_endpoint(
        "DELETE /fapi/v1/order",
        vec![EndpointCost {
            bucket: "weight_1m".into(),
            weight: 1,
        }],
    )
    .with_header_usage("x-mbx-used-weight-1m", "weight_1m", HeaderSemantics::Used)
    .with_header_usage("x-mbx-order-count-10s", "orders_10s", HeaderSemantics::Used)
    .with_header_usage("x-mbx-order-count-1d", "orders_1d", HeaderSemantics::Used)
}

/// Bybit: a single rolling per-second request bucket, shared across
/// endpoint categories at the default tier.
pub fn bybit() -> Throttler {
    Throttler::new(
        ApiCanonical::Bybit,
        vec![BucketSpec {
            name: "requests_1s".into(),
            window: Duration::from_secs(1),
            capacity: 10,
        }],
    )
    .with_endpoint(
        "POST /v5/order/create",
        vec![EndpointCost {
            bucket: "requests_1s".into(),
            weight: 1,
        }],
    )
    .with_endpoint(
        "GET /v5/position/list",
        vec![EndpointCost {
            bucket: "requests_1s".into(),
            weight: 1,
        }],
    )
    // Bybit reports remaining headroom, not used weight.
    .with_header_usage(
        "x-bapi-limit-status",
        "requests_1s",
        HeaderSemantics::Remaining,
    )
}

/// Bitget: per-IP and per-UID request buckets on a 1-second window.
pub fn bitget() -> Throttler {
    Throttler::new(
        ApiCanonical::Bitget,
        vec![
            BucketSpec {
                name: "ip_1s".into(),
                window: Duration::from_secs(1),
                capacity: 20,
            },
            BucketSpec {
                name: "uid_1s".into(),
                window: Duration::from_secs(1),
                capacity: 10,
            },
        ],
    )
    .with_endpoint(
        "POST /api/v2/mix/order/place-order",
        vec![
            EndpointCost {
                bucket: "ip_1s".into(),
                weight: 1,
            },
            EndpointCost {
                bucket: "uid_1s".into(),
                weight: 1,
            },
        ],
    )
    // Generic IETF-draft-style RateLimit headers, scoped to the UID bucket
    // since Bitget's IP bucket has no per-response header equivalent.
    .with_header_usage("ratelimit-remaining", "uid_1s", HeaderSemantics::Remaining)
}

/// KuCoin: resource-pool weight on a 30-second window (simplified from its
/// documented "spot resource pool" model to a single pooled bucket).
pub fn kucoin() -> Throttler {
    Throttler::new(
        ApiCanonical::Kucoin,
        vec![BucketSpec {
            name: "pool_30s".into(),
            window: Duration::from_secs(30),
            capacity: 2000,
        }],
    )
    .with_endpoint(
        "POST /api/v1/orders",
        vec![EndpointCost {
            bucket: "pool_30s".into(),
            weight: 4,
        }],
    )
}

/// Kraken: per-key counter that decays continuously; modelled here as a
/// sliding window over Kraken's documented "Starter" tier call rate.
pub fn kraken() -> Throttler {
    Throttler::new(
        ApiCanonical::Kraken,
        vec![BucketSpec {
            name: "counter".into(),
            window: Duration::from_secs(60),
            capacity: 60,
        }],
    )
    .with_endpoint(
        "POST /0/private/AddOrder",
        vec![EndpointCost {
            bucket: "counter".into(),
            weight: 1,
        }],
    )
}

/// Builds a throttler for every order-placing canonical and registers them
/// in a fresh registry, ready for a single-process deployment where each
/// exchange's dispatcher group is pinned to this one registry.
pub fn registry_with_all_exchanges() -> super::ThrottlerRegistry {
    let registry = super::ThrottlerRegistry::new();
    registry.insert(binance());
    registry.insert(bybit());
    registry.insert(bitget());
    registry.insert(kucoin());
    registry.insert(kraken());
    registry
}
