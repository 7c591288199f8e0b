//! Property-based tests for the universal invariants in spec.md §8.
//!
//! Mirrors the teacher's `daemon/tests/property_tests.rs`: plain
//! `proptest!` blocks asserting invariants across randomly generated
//! inputs, rather than hand-picked example cases. The step store is async,
//! so each property drives a small `tokio` current-thread runtime inline.

use proptest::prelude::*;
use trading_engine::store::memory::MemoryStepStore;
use trading_engine::store::StepStore;
use trading_engine::throttler::bucket::{BucketSpec, BucketState};
use trading_engine::{NewStep, StepState};
use engine_common::BlockUuid;
use std::time::{Duration, Instant};

fn block_on<F: std::future::Future>(fut: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(fut)
}

proptest! {
    /// Index barrier (spec.md §8.1): whatever combination of indices a
    /// block's steps are created with, `select_ready` (and therefore
    /// anything the dispatcher can claim) only ever returns steps sitting
    /// at the block's minimum non-terminal index.
    #[test]
    fn index_barrier_holds_for_arbitrary_index_sets(
        indices in prop::collection::vec(1i64..20, 1..15),
    ) {
        block_on(async {
            let store = MemoryStepStore::new();
            let block = BlockUuid::new();
            let min_index = *indices.iter().min().unwrap();

            for index in &indices {
                store
                    .create(NewStep::new("noop", block, *index).with_queue("q"))
                    .await
                    .unwrap();
            }

            let ready = store.select_ready("q", 64).await.unwrap();
            prop_assert!(ready.iter().all(|s| s.index == min_index));
            prop_assert_eq!(
                ready.len(),
                indices.iter().filter(|i| **i == min_index).count()
            );
        });
    }

    /// Retry non-regression (spec.md §8.3): across any sequence of
    /// claim/retry cycles, `attempts` never decreases and a terminal state
    /// is never left once entered.
    #[test]
    fn attempts_are_monotonic_across_retry_cycles(cycles in 1u32..8) {
        block_on(async {
            let store = MemoryStepStore::new();
            let block = BlockUuid::new();
            let step = store
                .create(NewStep::new("noop", block, 1).with_queue("q"))
                .await
                .unwrap();

            let mut last_attempts = 0u32;
            for cycle in 0..cycles {
                let claimed = store.claim(step.id).await.unwrap();
                prop_assert!(claimed.attempts >= last_attempts);
                last_attempts = claimed.attempts;

                if cycle + 1 == cycles {
                    let finished = store.mark_complete(step.id, None).await.unwrap();
                    prop_assert_eq!(finished.state, StepState::Completed);
                } else {
                    store
                        .mark_retrying(step.id, chrono::Utc::now() - chrono::Duration::seconds(1), "retry")
                        .await
                        .unwrap();
                }
            }

            // Once terminal, further claims must fail rather than silently
            // regress the state.
            prop_assert!(store.claim(step.id).await.is_err());
        });
    }

    /// Throttler conservation (spec.md §8.4): however many units are
    /// requested, the sum admitted within the trailing window never
    /// exceeds the bucket's capacity.
    #[test]
    fn throttler_never_admits_more_than_capacity_within_window(
        capacity in 5u64..200,
        weights in prop::collection::vec(1u64..10, 1..100),
    ) {
        let mut bucket = BucketState::new(BucketSpec {
            name: "prop".into(),
            window: Duration::from_secs(60),
            capacity,
        });
        let t0 = Instant::now();
        let mut admitted_sum = 0u64;

        for weight in weights {
            if bucket.wait_for(weight, t0) == Duration::ZERO {
                bucket.admit(weight, t0);
                admitted_sum += weight;
            }
        }

        prop_assert!(bucket.windowed_usage(t0) <= capacity);
        prop_assert!(admitted_sum <= capacity);
    }
}
