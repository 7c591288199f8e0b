//! Exchange snapshot key-value store (spec.md §5 "Shared state").
//!
//! Dedicated atomic steps write the latest account state here — positions,
//! open orders — keyed by `(account_id, canonical_name)`. Every other step
//! reads the latest snapshot read-only; nobody but the writing step mutates
//! a given key, so a plain last-write-wins map is sufficient.

use dashmap::DashMap;
use engine_common::ApiCanonical;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SnapshotKey {
    pub account_id: i64,
    pub canonical: ApiCanonical,
}

impl SnapshotKey {
    pub fn new(account_id: i64, canonical: ApiCanonical) -> Self {
        Self {
            account_id,
            canonical,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Snapshot {
    pub value: Value,
    pub written_at: chrono::DateTime<chrono::Utc>,
}

/// Process-local snapshot cache. Not durable: a restart loses it until the
/// next writer runs, which is acceptable since every snapshot is itself a
/// cache of exchange-side state that can be refetched.
#[derive(Default)]
pub struct SnapshotStore {
    entries: DashMap<SnapshotKey, Snapshot>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&self, key: SnapshotKey, value: Value) {
        self.entries.insert(
            key,
            Snapshot {
                value,
                written_at: chrono::Utc::now(),
            },
        );
    }

    pub fn read(&self, key: SnapshotKey) -> Option<Snapshot> {
        self.entries.get(&key).map(|e| e.value().clone())
    }
}
