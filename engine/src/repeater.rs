//! Repeater API: a retry scheduler for periodic/idempotent work that lives
//! outside the step graph (spec.md §6, GLOSSARY "Repeater").
//!
//! A repeater row carries a class, parameters, and its own attempt/backoff
//! bookkeeping. The processor instantiates the class, invokes it, and
//! branches on the boolean result: `true` calls `passed()` and deletes the
//! row; `false` with attempts remaining calls `failed()` and reschedules;
//! `false` at the attempt cap calls `maxAttemptsReached()` and deletes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RepeaterId(pub i64);

impl std::fmt::Display for RepeaterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "repeater#{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct RepeaterRow {
    pub id: RepeaterId,
    pub class: String,
    pub parameters: Value,
    pub attempts: u32,
    pub max_attempts: u32,
    pub backoff_seconds: u64,
    pub next_run_at: DateTime<Utc>,
}

/// A repeatable unit of work outside the step graph. `invoke` returns
/// `Ok(true)` on success, `Ok(false)` on a retryable miss; an `Err` is
/// treated the same as `Ok(false)` but logged at a higher severity.
#[async_trait]
pub trait RepeaterJob: Send + Sync {
    async fn invoke(&self, parameters: &Value) -> anyhow::Result<bool>;

    async fn passed(&self, _parameters: &Value) {}
    async fn failed(&self, _parameters: &Value, _attempts: u32) {}
    async fn max_attempts_reached(&self, _parameters: &Value) {}
}

type RepeaterFactory = Arc<dyn Fn(&Value) -> Arc<dyn RepeaterJob> + Send + Sync>;

#[derive(Default, Clone)]
pub struct RepeaterRegistry {
    factories: DashMap<String, RepeaterFactory>,
}

impl RepeaterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, class: &str, factory: F)
    where
        F: Fn(&Value) -> Arc<dyn RepeaterJob> + Send + Sync + 'static,
    {
        self.factories.insert(class.to_string(), Arc::new(factory));
    }

    fn construct(&self, class: &str, parameters: &Value) -> Option<Arc<dyn RepeaterJob>> {
        self.factories.get(class).map(|f| f(parameters))
    }
}

#[derive(Debug, Error)]
pub enum RepeaterStoreError {
    #[error("repeater {0} not found")]
    NotFound(RepeaterId),
}

/// An in-process repeater table. A durable implementation would mirror
/// `store::postgres` with the same state-guarded-update discipline; this
/// one is sufficient for a single-process deployment and for tests.
#[derive(Default)]
pub struct MemoryRepeaterStore {
    rows: DashMap<RepeaterId, RepeaterRow>,
    next_id: AtomicI64,
}

impl MemoryRepeaterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(
        &self,
        class: impl Into<String>,
        parameters: Value,
        max_attempts: u32,
        backoff_seconds: u64,
    ) -> RepeaterId {
        let id = RepeaterId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.rows.insert(
            id,
            RepeaterRow {
                id,
                class: class.into(),
                parameters,
                attempts: 0,
                max_attempts,
                backoff_seconds,
                next_run_at: Utc::now(),
            },
        );
        id
    }

    pub fn due(&self) -> Vec<RepeaterRow> {
        let now = Utc::now();
        self.rows
            .iter()
            .filter(|e| e.value().next_run_at <= now)
            .map(|e| e.value().clone())
            .collect()
    }

    fn delete(&self, id: RepeaterId) {
        self.rows.remove(&id);
    }

    fn reschedule(&self, id: RepeaterId, attempts: u32, next_run_at: DateTime<Utc>) {
        if let Some(mut row) = self.rows.get_mut(&id) {
            row.attempts = attempts;
            row.next_run_at = next_run_at;
        }
    }

    pub fn get(&self, id: RepeaterId) -> Result<RepeaterRow, RepeaterStoreError> {
        self.rows
            .get(&id)
            .map(|r| r.value().clone())
            .ok_or(RepeaterStoreError::NotFound(id))
    }
}

/// Processes one due repeater row to completion (one invocation attempt).
pub async fn process_one(
    store: &MemoryRepeaterStore,
    registry: &RepeaterRegistry,
    row: RepeaterRow,
) {
    let job = match registry.construct(&row.class, &row.parameters) {
        Some(job) => job,
        None => {
            log::warn!("repeater.unregistered_class class={}", row.class);
            store.delete(row.id);
            return;
        }
    };

    let outcome = job.invoke(&row.parameters).await;
    let attempts = row.attempts + 1;

    match outcome {
        Ok(true) => {
            job.passed(&row.parameters).await;
            store.delete(row.id);
        }
        Ok(false) if attempts < row.max_attempts => {
            job.failed(&row.parameters, attempts).await;
            let delay = engine_common::exponential_backoff_from(row.backoff_seconds, attempts);
            store.reschedule(row.id, attempts, Utc::now() + delay);
        }
        Ok(false) => {
            job.max_attempts_reached(&row.parameters).await;
            store.delete(row.id);
        }
        Err(err) if attempts < row.max_attempts => {
            log::warn!("repeater.invoke_error class={} error={}", row.class, err);
            job.failed(&row.parameters, attempts).await;
            let delay = engine_common::exponential_backoff_from(row.backoff_seconds, attempts);
            store.reschedule(row.id, attempts, Utc::now() + delay);
        }
        Err(err) => {
            log::warn!(
                "repeater.invoke_error.exhausted class={} error={}",
                row.class,
                err
            );
            job.max_attempts_reached(&row.parameters).await;
            store.delete(row.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    struct FlakyJob {
        succeed_on_attempt: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RepeaterJob for FlakyJob {
        async fn invoke(&self, _parameters: &Value) -> anyhow::Result<bool> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(call >= self.succeed_on_attempt)
        }
    }

    #[tokio::test]
    async fn retries_until_success_then_deletes() {
        let store = MemoryRepeaterStore::new();
        let registry = RepeaterRegistry::new();
        registry.register("flaky", |_| {
            Arc::new(FlakyJob {
                succeed_on_attempt: 2,
                calls: AtomicUsize::new(0),
            })
        });
        let id = store.schedule("flaky", Value::Null, 5, 0);

        let row = store.get(id).unwrap();
        process_one(&store, &registry, row).await;
        assert!(store.get(id).is_ok(), "still scheduled after one failure");

        let row = store.get(id).unwrap();
        assert_eq!(row.attempts, 1);
        process_one(&store, &registry, row).await;
        assert!(
            store.get(id).is_err(),
            "deleted once invoke returns true"
        );
    }

    struct AlwaysFails;

    #[async_trait]
    impl RepeaterJob for AlwaysFails {
        async fn invoke(&self, _parameters: &Value) -> anyhow::Result<bool> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn deletes_after_max_attempts_reached() {
        let store = MemoryRepeaterStore::new();
        let registry = RepeaterRegistry::new();
        let reached = Arc::new(Mutex::new(false));
        let reached_clone = reached.clone();
        registry.register("dead", move |_| {
            let _ = &reached_clone;
            Arc::new(AlwaysFails)
        });
        let id = store.schedule("dead", Value::Null, 1, 0);

        let row = store.get(id).unwrap();
        process_one(&store, &registry, row).await;
        assert!(store.get(id).is_err());
    }
}
