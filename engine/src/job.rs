//! The three job flavours and the factory registry that turns a stable
//! `step.class` token into a constructed job instance (spec.md §4.3, §4.6,
//! §9 "Polymorphic job loading").
//!
//! Construction never reflects on a host-language path: every concrete job
//! registers itself under the exact string the resolver (§4.5) can produce,
//! and the registry is a plain map from that string to a constructor
//! closure.

use crate::harness::JobContext;
use crate::throttler::Throttler;
use async_trait::async_trait;
use engine_common::JobFault;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Outcome of an atomic job's `computeApiable` phase.
pub type ComputeResult = Result<Option<Value>, JobFault>;

/// A job whose body performs exactly one external effect — typically one
/// exchange API call — or one database mutation (spec.md §4.3 "Atomic
/// job").
#[async_trait]
pub trait AtomicJob: Send + Sync {
    /// `startOrFail`: false skips the step (marked `skipped`, not `failed`)
    /// without running `compute` at all.
    async fn guard(&self, _ctx: &JobContext) -> Result<bool, JobFault> {
        Ok(true)
    }

    /// The body. Runs behind the throttler the job's exchange adapter is
    /// bound to; `ctx.throttler()` is how it gets there.
    async fn compute(&self, ctx: &JobContext) -> ComputeResult;

    /// Optional post-hoc verification that the external side-effect took
    /// hold. `Ok(false)` is promoted to `JobFault::VerificationFailed` by
    /// the harness, not raised here directly.
    async fn double_check(&self, _ctx: &JobContext) -> Result<bool, JobFault> {
        Ok(true)
    }

    /// Optional local finalisation after a successful compute + verify.
    async fn complete(&self, _ctx: &JobContext, _result: &Option<Value>) -> Result<(), JobFault> {
        Ok(())
    }
}

/// A reusable sub-workflow builder. Appends one or more step rows into an
/// existing block starting at `start_index` and returns the next free
/// index; performs no external I/O of its own (spec.md §4.3, §4.6).
#[async_trait]
pub trait LifecycleJob: Send + Sync {
    async fn dispatch(
        &self,
        ctx: &JobContext,
        start_index: i64,
        arguments: &Value,
    ) -> Result<i64, JobFault>;
}

/// A top-level step whose `compute` only creates more steps, typically by
/// invoking one or more Lifecycles in sequence (spec.md §4.3, §4.6).
#[async_trait]
pub trait OrchestratorJob: Send + Sync {
    async fn guard(&self, _ctx: &JobContext) -> Result<bool, JobFault> {
        Ok(true)
    }

    async fn compute(&self, ctx: &JobContext) -> Result<(), JobFault>;
}

/// The concrete dispatch surface a registered class provides. The harness
/// branches once on this (spec.md §9 "Dynamic dispatch -> tagged
/// variants") rather than probing with `dyn Any` downcasts.
pub enum JobKind {
    Atomic(Arc<dyn AtomicJob>),
    Lifecycle(Arc<dyn LifecycleJob>),
    Orchestrator(Arc<dyn OrchestratorJob>),
}

type Factory = Arc<dyn Fn(&Value) -> JobKind + Send + Sync>;

/// Maps a stable `step.class` string to a constructor. Concrete jobs
/// register themselves here at startup; `step.class` is the key, never a
/// host-language path (spec.md §9).
#[derive(Default, Clone)]
pub struct JobRegistry {
    factories: HashMap<String, Factory>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, class: &str, factory: F)
    where
        F: Fn(&Value) -> JobKind + Send + Sync + 'static,
    {
        self.factories.insert(class.to_string(), Arc::new(factory));
    }

    /// Constructs the job for `class`, feeding it `arguments` (spec.md §4.3
    /// "Construct": instantiate the job class from `class` and
    /// `arguments`).
    pub fn construct(&self, class: &str, arguments: &Value) -> Option<JobKind> {
        self.factories.get(class).map(|f| f(arguments))
    }

    pub fn contains(&self, class: &str) -> bool {
        self.factories.contains_key(class)
    }
}

/// Convenience helper used by throttled jobs to acquire a permit before
/// issuing the external call their compute phase models.
pub async fn acquire_permit(throttler: &Throttler, endpoint_signature: &str) {
    let _ = throttler.acquire(endpoint_signature).await;
}
