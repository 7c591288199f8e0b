//! The job harness: runs a claimed step through its phases in strict order
//! and writes the outcome back to the store (spec.md §4.3).
//!
//! Phase order is fixed: Construct, Guard, AssignExceptionHandler, Compute,
//! DoubleCheck, Complete. Any phase may be a no-op for a concrete job; the
//! harness itself never skips one.

use crate::job::{JobKind, JobRegistry};
use crate::resolver::Resolver;
use crate::step::Step;
use crate::store::{StepStore, StoreError, StoreResult};
use crate::throttler::ThrottlerRegistry;
use chrono::Utc;
use engine_common::{ApiCanonical, JobFault, RetryPolicy};
use log::{info, warn};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

/// Everything a job body needs to reach the outside world: the store (to
/// emit child steps), the throttler registry (to gate external calls), and
/// the resolver (so a Lifecycle's emitted steps carry the resolved class).
/// Constructed fresh per step execution; cheap, as everything inside is an
/// `Arc`.
#[derive(Clone)]
pub struct JobContext {
    pub step: Step,
    pub store: Arc<dyn StepStore>,
    pub throttlers: Arc<ThrottlerRegistry>,
    pub resolver: Arc<Resolver>,
    /// The exchange canonical the step's account trades on, if any
    /// (market-data-only jobs may have none).
    pub canonical: Option<ApiCanonical>,
}

impl JobContext {
    pub fn throttler(&self) -> Option<Arc<crate::throttler::Throttler>> {
        self.canonical.and_then(|c| self.throttlers.get(c))
    }

    /// Resolves `default_class` against this step's account canonical, or
    /// returns it unchanged if the step has no associated exchange.
    pub fn resolve_class(&self, default_class: &str) -> String {
        match self.canonical {
            Some(canonical) => self.resolver.resolve(default_class, canonical),
            None => default_class.to_string(),
        }
    }
}

/// Per-step wall-clock ceiling; a body that runs longer than this is treated
/// as a retryable timeout (spec.md §5 "Cancellation & timeouts").
pub fn step_timeout() -> Duration {
    Duration::from_secs(engine_common::config::DEFAULT_STEP_TIMEOUT_SECONDS)
}

/// Runs a freshly-claimed step to completion (of one attempt) and persists
/// the resulting transition. Returns the step's row as last written.
pub async fn run(
    registry: &JobRegistry,
    ctx: JobContext,
) -> StoreResult<Step> {
    let step_id = ctx.step.id;
    let class = ctx.step.class.clone();

    let kind = match registry.construct(&class, &ctx.step.arguments) {
        Some(kind) => kind,
        None => {
            warn!(
                "step.unregistered_class step_id={} class={}",
                step_id, class
            );
            return apply_fault(
                &ctx,
                JobFault::Permanent(format!("no job class registered for '{class}'")),
            )
            .await;
        }
    };

    let outcome = tokio::time::timeout(step_timeout(), execute(&kind, &ctx)).await;

    let result = match outcome {
        Ok(inner) => inner,
        Err(_) => Err(JobFault::Retryable(format!(
            "step {step_id} exceeded its {}s timeout",
            step_timeout().as_secs()
        ))),
    };

    match result {
        Ok(Outcome::Skipped) => {
            info!("step.skipped step_id={} class={}", step_id, class);
            metrics::counter!("engine_step_skipped_total").increment(1);
            settle_conflict(&ctx.store, ctx.store.mark_skipped(step_id).await).await
        }
        Ok(Outcome::Completed(value)) => {
            info!("step.completed step_id={} class={}", step_id, class);
            metrics::counter!("engine_step_completed_total").increment(1);
            settle_conflict(&ctx.store, ctx.store.mark_complete(step_id, value).await).await
        }
        Err(fault) => apply_fault(&ctx, fault).await,
    }
}

/// The step's state precondition may have been lost to a concurrent
/// transition (most commonly an operator cancelling the step mid-run,
/// spec.md §8.8). The harness must not act on its own result in that case
/// — it re-reads the row instead of writing over whatever the race settled
/// on (spec.md §4.2 "the harness checks state before committing results").
async fn settle_conflict(store: &Arc<dyn StepStore>, outcome: StoreResult<Step>) -> StoreResult<Step> {
    match outcome {
        Err(StoreError::TransitionConflict(step_id)) => {
            info!(
                "step.transition.conflict step_id={} (state changed concurrently; discarding this attempt's result)",
                step_id
            );
            store.get(step_id).await
        }
        other => other,
    }
}

enum Outcome {
    Skipped,
    Completed(Option<Value>),
}

async fn execute(kind: &JobKind, ctx: &JobContext) -> Result<Outcome, JobFault> {
    match kind {
        JobKind::Atomic(job) => {
            if !job.guard(ctx).await? {
                return Ok(Outcome::Skipped);
            }
            let result = job.compute(ctx).await?;
            if !job.double_check(ctx).await? {
                return Err(JobFault::VerificationFailed(format!(
                    "step {} failed post-compute verification",
                    ctx.step.id
                )));
            }
            job.complete(ctx, &result).await?;
            Ok(Outcome::Completed(result))
        }
        JobKind::Lifecycle(lifecycle) => {
            let next_index = lifecycle
                .dispatch(ctx, ctx.step.index, &ctx.step.arguments)
                .await?;
            Ok(Outcome::Completed(Some(json!({ "next_index": next_index }))))
        }
        JobKind::Orchestrator(orchestrator) => {
            if !orchestrator.guard(ctx).await? {
                return Ok(Outcome::Skipped);
            }
            orchestrator.compute(ctx).await?;
            Ok(Outcome::Completed(None))
        }
    }
}

/// Classifies a thrown fault and performs the corresponding store
/// transition (spec.md §4.3 "Failure paths", §7). `VerificationFailed` is
/// capped independently of the step's own `max_attempts`
/// (`DEFAULT_VERIFICATION_MAX_ATTEMPTS`); every other retryable path uses
/// the step's own cap.
pub(crate) async fn apply_fault(ctx: &JobContext, fault: JobFault) -> StoreResult<Step> {
    let step = &ctx.step;
    let notifiable = fault.is_notifiable();
    let step_result = match fault.underlying() {
        JobFault::Retryable(message) => retry_or_fail(ctx, message, step.max_attempts).await?,
        JobFault::VerificationFailed(message) => {
            retry_or_fail(
                ctx,
                message,
                engine_common::config::DEFAULT_VERIFICATION_MAX_ATTEMPTS,
            )
            .await?
        }
        JobFault::Permanent(message) => fail_and_wake_compensator(ctx, message).await?,
        JobFault::JustResolve(message) => fail_and_wake_compensator(ctx, message).await?,
        JobFault::Ignorable(message) => {
            settle_conflict(
                &ctx.store,
                ctx.store
                    .mark_complete(step.id, Some(json!({ "ignorable": message })))
                    .await,
            )
            .await?
        }
        JobFault::JustEnd(_message) => {
            settle_conflict(&ctx.store, ctx.store.mark_complete(step.id, None).await).await?
        }
        // ChildFailure is synthesized by the dispatcher from childrenStatus,
        // never raised by a job body, but the classification still applies
        // if a body somehow returns it directly.
        JobFault::ChildFailure => {
            fail_and_wake_compensator(ctx, "a child step failed terminally").await?
        }
        // `underlying()` already recurses through NonNotifiable wrapping,
        // so this arm is unreachable; kept only for match exhaustiveness.
        JobFault::NonNotifiable(_) => unreachable!("underlying() unwraps NonNotifiable"),
    };

    if step_result.state == crate::step::StepState::Failed && notifiable {
        warn!(
            "step.failed.notify step_id={} class={} error={}",
            step.id,
            step.class,
            step_result.last_error.as_deref().unwrap_or("")
        );
    }

    Ok(step_result)
}

async fn retry_or_fail(ctx: &JobContext, message: &str, cap: u32) -> StoreResult<Step> {
    let step = &ctx.step;
    if step.attempts >= cap {
        metrics::counter!("engine_step_failed_total").increment(1);
        settle_conflict(
            &ctx.store,
            ctx.store
                .mark_failed(step.id, "retryable_exhausted", message)
                .await,
        )
        .await
    } else {
        let policy = RetryPolicy {
            initial_backoff_seconds: step.backoff_seconds,
            ..RetryPolicy::default()
        };
        let delay = policy.next_delay(step.attempts);
        let next_run_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(0));
        metrics::counter!("engine_step_retrying_total").increment(1);
        settle_conflict(
            &ctx.store,
            ctx.store.mark_retrying(step.id, next_run_at, message).await,
        )
        .await
    }
}

/// Fails the step, then wakes its compensator. If the fail transition lost
/// its state guard (the step was concurrently cancelled), the compensator
/// must not be woken either: the fault never actually took effect.
async fn fail_and_wake_compensator(ctx: &JobContext, message: &str) -> StoreResult<Step> {
    let outcome = ctx.store.mark_failed(ctx.step.id, "permanent", message).await;
    let step = match outcome {
        Err(StoreError::TransitionConflict(step_id)) => {
            info!(
                "step.transition.conflict step_id={} (state changed concurrently; compensator not woken)",
                step_id
            );
            return ctx.store.get(step_id).await;
        }
        other => other?,
    };
    metrics::counter!("engine_step_failed_total").increment(1);
    if let Some(sibling) = ctx
        .store
        .sibling_resolve_exception_step(step.block_uuid, step.id)
        .await?
    {
        info!(
            "step.compensator.activated step_id={} sibling_id={}",
            step.id, sibling.id
        );
        ctx.store.activate_resolve_exception(sibling.id).await?;
    }
    Ok(step)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{AtomicJob, ComputeResult, JobKind, JobRegistry};
    use crate::step::{NewStep, StepState};
    use crate::store::memory::MemoryStepStore;
    use crate::store::StepStore;
    use crate::throttler::ThrottlerRegistry;
    use async_trait::async_trait;
    use engine_common::BlockUuid;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn ctx_for(store: Arc<dyn StepStore>, step: Step) -> JobContext {
        JobContext {
            step,
            store,
            throttlers: Arc::new(ThrottlerRegistry::new()),
            resolver: Arc::new(Resolver::new()),
            canonical: None,
        }
    }

    /// Fails retryable on attempts 1 and 2, succeeds on attempt 3 (spec.md
    /// §8 scenario S3).
    struct FlakyThenOk {
        calls: AtomicU32,
    }

    #[async_trait]
    impl AtomicJob for FlakyThenOk {
        async fn compute(&self, _ctx: &JobContext) -> ComputeResult {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 {
                Err(JobFault::Retryable(format!("transient failure #{n}")))
            } else {
                Ok(None)
            }
        }
    }

    #[tokio::test]
    async fn s3_retry_then_succeed_with_backoff() {
        let store: Arc<dyn StepStore> = Arc::new(MemoryStepStore::new());
        let block = BlockUuid::new();
        let mut registry = JobRegistry::new();
        registry.register("flaky", |_| {
            JobKind::Atomic(Arc::new(FlakyThenOk {
                calls: AtomicU32::new(0),
            }))
        });

        let step = store
            .create(
                NewStep::new("flaky", block, 1)
                    .with_queue("orders")
                    .with_arguments(Value::Null),
            )
            .await
            .unwrap();

        // Attempt 1: retryable, schedules next_run_at ~= now + backoff_seconds.
        let claimed = store.claim(step.id).await.unwrap();
        let before = Utc::now();
        let after_attempt_1 = run(&registry, ctx_for(store.clone(), claimed)).await.unwrap();
        assert_eq!(after_attempt_1.state, StepState::Retrying);
        assert_eq!(after_attempt_1.attempts, 1);
        let delay_1 = after_attempt_1.next_run_at.unwrap() - before;
        assert!(delay_1.num_seconds() >= 9 && delay_1.num_seconds() <= 11);

        // Force it claimable now rather than waiting out the real backoff.
        let claimed = store.claim(step.id).await.unwrap();
        let before = Utc::now();
        let after_attempt_2 = run(&registry, ctx_for(store.clone(), claimed)).await.unwrap();
        assert_eq!(after_attempt_2.state, StepState::Retrying);
        assert_eq!(after_attempt_2.attempts, 2);
        let delay_2 = after_attempt_2.next_run_at.unwrap() - before;
        assert!(delay_2.num_seconds() >= 19 && delay_2.num_seconds() <= 21);

        let claimed = store.claim(step.id).await.unwrap();
        let final_step = run(&registry, ctx_for(store.clone(), claimed)).await.unwrap();
        assert_eq!(final_step.state, StepState::Completed);
        assert_eq!(final_step.attempts, 3);
    }

    struct AlwaysRetryable;

    #[async_trait]
    impl AtomicJob for AlwaysRetryable {
        async fn compute(&self, _ctx: &JobContext) -> ComputeResult {
            Err(JobFault::Retryable("still down".into()))
        }
    }

    #[tokio::test]
    async fn exhausting_max_attempts_upgrades_to_failed() {
        let store: Arc<dyn StepStore> = Arc::new(MemoryStepStore::new());
        let block = BlockUuid::new();
        let mut registry = JobRegistry::new();
        registry.register("down", |_| JobKind::Atomic(Arc::new(AlwaysRetryable)));

        let step = store
            .create(
                NewStep::new("down", block, 1)
                    .with_queue("orders")
                    .with_arguments(Value::Null),
            )
            .await
            .unwrap();
        // max_attempts defaults to DEFAULT_MAX_ATTEMPTS (5); step.attempts
        // starts at 0 and is incremented by `claim` on each attempt.
        let mut last = step.clone();
        for _ in 0..engine_common::config::DEFAULT_MAX_ATTEMPTS {
            let claimed = store.claim(last.id).await.unwrap();
            last = run(&registry, ctx_for(store.clone(), claimed)).await.unwrap();
        }
        assert_eq!(last.state, StepState::Failed);
    }

    struct AlwaysIgnorable;

    #[async_trait]
    impl AtomicJob for AlwaysIgnorable {
        async fn compute(&self, _ctx: &JobContext) -> ComputeResult {
            Err(JobFault::Ignorable("already cancelled".into()))
        }
    }

    #[tokio::test]
    async fn ignorable_fault_completes_with_last_error_recorded() {
        let store: Arc<dyn StepStore> = Arc::new(MemoryStepStore::new());
        let block = BlockUuid::new();
        let mut registry = JobRegistry::new();
        registry.register("idempotent", |_| JobKind::Atomic(Arc::new(AlwaysIgnorable)));
        let step = store
            .create(NewStep::new("idempotent", block, 1).with_queue("orders"))
            .await
            .unwrap();
        let claimed = store.claim(step.id).await.unwrap();
        let result = run(&registry, ctx_for(store.clone(), claimed)).await.unwrap();
        assert_eq!(result.state, StepState::Completed);
    }

    struct AlwaysJustEnd;

    #[async_trait]
    impl AtomicJob for AlwaysJustEnd {
        async fn compute(&self, _ctx: &JobContext) -> ComputeResult {
            Err(JobFault::JustEnd("nothing to do".into()))
        }
    }

    #[tokio::test]
    async fn just_end_completes_without_compensator() {
        let store: Arc<dyn StepStore> = Arc::new(MemoryStepStore::new());
        let block = BlockUuid::new();
        let compensator = store
            .create(
                NewStep::new("compensate", block, 1)
                    .with_queue("orders")
                    .as_resolve_exception(),
            )
            .await
            .unwrap();
        let mut registry = JobRegistry::new();
        registry.register("noop", |_| JobKind::Atomic(Arc::new(AlwaysJustEnd)));
        let step = store
            .create(NewStep::new("noop", block, 1).with_queue("orders"))
            .await
            .unwrap();
        let claimed = store.claim(step.id).await.unwrap();
        let result = run(&registry, ctx_for(store.clone(), claimed)).await.unwrap();
        assert_eq!(result.state, StepState::Completed);
        assert_eq!(
            store.get(compensator.id).await.unwrap().state,
            StepState::Halted,
            "just-end must not wake the compensator"
        );
    }

    struct AlwaysJustResolve;

    #[async_trait]
    impl AtomicJob for AlwaysJustResolve {
        async fn compute(&self, _ctx: &JobContext) -> ComputeResult {
            Err(JobFault::JustResolve("give up, fire compensator".into()))
        }
    }

    #[tokio::test]
    async fn just_resolve_fails_and_wakes_compensator() {
        let store: Arc<dyn StepStore> = Arc::new(MemoryStepStore::new());
        let block = BlockUuid::new();
        let compensator = store
            .create(
                NewStep::new("compensate", block, 1)
                    .with_queue("orders")
                    .as_resolve_exception(),
            )
            .await
            .unwrap();
        let mut registry = JobRegistry::new();
        registry.register("giveup", |_| JobKind::Atomic(Arc::new(AlwaysJustResolve)));
        let step = store
            .create(NewStep::new("giveup", block, 1).with_queue("orders"))
            .await
            .unwrap();
        let claimed = store.claim(step.id).await.unwrap();
        let result = run(&registry, ctx_for(store.clone(), claimed)).await.unwrap();
        assert_eq!(result.state, StepState::Failed);
        assert_eq!(
            store.get(compensator.id).await.unwrap().state,
            StepState::Pending
        );
    }

    struct AlwaysFailsVerification;

    #[async_trait]
    impl AtomicJob for AlwaysFailsVerification {
        async fn compute(&self, _ctx: &JobContext) -> ComputeResult {
            Ok(None)
        }

        async fn double_check(&self, _ctx: &JobContext) -> Result<bool, JobFault> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn verification_failure_is_capped_independent_of_max_attempts() {
        let store: Arc<dyn StepStore> = Arc::new(MemoryStepStore::new());
        let block = BlockUuid::new();
        let mut registry = JobRegistry::new();
        registry.register("unverifiable", |_| {
            JobKind::Atomic(Arc::new(AlwaysFailsVerification))
        });
        // max_attempts is generous; verification's own cap must still bind.
        let step = store
            .create(
                NewStep::new("unverifiable", block, 1)
                    .with_queue("orders")
                    .with_max_attempts(100),
            )
            .await
            .unwrap();

        let mut last = step.clone();
        for _ in 0..engine_common::config::DEFAULT_VERIFICATION_MAX_ATTEMPTS {
            let claimed = store.claim(last.id).await.unwrap();
            last = run(&registry, ctx_for(store.clone(), claimed)).await.unwrap();
        }
        assert_eq!(last.state, StepState::Failed);
    }

    struct GuardsFalse;

    #[async_trait]
    impl AtomicJob for GuardsFalse {
        async fn guard(&self, _ctx: &JobContext) -> Result<bool, JobFault> {
            Ok(false)
        }

        async fn compute(&self, _ctx: &JobContext) -> ComputeResult {
            panic!("compute must not run when the guard returns false");
        }
    }

    struct AlwaysOk;

    #[async_trait]
    impl AtomicJob for AlwaysOk {
        async fn compute(&self, _ctx: &JobContext) -> ComputeResult {
            Ok(None)
        }
    }

    /// Cancellation safety (spec.md §8.8): a step cancelled while a harness
    /// still holds the claimed row must not be resurrected to `completed`
    /// once that harness's attempt finishes.
    #[tokio::test]
    async fn concurrent_cancellation_wins_over_the_harness_result() {
        let store: Arc<dyn StepStore> = Arc::new(MemoryStepStore::new());
        let block = BlockUuid::new();
        let mut registry = JobRegistry::new();
        registry.register("ok", |_| JobKind::Atomic(Arc::new(AlwaysOk)));
        let step = store
            .create(NewStep::new("ok", block, 1).with_queue("orders"))
            .await
            .unwrap();

        let claimed = store.claim(step.id).await.unwrap();
        // Simulates an operator cancelling the block while the step is
        // still running, before the harness writes its own outcome.
        store.mark_cancelled(step.id).await.unwrap();

        let result = run(&registry, ctx_for(store.clone(), claimed)).await.unwrap();
        assert_eq!(
            result.state,
            StepState::Cancelled,
            "the harness must yield to the concurrent cancellation, not overwrite it"
        );
        assert_eq!(store.get(step.id).await.unwrap().state, StepState::Cancelled);
    }

    #[tokio::test]
    async fn skip_idempotence_guard_false_has_no_side_effects() {
        let store: Arc<dyn StepStore> = Arc::new(MemoryStepStore::new());
        let block = BlockUuid::new();
        let mut registry = JobRegistry::new();
        registry.register("guarded", |_| JobKind::Atomic(Arc::new(GuardsFalse)));
        let step = store
            .create(NewStep::new("guarded", block, 1).with_queue("orders"))
            .await
            .unwrap();
        let claimed = store.claim(step.id).await.unwrap();
        let result = run(&registry, ctx_for(store.clone(), claimed)).await.unwrap();
        assert_eq!(result.state, StepState::Skipped);
    }
}
