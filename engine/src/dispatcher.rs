//! The dispatcher loop and group scheduler (spec.md §4.2).
//!
//! One `Dispatcher` is pinned to a single named group/queue. An external
//! coordinator is expected to enqueue one `ProcessGroupTick(group)` per
//! group per cadence (spec.md §6); here that coordinator is folded into
//! `Dispatcher::run`, which drives its own non-overlapping tick loop since
//! this engine is a single process rather than a distributed job queue.

use crate::harness::{self, JobContext};
use crate::job::JobRegistry;
use crate::resolver::Resolver;
use crate::step::Step;
use crate::store::{StepStore, StoreError, StoreResult};
use crate::throttler::ThrottlerRegistry;
use engine_common::{ApiCanonical, JobFault};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Resolves which exchange canonical (if any) a step's account trades on.
/// Supplied by the domain crate at startup; the dispatcher only needs the
/// answer to pick a throttler, never the account row itself.
pub trait AccountCanonicalLookup: Send + Sync {
    fn canonical_for(&self, step: &Step) -> Option<ApiCanonical>;
}

/// A lookup that never resolves an account (used for single-exchange
/// deployments, or wherever every step's throttler is picked some other
/// way).
pub struct NoCanonicalLookup;

impl AccountCanonicalLookup for NoCanonicalLookup {
    fn canonical_for(&self, _step: &Step) -> Option<ApiCanonical> {
        None
    }
}

pub struct Dispatcher {
    group: String,
    batch_size: u32,
    tick_budget: Duration,
    store: Arc<dyn StepStore>,
    registry: Arc<JobRegistry>,
    throttlers: Arc<ThrottlerRegistry>,
    resolver: Arc<Resolver>,
    canonical_lookup: Arc<dyn AccountCanonicalLookup>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        group: impl Into<String>,
        store: Arc<dyn StepStore>,
        registry: Arc<JobRegistry>,
        throttlers: Arc<ThrottlerRegistry>,
        resolver: Arc<Resolver>,
        canonical_lookup: Arc<dyn AccountCanonicalLookup>,
    ) -> Self {
        Self {
            group: group.into(),
            batch_size: engine_common::config::DEFAULT_BATCH_SIZE,
            tick_budget: Duration::from_secs(engine_common::config::DEFAULT_TICK_BUDGET_SECONDS),
            store,
            registry,
            throttlers,
            resolver,
            canonical_lookup,
        }
    }

    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size.min(engine_common::config::MAX_BATCH_SIZE);
        self
    }

    /// Drives `ProcessGroupTick(group)` forever on a fixed cadence. Ticks
    /// never overlap: the next tick is only scheduled once the previous one
    /// (including everything it claimed) has returned (spec.md §4.2).
    pub async fn run(self, tick_interval: Duration, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(tick_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.tick().await {
                        warn!("dispatcher.tick.error group={} error={}", self.group, err);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("dispatcher.shutdown group={}", self.group);
                        return;
                    }
                }
            }
        }
    }

    /// One `ProcessGroupTick(group)` (spec.md §4.2): select a batch, claim
    /// each candidate, and either resolve it as a parent or hand it to the
    /// job harness, until the batch drains or the tick's time budget runs
    /// out.
    pub async fn tick(&self) -> StoreResult<()> {
        let started = Instant::now();
        let candidates = self.store.select_ready(&self.group, self.batch_size).await?;
        debug!(
            "dispatcher.tick.batch group={} candidates={}",
            self.group,
            candidates.len()
        );

        for step in candidates {
            if started.elapsed() >= self.tick_budget {
                debug!("dispatcher.tick.budget_exhausted group={}", self.group);
                break;
            }

            if let Some(child_block_uuid) = step.child_block_uuid {
                self.resolve_parent(step, child_block_uuid).await?;
            } else {
                self.run_leaf(step).await?;
            }
        }

        Ok(())
    }

    /// A parent step never runs its own body a second time (spec.md §4.2):
    /// once every child is terminal, it is either completed or failed with
    /// `child_failure` directly.
    async fn resolve_parent(
        &self,
        step: Step,
        child_block_uuid: engine_common::BlockUuid,
    ) -> StoreResult<()> {
        let status = self.store.children_status(child_block_uuid).await?;
        if !status.all_terminal() {
            debug!(
                "dispatcher.parent.waiting step_id={} non_terminal={}",
                step.id, status.non_terminal
            );
            return Ok(());
        }

        let claimed = match self.store.claim(step.id).await {
            Ok(claimed) => claimed,
            Err(_) => return Ok(()), // another worker got here first
        };

        if status.any_failed() {
            let ctx = self.context_for(claimed);
            harness::apply_fault(&ctx, JobFault::ChildFailure).await?;
        } else {
            info!("dispatcher.parent.completed step_id={}", claimed.id);
            // A lost guard here means the parent was cancelled between the
            // claim above and this write; that cancellation wins and is not
            // a tick failure (spec.md §8.8).
            match self.store.mark_complete(claimed.id, None).await {
                Ok(_) | Err(StoreError::TransitionConflict(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    async fn run_leaf(&self, step: Step) -> StoreResult<()> {
        let claimed = match self.store.claim(step.id).await {
            Ok(claimed) => claimed,
            Err(_) => return Ok(()),
        };
        let ctx = self.context_for(claimed);
        harness::run(&self.registry, ctx).await?;
        Ok(())
    }

    fn context_for(&self, step: Step) -> JobContext {
        let canonical = self.canonical_lookup.canonical_for(&step);
        JobContext {
            step,
            store: self.store.clone(),
            throttlers: self.throttlers.clone(),
            resolver: self.resolver.clone(),
            canonical,
        }
    }
}
