//! The step store contract (spec.md §4.1).

pub mod memory;
pub mod postgres;

use crate::step::{NewStep, Step};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use engine_common::{BlockUuid, StepId};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("step {0} not found")]
    NotFound(StepId),

    /// `claim` lost the race: the step's state changed between the
    /// `selectReady` read and the attempted transition. The dispatcher must
    /// retry with the next candidate (spec.md §4.1).
    #[error("step {0} could not be claimed: state changed concurrently")]
    ClaimConflict(StepId),

    /// A completion transition (`mark_complete`/`mark_failed`/
    /// `mark_retrying`/`mark_skipped`/`mark_cancelled`) lost its state
    /// precondition: the row no longer satisfies the guard the transition
    /// requires (most commonly, a running step was concurrently cancelled).
    /// Callers must not act on the result they were about to write — the
    /// row's *actual* current state (fetched separately) is authoritative
    /// (spec.md §4.2 "the harness checks state before committing results",
    /// §8.8 cancellation safety).
    #[error("step {0} could not be transitioned: state precondition no longer holds")]
    TransitionConflict(StepId),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Aggregate counts used by parent completion (spec.md §3 invariant 2, §4.2).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChildrenStatus {
    pub total: u64,
    pub terminal: u64,
    pub non_terminal: u64,
    pub failed: u64,
}

impl ChildrenStatus {
    pub fn all_terminal(&self) -> bool {
        self.non_terminal == 0
    }

    pub fn any_failed(&self) -> bool {
        self.failed > 0
    }
}

/// The durable table of steps. Every transition here must be a single
/// state-guarded update; no in-memory cache of step state is authoritative
/// (spec.md §4.1 "Concurrency").
#[async_trait]
pub trait StepStore: Send + Sync {
    async fn create(&self, step: NewStep) -> StoreResult<Step>;

    /// Rows eligible to run: state in {pending, retrying}; `next_run_at`
    /// null or `<= now`; `queue = group`; and no non-terminal sibling at a
    /// strictly smaller index in the same block (spec.md §4.1).
    async fn select_ready(&self, group: &str, limit: u32) -> StoreResult<Vec<Step>>;

    /// Atomically transition pending/retrying -> running, set `started_at`,
    /// increment `attempts`. Returns `ClaimConflict` if the state already
    /// moved on.
    async fn claim(&self, step_id: StepId) -> StoreResult<Step>;

    /// Guarded by `state = 'running'`: a step that was concurrently
    /// cancelled or otherwise left `running` no longer satisfies the
    /// precondition, and this returns `TransitionConflict` instead of
    /// resurrecting a terminal row (spec.md §4.1, §8.8).
    async fn mark_complete(&self, step_id: StepId, result: Option<Value>) -> StoreResult<Step>;

    /// Guarded by `state = 'running'`; see `mark_complete`.
    async fn mark_failed(
        &self,
        step_id: StepId,
        error_kind: &str,
        error_message: &str,
    ) -> StoreResult<Step>;

    /// Guarded by `state = 'running'`; see `mark_complete`.
    async fn mark_retrying(
        &self,
        step_id: StepId,
        next_run_at: DateTime<Utc>,
        reason: &str,
    ) -> StoreResult<Step>;

    /// Guarded by `state NOT IN` the terminal set, not `= running`: unlike
    /// the other completion transitions this may be invoked directly
    /// against a step that hasn't been claimed yet (an operator cancelling
    /// a still-pending step).
    async fn mark_cancelled(&self, step_id: StepId) -> StoreResult<Step>;

    /// Guarded by `state = 'running'`; see `mark_complete`.
    async fn mark_skipped(&self, step_id: StepId) -> StoreResult<Step>;

    /// A `resolve-exception` sibling is created `halted` so it is never
    /// picked up by `select_ready` on its own; this transitions it to
    /// `pending` once the orchestrator it compensates has failed (spec.md
    /// §4.3, §4.6). No-op (returns the row unchanged) if it is not halted.
    async fn activate_resolve_exception(&self, step_id: StepId) -> StoreResult<Step>;

    async fn children_status(&self, child_block_uuid: BlockUuid) -> StoreResult<ChildrenStatus>;

    async fn sibling_resolve_exception_step(
        &self,
        block_uuid: BlockUuid,
        excluding: StepId,
    ) -> StoreResult<Option<Step>>;

    async fn get(&self, step_id: StepId) -> StoreResult<Step>;

    /// Every non-terminal step belonging to any of `block_uuids` becomes
    /// `cancelled` (spec.md §4.2 "Cancellation": operator-driven, data only).
    async fn cancel_blocks(&self, block_uuids: &[BlockUuid]) -> StoreResult<u64>;
}
