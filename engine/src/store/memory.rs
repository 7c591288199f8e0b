//! An in-process step store used by tests and by the single-process
//! quick-start path. It implements the same state-guarded transition
//! contract as the Postgres store (spec.md §4.1); the only simplification
//! is that the "row lock" is a `DashMap` shard lock instead of `SELECT ...
//! FOR UPDATE SKIP LOCKED`.

use super::{ChildrenStatus, StepStore, StoreError, StoreResult};
use crate::step::{NewStep, Step, StepState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use engine_common::{BlockUuid, StepId};
use serde_json::Value;
use std::sync::atomic::{AtomicI64, Ordering};

pub struct MemoryStepStore {
    steps: DashMap<StepId, Step>,
    next_id: AtomicI64,
}

impl Default for MemoryStepStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStepStore {
    pub fn new() -> Self {
        Self {
            steps: DashMap::new(),
            next_id: AtomicI64::new(1),
        }
    }

    /// True if any step sharing `block_uuid` has a non-terminal state with
    /// `index` strictly smaller than `index`.
    fn blocked_by_earlier_index(&self, block_uuid: BlockUuid, index: i64) -> bool {
        self.steps.iter().any(|entry| {
            let s = entry.value();
            s.block_uuid.0 == block_uuid.0 && s.index < index && !s.state.is_terminal()
        })
    }
}

#[async_trait]
impl StepStore for MemoryStepStore {
    async fn create(&self, new_step: NewStep) -> StoreResult<Step> {
        let id = StepId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let now = Utc::now();
        // A resolve-exception sibling sits out of selectReady until its
        // orchestrator fails (spec.md §4.3, §4.6): it starts halted.
        let initial_state = match new_step.step_type {
            crate::step::StepType::ResolveException => StepState::Halted,
            crate::step::StepType::Normal => StepState::Pending,
        };
        let step = Step {
            id,
            class: new_step.class,
            arguments: new_step.arguments,
            block_uuid: new_step.block_uuid,
            index: new_step.index,
            child_block_uuid: new_step.child_block_uuid,
            workflow_id: new_step.workflow_id,
            step_type: new_step.step_type,
            state: initial_state,
            queue: new_step.queue,
            attempts: 0,
            max_attempts: new_step
                .max_attempts
                .unwrap_or(engine_common::config::DEFAULT_MAX_ATTEMPTS),
            backoff_seconds: new_step
                .backoff_seconds
                .unwrap_or(engine_common::config::DEFAULT_BACKOFF_SECONDS),
            next_run_at: None,
            last_error: None,
            relatable: new_step.relatable,
            dispatched_at: None,
            started_at: None,
            finished_at: None,
            created_at: now,
            updated_at: now,
        };
        self.steps.insert(id, step.clone());
        Ok(step)
    }

    async fn select_ready(&self, group: &str, limit: u32) -> StoreResult<Vec<Step>> {
        let now = Utc::now();
        let mut candidates: Vec<Step> = self
            .steps
            .iter()
            .map(|e| e.value().clone())
            .filter(|s| {
                s.queue == group
                    && s.state.is_claimable()
                    && s.next_run_at.map(|t| t <= now).unwrap_or(true)
            })
            .filter(|s| !self.blocked_by_earlier_index(s.block_uuid, s.index))
            .collect();

        // Deterministic arrival order within a bucket/group: by id.
        candidates.sort_by_key(|s| s.id.0);
        candidates.truncate(limit as usize);
        Ok(candidates)
    }

    async fn claim(&self, step_id: StepId) -> StoreResult<Step> {
        let mut entry = self
            .steps
            .get_mut(&step_id)
            .ok_or(StoreError::NotFound(step_id))?;
        if !entry.state.is_claimable() {
            return Err(StoreError::ClaimConflict(step_id));
        }
        entry.state = StepState::Running;
        entry.started_at = Some(Utc::now());
        entry.attempts += 1;
        entry.updated_at = Utc::now();
        Ok(entry.clone())
    }

    async fn mark_complete(&self, step_id: StepId, _result: Option<Value>) -> StoreResult<Step> {
        let mut entry = self
            .steps
            .get_mut(&step_id)
            .ok_or(StoreError::NotFound(step_id))?;
        // The `running` guard is load-bearing: without it a step that was
        // concurrently cancelled (spec.md §8.8) would have its terminal
        // `cancelled` row resurrected by a harness finishing an attempt it
        // no longer owns.
        if entry.state != StepState::Running {
            return Err(StoreError::TransitionConflict(step_id));
        }
        entry.state = StepState::Completed;
        entry.finished_at = Some(Utc::now());
        entry.updated_at = Utc::now();
        Ok(entry.clone())
    }

    async fn mark_failed(
        &self,
        step_id: StepId,
        _error_kind: &str,
        error_message: &str,
    ) -> StoreResult<Step> {
        let mut entry = self
            .steps
            .get_mut(&step_id)
            .ok_or(StoreError::NotFound(step_id))?;
        if entry.state != StepState::Running {
            return Err(StoreError::TransitionConflict(step_id));
        }
        entry.state = StepState::Failed;
        entry.last_error = Some(truncate_error(error_message));
        entry.finished_at = Some(Utc::now());
        entry.updated_at = Utc::now();
        Ok(entry.clone())
    }

    async fn mark_retrying(
        &self,
        step_id: StepId,
        next_run_at: DateTime<Utc>,
        reason: &str,
    ) -> StoreResult<Step> {
        let mut entry = self
            .steps
            .get_mut(&step_id)
            .ok_or(StoreError::NotFound(step_id))?;
        if entry.state != StepState::Running {
            return Err(StoreError::TransitionConflict(step_id));
        }
        entry.state = StepState::Retrying;
        entry.next_run_at = Some(next_run_at);
        entry.last_error = Some(truncate_error(reason));
        entry.updated_at = Utc::now();
        Ok(entry.clone())
    }

    async fn mark_cancelled(&self, step_id: StepId) -> StoreResult<Step> {
        let mut entry = self
            .steps
            .get_mut(&step_id)
            .ok_or(StoreError::NotFound(step_id))?;
        // A single-step cancel may target a step that hasn't been claimed
        // yet, so the guard excludes the terminal states rather than
        // requiring `running` (mirrors `cancel_blocks`'s bulk guard).
        if entry.state.is_terminal() {
            return Err(StoreError::TransitionConflict(step_id));
        }
        entry.state = StepState::Cancelled;
        entry.finished_at = Some(Utc::now());
        entry.updated_at = Utc::now();
        Ok(entry.clone())
    }

    async fn mark_skipped(&self, step_id: StepId) -> StoreResult<Step> {
        let mut entry = self
            .steps
            .get_mut(&step_id)
            .ok_or(StoreError::NotFound(step_id))?;
        if entry.state != StepState::Running {
            return Err(StoreError::TransitionConflict(step_id));
        }
        entry.state = StepState::Skipped;
        entry.finished_at = Some(Utc::now());
        entry.updated_at = Utc::now();
        Ok(entry.clone())
    }

    async fn children_status(&self, child_block_uuid: BlockUuid) -> StoreResult<ChildrenStatus> {
        let mut status = ChildrenStatus::default();
        for entry in self.steps.iter() {
            let s = entry.value();
            if s.block_uuid.0 != child_block_uuid.0 {
                continue;
            }
            status.total += 1;
            if s.state.is_terminal() {
                status.terminal += 1;
                if matches!(s.state, StepState::Failed) {
                    status.failed += 1;
                }
            } else {
                status.non_terminal += 1;
            }
        }
        Ok(status)
    }

    async fn sibling_resolve_exception_step(
        &self,
        block_uuid: BlockUuid,
        excluding: StepId,
    ) -> StoreResult<Option<Step>> {
        Ok(self
            .steps
            .iter()
            .map(|e| e.value().clone())
            .find(|s| {
                s.block_uuid.0 == block_uuid.0
                    && s.id != excluding
                    && matches!(s.step_type, crate::step::StepType::ResolveException)
            }))
    }

    async fn activate_resolve_exception(&self, step_id: StepId) -> StoreResult<Step> {
        let mut entry = self
            .steps
            .get_mut(&step_id)
            .ok_or(StoreError::NotFound(step_id))?;
        if entry.state == StepState::Halted {
            entry.state = StepState::Pending;
            entry.updated_at = Utc::now();
        }
        Ok(entry.clone())
    }

    async fn get(&self, step_id: StepId) -> StoreResult<Step> {
        self.steps
            .get(&step_id)
            .map(|e| e.value().clone())
            .ok_or(StoreError::NotFound(step_id))
    }

    async fn cancel_blocks(&self, block_uuids: &[BlockUuid]) -> StoreResult<u64> {
        let mut n = 0u64;
        for mut entry in self.steps.iter_mut() {
            let s = entry.value_mut();
            if block_uuids.iter().any(|b| b.0 == s.block_uuid.0) && !s.state.is_terminal() {
                s.state = StepState::Cancelled;
                s.finished_at = Some(Utc::now());
                s.updated_at = Utc::now();
                n += 1;
            }
        }
        Ok(n)
    }
}

/// `last_error` is a bounded-text column (spec.md §3); keep it reasonable.
fn truncate_error(message: &str) -> String {
    const MAX_LEN: usize = 2000;
    if message.len() > MAX_LEN {
        format!("{}... (truncated)", &message[..MAX_LEN])
    } else {
        message.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::NewStep;

    #[tokio::test]
    async fn index_barrier_blocks_later_index() {
        let store = MemoryStepStore::new();
        let block = BlockUuid::new();
        let a = store
            .create(NewStep::new("A", block, 1).with_queue("orders"))
            .await
            .unwrap();
        let _x = store
            .create(NewStep::new("X", block, 2).with_queue("orders"))
            .await
            .unwrap();

        let ready = store.select_ready("orders", 8).await.unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, a.id);

        store.claim(a.id).await.unwrap();
        store.mark_complete(a.id, None).await.unwrap();

        let ready = store.select_ready("orders", 8).await.unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].class, "X");
    }

    #[tokio::test]
    async fn equal_index_siblings_both_ready() {
        let store = MemoryStepStore::new();
        let block = BlockUuid::new();
        store
            .create(NewStep::new("X", block, 2).with_queue("orders"))
            .await
            .unwrap();
        store
            .create(NewStep::new("Y", block, 2).with_queue("orders"))
            .await
            .unwrap();

        let ready = store.select_ready("orders", 8).await.unwrap();
        assert_eq!(ready.len(), 2);
    }

    #[tokio::test]
    async fn claim_conflict_on_second_attempt() {
        let store = MemoryStepStore::new();
        let block = BlockUuid::new();
        let step = store
            .create(NewStep::new("A", block, 1).with_queue("orders"))
            .await
            .unwrap();
        store.claim(step.id).await.unwrap();
        let err = store.claim(step.id).await.unwrap_err();
        assert!(matches!(err, StoreError::ClaimConflict(_)));
    }

    #[tokio::test]
    async fn children_status_aggregates_terminal_counts() {
        let store = MemoryStepStore::new();
        let child_block = BlockUuid::new();
        let a = store
            .create(NewStep::new("a", child_block, 1).with_queue("orders"))
            .await
            .unwrap();
        let b = store
            .create(NewStep::new("b", child_block, 1).with_queue("orders"))
            .await
            .unwrap();

        let status = store.children_status(child_block).await.unwrap();
        assert_eq!(status.total, 2);
        assert_eq!(status.non_terminal, 2);

        store.claim(a.id).await.unwrap();
        store.mark_complete(a.id, None).await.unwrap();
        store.claim(b.id).await.unwrap();
        store.mark_failed(b.id, "permanent", "boom").await.unwrap();

        let status = store.children_status(child_block).await.unwrap();
        assert!(status.all_terminal());
        assert!(status.any_failed());
    }

    /// Cancellation safety (spec.md §8.8): once a running step is
    /// cancelled, a harness that still believes it owns that attempt must
    /// not be able to resurrect it to `completed`.
    #[tokio::test]
    async fn completing_a_concurrently_cancelled_step_is_a_conflict() {
        let store = MemoryStepStore::new();
        let block = BlockUuid::new();
        let step = store
            .create(NewStep::new("A", block, 1).with_queue("orders"))
            .await
            .unwrap();
        store.claim(step.id).await.unwrap();
        store.mark_cancelled(step.id).await.unwrap();

        let err = store.mark_complete(step.id, None).await.unwrap_err();
        assert!(matches!(err, StoreError::TransitionConflict(_)));
        assert_eq!(store.get(step.id).await.unwrap().state, StepState::Cancelled);
    }

    #[tokio::test]
    async fn cancelling_an_already_terminal_step_is_a_conflict() {
        let store = MemoryStepStore::new();
        let block = BlockUuid::new();
        let step = store
            .create(NewStep::new("A", block, 1).with_queue("orders"))
            .await
            .unwrap();
        store.claim(step.id).await.unwrap();
        store.mark_complete(step.id, None).await.unwrap();

        let err = store.mark_cancelled(step.id).await.unwrap_err();
        assert!(matches!(err, StoreError::TransitionConflict(_)));
    }
}
