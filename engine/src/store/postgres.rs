//! Postgres-backed step store.
//!
//! `select_ready` is the one operation in this file that must be
//! serialisable against concurrent dispatchers (spec.md §4.1): it runs a
//! transactional `SELECT ... FOR UPDATE SKIP LOCKED` over a deterministic
//! index (`queue`, `next_run_at`, `id`) so that two dispatcher workers never
//! hand out the same row, and a worker that crashes mid-tick simply leaves
//! its rows unlocked for the next poll instead of wedging them.
//!
//! Schema (spec.md §6):
//! ```sql
//! CREATE TABLE steps (
//!     id BIGSERIAL PRIMARY KEY,
//!     class TEXT NOT NULL,
//!     arguments JSONB NOT NULL DEFAULT '{}',
//!     block_uuid UUID NOT NULL,
//!     child_block_uuid UUID,
//!     workflow_id UUID,
//!     index BIGINT NOT NULL,
//!     state TEXT NOT NULL,
//!     type TEXT NOT NULL DEFAULT 'normal',
//!     queue TEXT NOT NULL,
//!     attempts INT NOT NULL DEFAULT 0,
//!     max_attempts INT NOT NULL,
//!     backoff_seconds BIGINT NOT NULL,
//!     next_run_at TIMESTAMPTZ,
//!     last_error TEXT,
//!     dispatched_at TIMESTAMPTZ,
//!     started_at TIMESTAMPTZ,
//!     finished_at TIMESTAMPTZ,
//!     relatable_type TEXT,
//!     relatable_id BIGINT,
//!     created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
//!     updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
//! );
//! CREATE INDEX steps_ready_idx ON steps (queue, state, next_run_at, id);
//! CREATE INDEX steps_block_idx ON steps (block_uuid, index);
//! ```

use super::{ChildrenStatus, StepStore, StoreError, StoreResult};
use crate::step::{NewStep, Step, StepState, StepType};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use engine_common::{BlockUuid, Relatable, RelatableKind, StepId, WorkflowId};
use serde_json::Value;
use sqlx::postgres::PgPool;
use sqlx::Row;
use std::str::FromStr;
use uuid::Uuid;

pub struct PostgresStepStore {
    pool: PgPool,
}

impl PostgresStepStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// A guarded `UPDATE ... RETURNING` that found no row either means the
    /// id doesn't exist, or it exists but no longer satisfies the state
    /// precondition. Disambiguate with a plain read so callers can tell a
    /// genuine not-found from a lost race (spec.md §4.1, §8.8).
    async fn row_or_conflict(
        &self,
        step_id: StepId,
        row: Option<sqlx::postgres::PgRow>,
    ) -> StoreResult<Step> {
        match row {
            Some(row) => row_to_step(&row),
            None => match self.get(step_id).await {
                Ok(_) => Err(StoreError::TransitionConflict(step_id)),
                Err(err) => Err(err),
            },
        }
    }
}

fn state_to_str(state: StepState) -> &'static str {
    match state {
        StepState::Pending => "pending",
        StepState::Running => "running",
        StepState::Retrying => "retrying",
        StepState::Halted => "halted",
        StepState::Completed => "completed",
        StepState::Failed => "failed",
        StepState::Cancelled => "cancelled",
        StepState::Skipped => "skipped",
    }
}

fn state_from_str(s: &str) -> StepState {
    match s {
        "pending" => StepState::Pending,
        "running" => StepState::Running,
        "retrying" => StepState::Retrying,
        "halted" => StepState::Halted,
        "completed" => StepState::Completed,
        "failed" => StepState::Failed,
        "cancelled" => StepState::Cancelled,
        "skipped" => StepState::Skipped,
        other => panic!("unknown step state in database: {other}"),
    }
}

fn type_to_str(t: StepType) -> &'static str {
    match t {
        StepType::Normal => "normal",
        StepType::ResolveException => "resolve_exception",
    }
}

fn type_from_str(s: &str) -> StepType {
    match s {
        "resolve_exception" => StepType::ResolveException,
        _ => StepType::Normal,
    }
}

fn row_to_step(row: &sqlx::postgres::PgRow) -> StoreResult<Step> {
    let relatable = match (
        row.try_get::<Option<String>, _>("relatable_type")?,
        row.try_get::<Option<i64>, _>("relatable_id")?,
    ) {
        (Some(kind), Some(id)) => RelatableKind::from_str(&kind)
            .ok()
            .map(|kind| Relatable::new(kind, id)),
        _ => None,
    };

    Ok(Step {
        id: StepId(row.try_get("id")?),
        class: row.try_get("class")?,
        arguments: row.try_get("arguments")?,
        block_uuid: BlockUuid(row.try_get::<Uuid, _>("block_uuid")?),
        index: row.try_get("index")?,
        child_block_uuid: row
            .try_get::<Option<Uuid>, _>("child_block_uuid")?
            .map(BlockUuid),
        workflow_id: row
            .try_get::<Option<Uuid>, _>("workflow_id")?
            .map(WorkflowId),
        step_type: type_from_str(&row.try_get::<String, _>("type")?),
        state: state_from_str(&row.try_get::<String, _>("state")?),
        queue: row.try_get("queue")?,
        attempts: row.try_get::<i32, _>("attempts")? as u32,
        max_attempts: row.try_get::<i32, _>("max_attempts")? as u32,
        backoff_seconds: row.try_get::<i64, _>("backoff_seconds")? as u64,
        next_run_at: row.try_get("next_run_at")?,
        last_error: row.try_get("last_error")?,
        relatable,
        dispatched_at: row.try_get("dispatched_at")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl StepStore for PostgresStepStore {
    async fn create(&self, new_step: NewStep) -> StoreResult<Step> {
        let max_attempts = new_step
            .max_attempts
            .unwrap_or(engine_common::config::DEFAULT_MAX_ATTEMPTS) as i32;
        let backoff_seconds = new_step
            .backoff_seconds
            .unwrap_or(engine_common::config::DEFAULT_BACKOFF_SECONDS) as i64;
        let (relatable_type, relatable_id) = match new_step.relatable {
            Some(r) => (Some(r.kind.to_string()), Some(r.id)),
            None => (None, None),
        };
        // A resolve-exception sibling sits out of select_ready until its
        // orchestrator fails (spec.md §4.3, §4.6): it starts halted.
        let initial_state = match new_step.step_type {
            StepType::ResolveException => StepState::Halted,
            StepType::Normal => StepState::Pending,
        };

        let row = sqlx::query(
            r#"
            INSERT INTO steps (
                class, arguments, block_uuid, child_block_uuid, workflow_id,
                index, state, type, queue, attempts, max_attempts, backoff_seconds,
                relatable_type, relatable_id
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, 0, $10, $11, $12, $13
            )
            RETURNING *
            "#,
        )
        .bind(&new_step.class)
        .bind(&new_step.arguments)
        .bind(new_step.block_uuid.0)
        .bind(new_step.child_block_uuid.map(|b| b.0))
        .bind(new_step.workflow_id.map(|w| w.0))
        .bind(new_step.index)
        .bind(state_to_str(initial_state))
        .bind(type_to_str(new_step.step_type))
        .bind(&new_step.queue)
        .bind(max_attempts)
        .bind(backoff_seconds)
        .bind(relatable_type)
        .bind(relatable_id)
        .fetch_one(&self.pool)
        .await?;

        row_to_step(&row)
    }

    async fn select_ready(&self, group: &str, limit: u32) -> StoreResult<Vec<Step>> {
        // Candidates are rows that are claimable, due, in this group, and
        // whose block has no non-terminal step at a strictly smaller index.
        // The NOT EXISTS correlated subquery enforces the index barrier
        // (spec.md §3 invariant 5) directly in SQL so the check stays
        // consistent with concurrent writers; FOR UPDATE SKIP LOCKED means
        // a worker that already has a row locked is simply skipped rather
        // than awaited.
        let rows = sqlx::query(
            r#"
            SELECT s.* FROM steps s
            WHERE s.queue = $1
              AND s.state IN ('pending', 'retrying')
              AND (s.next_run_at IS NULL OR s.next_run_at <= now())
              AND NOT EXISTS (
                  SELECT 1 FROM steps sib
                  WHERE sib.block_uuid = s.block_uuid
                    AND sib.index < s.index
                    AND sib.state NOT IN ('completed', 'failed', 'cancelled', 'skipped')
              )
            ORDER BY s.queue, s.next_run_at NULLS FIRST, s.id
            LIMIT $2
            FOR UPDATE OF s SKIP LOCKED
            "#,
        )
        .bind(group)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_step).collect()
    }

    async fn claim(&self, step_id: StepId) -> StoreResult<Step> {
        let row = sqlx::query(
            r#"
            UPDATE steps
            SET state = 'running', started_at = now(), attempts = attempts + 1, updated_at = now()
            WHERE id = $1 AND state IN ('pending', 'retrying')
            RETURNING *
            "#,
        )
        .bind(step_id.0)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row_to_step(&row),
            None => Err(StoreError::ClaimConflict(step_id)),
        }
    }

    async fn mark_complete(&self, step_id: StepId, _result: Option<Value>) -> StoreResult<Step> {
        // spec.md §6's persisted column list has no dedicated result column;
        // a compute result lives only in whatever domain row the job itself
        // wrote (e.g. the order/position the atomic job mutated).
        //
        // The `state = 'running'` guard is load-bearing: without it a step
        // that was concurrently cancelled (spec.md §8.8) would have its
        // terminal `cancelled` row resurrected to `completed` by a harness
        // that finishes the attempt it no longer owns.
        let row = sqlx::query(
            r#"
            UPDATE steps
            SET state = 'completed', finished_at = now(), updated_at = now()
            WHERE id = $1 AND state = 'running'
            RETURNING *
            "#,
        )
        .bind(step_id.0)
        .fetch_optional(&self.pool)
        .await?;

        self.row_or_conflict(step_id, row).await
    }

    async fn mark_failed(
        &self,
        step_id: StepId,
        _error_kind: &str,
        error_message: &str,
    ) -> StoreResult<Step> {
        let row = sqlx::query(
            r#"
            UPDATE steps
            SET state = 'failed', last_error = $2, finished_at = now(), updated_at = now()
            WHERE id = $1 AND state = 'running'
            RETURNING *
            "#,
        )
        .bind(step_id.0)
        .bind(truncate_error(error_message))
        .fetch_optional(&self.pool)
        .await?;

        self.row_or_conflict(step_id, row).await
    }

    async fn mark_retrying(
        &self,
        step_id: StepId,
        next_run_at: DateTime<Utc>,
        reason: &str,
    ) -> StoreResult<Step> {
        let row = sqlx::query(
            r#"
            UPDATE steps
            SET state = 'retrying', next_run_at = $2, last_error = $3, updated_at = now()
            WHERE id = $1 AND state = 'running'
            RETURNING *
            "#,
        )
        .bind(step_id.0)
        .bind(next_run_at)
        .bind(truncate_error(reason))
        .fetch_optional(&self.pool)
        .await?;

        self.row_or_conflict(step_id, row).await
    }

    async fn mark_cancelled(&self, step_id: StepId) -> StoreResult<Step> {
        // A single-step cancel may target a step that hasn't been claimed
        // yet, so the guard excludes the terminal states rather than
        // requiring `running` (mirrors `cancel_blocks`'s bulk guard).
        let row = sqlx::query(
            r#"
            UPDATE steps
            SET state = 'cancelled', finished_at = now(), updated_at = now()
            WHERE id = $1
              AND state NOT IN ('completed', 'failed', 'cancelled', 'skipped')
            RETURNING *
            "#,
        )
        .bind(step_id.0)
        .fetch_optional(&self.pool)
        .await?;

        self.row_or_conflict(step_id, row).await
    }

    async fn mark_skipped(&self, step_id: StepId) -> StoreResult<Step> {
        let row = sqlx::query(
            r#"
            UPDATE steps
            SET state = 'skipped', finished_at = now(), updated_at = now()
            WHERE id = $1 AND state = 'running'
            RETURNING *
            "#,
        )
        .bind(step_id.0)
        .fetch_optional(&self.pool)
        .await?;

        self.row_or_conflict(step_id, row).await
    }

    async fn children_status(&self, child_block_uuid: BlockUuid) -> StoreResult<ChildrenStatus> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total,
                COUNT(*) FILTER (WHERE state IN ('completed', 'failed', 'cancelled', 'skipped')) AS terminal,
                COUNT(*) FILTER (WHERE state NOT IN ('completed', 'failed', 'cancelled', 'skipped')) AS non_terminal,
                COUNT(*) FILTER (WHERE state = 'failed') AS failed
            FROM steps
            WHERE block_uuid = $1
            "#,
        )
        .bind(child_block_uuid.0)
        .fetch_one(&self.pool)
        .await?;

        Ok(ChildrenStatus {
            total: row.try_get::<i64, _>("total")? as u64,
            terminal: row.try_get::<i64, _>("terminal")? as u64,
            non_terminal: row.try_get::<i64, _>("non_terminal")? as u64,
            failed: row.try_get::<i64, _>("failed")? as u64,
        })
    }

    async fn sibling_resolve_exception_step(
        &self,
        block_uuid: BlockUuid,
        excluding: StepId,
    ) -> StoreResult<Option<Step>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM steps
            WHERE block_uuid = $1 AND type = 'resolve_exception' AND id != $2
            LIMIT 1
            "#,
        )
        .bind(block_uuid.0)
        .bind(excluding.0)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_step).transpose()
    }

    async fn activate_resolve_exception(&self, step_id: StepId) -> StoreResult<Step> {
        let row = sqlx::query(
            r#"
            UPDATE steps
            SET state = 'pending', updated_at = now()
            WHERE id = $1 AND state = 'halted'
            RETURNING *
            "#,
        )
        .bind(step_id.0)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row_to_step(&row),
            None => self.get(step_id).await,
        }
    }

    async fn get(&self, step_id: StepId) -> StoreResult<Step> {
        let row = sqlx::query("SELECT * FROM steps WHERE id = $1")
            .bind(step_id.0)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound(step_id))?;

        row_to_step(&row)
    }

    async fn cancel_blocks(&self, block_uuids: &[BlockUuid]) -> StoreResult<u64> {
        let uuids: Vec<Uuid> = block_uuids.iter().map(|b| b.0).collect();
        let result = sqlx::query(
            r#"
            UPDATE steps
            SET state = 'cancelled', finished_at = now(), updated_at = now()
            WHERE block_uuid = ANY($1)
              AND state NOT IN ('completed', 'failed', 'cancelled', 'skipped')
            "#,
        )
        .bind(&uuids)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

fn truncate_error(message: &str) -> String {
    const MAX_LEN: usize = 2000;
    if message.len() > MAX_LEN {
        format!("{}... (truncated)", &message[..MAX_LEN])
    } else {
        message.to_string()
    }
}
