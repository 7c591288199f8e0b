//! The persisted unit of scheduled work.

use chrono::{DateTime, Utc};
use engine_common::{BlockUuid, Relatable, StepId, WorkflowId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One of the states a step row may be in. Terminal states are
/// `Completed`, `Failed`, `Cancelled`, `Skipped`; everything else is
/// non-terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Pending,
    Running,
    Retrying,
    Halted,
    Completed,
    Failed,
    Cancelled,
    Skipped,
}

impl StepState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepState::Completed | StepState::Failed | StepState::Cancelled | StepState::Skipped
        )
    }

    /// States the store's `selectReady` considers eligible to be picked up.
    pub fn is_claimable(self) -> bool {
        matches!(self, StepState::Pending | StepState::Retrying)
    }
}

/// Normal steps are ordinary workflow members; `resolve-exception` steps are
/// the sibling compensator a block's orchestrator may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Normal,
    ResolveException,
}

impl Default for StepType {
    fn default() -> Self {
        StepType::Normal
    }
}

/// A step row as the dispatcher and store see it. `class` is a stable
/// factory key, never a host-language path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    pub class: String,
    pub arguments: Value,

    pub block_uuid: BlockUuid,
    pub index: i64,
    pub child_block_uuid: Option<BlockUuid>,
    pub workflow_id: Option<WorkflowId>,

    pub step_type: StepType,
    pub state: StepState,
    pub queue: String,

    pub attempts: u32,
    pub max_attempts: u32,
    pub backoff_seconds: u64,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,

    pub relatable: Option<Relatable>,

    pub dispatched_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Everything the caller of `store.create` must supply; the store fills in
/// `id`, timestamps, and defaults.
#[derive(Debug, Clone)]
pub struct NewStep {
    pub class: String,
    pub arguments: Value,
    pub block_uuid: BlockUuid,
    pub index: i64,
    pub child_block_uuid: Option<BlockUuid>,
    pub workflow_id: Option<WorkflowId>,
    pub step_type: StepType,
    pub queue: String,
    pub max_attempts: Option<u32>,
    pub backoff_seconds: Option<u64>,
    pub relatable: Option<Relatable>,
}

impl NewStep {
    pub fn new(class: impl Into<String>, block_uuid: BlockUuid, index: i64) -> Self {
        Self {
            class: class.into(),
            arguments: Value::Null,
            block_uuid,
            index,
            child_block_uuid: None,
            workflow_id: None,
            step_type: StepType::Normal,
            queue: "default".to_string(),
            max_attempts: None,
            backoff_seconds: None,
            relatable: None,
        }
    }

    pub fn with_arguments(mut self, arguments: Value) -> Self {
        self.arguments = arguments;
        self
    }

    pub fn with_child_block(mut self, child_block_uuid: BlockUuid) -> Self {
        self.child_block_uuid = Some(child_block_uuid);
        self
    }

    pub fn with_workflow(mut self, workflow_id: WorkflowId) -> Self {
        self.workflow_id = Some(workflow_id);
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn with_relatable(mut self, relatable: Relatable) -> Self {
        self.relatable = Some(relatable);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn as_resolve_exception(mut self) -> Self {
        self.step_type = StepType::ResolveException;
        self
    }
}
