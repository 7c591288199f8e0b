use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Monotonic step identity, assigned by the store on `create`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StepId(pub i64);

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies the equivalence class of steps that run ordered by `index`.
///
/// A block is a virtual entity: it is never stored as a row of its own, only
/// as the shared `block_uuid` column value of its member steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockUuid(pub Uuid);

impl BlockUuid {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for BlockUuid {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BlockUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Tag grouping logically related blocks together, for tracing only. Never
/// read by dispatch logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowId(pub Uuid);

impl WorkflowId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WorkflowId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
