pub mod config;
pub mod error;
pub mod exchange;
pub mod ids;
pub mod relatable;
pub mod time;

pub use error::{JobFault, RetryPolicy};
pub use exchange::ApiCanonical;
pub use ids::{BlockUuid, StepId, WorkflowId};
pub use relatable::{Relatable, RelatableKind};
pub use time::exponential_backoff_from;
