use thiserror::Error;

/// The error taxonomy the job harness classifies every thrown fault into.
/// Job bodies raise a `JobFault`; the harness never has to guess at a
/// classification from a generic error type.
#[derive(Debug, Error)]
pub enum JobFault {
    /// Network errors, 5xx, 429, deadlocks, lock timeouts, exchange-specific
    /// transient codes. Action: `retrying` with exponential backoff, then
    /// `failed` once `attempts == max_attempts`.
    #[error("transient: {0}")]
    Retryable(String),

    /// Syntax errors, unknown symbol, invalid credentials, schema
    /// violations, invariant violations in the job body. Action: `failed`
    /// immediately, `resolve-exception` sibling (if any) becomes eligible.
    #[error("permanent: {0}")]
    Permanent(String),

    /// Duplicate-entry on an idempotent upsert, "already cancelled" when
    /// cancellation was desired anyway. Action: `completed`, `last_error`
    /// set for audit.
    #[error("ignorable: {0}")]
    Ignorable(String),

    /// Raised by the body to end the step successfully without triggering
    /// compensators or notifications.
    #[error("just-end: {0}")]
    JustEnd(String),

    /// Raised by the body to fail the step and fire compensators, but skip
    /// the ignorable-classification round trip.
    #[error("just-resolve: {0}")]
    JustResolve(String),

    /// Downgrades an otherwise notifiable failure to silent. Still fails
    /// the step; only suppresses the admin notification.
    #[error("non-notifiable: {0}")]
    NonNotifiable(Box<JobFault>),

    /// Raised by `doubleCheck`; retryable up to a small attempt cap,
    /// independent of the step's own `max_attempts`.
    #[error("verification failed: {0}")]
    VerificationFailed(String),

    /// A child step in this step's `child_block_uuid` failed terminally.
    /// Carries no message of its own; propagated by the dispatcher, never
    /// raised directly by a job body.
    #[error("child failure")]
    ChildFailure,
}

impl JobFault {
    /// Whether this fault, once classified, still notifies operators. Only
    /// `NonNotifiable` (and anything it wraps) is silenced.
    pub fn is_notifiable(&self) -> bool {
        !matches!(self, JobFault::NonNotifiable(_))
    }

    /// Unwraps `NonNotifiable` wrapping to get at the underlying category
    /// for classification purposes, while remembering it must stay silent.
    pub fn underlying(&self) -> &JobFault {
        match self {
            JobFault::NonNotifiable(inner) => inner.underlying(),
            other => other,
        }
    }
}

/// Per-job-class retry configuration: backoff is exponential with a
/// configured multiplier, starting from an initial delay set by the job
/// class, capped at a maximum delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_seconds: u64,
    pub backoff_multiplier: u32,
    pub backoff_cap_seconds: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: crate::config::DEFAULT_MAX_ATTEMPTS,
            initial_backoff_seconds: crate::config::DEFAULT_BACKOFF_SECONDS,
            backoff_multiplier: crate::config::DEFAULT_BACKOFF_MULTIPLIER,
            backoff_cap_seconds: crate::config::DEFAULT_BACKOFF_CAP_SECONDS,
        }
    }
}

impl RetryPolicy {
    pub fn next_delay(&self, attempt: u32) -> std::time::Duration {
        crate::time::exponential_backoff(
            self.initial_backoff_seconds,
            self.backoff_multiplier,
            self.backoff_cap_seconds,
            attempt,
        )
    }
}
