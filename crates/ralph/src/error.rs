//! The error-kind taxonomy each component maps its failures onto: a typed enum at
//! the orchestrator boundary because downstream code (the scheduler, the escalator)
//! needs to branch on error *class* — retryable vs. permanent — not just print a
//! message.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("discovery failed:\n{0}")]
    Discovery(String),

    #[error("unit {unit} depends on unknown unit {dependency}")]
    UnknownDependency { unit: String, dependency: String },

    #[error("dependency cycle detected: {0}")]
    Cycle(String),

    #[error("agent exited non-zero ({code}) for unit {unit}")]
    AgentExit { unit: String, code: i32 },

    #[error("agent timed out after {elapsed:?} for unit {unit}")]
    AgentTimeout { unit: String, elapsed: std::time::Duration },

    #[error("backpressure command failed for unit {unit} task {task}")]
    BackpressureFailed { unit: String, task: u32 },

    #[error("baseline check '{check}' failed for unit {unit} after {attempts} attempts")]
    BaselineFailed { unit: String, check: String, attempts: u32 },

    #[error("rebase conflict in unit {unit} after {attempts} resolution attempts")]
    RebaseConflict { unit: String, attempts: u32 },

    #[error("force-push-with-lease was rejected for unit {unit} (remote moved)")]
    PushRace { unit: String },

    #[error("forge API rate-limited; retry after {retry_after:?}")]
    ForgeRateLimited { retry_after: Option<std::time::Duration> },

    #[error("forge API returned server error {status}: {body}")]
    ForgeServerError { status: u16, body: String },

    #[error("forge API returned client error {status}: {body}")]
    ForgeClientError { status: u16, body: String },

    #[error("review timed out for unit {unit} PR #{pr}")]
    ReviewTimeout { unit: String, pr: u64 },

    #[error("unit {unit} is blocked by failed predecessor {predecessor}")]
    BlockedPredecessor { unit: String, predecessor: String },

    #[error("merge mutex contention could not be resolved for unit {unit}")]
    MergeMutexContention { unit: String },

    #[error("persistence write failed: {0}")]
    Persistence(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OrchestratorError {
    /// Whether the failure is worth retrying at the same layer that produced it, per
    /// §4.7's "Failure semantics": agent exit and backpressure are retryable,
    /// baseline is retried bounded, git conflicts are handled by the merge pipeline,
    /// everything else that reaches here is terminal for the unit.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OrchestratorError::AgentExit { .. }
                | OrchestratorError::AgentTimeout { .. }
                | OrchestratorError::BackpressureFailed { .. }
                | OrchestratorError::ForgeRateLimited { .. }
                | OrchestratorError::ForgeServerError { .. }
        )
    }

    /// Whether this failure should escalate with `EscalationSeverity::Blocking`,
    /// halting the unit outright rather than being swallowed into a retry budget.
    pub fn is_blocking(&self) -> bool {
        matches!(
            self,
            OrchestratorError::Cycle(_)
                | OrchestratorError::RebaseConflict { .. }
                | OrchestratorError::MergeMutexContention { .. }
                | OrchestratorError::Persistence(_)
        )
    }
}
