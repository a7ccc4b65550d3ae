//! Core orchestration library for ralph: discovers units of agent work from a task
//! tree, schedules them across a worker pool respecting their dependency DAG, and
//! drives each unit through its agent-iteration, baseline, PR, review, and merge
//! lifecycle.
//!
//! Every extracted concern here (`ralph-types`, `ralph-events`, `ralph-git`, ...) is
//! an unconditional dependency rather than a feature-gated toggle between an inline
//! module and an external microcrate — these microcrates are load-bearing from the
//! start, not an opt-in packaging experiment.

pub mod agent;
pub mod auth;
pub mod discovery;
pub mod error;
pub mod escalation;
pub mod graph;
pub mod merge;
pub mod pr_gateway;
pub mod scheduler;
pub mod worker;
pub mod worktree;

pub use auth::resolve_token;
pub use discovery::{discover, DiscoveryResult, DiscoveryViolation};
pub use error::OrchestratorError;
pub use escalation::{CompositeEscalator, Escalator, TerminalEscalator, WebhookEscalator};
pub use graph::DependencyGraph;
pub use merge::MergePipeline;
pub use pr_gateway::{GithubPrGateway, PollOutcome, PrGateway};
pub use scheduler::Scheduler;
pub use worker::{run_unit, WorkerContext};
