//! Domain types shared by discovery, the scheduler, the worker, the PR gateway, and
//! persistence. Kept in one crate so every component agrees on the shape of a unit,
//! a task, and an event without circular crate dependencies.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A batch of work discovered from `<unit>/IMPLEMENTATION_PLAN.md`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Unit {
    pub id: String,
    pub tasks: Vec<Task>,
    pub depends_on: Vec<String>,
    pub baseline_checks: Vec<BaselineCheck>,
    /// Plan frontmatter keys this repo does not itself interpret, preserved so a
    /// re-serialize of the plan file does not drop them.
    pub plan_extra: BTreeMap<String, serde_yaml::Value>,
    pub state: UnitRuntimeState,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnitRuntimeState {
    pub status: UnitStatus,
    pub worktree_path: Option<PathBuf>,
    pub branch: Option<String>,
    pub pr_number: Option<u64>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnitStatus {
    #[default]
    Pending,
    Ready,
    InProgress,
    Complete,
    Failed,
    Blocked,
}

impl UnitStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, UnitStatus::Complete | UnitStatus::Failed)
    }
}

/// A unit-level command that must pass before a PR is opened, e.g. `go vet ./...`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaselineCheck {
    pub name: String,
    pub command: String,
    /// Only run this check if at least one changed path matches this glob.
    pub pattern: Option<String>,
}

/// The smallest scheduling atom: one `<NN>-<slug>.md` file within a unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// 1-indexed position, matching the file's sort order.
    pub index: u32,
    pub title: String,
    /// Raw markdown body, fed verbatim into the agent prompt.
    pub content: String,
    pub status: TaskStatus,
    pub backpressure: String,
    pub depends_on: Vec<u32>,
}

impl Task {
    /// A task is dispatchable iff every in-unit prerequisite index is complete.
    pub fn is_ready(&self, completed_indices: &std::collections::HashSet<u32>) -> bool {
        self.status == TaskStatus::Pending
            && self.depends_on.iter().all(|d| completed_indices.contains(d))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Complete,
    Failed,
}

/// `{number, head branch, base branch, html URL, created time}` plus the derived
/// review-state snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrRecord {
    pub number: u64,
    pub head_branch: String,
    pub base_branch: String,
    pub html_url: String,
    pub created_at: DateTime<Utc>,
    pub review_state: ReviewState,
}

/// Derived from reactions/comments on the PR's issue view. Precedence (highest
/// wins): `+1` ⇒ approved; else `eyes` ⇒ in-review; else any comment ⇒
/// changes-requested; else pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReviewState {
    #[default]
    Pending,
    InReview,
    ChangesRequested,
    Approved,
}

/// Compute review state from a reaction/comment snapshot per the §3 precedence rule.
pub fn review_state_from_signals(has_thumbs_up: bool, has_eyes: bool, has_comment: bool) -> ReviewState {
    if has_thumbs_up {
        ReviewState::Approved
    } else if has_eyes {
        ReviewState::InReview
    } else if has_comment {
        ReviewState::ChangesRequested
    } else {
        ReviewState::Pending
    }
}

/// The top-level batch record, persisted in daemon mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub repo_path: PathBuf,
    pub target_branch: String,
    pub feature_branch: String,
    pub tasks_dir: PathBuf,
    pub parallelism: u32,
    pub status: RunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Pending,
    Running,
    Complete,
    Failed,
}

/// An append-only event. Types form a closed vocabulary grouped by subject
/// (`unit.*`, `task.*`, `pr.*`, `merge.*`, `orch.*`, `codereview.*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event_type: EventType,
    pub unit: Option<String>,
    pub task: Option<u32>,
    pub pr: Option<u64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum EventType {
    #[serde(rename = "unit.queued")]
    UnitQueued,
    #[serde(rename = "unit.started")]
    UnitStarted,
    #[serde(rename = "unit.completed")]
    UnitCompleted,
    #[serde(rename = "unit.failed")]
    UnitFailed { message: String },
    #[serde(rename = "unit.blocked")]
    UnitBlocked { blocking_predecessor: String },
    #[serde(rename = "task.started")]
    TaskStarted,
    #[serde(rename = "task.completed")]
    TaskCompleted,
    #[serde(rename = "task.agent-iteration")]
    TaskAgentIteration { attempt: u32, ready_indices: Vec<u32> },
    #[serde(rename = "task.agent-output")]
    TaskAgentOutput { stream: OutputStream, chunk: String },
    #[serde(rename = "pr.created")]
    PrCreated { number: u64, html_url: String },
    #[serde(rename = "pr.review-pending")]
    PrReviewPending,
    #[serde(rename = "pr.review-in-review")]
    PrReviewInReview,
    #[serde(rename = "pr.review-changes-requested")]
    PrReviewChangesRequested,
    #[serde(rename = "pr.review-approved")]
    PrReviewApproved,
    #[serde(rename = "pr.conflict")]
    PrConflict { files: Vec<String> },
    #[serde(rename = "pr.merged")]
    PrMerged,
    #[serde(rename = "merge.mutex-acquired")]
    MergeMutexAcquired,
    #[serde(rename = "merge.mutex-released")]
    MergeMutexReleased,
    #[serde(rename = "orch.run-started")]
    OrchRunStarted,
    #[serde(rename = "orch.run-finished")]
    OrchRunFinished { result: RunResult },
    #[serde(rename = "codereview.escalated")]
    CodeReviewEscalated { severity: EscalationSeverity, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunResult {
    Success,
    PartialFailure,
}

/// Severities an escalation can carry. `Blocking` halts the affected unit; the
/// others are informational.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationSeverity {
    Info,
    Warning,
    Critical,
    Blocking,
}

impl EscalationSeverity {
    /// A short emoji prefix for terminal reporters that tag every line with a
    /// level marker.
    pub fn emoji(self) -> &'static str {
        match self {
            EscalationSeverity::Info => "ℹ️",
            EscalationSeverity::Warning => "⚠️",
            EscalationSeverity::Critical => "🔥",
            EscalationSeverity::Blocking => "🛑",
        }
    }
}
