//! Worker (§4.7): the largest state machine in the system. A worker claims a unit,
//! owns its worktree and agent subprocess for the duration of its tasks, and
//! finalizes via the merge pipeline. Grounded on `engine::run_publish`'s shape —
//! acquire resources, load-or-init mutable state, iterate work items with a bounded
//! per-item retry budget, emit a paired start/end event around every transition,
//! finalize — generalized from a single-package publish attempt to a multi-task
//! agent feedback loop.

use std::collections::HashSet;
use std::path::Path;
use std::time::{Duration, Instant};

use chrono::Utc;
use ralph_config::Config;
use ralph_events::EventBus;
use ralph_retry::RetryPolicy;
use ralph_types::{Event, EventType, OutputStream, Task, TaskStatus, Unit};

use crate::agent::{self, AgentInvocation};
use crate::error::OrchestratorError;
use crate::escalation::Escalator;
use crate::merge::MergePipeline;
use crate::pr_gateway::PrGateway;
use crate::worktree::{self, WorktreeHandle};

pub struct WorkerContext<'a> {
    pub repo_root: &'a Path,
    pub config: &'a Config,
    pub events: &'a EventBus,
    pub escalator: &'a dyn Escalator,
    pub pr_gateway: &'a dyn PrGateway,
    pub merge_pipeline: &'a MergePipeline,
    pub no_pr: bool,
}

const MAX_BASELINE_RETRIES: u32 = 3;

/// Runs a unit end to end: setup, task loop, unit baseline, PR phase, review wait,
/// merge, teardown. Returns `Ok(())` on success; any `Err` means the caller should
/// tell the scheduler `fail(unit_id, ..)` — this function has already emitted the
/// matching failure event and, where applicable, escalated.
pub fn run_unit(ctx: &WorkerContext, unit: &mut Unit) -> Result<(), OrchestratorError> {
    let handle = setup(ctx, unit)?;
    let run_result = (|| -> Result<(), OrchestratorError> {
        task_loop(ctx, unit, &handle)?;
        run_unit_baseline(ctx, unit, &handle)?;
        if ctx.no_pr {
            emit(ctx, unit_event(unit, EventType::UnitCompleted));
            return Ok(());
        }
        let pr_number = open_pr(ctx, unit, &handle)?;
        review_cycle(ctx, unit, &handle, pr_number)?;
        merge(ctx, unit, &handle, pr_number)?;
        emit(ctx, unit_event(unit, EventType::UnitCompleted));
        Ok(())
    })();

    teardown(ctx, unit, &handle);

    if let Err(ref err) = run_result {
        emit(ctx, unit_event(unit, EventType::UnitFailed { message: err.to_string() }));
    }
    run_result
}

fn setup(ctx: &WorkerContext, unit: &Unit) -> Result<WorktreeHandle, OrchestratorError> {
    let suffix = name_worktree_suffix(ctx, unit).unwrap_or_else(crate::worktree::random_suffix);
    let handle = worktree::create(ctx.repo_root, &ctx.config.worktree, &unit.id, &ctx.config.target_branch, &suffix)
        .map_err(OrchestratorError::Other)?;
    emit(ctx, unit_event(unit, EventType::UnitStarted));
    Ok(handle)
}

/// Invoke the agent with a short naming prompt to produce a human-readable branch
/// suffix; falls back to a random suffix on any failure (§4.5).
fn name_worktree_suffix(ctx: &WorkerContext, unit: &Unit) -> Option<String> {
    let invocation = claude_invocation(ctx, None);
    let prompt = format!("Suggest a short kebab-case branch suffix (2-4 words) for unit '{}'. Reply with only the suffix.", unit.id);
    let out = agent::invoke(&invocation, &unit.id, &prompt, ctx.repo_root).ok()?;
    let candidate = out.stdout.trim().to_lowercase();
    let slug: String = candidate.chars().filter(|c| c.is_ascii_alphanumeric() || *c == '-').collect();
    if slug.is_empty() { None } else { Some(slug) }
}

fn claude_invocation(ctx: &WorkerContext, timeout: Option<Duration>) -> AgentInvocation {
    AgentInvocation { command: ctx.config.claude.command.clone(), extra_args: Vec::new(), timeout }
}

fn completed_indices(unit: &Unit) -> HashSet<u32> {
    unit.tasks.iter().filter(|t| t.status == TaskStatus::Complete).map(|t| t.index).collect()
}

fn ready_task_indices(unit: &Unit) -> Vec<u32> {
    let done = completed_indices(unit);
    unit.tasks.iter().filter(|t| t.is_ready(&done)).map(|t| t.index).collect()
}

/// The task loop: while any task is pending, construct a prompt, invoke the agent
/// with bounded retry, then determine which ready task(s) the agent addressed by
/// running their backpressure commands.
fn task_loop(ctx: &WorkerContext, unit: &mut Unit, handle: &WorktreeHandle) -> Result<(), OrchestratorError> {
    let plan_excerpt = unit.plan_extra.get("summary").and_then(|v| v.as_str()).unwrap_or(&unit.id).to_string();
    let retry_config = RetryPolicy::AgentIteration.to_config();

    while unit.tasks.iter().any(|t| t.status == TaskStatus::Pending) {
        let ready_indices = ready_task_indices(unit);
        if ready_indices.is_empty() {
            // No pending task is dispatchable; the unit's depends_on graph within
            // itself is malformed. Treat as a permanent failure.
            return Err(OrchestratorError::Other(anyhow::anyhow!("no ready tasks remain for unit {} but pending tasks exist", unit.id)));
        }
        let current_index = *ready_indices.first().expect("ready_indices checked non-empty above");
        let current_content = unit
            .tasks
            .iter()
            .find(|t| t.index == current_index)
            .expect("ready index must name a task in this unit")
            .content
            .clone();
        let prompt = agent::build_task_prompt(&plan_excerpt, &current_content, &ready_indices);

        if ready_indices.len() == 1 {
            emit(ctx, task_event(unit, current_index, EventType::TaskStarted));
        }

        let mut baseline_attempt = 0;
        loop {
            baseline_attempt += 1;
            let invocation = claude_invocation(ctx, None);
            let attempt_prompt = prompt.clone();
            let unit_id = unit.id.clone();
            let result = ralph_retry::retry_with_backoff(
                &retry_config,
                |attempt| {
                    emit(ctx, task_event(unit, current_index, EventType::TaskAgentIteration { attempt, ready_indices: ready_indices.clone() }));
                    agent::invoke(&invocation, &unit_id, &attempt_prompt, &handle.path)
                },
                |delay| std::thread::sleep(delay),
            );

            let output = match result {
                Ok(out) => out,
                Err(err) => {
                    ctx.escalator.escalate(ralph_types::EscalationSeverity::Critical, Some(unit.id.clone()), err.to_string());
                    return Err(err);
                }
            };
            for (stream, chunk) in [(OutputStream::Stdout, &output.stdout), (OutputStream::Stderr, &output.stderr)] {
                if !chunk.is_empty() {
                    emit(ctx, task_event(unit, current_index, EventType::TaskAgentOutput { stream, chunk: chunk.clone() }));
                }
            }

            let passing = run_passing_backpressure(unit, &ready_indices, handle);
            if !passing.is_empty() {
                ralph_git::commit(&handle.path, &format!("ralph: complete task(s) {:?} in unit {}", passing, unit.id), true)
                    .map_err(OrchestratorError::Other)?;
                for index in &passing {
                    if let Some(task) = unit.tasks.iter_mut().find(|t| t.index == *index) {
                        task.status = TaskStatus::Complete;
                    }
                    emit(ctx, task_event(unit, *index, EventType::TaskCompleted));
                }
                break;
            }

            if baseline_attempt >= MAX_BASELINE_RETRIES {
                return Err(OrchestratorError::BackpressureFailed { unit: unit.id.clone(), task: current_index });
            }
        }
    }
    Ok(())
}

/// Run the backpressure command for every ready index from the worktree, returning
/// the indices whose command now exits zero.
fn run_passing_backpressure(unit: &Unit, ready_indices: &[u32], handle: &WorktreeHandle) -> Vec<u32> {
    ready_indices
        .iter()
        .copied()
        .filter(|index| {
            let Some(task) = unit.tasks.iter().find(|t| t.index == *index) else {
                return false;
            };
            ralph_process::run_command("sh", &["-c", &task.backpressure], &handle.path).map(|o| o.success()).unwrap_or(false)
        })
        .collect()
}

/// Run the unit's `baseline_checks`, retrying with agent-fix iterations on failure.
fn run_unit_baseline(ctx: &WorkerContext, unit: &Unit, handle: &WorktreeHandle) -> Result<(), OrchestratorError> {
    for check in &unit.baseline_checks {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let output = ralph_process::run_command("sh", &["-c", &check.command], &handle.path).map_err(OrchestratorError::Other)?;
            if output.success() {
                break;
            }
            if attempts >= MAX_BASELINE_RETRIES {
                ctx.escalator.escalate(ralph_types::EscalationSeverity::Critical, Some(unit.id.clone()), format!("baseline check '{}' failed", check.name));
                return Err(OrchestratorError::BaselineFailed { unit: unit.id.clone(), check: check.name.clone(), attempts });
            }
            let invocation = claude_invocation(ctx, None);
            let prompt = format!("Baseline check '{}' (`{}`) is failing. Fix the code so it passes.\n\n{}", check.name, check.command, output.stderr);
            let out = agent::invoke(&invocation, &unit.id, &prompt, &handle.path);
            if out.is_ok() {
                ralph_git::commit(&handle.path, &format!("ralph: fix baseline '{}'", check.name), true).ok();
            }
        }
    }
    Ok(())
}

/// PR phase (§4.7 step 4): push the branch and delegate PR creation to the agent.
fn open_pr(ctx: &WorkerContext, unit: &Unit, handle: &WorktreeHandle) -> Result<u64, OrchestratorError> {
    ralph_git::force_push_with_lease(&handle.path, &handle.branch).map_err(OrchestratorError::Other)?;
    let invocation = claude_invocation(ctx, None);
    let prompt = format!(
        "Open a pull request for branch '{}' against '{}' using the host CLI's PR create command, then print only the PR number.",
        handle.branch, ctx.config.target_branch
    );
    let output = agent::invoke(&invocation, &unit.id, &prompt, &handle.path)?;
    let pr_number: u64 = output
        .stdout
        .lines()
        .rev()
        .find_map(|line| line.trim().trim_start_matches('#').parse().ok())
        .ok_or_else(|| OrchestratorError::Other(anyhow::anyhow!("could not parse a PR number from agent output for unit {}", unit.id)))?;
    emit(ctx, unit_event(unit, EventType::PrCreated { number: pr_number, html_url: String::new() }));
    Ok(pr_number)
}

/// Review wait and feedback loop (§4.7 steps 5-6).
fn review_cycle(ctx: &WorkerContext, unit: &Unit, handle: &WorktreeHandle, pr_number: u64) -> Result<(), OrchestratorError> {
    let started_at = Instant::now();
    loop {
        let outcome = ctx.pr_gateway.poll_review(pr_number, started_at, ctx.config.review.timeout, ctx.config.review.poll_interval)?;
        match outcome {
            crate::pr_gateway::PollOutcome::ShouldMerge => return Ok(()),
            crate::pr_gateway::PollOutcome::ChangesRequested(comments) => {
                let invocation = claude_invocation(ctx, None);
                let prompt = agent::build_feedback_prompt(&comments);
                agent::invoke(&invocation, &unit.id, &prompt, &handle.path)?;
                ralph_git::commit(&handle.path, "ralph: address review feedback", true).map_err(OrchestratorError::Other)?;
                ralph_git::force_push_with_lease(&handle.path, &handle.branch).map_err(OrchestratorError::Other)?;
            }
            crate::pr_gateway::PollOutcome::TimedOut => {
                ctx.escalator.escalate(ralph_types::EscalationSeverity::Critical, Some(unit.id.clone()), format!("review timed out for PR #{pr_number}"));
                return Err(OrchestratorError::ReviewTimeout { unit: unit.id.clone(), pr: pr_number });
            }
        }
    }
}

fn merge(ctx: &WorkerContext, unit: &Unit, handle: &WorktreeHandle, pr_number: u64) -> Result<(), OrchestratorError> {
    ctx.merge_pipeline.merge(ctx.repo_root, &ctx.config.target_branch, handle, pr_number, ctx.escalator, |conflict_prompt| {
        let invocation = claude_invocation(ctx, None);
        agent::invoke(&invocation, &unit.id, conflict_prompt, &handle.path).map(|_| ())
    })
}

fn teardown(ctx: &WorkerContext, unit: &Unit, handle: &WorktreeHandle) {
    if let Err(err) = worktree::teardown(ctx.repo_root, &ctx.config.worktree, handle) {
        ctx.escalator.escalate(ralph_types::EscalationSeverity::Warning, Some(unit.id.clone()), format!("worktree teardown failed: {err}"));
    }
}

fn emit(ctx: &WorkerContext, event: Event) {
    ctx.events.emit(event);
}

fn unit_event(unit: &Unit, event_type: EventType) -> Event {
    Event { timestamp: Utc::now(), event_type, unit: Some(unit.id.clone()), task: None, pr: None, error: None }
}

fn task_event(unit: &Unit, task: u32, event_type: EventType) -> Event {
    Event { timestamp: Utc::now(), event_type, unit: Some(unit.id.clone()), task: Some(task), pr: None, error: None }
}
