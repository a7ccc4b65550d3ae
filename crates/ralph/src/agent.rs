//! Agent invoker (§4.6): spawns the configured LLM CLI with a prompt on stdin and
//! reports its outcome. Stateless and reentrant — concurrency is bounded by the
//! worker pool, not by anything in here.

use std::path::Path;
use std::time::Duration;

use ralph_process::{CommandOutput, run_with_timeout};

use crate::error::OrchestratorError;

#[derive(Debug, Clone)]
pub struct AgentInvocation {
    pub command: String,
    pub extra_args: Vec<String>,
    pub timeout: Option<Duration>,
}

/// Spawn the configured CLI (`claude`, `codex`, or whatever `claude.command` names)
/// in `workdir` with `prompt` written to stdin. A non-zero exit surfaces as
/// `AgentExit`; exceeding `invocation.timeout` surfaces as `AgentTimeout`.
pub fn invoke(invocation: &AgentInvocation, unit_id: &str, prompt: &str, workdir: &Path) -> Result<CommandOutput, OrchestratorError> {
    let args: Vec<&str> = invocation.extra_args.iter().map(String::as_str).collect();
    let output = run_with_timeout(&invocation.command, &args, workdir, invocation.timeout, Some(prompt))
        .map_err(OrchestratorError::Other)?;

    if output.timed_out {
        return Err(OrchestratorError::AgentTimeout { unit: unit_id.to_string(), elapsed: output.duration });
    }
    if !output.success() {
        return Err(OrchestratorError::AgentExit { unit: unit_id.to_string(), code: output.exit_code });
    }
    Ok(output)
}

/// Build the task-loop prompt per §4.7.2b: the unit's plan excerpt, the current
/// task's content, the ready set's indices, and the "pick one, leave the rest"
/// instruction.
pub fn build_task_prompt(plan_excerpt: &str, task_content: &str, ready_indices: &[u32]) -> String {
    let indices = ready_indices.iter().map(u32::to_string).collect::<Vec<_>>().join(", ");
    format!(
        "# Plan\n{plan_excerpt}\n\n# Current task\n{task_content}\n\n# Ready tasks in this unit\n[{indices}]\n\nPick one ready task, do the work, and leave the rest alone."
    )
}

/// Build the merge-conflict resolution prompt per §4.9 step 4.
pub fn build_conflict_prompt(conflicted_files: &[String]) -> String {
    let files = conflicted_files.join("\n- ");
    format!(
        "Resolve these conflicts by editing, staging, and running `git rebase --continue`; do NOT push.\n\nConflicted files:\n- {files}"
    )
}

/// Build the PR review feedback prompt per §4.7 step 6.
pub fn build_feedback_prompt(comments: &[String]) -> String {
    let body = comments.join("\n---\n");
    format!("Address this review feedback, then commit your changes:\n\n{body}")
}
