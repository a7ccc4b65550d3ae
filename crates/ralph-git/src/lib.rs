//! Git/worktree manager (§4.5). Wraps a small `git` subprocess runner; every
//! operation takes an explicit working directory and the runner is parameterizable
//! via `RALPH_GIT_BIN` so tests can substitute a fake shell-script binary.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

/// Resolve the `git` binary, honoring the test-injection override.
pub fn git_program() -> String {
    std::env::var("RALPH_GIT_BIN").unwrap_or_else(|_| "git".to_string())
}

fn git_command(workdir: &Path) -> Command {
    let mut cmd = Command::new(git_program());
    cmd.current_dir(workdir);
    // Clear git env vars so a worktree operation never inherits GIT_DIR/GIT_WORK_TREE
    // from a parent invocation (the orchestrator itself may be run from inside a
    // git repo's hooks, for instance).
    for var in ["GIT_DIR", "GIT_WORK_TREE", "GIT_INDEX_FILE"] {
        cmd.env_remove(var);
    }
    cmd
}

#[derive(Debug, Clone)]
pub struct GitOutput {
    pub status_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    pub fn success(&self) -> bool {
        self.status_code == Some(0)
    }
}

fn run(workdir: &Path, args: &[&str]) -> Result<GitOutput> {
    let output = git_command(workdir)
        .args(args)
        .output()
        .with_context(|| format!("failed to spawn `git {}`", args.join(" ")))?;
    Ok(GitOutput {
        status_code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

fn run_ok(workdir: &Path, args: &[&str]) -> Result<GitOutput> {
    let out = run(workdir, args)?;
    if !out.success() {
        bail!("git {} failed: {}", args.join(" "), out.stderr.trim());
    }
    Ok(out)
}

/// Snapshot of the repo's git state, collected at a few key points for diagnostics
/// and escalation payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitContext {
    pub commit: Option<String>,
    pub branch: Option<String>,
    pub dirty: bool,
}

pub fn collect_git_context(workdir: &Path) -> Option<GitContext> {
    let commit = run(workdir, &["rev-parse", "HEAD"]).ok().filter(|o| o.success()).map(|o| o.stdout.trim().to_string());
    let branch = run(workdir, &["rev-parse", "--abbrev-ref", "HEAD"]).ok().filter(|o| o.success()).map(|o| o.stdout.trim().to_string());
    let dirty = run(workdir, &["status", "--porcelain"]).ok().map(|o| !o.stdout.trim().is_empty()).unwrap_or(false);
    if commit.is_none() && branch.is_none() {
        return None;
    }
    Some(GitContext { commit, branch, dirty })
}

/// A setup command run on worktree creation, gated by an optional file-existence
/// predicate (`if: go.mod` ⇒ only run when `go.mod` exists in the worktree).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupCommand {
    pub command: String,
    pub r#if: Option<String>,
}

/// `create(unit, targetBranch)`: fresh worktree under `<base>/<unit>/`, branch forked
/// from `origin/<targetBranch>`.
pub fn create_worktree(
    repo_root: &Path,
    worktree_base: &Path,
    unit_id: &str,
    branch_name: &str,
    target_branch: &str,
) -> Result<PathBuf> {
    let path = worktree_base.join(unit_id);
    if path.exists() {
        bail!("worktree path already exists: {}", path.display());
    }
    fs::create_dir_all(worktree_base).context("failed to create worktree base directory")?;
    run_ok(
        repo_root,
        &[
            "worktree",
            "add",
            "-b",
            branch_name,
            path.to_str().context("worktree path is not valid UTF-8")?,
            &format!("origin/{target_branch}"),
        ],
    )?;
    Ok(path)
}

/// Run configured setup commands whose `if:` predicate (a relative path that must
/// exist in the worktree) is satisfied. Only the first matching command per
/// category runs — the caller passes already-filtered categories.
pub fn run_setup_commands(worktree: &Path, commands: &[SetupCommand]) -> Result<()> {
    for setup in commands {
        let satisfied = match &setup.r#if {
            Some(predicate) => worktree.join(predicate).exists(),
            None => true,
        };
        if !satisfied {
            continue;
        }
        let status = Command::new("sh")
            .arg("-c")
            .arg(&setup.command)
            .current_dir(worktree)
            .status()
            .with_context(|| format!("failed to spawn setup command `{}`", setup.command))?;
        if !status.success() {
            bail!("setup command `{}` exited with {:?}", setup.command, status.code());
        }
        break;
    }
    Ok(())
}

/// Stage everything and commit. `--no-verify` is the default so pre-commit hooks
/// cannot interfere with agent-written intermediate states.
pub fn commit(worktree: &Path, message: &str, no_verify: bool) -> Result<()> {
    run_ok(worktree, &["add", "-A"])?;
    let mut args = vec!["commit", "-m", message];
    if no_verify {
        args.push("--no-verify");
    }
    run_ok(worktree, &args)?;
    Ok(())
}

/// Attempts a rebase. Returns `(has_conflicts, stderr)`. Does not abort on
/// conflicts — the caller decides.
pub fn rebase(worktree: &Path, target_ref: &str) -> Result<(bool, String)> {
    let out = run(worktree, &["rebase", target_ref])?;
    if out.success() {
        return Ok((false, String::new()));
    }
    if is_rebase_in_progress(worktree)? {
        return Ok((true, out.stderr));
    }
    bail!("rebase onto {target_ref} failed without leaving a rebase in progress: {}", out.stderr.trim());
}

/// `git diff --name-only --diff-filter=U`.
pub fn conflicted_files(worktree: &Path) -> Result<Vec<String>> {
    let out = run_ok(worktree, &["diff", "--name-only", "--diff-filter=U"])?;
    Ok(out.stdout.lines().map(|l| l.trim().to_string()).filter(|l| !l.is_empty()).collect())
}

/// Best-effort; tolerates "no rebase in progress".
pub fn abort_rebase(worktree: &Path) -> Result<()> {
    let out = run(worktree, &["rebase", "--abort"])?;
    if out.success() || out.stderr.contains("No rebase in progress") {
        return Ok(());
    }
    bail!("rebase --abort failed: {}", out.stderr.trim());
}

/// Verify a rebase has actually concluded (no `.git/rebase-merge` or
/// `.git/rebase-apply`), respecting the worktree's gitdir indirection — a linked
/// worktree's `.git` is a file containing `gitdir: <path>`, not a directory.
pub fn is_rebase_in_progress(worktree: &Path) -> Result<bool> {
    let git_dir = resolve_git_dir(worktree)?;
    Ok(git_dir.join("rebase-merge").exists() || git_dir.join("rebase-apply").exists())
}

fn resolve_git_dir(worktree: &Path) -> Result<PathBuf> {
    let dot_git = worktree.join(".git");
    if dot_git.is_dir() {
        return Ok(dot_git);
    }
    let contents = fs::read_to_string(&dot_git)
        .with_context(|| format!("failed to read {}", dot_git.display()))?;
    let gitdir_line = contents
        .lines()
        .find_map(|l| l.strip_prefix("gitdir: "))
        .with_context(|| format!("{} does not contain a gitdir: line", dot_git.display()))?;
    let resolved = PathBuf::from(gitdir_line.trim());
    if resolved.is_absolute() {
        Ok(resolved)
    } else {
        Ok(worktree.join(resolved))
    }
}

/// Always `--force-with-lease`, never `--force`.
pub fn force_push_with_lease(worktree: &Path, branch: &str) -> Result<()> {
    let out = run(worktree, &["push", "--force-with-lease", "origin", branch])?;
    if out.success() {
        return Ok(());
    }
    if out.stderr.contains("stale info") || out.stderr.contains("rejected") {
        bail!("force-with-lease rejected (push race): {}", out.stderr.trim());
    }
    bail!("push failed: {}", out.stderr.trim());
}

pub fn fetch(repo_root: &Path, branch: &str) -> Result<()> {
    run_ok(repo_root, &["fetch", "origin", branch])?;
    Ok(())
}

/// Delete the directory and prune git's worktree record. Idempotent: a
/// already-removed path is not an error.
pub fn remove_worktree(repo_root: &Path, worktree: &Path) -> Result<()> {
    if worktree.exists() {
        let _ = run(repo_root, &["worktree", "remove", "--force", worktree.to_str().unwrap_or_default()]);
        if worktree.exists() {
            fs::remove_dir_all(worktree).with_context(|| format!("failed to remove {}", worktree.display()))?;
        }
    }
    let _ = run(repo_root, &["worktree", "prune"]);
    Ok(())
}

pub fn delete_branch(repo_root: &Path, branch: &str) -> Result<()> {
    let _ = run(repo_root, &["branch", "-D", branch]);
    let _ = run(repo_root, &["push", "origin", "--delete", branch]);
    Ok(())
}
