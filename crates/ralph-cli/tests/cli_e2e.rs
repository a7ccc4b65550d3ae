#![allow(unsafe_code)]

use std::env;
use std::fs;
use std::path::Path;

use assert_cmd::Command;
use predicates::str::contains;
use serial_test::serial;
use tempfile::tempdir;

fn write_executable(path: &Path, script: &str) {
    fs::write(
        path,
        format!("#!/usr/bin/env sh\n{script}\n"),
    )
    .expect("write");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755)).expect("chmod");
    }
}

fn write_unit(root: &Path, id: &str) {
    let dir = root.join(id);
    fs::create_dir_all(&dir).expect("mkdir");
    fs::write(dir.join("IMPLEMENTATION_PLAN.md"), format!("---\nunit: {id}\ndepends_on: []\n---\n# Plan\n")).expect("write");
    fs::write(
        dir.join("01-do.md"),
        "---\ntask: 1\nstatus: pending\nbackpressure: \"true\"\ndepends_on: []\n---\n# Do the thing\nBody.\n",
    )
    .expect("write");
}

#[test]
fn prints_help_without_a_repo() {
    let mut cmd = Command::cargo_bin("ralph").expect("binary");
    cmd.arg("--help");
    cmd.assert().success().stdout(contains("Orchestrates autonomous coding agents"));
}

#[test]
fn status_with_persistence_disabled_is_rejected() {
    let td = tempdir().expect("tempdir");
    let mut cmd = Command::cargo_bin("ralph").expect("binary");
    cmd.arg("--repo").arg(td.path()).arg("--no-persist").arg("status");
    cmd.assert().failure().stderr(contains("a store path is required"));
}

#[test]
#[serial]
fn run_completes_a_single_independent_unit_with_no_pr() {
    let repo_root = tempdir().expect("tempdir");
    let tasks_dir = repo_root.path().join("tasks");
    write_unit(&tasks_dir, "01-setup");

    let fake_git = repo_root.path().join("fake-git.sh");
    write_executable(&fake_git, "case \"$1 $2\" in\n  \"worktree add\") mkdir -p \"$5\" ;;\nesac\nexit 0");

    let fake_agent = repo_root.path().join("fake-agent.sh");
    write_executable(&fake_agent, "cat > /dev/null; echo ok");

    let config_path = repo_root.path().join(".ralph.yaml");
    fs::write(
        &config_path,
        format!(
            "parallelism: 1\nclaude:\n  command: \"{}\"\nworktree:\n  base_path: worktrees\ngithub:\n  owner: acme\n  repo: widgets\n",
            fake_agent.to_string_lossy()
        ),
    )
    .expect("write config");

    let old_git_bin = env::var("RALPH_GIT_BIN").ok();
    unsafe { env::set_var("RALPH_GIT_BIN", &fake_git) };

    let mut cmd = Command::cargo_bin("ralph").expect("binary");
    cmd.arg("--repo")
        .arg(repo_root.path())
        .arg("--config")
        .arg(&config_path)
        .arg("--no-persist")
        .arg("run")
        .arg(&tasks_dir)
        .arg("--feature-branch")
        .arg("agents/batch-1")
        .arg("--run-id")
        .arg("run-cli-1")
        .arg("--no-pr");
    cmd.assert().success().stdout(contains("run run-cli-1 finished: complete")).stdout(contains("01-setup: Complete"));

    match old_git_bin {
        Some(v) => unsafe { env::set_var("RALPH_GIT_BIN", v) },
        None => unsafe { env::remove_var("RALPH_GIT_BIN") },
    }
}

#[test]
#[serial]
fn status_lists_a_persisted_run_after_completion() {
    let repo_root = tempdir().expect("tempdir");
    let tasks_dir = repo_root.path().join("tasks");
    write_unit(&tasks_dir, "01-setup");

    let fake_git = repo_root.path().join("fake-git.sh");
    write_executable(&fake_git, "case \"$1 $2\" in\n  \"worktree add\") mkdir -p \"$5\" ;;\nesac\nexit 0");

    let fake_agent = repo_root.path().join("fake-agent.sh");
    write_executable(&fake_agent, "cat > /dev/null; echo ok");

    let config_path = repo_root.path().join(".ralph.yaml");
    fs::write(
        &config_path,
        format!(
            "parallelism: 1\nclaude:\n  command: \"{}\"\nworktree:\n  base_path: worktrees\ngithub:\n  owner: acme\n  repo: widgets\n",
            fake_agent.to_string_lossy()
        ),
    )
    .expect("write config");

    let store_path = repo_root.path().join("daemon.db");

    let old_git_bin = env::var("RALPH_GIT_BIN").ok();
    unsafe { env::set_var("RALPH_GIT_BIN", &fake_git) };

    let mut run_cmd = Command::cargo_bin("ralph").expect("binary");
    run_cmd
        .arg("--repo")
        .arg(repo_root.path())
        .arg("--config")
        .arg(&config_path)
        .arg("--store")
        .arg(&store_path)
        .arg("run")
        .arg(&tasks_dir)
        .arg("--feature-branch")
        .arg("agents/batch-1")
        .arg("--run-id")
        .arg("run-cli-2")
        .arg("--no-pr");
    run_cmd.assert().success();

    // The run completed, so it is no longer pending/running and must not be listed.
    let mut status_cmd = Command::cargo_bin("ralph").expect("binary");
    status_cmd.arg("--repo").arg(repo_root.path()).arg("--store").arg(&store_path).arg("status");
    status_cmd.assert().success().stdout(contains("no resumable runs"));

    match old_git_bin {
        Some(v) => unsafe { env::set_var("RALPH_GIT_BIN", v) },
        None => unsafe { env::remove_var("RALPH_GIT_BIN") },
    }
}
