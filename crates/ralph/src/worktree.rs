//! Thin composition layer over `ralph-git` (§4.5), translating `ralph-config`'s
//! `SetupCommand`/`WorktreeConfig` into the forms `ralph-git` understands and naming
//! worktree branches per the `<prefix>/<unit>-<suffix>` convention.

use std::path::{Path, PathBuf};

use anyhow::Result;
use rand::RngExt;
use ralph_config::{SetupCommand as ConfigSetupCommand, WorktreeConfig};

const BRANCH_PREFIX: &str = "ralph";
const RANDOM_SUFFIX_LEN: usize = 6;
const SUFFIX_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Generate a 6-character alphanumeric fallback suffix. Used when the agent-naming
/// call fails or is not wired up, per §4.5: "on any failure, falls back to a 6-char
/// alphanumeric random suffix."
pub fn random_suffix() -> String {
    let mut rng = rand::rng();
    (0..RANDOM_SUFFIX_LEN).map(|_| SUFFIX_ALPHABET[rng.random_range(0..SUFFIX_ALPHABET.len())] as char).collect()
}

pub fn branch_name(unit_id: &str, suffix: &str) -> String {
    format!("{BRANCH_PREFIX}/{unit_id}-{suffix}")
}

fn to_git_setup_commands(commands: &[ConfigSetupCommand]) -> Vec<ralph_git::SetupCommand> {
    commands.iter().map(|c| ralph_git::SetupCommand { command: c.command.clone(), r#if: c.r#if.clone() }).collect()
}

pub struct WorktreeHandle {
    pub path: PathBuf,
    pub branch: String,
}

/// Create the worktree under `<worktree base>/<unit>/`, on a branch forked from
/// `origin/<target_branch>`, then run the configured setup commands.
pub fn create(
    repo_root: &Path,
    config: &WorktreeConfig,
    unit_id: &str,
    target_branch: &str,
    suffix: &str,
) -> Result<WorktreeHandle> {
    let branch = branch_name(unit_id, suffix);
    let worktree_base = if config.base_path.is_absolute() { config.base_path.clone() } else { repo_root.join(&config.base_path) };
    let path = ralph_git::create_worktree(repo_root, &worktree_base, unit_id, &branch, target_branch)?;
    ralph_git::run_setup_commands(&path, &to_git_setup_commands(&config.setup))?;
    Ok(WorktreeHandle { path, branch })
}

/// Idempotent teardown: removes the worktree directory and its git record. The
/// branch itself is left for the merge pipeline's post-batch delete phase.
pub fn teardown(repo_root: &Path, config: &WorktreeConfig, handle: &WorktreeHandle) -> Result<()> {
    ralph_git::run_setup_commands(&handle.path, &to_git_setup_commands(&config.teardown)).ok();
    ralph_git::remove_worktree(repo_root, &handle.path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_name_follows_prefix_unit_suffix_convention() {
        assert_eq!(branch_name("01-setup", "ab12cd"), "ralph/01-setup-ab12cd");
    }

    #[test]
    fn random_suffix_has_expected_length_and_alphabet() {
        let suffix = random_suffix();
        assert_eq!(suffix.len(), RANDOM_SUFFIX_LEN);
        assert!(suffix.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn random_suffix_is_not_constant() {
        let a = random_suffix();
        let b = random_suffix();
        // Flaky only with probability ~36^-6; acceptable for a smoke test.
        assert_ne!(a, b);
    }
}
