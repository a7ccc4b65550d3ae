//! Configuration file support for ralph (`.ralph.yaml`).
//!
//! A nested `#[serde(default)]` struct loaded from a single workspace-root YAML
//! file and validated with a `bail!`-chain, with environment-variable overrides
//! applied last so they win over both file values and defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use ralph_retry::RetryPolicy;
use ralph_types::BaselineCheck;
use ralph_webhook::WebhookConfig;
use serde::{Deserialize, Serialize};

pub const CONFIG_FILE_NAME: &str = ".ralph.yaml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub target_branch: String,
    pub parallelism: u32,
    pub github: GithubConfig,
    pub worktree: WorktreeConfig,
    pub claude: ClaudeConfig,
    pub baseline_checks: Vec<BaselineCheck>,
    pub merge: MergeConfig,
    pub review: ReviewConfig,
    pub log_level: String,
    pub code_review: CodeReviewConfig,
    pub retry: RetryConfig,
    pub webhook: WebhookConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            target_branch: "main".to_string(),
            parallelism: 4,
            github: GithubConfig::default(),
            worktree: WorktreeConfig::default(),
            claude: ClaudeConfig::default(),
            baseline_checks: Vec::new(),
            merge: MergeConfig::default(),
            review: ReviewConfig::default(),
            log_level: "info".to_string(),
            code_review: CodeReviewConfig::default(),
            retry: RetryConfig::default(),
            webhook: WebhookConfig::default(),
        }
    }
}

/// `owner`/`repo` can each be the literal string `"auto"`, meaning "detect from
/// `git remote get-url origin`", or an explicit name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepoField {
    Auto,
    Named(String),
}

impl Default for RepoField {
    fn default() -> Self {
        RepoField::Auto
    }
}

impl Serialize for RepoField {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            RepoField::Auto => serializer.serialize_str("auto"),
            RepoField::Named(name) => serializer.serialize_str(name),
        }
    }
}

impl<'de> Deserialize<'de> for RepoField {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(if raw.eq_ignore_ascii_case("auto") {
            RepoField::Auto
        } else {
            RepoField::Named(raw)
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GithubConfig {
    pub owner: RepoField,
    pub repo: RepoField,
}

/// Resolve `owner: auto` / `repo: auto` against `git remote get-url origin`,
/// matching `github.com/(owner)/(repo)(.git)?` in either HTTPS or SSH form.
pub fn detect_github_owner_repo(repo_root: &Path) -> Result<(String, String)> {
    let output = std::process::Command::new("git")
        .args(["remote", "get-url", "origin"])
        .current_dir(repo_root)
        .output()
        .context("failed to run `git remote get-url origin`")?;
    if !output.status.success() {
        bail!("git remote get-url origin failed: {}", String::from_utf8_lossy(&output.stderr));
    }
    let url = String::from_utf8_lossy(&output.stdout).trim().to_string();
    parse_github_owner_repo(&url).with_context(|| format!("could not parse github owner/repo from remote url: {url}"))
}

fn parse_github_owner_repo(url: &str) -> Option<(String, String)> {
    let after_host = url.split("github.com").nth(1)?;
    let trimmed = after_host.trim_start_matches([':', '/']).trim_end_matches(".git").trim_end_matches('/');
    let mut parts = trimmed.splitn(2, '/');
    let owner = parts.next()?.to_string();
    let repo = parts.next()?.to_string();
    if owner.is_empty() || repo.is_empty() {
        return None;
    }
    Some((owner, repo))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupCommand {
    pub command: String,
    pub r#if: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorktreeConfig {
    pub base_path: PathBuf,
    pub setup: Vec<SetupCommand>,
    pub teardown: Vec<SetupCommand>,
}

impl Default for WorktreeConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from(".ralph/worktrees"),
            setup: Vec::new(),
            teardown: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClaudeConfig {
    pub command: String,
    pub max_turns: Option<u32>,
}

impl Default for ClaudeConfig {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            max_turns: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    pub max_conflict_retries: u32,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self { max_conflict_retries: 3 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReviewConfig {
    #[serde(with = "ralph_duration::humantime_duration")]
    pub timeout: Duration,
    #[serde(with = "ralph_duration::humantime_duration")]
    pub poll_interval: Duration,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(2 * 3600),
            poll_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CodeReviewConfig {
    pub enabled: bool,
    pub provider: Option<String>,
    pub max_fix_iterations: u32,
    pub verbose: bool,
    pub command: Option<String>,
}

impl Default for CodeReviewConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: None,
            max_fix_iterations: 3,
            verbose: false,
            command: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub policy: RetryPolicy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { policy: RetryPolicy::AgentIteration }
    }
}

impl Config {
    /// Search `<workspace_root>/.ralph.yaml`. Returns `Ok(None)` if absent.
    pub fn load_from_workspace(workspace_root: &Path) -> Result<Option<Self>> {
        let path = workspace_root.join(CONFIG_FILE_NAME);
        if !path.exists() {
            return Ok(None);
        }
        Self::load_from_file(&path).map(Some)
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).with_context(|| format!("failed to read config file: {}", path.display()))?;
        serde_yaml::from_str(&content).with_context(|| format!("failed to parse config file: {}", path.display()))
    }

    /// Env vars win over both file values and defaults, applied last.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(cmd) = std::env::var("RALPH_CLAUDE_CMD") {
            self.claude.command = cmd;
        }
        if let Ok(base) = std::env::var("RALPH_WORKTREE_BASE") {
            self.worktree.base_path = PathBuf::from(base);
        }
        if let Ok(level) = std::env::var("RALPH_LOG_LEVEL") {
            self.log_level = level;
        }
    }

    /// Load from the workspace, falling back to defaults when no file exists, then
    /// apply env overrides and validate. This is the one entry point callers use.
    pub fn load(workspace_root: &Path) -> Result<Self> {
        let mut config = Self::load_from_workspace(workspace_root)?.unwrap_or_default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.parallelism == 0 {
            bail!("parallelism must be greater than 0");
        }
        if self.target_branch.trim().is_empty() {
            bail!("target_branch must not be empty");
        }
        if self.claude.command.trim().is_empty() {
            bail!("claude.command must not be empty");
        }
        if self.review.timeout.is_zero() {
            bail!("review.timeout must be greater than 0");
        }
        if self.review.poll_interval.is_zero() {
            bail!("review.poll_interval must be greater than 0");
        }
        if self.review.poll_interval > self.review.timeout {
            bail!("review.poll_interval must not exceed review.timeout");
        }
        for check in &self.baseline_checks {
            if check.name.trim().is_empty() {
                bail!("baseline_checks[].name must not be empty");
            }
            if check.command.trim().is_empty() {
                bail!("baseline_checks[].command must not be empty");
            }
        }
        if self.code_review.enabled && self.code_review.provider.is_none() && self.code_review.command.is_none() {
            bail!("code_review.enabled requires either a provider or an explicit command");
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tempfile::tempdir;

    struct EnvGuard {
        keys: &'static [&'static str],
    }

    impl EnvGuard {
        fn clear(keys: &'static [&'static str]) -> Self {
            for k in keys {
                unsafe { std::env::remove_var(k) };
            }
            EnvGuard { keys }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for k in self.keys {
                unsafe { std::env::remove_var(k) };
            }
        }
    }

    #[test]
    fn default_config_validates() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn load_from_workspace_returns_none_when_absent() {
        let dir = tempdir().unwrap();
        assert!(Config::load_from_workspace(dir.path()).unwrap().is_none());
    }

    #[test]
    fn load_from_file_parses_nested_yaml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            "target_branch: develop\nparallelism: 8\ngithub:\n  owner: acme\n  repo: widgets\nclaude:\n  command: codex\n"
        )
        .unwrap();
        let config = Config::load_from_file(&path).unwrap();
        assert_eq!(config.target_branch, "develop");
        assert_eq!(config.parallelism, 8);
        assert_eq!(config.github.owner, RepoField::Named("acme".into()));
        assert_eq!(config.claude.command, "codex");
    }

    #[test]
    fn missing_keys_fall_back_to_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "target_branch: develop\n").unwrap();
        let config = Config::load_from_file(&path).unwrap();
        assert_eq!(config.parallelism, 4);
        assert_eq!(config.claude.command, "claude");
    }

    #[test]
    #[serial_test::serial]
    fn env_overrides_win_over_file_values() {
        let _guard = EnvGuard::clear(&["RALPH_CLAUDE_CMD", "RALPH_WORKTREE_BASE", "RALPH_LOG_LEVEL"]);
        unsafe { std::env::set_var("RALPH_CLAUDE_CMD", "env-claude") };
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "claude:\n  command: file-claude\n").unwrap();
        let mut config = Config::load_from_file(&path).unwrap();
        config.apply_env_overrides();
        assert_eq!(config.claude.command, "env-claude");
    }

    #[test]
    #[serial_test::serial]
    fn no_env_override_keeps_file_value() {
        let _guard = EnvGuard::clear(&["RALPH_CLAUDE_CMD", "RALPH_WORKTREE_BASE", "RALPH_LOG_LEVEL"]);
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "claude:\n  command: file-claude\n").unwrap();
        let mut config = Config::load_from_file(&path).unwrap();
        config.apply_env_overrides();
        assert_eq!(config.claude.command, "file-claude");
    }

    #[test]
    fn validate_rejects_zero_parallelism() {
        let mut config = Config::default();
        config.parallelism = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_poll_interval_exceeding_timeout() {
        let mut config = Config::default();
        config.review.poll_interval = Duration::from_secs(10_000);
        config.review.timeout = Duration::from_secs(100);
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_code_review_enabled_without_provider_or_command() {
        let mut config = Config::default();
        config.code_review.enabled = true;
        assert!(config.validate().is_err());
    }

    #[test]
    fn parse_github_owner_repo_handles_https_and_ssh() {
        assert_eq!(parse_github_owner_repo("https://github.com/acme/widgets.git"), Some(("acme".into(), "widgets".into())));
        assert_eq!(parse_github_owner_repo("git@github.com:acme/widgets.git"), Some(("acme".into(), "widgets".into())));
        assert_eq!(parse_github_owner_repo("https://gitlab.com/acme/widgets.git"), None);
    }

    #[test]
    fn repo_field_auto_round_trips() {
        let yaml = serde_yaml::to_string(&RepoField::Auto).unwrap();
        let back: RepoField = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back, RepoField::Auto);
    }
}
