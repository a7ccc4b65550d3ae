//! GitHub token resolution per §4.8: "Authentication resolves from environment
//! first, then the host CLI's token helper" — environment variables are checked
//! first, falling back to a `gh auth token` subprocess call.

use std::env;

use ralph_process::run_command;

const ENV_VARS: &[&str] = &["GH_TOKEN", "GITHUB_TOKEN"];

/// Resolve a GitHub token: environment variables first (`GH_TOKEN`, then
/// `GITHUB_TOKEN`), then the `gh auth token` CLI helper. Returns `None` if nothing
/// is configured.
pub fn resolve_token() -> Option<String> {
    for var in ENV_VARS {
        if let Ok(value) = env::var(var) {
            let trimmed = value.trim().to_string();
            if !trimmed.is_empty() {
                return Some(trimmed);
            }
        }
    }
    token_from_gh_cli()
}

fn token_from_gh_cli() -> Option<String> {
    let output = run_command("gh", &["auth", "token"], &std::env::current_dir().ok()?).ok()?;
    if !output.success() {
        return None;
    }
    let token = output.stdout.trim().to_string();
    if token.is_empty() { None } else { Some(token) }
}
