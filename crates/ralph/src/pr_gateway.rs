//! PR gateway (§4.8): a typed client over GitHub's REST API plus a review-state
//! polling state machine. A thin wrapper over `reqwest::blocking::Client` matching
//! on `StatusCode`; 5xx and rate-limit responses are retried in-client with
//! exponential backoff (honoring `retry-after` when present), while 4xx responses
//! fail the call immediately for the caller to handle.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use ralph_retry::{calculate_delay, RetryPolicy};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use ralph_types::{review_state_from_signals, ReviewState};
use serde::Deserialize;

use crate::auth;
use crate::error::OrchestratorError;

/// Drives `attempt` up to `RetryPolicy::ForgeHttp`'s attempt cap, retrying only
/// errors `OrchestratorError::is_retryable()` marks as such (5xx, rate-limit) and
/// honoring a rate-limit response's `retry-after` header over the computed backoff
/// when present, per §7's forge error table.
fn retry_forge<T>(mut attempt: impl FnMut(u32) -> Result<T, OrchestratorError>) -> Result<T, OrchestratorError> {
    let config = RetryPolicy::ForgeHttp.to_config();
    let mut n = 0;
    loop {
        n += 1;
        match attempt(n) {
            Ok(v) => return Ok(v),
            Err(err) if err.is_retryable() && n < config.max_attempts => {
                let delay = match &err {
                    OrchestratorError::ForgeRateLimited { retry_after: Some(d) } => *d,
                    _ => calculate_delay(&config, n),
                };
                std::thread::sleep(delay);
            }
            Err(err) => return Err(err),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Reaction {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ReviewComment {
    body: String,
    created_at: DateTime<Utc>,
}

pub enum PollOutcome {
    ShouldMerge,
    ChangesRequested(Vec<String>),
    TimedOut,
}

pub trait PrGateway: Send + Sync {
    fn get_review_status(&self, pr_number: u64) -> Result<ReviewState, OrchestratorError>;
    fn poll_review(&self, pr_number: u64, started_at: Instant, timeout: Duration, poll_interval: Duration) -> Result<PollOutcome, OrchestratorError>;
    fn get_unaddressed_comments(&self, pr_number: u64, since: DateTime<Utc>) -> Result<Vec<String>, OrchestratorError>;
    fn merge(&self, pr_number: u64) -> Result<(), OrchestratorError>;
}

pub struct GithubPrGateway {
    owner: String,
    repo: String,
    http: Client,
}

impl GithubPrGateway {
    pub fn new(owner: String, repo: String) -> Result<Self> {
        let http = Client::builder().user_agent(format!("ralph/{}", env!("CARGO_PKG_VERSION"))).build().context("failed to build HTTP client")?;
        Ok(GithubPrGateway { owner, repo, http })
    }

    fn authed(&self, builder: reqwest::blocking::RequestBuilder) -> reqwest::blocking::RequestBuilder {
        match auth::resolve_token() {
            Some(token) => builder.header("Authorization", format!("Bearer {token}")),
            None => builder,
        }
    }

    fn reactions_url(&self, pr_number: u64) -> String {
        format!("https://api.github.com/repos/{}/{}/issues/{pr_number}/reactions", self.owner, self.repo)
    }

    fn comments_url(&self, pr_number: u64) -> String {
        format!("https://api.github.com/repos/{}/{}/pulls/{pr_number}/comments", self.owner, self.repo)
    }

    fn merge_url(&self, pr_number: u64) -> String {
        format!("https://api.github.com/repos/{}/{}/pulls/{pr_number}/merge", self.owner, self.repo)
    }

    fn fetch_signals(&self, pr_number: u64) -> Result<(bool, bool, bool), OrchestratorError> {
        let reactions: Vec<Reaction> = retry_forge(|_attempt| {
            let resp = self.authed(self.http.get(self.reactions_url(pr_number))).send().map_err(|e| OrchestratorError::Other(e.into()))?;
            match resp.status() {
                StatusCode::OK => resp.json().map_err(|e| OrchestratorError::Other(e.into())),
                StatusCode::TOO_MANY_REQUESTS => Err(OrchestratorError::ForgeRateLimited { retry_after: retry_after(&resp) }),
                s if s.is_server_error() => Err(OrchestratorError::ForgeServerError { status: s.as_u16(), body: resp.text().unwrap_or_default() }),
                s => Err(OrchestratorError::ForgeClientError { status: s.as_u16(), body: resp.text().unwrap_or_default() }),
            }
        })?;
        let has_thumbs_up = reactions.iter().any(|r| r.content == "+1");
        let has_eyes = reactions.iter().any(|r| r.content == "eyes");

        let comments = self.fetch_comments(pr_number)?;
        Ok((has_thumbs_up, has_eyes, !comments.is_empty()))
    }

    fn fetch_comments(&self, pr_number: u64) -> Result<Vec<ReviewComment>, OrchestratorError> {
        retry_forge(|_attempt| {
            let resp = self.authed(self.http.get(self.comments_url(pr_number))).send().map_err(|e| OrchestratorError::Other(e.into()))?;
            match resp.status() {
                StatusCode::OK => resp.json().map_err(|e| OrchestratorError::Other(e.into())),
                StatusCode::TOO_MANY_REQUESTS => Err(OrchestratorError::ForgeRateLimited { retry_after: retry_after(&resp) }),
                s if s.is_server_error() => Err(OrchestratorError::ForgeServerError { status: s.as_u16(), body: resp.text().unwrap_or_default() }),
                s => Err(OrchestratorError::ForgeClientError { status: s.as_u16(), body: resp.text().unwrap_or_default() }),
            }
        })
    }
}

fn retry_after(resp: &reqwest::blocking::Response) -> Option<Duration> {
    resp.headers().get("retry-after").and_then(|v| v.to_str().ok()).and_then(|s| s.parse::<u64>().ok()).map(Duration::from_secs)
}

impl PrGateway for GithubPrGateway {
    fn get_review_status(&self, pr_number: u64) -> Result<ReviewState, OrchestratorError> {
        let (thumbs_up, eyes, has_comment) = self.fetch_signals(pr_number)?;
        Ok(review_state_from_signals(thumbs_up, eyes, has_comment))
    }

    fn poll_review(&self, pr_number: u64, started_at: Instant, timeout: Duration, poll_interval: Duration) -> Result<PollOutcome, OrchestratorError> {
        loop {
            if started_at.elapsed() > timeout {
                return Ok(PollOutcome::TimedOut);
            }
            let state = self.get_review_status(pr_number)?;
            match state {
                ReviewState::Approved => return Ok(PollOutcome::ShouldMerge),
                ReviewState::ChangesRequested => {
                    let comments = self.get_unaddressed_comments(pr_number, Utc::now())?;
                    return Ok(PollOutcome::ChangesRequested(comments));
                }
                ReviewState::InReview | ReviewState::Pending => {
                    std::thread::sleep(poll_interval);
                }
            }
        }
    }

    fn get_unaddressed_comments(&self, pr_number: u64, since: DateTime<Utc>) -> Result<Vec<String>, OrchestratorError> {
        let comments = self.fetch_comments(pr_number)?;
        Ok(comments.into_iter().filter(|c| c.created_at > since).map(|c| c.body).collect())
    }

    fn merge(&self, pr_number: u64) -> Result<(), OrchestratorError> {
        retry_forge(|_attempt| {
            let resp = self
                .authed(self.http.put(self.merge_url(pr_number)).json(&serde_json::json!({ "merge_method": "squash" })))
                .send()
                .map_err(|e| OrchestratorError::Other(e.into()))?;
            match resp.status() {
                StatusCode::OK => Ok(()),
                StatusCode::TOO_MANY_REQUESTS => Err(OrchestratorError::ForgeRateLimited { retry_after: retry_after(&resp) }),
                s if s.is_server_error() => Err(OrchestratorError::ForgeServerError { status: s.as_u16(), body: resp.text().unwrap_or_default() }),
                s => Err(OrchestratorError::ForgeClientError { status: s.as_u16(), body: resp.text().unwrap_or_default() }),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn review_state_precedence_matches_data_model() {
        assert_eq!(review_state_from_signals(true, false, true), ReviewState::Approved);
        assert_eq!(review_state_from_signals(false, true, false), ReviewState::InReview);
        assert_eq!(review_state_from_signals(false, false, true), ReviewState::ChangesRequested);
        assert_eq!(review_state_from_signals(false, false, false), ReviewState::Pending);
    }

    #[test]
    fn gateway_urls_are_well_formed() {
        let gw = GithubPrGateway::new("octo".into(), "repo".into()).unwrap();
        assert_eq!(gw.reactions_url(42), "https://api.github.com/repos/octo/repo/issues/42/reactions");
        assert_eq!(gw.merge_url(42), "https://api.github.com/repos/octo/repo/pulls/42/merge");
    }
}
