//! Webhook escalation delivery (§4.11): fire-and-forget HTTP POST with an optional
//! HMAC-SHA256 body signature, carrying the orchestrator's escalation vocabulary
//! (`EscalationSeverity` + a free-text message).

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use ralph_types::EscalationSeverity;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    pub enabled: bool,
    pub url: Option<String>,
    pub secret: Option<String>,
    pub timeout: Duration,
    /// Only escalations at or above this severity are delivered.
    pub min_severity: EscalationSeverity,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: None,
            secret: None,
            timeout: Duration::from_secs(30),
            min_severity: EscalationSeverity::Info,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationPayload {
    pub timestamp: DateTime<Utc>,
    pub severity: EscalationSeverity,
    pub unit: Option<String>,
    pub message: String,
}

/// Fire-and-forget delivery client. A failure here never blocks the caller — the
/// orchestrator's own event stream is the durable record, a webhook is a
/// best-effort side notification.
pub struct WebhookClient {
    client: reqwest::blocking::Client,
    url: String,
    secret: Option<String>,
    min_severity: EscalationSeverity,
}

impl WebhookClient {
    pub fn new(config: &WebhookConfig) -> Result<Self> {
        let url = config.url.clone().context("webhook URL is required when webhooks are enabled")?;
        let client = reqwest::blocking::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("failed to build webhook HTTP client")?;
        Ok(Self {
            client,
            url,
            secret: config.secret.clone(),
            min_severity: config.min_severity,
        })
    }

    /// Deliver an escalation if its severity clears the configured floor. Spawns a
    /// thread so a slow or unreachable endpoint never stalls the unit that raised
    /// the escalation.
    pub fn escalate(&self, severity: EscalationSeverity, unit: Option<String>, message: String) {
        if severity < self.min_severity {
            return;
        }
        let client = self.client.clone();
        let url = self.url.clone();
        let secret = self.secret.clone();
        std::thread::spawn(move || {
            let payload = EscalationPayload {
                timestamp: Utc::now(),
                severity,
                unit,
                message,
            };
            if let Err(e) = do_send(&client, &url, secret.as_deref(), &payload) {
                eprintln!("[warn] webhook delivery failed (non-blocking): {e:#}");
            }
        });
    }
}

fn do_send(
    client: &reqwest::blocking::Client,
    url: &str,
    secret: Option<&str>,
    payload: &EscalationPayload,
) -> Result<()> {
    let json = serde_json::to_string(payload).context("failed to serialize escalation payload")?;
    let mut request = client.post(url).header("Content-Type", "application/json");

    if let Some(secret) = secret {
        use hmac::{Hmac, Mac};
        use sha2::Sha256;
        type HmacSha256 = Hmac<Sha256>;
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
        mac.update(json.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());
        request = request.header("X-Ralph-Signature", format!("sha256={signature}"));
    }

    let response = request.body(json).send().context("failed to send webhook request")?;
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().unwrap_or_default();
        anyhow::bail!("webhook returned error status {status}: {body}");
    }
    Ok(())
}

/// Convenience entry point: build a client and deliver, doing nothing if webhooks
/// are disabled or incompletely configured. Intended for call sites that don't want
/// to hold a long-lived `WebhookClient`.
pub fn maybe_escalate(config: &WebhookConfig, severity: EscalationSeverity, unit: Option<String>, message: String) {
    if !config.enabled {
        return;
    }
    let Some(url) = config.url.as_ref().filter(|u| !u.is_empty()) else {
        return;
    };
    if severity < config.min_severity {
        return;
    }

    let client = match reqwest::blocking::Client::builder().timeout(config.timeout).build() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("[warn] failed to build webhook client: {e:#}");
            return;
        }
    };
    let url = url.clone();
    let secret = config.secret.clone();

    std::thread::spawn(move || {
        let payload = EscalationPayload {
            timestamp: Utc::now(),
            severity,
            unit,
            message,
        };
        if let Err(e) = do_send(&client, &url, secret.as_deref(), &payload) {
            eprintln!("[warn] webhook delivery failed (non-blocking): {e:#}");
        }
    });
}
