//! Backoff and retry-budget primitives shared by the agent invoker, the merge
//! pipeline's conflict-resolution loop, and the PR gateway's forge HTTP client.

use std::time::Duration;

use rand::RngExt;
use serde::{Deserialize, Serialize};

/// The shape of the backoff curve between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategyType {
    /// No delay between attempts.
    Immediate,
    /// `base * 2^(attempt-1)`, capped at `max_delay`.
    #[default]
    Exponential,
    /// `base * attempt`, capped at `max_delay`.
    Linear,
    /// `base` on every attempt.
    Constant,
}

/// A concrete, fully-specified backoff configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryStrategyConfig {
    pub strategy: RetryStrategyType,
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Fraction of the computed delay randomized away, in `[0.0, 1.0]`.
    pub jitter: f64,
}

/// Named presets, mirroring the three tuning points the orchestrator actually needs:
/// patient agent retries, aggressive forge 5xx retries, and bounded conflict-resolution
/// attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Agent-iteration retries: exponential, 1s base, 30s cap, per §4.7.
    #[default]
    AgentIteration,
    /// Forge HTTP 5xx retries: exponential, 500ms base, 30s cap, ≤5 tries, per §4.8.
    ForgeHttp,
    /// Merge-pipeline conflict-resolution retries: linear backoff, bounded by
    /// `max_conflict_attempts` (default 3), per §4.9.
    ConflictResolution,
    Custom,
}

impl RetryPolicy {
    pub fn to_config(self) -> RetryStrategyConfig {
        match self {
            RetryPolicy::AgentIteration => RetryStrategyConfig {
                strategy: RetryStrategyType::Exponential,
                max_attempts: 6,
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(30),
                jitter: 0.2,
            },
            RetryPolicy::ForgeHttp => RetryStrategyConfig {
                strategy: RetryStrategyType::Exponential,
                max_attempts: 5,
                base_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(30),
                jitter: 0.3,
            },
            RetryPolicy::ConflictResolution => RetryStrategyConfig {
                strategy: RetryStrategyType::Linear,
                max_attempts: 3,
                base_delay: Duration::from_secs(2),
                max_delay: Duration::from_secs(20),
                jitter: 0.1,
            },
            RetryPolicy::Custom => RetryStrategyConfig {
                strategy: RetryStrategyType::Exponential,
                max_attempts: 6,
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(30),
                jitter: 0.2,
            },
        }
    }
}

/// Compute the delay before `attempt` (1-indexed), applying the configured jitter.
pub fn calculate_delay(config: &RetryStrategyConfig, attempt: u32) -> Duration {
    let raw = match config.strategy {
        RetryStrategyType::Immediate => Duration::ZERO,
        RetryStrategyType::Exponential => {
            let exp = attempt.saturating_sub(1).min(16);
            config.base_delay.saturating_mul(1u32.checked_shl(exp).unwrap_or(u32::MAX))
        }
        RetryStrategyType::Linear => config.base_delay.saturating_mul(attempt.max(1)),
        RetryStrategyType::Constant => config.base_delay,
    };
    let capped = raw.min(config.max_delay);
    apply_jitter(capped, config.jitter)
}

fn apply_jitter(delay: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 {
        return delay;
    }
    let jitter = jitter.clamp(0.0, 1.0);
    let factor = 1.0 - jitter + rand::rng().random::<f64>() * jitter;
    Duration::from_secs_f64(delay.as_secs_f64() * factor)
}

/// Drives a bounded retry loop, invoking `attempt_fn` up to `config.max_attempts`
/// times and sleeping the computed backoff between attempts. Returns the last error
/// if every attempt fails.
pub fn retry_with_backoff<T, E>(
    config: &RetryStrategyConfig,
    mut attempt_fn: impl FnMut(u32) -> Result<T, E>,
    mut sleep_fn: impl FnMut(Duration),
) -> Result<T, E> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match attempt_fn(attempt) {
            Ok(v) => return Ok(v),
            Err(e) => {
                if attempt >= config.max_attempts {
                    return Err(e);
                }
                sleep_fn(calculate_delay(config, attempt));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_doubles_each_attempt_before_cap() {
        let config = RetryStrategyConfig {
            strategy: RetryStrategyType::Exponential,
            max_attempts: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(100),
            jitter: 0.0,
        };
        assert_eq!(calculate_delay(&config, 1), Duration::from_secs(1));
        assert_eq!(calculate_delay(&config, 2), Duration::from_secs(2));
        assert_eq!(calculate_delay(&config, 3), Duration::from_secs(4));
    }

    #[test]
    fn exponential_respects_cap() {
        let config = RetryStrategyConfig {
            strategy: RetryStrategyType::Exponential,
            max_attempts: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            jitter: 0.0,
        };
        assert_eq!(calculate_delay(&config, 10), Duration::from_secs(5));
    }

    #[test]
    fn linear_scales_with_attempt() {
        let config = RetryStrategyConfig {
            strategy: RetryStrategyType::Linear,
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(100),
            jitter: 0.0,
        };
        assert_eq!(calculate_delay(&config, 3), Duration::from_secs(6));
    }

    #[test]
    fn constant_ignores_attempt() {
        let config = RetryStrategyConfig {
            strategy: RetryStrategyType::Constant,
            max_attempts: 5,
            base_delay: Duration::from_secs(3),
            max_delay: Duration::from_secs(100),
            jitter: 0.0,
        };
        assert_eq!(calculate_delay(&config, 1), Duration::from_secs(3));
        assert_eq!(calculate_delay(&config, 4), Duration::from_secs(3));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let config = RetryStrategyConfig {
            strategy: RetryStrategyType::Constant,
            max_attempts: 1,
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(10),
            jitter: 0.5,
        };
        for _ in 0..100 {
            let d = calculate_delay(&config, 1);
            assert!(d >= Duration::from_secs(5) && d <= Duration::from_secs(10));
        }
    }

    #[test]
    fn agent_iteration_preset_matches_spec_4_7() {
        let c = RetryPolicy::AgentIteration.to_config();
        assert_eq!(c.base_delay, Duration::from_secs(1));
        assert_eq!(c.max_delay, Duration::from_secs(30));
        assert_eq!(c.strategy, RetryStrategyType::Exponential);
    }

    #[test]
    fn forge_http_preset_caps_at_five_attempts() {
        assert_eq!(RetryPolicy::ForgeHttp.to_config().max_attempts, 5);
    }

    #[test]
    fn conflict_resolution_preset_caps_at_three_attempts() {
        assert_eq!(RetryPolicy::ConflictResolution.to_config().max_attempts, 3);
    }

    #[test]
    fn retry_with_backoff_returns_ok_on_eventual_success() {
        let config = RetryStrategyConfig {
            strategy: RetryStrategyType::Immediate,
            max_attempts: 3,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: 0.0,
        };
        let mut calls = 0;
        let mut sleeps = 0;
        let result: Result<u32, &str> = retry_with_backoff(
            &config,
            |attempt| {
                calls += 1;
                if attempt < 3 { Err("not yet") } else { Ok(attempt) }
            },
            |_| sleeps += 1,
        );
        assert_eq!(result, Ok(3));
        assert_eq!(calls, 3);
        assert_eq!(sleeps, 2);
    }

    #[test]
    fn retry_with_backoff_surfaces_last_error_on_exhaustion() {
        let config = RetryStrategyConfig {
            strategy: RetryStrategyType::Immediate,
            max_attempts: 2,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: 0.0,
        };
        let result: Result<(), &str> =
            retry_with_backoff(&config, |_| Err("still failing"), |_| {});
        assert_eq!(result, Err("still failing"));
    }

    proptest::proptest! {
        #[test]
        fn delay_never_exceeds_max(base_secs in 1u64..10, max_secs in 1u64..50, attempt in 1u32..20) {
            let config = RetryStrategyConfig {
                strategy: RetryStrategyType::Exponential,
                max_attempts: 20,
                base_delay: Duration::from_secs(base_secs),
                max_delay: Duration::from_secs(max_secs),
                jitter: 0.0,
            };
            let d = calculate_delay(&config, attempt);
            proptest::prop_assert!(d <= Duration::from_secs(max_secs));
        }
    }
}
