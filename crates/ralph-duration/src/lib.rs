//! Human-readable duration parsing and serde codecs shared across the orchestrator.
//!
//! Every duration in config files, CLI flags, and persisted records is written as a
//! humantime string (`"30s"`, `"2h"`, `"500ms"`) and deserialized into a `Duration`.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Serde helper for `Duration` fields stored as humantime strings.
///
/// ```ignore
/// #[serde(with = "ralph_duration::humantime_duration")]
/// timeout: Duration,
/// ```
pub mod humantime_duration {
    use super::*;

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        humantime::format_duration(*value)
            .to_string()
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

/// As [`humantime_duration`] but for `Option<Duration>`; absent/`null` stays `None`.
pub mod humantime_duration_opt {
    use super::*;

    pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(d) => humantime::format_duration(*d).to_string().serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        match raw {
            Some(s) => parse_duration(&s).map(Some).map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

/// Parse a humantime duration string, surfacing a plain error message on failure.
pub fn parse_duration(raw: &str) -> Result<Duration, String> {
    humantime::parse_duration(raw.trim()).map_err(|e| format!("invalid duration {raw:?}: {e}"))
}

/// Render a `Duration` back to its canonical humantime string.
pub fn format_duration(value: Duration) -> String {
    humantime::format_duration(value).to_string()
}
