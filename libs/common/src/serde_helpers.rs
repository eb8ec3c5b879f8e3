//! Shared Serde helpers
//!
//! Time periods in config files are written the way firmware configs write
//! them: `"500ms"`, `"60s"`, `"5min"`, `"1h"`, or a bare integer meaning
//! milliseconds.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serializer};

/// Parse a time period string
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let s = input.trim();
    if s.is_empty() {
        return Err("empty time period".to_string());
    }

    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    let (digits, suffix) = s.split_at(split);
    if digits.is_empty() {
        return Err(format!("time period '{}' has no number", input));
    }
    let value: u64 = digits
        .parse()
        .map_err(|e| format!("invalid time period '{}': {}", input, e))?;

    let millis = match suffix.trim() {
        "" | "ms" => Some(value),
        "s" | "sec" => value.checked_mul(1_000),
        "min" => value.checked_mul(60_000),
        "h" => value.checked_mul(3_600_000),
        other => {
            return Err(format!(
                "unknown unit '{}' in time period '{}', expected ms, s, min or h",
                other, input
            ))
        },
    };

    millis
        .map(Duration::from_millis)
        .ok_or_else(|| format!("time period '{}' is too large", input))
}

/// Format a duration in the largest unit that represents it exactly
pub fn format_duration(duration: Duration) -> String {
    let ms = duration.as_millis();
    if ms == 0 {
        return "0ms".to_string();
    }
    if ms % 3_600_000 == 0 {
        format!("{}h", ms / 3_600_000)
    } else if ms % 60_000 == 0 {
        format!("{}min", ms / 60_000)
    } else if ms % 1_000 == 0 {
        format!("{}s", ms / 1_000)
    } else {
        format!("{}ms", ms)
    }
}

/// `#[serde(with = "common::serde_helpers::duration_str")]`
pub mod duration_str {
    use super::*;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format_duration(*duration))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;

        #[derive(Deserialize)]
        #[serde(untagged)]
        enum StringOrInt {
            Int(u64),
            String(String),
        }

        match StringOrInt::deserialize(deserializer)? {
            StringOrInt::Int(ms) => Ok(Duration::from_millis(ms)),
            StringOrInt::String(s) => parse_duration(&s).map_err(D::Error::custom),
        }
    }
}
