//! Human-friendly durations in config files ("500ms", "10s", "5m", "1h", "1d").
//!
//! A bare integer (YAML number or unit-less string) is taken as seconds.

use serde::{Deserialize, Deserializer, Serializer};
use std::time::Duration;

const SECOND_MS: u64 = 1000;
const MINUTE_MS: u64 = 60 * SECOND_MS;
const HOUR_MS: u64 = 60 * MINUTE_MS;
const DAY_MS: u64 = 24 * HOUR_MS;

/// Suffixes tried when parsing. "ms" comes before "m" and "s".
const SUFFIXES: [(&str, u64); 5] = [
    ("ms", 1),
    ("d", DAY_MS),
    ("h", HOUR_MS),
    ("m", MINUTE_MS),
    ("s", SECOND_MS),
];

/// Units tried when formatting, largest first
const FORMAT_UNITS: [(u64, &str); 4] = [
    (DAY_MS, "d"),
    (HOUR_MS, "h"),
    (MINUTE_MS, "m"),
    (SECOND_MS, "s"),
];

/// A duration as written in YAML: a number of seconds or a suffixed string
#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Seconds(u64),
    Text(String),
}

impl RawDuration {
    fn into_duration(self) -> std::result::Result<Duration, String> {
        match self {
            RawDuration::Seconds(secs) => Ok(Duration::from_secs(secs)),
            RawDuration::Text(text) => parse_duration(&text),
        }
    }
}

/// Parse `<digits>[ms|s|m|h|d]`; no suffix means seconds
pub fn parse_duration(text: &str) -> std::result::Result<Duration, String> {
    let text = text.trim();
    let (digits, unit_ms) = SUFFIXES
        .iter()
        .find_map(|(suffix, ms)| text.strip_suffix(suffix).map(|rest| (rest.trim_end(), *ms)))
        .unwrap_or((text, SECOND_MS));

    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(format!(
            "invalid duration '{}', expected <number>[ms|s|m|h|d]",
            text
        ));
    }
    digits
        .parse::<u64>()
        .ok()
        .and_then(|count| count.checked_mul(unit_ms))
        .map(Duration::from_millis)
        .ok_or_else(|| format!("duration '{}' is out of range", text))
}

/// Format using the largest unit that divides the duration evenly
pub fn format_duration(duration: &Duration) -> String {
    let millis = duration.as_millis();
    if millis == 0 {
        return "0s".to_string();
    }
    FORMAT_UNITS
        .iter()
        .find(|(size, _)| millis % u128::from(*size) == 0)
        .map(|(size, unit)| format!("{}{}", millis / u128::from(*size), unit))
        .unwrap_or_else(|| format!("{}ms", millis))
}

pub fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    RawDuration::deserialize(deserializer)?
        .into_duration()
        .map_err(serde::de::Error::custom)
}

pub fn serialize_duration<S>(duration: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&format_duration(duration))
}
