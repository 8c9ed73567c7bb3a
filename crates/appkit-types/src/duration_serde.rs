//! Serde helpers for human-readable durations (`"500ms"`, `"10s"`, `"5m"`, `"1h"`).

use serde::{self, Deserialize, Deserializer, Serializer};
use std::time::Duration;

pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let ms = duration.as_millis();
    serializer.serialize_str(&format!("{}ms", ms))
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_duration(&s).map_err(serde::de::Error::custom)
}

/// Parse a duration string. Also used as a clap value parser.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let (digits, unit_ms) = if let Some(val) = s.strip_suffix("ms") {
        (val, 1)
    } else if let Some(val) = s.strip_suffix('s') {
        (val, 1_000)
    } else if let Some(val) = s.strip_suffix('m') {
        (val, 60_000)
    } else if let Some(val) = s.strip_suffix('h') {
        (val, 3_600_000)
    } else {
        return Err(format!("unknown duration format: {}", s));
    };
    let n: u64 = digits
        .parse()
        .map_err(|e| format!("invalid duration '{}': {}", s, e))?;
    Ok(Duration::from_millis(n.saturating_mul(unit_ms)))
}
