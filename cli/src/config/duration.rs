//! Humantime (de)serialization for durations in pipeline files.
//!
//! Durations are written the way operators type them: `30m`, `1day`, `12h`.

use serde::{Deserialize, Deserializer, Serializer};
use std::time::Duration;

pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&humantime::format_duration(*value).to_string())
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse(&raw).map_err(serde::de::Error::custom)
}

/// Parse a humantime duration, rejecting signs so a negative value reads as
/// an error rather than a confusing unit message.
pub fn parse(raw: &str) -> Result<Duration, String> {
    let trimmed = raw.trim();
    if trimmed.starts_with('-') {
        return Err(format!("duration '{}' cannot be negative", raw));
    }
    humantime::parse_duration(trimmed).map_err(|e| format!("invalid duration '{}': {}", raw, e))
}

/// Same as the parent module, for `Option<Duration>` fields.
pub mod option {
    use super::*;

    pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(duration) => super::serialize(duration, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<String>::deserialize(deserializer)?;
        raw.map(|s| parse(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
