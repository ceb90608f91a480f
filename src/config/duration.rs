use std::time::Duration;

use serde::{Deserialize, Deserializer, Serializer, de};

pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match duration.subsec_millis() {
        0 => serializer.serialize_str(&format!("{}s", duration.as_secs())),
        _ => serializer.serialize_str(&format!("{}ms", duration.as_millis())),
    }
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let value = String::deserialize(deserializer)?;
    parse(&value).map_err(de::Error::custom)
}

/// Parses `500ms`, `30s`, `2m` or `1h`. A bare number is seconds.
pub(crate) fn parse(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (amount, unit) = value.split_at(split);

    let amount: u64 = amount
        .parse()
        .map_err(|_| format!("invalid duration {value:?}"))?;

    match unit.trim() {
        "ms" => Ok(Duration::from_millis(amount)),
        "" | "s" => Ok(Duration::from_secs(amount)),
        "m" => Ok(Duration::from_secs(amount * 60)),
        "h" => Ok(Duration::from_secs(amount * 60 * 60)),
        other => Err(format!("unknown duration unit {other:?} in {value:?}")),
    }
}
