//! Duration parsing and serde codecs shared by kiln's config and domain types.
//!
//! Every duration field in `state.json`, `migration.json`, and the
//! environment-driven [`kiln-config`](https://docs.rs/kiln-config) layer
//! accepts either a humantime string (`"30s"`, `"5m"`) or a plain integer
//! number of seconds, and always serializes back out as seconds so the field
//! round-trips regardless of which form a human or another process wrote.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Parse a humantime string (`"30s"`, `"2m"`) or return an error naming the input.
pub fn parse_duration_str(s: &str) -> Result<Duration, String> {
    humantime::parse_duration(s).map_err(|e| format!("invalid duration {s:?}: {e}"))
}

/// Serde helper: accepts a humantime string or an integer number of seconds.
pub fn deserialize_duration_secs<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum DurationHelper {
        String(String),
        Seconds(f64),
    }

    match DurationHelper::deserialize(deserializer)? {
        DurationHelper::String(s) => {
            parse_duration_str(&s).map_err(serde::de::Error::custom)
        }
        DurationHelper::Seconds(secs) => {
            if secs < 0.0 {
                return Err(serde::de::Error::custom(format!(
                    "duration seconds must be non-negative, got {secs}"
                )));
            }
            Ok(Duration::from_secs_f64(secs))
        }
    }
}

/// Serialize a [`Duration`] as a floating-point number of seconds.
pub fn serialize_duration_secs<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Newtype wrapping [`Duration`] with the seconds-or-humantime-string serde form.
///
/// Used for fields that don't warrant a pair of `#[serde(with = "...")]`
/// functions on every struct, e.g. free-standing config maps.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DurationSecs(
    #[serde(
        deserialize_with = "deserialize_duration_secs",
        serialize_with = "serialize_duration_secs"
    )]
    pub Duration,
);

impl From<Duration> for DurationSecs {
    fn from(d: Duration) -> Self {
        Self(d)
    }
}

impl From<DurationSecs> for Duration {
    fn from(d: DurationSecs) -> Self {
        d.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_humantime_strings() {
        assert_eq!(parse_duration_str("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration_str("2m").unwrap(), Duration::from_secs(120));
    }

    #[test]
    fn rejects_garbage_strings() {
        assert!(parse_duration_str("not-a-duration").is_err());
    }

    #[test]
    fn duration_secs_round_trips_from_number() {
        let json = serde_json::json!(12.5);
        let parsed: DurationSecs = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.0, Duration::from_secs_f64(12.5));
        let back = serde_json::to_value(parsed).unwrap();
        assert_eq!(back, serde_json::json!(12.5));
    }

    #[test]
    fn duration_secs_round_trips_from_string() {
        let json = serde_json::json!("5m");
        let parsed: DurationSecs = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.0, Duration::from_secs(300));
    }

    #[test]
    fn negative_seconds_are_rejected() {
        let json = serde_json::json!(-1.0);
        let parsed: Result<DurationSecs, _> = serde_json::from_value(json);
        assert!(parsed.is_err());
    }
}
