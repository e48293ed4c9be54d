//! Serde helpers shared by the configuration types

/// Durations stored as whole seconds
///
/// Keeps timeouts readable in the TOML file (`connect_timeout = 30`).
pub mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Timeouts {
        #[serde(with = "duration_secs")]
        shutdown: Duration,
    }

    #[test]
    fn test_reads_seconds_from_toml() {
        let parsed: Timeouts = toml::from_str("shutdown = 45").unwrap();
        assert_eq!(parsed.shutdown, Duration::from_secs(45));
    }

    #[test]
    fn test_writes_whole_seconds() {
        let value = Timeouts {
            shutdown: Duration::from_millis(30_900),
        };
        let text = toml::to_string(&value).unwrap();
        assert_eq!(text.trim(), "shutdown = 30");
    }

    #[test]
    fn test_rejects_negative_seconds() {
        assert!(toml::from_str::<Timeouts>("shutdown = -1").is_err());
    }
}
