//! Utility functions and helpers for configuration

use serde::{Deserialize, Deserializer, Serializer};
use std::time::Duration;

/// Serde helper module for Duration serialization as milliseconds
pub mod serde_duration_ms {
    use super::*;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Default for boolean flags that start disabled
pub fn default_false() -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    #[derive(Serialize, Deserialize)]
    struct Wrapper {
        #[serde(with = "serde_duration_ms")]
        timeout: Duration,
    }

    #[test]
    fn test_duration_as_millis() {
        let yaml = serde_yaml::to_string(&Wrapper { timeout: Duration::from_millis(2500) }).unwrap();
        assert_eq!(yaml.trim(), "timeout: 2500");

        let parsed: Wrapper = serde_yaml::from_str("timeout: 150").unwrap();
        assert_eq!(parsed.timeout, Duration::from_millis(150));
    }
}
