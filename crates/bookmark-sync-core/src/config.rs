//! Engine timing and layout settings.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Settings shared by the coordinator and both pipelines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    /// Quiet period before the upstream pipeline pushes
    #[serde(with = "millis")]
    pub debounce: Duration,
    /// How long the suppress flag stays up after a downstream apply
    #[serde(with = "millis")]
    pub grace_period: Duration,
    /// Attempts per `sync_now` call
    pub max_attempts: u32,
    /// Backoff before retry n is `backoff_unit * 2^n`
    #[serde(with = "millis")]
    pub backoff_unit: Duration,
    /// Expiry of the ignore-next-remote-change flag
    #[serde(with = "millis")]
    pub echo_ttl: Duration,
    /// Remote root holding `{uid}/tree` and `{uid}/metadata`
    pub namespace: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(1000),
            grace_period: Duration::from_millis(500),
            max_attempts: 3,
            backoff_unit: Duration::from_secs(1),
            echo_ttl: Duration::from_secs(5),
            namespace: "bookmarks".to_string(),
        }
    }
}

impl SyncConfig {
    /// Delay to wait after failed attempt number `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_unit
            .saturating_mul(2u32.saturating_pow(attempt))
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_backoff_doubles() {
        let config = SyncConfig::default();
        assert_eq!(config.backoff(0), Duration::from_secs(1));
        assert_eq!(config.backoff(1), Duration::from_secs(2));
        assert_eq!(config.backoff(2), Duration::from_secs(4));
    }

    #[test]
    fn test_config_partial_json_uses_defaults() {
        let config: SyncConfig = serde_json::from_value(json!({ "debounce": 250 })).unwrap();
        assert_eq!(config.debounce, Duration::from_millis(250));
        assert_eq!(config.grace_period, Duration::from_millis(500));
        assert_eq!(config.namespace, "bookmarks");

        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["echoTtl"], 5000);
    }
}
