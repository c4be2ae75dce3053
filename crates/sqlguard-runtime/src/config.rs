//! Runtime configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Scheduling knobs for batch runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Prompts decoded at the same time; each run still owns its validator
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Wall-clock limit per run (e.g. "30s", "2m"); none by default
    #[serde(default, with = "humantime_opt")]
    pub run_timeout: Option<Duration>,
}

fn default_concurrency() -> usize {
    1
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            run_timeout: None,
        }
    }
}

mod humantime_opt {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_str(&humantime::format_duration(*d).to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        raw.map(|s| humantime::parse_duration(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: BatchConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config, BatchConfig::default());
        assert_eq!(config.concurrency, 1);
        assert!(config.run_timeout.is_none());
    }

    #[test]
    fn test_human_durations_round_trip() {
        let config: BatchConfig = serde_yaml::from_str("run_timeout: 2m").unwrap();
        assert_eq!(config.run_timeout, Some(Duration::from_secs(120)));

        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"2m\""));
    }

    #[test]
    fn test_bad_duration_rejected() {
        let result: Result<BatchConfig, _> = serde_yaml::from_str("run_timeout: soon");
        assert!(result.is_err());
    }
}
