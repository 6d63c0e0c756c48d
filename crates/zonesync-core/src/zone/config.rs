//! Zone client configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::retry::RetryPolicy;
use crate::error::ConfigError;
use crate::ports::{QualityOfService, RequestOptions};

/// Records or deletions per request once the server reports `LimitExceeded`.
pub const DEFAULT_CHUNK_SIZE: usize = 200;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ZoneConfig {
    pub quality_of_service: QualityOfService,
    pub chunk_size: usize,
    pub retry: RetryPolicy,
}

impl Default for ZoneConfig {
    fn default() -> Self {
        Self {
            quality_of_service: QualityOfService::platform_default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            retry: RetryPolicy::default(),
        }
    }
}

impl ZoneConfig {
    /// Parse a JSON config. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid("chunk_size must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(ConfigError::Invalid(
                "retry.jitter must be between 0.0 and 1.0".into(),
            ));
        }
        Ok(())
    }

    pub(crate) fn request_options(&self) -> RequestOptions {
        RequestOptions {
            quality_of_service: self.quality_of_service,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::time::Duration;

    #[test]
    fn empty_object_gives_defaults() {
        let config = ZoneConfig::from_json_str("{}").unwrap();
        assert_eq!(config, ZoneConfig::default());
        assert_eq!(config.chunk_size, 200);
    }

    #[test]
    fn fields_override_defaults() {
        let config = ZoneConfig::from_json_str(
            r#"{
                "quality_of_service": "utility",
                "chunk_size": 50,
                "retry": { "max_attempts": 4, "jitter": 0.2 }
            }"#,
        )
        .unwrap();

        assert_eq!(config.quality_of_service, QualityOfService::Utility);
        assert_eq!(config.chunk_size, 50);
        assert_eq!(config.retry.max_attempts, Some(4));
        assert_eq!(config.retry.max_delay, None);
    }

    #[test]
    fn max_delay_is_read_as_seconds() {
        let config = ZoneConfig::from_json_str(r#"{"retry": {"max_delay": 90}}"#).unwrap();
        assert_eq!(config.retry.max_delay, Some(Duration::from_secs(90)));
    }

    #[rstest]
    #[case::huge(r#"{"retry": {"jitter": 1e300}}"#)]
    #[case::above_one(r#"{"retry": {"jitter": 1.5}}"#)]
    #[case::negative(r#"{"retry": {"jitter": -0.1}}"#)]
    fn out_of_range_jitter_is_rejected(#[case] json: &str) {
        let err = ZoneConfig::from_json_str(json).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn zero_chunk_size_is_rejected() {
        let err = ZoneConfig::from_json_str(r#"{"chunk_size": 0}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        let err = ZoneConfig::from_json_str("{chunk_size").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = ZoneConfig::from_path("/nonexistent/zonesync.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
