use crate::constants::{
    DEFAULT_NOTIFICATION_CAPACITY, DEFAULT_NOTIFY_RETRY_ATTEMPTS, DEFAULT_NOTIFY_RETRY_DELAY_MS,
    DEFAULT_REQUEST_TIMEOUT_MS,
};
use crate::error::GattError;
use crate::framing::FramingPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Link-layer tuning. Every field has a default, so `{}` is a valid config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Deadline for a correlated response (ms)
    pub request_timeout_ms: u64,
    pub notify_retry_attempts: u32,
    pub notify_retry_delay_ms: u64,
    /// Capacity of the shared reassembled-message stream
    pub notification_capacity: usize,
    /// Policy used when a notifier is started without one
    pub framing: FramingPolicy,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            notify_retry_attempts: DEFAULT_NOTIFY_RETRY_ATTEMPTS,
            notify_retry_delay_ms: DEFAULT_NOTIFY_RETRY_DELAY_MS,
            notification_capacity: DEFAULT_NOTIFICATION_CAPACITY,
            framing: FramingPolicy::default(),
        }
    }
}

impl LinkConfig {
    pub fn from_json_str(json: &str) -> Result<Self, GattError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, GattError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), GattError> {
        if self.notification_capacity == 0 {
            return Err(GattError::Config("notification_capacity must be nonzero".to_string()));
        }
        self.framing.validate()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn notify_retry_delay(&self) -> Duration {
        Duration::from_millis(self.notify_retry_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_json_uses_defaults() {
        let config = LinkConfig::from_json_str("{}").unwrap();
        assert_eq!(config, LinkConfig::default());
        assert_eq!(config.request_timeout(), Duration::from_secs(3));
        assert_eq!(config.notify_retry_attempts, 5);
    }

    #[test]
    fn test_partial_override() {
        let json = r#"{
            "request_timeout_ms": 2000,
            "framing": { "start_marker": 107, "stop_marker": 10, "idle_timeout_ms": 500 }
        }"#;
        let config = LinkConfig::from_json_str(json).unwrap();
        assert_eq!(config.request_timeout(), Duration::from_secs(2));
        assert_eq!(config.framing.start_marker, 0x6B);
        assert_eq!(config.framing.idle_timeout(), Duration::from_millis(500));
        assert_eq!(config.framing.length_field.offset_start, 1);
    }

    #[test]
    fn test_invalid_framing_rejected() {
        let json = r#"{ "framing": { "start_marker": 2, "stop_marker": 3,
            "length_field": { "offset_start": 0, "offset_end": 1, "length_padding": 0 } } }"#;
        assert!(matches!(LinkConfig::from_json_str(json), Err(GattError::Config(_))));
    }

    #[test]
    fn test_malformed_json_rejected() {
        assert!(matches!(LinkConfig::from_json_str("not json"), Err(GattError::Json(_))));
        assert!(matches!(
            LinkConfig::from_json_str(r#"{ "request_timeout_ms": "x" }"#),
            Err(GattError::Json(_))
        ));
    }
}
