/// Chat session configuration.
/// Every field has a default, so an empty JSON object is a valid config file.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::connection::{RetryPolicy, DEFAULT_INITIAL_DELAY, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_DELAY};
use crate::error::{ChatError, Result};
use crate::query::DEFAULT_PAGE_SIZE;
use crate::store::sqlite::DEFAULT_POLL_INTERVAL;

/// How long a send waits for its acknowledgement
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ChatConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub ack_timeout_ms: u64,
    /// Call `connect()` as soon as the facade is built.
    pub auto_connect: bool,
    pub page_size: usize,
    pub poll_interval_ms: u64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        ChatConfig {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_delay_ms: DEFAULT_INITIAL_DELAY.as_millis() as u64,
            max_delay_ms: DEFAULT_MAX_DELAY.as_millis() as u64,
            ack_timeout_ms: DEFAULT_ACK_TIMEOUT.as_millis() as u64,
            auto_connect: false,
            page_size: DEFAULT_PAGE_SIZE,
            poll_interval_ms: DEFAULT_POLL_INTERVAL.as_millis() as u64,
        }
    }
}

impl ChatConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: ChatConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(ChatError::ConfigError(
                "maxAttempts must be at least 1".to_string(),
            ));
        }
        if self.initial_delay_ms > self.max_delay_ms {
            return Err(ChatError::ConfigError(
                "initialDelayMs must not exceed maxDelayMs".to_string(),
            ));
        }
        if self.ack_timeout_ms == 0 {
            return Err(ChatError::ConfigError(
                "ackTimeoutMs must be positive".to_string(),
            ));
        }
        if self.page_size == 0 {
            return Err(ChatError::ConfigError("pageSize must be positive".to_string()));
        }
        if self.poll_interval_ms == 0 {
            return Err(ChatError::ConfigError(
                "pollIntervalMs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn with_auto_connect(mut self, auto_connect: bool) -> Self {
        self.auto_connect = auto_connect;
        self
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_retry(mut self, max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        self.max_attempts = max_attempts;
        self.initial_delay_ms = initial_delay.as_millis() as u64;
        self.max_delay_ms = max_delay.as_millis() as u64;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ChatConfig::default();
        let policy = config.retry_policy();
        assert_eq!(policy.max_attempts, 12);
        assert_eq!(policy.initial_delay, Duration::from_secs(1));
        assert_eq!(policy.max_delay, Duration::from_secs(32));
        assert_eq!(config.ack_timeout(), Duration::from_secs(10));
        assert_eq!(config.page_size, 50);
        assert!(!config.auto_connect);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = ChatConfig::from_json_str(r#"{"autoConnect": true, "ackTimeoutMs": 2500}"#).unwrap();
        assert!(config.auto_connect);
        assert_eq!(config.ack_timeout(), Duration::from_millis(2500));
        assert_eq!(config.max_attempts, 12);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let result = ChatConfig::from_json_str(r#"{"maxAttempts": 0}"#);
        assert!(matches!(result, Err(ChatError::ConfigError(_))));

        let result = ChatConfig::from_json_str(r#"{"initialDelayMs": 5000, "maxDelayMs": 100}"#);
        assert!(matches!(result, Err(ChatError::ConfigError(_))));

        let result = ChatConfig::from_json_str(r#"{"pollIntervalMs": 0}"#);
        assert!(matches!(result, Err(ChatError::ConfigError(_))));
    }

    #[test]
    fn test_from_file() -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        write!(file, r#"{{"pageSize": 20}}"#)?;
        let config = ChatConfig::from_file(file.path())?;
        assert_eq!(config.page_size, 20);
        Ok(())
    }
}
