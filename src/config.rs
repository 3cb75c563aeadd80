use crate::core::{ExecError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Largest number of write operations sent to one shard in one request.
pub const MAX_WRITE_BATCH_SIZE: usize = 100_000;

/// Largest estimated payload sent to one shard in one request.
pub const MAX_BATCH_SIZE_BYTES: usize = 16 * 1024 * 1024;

/// Rounds tolerated without completed writes or a metadata change.
pub const MAX_ROUNDS_WITHOUT_PROGRESS: u32 = 5;

/// Retry behavior of the shard request sender for idempotent requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SenderRetryPolicyConfig {
    /// Total attempts per request, including the first one.
    pub max_attempts: u32,
    /// Backoff before the first retry in milliseconds.
    pub initial_backoff_ms: u64,
    /// Upper bound for the doubling backoff in milliseconds.
    pub max_backoff_ms: u64,
}

impl Default for SenderRetryPolicyConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 0,
            max_backoff_ms: 100,
        }
    }
}

impl SenderRetryPolicyConfig {
    /// Backoff to wait before retry number `retry` (1-based).
    pub fn backoff_for(&self, retry: u32) -> Duration {
        if self.initial_backoff_ms == 0 {
            return Duration::ZERO;
        }
        let factor = 1u64 << retry.saturating_sub(1).min(16);
        let millis = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(millis)
    }
}

/// Write execution configuration
///
/// Carried on the execution context; every limit has the value the router
/// uses in production as its default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteExecConfig {
    /// Rounds without progress before the batch is aborted with `NoProgressMade`.
    pub max_rounds_without_progress: u32,

    /// Maximum number of operations per child batch
    pub max_write_batch_size: usize,

    /// Maximum estimated payload bytes per child batch
    pub max_batch_size_bytes: usize,

    /// Sender retry policy for idempotent (retryable) writes
    pub sender_retry: SenderRetryPolicyConfig,

    /// Optional per-request deadline for shard requests
    pub shard_request_timeout_ms: Option<u64>,
}

impl Default for WriteExecConfig {
    fn default() -> Self {
        Self {
            max_rounds_without_progress: MAX_ROUNDS_WITHOUT_PROGRESS,
            max_write_batch_size: MAX_WRITE_BATCH_SIZE,
            max_batch_size_bytes: MAX_BATCH_SIZE_BYTES,
            sender_retry: SenderRetryPolicyConfig::default(),
            shard_request_timeout_ms: None,
        }
    }
}

impl WriteExecConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the no-progress cutoff
    pub fn max_rounds_without_progress(mut self, rounds: u32) -> Self {
        self.max_rounds_without_progress = rounds;
        self
    }

    /// Set the per-batch operation limit
    pub fn max_write_batch_size(mut self, ops: usize) -> Self {
        self.max_write_batch_size = ops;
        self
    }

    /// Set the per-batch byte limit
    pub fn max_batch_size_bytes(mut self, bytes: usize) -> Self {
        self.max_batch_size_bytes = bytes;
        self
    }

    /// Set the sender retry policy
    pub fn sender_retry(mut self, retry: SenderRetryPolicyConfig) -> Self {
        self.sender_retry = retry;
        self
    }

    /// Set the shard request deadline
    pub fn shard_request_timeout(mut self, timeout: Duration) -> Self {
        self.shard_request_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn shard_request_timeout_duration(&self) -> Option<Duration> {
        self.shard_request_timeout_ms.map(Duration::from_millis)
    }

    /// Parse from a JSON document; missing fields keep their defaults.
    pub fn from_json_str(input: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects limits that would make every batch unsendable.
    pub fn validate(&self) -> Result<()> {
        if self.max_write_batch_size == 0 {
            return Err(ExecError::Config(
                "max_write_batch_size must be >= 1".to_string(),
            ));
        }
        if self.max_batch_size_bytes == 0 {
            return Err(ExecError::Config(
                "max_batch_size_bytes must be >= 1".to_string(),
            ));
        }
        if self.sender_retry.max_attempts == 0 {
            return Err(ExecError::Config(
                "sender_retry.max_attempts must be >= 1".to_string(),
            ));
        }
        if self.sender_retry.max_backoff_ms < self.sender_retry.initial_backoff_ms {
            return Err(ExecError::Config(format!(
                "sender_retry.max_backoff_ms ({}) is below initial_backoff_ms ({})",
                self.sender_retry.max_backoff_ms, self.sender_retry.initial_backoff_ms
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = WriteExecConfig::default();
        assert_eq!(config.max_rounds_without_progress, 5);
        assert_eq!(config.max_write_batch_size, 100_000);
        assert_eq!(config.max_batch_size_bytes, 16 * 1024 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = WriteExecConfig::new()
            .max_rounds_without_progress(2)
            .max_write_batch_size(10)
            .shard_request_timeout(Duration::from_millis(250));
        assert_eq!(config.max_rounds_without_progress, 2);
        assert_eq!(config.max_write_batch_size, 10);
        assert_eq!(
            config.shard_request_timeout_duration(),
            Some(Duration::from_millis(250))
        );
    }

    #[test]
    fn test_from_json_keeps_defaults() {
        let config =
            WriteExecConfig::from_json_str(r#"{"max_write_batch_size": 500, "sender_retry": {"max_attempts": 5}}"#)
                .unwrap();
        assert_eq!(config.max_write_batch_size, 500);
        assert_eq!(config.sender_retry.max_attempts, 5);
        assert_eq!(config.sender_retry.max_backoff_ms, 100);
        assert_eq!(config.max_rounds_without_progress, 5);

        assert!(WriteExecConfig::from_json_str(r#"{"max_write_batch_size": 0}"#).is_err());
    }

    #[test]
    fn test_malformed_json_is_config_error() {
        let err = WriteExecConfig::from_json_str("{not json").unwrap_err();
        assert!(matches!(err, ExecError::Config(_)));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let retry = SenderRetryPolicyConfig {
            max_attempts: 4,
            initial_backoff_ms: 10,
            max_backoff_ms: 25,
        };
        assert_eq!(retry.backoff_for(1), Duration::from_millis(10));
        assert_eq!(retry.backoff_for(2), Duration::from_millis(20));
        assert_eq!(retry.backoff_for(3), Duration::from_millis(25));
    }
}
