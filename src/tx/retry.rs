//! Backoff schedule and submission error classification

use crate::config::RelayerConfig;

use std::time::Duration;

/// Exponential backoff for distribution attempts
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts after the first before a deposit is failed
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }
}

impl From<&RelayerConfig> for RetryConfig {
    fn from(config: &RelayerConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_backoff: Duration::from_millis(config.retry_delay_ms),
            max_backoff: Duration::from_millis(config.max_retry_delay_ms),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Backoff before retry number `attempt` (0-indexed)
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let backoff_secs =
            self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        let capped = backoff_secs.min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

/// How a failed submission should be handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The destination bridge has already paid out this nonce
    AlreadyDistributed,
    /// Signer nonce is behind the chain; resync before the next attempt
    NonceTooLow,
    /// Invalid call or contract-level revert, never retried
    Structural,
    /// Everything else, retried with backoff
    Transient,
}

/// Classify an RPC or revert message
pub fn classify_error(error: &str) -> ErrorClass {
    let error_lower = error.to_lowercase();

    // Checked before the generic revert patterns: the replay guard reverts too
    if error_lower.contains("already distributed")
        || error_lower.contains("already processed")
        || error_lower.contains("nonce already used")
    {
        return ErrorClass::AlreadyDistributed;
    }

    if error_lower.contains("nonce too low") {
        return ErrorClass::NonceTooLow;
    }

    if error_lower.contains("timeout")
        || error_lower.contains("connection")
        || error_lower.contains("network")
        || error_lower.contains("rate limit")
        || error_lower.contains("too many requests")
        || error_lower.contains("underpriced")
        || error_lower.contains("already known")
        || error_lower.contains("nonce too high")
    {
        return ErrorClass::Transient;
    }

    if error_lower.contains("execution reverted")
        || error_lower.contains("reverted")
        || error_lower.contains("unsupported token")
        || error_lower.contains("invalid parameters")
        || error_lower.contains("invalid amount")
        || error_lower.contains("invalid recipient")
    {
        return ErrorClass::Structural;
    }

    ErrorClass::Transient
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_calculation() {
        let config = RetryConfig::default();

        assert_eq!(config.backoff_for_attempt(0), Duration::from_secs(2));
        assert_eq!(config.backoff_for_attempt(1), Duration::from_secs(4));
        assert_eq!(config.backoff_for_attempt(3), Duration::from_secs(16));
        assert_eq!(config.backoff_for_attempt(5), Duration::from_secs(60)); // capped
        assert!(config.should_retry(4));
        assert!(!config.should_retry(5));
    }

    #[test]
    fn test_error_classification() {
        assert_eq!(
            classify_error("execution reverted: Bridge: already distributed"),
            ErrorClass::AlreadyDistributed
        );
        assert_eq!(
            classify_error("execution reverted: unsupported token"),
            ErrorClass::Structural
        );
        assert_eq!(classify_error("nonce too low"), ErrorClass::NonceTooLow);
        assert_eq!(classify_error("connection reset by peer"), ErrorClass::Transient);
        assert_eq!(
            classify_error("replacement transaction underpriced"),
            ErrorClass::Transient
        );
        assert_eq!(classify_error("something odd"), ErrorClass::Transient);
    }
}
