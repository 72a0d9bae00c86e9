//! Retry policy for connection establishment
//!
//! Only transient network failures are retried, with a short fixed pause
//! between attempts.
//!
//! # Example
//!
//! ```
//! use hostrun::retry::{RetryConfig, RetryState};
//! use std::time::Duration;
//!
//! let config = RetryConfig::new(1, Duration::from_millis(500));
//! let mut state = RetryState::new();
//!
//! assert!(state.should_retry(&config));
//! state.record_retry();
//! assert!(!state.should_retry(&config));
//! ```

use std::time::Duration;
use tracing::debug;

/// Connection retries after the first attempt
pub const DEFAULT_MAX_RETRIES: u32 = 1;
/// Pause before each retry
pub const DEFAULT_RETRY_DELAY_MS: u64 = 500;

/// Retry configuration for connection attempts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not including initial attempt)
    pub max_retries: u32,
    /// Pause between attempts
    pub delay: Duration,
}

impl RetryConfig {
    /// Create a new retry configuration
    ///
    /// # Arguments
    ///
    /// * `max_retries` - Maximum number of retry attempts (not including initial)
    /// * `delay` - Fixed pause before each retry
    pub fn new(max_retries: u32, delay: Duration) -> Self {
        Self { max_retries, delay }
    }

    /// Never retry
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }
}

impl Default for RetryConfig {
    /// One retry after 500ms
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES, Duration::from_millis(DEFAULT_RETRY_DELAY_MS))
    }
}

/// Retry state tracking for one establishment
#[derive(Debug, Clone)]
pub struct RetryState {
    /// Current attempt number (starts at 1 for first attempt)
    pub attempt: u32,
    /// Number of retries performed (0 for first attempt)
    pub retry_count: u32,
}

impl RetryState {
    pub fn new() -> Self {
        Self {
            attempt: 1,
            retry_count: 0,
        }
    }

    /// Returns `true` if we haven't exceeded max retries
    pub fn should_retry(&self, config: &RetryConfig) -> bool {
        self.retry_count < config.max_retries
    }

    /// Delay before the next attempt
    pub fn delay(&self, config: &RetryConfig) -> Duration {
        debug!(
            "Backoff delay: {:?} (attempt {}, retry {})",
            config.delay, self.attempt, self.retry_count
        );
        config.delay
    }

    /// Record a retry attempt, incrementing counters
    pub fn record_retry(&mut self) {
        self.retry_count += 1;
        self.attempt += 1;

        debug!(
            "Recording retry attempt (total retries: {}, attempt: {})",
            self.retry_count, self.attempt
        );
    }
}

impl Default for RetryState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_record_retry_logs_below_warn() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::WARN)
            .with_writer(move || writer.clone())
            .finish();

        let mut state = RetryState::new();
        tracing::subscriber::with_default(subscriber, || state.record_retry());

        assert_eq!(state.retry_count, 1);
        assert!(captured.0.lock().unwrap().is_empty());
    }

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.max_retries, 1);
        assert_eq!(config.delay, Duration::from_millis(500));
    }

    #[test]
    fn test_retry_config_none() {
        let config = RetryConfig::none();
        assert!(!RetryState::new().should_retry(&config));
    }

    #[test]
    fn test_should_retry() {
        let config = RetryConfig::new(2, Duration::from_millis(10));
        let mut state = RetryState::new();

        assert!(state.should_retry(&config));
        state.record_retry();
        assert!(state.should_retry(&config));
        state.record_retry();
        assert!(!state.should_retry(&config));
        assert_eq!(state.attempt, 3);
    }

    #[test]
    fn test_delay_is_fixed() {
        let config = RetryConfig::new(5, Duration::from_millis(250));
        let mut state = RetryState::new();

        assert_eq!(state.delay(&config), Duration::from_millis(250));
        state.record_retry();
        state.record_retry();
        assert_eq!(state.delay(&config), Duration::from_millis(250));
    }
}
