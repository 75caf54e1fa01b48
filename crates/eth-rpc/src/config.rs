//! Configuration for the JSON-RPC client.
//!
//! This module provides [`ClientConfig`] for customizing client behavior:
//!
//! - Wall-clock request deadline and retry throttling
//! - Batch coalescing window and batch-size probing ceiling
//!
//! # Example
//!
//! ```
//! use eth_rpc::ClientConfig;
//! use std::time::Duration;
//!
//! let config = ClientConfig::default()
//!     .with_timeout(Duration::from_secs(60))
//!     .with_max_batch_size(50);
//! ```

use std::time::Duration;

use crate::error::{Result, RpcError};

// ═══════════════════════════════════════════════════════════════════════════════
// CONSTANTS
// ═══════════════════════════════════════════════════════════════════════════════

/// Default wall-clock deadline racing the whole attempt sequence of a call.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Default maximum retry attempts for throttled or transient failures.
pub const DEFAULT_THROTTLE_LIMIT: u32 = 12;

/// Default base slot for exponential backoff (`slot × rand(0, 2^attempt)` ms).
pub const DEFAULT_THROTTLE_SLOT_INTERVAL: Duration = Duration::from_millis(100);

/// Default window during which concurrent calls are coalesced into one batch.
pub const DEFAULT_BATCH_WINDOW: Duration = Duration::from_millis(1);

/// Default ceiling for adaptive batch-size probing.
///
/// Probing upward without a cap makes behavior provider-dependent; 100 is
/// comfortably below every major provider's batch limit.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 100;

/// Minimum allowed timeout.
pub const MIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Maximum allowed timeout.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(600);

/// Maximum allowed batch-size ceiling.
pub const MAX_BATCH_SIZE_LIMIT: usize = 1_000;

// ═══════════════════════════════════════════════════════════════════════════════
// CLIENT CONFIG
// ═══════════════════════════════════════════════════════════════════════════════

/// Configuration options for [`RpcClient`](crate::RpcClient).
///
/// Use the builder pattern to customize settings:
///
/// ```
/// use eth_rpc::ClientConfig;
/// use std::time::Duration;
///
/// let config = ClientConfig::default()
///     .with_timeout(Duration::from_secs(60))
///     .with_throttle_limit(6)
///     .with_max_batch_size(50);
/// ```
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Wall-clock deadline racing the entire attempt sequence of one call.
    ///
    /// Default: 120 seconds. Range: 1-600 seconds.
    pub timeout: Duration,

    /// Maximum attempts when the endpoint throttles or the connection fails.
    ///
    /// Default: 12.
    pub throttle_limit: u32,

    /// Base slot for exponential backoff between throttled attempts.
    ///
    /// The actual delay is `slot × rand(0, 2^attempt)` unless the server
    /// supplies a usable `Retry-After` header.
    ///
    /// Default: 100 ms.
    pub throttle_slot_interval: Duration,

    /// Coalescing window for concurrent calls.
    ///
    /// Calls arriving within this window of each other are flushed as a
    /// single JSON array request.
    ///
    /// Default: 1 ms.
    pub batch_window: Duration,

    /// Ceiling for adaptive batch-size probing.
    ///
    /// The client starts at 1 and probes upward after each successful batch
    /// until the first error or this ceiling, whichever comes first.
    ///
    /// Default: 100. Range: 1-1,000.
    pub max_batch_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_REQUEST_TIMEOUT,
            throttle_limit: DEFAULT_THROTTLE_LIMIT,
            throttle_slot_interval: DEFAULT_THROTTLE_SLOT_INTERVAL,
            batch_window: DEFAULT_BATCH_WINDOW,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
        }
    }
}

impl ClientConfig {
    /// Create a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the wall-clock request deadline.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the maximum throttled-retry attempts.
    #[must_use]
    pub const fn with_throttle_limit(mut self, limit: u32) -> Self {
        self.throttle_limit = limit;
        self
    }

    /// Set the backoff slot interval.
    #[must_use]
    pub const fn with_throttle_slot_interval(mut self, slot: Duration) -> Self {
        self.throttle_slot_interval = slot;
        self
    }

    /// Set the batch coalescing window.
    #[must_use]
    pub const fn with_batch_window(mut self, window: Duration) -> Self {
        self.batch_window = window;
        self
    }

    /// Set the batch-size probing ceiling.
    #[must_use]
    pub const fn with_max_batch_size(mut self, max: usize) -> Self {
        self.max_batch_size = max;
        self
    }

    /// Validate the configuration.
    ///
    /// Called automatically when creating a client.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::InvalidConfig`] if:
    /// - Timeout is outside the 1-600 second range
    /// - Throttle limit is 0
    /// - Max batch size is 0 or greater than 1,000
    pub fn validate(&self) -> Result<()> {
        if self.timeout < MIN_TIMEOUT {
            return Err(RpcError::InvalidConfig(format!(
                "timeout must be at least {MIN_TIMEOUT:?}"
            )));
        }

        if self.timeout > MAX_TIMEOUT {
            return Err(RpcError::InvalidConfig(format!(
                "timeout must be at most {MAX_TIMEOUT:?}"
            )));
        }

        if self.throttle_limit == 0 {
            return Err(RpcError::InvalidConfig(
                "throttle_limit must be at least 1".into(),
            ));
        }

        if self.max_batch_size == 0 {
            return Err(RpcError::InvalidConfig(
                "max_batch_size must be at least 1".into(),
            ));
        }

        if self.max_batch_size > MAX_BATCH_SIZE_LIMIT {
            return Err(RpcError::InvalidConfig(format!(
                "max_batch_size must be at most {MAX_BATCH_SIZE_LIMIT}"
            )));
        }

        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.timeout, DEFAULT_REQUEST_TIMEOUT);
        assert_eq!(config.throttle_limit, DEFAULT_THROTTLE_LIMIT);
        assert_eq!(config.max_batch_size, DEFAULT_MAX_BATCH_SIZE);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn builder_pattern() {
        let config = ClientConfig::new()
            .with_timeout(Duration::from_secs(60))
            .with_throttle_limit(6)
            .with_max_batch_size(50);

        assert_eq!(config.timeout, Duration::from_secs(60));
        assert_eq!(config.throttle_limit, 6);
        assert_eq!(config.max_batch_size, 50);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_timeout_too_low() {
        let config = ClientConfig::new().with_timeout(Duration::from_millis(500));
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_timeout_too_high() {
        let config = ClientConfig::new().with_timeout(Duration::from_secs(900));
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_zero_throttle_limit() {
        let config = ClientConfig::new().with_throttle_limit(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_batch_size_bounds() {
        assert!(ClientConfig::new().with_max_batch_size(0).validate().is_err());
        assert!(
            ClientConfig::new()
                .with_max_batch_size(MAX_BATCH_SIZE_LIMIT + 1)
                .validate()
                .is_err()
        );
        assert!(
            ClientConfig::new()
                .with_max_batch_size(MAX_BATCH_SIZE_LIMIT)
                .validate()
                .is_ok()
        );
    }

    #[test]
    fn constants_are_reasonable() {
        assert!(DEFAULT_THROTTLE_LIMIT >= 3, "Too few attempts to survive a blip");
        assert!(DEFAULT_BATCH_WINDOW <= Duration::from_millis(5), "Window adds latency to every call");
        assert!(DEFAULT_MAX_BATCH_SIZE <= MAX_BATCH_SIZE_LIMIT);
    }
}
