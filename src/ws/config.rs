#![expect(
    clippy::module_name_repetitions,
    reason = "Configuration types intentionally mirror the module name for clarity"
)]

use std::time::{Duration, Instant};

use crate::Result;
use crate::error::Error;

const DEFAULT_KEEP_ALIVE_INTERVAL_DURATION: Duration = Duration::from_secs(30);
const DEFAULT_BASE_INTERVAL_DURATION: Duration = Duration::from_secs(3);
const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Configuration for WebSocket client behavior.
///
/// Fixed for the lifetime of a [`crate::Client`].
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct Config {
    /// Interval between one-way `ping` frames while connected
    pub keep_alive_interval: Duration,
    /// Reconnection strategy configuration
    pub reconnect: ReconnectConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            keep_alive_interval: DEFAULT_KEEP_ALIVE_INTERVAL_DURATION,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl Config {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.keep_alive_interval.is_zero() {
            return Err(Error::validation("keep-alive interval must be non-zero"));
        }
        if Instant::now().checked_add(self.keep_alive_interval).is_none() {
            return Err(Error::validation(format!(
                "keep-alive interval {:?} is out of range",
                self.keep_alive_interval
            )));
        }
        Ok(())
    }
}

/// Configuration for automatic reconnection behavior.
///
/// Delays grow linearly: the n-th retry after a drop waits `base_interval × n`.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Maximum number of consecutive retries before the session gives up
    pub max_attempts: u32,
    /// Delay unit multiplied by the attempt number
    pub base_interval: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_interval: DEFAULT_BASE_INTERVAL_DURATION,
        }
    }
}

impl ReconnectConfig {
    /// Delay before retry number `attempt` (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_interval.saturating_mul(attempt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_linearly() {
        let config = ReconnectConfig {
            max_attempts: 5,
            base_interval: Duration::from_millis(250),
        };

        assert_eq!(config.delay_for(1), Duration::from_millis(250));
        assert_eq!(config.delay_for(2), Duration::from_millis(500));
        assert_eq!(config.delay_for(4), Duration::from_secs(1));
    }

    #[test]
    fn delay_saturates_instead_of_overflowing() {
        let config = ReconnectConfig {
            max_attempts: u32::MAX,
            base_interval: Duration::MAX,
        };

        assert_eq!(config.delay_for(3), Duration::MAX);
    }

    #[test]
    fn zero_keep_alive_is_rejected() {
        let config = Config {
            keep_alive_interval: Duration::ZERO,
            ..Config::default()
        };

        config.validate().unwrap_err();
    }

    #[test]
    fn unrepresentable_keep_alive_is_rejected() {
        let config = Config {
            keep_alive_interval: Duration::MAX,
            ..Config::default()
        };

        let err = config.validate().unwrap_err();
        assert_eq!(err.kind(), crate::error::Kind::Validation);
    }

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.keep_alive_interval, Duration::from_secs(30));
        assert_eq!(config.reconnect.max_attempts, 5);
        assert_eq!(config.reconnect.base_interval, Duration::from_secs(3));
    }
}
