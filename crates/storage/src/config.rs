//! Retry configuration for store operations.
//!
//! [`RetryConfig`] governs retries of transient backend failures and
//! [`CasRetryConfig`] governs retries of compare-and-set conflicts inside the
//! dedup store's read-merge-write cycle.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default number of retries after the first attempt.
const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default initial backoff (100 milliseconds).
const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(100);

/// Default backoff ceiling (5 seconds).
const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Default number of compare-and-set retries.
const DEFAULT_CAS_MAX_RETRIES: u32 = 5;

/// Default compare-and-set base delay (5 milliseconds).
const DEFAULT_CAS_BASE_DELAY: Duration = Duration::from_millis(5);

/// Retry policy for transient backend errors.
///
/// The delay before retry `n` (zero-based) is
/// `min(initial_backoff * 2^n, max_backoff)` plus up to 50% jitter.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use ledgersync_storage::RetryConfig;
///
/// let config = RetryConfig::builder()
///     .max_retries(5)
///     .initial_backoff(Duration::from_millis(50))
///     .build()?;
/// assert_eq!(config.max_backoff, Duration::from_secs(5));
/// # Ok::<(), ledgersync_storage::ConfigError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    /// Retries after the first attempt. Zero disables retry.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry.
    #[serde(with = "humantime_serde", default = "default_initial_backoff")]
    pub initial_backoff: Duration,

    /// Upper bound on the computed delay, before jitter.
    #[serde(with = "humantime_serde", default = "default_max_backoff")]
    pub max_backoff: Duration,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_initial_backoff() -> Duration {
    DEFAULT_INITIAL_BACKOFF
}

fn default_max_backoff() -> Duration {
    DEFAULT_MAX_BACKOFF
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }
}

#[bon::bon]
impl RetryConfig {
    /// Creates a new retry configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `initial_backoff` is zero or exceeds
    /// `max_backoff`.
    #[builder]
    pub fn new(
        #[builder(default = DEFAULT_MAX_RETRIES)] max_retries: u32,
        #[builder(default = DEFAULT_INITIAL_BACKOFF)] initial_backoff: Duration,
        #[builder(default = DEFAULT_MAX_BACKOFF)] max_backoff: Duration,
    ) -> Result<Self, ConfigError> {
        let config = Self { max_retries, initial_backoff, max_backoff };
        config.validate()?;
        Ok(config)
    }

    /// Checks the invariants the builder enforces.
    ///
    /// Deserialized configurations bypass the builder and should be
    /// validated with this method before use.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] describing the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_backoff.is_zero() {
            return Err(ConfigError::MustBePositive {
                field: "initial_backoff",
                value: format!("{:?}", self.initial_backoff),
            });
        }
        if self.initial_backoff > self.max_backoff {
            return Err(ConfigError::InvalidRange {
                field: "initial_backoff",
                reason: format!(
                    "{:?} exceeds max_backoff {:?}",
                    self.initial_backoff, self.max_backoff
                ),
            });
        }
        Ok(())
    }
}

/// Retry policy for compare-and-set conflicts.
///
/// Each retry sleeps `base_delay` plus a random jitter in `0..=base_delay`.
#[derive(Debug, Clone, PartialEq, Eq, bon::Builder, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CasRetryConfig {
    /// Retries after the first attempt. Zero disables retry.
    #[serde(default = "default_cas_max_retries")]
    #[builder(default = DEFAULT_CAS_MAX_RETRIES)]
    pub max_retries: u32,

    /// Minimum delay between attempts.
    #[serde(with = "humantime_serde", default = "default_cas_base_delay")]
    #[builder(default = DEFAULT_CAS_BASE_DELAY)]
    pub base_delay: Duration,
}

fn default_cas_max_retries() -> u32 {
    DEFAULT_CAS_MAX_RETRIES
}

fn default_cas_base_delay() -> Duration {
    DEFAULT_CAS_BASE_DELAY
}

impl Default for CasRetryConfig {
    fn default() -> Self {
        Self { max_retries: DEFAULT_CAS_MAX_RETRIES, base_delay: DEFAULT_CAS_BASE_DELAY }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_builder_defaults_match_default_impl() {
        let built = RetryConfig::builder().build().unwrap();
        assert_eq!(built, RetryConfig::default());
    }

    #[test]
    fn test_retry_builder_rejects_zero_initial_backoff() {
        let err = RetryConfig::builder().initial_backoff(Duration::ZERO).build().unwrap_err();
        assert!(matches!(err, ConfigError::MustBePositive { field: "initial_backoff", .. }));
    }

    #[test]
    fn test_retry_builder_rejects_inverted_range() {
        let err = RetryConfig::builder()
            .initial_backoff(Duration::from_secs(10))
            .max_backoff(Duration::from_secs(1))
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidRange { field: "initial_backoff", .. }));
    }

    #[test]
    fn test_cas_builder_partial_overrides() {
        let config = CasRetryConfig::builder().max_retries(10).build();
        assert_eq!(config.max_retries, 10);
        assert_eq!(config.base_delay, DEFAULT_CAS_BASE_DELAY);
    }

    #[test]
    fn test_deserialize_humantime_with_defaults() {
        let config: RetryConfig =
            serde_json::from_str(r#"{"initial_backoff": "250ms", "max_backoff": "2s"}"#).unwrap();
        assert_eq!(config.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(config.initial_backoff, Duration::from_millis(250));
        assert_eq!(config.max_backoff, Duration::from_secs(2));
        config.validate().unwrap();
    }

    #[test]
    fn test_deserialize_rejects_unknown_fields() {
        let result: Result<CasRetryConfig, _> =
            serde_json::from_str(r#"{"max_retries": 1, "jitter": "1ms"}"#);
        assert!(result.is_err());
    }
}
