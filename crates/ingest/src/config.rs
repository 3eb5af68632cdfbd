//! Configuration for the ingestion pipeline.
//!
//! Every type deserializes with `deny_unknown_fields` and humantime
//! durations (`"5s"`, `"2m"`). Builders validate on construction;
//! deserialized values are validated with [`PipelineConfig::validate`].
//!
//! # Example
//!
//! ```
//! use ledgersync_ingest::PipelineConfig;
//!
//! let config: PipelineConfig = serde_json::from_str(
//!     r#"{
//!         "listener": { "channel": "mychannel", "backoff": { "initial": "1s", "max": "30s", "multiplier": 2.0 } },
//!         "reconcile": { "unconfirmed_window": "90s" }
//!     }"#,
//! )?;
//! config.validate()?;
//! assert_eq!(config.listener.start_block, 0);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::time::Duration;

use ledgersync_storage::{CasRetryConfig, ConfigError, RetryConfig};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Default delay before resubscribing (5 seconds).
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(5);

/// Default bound on the subscription call (30 seconds).
pub const DEFAULT_SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default window for a gateway submission to appear in a block (2 minutes).
pub const DEFAULT_UNCONFIRMED_WINDOW: Duration = Duration::from_secs(120);

/// Default interval between unconfirmed sweeps (15 seconds).
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(15);

const DEFAULT_MULTIPLIER: f64 = 1.0;

/// Delay policy for the listener's `BackingOff` state.
///
/// The delay before resubscribing after the `n`-th consecutive failure
/// (zero-based) is `min(initial * multiplier^n, max)`, plus a random extra of
/// up to `jitter` times that delay. The defaults give a fixed 5 second delay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackoffConfig {
    /// Delay after the first failure.
    #[serde(with = "humantime_serde", default = "default_backoff")]
    pub initial: Duration,

    /// Upper bound on the delay, before jitter.
    #[serde(with = "humantime_serde", default = "default_backoff")]
    pub max: Duration,

    /// Growth factor per consecutive failure.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Random extra delay as a fraction of the computed delay, in `0.0..=1.0`.
    #[serde(default)]
    pub jitter: f64,
}

fn default_backoff() -> Duration {
    DEFAULT_BACKOFF
}

fn default_multiplier() -> f64 {
    DEFAULT_MULTIPLIER
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: DEFAULT_BACKOFF,
            max: DEFAULT_BACKOFF,
            multiplier: DEFAULT_MULTIPLIER,
            jitter: 0.0,
        }
    }
}

#[bon::bon]
impl BackoffConfig {
    /// Creates a backoff policy.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `initial` is zero, `max` is below
    /// `initial`, `multiplier` is below 1 or `jitter` is outside `0..=1`.
    #[builder]
    pub fn new(
        #[builder(default = DEFAULT_BACKOFF)] initial: Duration,
        #[builder(default = DEFAULT_BACKOFF)] max: Duration,
        #[builder(default = DEFAULT_MULTIPLIER)] multiplier: f64,
        #[builder(default)] jitter: f64,
    ) -> Result<Self, ConfigError> {
        let config = Self { initial, max, multiplier, jitter };
        config.validate()?;
        Ok(config)
    }

    /// Checks the invariants the builder enforces.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] describing the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial.is_zero() {
            return Err(ConfigError::MustBePositive {
                field: "backoff.initial",
                value: format!("{:?}", self.initial),
            });
        }
        if self.max < self.initial {
            return Err(ConfigError::InvalidRange {
                field: "backoff.max",
                reason: format!("{:?} is below initial {:?}", self.max, self.initial),
            });
        }
        if self.multiplier.is_nan() || self.multiplier < 1.0 || self.multiplier.is_infinite() {
            return Err(ConfigError::BelowMinimum {
                field: "backoff.multiplier",
                min: "1.0".into(),
                value: self.multiplier.to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ConfigError::InvalidRange {
                field: "backoff.jitter",
                reason: format!("{} is outside 0.0..=1.0", self.jitter),
            });
        }
        Ok(())
    }

    /// Returns the delay before resubscribing after `failures` consecutive
    /// earlier failures.
    #[must_use]
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = i32::try_from(failures).unwrap_or(i32::MAX);
        let scaled = self.initial.as_secs_f64() * self.multiplier.powi(exponent);
        let base = if scaled.is_finite() && scaled < self.max.as_secs_f64() {
            Duration::from_secs_f64(scaled).max(self.initial).min(self.max)
        } else {
            self.max
        };

        if self.jitter > 0.0 {
            let extra = base.as_secs_f64() * self.jitter * rand::rng().random_range(0.0..=1.0);
            base + Duration::from_secs_f64(extra)
        } else {
            base
        }
    }
}

/// Listener settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListenerConfig {
    /// Channel to subscribe to.
    pub channel: String,

    /// First block to request when no cursor has been saved.
    #[serde(default)]
    pub start_block: u64,

    /// Bound on each subscription call.
    #[serde(with = "humantime_serde", default = "default_subscribe_timeout")]
    pub subscribe_timeout: Duration,

    /// Resubscribe delay policy.
    #[serde(default)]
    pub backoff: BackoffConfig,
}

fn default_subscribe_timeout() -> Duration {
    DEFAULT_SUBSCRIBE_TIMEOUT
}

#[bon::bon]
impl ListenerConfig {
    /// Creates listener settings.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `channel` is empty, `subscribe_timeout` is
    /// zero or `backoff` is invalid.
    #[builder]
    pub fn new(
        #[builder(into)] channel: String,
        #[builder(default)] start_block: u64,
        #[builder(default = DEFAULT_SUBSCRIBE_TIMEOUT)] subscribe_timeout: Duration,
        #[builder(default)] backoff: BackoffConfig,
    ) -> Result<Self, ConfigError> {
        let config = Self { channel, start_block, subscribe_timeout, backoff };
        config.validate()?;
        Ok(config)
    }

    /// Checks the invariants the builder enforces.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] describing the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channel.trim().is_empty() {
            return Err(ConfigError::MissingField { field: "channel" });
        }
        if self.subscribe_timeout.is_zero() {
            return Err(ConfigError::MustBePositive {
                field: "subscribe_timeout",
                value: format!("{:?}", self.subscribe_timeout),
            });
        }
        self.backoff.validate()
    }
}

/// Reconciliation settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReconcileConfig {
    /// How long a gateway submission may go unseen by the listener before it
    /// is flagged unconfirmed.
    #[serde(with = "humantime_serde", default = "default_unconfirmed_window")]
    pub unconfirmed_window: Duration,

    /// How often the background sweeper checks for expired submissions.
    #[serde(with = "humantime_serde", default = "default_sweep_interval")]
    pub sweep_interval: Duration,
}

fn default_unconfirmed_window() -> Duration {
    DEFAULT_UNCONFIRMED_WINDOW
}

fn default_sweep_interval() -> Duration {
    DEFAULT_SWEEP_INTERVAL
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            unconfirmed_window: DEFAULT_UNCONFIRMED_WINDOW,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

#[bon::bon]
impl ReconcileConfig {
    /// Creates reconciliation settings.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if either duration is zero.
    #[builder]
    pub fn new(
        #[builder(default = DEFAULT_UNCONFIRMED_WINDOW)] unconfirmed_window: Duration,
        #[builder(default = DEFAULT_SWEEP_INTERVAL)] sweep_interval: Duration,
    ) -> Result<Self, ConfigError> {
        let config = Self { unconfirmed_window, sweep_interval };
        config.validate()?;
        Ok(config)
    }

    /// Checks the invariants the builder enforces.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] describing the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.unconfirmed_window.is_zero() {
            return Err(ConfigError::MustBePositive {
                field: "unconfirmed_window",
                value: format!("{:?}", self.unconfirmed_window),
            });
        }
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::MustBePositive {
                field: "sweep_interval",
                value: format!("{:?}", self.sweep_interval),
            });
        }
        Ok(())
    }
}

/// Complete pipeline configuration, as loaded from a file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    /// Listener settings.
    pub listener: ListenerConfig,

    /// Reconciliation settings.
    #[serde(default)]
    pub reconcile: ReconcileConfig,

    /// Transient-error retry policy for store operations.
    #[serde(default)]
    pub store_retry: RetryConfig,

    /// Compare-and-set conflict retry policy for store writes.
    #[serde(default)]
    pub cas_retry: CasRetryConfig,
}

impl PipelineConfig {
    /// Validates every section.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listener.validate()?;
        self.reconcile.validate()?;
        self.store_retry.validate()
    }
}
