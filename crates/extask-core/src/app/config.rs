//! WorkerConfig - ワーカー全体の時間設定
//!
//! lock duration / renewal buffer / fetch retry delay / report retry を保持します。
//! デフォルト値は engine 側の期待値（30s lock、5s 前に延長、1s 間隔で fetch retry）に合わせています。

use std::time::Duration;

use crate::domain::{BuildError, ConfigError};

pub const DEFAULT_LOCK_DURATION: Duration = Duration::from_secs(30);
pub const DEFAULT_RENEWAL_BUFFER: Duration = Duration::from_secs(5);
pub const DEFAULT_FETCH_RETRY_DELAY: Duration = Duration::from_millis(1000);
/// Upper bound for a single report retry delay.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(300);

pub const ENV_LOCK_DURATION_MS: &str = "EXTASK_LOCK_DURATION_MS";
pub const ENV_RENEWAL_BUFFER_MS: &str = "EXTASK_RENEWAL_BUFFER_MS";
pub const ENV_FETCH_RETRY_DELAY_MS: &str = "EXTASK_FETCH_RETRY_DELAY_MS";
pub const ENV_REPORT_MAX_ATTEMPTS: &str = "EXTASK_REPORT_MAX_ATTEMPTS";
pub const ENV_REPORT_RETRY_DELAY_MS: &str = "EXTASK_REPORT_RETRY_DELAY_MS";

/// Retry policy for report calls (finish / bpmn error / service error).
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. 1 means "never retry".
    pub max_attempts: u32,

    /// Delay before the first retry.
    pub base_delay: Duration,

    /// Backoff multiplier. 1.0 keeps the delay fixed.
    pub multiplier: f64,
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            multiplier: 1.0,
        }
    }

    pub fn no_retry() -> Self {
        Self::fixed(1, Duration::ZERO)
    }

    /// Delay to wait after `attempts` failed attempts (1-indexed).
    ///
    /// delay = base_delay * multiplier^(attempts - 1), capped at [`MAX_RETRY_DELAY`]
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay_secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::try_from_secs_f64(delay_secs)
            .unwrap_or(MAX_RETRY_DELAY)
            .min(MAX_RETRY_DELAY)
    }

    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(3, Duration::from_millis(1000))
    }
}

/// Worker-wide timing configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    /// Duration requested for every lock and every extension.
    pub lock_duration: Duration,

    /// How long before expiry a lock gets extended.
    pub renewal_buffer: Duration,

    /// Wait after a failed or empty fetch.
    pub fetch_retry_delay: Duration,

    pub report_retry: RetryPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            lock_duration: DEFAULT_LOCK_DURATION,
            renewal_buffer: DEFAULT_RENEWAL_BUFFER,
            fetch_retry_delay: DEFAULT_FETCH_RETRY_DELAY,
            report_retry: RetryPolicy::default(),
        }
    }
}

impl WorkerConfig {
    pub fn builder() -> WorkerConfigBuilder {
        WorkerConfigBuilder::default()
    }

    /// Interval between lock extensions: `lock_duration - renewal_buffer`.
    pub fn renewal_interval(&self) -> Duration {
        self.lock_duration.saturating_sub(self.renewal_buffer)
    }

    pub fn validate(&self) -> Result<(), BuildError> {
        if self.renewal_buffer >= self.lock_duration {
            return Err(BuildError::InvalidConfig(format!(
                "renewal buffer ({:?}) must be shorter than lock duration ({:?})",
                self.renewal_buffer, self.lock_duration
            )));
        }
        if self.report_retry.max_attempts == 0 {
            return Err(BuildError::InvalidConfig(
                "report retry needs at least one attempt".to_string(),
            ));
        }
        if !self.report_retry.multiplier.is_finite() || self.report_retry.multiplier < 1.0 {
            return Err(BuildError::InvalidConfig(format!(
                "report retry multiplier must be >= 1.0, got {}",
                self.report_retry.multiplier
            )));
        }
        Ok(())
    }

    /// Defaults overridden by `EXTASK_*` environment variables (milliseconds).
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let config = Self::parse_lookup(lookup)?;
        config.validate()?;
        Ok(config)
    }

    /// Like [`from_env`](Self::from_env) but without `validate()`.
    ///
    /// For callers that layer more overrides on top and validate once at the end.
    pub fn parse_env() -> Result<Self, ConfigError> {
        Self::parse_lookup(|name| std::env::var(name).ok())
    }

    pub fn parse_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(ms) = millis(&lookup, ENV_LOCK_DURATION_MS)? {
            config.lock_duration = ms;
        }
        if let Some(ms) = millis(&lookup, ENV_RENEWAL_BUFFER_MS)? {
            config.renewal_buffer = ms;
        }
        if let Some(ms) = millis(&lookup, ENV_FETCH_RETRY_DELAY_MS)? {
            config.fetch_retry_delay = ms;
        }
        if let Some(ms) = millis(&lookup, ENV_REPORT_RETRY_DELAY_MS)? {
            config.report_retry.base_delay = ms;
        }
        if let Some(raw) = lookup(ENV_REPORT_MAX_ATTEMPTS) {
            config.report_retry.max_attempts =
                raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
                    name: ENV_REPORT_MAX_ATTEMPTS,
                    value: raw.clone(),
                    expected: "a positive integer",
                })?;
        }

        Ok(config)
    }
}

fn millis(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<Duration>, ConfigError> {
    let Some(raw) = lookup(name) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<u64>()
        .map(|ms| Some(Duration::from_millis(ms)))
        .map_err(|_| ConfigError::InvalidValue {
            name,
            value: raw.clone(),
            expected: "milliseconds as an unsigned integer",
        })
}

/// Builder for WorkerConfig
#[derive(Default)]
pub struct WorkerConfigBuilder {
    config: WorkerConfig,
}

impl WorkerConfigBuilder {
    pub fn lock_duration(mut self, duration: Duration) -> Self {
        self.config.lock_duration = duration;
        self
    }

    pub fn renewal_buffer(mut self, duration: Duration) -> Self {
        self.config.renewal_buffer = duration;
        self
    }

    pub fn fetch_retry_delay(mut self, duration: Duration) -> Self {
        self.config.fetch_retry_delay = duration;
        self
    }

    pub fn report_retry(mut self, policy: RetryPolicy) -> Self {
        self.config.report_retry = policy;
        self
    }

    /// Build and validate.
    pub fn build(self) -> Result<WorkerConfig, BuildError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
