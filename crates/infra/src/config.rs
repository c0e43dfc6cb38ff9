//! Processor configuration, read from `OUTBOX_*` environment variables.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use courier_core::WorkerId;
use courier_events::RetryPolicy;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{key}: cannot parse '{value}'")]
    Parse { key: &'static str, value: String },

    #[error("{0}")]
    Invalid(String),
}

/// Settings for one outbox processor instance.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// When false the worker never ticks.
    pub enabled: bool,
    pub poll_interval: Duration,
    /// Maximum events claimed per tick.
    pub batch_size: usize,
    pub max_attempts: u32,
    pub base_retry_delay: Duration,
    pub max_retry_delay: Duration,
    /// `PROCESSING` rows locked longer than this are released.
    pub stale_lock_timeout: Duration,
    /// Upper bound on one handler invocation.
    pub handler_timeout: Duration,
    /// Events of one batch dispatched at the same time.
    pub max_concurrency: usize,
    pub worker_id: WorkerId,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval: Duration::from_millis(1_000),
            batch_size: 10,
            max_attempts: 5,
            base_retry_delay: Duration::from_millis(1_000),
            max_retry_delay: Duration::from_millis(300_000),
            stale_lock_timeout: Duration::from_millis(300_000),
            handler_timeout: Duration::from_millis(20_000),
            max_concurrency: 1,
            worker_id: default_worker_id(),
        }
    }
}

impl ProcessorConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through `lookup`; unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(v) = parse(&lookup, "OUTBOX_ENABLED")? {
            config.enabled = v;
        }
        if let Some(ms) = parse(&lookup, "OUTBOX_POLL_INTERVAL_MS")? {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(v) = parse(&lookup, "OUTBOX_BATCH_SIZE")? {
            config.batch_size = v;
        }
        if let Some(v) = parse(&lookup, "OUTBOX_MAX_ATTEMPTS")? {
            config.max_attempts = v;
        }
        if let Some(ms) = parse(&lookup, "OUTBOX_BASE_RETRY_DELAY_MS")? {
            config.base_retry_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse(&lookup, "OUTBOX_MAX_RETRY_DELAY_MS")? {
            config.max_retry_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse(&lookup, "OUTBOX_STALE_LOCK_TIMEOUT_MS")? {
            config.stale_lock_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse(&lookup, "OUTBOX_HANDLER_TIMEOUT_MS")? {
            config.handler_timeout = Duration::from_millis(ms);
        }
        if let Some(v) = parse(&lookup, "OUTBOX_MAX_CONCURRENCY")? {
            config.max_concurrency = v;
        }
        if let Some(raw) = lookup("OUTBOX_WORKER_ID") {
            config.worker_id = WorkerId::new(raw.clone()).map_err(|_| ConfigError::Parse {
                key: "OUTBOX_WORKER_ID",
                value: raw,
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn with_worker_id(mut self, worker_id: WorkerId) -> Self {
        self.worker_id = worker_id;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max;
        self
    }

    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_stale_lock_timeout(mut self, timeout: Duration) -> Self {
        self.stale_lock_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, max_attempts: u32, base: Duration, max: Duration) -> Self {
        self.max_attempts = max_attempts;
        self.base_retry_delay = base;
        self.max_retry_delay = max;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be at least 1".into()));
        }
        if self.max_concurrency == 0 {
            return Err(ConfigError::Invalid("max_concurrency must be at least 1".into()));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::Invalid("poll_interval must be greater than zero".into()));
        }
        if self.handler_timeout.is_zero() {
            return Err(ConfigError::Invalid("handler_timeout must be greater than zero".into()));
        }
        if self.stale_lock_timeout <= self.lock_hold_bound() {
            return Err(ConfigError::Invalid(format!(
                "stale_lock_timeout must exceed {}ms (handler_timeout for each of {} dispatch waves plus one)",
                self.lock_hold_bound().as_millis(),
                self.dispatch_waves(),
            )));
        }
        self.retry_policy()
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    /// Sequential rounds needed to dispatch a full batch.
    pub fn dispatch_waves(&self) -> u32 {
        let waves = self.batch_size.div_ceil(self.max_concurrency.max(1));
        u32::try_from(waves).unwrap_or(u32::MAX)
    }

    /// Longest a claimed lock can be held by a healthy tick, with one extra
    /// handler timeout of slack for sweep and clock skew.
    pub fn lock_hold_bound(&self) -> Duration {
        self.handler_timeout
            .saturating_mul(self.dispatch_waves().saturating_add(1))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(self.max_attempts, self.base_retry_delay, self.max_retry_delay)
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Parse { key, value: raw }),
    }
}

fn default_worker_id() -> WorkerId {
    let host = std::env::var("HOSTNAME")
        .ok()
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "worker".to_string());
    WorkerId::generate(&host)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = ProcessorConfig::from_lookup(lookup(&[])).unwrap();

        assert!(config.enabled);
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.stale_lock_timeout, Duration::from_secs(300));
        assert_eq!(config.handler_timeout, Duration::from_secs(20));
        assert_eq!(config.max_concurrency, 1);
        assert!(!config.worker_id.as_str().is_empty());
    }

    #[test]
    fn overrides_are_read() {
        let config = ProcessorConfig::from_lookup(lookup(&[
            ("OUTBOX_ENABLED", "false"),
            ("OUTBOX_BATCH_SIZE", " 25 "),
            ("OUTBOX_MAX_ATTEMPTS", "3"),
            ("OUTBOX_BASE_RETRY_DELAY_MS", "200"),
            ("OUTBOX_MAX_RETRY_DELAY_MS", "5000"),
            ("OUTBOX_MAX_CONCURRENCY", "4"),
            ("OUTBOX_WORKER_ID", "edge-1"),
        ]))
        .unwrap();

        assert!(!config.enabled);
        assert_eq!(config.batch_size, 25);
        assert_eq!(config.worker_id.as_str(), "edge-1");
        assert_eq!(config.max_concurrency, 4);

        let policy = config.retry_policy();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(10), Duration::from_millis(5000));
    }

    #[test]
    fn malformed_value_names_the_key() {
        let err = ProcessorConfig::from_lookup(lookup(&[("OUTBOX_BATCH_SIZE", "ten")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Parse {
                key: "OUTBOX_BATCH_SIZE",
                value: "ten".to_string()
            }
        );
    }

    #[test]
    fn inconsistent_values_are_rejected() {
        assert!(ProcessorConfig::from_lookup(lookup(&[("OUTBOX_BATCH_SIZE", "0")])).is_err());
        assert!(ProcessorConfig::from_lookup(lookup(&[("OUTBOX_MAX_ATTEMPTS", "0")])).is_err());
        assert!(ProcessorConfig::from_lookup(lookup(&[
            ("OUTBOX_BASE_RETRY_DELAY_MS", "10000"),
            ("OUTBOX_MAX_RETRY_DELAY_MS", "1000"),
        ]))
        .is_err());
        assert!(ProcessorConfig::from_lookup(lookup(&[
            ("OUTBOX_HANDLER_TIMEOUT_MS", "600000"),
        ]))
        .is_err());
        assert!(ProcessorConfig::from_lookup(lookup(&[("OUTBOX_WORKER_ID", "   ")])).is_err());
    }

    #[test]
    fn stale_timeout_must_cover_a_whole_sequential_batch() {
        // 10 events one at a time, 30s each: the last lock is 300s old before
        // its handler even starts.
        let slow = lookup(&[
            ("OUTBOX_HANDLER_TIMEOUT_MS", "30000"),
            ("OUTBOX_STALE_LOCK_TIMEOUT_MS", "300000"),
        ]);
        assert!(matches!(
            ProcessorConfig::from_lookup(slow),
            Err(ConfigError::Invalid(_))
        ));

        let parallel = ProcessorConfig::from_lookup(lookup(&[
            ("OUTBOX_HANDLER_TIMEOUT_MS", "30000"),
            ("OUTBOX_STALE_LOCK_TIMEOUT_MS", "300000"),
            ("OUTBOX_MAX_CONCURRENCY", "5"),
        ]))
        .unwrap();
        assert_eq!(parallel.dispatch_waves(), 2);
        assert_eq!(parallel.lock_hold_bound(), Duration::from_secs(90));

        let default = ProcessorConfig::default();
        assert_eq!(default.dispatch_waves(), 10);
        assert!(default.validate().is_ok());
    }
}
