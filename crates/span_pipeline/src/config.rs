//! Pipeline configuration.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const ENV_BATCH_SIZE: &str = "SPAN_PIPELINE_BATCH_SIZE";
pub const ENV_MAX_BATCH_SIZE: &str = "SPAN_PIPELINE_MAX_BATCH_SIZE";
pub const ENV_FLUSH_INTERVAL_MS: &str = "SPAN_PIPELINE_FLUSH_INTERVAL_MS";
pub const ENV_BUFFER_CAPACITY: &str = "SPAN_PIPELINE_BUFFER_CAPACITY";
pub const ENV_EXPORT_TIMEOUT_MS: &str = "SPAN_PIPELINE_EXPORT_TIMEOUT_MS";
pub const ENV_MAX_RETRIES: &str = "SPAN_PIPELINE_MAX_RETRIES";
pub const ENV_BACKOFF_BASE_MS: &str = "SPAN_PIPELINE_BACKOFF_BASE_MS";
pub const ENV_BACKOFF_MULTIPLIER: &str = "SPAN_PIPELINE_BACKOFF_MULTIPLIER";
pub const ENV_BACKOFF_MAX_DELAY_MS: &str = "SPAN_PIPELINE_BACKOFF_MAX_DELAY_MS";
pub const ENV_BACKOFF_JITTER_MS: &str = "SPAN_PIPELINE_BACKOFF_JITTER_MS";
pub const ENV_MAX_CONCURRENT_EXPORTS: &str = "SPAN_PIPELINE_MAX_CONCURRENT_EXPORTS";
pub const ENV_SHUTDOWN_GRACE_PERIOD_MS: &str = "SPAN_PIPELINE_SHUTDOWN_GRACE_PERIOD_MS";
pub const ENV_SINK_ENDPOINT: &str = "SPAN_PIPELINE_SINK_ENDPOINT";
pub const ENV_SERVICE_NAME: &str = "SPAN_PIPELINE_SERVICE_NAME";

/// What the batching loop does when every export slot is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InFlightPolicy {
    /// Wait for a slot; producers keep enqueueing meanwhile.
    #[default]
    Block,
    /// Leave the spans buffered and retry on the next trigger.
    Defer,
}

/// Invalid configuration values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },
    #[error("batch_size ({batch_size}) must not exceed max_batch_size ({max_batch_size})")]
    BatchSizeAboveMax { batch_size: usize, max_batch_size: usize },
    #[error("max_batch_size ({max_batch_size}) exceeds buffer_capacity ({buffer_capacity})")]
    BatchAboveCapacity { max_batch_size: usize, buffer_capacity: usize },
    #[error("backoff_multiplier must be finite and at least 1.0, got {0}")]
    InvalidMultiplier(String),
    #[error("backoff_base must not exceed backoff_max_delay")]
    BackoffBaseAboveMax,
    #[error("sink_endpoint must be an http(s) URL, got {0:?}")]
    InvalidEndpoint(String),
    #[error("environment variable {name} has invalid value {value:?}")]
    InvalidEnv { name: &'static str, value: String },
}

/// Configuration for the span pipeline.
///
/// Durations (de)serialize as integer milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Buffered span count that triggers an eager drain
    pub batch_size: usize,
    /// Hard cap on spans per batch
    pub max_batch_size: usize,
    /// Maximum time between flushes while spans are waiting
    #[serde(with = "duration_ms")]
    pub flush_interval: Duration,
    /// Spans held before `enqueue` starts rejecting
    pub buffer_capacity: usize,
    /// Bound on a single transmission attempt
    #[serde(with = "duration_ms")]
    pub export_timeout: Duration,
    /// Retries after the first attempt for transient failures
    pub max_retries: u32,
    /// Delay before the first retry
    #[serde(with = "duration_ms")]
    pub backoff_base: Duration,
    /// Growth factor between consecutive retry delays
    pub backoff_multiplier: f64,
    /// Cap on a single retry delay
    #[serde(with = "duration_ms")]
    pub backoff_max_delay: Duration,
    /// Upper bound of the random delay added to each retry (zero disables)
    #[serde(with = "duration_ms")]
    pub backoff_jitter: Duration,
    /// Batches allowed in flight at once
    pub max_concurrent_exports: usize,
    pub in_flight_policy: InFlightPolicy,
    /// Keep accepting spans (up to capacity) while draining
    pub accept_during_drain: bool,
    /// How long shutdown waits for in-flight exports
    #[serde(with = "duration_ms")]
    pub shutdown_grace_period: Duration,
    /// Collector URL batches are POSTed to
    pub sink_endpoint: String,
    /// `process.serviceName` reported with every span
    pub service_name: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: 512,
            max_batch_size: 512,
            flush_interval: Duration::from_secs(5),
            buffer_capacity: 2_048,
            export_timeout: Duration::from_secs(10),
            max_retries: 3,
            backoff_base: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            backoff_max_delay: Duration::from_secs(10),
            backoff_jitter: Duration::ZERO,
            max_concurrent_exports: 4,
            in_flight_policy: InFlightPolicy::Block,
            accept_during_drain: false,
            shutdown_grace_period: Duration::from_secs(5),
            sink_endpoint: "http://localhost:14268/api/traces".to_string(),
            service_name: "demo-service".to_string(),
        }
    }
}

impl PipelineConfig {
    /// Defaults overridden by `SPAN_PIPELINE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Like [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = parse_var(&lookup, ENV_BATCH_SIZE)? {
            config.batch_size = v;
        }
        if let Some(v) = parse_var(&lookup, ENV_MAX_BATCH_SIZE)? {
            config.max_batch_size = v;
        }
        if let Some(v) = parse_var(&lookup, ENV_FLUSH_INTERVAL_MS)? {
            config.flush_interval = Duration::from_millis(v);
        }
        if let Some(v) = parse_var(&lookup, ENV_BUFFER_CAPACITY)? {
            config.buffer_capacity = v;
        }
        if let Some(v) = parse_var(&lookup, ENV_EXPORT_TIMEOUT_MS)? {
            config.export_timeout = Duration::from_millis(v);
        }
        if let Some(v) = parse_var(&lookup, ENV_MAX_RETRIES)? {
            config.max_retries = v;
        }
        if let Some(v) = parse_var(&lookup, ENV_BACKOFF_BASE_MS)? {
            config.backoff_base = Duration::from_millis(v);
        }
        if let Some(v) = parse_var(&lookup, ENV_BACKOFF_MULTIPLIER)? {
            config.backoff_multiplier = v;
        }
        if let Some(v) = parse_var(&lookup, ENV_BACKOFF_MAX_DELAY_MS)? {
            config.backoff_max_delay = Duration::from_millis(v);
        }
        if let Some(v) = parse_var(&lookup, ENV_BACKOFF_JITTER_MS)? {
            config.backoff_jitter = Duration::from_millis(v);
        }
        if let Some(v) = parse_var(&lookup, ENV_MAX_CONCURRENT_EXPORTS)? {
            config.max_concurrent_exports = v;
        }
        if let Some(v) = parse_var(&lookup, ENV_SHUTDOWN_GRACE_PERIOD_MS)? {
            config.shutdown_grace_period = Duration::from_millis(v);
        }
        if let Some(v) = lookup(ENV_SINK_ENDPOINT) {
            config.sink_endpoint = v;
        }
        if let Some(v) = lookup(ENV_SERVICE_NAME) {
            config.service_name = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks the relations between fields.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("batch_size", self.batch_size),
            ("max_batch_size", self.max_batch_size),
            ("buffer_capacity", self.buffer_capacity),
            ("max_concurrent_exports", self.max_concurrent_exports),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero { field });
            }
        }
        for (field, value) in [
            ("flush_interval", self.flush_interval),
            ("export_timeout", self.export_timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Zero { field });
            }
        }
        if self.batch_size > self.max_batch_size {
            return Err(ConfigError::BatchSizeAboveMax {
                batch_size: self.batch_size,
                max_batch_size: self.max_batch_size,
            });
        }
        if self.max_batch_size > self.buffer_capacity {
            return Err(ConfigError::BatchAboveCapacity {
                max_batch_size: self.max_batch_size,
                buffer_capacity: self.buffer_capacity,
            });
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(ConfigError::InvalidMultiplier(self.backoff_multiplier.to_string()));
        }
        if self.backoff_base > self.backoff_max_delay {
            return Err(ConfigError::BackoffBaseAboveMax);
        }
        if !(self.sink_endpoint.starts_with("http://")
            || self.sink_endpoint.starts_with("https://"))
        {
            return Err(ConfigError::InvalidEndpoint(self.sink_endpoint.clone()));
        }
        Ok(())
    }

    /// Sets the eager drain threshold.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Sets the per-batch span cap.
    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    /// Sets the time-based flush trigger.
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Sets the buffer capacity.
    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }

    /// Sets the per-attempt export timeout.
    pub fn with_export_timeout(mut self, timeout: Duration) -> Self {
        self.export_timeout = timeout;
        self
    }

    /// Sets the retry budget and backoff curve.
    pub fn with_backoff(
        mut self,
        max_retries: u32,
        base: Duration,
        multiplier: f64,
        max_delay: Duration,
    ) -> Self {
        self.max_retries = max_retries;
        self.backoff_base = base;
        self.backoff_multiplier = multiplier;
        self.backoff_max_delay = max_delay;
        self
    }

    /// Sets the retry jitter bound.
    pub fn with_backoff_jitter(mut self, jitter: Duration) -> Self {
        self.backoff_jitter = jitter;
        self
    }

    /// Sets the in-flight export limit.
    pub fn with_max_concurrent_exports(mut self, limit: usize) -> Self {
        self.max_concurrent_exports = limit;
        self
    }

    pub fn with_in_flight_policy(mut self, policy: InFlightPolicy) -> Self {
        self.in_flight_policy = policy;
        self
    }

    pub fn with_accept_during_drain(mut self, accept: bool) -> Self {
        self.accept_during_drain = accept;
        self
    }

    /// Sets how long shutdown waits for in-flight exports.
    pub fn with_shutdown_grace_period(mut self, grace: Duration) -> Self {
        self.shutdown_grace_period = grace;
        self
    }

    pub fn with_sink_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.sink_endpoint = endpoint.into();
        self
    }

    pub fn with_service_name(mut self, service_name: impl Into<String>) -> Self {
        self.service_name = service_name.into();
        self
    }
}

fn parse_var<F, T>(lookup: &F, name: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { name, value: raw }),
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
