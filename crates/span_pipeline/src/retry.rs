//! Retry with bounded exponential backoff.
//!
//! [`RetryingExporter`] wraps any [`SpanExporter`] and:
//!
//! - bounds every attempt with a timeout (a timeout counts as transient),
//! - retries transient failures up to `max_retries` times,
//! - gives up immediately on permanent failures.
//!
//! ```text
//! attempt 1 ──fail(T)──► sleep(base) ──► attempt 2 ──fail(T)──► sleep(base·m) ──► ...
//!     │                                      │
//!     └──fail(P)──► Err(Status)              └──ok──► Ok(())
//! ```

use crate::config::PipelineConfig;
use crate::exporter::{ExportError, FailureKind, SpanExporter};
use crate::metrics::PipelineMetrics;
use crate::span::SpanBatch;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, warn};

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retries after the initial attempt (0 = single attempt).
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Growth factor between consecutive delays.
    pub multiplier: f64,
    /// Cap on any single delay, jitter included.
    pub max_delay: Duration,
    /// Random extra delay drawn from `[0, jitter)`; zero disables it.
    pub jitter: Duration,
    /// Bound on a single attempt.
    pub attempt_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(10),
            jitter: Duration::ZERO,
            attempt_timeout: Duration::from_secs(10),
        }
    }
}

impl From<&PipelineConfig> for RetryConfig {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: config.backoff_base,
            multiplier: config.backoff_multiplier,
            max_delay: config.backoff_max_delay,
            jitter: config.backoff_jitter,
            attempt_timeout: config.export_timeout,
        }
    }
}

impl RetryConfig {
    /// Un-jittered delay before retry number `retry` (1-indexed).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let growth = self.multiplier.powi(retry.saturating_sub(1) as i32);
        let nanos = self.base_delay.as_nanos() as f64 * growth;
        if !nanos.is_finite() || nanos >= self.max_delay.as_nanos() as f64 {
            return self.max_delay;
        }
        Duration::from_nanos(nanos.round() as u64).min(self.max_delay)
    }

    /// Delay with jitter applied, still capped at `max_delay`.
    fn jittered_delay(&self, retry: u32) -> Duration {
        let delay = self.delay_for_retry(retry);
        let jitter = u64::try_from(self.jitter.as_nanos()).unwrap_or(u64::MAX);
        if jitter == 0 {
            return delay;
        }
        let extra = rand::thread_rng().gen_range(0..jitter);
        delay.saturating_add(Duration::from_nanos(extra)).min(self.max_delay)
    }
}

/// State of one batch's delivery while it is being retried.
#[derive(Debug, Clone)]
pub struct ExportAttempt {
    pub batch_sequence: u64,
    /// 1-indexed attempt number
    pub attempt: u32,
    pub last_error: Option<FailureKind>,
    pub next_retry_at: Option<Instant>,
}

impl ExportAttempt {
    fn new(batch_sequence: u64) -> Self {
        Self {
            batch_sequence,
            attempt: 0,
            last_error: None,
            next_retry_at: None,
        }
    }
}

/// An exporter wrapper that retries transient failures with exponential backoff.
///
/// # Example
///
/// ```ignore
/// let http = HttpExporter::new(&config)?;
/// let retrying = RetryingExporter::new(http, RetryConfig::from(&config));
///
/// // transient failures are retried up to 3 times
/// retrying.export(batch).await?;
/// ```
pub struct RetryingExporter<E: SpanExporter> {
    inner: E,
    config: RetryConfig,
    metrics: Option<Arc<PipelineMetrics>>,
    /// Total retry attempts made
    total_retries: AtomicU64,
    /// Exports that succeeded after at least one retry
    recovered_exports: AtomicU64,
}

impl<E: SpanExporter> RetryingExporter<E> {
    /// Create a new retrying exporter with the given configuration.
    pub fn new(inner: E, config: RetryConfig) -> Self {
        Self {
            inner,
            config,
            metrics: None,
            total_retries: AtomicU64::new(0),
            recovered_exports: AtomicU64::new(0),
        }
    }

    /// Also count retries in the pipeline-wide metrics.
    pub fn with_metrics(mut self, metrics: Arc<PipelineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn inner(&self) -> &E {
        &self.inner
    }

    /// Returns the total number of retry attempts made.
    pub fn total_retries(&self) -> u64 {
        self.total_retries.load(Ordering::Relaxed)
    }

    /// Returns exports that succeeded after at least one retry.
    pub fn recovered_exports(&self) -> u64 {
        self.recovered_exports.load(Ordering::Relaxed)
    }

    async fn attempt_once(&self, batch: SpanBatch) -> Result<(), ExportError> {
        match timeout(self.config.attempt_timeout, self.inner.export(batch)).await {
            Ok(result) => result,
            Err(_) => Err(ExportError::Timeout),
        }
    }
}

impl<E: SpanExporter> SpanExporter for RetryingExporter<E> {
    async fn export(&self, batch: SpanBatch) -> Result<(), ExportError> {
        let max_attempts = self.config.max_retries + 1;
        let mut state = ExportAttempt::new(batch.sequence);

        loop {
            state.attempt += 1;
            debug_assert!(state.attempt <= max_attempts);

            let error = match self.attempt_once(batch.clone()).await {
                Ok(()) => {
                    if state.attempt > 1 {
                        self.recovered_exports.fetch_add(1, Ordering::Relaxed);
                        debug!(
                            batch = state.batch_sequence,
                            attempts = state.attempt,
                            "export recovered after retry"
                        );
                    }
                    return Ok(());
                }
                Err(e) => e,
            };

            let kind = error.kind();
            state.last_error = Some(kind);

            if kind == FailureKind::Permanent {
                warn!(
                    batch = state.batch_sequence,
                    attempt = state.attempt,
                    error = %error,
                    "permanent export failure, not retrying"
                );
                return Err(error);
            }

            if state.attempt >= max_attempts {
                warn!(
                    batch = state.batch_sequence,
                    attempts = state.attempt,
                    error = %error,
                    "retry budget exhausted"
                );
                return Err(ExportError::RetriesExhausted {
                    attempts: state.attempt,
                    last: Box::new(error),
                });
            }

            let delay = self.config.jittered_delay(state.attempt);
            debug_assert!(delay <= self.config.max_delay);
            state.next_retry_at = Some(Instant::now() + delay);
            debug!(
                batch = state.batch_sequence,
                attempt = state.attempt,
                remaining_retries = max_attempts - state.attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "transient export failure, retrying"
            );

            self.total_retries.fetch_add(1, Ordering::Relaxed);
            if let Some(metrics) = &self.metrics {
                metrics.record_retry();
            }
            sleep(delay).await;
        }
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}
