//! Process-wide pipeline counters.
//!
//! Every counter is an `AtomicU64` updated with `Ordering::Relaxed`: these are
//! statistics, nothing synchronizes through them, and slightly stale reads are
//! fine for observability. Export tasks that are cancelled mid-flight still
//! leave the counters consistent because each update is a single atomic op.

use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Why spans were lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DropReason {
    /// Buffer at capacity when the span was enqueued
    BufferFull,
    /// Transient failures outlasted the retry budget
    RetriesExhausted,
    /// Sink rejected the payload
    PermanentRejection,
    /// Still buffered or in flight when the shutdown grace period ran out
    ShutdownTimeout,
}

impl DropReason {
    pub const ALL: [DropReason; 4] = [
        DropReason::BufferFull,
        DropReason::RetriesExhausted,
        DropReason::PermanentRejection,
        DropReason::ShutdownTimeout,
    ];

    fn index(self) -> usize {
        match self {
            DropReason::BufferFull => 0,
            DropReason::RetriesExhausted => 1,
            DropReason::PermanentRejection => 2,
            DropReason::ShutdownTimeout => 3,
        }
    }
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DropReason::BufferFull => "buffer_full",
            DropReason::RetriesExhausted => "retries_exhausted",
            DropReason::PermanentRejection => "permanent_rejection",
            DropReason::ShutdownTimeout => "shutdown_timeout",
        };
        f.write_str(s)
    }
}

/// Upper bounds (inclusive, milliseconds) of the latency buckets; one extra
/// overflow bucket follows.
pub const LATENCY_BUCKETS_MS: [u64; 12] = [
    1, 5, 10, 25, 50, 100, 250, 500, 1_000, 2_500, 5_000, 10_000,
];

const RECENT_SAMPLES: usize = 256;

/// Export latency distribution: fixed buckets plus a window of recent samples.
#[derive(Debug)]
pub struct LatencyHistogram {
    buckets: [AtomicU64; LATENCY_BUCKETS_MS.len() + 1],
    count: AtomicU64,
    sum_micros: AtomicU64,
    min_micros: AtomicU64,
    max_micros: AtomicU64,
    recent: Mutex<VecDeque<Duration>>,
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self {
            buckets: Default::default(),
            count: AtomicU64::new(0),
            sum_micros: AtomicU64::new(0),
            min_micros: AtomicU64::new(u64::MAX),
            max_micros: AtomicU64::new(0),
            recent: Mutex::new(VecDeque::with_capacity(RECENT_SAMPLES)),
        }
    }
}

impl LatencyHistogram {
    pub fn record(&self, latency: Duration) {
        let micros = latency.as_micros() as u64;
        let millis = latency.as_millis() as u64;
        let bucket = LATENCY_BUCKETS_MS
            .iter()
            .position(|&bound| millis <= bound)
            .unwrap_or(LATENCY_BUCKETS_MS.len());

        self.buckets[bucket].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros.fetch_add(micros, Ordering::Relaxed);
        self.min_micros.fetch_min(micros, Ordering::Relaxed);
        self.max_micros.fetch_max(micros, Ordering::Relaxed);

        let mut recent = self.recent.lock().unwrap_or_else(PoisonError::into_inner);
        if recent.len() == RECENT_SAMPLES {
            recent.pop_front();
        }
        recent.push_back(latency);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> LatencySnapshot {
        let count = self.count();
        let recent = self
            .recent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect();
        LatencySnapshot {
            count,
            sum: Duration::from_micros(self.sum_micros.load(Ordering::Relaxed)),
            min: (count > 0)
                .then(|| Duration::from_micros(self.min_micros.load(Ordering::Relaxed))),
            max: (count > 0)
                .then(|| Duration::from_micros(self.max_micros.load(Ordering::Relaxed))),
            buckets: self.buckets.iter().map(|b| b.load(Ordering::Relaxed)).collect(),
            recent,
        }
    }
}

/// Point-in-time copy of a [`LatencyHistogram`].
#[derive(Debug, Clone, Serialize)]
pub struct LatencySnapshot {
    pub count: u64,
    pub sum: Duration,
    pub min: Option<Duration>,
    pub max: Option<Duration>,
    /// Counts per bucket of [`LATENCY_BUCKETS_MS`], last entry is the overflow bucket
    pub buckets: Vec<u64>,
    /// Most recent samples, oldest first
    pub recent: Vec<Duration>,
}

impl LatencySnapshot {
    pub fn mean(&self) -> Option<Duration> {
        if self.count == 0 {
            return None;
        }
        let nanos = self.sum.as_nanos() / u128::from(self.count);
        Some(Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX)))
    }
}

/// Thread-safe counters shared by the buffer, the batching loop and every
/// export task.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    spans_exported: AtomicU64,
    batches_exported: AtomicU64,
    dropped: [AtomicU64; 4],
    batches_dropped: AtomicU64,
    retries: AtomicU64,
    inflight_exports: AtomicU64,
    export_latency: LatencyHistogram,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spans_exported(&self) -> u64 {
        self.spans_exported.load(Ordering::Relaxed)
    }

    pub fn batches_exported(&self) -> u64 {
        self.batches_exported.load(Ordering::Relaxed)
    }

    pub fn dropped(&self, reason: DropReason) -> u64 {
        self.dropped[reason.index()].load(Ordering::Relaxed)
    }

    pub fn dropped_total(&self) -> u64 {
        DropReason::ALL.iter().map(|r| self.dropped(*r)).sum()
    }

    pub fn batches_dropped(&self) -> u64 {
        self.batches_dropped.load(Ordering::Relaxed)
    }

    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    pub fn inflight_exports(&self) -> u64 {
        self.inflight_exports.load(Ordering::Relaxed)
    }

    pub fn export_latency(&self) -> &LatencyHistogram {
        &self.export_latency
    }

    pub(crate) fn record_export(&self, span_count: u64, latency: Duration) {
        self.spans_exported.fetch_add(span_count, Ordering::Relaxed);
        self.batches_exported.fetch_add(1, Ordering::Relaxed);
        self.export_latency.record(latency);
    }

    pub(crate) fn record_dropped_span(&self, reason: DropReason) {
        self.dropped[reason.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped_spans(&self, reason: DropReason, span_count: u64) {
        self.dropped[reason.index()].fetch_add(span_count, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped_batch(&self, reason: DropReason, span_count: u64) {
        self.dropped[reason.index()].fetch_add(span_count, Ordering::Relaxed);
        self.batches_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_inflight(&self) {
        self.inflight_exports.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dec_inflight(&self) {
        self.inflight_exports.fetch_sub(1, Ordering::Relaxed);
    }

    /// Copies every counter; `buffered_spans` is the buffer's current occupancy.
    pub fn snapshot(&self, buffered_spans: usize) -> MetricsSnapshot {
        MetricsSnapshot {
            spans_exported: self.spans_exported(),
            batches_exported: self.batches_exported(),
            dropped_buffer_full: self.dropped(DropReason::BufferFull),
            dropped_retries_exhausted: self.dropped(DropReason::RetriesExhausted),
            dropped_permanent_rejection: self.dropped(DropReason::PermanentRejection),
            dropped_shutdown_timeout: self.dropped(DropReason::ShutdownTimeout),
            batches_dropped: self.batches_dropped(),
            retries: self.retries(),
            inflight_exports: self.inflight_exports(),
            buffered_spans,
            export_latency: self.export_latency.snapshot(),
        }
    }
}

/// Serializable view of [`PipelineMetrics`].
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub spans_exported: u64,
    pub batches_exported: u64,
    pub dropped_buffer_full: u64,
    pub dropped_retries_exhausted: u64,
    pub dropped_permanent_rejection: u64,
    pub dropped_shutdown_timeout: u64,
    pub batches_dropped: u64,
    pub retries: u64,
    pub inflight_exports: u64,
    pub buffered_spans: usize,
    pub export_latency: LatencySnapshot,
}

impl MetricsSnapshot {
    pub fn dropped_total(&self) -> u64 {
        self.dropped_buffer_full
            + self.dropped_retries_exhausted
            + self.dropped_permanent_rejection
            + self.dropped_shutdown_timeout
    }
}
