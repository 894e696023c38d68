//! Batcher - Pure Batching Decisions
//!
//! Decides *when* the buffer should be drained and cuts batches out of it.
//! Concurrency lives elsewhere: the batcher holds no `Arc`, no atomics and no
//! exporter. The batching loop in [`pipeline`](crate::pipeline) owns one
//! `Batcher` and hands the batches it produces to export tasks.
//!
//! # Triggers
//!
//! | Trigger | Fires when | Drains |
//! |---------|------------|--------|
//! | `Size` | buffered ≥ `batch_size` | batches while ≥ `batch_size` remain |
//! | `Interval` | `flush_interval` since the deadline was armed, buffer non-empty | everything |
//! | `Forced` | `flush()` / shutdown | everything |
//!
//! Every batch holds between 1 and `max_batch_size` spans. The flush deadline
//! is re-armed only once the buffer has been emptied, so a span never waits
//! longer than `flush_interval` past the point it was enqueued.

use crate::buffer::SpanBuffer;
use crate::config::PipelineConfig;
use crate::span::SpanBatch;
use std::time::Duration;
use tokio::time::Instant;

/// Configuration for batch cutting
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Buffered span count that triggers a drain
    pub batch_size: usize,
    /// Maximum number of spans per batch
    pub max_batch_size: usize,
    /// Maximum time a span waits before a time-triggered flush
    pub flush_interval: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 512,
            max_batch_size: 512,
            flush_interval: Duration::from_secs(5),
        }
    }
}

impl From<&PipelineConfig> for BatchConfig {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            max_batch_size: config.max_batch_size,
            flush_interval: config.flush_interval,
        }
    }
}

/// What caused a drain cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    Size,
    Interval,
    Forced,
}

/// Cuts batches out of a [`SpanBuffer`] and tracks the flush deadline.
#[derive(Debug)]
pub struct Batcher {
    config: BatchConfig,
    /// Sequence number of the last batch cut
    sequence: u64,
    /// When the time trigger fires next
    deadline: Instant,
    batches_cut: u64,
    spans_batched: u64,
}

impl Batcher {
    pub fn new(config: BatchConfig) -> Self {
        let deadline = Instant::now() + config.flush_interval;
        Self {
            config,
            sequence: 0,
            deadline,
            batches_cut: 0,
            spans_batched: 0,
        }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// When the time trigger is due.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Returns the trigger that applies to `buffered` spans at `now`, if any.
    ///
    /// The size trigger wins over the time trigger when both apply.
    pub fn pending_trigger(&self, buffered: usize, now: Instant) -> Option<FlushTrigger> {
        if buffered >= self.config.batch_size {
            Some(FlushTrigger::Size)
        } else if buffered > 0 && now >= self.deadline {
            Some(FlushTrigger::Interval)
        } else {
            None
        }
    }

    /// Whether a cycle started by `trigger` should cut another batch.
    pub fn should_continue(&self, trigger: FlushTrigger, buffered: usize) -> bool {
        match trigger {
            FlushTrigger::Size => buffered >= self.config.batch_size,
            FlushTrigger::Interval | FlushTrigger::Forced => buffered > 0,
        }
    }

    /// Drains up to `max_batch_size` spans into a new batch.
    ///
    /// Returns `None` without consuming a sequence number when the buffer is
    /// empty.
    pub fn next_batch(&mut self, buffer: &SpanBuffer) -> Option<SpanBatch> {
        let spans = buffer.drain(self.config.max_batch_size);
        if spans.is_empty() {
            return None;
        }
        debug_assert!(spans.len() <= self.config.max_batch_size);

        self.sequence += 1;
        self.batches_cut += 1;
        self.spans_batched += spans.len() as u64;
        Some(SpanBatch::new(self.sequence, spans))
    }

    /// Drains every batch a `trigger` calls for.
    pub fn cut_batches(&mut self, buffer: &SpanBuffer, trigger: FlushTrigger) -> Vec<SpanBatch> {
        let mut batches = Vec::new();
        while self.should_continue(trigger, buffer.len()) {
            match self.next_batch(buffer) {
                Some(batch) => batches.push(batch),
                None => break,
            }
        }
        batches
    }

    /// Re-arms the time trigger once nothing older than `now` is left waiting.
    pub fn finish_cycle(&mut self, remaining: usize, now: Instant) {
        if remaining == 0 {
            self.deadline = now + self.config.flush_interval;
        }
    }

    /// Pushes the deadline forward when the timer fires on an empty buffer.
    pub fn rearm_if_idle(&mut self, buffered: usize, now: Instant) {
        if buffered == 0 && now >= self.deadline {
            self.deadline = now + self.config.flush_interval;
        }
    }

    pub fn batches_cut(&self) -> u64 {
        self.batches_cut
    }

    pub fn spans_batched(&self) -> u64 {
        self.spans_batched
    }
}
