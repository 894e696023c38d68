//! Bounded FIFO holding area for finished spans.
//!
//! The mutex guards only the `VecDeque` operation itself; nothing awaits or
//! performs I/O while holding it.

use crate::error::BufferFull;
use crate::metrics::{DropReason, PipelineMetrics};
use crate::span::Span;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Thread-safe bounded span queue shared by producers and the batching loop.
#[derive(Debug)]
pub struct SpanBuffer {
    spans: Mutex<VecDeque<Span>>,
    capacity: usize,
    /// Occupancy at which the batching loop is woken
    wake_threshold: usize,
    notify: Arc<Notify>,
    metrics: Arc<PipelineMetrics>,
    /// Only the first rejection is logged at warn level
    warned_full: AtomicBool,
}

impl SpanBuffer {
    pub fn new(capacity: usize, wake_threshold: usize, metrics: Arc<PipelineMetrics>) -> Self {
        Self {
            spans: Mutex::new(VecDeque::with_capacity(capacity.min(4_096))),
            capacity,
            wake_threshold: wake_threshold.max(1),
            notify: Arc::new(Notify::new()),
            metrics,
            warned_full: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Span>> {
        self.spans.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends a span, or rejects it when the buffer is at capacity.
    ///
    /// Never blocks beyond the container operation. Each rejection bumps the
    /// `BufferFull` drop counter once.
    pub fn enqueue(&self, span: Span) -> Result<(), BufferFull> {
        let len = {
            let mut spans = self.lock();
            if spans.len() >= self.capacity {
                None
            } else {
                spans.push_back(span);
                Some(spans.len())
            }
        };

        match len {
            Some(len) => {
                if len == self.wake_threshold
                    || (len > self.wake_threshold && len % self.wake_threshold == 0)
                {
                    self.notify.notify_one();
                }
                Ok(())
            }
            None => {
                self.metrics.record_dropped_span(DropReason::BufferFull);
                if self.warned_full.swap(true, Ordering::Relaxed) {
                    debug!(capacity = self.capacity, "span buffer full, dropping span");
                } else {
                    warn!(
                        capacity = self.capacity,
                        "span buffer full, dropping span; further drops are logged at debug level"
                    );
                }
                Err(BufferFull)
            }
        }
    }

    /// Removes and returns up to `max` of the oldest spans, in enqueue order.
    pub fn drain(&self, max: usize) -> Vec<Span> {
        let mut spans = self.lock();
        let n = max.min(spans.len());
        spans.drain(..n).collect()
    }

    /// Removes every buffered span.
    pub fn drain_all(&self) -> Vec<Span> {
        let mut spans = self.lock();
        spans.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Notified whenever occupancy crosses a multiple of the wake threshold.
    pub(crate) fn notifier(&self) -> &Arc<Notify> {
        &self.notify
    }
}
