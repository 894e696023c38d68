//! Pipeline controller and the batching loop.
//!
//! ```text
//!  producers ──enqueue──► SpanBuffer ──notify──► batching loop ──spawn──► export tasks
//!                                                   │  ▲                  (JoinSet, ≤ N permits)
//!                                   flush/shutdown ─┘  └── reap ◄─────────────┘
//! ```
//!
//! # Lifecycle
//!
//! ```text
//! Stopped ──start()──► Running ──shutdown()──► Draining ──exports done / grace elapsed──► Stopped
//! ```
//!
//! The lifecycle state lives in an atomic shared with every [`SpanProducer`]
//! and is the only thing consulted when deciding whether a span is accepted.
//! Producers check it under a shared intake lock; the drain takes that lock
//! exclusively to enter `Stopped`, so no span lands in the buffer after the
//! drain's final look at it.

use crate::batcher::{BatchConfig, Batcher, FlushTrigger};
use crate::buffer::SpanBuffer;
use crate::config::{InFlightPolicy, PipelineConfig};
use crate::error::{EnqueueError, PipelineError};
use crate::exporter::{ExportError, FailureKind, SpanExporter, SpanExporterBoxed};
use crate::metrics::{DropReason, MetricsSnapshot, PipelineMetrics};
use crate::retry::{RetryConfig, RetryingExporter};
use crate::span::{Span, SpanBatch};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{debug, error, info, warn};

/// Lifecycle state of a [`PipelineController`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PipelineState {
    Stopped = 0,
    Running = 1,
    Draining = 2,
}

impl PipelineState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => PipelineState::Running,
            2 => PipelineState::Draining,
            _ => PipelineState::Stopped,
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineState::Stopped => "stopped",
            PipelineState::Running => "running",
            PipelineState::Draining => "draining",
        };
        f.write_str(name)
    }
}

/// State shared between the controller, producers and the batching loop.
#[derive(Debug)]
struct Shared {
    state: AtomicU8,
    accept_during_drain: bool,
    intake: RwLock<()>,
    buffer: SpanBuffer,
    metrics: Arc<PipelineMetrics>,
}

impl Shared {
    fn state(&self) -> PipelineState {
        PipelineState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: PipelineState) {
        let previous = PipelineState::from_u8(self.state.swap(state as u8, Ordering::AcqRel));
        if previous != state {
            debug!(from = %previous, to = %state, "pipeline state changed");
        }
    }

    fn transition(&self, from: PipelineState, to: PipelineState) -> Result<(), PipelineState> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| debug!(from = %from, to = %to, "pipeline state changed"))
            .map_err(PipelineState::from_u8)
    }

    /// Enters `Stopped` once no producer is between its state check and its push.
    fn stop_intake(&self) {
        let _intake = self.intake.write().unwrap_or_else(PoisonError::into_inner);
        self.set_state(PipelineState::Stopped);
    }

    fn enqueue(&self, span: Span) -> Result<(), EnqueueError> {
        let _intake = self.intake.read().unwrap_or_else(PoisonError::into_inner);
        match self.state() {
            PipelineState::Running => {}
            PipelineState::Draining if self.accept_during_drain => {}
            state => return Err(EnqueueError::NotAccepting(state)),
        }
        self.buffer.enqueue(span)?;
        Ok(())
    }
}

/// Cloneable handle for submitting spans from any thread.
#[derive(Debug, Clone)]
pub struct SpanProducer {
    shared: Arc<Shared>,
}

impl SpanProducer {
    /// Buffers a span without blocking.
    ///
    /// Fails with [`EnqueueError::BufferFull`] when the buffer is at capacity
    /// (the span is counted as dropped) and with
    /// [`EnqueueError::NotAccepting`] when the pipeline is not running.
    pub fn enqueue(&self, span: Span) -> Result<(), EnqueueError> {
        self.shared.enqueue(span)
    }

    pub fn state(&self) -> PipelineState {
        self.shared.state()
    }
}

/// Outcome of [`PipelineController::shutdown`].
#[derive(Debug, Clone)]
pub struct ShutdownReport {
    /// Spans handed to export tasks by the final drain
    pub flushed_spans: u64,
    /// Spans counted as `ShutdownTimeout` during this shutdown
    pub timed_out_spans: u64,
    /// Time from the shutdown request to `Stopped`
    pub elapsed: Duration,
    pub metrics: MetricsSnapshot,
}

impl ShutdownReport {
    /// `true` when nothing was lost to the grace deadline.
    pub fn is_clean(&self) -> bool {
        self.timed_out_spans == 0
    }
}

enum Command {
    /// Drain everything, wait for in-flight exports, report spans dispatched.
    Flush(oneshot::Sender<usize>),
}

struct Worker {
    task: JoinHandle<DrainOutcome>,
    commands: mpsc::Sender<Command>,
    /// Carries the grace deadline
    shutdown_tx: oneshot::Sender<Instant>,
}

#[derive(Debug, Default)]
struct DrainOutcome {
    flushed_spans: u64,
}

/// Owns the span buffer, the batching loop and the export task pool.
///
/// # Example
///
/// ```ignore
/// let config = PipelineConfig::from_env()?;
/// let exporter = HttpExporter::new(&config)?;
/// let mut pipeline = PipelineController::new(config, exporter)?;
/// pipeline.start()?;
///
/// let producer = pipeline.producer();
/// producer.enqueue(span)?;
///
/// let report = pipeline.shutdown().await?;
/// ```
pub struct PipelineController {
    config: PipelineConfig,
    shared: Arc<Shared>,
    exporter: Arc<dyn SpanExporterBoxed>,
    worker: Option<Worker>,
}

impl PipelineController {
    /// Validates `config` and wraps `exporter` in the retry layer.
    ///
    /// The pipeline starts out `Stopped`; call [`start`](Self::start).
    pub fn new<E>(config: PipelineConfig, exporter: E) -> Result<Self, PipelineError>
    where
        E: SpanExporter + 'static,
    {
        config.validate()?;

        let metrics = Arc::new(PipelineMetrics::new());
        let buffer = SpanBuffer::new(
            config.buffer_capacity,
            config.batch_size,
            Arc::clone(&metrics),
        );
        let retrying = RetryingExporter::new(exporter, RetryConfig::from(&config))
            .with_metrics(Arc::clone(&metrics));

        Ok(Self {
            shared: Arc::new(Shared {
                state: AtomicU8::new(PipelineState::Stopped as u8),
                accept_during_drain: config.accept_during_drain,
                intake: RwLock::new(()),
                buffer,
                metrics,
            }),
            exporter: Arc::new(retrying),
            config,
            worker: None,
        })
    }

    /// Spawns the batching loop on the current Tokio runtime.
    pub fn start(&mut self) -> Result<(), PipelineError> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| PipelineError::Worker(e.to_string()))?;
        self.shared
            .transition(PipelineState::Stopped, PipelineState::Running)
            .map_err(|state| PipelineError::InvalidState {
                operation: "start",
                state,
            })?;

        let (command_tx, command_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let batching = BatchingLoop {
            shared: Arc::clone(&self.shared),
            batcher: Batcher::new(BatchConfig::from(&self.config)),
            exporter: Arc::clone(&self.exporter),
            semaphore: Arc::new(Semaphore::new(self.config.max_concurrent_exports)),
            tasks: JoinSet::new(),
            policy: self.config.in_flight_policy,
            grace_period: self.config.shutdown_grace_period,
            deferred: false,
            commands: command_rx,
            shutdown_rx,
            shutdown_deadline: None,
        };

        info!(
            exporter = self.exporter.name(),
            batch_size = self.config.batch_size,
            buffer_capacity = self.config.buffer_capacity,
            max_concurrent_exports = self.config.max_concurrent_exports,
            "span pipeline started"
        );
        self.worker = Some(Worker {
            task: handle.spawn(batching.run()),
            commands: command_tx,
            shutdown_tx,
        });
        Ok(())
    }

    /// Buffers a span without blocking. See [`SpanProducer::enqueue`].
    pub fn enqueue(&self, span: Span) -> Result<(), EnqueueError> {
        self.shared.enqueue(span)
    }

    /// Returns a handle producers can clone across threads and tasks.
    pub fn producer(&self) -> SpanProducer {
        SpanProducer {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Exports everything currently buffered and waits for every in-flight
    /// export to settle.
    ///
    /// Returns the number of spans dispatched; `0` for an empty buffer.
    pub async fn flush(&self) -> Result<usize, PipelineError> {
        let state = self.shared.state();
        let worker = match (&self.worker, state) {
            (Some(worker), PipelineState::Running) => worker,
            _ => {
                return Err(PipelineError::InvalidState {
                    operation: "flush",
                    state,
                })
            }
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        worker
            .commands
            .send(Command::Flush(ack_tx))
            .await
            .map_err(|_| PipelineError::Worker("batching loop is gone".into()))?;
        ack_rx
            .await
            .map_err(|_| PipelineError::Worker("flush interrupted by shutdown".into()))
    }

    /// Stops accepting spans, flushes the buffer and waits up to
    /// `shutdown_grace_period` for in-flight exports.
    ///
    /// Exports still running at the deadline are cancelled; their spans and
    /// anything left in the buffer are counted as `ShutdownTimeout`.
    pub async fn shutdown(&mut self) -> Result<ShutdownReport, PipelineError> {
        let started = Instant::now();
        self.shared
            .transition(PipelineState::Running, PipelineState::Draining)
            .map_err(|state| PipelineError::InvalidState {
                operation: "shutdown",
                state,
            })?;
        let Some(worker) = self.worker.take() else {
            self.shared.set_state(PipelineState::Stopped);
            return Err(PipelineError::Worker("batching loop was never spawned".into()));
        };

        let timed_out_before = self.shared.metrics.dropped(DropReason::ShutdownTimeout);
        let deadline = started + self.config.shutdown_grace_period;
        info!(
            grace_period_ms = self.config.shutdown_grace_period.as_millis() as u64,
            buffered = self.shared.buffer.len(),
            "span pipeline draining"
        );

        // the loop treats a dropped sender as an immediate shutdown as well
        let _ = worker.shutdown_tx.send(deadline);
        let outcome = worker.task.await;
        self.shared.set_state(PipelineState::Stopped);
        let outcome =
            outcome.map_err(|e| PipelineError::Worker(format!("task join error: {}", e)))?;

        let timed_out_spans =
            self.shared.metrics.dropped(DropReason::ShutdownTimeout) - timed_out_before;
        let report = ShutdownReport {
            flushed_spans: outcome.flushed_spans,
            timed_out_spans,
            elapsed: started.elapsed(),
            metrics: self.snapshot(),
        };
        if report.is_clean() {
            info!(elapsed_ms = report.elapsed.as_millis() as u64, "span pipeline stopped");
        } else {
            warn!(
                elapsed_ms = report.elapsed.as_millis() as u64,
                timed_out_spans, "span pipeline stopped with spans lost to the grace deadline"
            );
        }
        Ok(report)
    }

    pub fn state(&self) -> PipelineState {
        self.shared.state()
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.shared.metrics
    }

    /// Point-in-time copy of every counter plus current buffer occupancy.
    pub fn snapshot(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot(self.shared.buffer.len())
    }

    pub fn buffered(&self) -> usize {
        self.shared.buffer.len()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }
}

/// Accounts for one batch between dispatch and settlement.
///
/// Dropped without [`settle`](Self::settle) only when the export task is
/// aborted at the grace deadline (or panics); the batch is then counted
/// as lost.
struct InFlightGuard {
    metrics: Arc<PipelineMetrics>,
    sequence: u64,
    span_count: u64,
    settled: bool,
    _permit: OwnedSemaphorePermit,
}

impl InFlightGuard {
    fn new(metrics: Arc<PipelineMetrics>, batch: &SpanBatch, permit: OwnedSemaphorePermit) -> Self {
        metrics.inc_inflight();
        Self {
            metrics,
            sequence: batch.sequence,
            span_count: batch.len() as u64,
            settled: false,
            _permit: permit,
        }
    }

    fn settle(mut self) {
        self.settled = true;
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if !self.settled {
            let reason = if std::thread::panicking() {
                DropReason::PermanentRejection
            } else {
                DropReason::ShutdownTimeout
            };
            self.metrics.record_dropped_batch(reason, self.span_count);
            warn!(
                batch = self.sequence,
                spans = self.span_count,
                reason = %reason,
                "export cancelled before completion"
            );
        }
        self.metrics.dec_inflight();
    }
}

fn drop_reason(error: &ExportError) -> DropReason {
    match error {
        ExportError::RetriesExhausted { .. } => DropReason::RetriesExhausted,
        e if e.kind() == FailureKind::Permanent => DropReason::PermanentRejection,
        // a transient error surfacing here means the retry layer was bypassed
        _ => DropReason::RetriesExhausted,
    }
}

async fn export_batch(
    exporter: Arc<dyn SpanExporterBoxed>,
    batch: SpanBatch,
    guard: InFlightGuard,
) {
    let metrics = Arc::clone(&guard.metrics);
    let sequence = batch.sequence;
    let span_count = batch.len() as u64;
    let started = Instant::now();

    match exporter.export_boxed(batch).await {
        Ok(()) => {
            metrics.record_export(span_count, started.elapsed());
            debug!(batch = sequence, spans = span_count, "batch exported");
        }
        Err(e) => {
            let reason = drop_reason(&e);
            metrics.record_dropped_batch(reason, span_count);
            error!(
                batch = sequence,
                spans = span_count,
                reason = %reason,
                error = %e,
                "dropping batch"
            );
        }
    }
    guard.settle();
}

/// The single task that decides when to cut batches.
struct BatchingLoop {
    shared: Arc<Shared>,
    batcher: Batcher,
    exporter: Arc<dyn SpanExporterBoxed>,
    semaphore: Arc<Semaphore>,
    tasks: JoinSet<()>,
    policy: InFlightPolicy,
    grace_period: Duration,
    /// Every slot was taken under `Defer`; the timer waits for a completion
    deferred: bool,
    commands: mpsc::Receiver<Command>,
    shutdown_rx: oneshot::Receiver<Instant>,
    shutdown_deadline: Option<Instant>,
}

impl BatchingLoop {
    async fn run(mut self) -> DrainOutcome {
        loop {
            if let Some(deadline) = self.shutdown_deadline {
                return self.drain(deadline).await;
            }

            let notifier = Arc::clone(self.shared.buffer.notifier());
            let timer_armed = !self.deferred;
            tokio::select! {
                Some(result) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    reap(result);
                    if self.deferred {
                        self.deferred = false;
                        self.on_wake().await;
                    }
                }

                () = sleep_until(self.batcher.deadline()), if timer_armed => {
                    self.on_wake().await;
                }

                () = notifier.notified() => {
                    self.on_wake().await;
                }

                command = self.commands.recv() => match command {
                    Some(Command::Flush(ack)) => {
                        let dispatched = self.flush().await;
                        let _ = ack.send(dispatched);
                    }
                    None => {
                        // controller dropped without shutting down
                        self.shutdown_deadline = Some(Instant::now() + self.grace_period);
                    }
                },

                deadline = &mut self.shutdown_rx => {
                    self.on_shutdown_signal(deadline);
                }
            }
        }
    }

    fn on_shutdown_signal(&mut self, deadline: Result<Instant, oneshot::error::RecvError>) {
        let deadline = deadline.unwrap_or_else(|_| Instant::now() + self.grace_period);
        self.shutdown_deadline = Some(deadline);
    }

    /// Runs a drain cycle if a size or interval trigger is due.
    async fn on_wake(&mut self) {
        let now = Instant::now();
        let buffered = self.shared.buffer.len();
        match self.batcher.pending_trigger(buffered, now) {
            Some(trigger) => self.cycle(trigger).await,
            None => self.batcher.rearm_if_idle(buffered, now),
        }
    }

    async fn cycle(&mut self, trigger: FlushTrigger) {
        while self.batcher.should_continue(trigger, self.shared.buffer.len()) {
            let permit = match self.policy {
                InFlightPolicy::Block => self.wait_for_permit().await,
                InFlightPolicy::Defer => Arc::clone(&self.semaphore).try_acquire_owned().ok(),
            };
            let Some(permit) = permit else {
                if self.shutdown_deadline.is_none() {
                    self.deferred = true;
                    debug!(
                        buffered = self.shared.buffer.len(),
                        "all export slots busy, deferring batch"
                    );
                }
                return;
            };
            let Some(batch) = self.batcher.next_batch(&self.shared.buffer) else {
                break;
            };
            self.dispatch(batch, permit);
        }
        self.batcher.finish_cycle(self.shared.buffer.len(), Instant::now());
    }

    /// Waits for an export slot; gives up when shutdown is requested.
    async fn wait_for_permit(&mut self) -> Option<OwnedSemaphorePermit> {
        if self.shutdown_deadline.is_some() {
            return None;
        }
        tokio::select! {
            permit = Arc::clone(&self.semaphore).acquire_owned() => permit.ok(),
            deadline = &mut self.shutdown_rx => {
                self.on_shutdown_signal(deadline);
                None
            }
        }
    }

    fn dispatch(&mut self, batch: SpanBatch, permit: OwnedSemaphorePermit) {
        debug!(batch = batch.sequence, spans = batch.len(), "dispatching batch");
        let guard = InFlightGuard::new(Arc::clone(&self.shared.metrics), &batch, permit);
        self.tasks.spawn(export_batch(Arc::clone(&self.exporter), batch, guard));
    }

    async fn flush(&mut self) -> usize {
        let mut dispatched = 0;
        while !self.shared.buffer.is_empty() {
            let Some(permit) = self.wait_for_permit().await else {
                break;
            };
            let Some(batch) = self.batcher.next_batch(&self.shared.buffer) else {
                break;
            };
            dispatched += batch.len();
            self.dispatch(batch, permit);
        }
        self.batcher.finish_cycle(self.shared.buffer.len(), Instant::now());
        self.deferred = false;

        while !self.tasks.is_empty() && self.shutdown_deadline.is_none() {
            tokio::select! {
                Some(result) = self.tasks.join_next() => reap(result),
                deadline = &mut self.shutdown_rx => self.on_shutdown_signal(deadline),
            }
        }
        debug!(spans = dispatched, trigger = ?FlushTrigger::Forced, "flush complete");
        dispatched
    }

    async fn drain(mut self, deadline: Instant) -> DrainOutcome {
        self.shared.set_state(PipelineState::Draining);
        let mut outcome = DrainOutcome::default();

        loop {
            while let Some(batch) = self.batcher.next_batch(&self.shared.buffer) {
                match timeout_at(deadline, Arc::clone(&self.semaphore).acquire_owned()).await {
                    Ok(Ok(permit)) => {
                        outcome.flushed_spans += batch.len() as u64;
                        self.dispatch(batch, permit);
                    }
                    _ => {
                        self.shared
                            .metrics
                            .record_dropped_batch(DropReason::ShutdownTimeout, batch.len() as u64);
                        warn!(
                            batch = batch.sequence,
                            spans = batch.len(),
                            "no export slot before the grace deadline, dropping batch"
                        );
                    }
                }
            }

            if self.tasks.is_empty() {
                if self.shared.state() == PipelineState::Draining {
                    // spans accepted while the last batches were cut still get the grace period
                    self.shared.stop_intake();
                    if !self.shared.buffer.is_empty() {
                        continue;
                    }
                }
                break;
            }
            tokio::select! {
                Some(result) = self.tasks.join_next() => reap(result),
                () = sleep_until(deadline) => break,
            }
        }

        if !self.tasks.is_empty() {
            warn!(
                in_flight = self.tasks.len(),
                "grace period elapsed, cancelling in-flight exports"
            );
            self.tasks.abort_all();
            while let Some(result) = self.tasks.join_next().await {
                reap(result);
            }
        }

        self.shared.stop_intake();
        let leftover = self.shared.buffer.drain_all();
        if !leftover.is_empty() {
            self.shared
                .metrics
                .record_dropped_spans(DropReason::ShutdownTimeout, leftover.len() as u64);
            warn!(spans = leftover.len(), "spans still buffered at stop, dropping");
        }
        outcome
    }
}

fn reap(result: Result<(), JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            error!(error = %e, "export task panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exporter::InMemoryExporter;
    use crate::span::{SpanId, TraceId};

    fn span(i: u64) -> Span {
        Span::builder(TraceId::from_u128(7), SpanId::from_u64(i + 1), format!("op-{}", i))
            .build()
            .unwrap()
    }

    fn config() -> PipelineConfig {
        PipelineConfig::default()
            .with_batch_size(10)
            .with_max_batch_size(10)
            .with_buffer_capacity(100)
            .with_flush_interval(Duration::from_secs(60))
    }

    #[test]
    fn test_invalid_config_rejected() {
        let result = PipelineController::new(config().with_batch_size(0), InMemoryExporter::new());
        assert!(matches!(result, Err(PipelineError::Config(_))));
    }

    #[tokio::test]
    async fn test_enqueue_refused_until_started() {
        let exporter = Arc::new(InMemoryExporter::new());
        let mut pipeline = PipelineController::new(config(), exporter.clone()).unwrap();

        assert_eq!(pipeline.state(), PipelineState::Stopped);
        assert_eq!(
            pipeline.enqueue(span(0)),
            Err(EnqueueError::NotAccepting(PipelineState::Stopped))
        );
        // refusal is not a drop
        assert_eq!(pipeline.metrics().dropped_total(), 0);

        pipeline.start().unwrap();
        assert_eq!(pipeline.state(), PipelineState::Running);
        pipeline.enqueue(span(1)).unwrap();

        let report = pipeline.shutdown().await.unwrap();
        assert_eq!(pipeline.state(), PipelineState::Stopped);
        assert!(report.is_clean());
        assert_eq!(exporter.exported_count(), 1);
    }

    #[tokio::test]
    async fn test_invalid_transitions() {
        let mut pipeline = PipelineController::new(config(), InMemoryExporter::new()).unwrap();

        assert!(matches!(
            pipeline.shutdown().await,
            Err(PipelineError::InvalidState {
                operation: "shutdown",
                state: PipelineState::Stopped
            })
        ));
        assert!(matches!(pipeline.flush().await, Err(PipelineError::InvalidState { .. })));

        pipeline.start().unwrap();
        assert!(matches!(
            pipeline.start(),
            Err(PipelineError::InvalidState {
                operation: "start",
                state: PipelineState::Running
            })
        ));
        pipeline.shutdown().await.unwrap();
    }

    #[test]
    fn test_start_outside_runtime_fails() {
        let mut pipeline = PipelineController::new(config(), InMemoryExporter::new()).unwrap();
        assert!(matches!(pipeline.start(), Err(PipelineError::Worker(_))));
        assert_eq!(pipeline.state(), PipelineState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_size_trigger_leaves_remainder_buffered() {
        let exporter = Arc::new(InMemoryExporter::new());
        let mut pipeline = PipelineController::new(config(), exporter.clone()).unwrap();
        pipeline.start().unwrap();

        for i in 0..25 {
            pipeline.enqueue(span(i)).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(exporter.batch_sizes(), vec![10, 10]);
        assert_eq!(pipeline.buffered(), 5);

        pipeline.shutdown().await.unwrap();
        assert_eq!(exporter.exported_count(), 25);
    }

    #[tokio::test]
    async fn test_flush_on_empty_buffer_is_noop() {
        let exporter = Arc::new(InMemoryExporter::new());
        let mut pipeline = PipelineController::new(config(), exporter.clone()).unwrap();
        pipeline.start().unwrap();

        assert_eq!(pipeline.flush().await.unwrap(), 0);
        let snapshot = pipeline.snapshot();
        assert_eq!(snapshot.batches_exported, 0);
        assert_eq!(snapshot.dropped_total(), 0);

        // no sequence number was consumed
        pipeline.enqueue(span(0)).unwrap();
        assert_eq!(pipeline.flush().await.unwrap(), 1);
        assert_eq!(exporter.batches()[0].sequence, 1);

        pipeline.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_producer_handle_from_threads() {
        let exporter = Arc::new(InMemoryExporter::new());
        let mut pipeline =
            PipelineController::new(config().with_buffer_capacity(1_000), exporter.clone())
                .unwrap();
        pipeline.start().unwrap();

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let producer = pipeline.producer();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        producer.enqueue(span(t * 1_000 + i)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        pipeline.flush().await.unwrap();
        assert_eq!(exporter.exported_count(), 200);
        assert!(exporter.batch_sizes().iter().all(|&n| (1..=10).contains(&n)));
        pipeline.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_draining_refuses_by_default() {
        let mut pipeline = PipelineController::new(config(), InMemoryExporter::new()).unwrap();
        pipeline.start().unwrap();
        let producer = pipeline.producer();

        pipeline.shared.set_state(PipelineState::Draining);
        assert_eq!(
            producer.enqueue(span(0)),
            Err(EnqueueError::NotAccepting(PipelineState::Draining))
        );
        pipeline.shared.set_state(PipelineState::Running);
        pipeline.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_accept_during_drain() {
        let mut pipeline = PipelineController::new(
            config().with_accept_during_drain(true),
            InMemoryExporter::new(),
        )
        .unwrap();
        pipeline.start().unwrap();
        let producer = pipeline.producer();

        pipeline.shared.set_state(PipelineState::Draining);
        assert!(producer.enqueue(span(0)).is_ok());
        pipeline.shared.set_state(PipelineState::Running);

        let report = pipeline.shutdown().await.unwrap();
        assert_eq!(report.metrics.spans_exported, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_spans_accepted_during_drain_are_exported() {
        use std::sync::atomic::AtomicU64;

        let exporter = Arc::new(InMemoryExporter::new());
        let config = config()
            .with_batch_size(100)
            .with_max_batch_size(100)
            .with_buffer_capacity(100_000)
            .with_accept_during_drain(true)
            .with_shutdown_grace_period(Duration::from_secs(30));
        let mut pipeline = PipelineController::new(config, exporter.clone()).unwrap();
        pipeline.start().unwrap();

        let accepted = Arc::new(AtomicU64::new(0));
        let producer = pipeline.producer();
        let counter = Arc::clone(&accepted);
        let handle = std::thread::spawn(move || {
            for i in 0..50_000 {
                match producer.enqueue(span(i)) {
                    Ok(()) => {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(EnqueueError::NotAccepting(PipelineState::Stopped)) => break,
                    Err(e) => panic!("unexpected enqueue error {:?}", e),
                }
            }
        });
        while accepted.load(Ordering::SeqCst) < 100 {
            tokio::task::yield_now().await;
        }

        let report = pipeline.shutdown().await.unwrap();
        handle.join().unwrap();

        assert_eq!(report.metrics.dropped_total(), 0);
        assert_eq!(report.metrics.spans_exported, accepted.load(Ordering::SeqCst));
        assert_eq!(exporter.exported_count() as u64, accepted.load(Ordering::SeqCst));
        assert_eq!(pipeline.buffered(), 0);
    }

    #[tokio::test]
    async fn test_restart_after_shutdown() {
        let exporter = Arc::new(InMemoryExporter::new());
        let mut pipeline = PipelineController::new(config(), exporter.clone()).unwrap();

        for round in 0..2 {
            pipeline.start().unwrap();
            pipeline.enqueue(span(round)).unwrap();
            pipeline.shutdown().await.unwrap();
        }
        assert_eq!(exporter.exported_count(), 2);
        // sequence numbers restart with the new batching loop
        assert_eq!(
            exporter.batches().iter().map(|b| b.sequence).collect::<Vec<_>>(),
            vec![1, 1]
        );
    }
}
