use span_pipeline::exporter::{ExportError, FailureKind, SpanExporter};
use span_pipeline::{
    DropReason, EnqueueError, HttpExporter, InFlightPolicy, InMemoryExporter, PipelineConfig,
    PipelineController, PipelineState, Span, SpanBatch, SpanId, TraceId,
};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn span(seq: u64) -> Span {
    Span::builder(
        TraceId::from_u128(0xabc),
        SpanId::from_u64(seq + 1),
        format!("op-{}", seq),
    )
    .duration_micros(1_000)
    .build()
    .unwrap()
}

fn config(batch_size: usize) -> PipelineConfig {
    PipelineConfig::default()
        .with_batch_size(batch_size)
        .with_max_batch_size(batch_size)
        .with_buffer_capacity(1_000)
        .with_flush_interval(Duration::from_secs(60))
}

/// Sleeps per batch sequence, then succeeds or fails with a fixed error.
struct ScriptedExporter {
    delay_for: fn(u64) -> Duration,
    failure: Option<ExportError>,
    calls: AtomicU32,
    spans: Mutex<Vec<Span>>,
}

impl ScriptedExporter {
    fn delayed(delay_for: fn(u64) -> Duration) -> Self {
        Self {
            delay_for,
            failure: None,
            calls: AtomicU32::new(0),
            spans: Mutex::new(Vec::new()),
        }
    }

    fn failing(status: u16) -> Self {
        Self {
            delay_for: |_| Duration::ZERO,
            failure: ExportError::from_status(status),
            calls: AtomicU32::new(0),
            spans: Mutex::new(Vec::new()),
        }
    }

    fn exported_count(&self) -> usize {
        self.spans.lock().unwrap().len()
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl SpanExporter for ScriptedExporter {
    async fn export(&self, batch: SpanBatch) -> Result<(), ExportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep((self.delay_for)(batch.sequence)).await;
        if let Some(error) = &self.failure {
            return Err(error.clone());
        }
        self.spans.lock().unwrap().extend(batch.spans);
        Ok(())
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Holds each batch for a fixed time and records the highest number of
/// overlapping export calls.
struct ConcurrencyTracker {
    hold: Duration,
    current: AtomicUsize,
    peak: AtomicUsize,
    exported: AtomicUsize,
}

impl ConcurrencyTracker {
    fn new(hold: Duration) -> Self {
        Self {
            hold,
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            exported: AtomicUsize::new(0),
        }
    }
}

impl SpanExporter for ConcurrencyTracker {
    async fn export(&self, batch: SpanBatch) -> Result<(), ExportError> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.hold).await;
        self.exported.fetch_add(batch.len(), Ordering::SeqCst);
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    fn name(&self) -> &str {
        "concurrency-tracker"
    }
}

#[tokio::test(start_paused = true)]
async fn test_block_policy_caps_concurrent_exports() {
    let exporter = Arc::new(ConcurrencyTracker::new(Duration::from_millis(200)));
    let config = config(5)
        .with_max_concurrent_exports(2)
        .with_in_flight_policy(InFlightPolicy::Block);
    let mut pipeline = PipelineController::new(config, exporter.clone()).unwrap();
    pipeline.start().unwrap();

    // six batches worth; enqueue never waits on the busy export slots
    let producer = pipeline.producer();
    let enqueued_at = tokio::time::Instant::now();
    for i in 0..30 {
        producer.enqueue(span(i)).unwrap();
    }
    assert_eq!(enqueued_at.elapsed(), Duration::ZERO);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(pipeline.metrics().inflight_exports(), 2);
    // batches are only cut once a slot frees up
    assert_eq!(pipeline.buffered(), 20);

    pipeline.flush().await.unwrap();
    assert_eq!(exporter.peak.load(Ordering::SeqCst), 2);
    assert_eq!(exporter.exported.load(Ordering::SeqCst), 30);

    let report = pipeline.shutdown().await.unwrap();
    assert!(report.is_clean());
    assert_eq!(report.metrics.spans_exported, 30);
    assert_eq!(report.metrics.batches_exported, 6);
    assert_eq!(report.metrics.dropped_total(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_all_in_flight_finish_without_loss() {
    let exporter = Arc::new(ScriptedExporter::delayed(|_| Duration::from_millis(500)));
    let config = config(10)
        .with_max_concurrent_exports(4)
        .with_shutdown_grace_period(Duration::from_secs(2));
    let mut pipeline = PipelineController::new(config, exporter.clone()).unwrap();
    pipeline.start().unwrap();

    for i in 0..30 {
        pipeline.enqueue(span(i)).unwrap();
    }
    let report = pipeline.shutdown().await.unwrap();

    assert!(report.is_clean());
    assert_eq!(report.metrics.spans_exported, 30);
    assert_eq!(report.metrics.batches_exported, 3);
    assert_eq!(report.metrics.dropped_total(), 0);
    assert_eq!(report.metrics.inflight_exports, 0);
    assert!(report.elapsed < Duration::from_secs(2));
    assert_eq!(exporter.exported_count(), 30);
    assert_eq!(pipeline.state(), PipelineState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_counts_only_the_batch_past_the_grace_period() {
    // the third batch outlives the 2s grace period
    let exporter = Arc::new(ScriptedExporter::delayed(|sequence| {
        if sequence == 3 {
            Duration::from_secs(5)
        } else {
            Duration::from_millis(500)
        }
    }));
    let config = config(10)
        .with_max_concurrent_exports(4)
        .with_shutdown_grace_period(Duration::from_secs(2));
    let mut pipeline = PipelineController::new(config, exporter.clone()).unwrap();
    pipeline.start().unwrap();

    for i in 0..30 {
        pipeline.enqueue(span(i)).unwrap();
    }
    let report = pipeline.shutdown().await.unwrap();

    assert_eq!(report.timed_out_spans, 10);
    assert_eq!(report.metrics.dropped_shutdown_timeout, 10);
    assert_eq!(report.metrics.batches_dropped, 1);
    assert_eq!(report.metrics.spans_exported, 20);
    assert_eq!(report.metrics.inflight_exports, 0);
    assert_eq!(report.elapsed, Duration::from_secs(2));
    assert_eq!(exporter.exported_count(), 20);
}

#[tokio::test(start_paused = true)]
async fn test_transient_sink_exhausts_retries() {
    let exporter = Arc::new(ScriptedExporter::failing(503));
    let config =
        config(10).with_backoff(3, Duration::from_millis(100), 2.0, Duration::from_secs(10));
    let mut pipeline = PipelineController::new(config, exporter.clone()).unwrap();
    pipeline.start().unwrap();

    for i in 0..5 {
        pipeline.enqueue(span(i)).unwrap();
    }
    assert_eq!(pipeline.flush().await.unwrap(), 5);

    let metrics = pipeline.metrics();
    assert_eq!(exporter.calls(), 4);
    assert_eq!(metrics.retries(), 3);
    assert_eq!(metrics.dropped(DropReason::RetriesExhausted), 5);
    assert_eq!(metrics.batches_dropped(), 1);
    assert_eq!(metrics.spans_exported(), 0);

    pipeline.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_sub_microsecond_jitter_keeps_transient_semantics() {
    let exporter = Arc::new(ScriptedExporter::failing(503));
    let config = config(10)
        .with_backoff(3, Duration::from_millis(100), 2.0, Duration::from_secs(10))
        .with_backoff_jitter(Duration::from_nanos(500));
    config.validate().unwrap();
    let mut pipeline = PipelineController::new(config, exporter.clone()).unwrap();
    pipeline.start().unwrap();

    for i in 0..5 {
        pipeline.enqueue(span(i)).unwrap();
    }
    pipeline.flush().await.unwrap();

    let metrics = pipeline.metrics();
    assert_eq!(exporter.calls(), 4);
    assert_eq!(metrics.retries(), 3);
    assert_eq!(metrics.dropped(DropReason::RetriesExhausted), 5);
    assert_eq!(metrics.dropped(DropReason::PermanentRejection), 0);

    pipeline.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_permanent_rejection_is_not_retried() {
    let exporter = Arc::new(ScriptedExporter::failing(400));
    assert_eq!(
        ExportError::from_status(400).map(|e| e.kind()),
        Some(FailureKind::Permanent)
    );
    let mut pipeline = PipelineController::new(config(10), exporter.clone()).unwrap();
    pipeline.start().unwrap();

    for i in 0..5 {
        pipeline.enqueue(span(i)).unwrap();
    }
    pipeline.flush().await.unwrap();

    assert_eq!(exporter.calls(), 1);
    assert_eq!(pipeline.metrics().retries(), 0);
    assert_eq!(pipeline.metrics().dropped(DropReason::PermanentRejection), 5);

    pipeline.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_time_trigger_flushes_within_interval() {
    let exporter = Arc::new(InMemoryExporter::new());
    let config = config(100).with_flush_interval(Duration::from_secs(1));
    let mut pipeline = PipelineController::new(config, exporter.clone()).unwrap();
    pipeline.start().unwrap();

    for i in 0..3 {
        pipeline.enqueue(span(i)).unwrap();
    }
    tokio::time::sleep(Duration::from_millis(990)).await;
    assert_eq!(exporter.exported_count(), 0);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(exporter.batch_sizes(), vec![3]);

    // a span arriving after the flush waits for the next interval only
    for i in 3..5 {
        pipeline.enqueue(span(i)).unwrap();
    }
    tokio::time::sleep(Duration::from_millis(970)).await;
    assert_eq!(exporter.exported_count(), 3);
    tokio::time::sleep(Duration::from_millis(40)).await;
    assert_eq!(exporter.batch_sizes(), vec![3, 2]);

    pipeline.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_buffer_full_counts_each_rejected_span() {
    let exporter = Arc::new(InMemoryExporter::new());
    let config = config(10).with_buffer_capacity(10);
    let mut pipeline = PipelineController::new(config, exporter.clone()).unwrap();
    pipeline.start().unwrap();

    // nothing yields here, so the batching loop cannot drain in between
    let mut rejected = 0;
    for i in 0..15 {
        match pipeline.enqueue(span(i)) {
            Ok(()) => {}
            Err(e) => {
                assert_eq!(e, EnqueueError::BufferFull);
                assert!(e.is_recoverable());
                rejected += 1;
            }
        }
    }
    assert_eq!(rejected, 5);
    assert_eq!(pipeline.metrics().dropped(DropReason::BufferFull), 5);

    let report = pipeline.shutdown().await.unwrap();
    assert_eq!(report.metrics.spans_exported, 10);
    assert_eq!(report.metrics.spans_exported + report.metrics.dropped_total(), 15);

    // FIFO: the first ten spans survive, in order
    let ids: Vec<_> = exporter
        .all_spans()
        .iter()
        .map(|s| s.span_id().to_u64())
        .collect();
    assert_eq!(ids, (1..=10).collect::<Vec<_>>());
}

#[tokio::test(start_paused = true)]
async fn test_defer_policy_keeps_spans_buffered() {
    let exporter = Arc::new(ScriptedExporter::delayed(|_| Duration::from_secs(1)));
    let config = config(5)
        .with_max_concurrent_exports(1)
        .with_in_flight_policy(InFlightPolicy::Defer);
    let mut pipeline = PipelineController::new(config, exporter.clone()).unwrap();
    pipeline.start().unwrap();

    for i in 0..5 {
        pipeline.enqueue(span(i)).unwrap();
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(pipeline.metrics().inflight_exports(), 1);

    for i in 5..10 {
        pipeline.enqueue(span(i)).unwrap();
    }
    tokio::time::sleep(Duration::from_millis(500)).await;
    // the only slot is busy: the second batch waits in the buffer
    assert_eq!(pipeline.buffered(), 5);
    assert_eq!(exporter.calls(), 1);

    tokio::time::sleep(Duration::from_millis(1_600)).await;
    assert_eq!(exporter.exported_count(), 10);
    assert_eq!(pipeline.buffered(), 0);
    assert_eq!(pipeline.metrics().dropped_total(), 0);

    pipeline.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_no_batch_exceeds_max_batch_size() {
    let exporter = Arc::new(InMemoryExporter::new());
    let config = config(8).with_max_batch_size(20);
    let mut pipeline = PipelineController::new(config, exporter.clone()).unwrap();
    pipeline.start().unwrap();

    for i in 0..97 {
        pipeline.enqueue(span(i)).unwrap();
    }
    pipeline.flush().await.unwrap();

    let sizes = exporter.batch_sizes();
    assert!(sizes.iter().all(|&n| (1..=20).contains(&n)));
    assert_eq!(sizes.iter().sum::<usize>(), 97);

    let sequences: Vec<_> = exporter.batches().iter().map(|b| b.sequence).collect();
    let mut sorted = sequences.clone();
    sorted.sort_unstable();
    assert_eq!(sorted, (1..=sequences.len() as u64).collect::<Vec<_>>());

    pipeline.shutdown().await.unwrap();
}

#[cfg_attr(miri, ignore)]
#[tokio::test]
async fn test_end_to_end_against_collector() {
    use httpmock::prelude::*;

    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/api/traces")
                .header("content-type", "application/json")
                .body_contains("\"serviceName\":\"checkout\"");
            then.status(202);
        })
        .await;

    let config = config(5)
        .with_sink_endpoint(server.url("/api/traces"))
        .with_service_name("checkout");
    let exporter = HttpExporter::new(&config).unwrap();
    let mut pipeline = PipelineController::new(config, exporter).unwrap();
    pipeline.start().unwrap();

    for i in 0..12 {
        pipeline.enqueue(span(i)).unwrap();
    }
    let report = pipeline.shutdown().await.unwrap();

    assert!(report.is_clean());
    assert_eq!(report.metrics.spans_exported, 12);
    assert_eq!(report.metrics.batches_exported, 3);
    assert_eq!(report.metrics.export_latency.count, 3);
    assert_eq!(mock.hits_async().await, 3);
}
