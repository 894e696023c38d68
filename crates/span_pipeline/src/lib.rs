//! Span Pipeline
//!
//! Buffers finished spans in memory, groups them into bounded batches and
//! delivers each batch to a trace collector over HTTP, retrying transient
//! failures with exponential backoff. Instrumented code never blocks on
//! export: `enqueue` either buffers the span or rejects it immediately, and
//! every span that does not reach the collector is counted by reason.
//!
//! ```text
//! enqueue ──► SpanBuffer ──► Batcher ──► RetryingExporter ──► HttpExporter ──► collector
//!                 │                            │
//!                 └──── PipelineMetrics ◄──────┘
//! ```
//!
//! Exporters use native async fn in traits (no `#[async_trait]` macro);
//! [`SpanExporterBoxed`] provides the object-safe form the pipeline stores.

pub mod batcher;
pub mod buffer;
pub mod config;
pub mod error;
pub mod exporter;
pub mod http_exporter;
pub mod id_generator;
pub mod metrics;
pub mod pipeline;
pub mod retry;
pub mod span;
pub mod wire;

// Re-export main types
pub use batcher::{BatchConfig, Batcher, FlushTrigger};
pub use buffer::SpanBuffer;
pub use config::{ConfigError, InFlightPolicy, PipelineConfig};
pub use error::{BufferFull, EnqueueError, PipelineError};
pub use exporter::{
    ExportError, FailureKind, InMemoryExporter, NullExporter, SpanExporter, SpanExporterBoxed,
    StdoutExporter,
};
pub use http_exporter::HttpExporter;
pub use id_generator::{IdGenerator, RandomIdGenerator};
pub use metrics::{DropReason, LatencySnapshot, MetricsSnapshot, PipelineMetrics};
pub use pipeline::{PipelineController, PipelineState, ShutdownReport, SpanProducer};
pub use retry::{ExportAttempt, RetryConfig, RetryingExporter};
pub use span::{
    now_micros, KeyValue, Span, SpanBatch, SpanBuilder, SpanError, SpanId, SpanLog, TagValue,
    TraceId,
};
