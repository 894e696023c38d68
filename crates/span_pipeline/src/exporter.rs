use crate::span::{Span, SpanBatch};
use crate::wire;
use std::future::Future;
use std::io::Write;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

/// Whether retrying a failed export can help.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Network blip, timeout, overloaded or failing backend
    Transient,
    /// Malformed or refused payload; the same batch will never be accepted
    Permanent,
}

/// Error types for span export operations
#[derive(Debug, Error, Clone)]
pub enum ExportError {
    /// Transport-layer error (connect, reset, DNS)
    #[error("transport error: {0}")]
    Transport(String),
    /// Export attempt exceeded its timeout
    #[error("export attempt timed out")]
    Timeout,
    /// The sink answered with an error status
    #[error("sink responded with status {status}")]
    Status { status: u16, kind: FailureKind },
    /// Payload could not be encoded
    #[error("serialization error: {0}")]
    Serialization(String),
    /// Request could not be built (bad URL or header)
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// All retry attempts exhausted
    #[error("all retry attempts exhausted after {attempts} tries: {last}")]
    RetriesExhausted { attempts: u32, last: Box<ExportError> },
}

impl ExportError {
    /// Classifies the failure for the retry decision.
    pub fn kind(&self) -> FailureKind {
        match self {
            ExportError::Transport(_) | ExportError::Timeout => FailureKind::Transient,
            ExportError::Status { kind, .. } => *kind,
            ExportError::Serialization(_) | ExportError::InvalidRequest(_) => {
                FailureKind::Permanent
            }
            // terminal: the retry budget is gone
            ExportError::RetriesExhausted { .. } => FailureKind::Permanent,
        }
    }

    /// Maps an HTTP-style status code onto an error, `None` for success.
    ///
    /// `408`, `429` and `5xx` are transient; every other non-2xx code is
    /// permanent.
    pub fn from_status(status: u16) -> Option<ExportError> {
        if (200..300).contains(&status) {
            return None;
        }
        let kind = if status == 408 || status == 429 || status >= 500 {
            FailureKind::Transient
        } else {
            FailureKind::Permanent
        };
        Some(ExportError::Status { status, kind })
    }
}

/// Trait for delivering span batches to a backend.
///
/// Uses `impl Future` return types, which are not object-safe; use
/// [`SpanExporterBoxed`] for dynamic dispatch.
pub trait SpanExporter: Send + Sync {
    /// Exports a batch of spans.
    fn export(&self, batch: SpanBatch) -> impl Future<Output = Result<(), ExportError>> + Send;

    /// Returns the exporter name for debugging.
    fn name(&self) -> &str;
}

/// Object-safe version of SpanExporter for dynamic dispatch.
pub trait SpanExporterBoxed: Send + Sync {
    /// Exports a batch of spans (boxed future for object safety).
    fn export_boxed(
        &self,
        batch: SpanBatch,
    ) -> Pin<Box<dyn Future<Output = Result<(), ExportError>> + Send + '_>>;

    /// Returns the exporter name for debugging.
    fn name(&self) -> &str;
}

/// Blanket implementation: any SpanExporter can be used as SpanExporterBoxed
impl<T: SpanExporter> SpanExporterBoxed for T {
    fn export_boxed(
        &self,
        batch: SpanBatch,
    ) -> Pin<Box<dyn Future<Output = Result<(), ExportError>> + Send + '_>> {
        Box::pin(self.export(batch))
    }

    fn name(&self) -> &str {
        SpanExporter::name(self)
    }
}

/// Lets callers keep a handle on an exporter they hand to the pipeline.
impl<T: SpanExporter> SpanExporter for Arc<T> {
    fn export(&self, batch: SpanBatch) -> impl Future<Output = Result<(), ExportError>> + Send {
        (**self).export(batch)
    }

    fn name(&self) -> &str {
        SpanExporter::name(&**self)
    }
}

/// Stdout exporter for local debugging
pub struct StdoutExporter {
    service_name: String,
    json: bool,
}

impl StdoutExporter {
    /// One summary line per span.
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            json: false,
        }
    }

    /// The collector JSON document per batch.
    pub fn json(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            json: true,
        }
    }
}

impl SpanExporter for StdoutExporter {
    async fn export(&self, batch: SpanBatch) -> Result<(), ExportError> {
        let out = if self.json {
            let mut body = wire::encode_batch(&batch, &self.service_name)?;
            body.push(b'\n');
            body
        } else {
            let mut out = String::new();
            for span in &batch.spans {
                out.push_str(&format!(
                    "batch={} trace_id={} span_id={} op={} duration={}us error={}\n",
                    batch.sequence,
                    span.trace_id(),
                    span.span_id(),
                    span.operation_name(),
                    span.duration_micros(),
                    span.is_error()
                ));
            }
            out.into_bytes()
        };

        std::io::stdout()
            .lock()
            .write_all(&out)
            .map_err(|e| ExportError::Transport(e.to_string()))
    }

    fn name(&self) -> &str {
        "stdout"
    }
}

/// Null exporter that discards all spans (for benchmarking)
#[derive(Debug, Default)]
pub struct NullExporter;

impl NullExporter {
    pub fn new() -> Self {
        Self
    }
}

impl SpanExporter for NullExporter {
    async fn export(&self, _batch: SpanBatch) -> Result<(), ExportError> {
        Ok(())
    }

    fn name(&self) -> &str {
        "null"
    }
}

/// Records every exported batch; for tests and embedding.
#[derive(Debug, Default)]
pub struct InMemoryExporter {
    batches: Mutex<Vec<SpanBatch>>,
}

impl InMemoryExporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total spans received.
    pub fn exported_count(&self) -> usize {
        self.lock().iter().map(SpanBatch::len).sum()
    }

    /// Sizes of received batches in arrival order.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.lock().iter().map(SpanBatch::len).collect()
    }

    pub fn batches(&self) -> Vec<SpanBatch> {
        self.lock().clone()
    }

    pub fn all_spans(&self) -> Vec<Span> {
        self.lock().iter().flat_map(|b| b.spans.iter().cloned()).collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<SpanBatch>> {
        self.batches.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SpanExporter for InMemoryExporter {
    async fn export(&self, batch: SpanBatch) -> Result<(), ExportError> {
        self.lock().push(batch);
        Ok(())
    }

    fn name(&self) -> &str {
        "in_memory"
    }
}
