use serde::Serialize;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// 128-bit trace identifier. Zero is reserved as "invalid".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TraceId(u128);

/// 64-bit span identifier. Zero is reserved as "invalid".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SpanId(u64);

impl TraceId {
    pub const INVALID: TraceId = TraceId(0);

    pub const fn from_u128(value: u128) -> Self {
        Self(value)
    }

    pub const fn to_u128(self) -> u128 {
        self.0
    }
}

impl SpanId {
    pub const INVALID: SpanId = SpanId(0);

    pub const fn from_u64(value: u64) -> Self {
        Self(value)
    }

    pub const fn to_u64(self) -> u64 {
        self.0
    }
}

/// Fixed-width lower-case hex, the form trace collectors expect.
impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Tag and log field values. Serialized untagged so JSON keeps the native type.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TagValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl From<&str> for TagValue {
    fn from(value: &str) -> Self {
        TagValue::String(value.to_string())
    }
}

impl From<String> for TagValue {
    fn from(value: String) -> Self {
        TagValue::String(value)
    }
}

impl From<i64> for TagValue {
    fn from(value: i64) -> Self {
        TagValue::Int(value)
    }
}

impl From<f64> for TagValue {
    fn from(value: f64) -> Self {
        TagValue::Float(value)
    }
}

impl From<bool> for TagValue {
    fn from(value: bool) -> Self {
        TagValue::Bool(value)
    }
}

/// A single key/value pair. Keys may repeat within a span.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeyValue {
    pub key: String,
    pub value: TagValue,
}

impl KeyValue {
    pub fn new(key: impl Into<String>, value: impl Into<TagValue>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Timestamped event attached to a span.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpanLog {
    pub timestamp_micros: u64,
    pub fields: Vec<KeyValue>,
}

impl SpanLog {
    pub fn new(timestamp_micros: u64, fields: Vec<KeyValue>) -> Self {
        Self {
            timestamp_micros,
            fields,
        }
    }
}

/// Reasons a span cannot be built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SpanError {
    #[error("trace id must be non-zero")]
    InvalidTraceId,
    #[error("span id must be non-zero")]
    InvalidSpanId,
    #[error("start time must be positive")]
    InvalidStartTime,
}

/// A finished span. Immutable once built; construct it with [`Span::builder`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Span {
    trace_id: TraceId,
    span_id: SpanId,
    operation_name: String,
    start_time_micros: u64,
    duration_micros: u64,
    tags: Vec<KeyValue>,
    error: bool,
    logs: Vec<SpanLog>,
}

impl Span {
    /// Starts a builder stamped with the current wall-clock time.
    pub fn builder(
        trace_id: TraceId,
        span_id: SpanId,
        operation_name: impl Into<String>,
    ) -> SpanBuilder {
        SpanBuilder {
            trace_id,
            span_id,
            operation_name: operation_name.into(),
            start_time_micros: now_micros(),
            duration_micros: 0,
            tags: Vec::new(),
            error: false,
            logs: Vec::new(),
        }
    }

    pub fn trace_id(&self) -> TraceId {
        self.trace_id
    }

    pub fn span_id(&self) -> SpanId {
        self.span_id
    }

    pub fn operation_name(&self) -> &str {
        &self.operation_name
    }

    pub fn start_time_micros(&self) -> u64 {
        self.start_time_micros
    }

    pub fn duration_micros(&self) -> u64 {
        self.duration_micros
    }

    pub fn tags(&self) -> &[KeyValue] {
        &self.tags
    }

    pub fn is_error(&self) -> bool {
        self.error
    }

    pub fn logs(&self) -> &[SpanLog] {
        &self.logs
    }
}

/// Builder for [`Span`]; `build` enforces the id and timestamp invariants.
#[derive(Debug, Clone)]
pub struct SpanBuilder {
    trace_id: TraceId,
    span_id: SpanId,
    operation_name: String,
    start_time_micros: u64,
    duration_micros: u64,
    tags: Vec<KeyValue>,
    error: bool,
    logs: Vec<SpanLog>,
}

impl SpanBuilder {
    pub fn start_time_micros(mut self, start: u64) -> Self {
        self.start_time_micros = start;
        self
    }

    pub fn duration_micros(mut self, duration: u64) -> Self {
        self.duration_micros = duration;
        self
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<TagValue>) -> Self {
        self.tags.push(KeyValue::new(key, value));
        self
    }

    pub fn error(mut self, error: bool) -> Self {
        self.error = error;
        self
    }

    pub fn log(mut self, log: SpanLog) -> Self {
        self.logs.push(log);
        self
    }

    pub fn build(self) -> Result<Span, SpanError> {
        if self.trace_id == TraceId::INVALID {
            return Err(SpanError::InvalidTraceId);
        }
        if self.span_id == SpanId::INVALID {
            return Err(SpanError::InvalidSpanId);
        }
        if self.start_time_micros == 0 {
            return Err(SpanError::InvalidStartTime);
        }

        Ok(Span {
            trace_id: self.trace_id,
            span_id: self.span_id,
            operation_name: self.operation_name,
            start_time_micros: self.start_time_micros,
            duration_micros: self.duration_micros,
            tags: self.tags,
            error: self.error,
            logs: self.logs,
        })
    }
}

/// Batch of spans handed to an exporter.
///
/// Batches built by the pipeline are never empty and never exceed the
/// configured maximum; `sequence` increases by one per batch.
#[derive(Debug, Clone)]
pub struct SpanBatch {
    /// Spans in enqueue order
    pub spans: Vec<Span>,
    /// Batch creation timestamp
    pub created_at: SystemTime,
    /// Per-pipeline sequence number, starting at 1
    pub sequence: u64,
}

impl SpanBatch {
    /// Creates a batch with the given spans
    pub fn new(sequence: u64, spans: Vec<Span>) -> Self {
        Self {
            spans,
            created_at: SystemTime::now(),
            sequence,
        }
    }

    /// Returns the number of spans in the batch
    pub fn len(&self) -> usize {
        self.spans.len()
    }

    /// Returns true if the batch is empty
    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }
}

/// Current wall clock in Unix microseconds (never zero).
pub fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(1, |d| d.as_micros() as u64)
        .max(1)
}
