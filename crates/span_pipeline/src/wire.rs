//! JSON document accepted by the trace collector's HTTP endpoint.
//!
//! ```text
//! {"data": [{"traceID", "spanID", "operationName", "startTime", "duration",
//!            "tags": [{"key","value"}], "logs": [{"timestamp","fields"}],
//!            "process": {"serviceName", "tags"}}]}
//! ```
//!
//! Times are integer microseconds; ids are fixed-width lower-case hex.

use crate::exporter::ExportError;
use crate::span::{KeyValue, Span, SpanBatch, SpanLog, TagValue};
use serde::Serialize;

pub const CONTENT_TYPE: &str = "application/json";

#[derive(Debug, Serialize)]
pub struct Payload<'a> {
    pub data: Vec<WireSpan<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WireSpan<'a> {
    #[serde(rename = "traceID")]
    pub trace_id: String,
    #[serde(rename = "spanID")]
    pub span_id: String,
    pub operation_name: &'a str,
    pub start_time: u64,
    pub duration: u64,
    pub tags: Vec<WireKeyValue<'a>>,
    pub logs: Vec<WireLog<'a>>,
    pub process: WireProcess<'a>,
}

#[derive(Debug, Serialize)]
pub struct WireKeyValue<'a> {
    pub key: &'a str,
    pub value: &'a TagValue,
}

#[derive(Debug, Serialize)]
pub struct WireLog<'a> {
    pub timestamp: u64,
    pub fields: Vec<WireKeyValue<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WireProcess<'a> {
    pub service_name: &'a str,
    pub tags: Vec<WireKeyValue<'a>>,
}

static ERROR_TAG: TagValue = TagValue::Bool(true);

fn key_values(kvs: &[KeyValue]) -> Vec<WireKeyValue<'_>> {
    kvs.iter()
        .map(|kv| WireKeyValue {
            key: &kv.key,
            value: &kv.value,
        })
        .collect()
}

fn log(log: &SpanLog) -> WireLog<'_> {
    WireLog {
        timestamp: log.timestamp_micros,
        fields: key_values(&log.fields),
    }
}

impl<'a> WireSpan<'a> {
    pub fn from_span(span: &'a Span, service_name: &'a str) -> Self {
        let mut tags = key_values(span.tags());
        let already_flagged = span
            .tags()
            .iter()
            .any(|kv| kv.key == "error" && kv.value == ERROR_TAG);
        if span.is_error() && !already_flagged {
            tags.push(WireKeyValue {
                key: "error",
                value: &ERROR_TAG,
            });
        }

        Self {
            trace_id: span.trace_id().to_string(),
            span_id: span.span_id().to_string(),
            operation_name: span.operation_name(),
            start_time: span.start_time_micros(),
            duration: span.duration_micros(),
            tags,
            logs: span.logs().iter().map(log).collect(),
            process: WireProcess {
                service_name,
                tags: Vec::new(),
            },
        }
    }
}

/// Encodes a batch as the collector's JSON document.
pub fn encode_batch(batch: &SpanBatch, service_name: &str) -> Result<Vec<u8>, ExportError> {
    let payload = Payload {
        data: batch
            .spans
            .iter()
            .map(|span| WireSpan::from_span(span, service_name))
            .collect(),
    };
    serde_json::to_vec(&payload).map_err(|e| ExportError::Serialization(e.to_string()))
}
