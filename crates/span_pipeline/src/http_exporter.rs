//! Delivery to a trace collector over HTTP.

use crate::config::PipelineConfig;
use crate::exporter::{ExportError, SpanExporter};
use crate::span::SpanBatch;
use crate::wire;
use reqwest::header::CONTENT_TYPE;
use tracing::debug;

/// POSTs each batch as the collector JSON document.
///
/// Any `2xx` (the collector answers `202 Accepted`) is success. Status codes
/// are classified by [`ExportError::from_status`]; connection errors and
/// client timeouts are transient.
#[derive(Debug, Clone)]
pub struct HttpExporter {
    client: reqwest::Client,
    endpoint: String,
    service_name: String,
}

impl HttpExporter {
    /// Builds a client for `config.sink_endpoint`.
    ///
    /// The per-attempt timeout is enforced by the retry layer; the client
    /// timeout here is only a backstop at the same value.
    pub fn new(config: &PipelineConfig) -> Result<Self, ExportError> {
        let client = reqwest::Client::builder()
            .timeout(config.export_timeout)
            .build()
            .map_err(|e| ExportError::Transport(format!("cannot create http client: {}", e)))?;
        Ok(Self::with_client(client, config.sink_endpoint.clone(), config.service_name.clone()))
    }

    pub fn with_client(
        client: reqwest::Client,
        endpoint: impl Into<String>,
        service_name: impl Into<String>,
    ) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            service_name: service_name.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

fn classify_transport(error: &reqwest::Error) -> ExportError {
    if error.is_timeout() {
        ExportError::Timeout
    } else if error.is_builder() {
        ExportError::InvalidRequest(error.to_string())
    } else {
        ExportError::Transport(error.to_string())
    }
}

impl SpanExporter for HttpExporter {
    async fn export(&self, batch: SpanBatch) -> Result<(), ExportError> {
        let body = wire::encode_batch(&batch, &self.service_name)?;
        debug!(
            url = %self.endpoint,
            batch = batch.sequence,
            spans = batch.len(),
            payload_size = body.len(),
            "sending batch"
        );

        let response = self
            .client
            .post(&self.endpoint)
            .header(CONTENT_TYPE, wire::CONTENT_TYPE)
            .body(body)
            .send()
            .await
            .map_err(|e| classify_transport(&e))?;

        let status = response.status().as_u16();
        debug!(status, batch = batch.sequence, "received response");
        match ExportError::from_status(status) {
            None => Ok(()),
            Some(error) => Err(error),
        }
    }

    fn name(&self) -> &str {
        "http"
    }
}
