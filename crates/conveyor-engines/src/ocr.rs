//! OCR engine client.
//!
//! Conveyor treats OCR as an external HTTP collaborator: the document
//! address and options go out as JSON, recognized text and per-document
//! statistics come back. Pixel-level processing stays on the other side of
//! the wire.

use bytes::Bytes;
use reqwest::Client;
use serde::Deserialize;

use conveyor_core::artifact::ArtifactMetadata;
use conveyor_core::error::CoreError;
use conveyor_core::execution::ErrorKind;
use conveyor_core::handler::{EngineArtifact, EngineResult, OcrEngine, RunContext};
use conveyor_core::job::OcrParameters;

/// Response shape of the OCR service.
#[derive(Debug, Deserialize)]
struct OcrResponse {
    text: String,
    #[serde(default)]
    page_count: Option<u32>,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
}

#[derive(Clone)]
pub struct RemoteOcrEngine {
    client: Client,
    /// OCR service endpoint; without one every job fails terminally.
    endpoint: Option<String>,
}

impl RemoteOcrEngine {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, CoreError> {
        Ok(Self {
            client: build_client()?,
            endpoint: Some(endpoint.into()),
        })
    }

    /// An engine with no backend configured. Kept constructible so scrape-only
    /// deployments still wire a worker.
    pub fn disabled() -> Result<Self, CoreError> {
        Ok(Self {
            client: build_client()?,
            endpoint: None,
        })
    }

    /// Read `CONVEYOR_OCR_ENDPOINT`; absent means disabled.
    pub fn from_env() -> Result<Self, CoreError> {
        match std::env::var("CONVEYOR_OCR_ENDPOINT") {
            Ok(endpoint) => Self::new(endpoint),
            Err(_) => Self::disabled(),
        }
    }
}

fn build_client() -> Result<Client, CoreError> {
    Client::builder()
        .user_agent("Conveyor/0.1 (Task Engine)")
        .build()
        .map_err(|e| CoreError::Config(format!("building http client: {e}")))
}

impl OcrEngine for RemoteOcrEngine {
    async fn process(
        &self,
        parameters: &OcrParameters,
        ctx: &RunContext,
    ) -> Result<EngineResult, CoreError> {
        let Some(endpoint) = &self.endpoint else {
            return Ok(EngineResult::terminal(
                ErrorKind::Engine,
                "no OCR backend configured",
            ));
        };

        let remaining = (ctx.deadline - chrono::Utc::now())
            .to_std()
            .unwrap_or_default();
        if remaining.is_zero() {
            return Ok(EngineResult::retryable(
                ErrorKind::Timeout,
                "deadline already elapsed",
            ));
        }

        let body = serde_json::json!({
            "document_uri": parameters.document_uri,
            "language": parameters.language,
            "dpi": parameters.dpi,
            "pages": parameters.pages,
        });

        let response = tokio::select! {
            response = self
                .client
                .post(endpoint)
                .timeout(remaining)
                .json(&body)
                .send() => response,
            () = ctx.cancel.cancelled() => {
                return Err(CoreError::Cancelled(format!(
                    "ocr of {} aborted",
                    parameters.document_uri
                )));
            }
        };

        let response = match response {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                return Ok(EngineResult::retryable(
                    ErrorKind::Timeout,
                    format!("ocr service timed out: {e}"),
                ));
            }
            Err(e) => {
                return Ok(EngineResult::retryable(
                    ErrorKind::Network,
                    format!("ocr service unreachable: {e}"),
                ));
            }
        };

        let status = response.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return Ok(EngineResult::retryable(
                ErrorKind::UpstreamStatus,
                format!("HTTP {} from ocr service", status.as_u16()),
            ));
        }
        if !status.is_success() {
            // The service rejected this document; retrying will not help.
            return Ok(EngineResult::terminal(
                ErrorKind::Engine,
                format!("HTTP {} from ocr service", status.as_u16()),
            ));
        }

        let parsed: OcrResponse = match response.json().await {
            Ok(parsed) => parsed,
            Err(e) => {
                return Ok(EngineResult::retryable(
                    ErrorKind::UpstreamStatus,
                    format!("malformed ocr response: {e}"),
                ));
            }
        };

        tracing::debug!(
            document = %parameters.document_uri,
            pages = ?parsed.page_count,
            "Document recognized"
        );
        Ok(EngineResult::ok(vec![EngineArtifact {
            payload: Bytes::from(parsed.text),
            content_type: "text/plain; charset=utf-8".to_string(),
            metadata: ArtifactMetadata {
                page_count: parsed.page_count,
                language: parsed.language.or_else(|| parameters.language.clone()),
                ocr_confidence: parsed.confidence,
                ..ArtifactMetadata::default()
            },
        }]))
    }
}
