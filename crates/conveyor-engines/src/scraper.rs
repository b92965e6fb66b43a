//! HTTP scrape engine backed by reqwest.
//!
//! Fetches the target URL and hands the raw body back as one artifact. The
//! engine classifies transport and status failures into outcome hints; it
//! never touches the metadata or blob stores itself.

use bytes::Bytes;
use reqwest::{Client, StatusCode};

use conveyor_core::artifact::ArtifactMetadata;
use conveyor_core::error::CoreError;
use conveyor_core::execution::ErrorKind;
use conveyor_core::handler::{EngineArtifact, EngineResult, RunContext, Scraper};
use conveyor_core::job::ScrapeParameters;

/// Classify a non-success HTTP status from the scrape target.
/// Returns (retryable, kind).
fn classify_status(status: StatusCode) -> (bool, ErrorKind) {
    match status.as_u16() {
        401 | 403 => (false, ErrorKind::SourceAuthorization),
        408 | 429 => (true, ErrorKind::UpstreamStatus),
        500..=599 => (true, ErrorKind::UpstreamStatus),
        _ => (false, ErrorKind::UpstreamStatus),
    }
}

fn classify_transport(e: &reqwest::Error) -> (ErrorKind, String) {
    if e.is_timeout() {
        (ErrorKind::Timeout, format!("request timed out: {e}"))
    } else if e.is_connect() {
        (ErrorKind::Network, format!("connection failed: {e}"))
    } else {
        (ErrorKind::Network, e.to_string())
    }
}

#[derive(Clone)]
pub struct HttpScraper {
    client: Client,
}

impl HttpScraper {
    pub fn new() -> Result<Self, CoreError> {
        let client = Client::builder()
            .user_agent("Conveyor/0.1 (Task Engine)")
            .build()
            .map_err(|e| CoreError::Config(format!("building http client: {e}")))?;
        Ok(Self { client })
    }
}

impl Scraper for HttpScraper {
    async fn run(
        &self,
        parameters: &ScrapeParameters,
        ctx: &RunContext,
    ) -> Result<EngineResult, CoreError> {
        let remaining = (ctx.deadline - chrono::Utc::now())
            .to_std()
            .unwrap_or_default();
        if remaining.is_zero() {
            return Ok(EngineResult::retryable(
                ErrorKind::Timeout,
                "deadline already elapsed",
            ));
        }

        let mut request = self.client.get(&parameters.url).timeout(remaining);
        if let Some(headers) = &parameters.headers {
            for (name, value) in headers {
                request = request.header(name, value);
            }
        }

        let response = tokio::select! {
            response = request.send() => response,
            () = ctx.cancel.cancelled() => {
                return Err(CoreError::Cancelled(format!(
                    "scrape of {} aborted",
                    parameters.url
                )));
            }
        };

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                let (kind, detail) = classify_transport(&e);
                return Ok(EngineResult::retryable(kind, detail));
            }
        };

        let status = response.status();
        if !status.is_success() {
            let (retryable, kind) = classify_status(status);
            let detail = format!("HTTP {} from {}", status.as_u16(), parameters.url);
            return Ok(if retryable {
                EngineResult::retryable(kind, detail)
            } else {
                EngineResult::terminal(kind, detail)
            });
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string())
            .unwrap_or_else(|| "text/html".to_string());

        let payload: Bytes = tokio::select! {
            body = response.bytes() => match body {
                Ok(bytes) => bytes,
                Err(e) => {
                    let (kind, detail) = classify_transport(&e);
                    return Ok(EngineResult::retryable(kind, detail));
                }
            },
            () = ctx.cancel.cancelled() => {
                return Err(CoreError::Cancelled(format!(
                    "scrape of {} aborted mid-body",
                    parameters.url
                )));
            }
        };

        tracing::debug!(url = %parameters.url, bytes = payload.len(), "Page fetched");
        Ok(EngineResult::ok(vec![EngineArtifact {
            payload,
            content_type,
            metadata: ArtifactMetadata {
                source_url: Some(parameters.url.clone()),
                ..ArtifactMetadata::default()
            },
        }]))
    }
}
