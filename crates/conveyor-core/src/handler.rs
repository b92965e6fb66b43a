//! Collaborator contracts for the two job kinds.
//!
//! Engines are pure with respect to system state: they take typed parameters
//! and a run context, and return payload bytes plus an outcome hint. The
//! worker owns every blob write and every execution record.

use std::future::Future;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::artifact::ArtifactMetadata;
use crate::error::CoreError;
use crate::execution::ErrorKind;
use crate::job::{OcrParameters, ScrapeParameters};

/// Cancellation and deadline handed into every engine call.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub cancel: CancellationToken,
    pub deadline: DateTime<Utc>,
}

/// Engine-side classification of how a run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum OutcomeHint {
    Ok,
    /// The system may succeed on a later attempt.
    Retryable { kind: ErrorKind, detail: String },
    /// No retry should be attempted.
    Terminal { kind: ErrorKind, detail: String },
}

/// One output blob produced by an engine, not yet persisted.
#[derive(Debug, Clone)]
pub struct EngineArtifact {
    pub payload: Bytes,
    pub content_type: String,
    pub metadata: ArtifactMetadata,
}

/// What an engine hands back to the worker.
#[derive(Debug, Clone)]
pub struct EngineResult {
    pub artifacts: Vec<EngineArtifact>,
    pub hint: OutcomeHint,
}

impl EngineResult {
    pub fn ok(artifacts: Vec<EngineArtifact>) -> Self {
        Self {
            artifacts,
            hint: OutcomeHint::Ok,
        }
    }

    pub fn retryable(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            artifacts: Vec::new(),
            hint: OutcomeHint::Retryable {
                kind,
                detail: detail.into(),
            },
        }
    }

    pub fn terminal(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            artifacts: Vec::new(),
            hint: OutcomeHint::Terminal {
                kind,
                detail: detail.into(),
            },
        }
    }
}

/// Web-scrape collaborator.
pub trait Scraper: Send + Sync + Clone {
    fn run(
        &self,
        parameters: &ScrapeParameters,
        ctx: &RunContext,
    ) -> impl Future<Output = Result<EngineResult, CoreError>> + Send;
}

/// OCR collaborator.
pub trait OcrEngine: Send + Sync + Clone {
    fn process(
        &self,
        parameters: &OcrParameters,
        ctx: &RunContext,
    ) -> impl Future<Output = Result<EngineResult, CoreError>> + Send;
}
