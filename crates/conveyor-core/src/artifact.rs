use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::job::JobKind;

/// Kind-specific artifact annotations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ocr_confidence: Option<f64>,
}

/// A blob emitted by an execution.
///
/// Content-addressed via `sha256`; sealed (immutable) once the owning
/// execution terminates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: Uuid,
    pub execution_id: Uuid,
    /// Opaque address in the blob store.
    pub storage_uri: String,
    pub content_type: String,
    pub size_bytes: u64,
    pub sha256: String,
    #[serde(default)]
    pub metadata: ArtifactMetadata,
    pub created_at: DateTime<Utc>,
}

/// Blob path for a new artifact: `{tenant}/{kind}/{YYYY}/{MM}/{DD}/{artifact_id}`.
pub fn blob_path(tenant_id: &str, kind: JobKind, at: DateTime<Utc>, artifact_id: Uuid) -> String {
    format!(
        "{tenant_id}/{kind}/{:04}/{:02}/{:02}/{artifact_id}",
        at.year(),
        at.month(),
        at.day()
    )
}
