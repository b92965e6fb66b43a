use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use conveyor_core::artifact::Artifact;
use conveyor_core::bus::{ExecutionRequest, QueueDepth};
use conveyor_core::execution::Execution;
use conveyor_core::intake::SubmitRequest;
use conveyor_core::job::{JobKind, JobSpec, Priority, RetryPolicy, Schedule};

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct SubmitJobRequest {
    /// "scrape" or "ocr".
    #[schema(value_type = String, example = "scrape")]
    pub kind: JobKind,
    /// Kind-specific payload, validated against the kind's schema.
    #[schema(value_type = Object)]
    pub parameters: serde_json::Value,
    /// Defaults to one-shot immediate execution.
    #[serde(default)]
    #[schema(value_type = Option<Object>)]
    pub schedule: Option<Schedule>,
    #[serde(default)]
    #[schema(value_type = Option<Object>)]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default)]
    #[schema(value_type = Option<String>, example = "normal")]
    pub priority: Option<Priority>,
    /// Executions sharing a key run strictly one at a time, in order.
    #[serde(default)]
    pub ordering_key: Option<String>,
    /// Set false to opt out of tenant-level idempotent submission.
    #[serde(default)]
    pub dedupe: Option<bool>,
}

impl From<SubmitJobRequest> for SubmitRequest {
    fn from(body: SubmitJobRequest) -> Self {
        SubmitRequest {
            kind: body.kind,
            parameters: body.parameters,
            schedule: body.schedule.unwrap_or(Schedule::Once),
            retry_policy: body.retry_policy,
            priority: body.priority.unwrap_or_default(),
            ordering_key: body.ordering_key,
            dedupe: body.dedupe.unwrap_or(true),
        }
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct JobResponse {
    pub id: Uuid,
    pub tenant_id: String,
    pub kind: String,
    #[schema(value_type = Object)]
    pub parameters: serde_json::Value,
    #[schema(value_type = Object)]
    pub schedule: serde_json::Value,
    #[schema(value_type = Object)]
    pub retry_policy: serde_json::Value,
    pub priority: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ordering_key: Option<String>,
    pub state: String,
    pub config_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_fire_at: Option<DateTime<Utc>>,
}

impl From<JobSpec> for JobResponse {
    fn from(job: JobSpec) -> Self {
        let kind = job.kind().to_string();
        Self {
            id: job.id,
            tenant_id: job.tenant_id,
            kind,
            parameters: serde_json::to_value(&job.parameters).unwrap_or_default(),
            schedule: serde_json::to_value(&job.schedule).unwrap_or_default(),
            retry_policy: serde_json::to_value(&job.retry_policy).unwrap_or_default(),
            priority: job.priority.to_string(),
            ordering_key: job.ordering_key,
            state: job.state.to_string(),
            config_hash: job.config_hash,
            created_at: job.created_at,
            updated_at: job.updated_at,
            next_fire_at: job.next_fire_at,
        }
    }
}

#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub struct ListJobsQuery {
    /// Filter by job state (e.g. "active", "succeeded").
    pub state: Option<String>,
    /// Filter by kind ("scrape" or "ocr").
    pub kind: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    /// Opaque cursor from a previous page.
    pub cursor: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct JobListResponse {
    pub jobs: Vec<JobResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

// ---------------------------------------------------------------------------
// Executions
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ExecutionResponse {
    pub id: Uuid,
    pub job_id: Uuid,
    pub attempt_number: u32,
    pub state: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dispatched_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    pub produced_artifacts: Vec<Uuid>,
}

impl From<Execution> for ExecutionResponse {
    fn from(execution: Execution) -> Self {
        Self {
            id: execution.id,
            job_id: execution.job_id,
            attempt_number: execution.attempt_number,
            state: execution.state.to_string(),
            created_at: execution.created_at,
            dispatched_at: execution.dispatched_at,
            started_at: execution.started_at,
            finished_at: execution.finished_at,
            worker_id: execution.worker_id,
            outcome: execution.outcome.map(|o| o.to_string()),
            error_kind: execution
                .error_kind
                .and_then(|k| serde_json::to_value(k).ok())
                .and_then(|v| v.as_str().map(String::from)),
            error_detail: execution.error_detail,
            produced_artifacts: execution.produced_artifacts,
        }
    }
}

#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub struct ListExecutionsQuery {
    pub cursor: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ExecutionListResponse {
    pub executions: Vec<ExecutionResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

// ---------------------------------------------------------------------------
// Artifacts
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ArtifactResponse {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub storage_uri: String,
    pub content_type: String,
    pub size_bytes: u64,
    pub sha256: String,
    #[schema(value_type = Object)]
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl From<Artifact> for ArtifactResponse {
    fn from(artifact: Artifact) -> Self {
        Self {
            id: artifact.id,
            execution_id: artifact.execution_id,
            storage_uri: artifact.storage_uri,
            content_type: artifact.content_type,
            size_bytes: artifact.size_bytes,
            sha256: artifact.sha256,
            metadata: serde_json::to_value(&artifact.metadata).unwrap_or_default(),
            created_at: artifact.created_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Admin / DLQ
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub struct DlqListQuery {
    /// Queue kind to inspect ("scrape" or "ocr").
    pub kind: String,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct DlqEntryResponse {
    pub job_id: Uuid,
    pub execution_id: Uuid,
    pub kind: String,
    pub tenant_id: String,
    pub enqueued_at: DateTime<Utc>,
}

impl From<ExecutionRequest> for DlqEntryResponse {
    fn from(request: ExecutionRequest) -> Self {
        Self {
            job_id: request.job_id,
            execution_id: request.execution_id,
            kind: request.kind.to_string(),
            tenant_id: request.tenant_id,
            enqueued_at: request.enqueued_at,
        }
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct DlqListResponse {
    pub entries: Vec<DlqEntryResponse>,
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct RedriveRequest {
    #[schema(value_type = String, example = "scrape")]
    pub kind: JobKind,
    pub ids: Vec<Uuid>,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct RedriveResponse {
    pub redriven: usize,
}

// ---------------------------------------------------------------------------
// Status / health
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct QueueStatus {
    pub pending: usize,
    pub in_flight: usize,
    pub dead_lettered: usize,
}

impl From<QueueDepth> for QueueStatus {
    fn from(depth: QueueDepth) -> Self {
        Self {
            pending: depth.pending,
            in_flight: depth.in_flight,
            dead_lettered: depth.dead_lettered,
        }
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct StatusResponse {
    pub version: &'static str,
    pub uptime_secs: i64,
    pub queues: std::collections::BTreeMap<String, QueueStatus>,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct HealthResponse {
    pub status: &'static str,
    pub metadata_store: &'static str,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub details: Option<serde_json::Value>,
    pub trace_id: String,
}
