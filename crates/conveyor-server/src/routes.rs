use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;
use uuid::Uuid;

use conveyor_core::bus::MessageBus;
use conveyor_core::governor::{KeyValidator, OperationClass};
use conveyor_core::job::JobKind;
use conveyor_core::query::JobFilter;
use conveyor_core::store::{BlobStore, MetadataStore, collections};

use crate::auth::authorize;
use crate::dto::{
    ArtifactResponse, DlqListQuery, DlqListResponse, ExecutionListResponse, ExecutionResponse,
    HealthResponse, JobListResponse, JobResponse, ListExecutionsQuery, ListJobsQuery,
    QueueStatus, RedriveRequest, RedriveResponse, StatusResponse, SubmitJobRequest,
};
use crate::error::ApiError;
use crate::openapi::ApiDoc;
use crate::state::AppState;

const DEFAULT_PAGE: usize = 20;

/// Build the full router with all routes.
pub fn router<M, B, Q, V>(state: Arc<AppState<M, B, Q, V>>) -> Router
where
    M: MetadataStore + 'static,
    B: BlobStore + 'static,
    Q: MessageBus + 'static,
    V: KeyValidator + 'static,
{
    Router::new()
        .route("/v1/jobs", post(submit_job::<M, B, Q, V>))
        .route("/v1/jobs", get(list_jobs::<M, B, Q, V>))
        .route("/v1/jobs/{id}", get(get_job::<M, B, Q, V>))
        .route("/v1/jobs/{id}", delete(cancel_job::<M, B, Q, V>))
        .route(
            "/v1/jobs/{id}/executions",
            get(list_executions::<M, B, Q, V>),
        )
        .route("/v1/executions/{id}", get(get_execution::<M, B, Q, V>))
        .route("/v1/artifacts/{id}", get(get_artifact::<M, B, Q, V>))
        .route(
            "/v1/artifacts/{id}/body",
            get(stream_artifact_body::<M, B, Q, V>),
        )
        .route("/v1/admin/dlq", get(list_dlq::<M, B, Q, V>))
        .route("/v1/admin/dlq/redrive", post(redrive_dlq::<M, B, Q, V>))
        .route("/v1/status", get(status::<M, B, Q, V>))
        .route("/healthz", get(healthz::<M, B, Q, V>))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

#[utoipa::path(
    post,
    path = "/v1/jobs",
    request_body = SubmitJobRequest,
    responses(
        (status = 201, description = "Job accepted (or an identical live job returned)", body = JobResponse),
        (status = 400, description = "Invalid parameters", body = crate::dto::ErrorResponse),
        (status = 401, description = "Unauthenticated"),
        (status = 409, description = "Conflict"),
        (status = 429, description = "Rate limited"),
    ),
    security(("bearer" = [])),
    tag = "jobs"
)]
pub async fn submit_job<M, B, Q, V>(
    State(state): State<Arc<AppState<M, B, Q, V>>>,
    headers: HeaderMap,
    axum::Json(body): axum::Json<SubmitJobRequest>,
) -> Result<impl IntoResponse, ApiError>
where
    M: MetadataStore + 'static,
    B: BlobStore + 'static,
    Q: MessageBus + 'static,
    V: KeyValidator + 'static,
{
    let principal = authorize(&state, &headers, OperationClass::Submit).await?;
    let job = state
        .intake
        .submit(&principal.tenant_id, body.into())
        .await?;
    Ok((StatusCode::CREATED, axum::Json(JobResponse::from(job))))
}

#[utoipa::path(
    get,
    path = "/v1/jobs",
    params(ListJobsQuery),
    responses(
        (status = 200, description = "Page of jobs", body = JobListResponse),
        (status = 401, description = "Unauthenticated"),
    ),
    security(("bearer" = [])),
    tag = "jobs"
)]
pub async fn list_jobs<M, B, Q, V>(
    State(state): State<Arc<AppState<M, B, Q, V>>>,
    headers: HeaderMap,
    Query(query): Query<ListJobsQuery>,
) -> Result<impl IntoResponse, ApiError>
where
    M: MetadataStore + 'static,
    B: BlobStore + 'static,
    Q: MessageBus + 'static,
    V: KeyValidator + 'static,
{
    let principal = authorize(&state, &headers, OperationClass::Read).await?;

    let filter = JobFilter {
        kind: query
            .kind
            .as_deref()
            .map(|raw| raw.parse::<JobKind>())
            .transpose()?,
        state: query
            .state
            .as_deref()
            .map(|raw| raw.parse::<conveyor_core::job::JobState>())
            .transpose()?,
        created_after: query.created_after,
        created_before: query.created_before,
    };
    let page = state
        .query
        .list_jobs(
            &principal,
            filter,
            query.cursor.as_deref(),
            query.limit.unwrap_or(DEFAULT_PAGE),
        )
        .await?;

    Ok(axum::Json(JobListResponse {
        jobs: page.items.into_iter().map(JobResponse::from).collect(),
        next_cursor: page.next_cursor,
    }))
}

#[utoipa::path(
    get,
    path = "/v1/jobs/{id}",
    params(("id" = Uuid, Path, description = "Job ID")),
    responses(
        (status = 200, description = "Job details", body = JobResponse),
        (status = 401, description = "Unauthenticated"),
        (status = 404, description = "Not found", body = crate::dto::ErrorResponse),
    ),
    security(("bearer" = [])),
    tag = "jobs"
)]
pub async fn get_job<M, B, Q, V>(
    State(state): State<Arc<AppState<M, B, Q, V>>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError>
where
    M: MetadataStore + 'static,
    B: BlobStore + 'static,
    Q: MessageBus + 'static,
    V: KeyValidator + 'static,
{
    let principal = authorize(&state, &headers, OperationClass::Read).await?;
    let job = state.query.get_job(&principal, id).await?;
    Ok(axum::Json(JobResponse::from(job)))
}

#[utoipa::path(
    delete,
    path = "/v1/jobs/{id}",
    params(("id" = Uuid, Path, description = "Job ID")),
    responses(
        (status = 204, description = "Job cancelled"),
        (status = 401, description = "Unauthenticated"),
        (status = 404, description = "Not found", body = crate::dto::ErrorResponse),
        (status = 409, description = "Already terminal", body = crate::dto::ErrorResponse),
    ),
    security(("bearer" = [])),
    tag = "jobs"
)]
pub async fn cancel_job<M, B, Q, V>(
    State(state): State<Arc<AppState<M, B, Q, V>>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError>
where
    M: MetadataStore + 'static,
    B: BlobStore + 'static,
    Q: MessageBus + 'static,
    V: KeyValidator + 'static,
{
    let principal = authorize(&state, &headers, OperationClass::Cancel).await?;
    state.intake.cancel(&principal, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Executions
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/v1/jobs/{id}/executions",
    params(
        ("id" = Uuid, Path, description = "Job ID"),
        ListExecutionsQuery,
    ),
    responses(
        (status = 200, description = "Executions of the job", body = ExecutionListResponse),
        (status = 401, description = "Unauthenticated"),
        (status = 404, description = "Not found", body = crate::dto::ErrorResponse),
    ),
    security(("bearer" = [])),
    tag = "executions"
)]
pub async fn list_executions<M, B, Q, V>(
    State(state): State<Arc<AppState<M, B, Q, V>>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Query(query): Query<ListExecutionsQuery>,
) -> Result<impl IntoResponse, ApiError>
where
    M: MetadataStore + 'static,
    B: BlobStore + 'static,
    Q: MessageBus + 'static,
    V: KeyValidator + 'static,
{
    let principal = authorize(&state, &headers, OperationClass::Read).await?;
    let page = state
        .query
        .list_executions(
            &principal,
            id,
            query.cursor.as_deref(),
            query.limit.unwrap_or(DEFAULT_PAGE),
        )
        .await?;
    Ok(axum::Json(ExecutionListResponse {
        executions: page
            .items
            .into_iter()
            .map(ExecutionResponse::from)
            .collect(),
        next_cursor: page.next_cursor,
    }))
}

#[utoipa::path(
    get,
    path = "/v1/executions/{id}",
    params(("id" = Uuid, Path, description = "Execution ID")),
    responses(
        (status = 200, description = "Execution details", body = ExecutionResponse),
        (status = 401, description = "Unauthenticated"),
        (status = 404, description = "Not found", body = crate::dto::ErrorResponse),
    ),
    security(("bearer" = [])),
    tag = "executions"
)]
pub async fn get_execution<M, B, Q, V>(
    State(state): State<Arc<AppState<M, B, Q, V>>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError>
where
    M: MetadataStore + 'static,
    B: BlobStore + 'static,
    Q: MessageBus + 'static,
    V: KeyValidator + 'static,
{
    let principal = authorize(&state, &headers, OperationClass::Read).await?;
    let execution = state.query.get_execution(&principal, id).await?;
    Ok(axum::Json(ExecutionResponse::from(execution)))
}

// ---------------------------------------------------------------------------
// Artifacts
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/v1/artifacts/{id}",
    params(("id" = Uuid, Path, description = "Artifact ID")),
    responses(
        (status = 200, description = "Artifact metadata", body = ArtifactResponse),
        (status = 401, description = "Unauthenticated"),
        (status = 404, description = "Not found", body = crate::dto::ErrorResponse),
    ),
    security(("bearer" = [])),
    tag = "artifacts"
)]
pub async fn get_artifact<M, B, Q, V>(
    State(state): State<Arc<AppState<M, B, Q, V>>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError>
where
    M: MetadataStore + 'static,
    B: BlobStore + 'static,
    Q: MessageBus + 'static,
    V: KeyValidator + 'static,
{
    let principal = authorize(&state, &headers, OperationClass::Read).await?;
    let artifact = state.query.get_artifact(&principal, id).await?;
    Ok(axum::Json(ArtifactResponse::from(artifact)))
}

#[utoipa::path(
    get,
    path = "/v1/artifacts/{id}/body",
    params(("id" = Uuid, Path, description = "Artifact ID")),
    responses(
        (status = 200, description = "Artifact bytes", content_type = "application/octet-stream"),
        (status = 401, description = "Unauthenticated"),
        (status = 404, description = "Not found", body = crate::dto::ErrorResponse),
    ),
    security(("bearer" = [])),
    tag = "artifacts"
)]
pub async fn stream_artifact_body<M, B, Q, V>(
    State(state): State<Arc<AppState<M, B, Q, V>>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError>
where
    M: MetadataStore + 'static,
    B: BlobStore + 'static,
    Q: MessageBus + 'static,
    V: KeyValidator + 'static,
{
    let principal = authorize(&state, &headers, OperationClass::Read).await?;
    let (artifact, body) = state.query.stream_artifact_body(&principal, id).await?;

    let mut response = Response::new(Body::from_stream(body));
    let response_headers = response.headers_mut();
    if let Ok(value) = artifact.content_type.parse() {
        response_headers.insert(header::CONTENT_TYPE, value);
    }
    if let Ok(value) = artifact.size_bytes.to_string().parse() {
        response_headers.insert(header::CONTENT_LENGTH, value);
    }
    Ok(response)
}

// ---------------------------------------------------------------------------
// Admin: dead-letter queue
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/v1/admin/dlq",
    params(DlqListQuery),
    responses(
        (status = 200, description = "Dead-lettered messages", body = DlqListResponse),
        (status = 401, description = "Unauthenticated"),
        (status = 403, description = "Admin role required"),
    ),
    security(("bearer" = [])),
    tag = "admin"
)]
pub async fn list_dlq<M, B, Q, V>(
    State(state): State<Arc<AppState<M, B, Q, V>>>,
    headers: HeaderMap,
    Query(query): Query<DlqListQuery>,
) -> Result<impl IntoResponse, ApiError>
where
    M: MetadataStore + 'static,
    B: BlobStore + 'static,
    Q: MessageBus + 'static,
    V: KeyValidator + 'static,
{
    let _principal = authorize(&state, &headers, OperationClass::Admin).await?;
    let kind: JobKind = query.kind.parse()?;
    let entries = state.bus.dead_letters(kind).await?;
    Ok(axum::Json(DlqListResponse {
        entries: entries.into_iter().map(Into::into).collect(),
    }))
}

#[utoipa::path(
    post,
    path = "/v1/admin/dlq/redrive",
    request_body = RedriveRequest,
    responses(
        (status = 200, description = "Messages redriven", body = RedriveResponse),
        (status = 401, description = "Unauthenticated"),
        (status = 403, description = "Admin role required"),
    ),
    security(("bearer" = [])),
    tag = "admin"
)]
pub async fn redrive_dlq<M, B, Q, V>(
    State(state): State<Arc<AppState<M, B, Q, V>>>,
    headers: HeaderMap,
    axum::Json(body): axum::Json<RedriveRequest>,
) -> Result<impl IntoResponse, ApiError>
where
    M: MetadataStore + 'static,
    B: BlobStore + 'static,
    Q: MessageBus + 'static,
    V: KeyValidator + 'static,
{
    let _principal = authorize(&state, &headers, OperationClass::Admin).await?;

    // Reactivate before the messages become pullable again, so no worker
    // sees a redriven message against a still-dead job.
    for job_id in &body.ids {
        match state.recorder.reactivate(*job_id).await {
            Ok(()) => {}
            // Jobs that were not actually dead-lettered are left untouched.
            Err(conveyor_core::CoreError::Conflict(_))
            | Err(conveyor_core::CoreError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
    }
    let redriven = state.bus.redrive(body.kind, &body.ids).await?;
    Ok(axum::Json(RedriveResponse { redriven }))
}

// ---------------------------------------------------------------------------
// Status & health
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/v1/status",
    responses((status = 200, description = "Queue depths and uptime", body = StatusResponse)),
    tag = "system"
)]
pub async fn status<M, B, Q, V>(
    State(state): State<Arc<AppState<M, B, Q, V>>>,
) -> Result<impl IntoResponse, ApiError>
where
    M: MetadataStore + 'static,
    B: BlobStore + 'static,
    Q: MessageBus + 'static,
    V: KeyValidator + 'static,
{
    let mut queues = std::collections::BTreeMap::new();
    for kind in JobKind::ALL {
        let depth = state.bus.depth(kind).await?;
        queues.insert(kind.to_string(), QueueStatus::from(depth));
    }

    Ok(axum::Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: (chrono::Utc::now() - state.started_at).num_seconds(),
        queues,
    }))
}

#[utoipa::path(
    get,
    path = "/healthz",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse),
        (status = 503, description = "Service is degraded", body = HealthResponse),
    ),
    tag = "system"
)]
pub async fn healthz<M, B, Q, V>(
    State(state): State<Arc<AppState<M, B, Q, V>>>,
) -> impl IntoResponse
where
    M: MetadataStore + 'static,
    B: BlobStore + 'static,
    Q: MessageBus + 'static,
    V: KeyValidator + 'static,
{
    let store_status = match state.store.get(collections::SCHEDULER_LEASE, "leader").await {
        Ok(_) => "ok",
        Err(_) => "error",
    };

    let status = if store_status == "ok" {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        axum::Json(HealthResponse {
            status: if store_status == "ok" {
                "healthy"
            } else {
                "degraded"
            },
            metadata_store: store_status,
        }),
    )
}
