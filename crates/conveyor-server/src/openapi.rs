use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Conveyor API",
        version = "0.1.0",
        description = "Task lifecycle engine for scrape and OCR jobs."
    ),
    paths(
        crate::routes::submit_job,
        crate::routes::list_jobs,
        crate::routes::get_job,
        crate::routes::cancel_job,
        crate::routes::list_executions,
        crate::routes::get_execution,
        crate::routes::get_artifact,
        crate::routes::stream_artifact_body,
        crate::routes::list_dlq,
        crate::routes::redrive_dlq,
        crate::routes::status,
        crate::routes::healthz,
    ),
    components(schemas(
        crate::dto::SubmitJobRequest,
        crate::dto::JobResponse,
        crate::dto::JobListResponse,
        crate::dto::ExecutionResponse,
        crate::dto::ExecutionListResponse,
        crate::dto::ArtifactResponse,
        crate::dto::DlqEntryResponse,
        crate::dto::DlqListResponse,
        crate::dto::RedriveRequest,
        crate::dto::RedriveResponse,
        crate::dto::QueueStatus,
        crate::dto::StatusResponse,
        crate::dto::HealthResponse,
        crate::dto::ErrorResponse,
    )),
    tags(
        (name = "jobs", description = "Job submission and lifecycle"),
        (name = "executions", description = "Execution attempts"),
        (name = "artifacts", description = "Produced artifacts"),
        (name = "admin", description = "Operator actions"),
        (name = "system", description = "Status and health"),
    ),
    modifiers(&SecurityAddon)
)]
pub struct ApiDoc;

/// Adds the bearer token security scheme to the OpenAPI spec.
struct SecurityAddon;

impl utoipa::Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer",
                utoipa::openapi::security::SecurityScheme::Http(
                    utoipa::openapi::security::HttpBuilder::new()
                        .scheme(utoipa::openapi::security::HttpAuthScheme::Bearer)
                        .bearer_format("token")
                        .description(Some(
                            "API key. Configured via the CONVEYOR_API_KEYS environment variable.",
                        ))
                        .build(),
                ),
            );
        }
    }
}
