use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use uuid::Uuid;

use conveyor_core::CoreError;

use crate::dto::ErrorResponse;

/// Wrapper so we can implement `IntoResponse` for `CoreError`.
///
/// Every error response carries a fresh `trace_id` that is also attached to
/// the server-side log line.
pub struct ApiError(pub CoreError);

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        Self(err)
    }
}

fn status_for(err: &CoreError) -> StatusCode {
    match err.kind() {
        "invalid_request" | "schema_not_found" => StatusCode::BAD_REQUEST,
        "unauthenticated" => StatusCode::UNAUTHORIZED,
        "unauthorized" => StatusCode::FORBIDDEN,
        "not_found" => StatusCode::NOT_FOUND,
        "conflict" | "cancelled" => StatusCode::CONFLICT,
        "rate_limited" => StatusCode::TOO_MANY_REQUESTS,
        "deadline_exceeded" => StatusCode::GATEWAY_TIMEOUT,
        "queue_full" | "retryable_backend" | "unavailable" | "config" => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let trace_id = Uuid::new_v4().to_string();
        let status = status_for(&self.0);

        if status.is_server_error() {
            tracing::error!(%trace_id, error = %self.0, "Request failed");
        } else {
            tracing::debug!(%trace_id, error = %self.0, "Request rejected");
        }

        let body = ErrorResponse {
            error: self.0.kind().to_string(),
            message: self.0.to_string(),
            details: None,
            trace_id,
        };

        let mut response = (status, axum::Json(body)).into_response();
        if let Some(retry_after) = self.0.retry_after() {
            if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}
