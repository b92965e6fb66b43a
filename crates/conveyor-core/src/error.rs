use thiserror::Error;

/// Application-wide error taxonomy for Conveyor.
///
/// Variants map one-to-one onto the wire-level error kinds surfaced by the
/// REST layer; `is_retryable` drives local backend retries and worker outcome
/// classification.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Malformed input or schema violation. Never retried automatically.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The referenced parameter schema does not exist.
    #[error("schema not found: {0}")]
    SchemaNotFound(String),

    /// Credential missing, unknown, or expired.
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    /// Credential valid but the role does not permit the operation.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Per-key quota exceeded.
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// Missing resource.
    #[error("not found: {0}")]
    NotFound(String),

    /// Idempotency or version conflict. Caller may retry against current state.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A terminal execution was asked to finish with a different outcome.
    #[error("conflicting finish for execution {execution_id}: already {recorded}")]
    ConflictingFinish {
        execution_id: String,
        recorded: String,
    },

    /// Queue outstanding count crossed the high-water mark.
    #[error("queue full for kind '{kind}' ({outstanding} outstanding)")]
    QueueFull { kind: String, outstanding: usize },

    /// Transient failure of a downstream store or bus. Retried locally.
    #[error("retryable backend error: {0}")]
    RetryableBackend(String),

    /// A component is degraded after local retries were exhausted.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Request or collaborator call exceeded its deadline.
    #[error("deadline exceeded after {0} seconds")]
    DeadlineExceeded(u64),

    /// The operation was cancelled before completion.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Bad or missing deployment configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// JSON serialization/deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Unexpected invariant violation. Logged with full context.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::RetryableBackend(_)
                | CoreError::Unavailable(_)
                | CoreError::RateLimited { .. }
                | CoreError::QueueFull { .. }
        )
    }

    /// Seconds the caller should wait before retrying, when known.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            CoreError::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }

    /// Stable wire identifier used in error envelopes.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::InvalidRequest(_) => "invalid_request",
            CoreError::SchemaNotFound(_) => "schema_not_found",
            CoreError::Unauthenticated(_) => "unauthenticated",
            CoreError::Unauthorized(_) => "unauthorized",
            CoreError::RateLimited { .. } => "rate_limited",
            CoreError::NotFound(_) => "not_found",
            CoreError::Conflict(_) | CoreError::ConflictingFinish { .. } => "conflict",
            CoreError::QueueFull { .. } => "queue_full",
            CoreError::RetryableBackend(_) => "retryable_backend",
            CoreError::Unavailable(_) => "unavailable",
            CoreError::DeadlineExceeded(_) => "deadline_exceeded",
            CoreError::Cancelled(_) => "cancelled",
            CoreError::Config(_) => "config",
            CoreError::Serialization(_) => "invalid_request",
            CoreError::Internal(_) => "internal",
        }
    }
}
