use axum::http::HeaderMap;

use conveyor_core::bus::MessageBus;
use conveyor_core::error::CoreError;
use conveyor_core::governor::{KeyValidator, OperationClass, Principal};
use conveyor_core::store::{BlobStore, MetadataStore};

use crate::state::AppState;

/// Resolve `Authorization: Bearer <key>` through the rate governor.
///
/// Handlers call this with the operation class of the endpoint so role
/// gating and per-class quotas apply before any work happens.
pub async fn authorize<M, B, Q, V>(
    state: &AppState<M, B, Q, V>,
    headers: &HeaderMap,
    op: OperationClass,
) -> Result<Principal, CoreError>
where
    M: MetadataStore,
    B: BlobStore,
    Q: MessageBus,
    V: KeyValidator,
{
    let credential = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| {
            CoreError::Unauthenticated(
                "Missing or invalid Authorization header. Expected: Bearer <api_key>".into(),
            )
        })?;

    state.governor.authorize(credential, op).await
}
