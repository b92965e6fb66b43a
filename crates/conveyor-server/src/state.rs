use chrono::{DateTime, Utc};

use conveyor_core::bus::MessageBus;
use conveyor_core::clock::SystemClock;
use conveyor_core::governor::{KeyValidator, RateGovernor};
use conveyor_core::intake::IntakeService;
use conveyor_core::query::QueryService;
use conveyor_core::recorder::ExecutionRecorder;
use conveyor_core::store::{BlobStore, MetadataStore};

/// Shared application state, available to all route handlers via
/// `State<Arc<AppState<...>>>`. Generic over the storage, bus, and key
/// validation backends so integration tests run against the in-memory
/// implementations.
pub struct AppState<M, B, Q, V>
where
    M: MetadataStore,
    B: BlobStore,
    Q: MessageBus,
    V: KeyValidator,
{
    pub store: M,
    pub bus: Q,
    pub governor: RateGovernor<M, V, SystemClock>,
    pub intake: IntakeService<M, Q, SystemClock>,
    pub query: QueryService<M, B>,
    pub recorder: ExecutionRecorder<M, SystemClock>,
    pub started_at: DateTime<Utc>,
}
