use std::sync::Arc;

use axum::Router;

use conveyor_core::clock::SystemClock;
use conveyor_core::governor::{GovernorConfig, KeyRecord, RateGovernor, Role};
use conveyor_core::intake::IntakeService;
use conveyor_core::memory_bus::{BusConfig, MemoryBus};
use conveyor_core::query::QueryService;
use conveyor_core::recorder::ExecutionRecorder;
use conveyor_core::testutil::{MemoryBlobStore, MemoryStore, StaticKeyValidator};
use conveyor_server::routes;
use conveyor_server::state::AppState;

pub const DEV_KEY: &str = "dev-key";
pub const ADMIN_KEY: &str = "admin-key";
pub const ANALYST_KEY: &str = "analyst-key";

pub type TestState = AppState<MemoryStore, MemoryBlobStore, MemoryBus<SystemClock>, StaticKeyValidator>;

/// Everything a test needs: the router plus handles on the backends for
/// seeding and assertions. No scheduler or worker runs here; these tests
/// exercise the HTTP surface.
pub struct TestApp {
    pub router: Router,
    pub state: Arc<TestState>,
    pub store: MemoryStore,
    pub blobs: MemoryBlobStore,
}

fn key_table() -> StaticKeyValidator {
    StaticKeyValidator::new(vec![
        KeyRecord {
            key_id: DEV_KEY.into(),
            tenant_id: "tenant-a".into(),
            role: Role::Developer,
            expires_at: None,
        },
        KeyRecord {
            key_id: ADMIN_KEY.into(),
            tenant_id: "ops".into(),
            role: Role::Admin,
            expires_at: None,
        },
        KeyRecord {
            key_id: ANALYST_KEY.into(),
            tenant_id: "tenant-a".into(),
            role: Role::Analyst,
            expires_at: None,
        },
    ])
}

pub fn setup_test_app() -> TestApp {
    setup_with_governor(GovernorConfig {
        capacity: 1_000.0,
        refill_per_sec: 1_000.0,
        ..GovernorConfig::default()
    })
}

/// App with a specific rate-limit configuration (for quota tests).
pub fn setup_with_governor(config: GovernorConfig) -> TestApp {
    let store = MemoryStore::new();
    let blobs = MemoryBlobStore::new();
    let bus = MemoryBus::new(BusConfig::default(), SystemClock);
    let recorder = ExecutionRecorder::new(store.clone(), SystemClock);
    let (events_tx, _events_rx) = tokio::sync::mpsc::channel(64);

    let state = Arc::new(AppState {
        store: store.clone(),
        bus: bus.clone(),
        governor: RateGovernor::new(store.clone(), key_table(), SystemClock, config),
        intake: IntakeService::new(
            store.clone(),
            bus.clone(),
            SystemClock,
            recorder.clone(),
            events_tx,
        ),
        query: QueryService::new(store.clone(), blobs.clone()),
        recorder,
        started_at: chrono::Utc::now(),
    });

    TestApp {
        router: routes::router(state.clone()),
        state,
        store,
        blobs,
    }
}
