use std::sync::Arc;

use axum::http::HeaderValue;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use conveyor_core::clock::SystemClock;
use conveyor_core::governor::{GovernorConfig, RateGovernor};
use conveyor_core::intake::IntakeService;
use conveyor_core::memory_bus::{BusConfig, MemoryBus};
use conveyor_core::query::QueryService;
use conveyor_core::recorder::ExecutionRecorder;
use conveyor_core::scheduler::{SchedulerConfig, SchedulerService};
use conveyor_core::worker::{TracingWorkerReporter, WorkerConfig, WorkerService};
use conveyor_db::{BlobConfig, Database, DatabaseConfig, FsBlobStore};
use conveyor_engines::{HttpScraper, RemoteOcrEngine};
use conveyor_server::keys::EnvKeyValidator;
use conveyor_server::routes;
use conveyor_server::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("conveyor=info".parse()?))
        .with_target(false)
        .init();

    let port = std::env::var("CONVEYOR_SERVER_PORT").unwrap_or_else(|_| "3000".to_string());
    let addr = format!("0.0.0.0:{port}");

    let db = Database::connect(&DatabaseConfig::from_env()?).await?;
    db.migrate().await?;
    let store = db.document_store();
    let blobs = FsBlobStore::new(BlobConfig::from_env()?.root);
    let bus = MemoryBus::new(BusConfig::default(), SystemClock);

    let validator = EnvKeyValidator::from_env()?;
    let governor = RateGovernor::new(
        store.clone(),
        validator,
        SystemClock,
        GovernorConfig::default(),
    );

    let recorder = ExecutionRecorder::new(store.clone(), SystemClock);
    let (events_tx, events_rx) = tokio::sync::mpsc::channel(1_024);
    let intake = IntakeService::new(
        store.clone(),
        bus.clone(),
        SystemClock,
        recorder.clone(),
        events_tx,
    );
    let query = QueryService::new(store.clone(), blobs.clone());

    let shutdown = CancellationToken::new();
    let mut background = Vec::new();

    // Scheduler replica (leader-elected through the store lease).
    {
        let scheduler = SchedulerService::new(
            store.clone(),
            bus.clone(),
            blobs.clone(),
            SystemClock,
            recorder.clone(),
            SchedulerConfig::default(),
        );
        let cancel = shutdown.clone();
        background.push(tokio::spawn(async move {
            scheduler.run(events_rx, cancel).await;
        }));
    }

    // Rate bucket broadcast loop.
    {
        let governor = governor.clone();
        let cancel = shutdown.clone();
        background.push(tokio::spawn(async move {
            governor.run(cancel).await;
        }));
    }

    // In-process worker pool (set CONVEYOR_WORKER_SLOTS=0 for an API-only node).
    let worker_slots: usize = std::env::var("CONVEYOR_WORKER_SLOTS")
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(4);
    if worker_slots > 0 {
        let worker = WorkerService::new(
            recorder.clone(),
            bus.clone(),
            blobs.clone(),
            HttpScraper::new()?,
            RemoteOcrEngine::from_env()?,
            SystemClock,
            WorkerConfig {
                slots: worker_slots,
                ..WorkerConfig::default()
            },
        );
        let cancel = shutdown.clone();
        background.push(tokio::spawn(async move {
            if let Err(e) = worker.run(cancel, TracingWorkerReporter).await {
                tracing::error!(error = %e, "Worker pool exited with error");
            }
        }));
        tracing::info!(slots = worker_slots, "Worker pool enabled");
    } else {
        tracing::info!("Worker pool disabled (CONVEYOR_WORKER_SLOTS=0)");
    }

    let state = Arc::new(AppState {
        store,
        bus,
        governor,
        intake,
        query,
        recorder,
        started_at: chrono::Utc::now(),
    });

    let cors = match std::env::var("CONVEYOR_CORS_ORIGIN") {
        Ok(origin) if origin == "*" => CorsLayer::permissive(),
        Ok(origin) => {
            let origins: Vec<HeaderValue> = origin
                .split(',')
                .filter_map(|o| o.trim().parse().ok())
                .collect();
            CorsLayer::new().allow_origin(AllowOrigin::list(origins))
        }
        Err(_) => CorsLayer::new(),
    };

    let app = routes::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    tracing::info!("Starting server on {addr}");
    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Drain the scheduler and workers before exiting.
    shutdown.cancel();
    for handle in background {
        let _ = handle.await;
    }

    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install CTRL+C handler");
    tracing::info!("Shutdown signal received");
}
