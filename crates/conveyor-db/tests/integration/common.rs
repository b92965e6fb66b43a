use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use testcontainers::core::{ContainerPort, WaitFor};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage, ImageExt};

use conveyor_db::{Database, PgDocumentStore};

/// Spin up a PostgreSQL container, run migrations, and hand back the store.
/// The container must stay alive for the duration of the test.
pub async fn setup_store() -> (PgDocumentStore, ContainerAsync<GenericImage>) {
    let container = start_postgres().await;
    let pool = connect_to_container(&container).await;
    let db = Database::from_pool(pool);
    db.migrate().await.expect("Failed to run migrations");
    (db.document_store(), container)
}

async fn start_postgres() -> ContainerAsync<GenericImage> {
    GenericImage::new("postgres", "16")
        .with_exposed_port(ContainerPort::Tcp(5432))
        .with_wait_for(WaitFor::message_on_stderr(
            "database system is ready to accept connections",
        ))
        .with_env_var("POSTGRES_USER", "conveyor")
        .with_env_var("POSTGRES_PASSWORD", "conveyor")
        .with_env_var("POSTGRES_DB", "conveyor_test")
        .start()
        .await
        .expect("Failed to start postgres container")
}

async fn connect_to_container(container: &ContainerAsync<GenericImage>) -> PgPool {
    let host = container.get_host().await.expect("container host");
    let port = container
        .get_host_port_ipv4(5432)
        .await
        .expect("container port");
    let url = format!("postgres://conveyor:conveyor@{host}:{port}/conveyor_test");

    PgPoolOptions::new()
        .max_connections(4)
        .connect(&url)
        .await
        .expect("Failed to connect to container")
}
