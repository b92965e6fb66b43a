use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use conveyor_core::CoreError;

use crate::config::DatabaseConfig;
use crate::document_store::PgDocumentStore;

/// Central database facade — owns the connection pool, runs migrations,
/// and vends the document store.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect to PostgreSQL with the given configuration.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, CoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await
            .map_err(|e| CoreError::Unavailable(format!("Failed to connect: {e}")))?;

        Ok(Self { pool })
    }

    /// Create a `Database` from an existing pool (useful for testing).
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<(), CoreError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| CoreError::Unavailable(format!("Migration failed: {e}")))?;
        Ok(())
    }

    /// Get a [`PgDocumentStore`] backed by this pool.
    pub fn document_store(&self) -> PgDocumentStore {
        PgDocumentStore::new(self.pool.clone())
    }

    /// Cheap liveness probe for the health endpoint.
    pub async fn health_check(&self) -> Result<(), CoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| CoreError::Unavailable(format!("postgres: {e}")))?;
        Ok(())
    }

    /// Get a reference to the underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
