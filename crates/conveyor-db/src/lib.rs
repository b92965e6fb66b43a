//! Storage backends: the PostgreSQL document store (metadata) and the
//! filesystem blob store (artifacts).

pub mod blob_store;
pub mod config;
pub mod database;
pub mod document_store;

pub use blob_store::FsBlobStore;
pub use config::{BlobConfig, DatabaseConfig};
pub use database::Database;
pub use document_store::PgDocumentStore;
