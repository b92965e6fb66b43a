use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::CoreError;

/// Collection names in the metadata store.
pub mod collections {
    pub const JOBS: &str = "jobs";
    pub const EXECUTIONS: &str = "executions";
    pub const ARTIFACTS: &str = "artifacts";
    pub const RATE_BUCKETS: &str = "rate_buckets";
    pub const SCHEDULER_LEASE: &str = "scheduler_lease";
    pub const DLQ_INDEX: &str = "dlq_index";
}

/// Maximum number of operations a single transaction may carry.
pub const MAX_TRANSACTION_OPS: usize = 25;

/// A stored document with its optimistic-lock version.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub body: serde_json::Value,
    /// Monotonic per-document version, starts at 1 on create.
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    /// Deserialize the body into a typed value.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, CoreError> {
        serde_json::from_value(self.body.clone()).map_err(CoreError::from)
    }
}

/// Expected version for a compare-and-swap write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    /// The document must not exist.
    Absent,
    /// The document must exist at exactly this version.
    Version(u64),
    /// Unconditional upsert.
    Any,
}

/// One operation inside a transaction.
#[derive(Debug, Clone)]
pub enum TxOp {
    Put {
        collection: String,
        id: String,
        body: serde_json::Value,
        expect: Expect,
    },
    Delete {
        collection: String,
        id: String,
        expect: Expect,
    },
}

/// Sort direction for queries over the `created_at` body field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Order {
    #[default]
    Asc,
    Desc,
}

/// Index filter for `MetadataStore::query`.
///
/// `equals` entries match top-level body fields exactly; `range` bounds the
/// `created_at` field; results are ordered by `(created_at, id)` and resume
/// after `after` when set.
#[derive(Debug, Clone, Default)]
pub struct QueryFilter {
    pub equals: Vec<(String, serde_json::Value)>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub after: Option<(DateTime<Utc>, String)>,
    pub order: Order,
}

impl QueryFilter {
    pub fn eq(mut self, field: &str, value: impl Into<serde_json::Value>) -> Self {
        self.equals.push((field.to_string(), value.into()));
        self
    }
}

/// Document-oriented metadata store with per-document compare-and-swap.
///
/// Implementations must make `put` atomic with respect to the version check
/// and `transaction` atomic across all its operations (at most
/// [`MAX_TRANSACTION_OPS`]).
pub trait MetadataStore: Send + Sync + Clone {
    fn get(
        &self,
        collection: &str,
        id: &str,
    ) -> impl Future<Output = Result<Option<Document>, CoreError>> + Send;

    /// Write a document, enforcing `expect`. Returns the new version.
    fn put(
        &self,
        collection: &str,
        id: &str,
        body: serde_json::Value,
        expect: Expect,
    ) -> impl Future<Output = Result<u64, CoreError>> + Send;

    fn delete(
        &self,
        collection: &str,
        id: &str,
        expect: Expect,
    ) -> impl Future<Output = Result<(), CoreError>> + Send;

    fn query(
        &self,
        collection: &str,
        filter: QueryFilter,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<Document>, CoreError>> + Send;

    /// Commit all operations atomically, or none of them.
    fn transaction(&self, ops: Vec<TxOp>) -> impl Future<Output = Result<(), CoreError>> + Send;
}

/// Serialize a value into a document body.
pub fn to_body<T: Serialize>(value: &T) -> Result<serde_json::Value, CoreError> {
    serde_json::to_value(value).map_err(CoreError::from)
}

/// Completed upload descriptor.
#[derive(Debug, Clone)]
pub struct FinishedBlob {
    pub uri: String,
    pub sha256: String,
    pub size_bytes: u64,
}

/// Streaming blob body.
pub type BlobBody = BoxStream<'static, Result<Bytes, CoreError>>;

/// Content-addressed blob storage consumed by the worker runtime and the
/// query layer.
pub trait BlobStore: Send + Sync + Clone {
    /// Begin an upload addressed by `path`. Returns an opaque handle.
    fn start_upload(&self, path: &str)
    -> impl Future<Output = Result<String, CoreError>> + Send;

    fn write_chunk(
        &self,
        handle: &str,
        chunk: Bytes,
    ) -> impl Future<Output = Result<(), CoreError>> + Send;

    /// Seal the upload; the blob becomes immutable and readable at the
    /// returned uri.
    fn finish_upload(
        &self,
        handle: &str,
    ) -> impl Future<Output = Result<FinishedBlob, CoreError>> + Send;

    fn open_read(&self, uri: &str) -> impl Future<Output = Result<BlobBody, CoreError>> + Send;

    fn delete(&self, uri: &str) -> impl Future<Output = Result<(), CoreError>> + Send;
}

/// Run a backend operation with local retries.
///
/// `RetryableBackend` failures are retried up to three attempts with
/// exponential backoff; exhaustion surfaces as `Unavailable`.
pub async fn with_backend_retry<T, F, Fut>(label: &str, mut op: F) -> Result<T, CoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CoreError>>,
{
    const MAX_ATTEMPTS: u32 = 3;
    let mut backoff = Duration::from_millis(50);

    for attempt in 1..=MAX_ATTEMPTS {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if matches!(e, CoreError::RetryableBackend(_)) && attempt < MAX_ATTEMPTS => {
                tracing::warn!(%label, attempt, error = %e, "Backend operation failed, retrying");
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
            Err(CoreError::RetryableBackend(msg)) => {
                return Err(CoreError::Unavailable(format!(
                    "{label} failed after {MAX_ATTEMPTS} attempts: {msg}"
                )));
            }
            Err(e) => return Err(e),
        }
    }
    unreachable!("retry loop always returns")
}
