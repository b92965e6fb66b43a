//! Test utilities: in-memory implementations of every external interface.
//!
//! Handwritten doubles for dependency injection in unit and integration
//! tests. All of them use `Arc<Mutex<_>>` interior mutability so tests can
//! assert on recorded calls. `MemoryStore` is a faithful document store with
//! per-document CAS and atomic transactions, which makes it good enough to
//! run the whole engine in-process.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::artifact::ArtifactMetadata;
use crate::error::CoreError;
use crate::governor::{KeyRecord, KeyValidator};
use crate::handler::{EngineArtifact, EngineResult, OcrEngine, RunContext, Scraper};
use crate::intake::SubmitRequest;
use crate::job::{JobKind, JobSpec, JobState, Parameters, Priority, RetryPolicy, Schedule,
    ScrapeParameters, config_hash};
use crate::store::{
    BlobBody, BlobStore, Document, Expect, FinishedBlob, MetadataStore, Order, QueryFilter, TxOp,
    collections,
};
use crate::worker::{WorkerEvent, WorkerReporter};

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct StoredDoc {
    body: serde_json::Value,
    version: u64,
    updated_at: DateTime<Utc>,
}

type Collections = HashMap<String, HashMap<String, StoredDoc>>;

/// In-memory document store with per-document compare-and-swap.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Collections>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Collections> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn check(
        collections: &Collections,
        collection: &str,
        id: &str,
        expect: Expect,
    ) -> Result<(), CoreError> {
        let current = collections.get(collection).and_then(|c| c.get(id));
        match (expect, current) {
            (Expect::Any, _) => Ok(()),
            (Expect::Absent, None) => Ok(()),
            (Expect::Absent, Some(_)) => Err(CoreError::Conflict(format!(
                "document {collection}/{id} already exists"
            ))),
            (Expect::Version(v), Some(doc)) if doc.version == v => Ok(()),
            (Expect::Version(v), Some(doc)) => Err(CoreError::Conflict(format!(
                "document {collection}/{id} is at version {}, expected {v}",
                doc.version
            ))),
            (Expect::Version(_), None) => Err(CoreError::Conflict(format!(
                "document {collection}/{id} does not exist"
            ))),
        }
    }

    fn apply_put(
        collections: &mut Collections,
        collection: &str,
        id: &str,
        body: serde_json::Value,
    ) -> u64 {
        let entry = collections.entry(collection.to_string()).or_default();
        let version = entry.get(id).map(|d| d.version).unwrap_or(0) + 1;
        entry.insert(
            id.to_string(),
            StoredDoc {
                body,
                version,
                updated_at: Utc::now(),
            },
        );
        version
    }

    fn doc_created_at(doc: &StoredDoc) -> Option<DateTime<Utc>> {
        serde_json::from_value(doc.body.get("created_at")?.clone()).ok()
    }
}

impl MetadataStore for MemoryStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, CoreError> {
        let collections = self.lock();
        Ok(collections
            .get(collection)
            .and_then(|c| c.get(id))
            .map(|doc| Document {
                id: id.to_string(),
                body: doc.body.clone(),
                version: doc.version,
                updated_at: doc.updated_at,
            }))
    }

    async fn put(
        &self,
        collection: &str,
        id: &str,
        body: serde_json::Value,
        expect: Expect,
    ) -> Result<u64, CoreError> {
        let mut collections = self.lock();
        Self::check(&collections, collection, id, expect)?;
        Ok(Self::apply_put(&mut collections, collection, id, body))
    }

    async fn delete(&self, collection: &str, id: &str, expect: Expect) -> Result<(), CoreError> {
        let mut collections = self.lock();
        Self::check(&collections, collection, id, expect)?;
        if let Some(c) = collections.get_mut(collection) {
            c.remove(id);
        }
        Ok(())
    }

    async fn query(
        &self,
        collection: &str,
        filter: QueryFilter,
        limit: usize,
    ) -> Result<Vec<Document>, CoreError> {
        let collections = self.lock();
        let Some(docs) = collections.get(collection) else {
            return Ok(Vec::new());
        };

        let mut matches: Vec<(Option<DateTime<Utc>>, String, &StoredDoc)> = docs
            .iter()
            .filter(|(_, doc)| {
                filter
                    .equals
                    .iter()
                    .all(|(field, value)| doc.body.get(field) == Some(value))
            })
            .filter(|(_, doc)| {
                let created = Self::doc_created_at(doc);
                let after_ok = match filter.created_after {
                    Some(bound) => created.is_some_and(|c| c >= bound),
                    None => true,
                };
                let before_ok = match filter.created_before {
                    Some(bound) => created.is_some_and(|c| c < bound),
                    None => true,
                };
                after_ok && before_ok
            })
            .map(|(id, doc)| (Self::doc_created_at(doc), id.clone(), doc))
            .collect();

        matches.sort_by(|a, b| {
            let ordering = a.0.cmp(&b.0).then(a.1.cmp(&b.1));
            match filter.order {
                Order::Asc => ordering,
                Order::Desc => ordering.reverse(),
            }
        });

        if let Some((after_ts, after_id)) = &filter.after {
            matches.retain(|(created, id, _)| {
                let key = (created.unwrap_or(DateTime::<Utc>::MIN_UTC), id.clone());
                let bound = (*after_ts, after_id.clone());
                match filter.order {
                    Order::Asc => key > bound,
                    Order::Desc => key < bound,
                }
            });
        }

        Ok(matches
            .into_iter()
            .take(limit)
            .map(|(_, id, doc)| Document {
                id,
                body: doc.body.clone(),
                version: doc.version,
                updated_at: doc.updated_at,
            })
            .collect())
    }

    async fn transaction(&self, ops: Vec<TxOp>) -> Result<(), CoreError> {
        if ops.len() > crate::store::MAX_TRANSACTION_OPS {
            return Err(CoreError::InvalidRequest(format!(
                "transaction exceeds {} operations",
                crate::store::MAX_TRANSACTION_OPS
            )));
        }
        let mut collections = self.lock();
        // Validate everything first so the commit is all-or-nothing.
        for op in &ops {
            match op {
                TxOp::Put {
                    collection,
                    id,
                    expect,
                    ..
                }
                | TxOp::Delete {
                    collection,
                    id,
                    expect,
                } => Self::check(&collections, collection, id, *expect)?,
            }
        }
        for op in ops {
            match op {
                TxOp::Put {
                    collection,
                    id,
                    body,
                    ..
                } => {
                    Self::apply_put(&mut collections, &collection, &id, body);
                }
                TxOp::Delete { collection, id, .. } => {
                    if let Some(c) = collections.get_mut(&collection) {
                        c.remove(&id);
                    }
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryBlobStore
// ---------------------------------------------------------------------------

#[derive(Default)]
struct BlobState {
    blobs: HashMap<String, Vec<u8>>,
    uploads: HashMap<String, (String, Vec<u8>)>,
}

/// In-memory blob store with `mem://` uris.
#[derive(Clone, Default)]
pub struct MemoryBlobStore {
    inner: Arc<Mutex<BlobState>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store bytes directly (test setup helper).
    pub async fn put_direct(&self, path: &str, bytes: &[u8]) -> String {
        let uri = format!("mem://{path}");
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .blobs
            .insert(uri.clone(), bytes.to_vec());
        uri
    }

    pub async fn exists(&self, uri: &str) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .blobs
            .contains_key(uri)
    }
}

impl BlobStore for MemoryBlobStore {
    async fn start_upload(&self, path: &str) -> Result<String, CoreError> {
        let handle = Uuid::new_v4().to_string();
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .uploads
            .insert(handle.clone(), (path.to_string(), Vec::new()));
        Ok(handle)
    }

    async fn write_chunk(&self, handle: &str, chunk: Bytes) -> Result<(), CoreError> {
        let mut state = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let (_, buffer) = state
            .uploads
            .get_mut(handle)
            .ok_or_else(|| CoreError::NotFound(format!("upload {handle}")))?;
        buffer.extend_from_slice(&chunk);
        Ok(())
    }

    async fn finish_upload(&self, handle: &str) -> Result<FinishedBlob, CoreError> {
        let mut state = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let (path, bytes) = state
            .uploads
            .remove(handle)
            .ok_or_else(|| CoreError::NotFound(format!("upload {handle}")))?;
        let uri = format!("mem://{path}");
        let sha256 = format!("{:x}", Sha256::digest(&bytes));
        let size_bytes = bytes.len() as u64;
        state.blobs.insert(uri.clone(), bytes);
        Ok(FinishedBlob {
            uri,
            sha256,
            size_bytes,
        })
    }

    async fn open_read(&self, uri: &str) -> Result<BlobBody, CoreError> {
        let state = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let bytes = state
            .blobs
            .get(uri)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("blob {uri}")))?;
        let chunks: Vec<Result<Bytes, CoreError>> = bytes
            .chunks(8 * 1024)
            .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
            .collect();
        Ok(futures_util::stream::iter(chunks).boxed())
    }

    async fn delete(&self, uri: &str) -> Result<(), CoreError> {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .blobs
            .remove(uri);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// StaticKeyValidator
// ---------------------------------------------------------------------------

/// Key validator backed by a fixed token table; the credential is the key id.
#[derive(Clone, Default)]
pub struct StaticKeyValidator {
    keys: Arc<HashMap<String, KeyRecord>>,
}

impl StaticKeyValidator {
    pub fn new(records: Vec<KeyRecord>) -> Self {
        Self {
            keys: Arc::new(
                records
                    .into_iter()
                    .map(|record| (record.key_id.clone(), record))
                    .collect(),
            ),
        }
    }
}

impl KeyValidator for StaticKeyValidator {
    async fn validate(&self, credential: &str) -> Result<Option<KeyRecord>, CoreError> {
        Ok(self.keys.get(credential).cloned())
    }
}

// ---------------------------------------------------------------------------
// Mock engines
// ---------------------------------------------------------------------------

/// Scrape engine double driven by a scripted result queue.
///
/// An empty script yields a default success with one HTML artifact whose
/// `source_url` echoes the request. `slow` variants honour the cancellation
/// token and surface `CoreError::Cancelled`.
#[derive(Clone, Default)]
pub struct MockScraper {
    script: Arc<Mutex<Vec<EngineResult>>>,
    delay: Duration,
    pub calls: Arc<Mutex<Vec<String>>>,
}

impl MockScraper {
    pub fn succeeding() -> Self {
        Self::default()
    }

    pub fn with_script(script: Vec<EngineResult>) -> Self {
        Self {
            script: Arc::new(Mutex::new(script)),
            ..Self::default()
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    /// Fail retryably `failures` times, then succeed.
    pub fn flaky(failures: usize, kind: crate::execution::ErrorKind) -> Self {
        let script = (0..failures)
            .map(|i| EngineResult::retryable(kind, format!("transient failure {}", i + 1)))
            .collect();
        Self::with_script(script)
    }

    fn default_success(url: &str) -> EngineResult {
        EngineResult::ok(vec![EngineArtifact {
            payload: Bytes::from(format!("<html><body>{url}</body></html>")),
            content_type: "text/html".to_string(),
            metadata: ArtifactMetadata {
                source_url: Some(url.to_string()),
                ..ArtifactMetadata::default()
            },
        }])
    }
}

impl Scraper for MockScraper {
    async fn run(
        &self,
        parameters: &ScrapeParameters,
        ctx: &RunContext,
    ) -> Result<EngineResult, CoreError> {
        self.calls
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(parameters.url.clone());

        if !self.delay.is_zero() {
            tokio::select! {
                () = tokio::time::sleep(self.delay) => {}
                () = ctx.cancel.cancelled() => {
                    return Err(CoreError::Cancelled("scrape aborted".into()));
                }
            }
        }

        let mut script = self.script.lock().unwrap_or_else(|p| p.into_inner());
        if script.is_empty() {
            Ok(Self::default_success(&parameters.url))
        } else {
            Ok(script.remove(0))
        }
    }
}

/// OCR engine double, same shape as [`MockScraper`].
#[derive(Clone, Default)]
pub struct MockOcrEngine {
    script: Arc<Mutex<Vec<EngineResult>>>,
    delay: Duration,
    pub calls: Arc<Mutex<Vec<String>>>,
}

impl MockOcrEngine {
    pub fn succeeding() -> Self {
        Self::default()
    }

    pub fn with_script(script: Vec<EngineResult>) -> Self {
        Self {
            script: Arc::new(Mutex::new(script)),
            ..Self::default()
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }
}

impl OcrEngine for MockOcrEngine {
    async fn process(
        &self,
        parameters: &crate::job::OcrParameters,
        ctx: &RunContext,
    ) -> Result<EngineResult, CoreError> {
        self.calls
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(parameters.document_uri.clone());

        if !self.delay.is_zero() {
            tokio::select! {
                () = tokio::time::sleep(self.delay) => {}
                () = ctx.cancel.cancelled() => {
                    return Err(CoreError::Cancelled("ocr aborted".into()));
                }
            }
        }

        let mut script = self.script.lock().unwrap_or_else(|p| p.into_inner());
        if script.is_empty() {
            Ok(EngineResult::ok(vec![EngineArtifact {
                payload: Bytes::from("recognized text"),
                content_type: "text/plain".to_string(),
                metadata: ArtifactMetadata {
                    page_count: Some(1),
                    language: parameters.language.clone(),
                    ocr_confidence: Some(0.97),
                    ..ArtifactMetadata::default()
                },
            }]))
        } else {
            Ok(script.remove(0))
        }
    }
}

// ---------------------------------------------------------------------------
// MockReporter
// ---------------------------------------------------------------------------

/// Worker reporter that records event labels.
#[derive(Clone, Default)]
pub struct MockReporter {
    pub events: Arc<Mutex<Vec<String>>>,
}

impl MockReporter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WorkerReporter for MockReporter {
    fn report(&self, event: WorkerEvent<'_>) {
        let label = match &event {
            WorkerEvent::Started { .. } => "Started",
            WorkerEvent::Polling { .. } => "Polling",
            WorkerEvent::ExecutionStarted { .. } => "ExecutionStarted",
            WorkerEvent::ExecutionSucceeded { .. } => "ExecutionSucceeded",
            WorkerEvent::ExecutionFailed { .. } => "ExecutionFailed",
            WorkerEvent::ExecutionCancelled { .. } => "ExecutionCancelled",
            WorkerEvent::DeadLettered { .. } => "DeadLettered",
            WorkerEvent::ShuttingDown { .. } => "ShuttingDown",
            WorkerEvent::Stopped { .. } => "Stopped",
        };
        self.events
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(label.to_string());
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// A one-shot scrape job in `pending_dispatch`.
pub fn make_test_job(tenant_id: &str) -> JobSpec {
    let parameters = Parameters::Scrape(ScrapeParameters {
        url: "https://example.test/page".to_string(),
        headers: None,
        timeout_secs: None,
    });
    let schedule = Schedule::Once;
    let hash = config_hash(&parameters, &schedule, None).expect("hashable");
    let now = Utc::now();
    JobSpec {
        id: Uuid::now_v7(),
        tenant_id: tenant_id.to_string(),
        parameters,
        schedule,
        retry_policy: RetryPolicy::default(),
        priority: Priority::Normal,
        ordering_key: None,
        state: JobState::PendingDispatch,
        config_hash: hash,
        dedupe: true,
        created_at: now,
        updated_at: now,
        next_fire_at: None,
        cancel_requested: false,
        attempt_counter: 0,
    }
}

/// Persist a job fixture and hand it back.
pub async fn seed_job(store: &MemoryStore, job: JobSpec) -> JobSpec {
    store
        .put(
            collections::JOBS,
            &job.id.to_string(),
            crate::store::to_body(&job).expect("serializable"),
            Expect::Absent,
        )
        .await
        .expect("seed job");
    job
}

/// A submit draft for a scrape job.
pub fn scrape_request(url: &str) -> SubmitRequest {
    SubmitRequest {
        kind: JobKind::Scrape,
        parameters: serde_json::json!({ "url": url }),
        schedule: Schedule::Once,
        retry_policy: None,
        priority: Priority::Normal,
        ordering_key: None,
        dedupe: true,
    }
}

/// A submit draft for an OCR job.
pub fn ocr_request(document_uri: &str) -> SubmitRequest {
    SubmitRequest {
        kind: JobKind::Ocr,
        parameters: serde_json::json!({ "document_uri": document_uri }),
        schedule: Schedule::Once,
        retry_policy: None,
        priority: Priority::Normal,
        ordering_key: None,
        dedupe: true,
    }
}
