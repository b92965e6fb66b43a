//! C7: read-only views over jobs, executions, and artifacts.
//!
//! All reads are tenant-scoped by the caller's principal (admins see across
//! tenants). Pagination uses stable opaque cursors encoding the last item's
//! `(created_at, id)` pair.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::artifact::Artifact;
use crate::error::CoreError;
use crate::execution::Execution;
use crate::governor::Principal;
use crate::job::{JobKind, JobSpec, JobState};
use crate::repo;
use crate::store::{BlobBody, BlobStore, MetadataStore, QueryFilter, collections};

/// Filters for `list_jobs`.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub kind: Option<JobKind>,
    pub state: Option<JobState>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
}

/// One page of results plus the cursor for the next page.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<String>,
}

const MAX_PAGE: usize = 100;

/// Encode a `(created_at, id)` pair into an opaque cursor.
fn encode_cursor(created_at: DateTime<Utc>, id: &str) -> String {
    BASE64.encode(format!("{}|{id}", created_at.to_rfc3339()))
}

fn decode_cursor(cursor: &str) -> Result<(DateTime<Utc>, String), CoreError> {
    let raw = BASE64
        .decode(cursor)
        .map_err(|_| CoreError::InvalidRequest("malformed cursor".into()))?;
    let raw = String::from_utf8(raw)
        .map_err(|_| CoreError::InvalidRequest("malformed cursor".into()))?;
    let (timestamp, id) = raw
        .split_once('|')
        .ok_or_else(|| CoreError::InvalidRequest("malformed cursor".into()))?;
    let created_at = DateTime::parse_from_rfc3339(timestamp)
        .map_err(|_| CoreError::InvalidRequest("malformed cursor".into()))?
        .with_timezone(&Utc);
    Ok((created_at, id.to_string()))
}

#[derive(Clone)]
pub struct QueryService<M, B>
where
    M: MetadataStore,
    B: BlobStore,
{
    store: M,
    blobs: B,
}

impl<M, B> QueryService<M, B>
where
    M: MetadataStore,
    B: BlobStore,
{
    pub fn new(store: M, blobs: B) -> Self {
        Self { store, blobs }
    }

    fn check_tenant(principal: &Principal, tenant_id: &str, what: &str) -> Result<(), CoreError> {
        if principal.is_admin() || principal.tenant_id == tenant_id {
            Ok(())
        } else {
            // Tenant isolation: absence and denial look the same.
            Err(CoreError::NotFound(what.to_string()))
        }
    }

    pub async fn get_job(&self, principal: &Principal, id: Uuid) -> Result<JobSpec, CoreError> {
        let (job, _) = repo::require_job(&self.store, id).await?;
        Self::check_tenant(principal, &job.tenant_id, &format!("job {id}"))?;
        Ok(job)
    }

    pub async fn list_jobs(
        &self,
        principal: &Principal,
        filter: JobFilter,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Page<JobSpec>, CoreError> {
        let limit = limit.clamp(1, MAX_PAGE);
        let mut query = QueryFilter {
            created_after: filter.created_after,
            created_before: filter.created_before,
            ..QueryFilter::default()
        };
        if !principal.is_admin() {
            query = query.eq("tenant_id", principal.tenant_id.clone());
        }
        if let Some(state) = filter.state {
            query = query.eq("state", state.as_str());
        }
        if let Some(cursor) = cursor {
            query.after = Some(decode_cursor(cursor)?);
        }

        // Kind lives inside the parameters union; filter after the fetch.
        let docs = self.store.query(collections::JOBS, query, limit + 1).await?;
        let mut jobs = Vec::with_capacity(docs.len());
        for doc in docs {
            let job: JobSpec = doc.parse()?;
            if filter.kind.is_none_or(|k| job.kind() == k) {
                jobs.push(job);
            }
        }

        let next_cursor = if jobs.len() > limit {
            jobs.truncate(limit);
            jobs.last()
                .map(|job| encode_cursor(job.created_at, &job.id.to_string()))
        } else {
            None
        };
        Ok(Page {
            items: jobs,
            next_cursor,
        })
    }

    pub async fn get_execution(
        &self,
        principal: &Principal,
        id: Uuid,
    ) -> Result<Execution, CoreError> {
        let (execution, _) = repo::require_execution(&self.store, id).await?;
        let (job, _) = repo::require_job(&self.store, execution.job_id).await?;
        Self::check_tenant(principal, &job.tenant_id, &format!("execution {id}"))?;
        Ok(execution)
    }

    pub async fn list_executions(
        &self,
        principal: &Principal,
        job_id: Uuid,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Page<Execution>, CoreError> {
        // Existence and tenant check first; missing jobs 404.
        self.get_job(principal, job_id).await?;

        let limit = limit.clamp(1, MAX_PAGE);
        let mut query = QueryFilter::default().eq("job_id", job_id.to_string());
        if let Some(cursor) = cursor {
            query.after = Some(decode_cursor(cursor)?);
        }

        let docs = self
            .store
            .query(collections::EXECUTIONS, query, limit + 1)
            .await?;
        let mut executions: Vec<Execution> =
            docs.iter().map(|doc| doc.parse()).collect::<Result<_, _>>()?;

        let next_cursor = if executions.len() > limit {
            executions.truncate(limit);
            executions
                .last()
                .map(|e| encode_cursor(e.created_at, &e.id.to_string()))
        } else {
            None
        };
        Ok(Page {
            items: executions,
            next_cursor,
        })
    }

    pub async fn get_artifact(&self, principal: &Principal, id: Uuid) -> Result<Artifact, CoreError> {
        let artifact = repo::load_artifact(&self.store, id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("artifact {id}")))?;
        // Walk the forward references back to the owning tenant.
        let (execution, _) = repo::require_execution(&self.store, artifact.execution_id).await?;
        let (job, _) = repo::require_job(&self.store, execution.job_id).await?;
        Self::check_tenant(principal, &job.tenant_id, &format!("artifact {id}"))?;
        Ok(artifact)
    }

    /// Artifact metadata plus a byte stream of its body.
    pub async fn stream_artifact_body(
        &self,
        principal: &Principal,
        id: Uuid,
    ) -> Result<(Artifact, BlobBody), CoreError> {
        let artifact = self.get_artifact(principal, id).await?;
        let body = self.blobs.open_read(&artifact.storage_uri).await?;
        Ok((artifact, body))
    }
}
