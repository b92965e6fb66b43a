//! Typed load/save helpers over the document store.
//!
//! Thin wrappers shared by intake, scheduler, recorder, and query. Transient
//! backend failures are retried here (three attempts, exponential backoff)
//! before surfacing as `Unavailable`; all CAS decisions stay with the
//! callers.

use uuid::Uuid;

use crate::artifact::Artifact;
use crate::error::CoreError;
use crate::execution::Execution;
use crate::job::JobSpec;
use crate::store::{Expect, MetadataStore, collections, to_body, with_backend_retry};

/// A typed document plus the version to CAS against.
pub(crate) type Versioned<T> = (T, u64);

pub(crate) async fn load_job<M: MetadataStore>(
    store: &M,
    id: Uuid,
) -> Result<Option<Versioned<JobSpec>>, CoreError> {
    let id = id.to_string();
    let doc = with_backend_retry("load job", || store.get(collections::JOBS, &id)).await?;
    match doc {
        Some(doc) => Ok(Some((doc.parse()?, doc.version))),
        None => Ok(None),
    }
}

pub(crate) async fn require_job<M: MetadataStore>(
    store: &M,
    id: Uuid,
) -> Result<Versioned<JobSpec>, CoreError> {
    load_job(store, id)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("job {id}")))
}

pub(crate) async fn save_job<M: MetadataStore>(
    store: &M,
    job: &JobSpec,
    expect: Expect,
) -> Result<u64, CoreError> {
    let id = job.id.to_string();
    let body = to_body(job)?;
    with_backend_retry("save job", || {
        store.put(collections::JOBS, &id, body.clone(), expect)
    })
    .await
}

pub(crate) async fn load_execution<M: MetadataStore>(
    store: &M,
    id: Uuid,
) -> Result<Option<Versioned<Execution>>, CoreError> {
    let id = id.to_string();
    let doc =
        with_backend_retry("load execution", || store.get(collections::EXECUTIONS, &id)).await?;
    match doc {
        Some(doc) => Ok(Some((doc.parse()?, doc.version))),
        None => Ok(None),
    }
}

pub(crate) async fn require_execution<M: MetadataStore>(
    store: &M,
    id: Uuid,
) -> Result<Versioned<Execution>, CoreError> {
    load_execution(store, id)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("execution {id}")))
}

pub(crate) async fn save_execution<M: MetadataStore>(
    store: &M,
    execution: &Execution,
    expect: Expect,
) -> Result<u64, CoreError> {
    let id = execution.id.to_string();
    let body = to_body(execution)?;
    with_backend_retry("save execution", || {
        store.put(collections::EXECUTIONS, &id, body.clone(), expect)
    })
    .await
}

pub(crate) async fn load_artifact<M: MetadataStore>(
    store: &M,
    id: Uuid,
) -> Result<Option<Artifact>, CoreError> {
    let id = id.to_string();
    let doc =
        with_backend_retry("load artifact", || store.get(collections::ARTIFACTS, &id)).await?;
    match doc {
        Some(doc) => Ok(Some(doc.parse()?)),
        None => Ok(None),
    }
}
