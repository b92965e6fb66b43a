//! C2: job intake.
//!
//! Validates submitted drafts into typed [`JobSpec`]s, enforces tenant-scoped
//! idempotent submission via the config hash, persists the canonical record,
//! and hands the job to the scheduler through an in-process event channel.
//! A lost event only delays dispatch: the scheduler's recovery sweep picks up
//! stale `pending_dispatch` jobs.

use serde::Deserialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::bus::MessageBus;
use crate::clock::Clock;
use crate::error::CoreError;
use crate::execution::ExecutionState;
use crate::governor::Principal;
use crate::job::{JobKind, JobSpec, JobState, Parameters, Priority, RetryPolicy, Schedule, config_hash};
use crate::recorder::ExecutionRecorder;
use crate::repo;
use crate::store::{Expect, MetadataStore, QueryFilter, TxOp, collections, to_body};

/// Collection holding tenant dedup reservations (`{tenant}:{config_hash}` →
/// job id). Separate from `jobs` so listings stay clean.
const DEDUPE_INDEX: &str = "dedupe_index";

/// Client-authored draft, validated by `submit`.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitRequest {
    pub kind: JobKind,
    /// Raw kind-specific payload, checked against the kind's schema.
    pub parameters: serde_json::Value,
    #[serde(default = "default_schedule")]
    pub schedule: Schedule,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub ordering_key: Option<String>,
    /// Opt out of tenant-level deduplication.
    #[serde(default = "default_dedupe")]
    pub dedupe: bool,
}

fn default_schedule() -> Schedule {
    Schedule::Once
}

fn default_dedupe() -> bool {
    true
}

/// Notification handed to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntakeEvent {
    JobReady { job_id: Uuid },
    JobCancelled { job_id: Uuid },
}

#[derive(Clone)]
pub struct IntakeService<M, Q, C>
where
    M: MetadataStore,
    Q: MessageBus,
    C: Clock,
{
    store: M,
    bus: Q,
    clock: C,
    recorder: ExecutionRecorder<M, C>,
    events: mpsc::Sender<IntakeEvent>,
}

impl<M, Q, C> IntakeService<M, Q, C>
where
    M: MetadataStore,
    Q: MessageBus,
    C: Clock,
{
    pub fn new(
        store: M,
        bus: Q,
        clock: C,
        recorder: ExecutionRecorder<M, C>,
        events: mpsc::Sender<IntakeEvent>,
    ) -> Self {
        Self {
            store,
            bus,
            clock,
            recorder,
            events,
        }
    }

    /// Validate and persist a draft. Returns the existing job when the tenant
    /// already has a non-terminal job with an identical configuration.
    pub async fn submit(
        &self,
        tenant_id: &str,
        request: SubmitRequest,
    ) -> Result<JobSpec, CoreError> {
        let parameters = Parameters::from_raw(request.kind, request.parameters)?;
        request.schedule.validate()?;
        let retry_policy = request.retry_policy.unwrap_or_default();
        retry_policy.validate()?;

        let hash = config_hash(
            &parameters,
            &request.schedule,
            request.ordering_key.as_deref(),
        )?;

        let now = self.clock.now_utc();
        let job = JobSpec {
            id: Uuid::now_v7(),
            tenant_id: tenant_id.to_string(),
            parameters,
            schedule: request.schedule,
            retry_policy,
            priority: request.priority,
            ordering_key: request.ordering_key,
            state: JobState::PendingDispatch,
            config_hash: hash.clone(),
            dedupe: request.dedupe,
            created_at: now,
            updated_at: now,
            next_fire_at: None,
            cancel_requested: false,
            attempt_counter: 0,
        };

        if request.dedupe {
            if let Some(existing) = self.reserve_or_existing(tenant_id, &hash, &job).await? {
                tracing::debug!(job_id = %existing.id, "Idempotent submission hit");
                return Ok(existing);
            }
        } else {
            repo::save_job(&self.store, &job, Expect::Absent).await?;
        }

        tracing::info!(job_id = %job.id, %tenant_id, kind = %job.kind(), "Job accepted");
        if self
            .events
            .try_send(IntakeEvent::JobReady { job_id: job.id })
            .is_err()
        {
            // Scheduler backlog or not running; the recovery sweep will find
            // the pending_dispatch row.
            tracing::warn!(job_id = %job.id, "Intake event channel full, deferring to sweep");
        }
        Ok(job)
    }

    /// Claim the tenant's dedup slot for this config hash, or return the
    /// existing non-terminal job it points at.
    async fn reserve_or_existing(
        &self,
        tenant_id: &str,
        hash: &str,
        job: &JobSpec,
    ) -> Result<Option<JobSpec>, CoreError> {
        let slot_id = format!("{tenant_id}:{hash}");
        let reservation = serde_json::json!({ "job_id": job.id, "tenant_id": tenant_id });

        match self.store.get(DEDUPE_INDEX, &slot_id).await? {
            None => {
                let ops = vec![
                    TxOp::Put {
                        collection: DEDUPE_INDEX.into(),
                        id: slot_id.clone(),
                        body: reservation,
                        expect: Expect::Absent,
                    },
                    TxOp::Put {
                        collection: collections::JOBS.into(),
                        id: job.id.to_string(),
                        body: to_body(job)?,
                        expect: Expect::Absent,
                    },
                ];
                match self.store.transaction(ops).await {
                    Ok(()) => Ok(None),
                    // Lost the race; surface the winner.
                    Err(CoreError::Conflict(_)) => self.existing_from_slot(&slot_id).await,
                    Err(e) => Err(e),
                }
            }
            Some(slot) => {
                let holder: Uuid = slot.body["job_id"]
                    .as_str()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| {
                        CoreError::Internal(format!("malformed dedupe slot {slot_id}"))
                    })?;
                match repo::load_job(&self.store, holder).await? {
                    Some((existing, _)) if !existing.state.is_terminal() => Ok(Some(existing)),
                    // Holder finished or vanished; steal the slot for the new job.
                    _ => {
                        let ops = vec![
                            TxOp::Put {
                                collection: DEDUPE_INDEX.into(),
                                id: slot_id.clone(),
                                body: reservation,
                                expect: Expect::Version(slot.version),
                            },
                            TxOp::Put {
                                collection: collections::JOBS.into(),
                                id: job.id.to_string(),
                                body: to_body(job)?,
                                expect: Expect::Absent,
                            },
                        ];
                        match self.store.transaction(ops).await {
                            Ok(()) => Ok(None),
                            Err(CoreError::Conflict(_)) => self.existing_from_slot(&slot_id).await,
                            Err(e) => Err(e),
                        }
                    }
                }
            }
        }
    }

    async fn existing_from_slot(&self, slot_id: &str) -> Result<Option<JobSpec>, CoreError> {
        let slot = self
            .store
            .get(DEDUPE_INDEX, slot_id)
            .await?
            .ok_or_else(|| CoreError::Conflict("concurrent submission".into()))?;
        let holder: Uuid = slot.body["job_id"]
            .as_str()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| CoreError::Internal(format!("malformed dedupe slot {slot_id}")))?;
        match repo::load_job(&self.store, holder).await? {
            Some((job, _)) => Ok(Some(job)),
            // Winner vanished between the conflict and this read.
            None => Err(CoreError::Conflict(
                "concurrent submission, retry with the same payload".into(),
            )),
        }
    }

    /// Cancel a job: mark it cancelled, purge undispatched bus messages, and
    /// cancel executions that have not started running. In-flight executions
    /// observe `cancel_requested` through their lease renewer.
    pub async fn cancel(&self, principal: &Principal, job_id: Uuid) -> Result<(), CoreError> {
        let (mut job, version) = repo::require_job(&self.store, job_id).await?;
        if !principal.is_admin() && job.tenant_id != principal.tenant_id {
            // Tenant isolation: don't reveal other tenants' jobs.
            return Err(CoreError::NotFound(format!("job {job_id}")));
        }
        if job.state.is_terminal() {
            return Err(CoreError::Conflict(format!(
                "job {job_id} is already {}",
                job.state
            )));
        }

        job.state = JobState::Cancelled;
        job.cancel_requested = true;
        job.next_fire_at = None;
        job.updated_at = self.clock.now_utc();
        repo::save_job(&self.store, &job, Expect::Version(version)).await?;

        // Remove whatever has not been delivered yet and cancel its rows.
        let purged = self.bus.purge_job(job_id).await?;
        for request in &purged {
            self.recorder.cancel_execution(request.execution_id).await?;
        }

        // Rows waiting for redelivery have no pending message to purge.
        let waiting = self
            .store
            .query(
                collections::EXECUTIONS,
                QueryFilter::default()
                    .eq("job_id", job_id.to_string())
                    .eq("state", ExecutionState::AwaitingRetry.as_str()),
                100,
            )
            .await?;
        for doc in waiting {
            let execution: crate::execution::Execution = doc.parse()?;
            self.recorder.cancel_execution(execution.id).await?;
        }

        tracing::info!(%job_id, purged = purged.len(), "Job cancelled");
        let _ = self
            .events
            .try_send(IntakeEvent::JobCancelled { job_id });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::execution::Execution;
    use crate::governor::Role;
    use crate::memory_bus::{BusConfig, MemoryBus};
    use crate::testutil::{MemoryStore, make_test_job, scrape_request, seed_job};
    use chrono::{TimeZone, Utc};

    type TestIntake = IntakeService<MemoryStore, MemoryBus<ManualClock>, ManualClock>;

    fn setup() -> (
        TestIntake,
        MemoryStore,
        MemoryBus<ManualClock>,
        mpsc::Receiver<IntakeEvent>,
        ManualClock,
    ) {
        let clock = ManualClock::at(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
        let store = MemoryStore::new();
        let bus = MemoryBus::new(BusConfig::default(), clock.clone());
        let recorder = ExecutionRecorder::new(store.clone(), clock.clone());
        let (tx, rx) = mpsc::channel(16);
        let intake = IntakeService::new(store.clone(), bus.clone(), clock.clone(), recorder, tx);
        (intake, store, bus, rx, clock)
    }

    fn principal(tenant: &str, role: Role) -> Principal {
        Principal {
            key_id: "k".into(),
            tenant_id: tenant.into(),
            role,
        }
    }

    #[tokio::test]
    async fn submit_persists_and_emits_event() {
        let (intake, store, _bus, mut rx, _) = setup();
        let job = intake
            .submit("tenant-a", scrape_request("http://example.test/a"))
            .await
            .unwrap();

        assert_eq!(job.state, JobState::PendingDispatch);
        assert_eq!(job.kind(), JobKind::Scrape);
        assert_eq!(job.config_hash.len(), 64);

        let stored = repo::load_job(&store, job.id).await.unwrap().unwrap().0;
        assert_eq!(stored.id, job.id);

        assert_eq!(rx.recv().await, Some(IntakeEvent::JobReady { job_id: job.id }));
    }

    #[tokio::test]
    async fn submit_rejects_invalid_parameters() {
        let (intake, _, _, _, _) = setup();
        let mut request = scrape_request("not a url");
        let err = intake.submit("tenant-a", request.clone()).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidRequest(_)));

        // Wrong payload shape for the declared kind.
        request.kind = JobKind::Ocr;
        request.parameters = serde_json::json!({"url": "http://example.test"});
        let err = intake.submit("tenant-a", request).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn identical_submission_is_idempotent() {
        let (intake, _, _, _, _) = setup();
        let first = intake
            .submit("tenant-a", scrape_request("http://example.test/a"))
            .await
            .unwrap();
        let second = intake
            .submit("tenant-a", scrape_request("http://example.test/a"))
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn dedupe_is_tenant_scoped() {
        let (intake, _, _, _, _) = setup();
        let a = intake
            .submit("tenant-a", scrape_request("http://example.test/a"))
            .await
            .unwrap();
        let b = intake
            .submit("tenant-b", scrape_request("http://example.test/a"))
            .await
            .unwrap();
        assert_ne!(a.id, b.id);
    }

    #[tokio::test]
    async fn terminal_job_frees_the_dedupe_slot() {
        let (intake, store, _, _, clock) = setup();
        let first = intake
            .submit("tenant-a", scrape_request("http://example.test/a"))
            .await
            .unwrap();

        let (mut job, version) = repo::load_job(&store, first.id).await.unwrap().unwrap();
        job.state = JobState::Succeeded;
        job.updated_at = clock.now_utc();
        repo::save_job(&store, &job, Expect::Version(version)).await.unwrap();

        let second = intake
            .submit("tenant-a", scrape_request("http://example.test/a"))
            .await
            .unwrap();
        assert_ne!(first.id, second.id);
    }

    #[tokio::test]
    async fn dedupe_opt_out_creates_new_jobs() {
        let (intake, _, _, _, _) = setup();
        let mut request = scrape_request("http://example.test/a");
        request.dedupe = false;
        let first = intake.submit("tenant-a", request.clone()).await.unwrap();
        let second = intake.submit("tenant-a", request).await.unwrap();
        assert_ne!(first.id, second.id);
    }

    #[tokio::test]
    async fn cancel_purges_queue_and_cancels_rows() {
        let (intake, store, bus, _, clock) = setup();
        let recorder = ExecutionRecorder::new(store.clone(), clock.clone());

        let mut job = make_test_job("tenant-a");
        job.state = JobState::Active;
        let job = seed_job(&store, job).await;

        let execution = recorder.create_queued(&job).await.unwrap();
        bus.publish(crate::bus::ExecutionRequest {
            job_id: job.id,
            execution_id: execution.id,
            kind: job.kind(),
            tenant_id: job.tenant_id.clone(),
            priority: job.priority,
            ordering_key: None,
            max_attempts: 3,
            enqueued_at: clock.now_utc(),
        })
        .await
        .unwrap();

        intake
            .cancel(&principal("tenant-a", Role::Developer), job.id)
            .await
            .unwrap();

        let job = repo::load_job(&store, job.id).await.unwrap().unwrap().0;
        assert_eq!(job.state, JobState::Cancelled);
        assert!(job.cancel_requested);

        let row: Execution = repo::load_execution(&store, execution.id)
            .await
            .unwrap()
            .unwrap()
            .0;
        assert_eq!(row.state, ExecutionState::Cancelled);

        let depth = bus.depth(JobKind::Scrape).await.unwrap();
        assert_eq!(depth.pending, 0);
    }

    #[tokio::test]
    async fn cancel_requires_same_tenant() {
        let (intake, store, _, _, _) = setup();
        let job = seed_job(&store, make_test_job("tenant-a")).await;

        let err = intake
            .cancel(&principal("tenant-b", Role::Developer), job.id)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));

        // Admins may cancel across tenants.
        intake
            .cancel(&principal("tenant-b", Role::Admin), job.id)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn cancel_terminal_job_conflicts() {
        let (intake, store, _, _, _) = setup();
        let mut job = make_test_job("tenant-a");
        job.state = JobState::Succeeded;
        let job = seed_job(&store, job).await;

        let err = intake
            .cancel(&principal("tenant-a", Role::Developer), job.id)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));
    }
}
