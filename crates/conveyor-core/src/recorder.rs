//! C6: the execution recorder.
//!
//! Every write to executions and artifacts flows through here. Attempt
//! numbers are allocated atomically off the job document's counter; state
//! transitions follow the execution state graph and are persisted together
//! with their side effects (job lifecycle updates, DLQ index entries) in one
//! store transaction. Each document is mutated under its version CAS with a
//! bounded retry loop.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::artifact::Artifact;
use crate::clock::Clock;
use crate::error::CoreError;
use crate::execution::{ErrorKind, Execution, ExecutionState, Outcome};
use crate::job::{JobSpec, JobState};
use crate::repo;
use crate::store::{Expect, MetadataStore, TxOp, collections, to_body};

/// Attempts of the optimistic-lock retry loop before giving up.
const MAX_CAS_RETRIES: u32 = 5;

#[derive(Clone)]
pub struct ExecutionRecorder<M, C>
where
    M: MetadataStore,
    C: Clock,
{
    store: M,
    clock: C,
}

impl<M, C> ExecutionRecorder<M, C>
where
    M: MetadataStore,
    C: Clock,
{
    pub fn new(store: M, clock: C) -> Self {
        Self { store, clock }
    }

    pub async fn job(&self, id: Uuid) -> Result<JobSpec, CoreError> {
        Ok(repo::require_job(&self.store, id).await?.0)
    }

    pub async fn execution(&self, id: Uuid) -> Result<Execution, CoreError> {
        Ok(repo::require_execution(&self.store, id).await?.0)
    }

    /// Allocate the next attempt number off the job document (version CAS).
    async fn allocate_attempt(&self, job_id: Uuid) -> Result<u32, CoreError> {
        for _ in 0..MAX_CAS_RETRIES {
            let (mut job, version) = repo::require_job(&self.store, job_id).await?;
            job.attempt_counter += 1;
            job.updated_at = self.clock.now_utc();
            match repo::save_job(&self.store, &job, Expect::Version(version)).await {
                Ok(_) => return Ok(job.attempt_counter),
                Err(CoreError::Conflict(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(CoreError::Unavailable(format!(
            "attempt allocation for job {job_id} kept conflicting"
        )))
    }

    /// Create the execution row for a freshly published request
    /// (state `queued`, attempt allocated now).
    pub async fn create_queued(&self, job: &JobSpec) -> Result<Execution, CoreError> {
        let attempt = self.allocate_attempt(job.id).await?;
        let now = self.clock.now_utc();
        let execution = Execution {
            id: Uuid::now_v7(),
            job_id: job.id,
            attempt_number: attempt,
            state: ExecutionState::Queued,
            created_at: now,
            updated_at: now,
            dispatched_at: Some(now),
            started_at: None,
            finished_at: None,
            worker_id: None,
            outcome: None,
            error_kind: None,
            error_detail: None,
            produced_artifacts: Vec::new(),
        };
        repo::save_execution(&self.store, &execution, Expect::Absent).await?;
        Ok(execution)
    }

    /// Move a queued execution to `running`, claiming it for `worker_id`.
    ///
    /// A second concurrent claim loses the CAS or finds the row no longer
    /// queued and fails with `Conflict` (won-by-first semantics).
    pub async fn begin(&self, execution_id: Uuid, worker_id: &str) -> Result<Execution, CoreError> {
        let (mut execution, version) = repo::require_execution(&self.store, execution_id).await?;

        if execution.state != ExecutionState::Queued {
            return Err(CoreError::Conflict(format!(
                "execution {execution_id} is {}, not queued",
                execution.state
            )));
        }

        let now = self.clock.now_utc();
        execution.state = ExecutionState::Running;
        execution.started_at = Some(now);
        execution.updated_at = now;
        execution.worker_id = Some(worker_id.to_string());
        repo::save_execution(&self.store, &execution, Expect::Version(version)).await?;
        Ok(execution)
    }

    /// Start a new attempt for a redelivered message: allocates the next
    /// attempt number and creates the row directly in `running`. Prior
    /// attempts' rows are left as the record of those attempts.
    pub async fn begin_new_attempt(
        &self,
        job_id: Uuid,
        worker_id: &str,
    ) -> Result<Execution, CoreError> {
        let attempt = self.allocate_attempt(job_id).await?;
        let now = self.clock.now_utc();
        let execution = Execution {
            id: Uuid::now_v7(),
            job_id,
            attempt_number: attempt,
            state: ExecutionState::Running,
            created_at: now,
            updated_at: now,
            dispatched_at: Some(now),
            started_at: Some(now),
            finished_at: None,
            worker_id: Some(worker_id.to_string()),
            outcome: None,
            error_kind: None,
            error_detail: None,
            produced_artifacts: Vec::new(),
        };
        repo::save_execution(&self.store, &execution, Expect::Absent).await?;
        Ok(execution)
    }

    /// Record a terminal (or awaiting-retry) transition.
    ///
    /// Idempotent: a second call with the same outcome is a no-op; a
    /// conflicting outcome fails with `ConflictingFinish`. The execution
    /// write, the job lifecycle update, and the DLQ index entry commit in a
    /// single transaction.
    pub async fn finish(
        &self,
        execution_id: Uuid,
        outcome: Outcome,
        error: Option<(ErrorKind, String)>,
        attempts_exhausted: bool,
    ) -> Result<Execution, CoreError> {
        for _ in 0..MAX_CAS_RETRIES {
            let (mut execution, version) =
                repo::require_execution(&self.store, execution_id).await?;

            if execution.state.is_terminal() {
                if execution.outcome == Some(outcome) {
                    return Ok(execution);
                }
                return Err(CoreError::ConflictingFinish {
                    execution_id: execution_id.to_string(),
                    recorded: execution
                        .outcome
                        .map(|o| o.to_string())
                        .unwrap_or_else(|| execution.state.to_string()),
                });
            }

            let target = Execution::state_for_outcome(outcome, attempts_exhausted);
            if !execution.state.can_transition_to(target) {
                return Err(CoreError::Conflict(format!(
                    "illegal transition {} -> {target} for execution {execution_id}",
                    execution.state
                )));
            }

            let now = self.clock.now_utc();
            execution.state = target;
            execution.outcome = Some(outcome);
            execution.finished_at = Some(now);
            execution.updated_at = now;
            if let Some((kind, detail)) = &error {
                execution.error_kind = Some(*kind);
                execution.error_detail = Some(detail.clone());
            }

            let mut ops = vec![TxOp::Put {
                collection: collections::EXECUTIONS.into(),
                id: execution.id.to_string(),
                body: to_body(&execution)?,
                expect: Expect::Version(version),
            }];

            let (mut job, job_version) = repo::require_job(&self.store, execution.job_id).await?;
            if let Some(job_state) = job_transition_for(&job, target) {
                job.state = job_state;
                job.updated_at = now;
                if job_state.is_terminal() {
                    job.next_fire_at = None;
                }
                ops.push(TxOp::Put {
                    collection: collections::JOBS.into(),
                    id: job.id.to_string(),
                    body: to_body(&job)?,
                    expect: Expect::Version(job_version),
                });
            }

            if target == ExecutionState::DeadLettered {
                ops.push(TxOp::Put {
                    collection: collections::DLQ_INDEX.into(),
                    id: job.id.to_string(),
                    body: serde_json::json!({
                        "job_id": job.id,
                        "kind": job.kind().as_str(),
                        "execution_id": execution.id,
                        "created_at": now,
                    }),
                    expect: Expect::Any,
                });
            }

            match self.store.transaction(ops).await {
                Ok(()) => {
                    tracing::info!(
                        execution_id = %execution.id,
                        job_id = %execution.job_id,
                        attempt = execution.attempt_number,
                        state = %execution.state,
                        outcome = %outcome,
                        "Execution finished"
                    );
                    return Ok(execution);
                }
                Err(CoreError::Conflict(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(CoreError::Unavailable(format!(
            "finish for execution {execution_id} kept conflicting"
        )))
    }

    /// Append an artifact to a non-terminal execution. Forbidden after finish.
    pub async fn attach_artifact(
        &self,
        execution_id: Uuid,
        artifact: Artifact,
    ) -> Result<(), CoreError> {
        for _ in 0..MAX_CAS_RETRIES {
            let (mut execution, version) =
                repo::require_execution(&self.store, execution_id).await?;

            if execution.state.is_terminal() {
                return Err(CoreError::Conflict(format!(
                    "cannot attach artifact to finished execution {execution_id}"
                )));
            }
            if artifact.execution_id != execution_id {
                return Err(CoreError::InvalidRequest(
                    "artifact does not belong to this execution".into(),
                ));
            }

            execution.produced_artifacts.push(artifact.id);
            execution.updated_at = self.clock.now_utc();

            let ops = vec![
                TxOp::Put {
                    collection: collections::ARTIFACTS.into(),
                    id: artifact.id.to_string(),
                    body: to_body(&artifact)?,
                    expect: Expect::Absent,
                },
                TxOp::Put {
                    collection: collections::EXECUTIONS.into(),
                    id: execution.id.to_string(),
                    body: to_body(&execution)?,
                    expect: Expect::Version(version),
                },
            ];

            match self.store.transaction(ops).await {
                Ok(()) => return Ok(()),
                Err(CoreError::Conflict(msg)) if msg.contains("exists") => {
                    return Err(CoreError::Conflict(format!(
                        "artifact {} already attached",
                        artifact.id
                    )));
                }
                Err(CoreError::Conflict(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(CoreError::Unavailable(format!(
            "artifact attach for execution {execution_id} kept conflicting"
        )))
    }

    /// Cancel an execution that has not started running.
    /// Already-cancelled rows are a no-op.
    pub async fn cancel_execution(&self, execution_id: Uuid) -> Result<(), CoreError> {
        match self
            .finish(execution_id, Outcome::Cancelled, None, false)
            .await
        {
            Ok(_) => Ok(()),
            // Raced with a terminal transition; cancellation is best-effort.
            Err(CoreError::ConflictingFinish { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Bring a dead-lettered job back to life after an operator redrive:
    /// the job becomes `active` again and its DLQ index entry is dropped.
    pub async fn reactivate(&self, job_id: Uuid) -> Result<(), CoreError> {
        let (mut job, version) = repo::require_job(&self.store, job_id).await?;
        if job.state != JobState::DeadLettered {
            return Err(CoreError::Conflict(format!(
                "job {job_id} is {}, not dead_lettered",
                job.state
            )));
        }
        job.state = JobState::Active;
        job.updated_at = self.clock.now_utc();
        repo::save_job(&self.store, &job, Expect::Version(version)).await?;
        self.store
            .delete(collections::DLQ_INDEX, &job_id.to_string(), Expect::Any)
            .await?;
        tracing::info!(%job_id, "Job reactivated after redrive");
        Ok(())
    }

    /// Timestamp helper for callers composing artifacts.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now_utc()
    }
}

/// Job lifecycle consequence of an execution reaching `target`, if any.
fn job_transition_for(job: &JobSpec, target: ExecutionState) -> Option<JobState> {
    if job.state.is_terminal() {
        return None;
    }
    // Recurring jobs stay active through individual execution outcomes.
    if job.schedule.is_recurring() && target != ExecutionState::DeadLettered {
        return None;
    }
    match target {
        ExecutionState::Succeeded => Some(JobState::Succeeded),
        ExecutionState::Failed => Some(JobState::Failed),
        ExecutionState::DeadLettered => Some(JobState::DeadLettered),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::QueryFilter;
    use crate::testutil::{MemoryStore, make_test_job, seed_job};
    use chrono::TimeZone;

    fn recorder() -> (ExecutionRecorder<MemoryStore, ManualClock>, MemoryStore) {
        let clock = ManualClock::at(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
        let store = MemoryStore::new();
        (ExecutionRecorder::new(store.clone(), clock), store)
    }

    #[tokio::test]
    async fn attempt_numbers_are_contiguous() {
        let (recorder, store) = recorder();
        let job = seed_job(&store, make_test_job("tenant-a")).await;

        let e1 = recorder.create_queued(&job).await.unwrap();
        let e2 = recorder.begin_new_attempt(job.id, "w1").await.unwrap();
        let e3 = recorder.begin_new_attempt(job.id, "w2").await.unwrap();

        assert_eq!(e1.attempt_number, 1);
        assert_eq!(e2.attempt_number, 2);
        assert_eq!(e3.attempt_number, 3);
    }

    #[tokio::test]
    async fn begin_claims_queued_execution() {
        let (recorder, store) = recorder();
        let job = seed_job(&store, make_test_job("tenant-a")).await;

        let queued = recorder.create_queued(&job).await.unwrap();
        assert_eq!(queued.state, ExecutionState::Queued);
        assert!(queued.started_at.is_none());

        let running = recorder.begin(queued.id, "w1").await.unwrap();
        assert_eq!(running.state, ExecutionState::Running);
        assert_eq!(running.worker_id.as_deref(), Some("w1"));
        assert!(running.started_at.is_some());
    }

    #[tokio::test]
    async fn second_begin_loses_to_first() {
        let (recorder, store) = recorder();
        let job = seed_job(&store, make_test_job("tenant-a")).await;
        let queued = recorder.create_queued(&job).await.unwrap();

        recorder.begin(queued.id, "w1").await.unwrap();
        let err = recorder.begin(queued.id, "w2").await.unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn finish_success_updates_job_state() {
        let (recorder, store) = recorder();
        let job = seed_job(&store, make_test_job("tenant-a")).await;
        let queued = recorder.create_queued(&job).await.unwrap();
        recorder.begin(queued.id, "w1").await.unwrap();

        let finished = recorder
            .finish(queued.id, Outcome::Success, None, false)
            .await
            .unwrap();
        assert_eq!(finished.state, ExecutionState::Succeeded);
        assert!(finished.finished_at.is_some());

        let job = recorder.job(job.id).await.unwrap();
        assert_eq!(job.state, JobState::Succeeded);
    }

    #[tokio::test]
    async fn finish_is_idempotent_for_same_outcome() {
        let (recorder, store) = recorder();
        let job = seed_job(&store, make_test_job("tenant-a")).await;
        let queued = recorder.create_queued(&job).await.unwrap();
        recorder.begin(queued.id, "w1").await.unwrap();

        recorder
            .finish(queued.id, Outcome::Success, None, false)
            .await
            .unwrap();
        let again = recorder
            .finish(queued.id, Outcome::Success, None, false)
            .await
            .unwrap();
        assert_eq!(again.state, ExecutionState::Succeeded);
    }

    #[tokio::test]
    async fn conflicting_finish_is_rejected() {
        let (recorder, store) = recorder();
        let job = seed_job(&store, make_test_job("tenant-a")).await;
        let queued = recorder.create_queued(&job).await.unwrap();
        recorder.begin(queued.id, "w1").await.unwrap();

        recorder
            .finish(queued.id, Outcome::Success, None, false)
            .await
            .unwrap();
        let err = recorder
            .finish(
                queued.id,
                Outcome::TerminalFailure,
                Some((ErrorKind::Engine, "boom".into())),
                false,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::ConflictingFinish { .. }));
    }

    #[tokio::test]
    async fn retryable_failure_awaits_retry_then_dead_letters() {
        let (recorder, store) = recorder();
        let job = seed_job(&store, make_test_job("tenant-a")).await;

        let first = recorder.create_queued(&job).await.unwrap();
        recorder.begin(first.id, "w1").await.unwrap();
        let first = recorder
            .finish(
                first.id,
                Outcome::RetryableFailure,
                Some((ErrorKind::Network, "reset".into())),
                false,
            )
            .await
            .unwrap();
        assert_eq!(first.state, ExecutionState::AwaitingRetry);

        let second = recorder.begin_new_attempt(job.id, "w1").await.unwrap();
        let second = recorder
            .finish(
                second.id,
                Outcome::RetryableFailure,
                Some((ErrorKind::Network, "reset".into())),
                true,
            )
            .await
            .unwrap();
        assert_eq!(second.state, ExecutionState::DeadLettered);

        let job = recorder.job(job.id).await.unwrap();
        assert_eq!(job.state, JobState::DeadLettered);

        // DLQ index entry committed in the same transaction.
        let dlq = store
            .query(collections::DLQ_INDEX, QueryFilter::default(), 10)
            .await
            .unwrap();
        assert_eq!(dlq.len(), 1);
        assert_eq!(dlq[0].body["execution_id"], second.id.to_string());
    }

    #[tokio::test]
    async fn attach_artifact_before_finish_only() {
        let (recorder, store) = recorder();
        let job = seed_job(&store, make_test_job("tenant-a")).await;
        let queued = recorder.create_queued(&job).await.unwrap();
        let running = recorder.begin(queued.id, "w1").await.unwrap();

        let artifact = Artifact {
            id: Uuid::now_v7(),
            execution_id: running.id,
            storage_uri: "mem://a".into(),
            content_type: "text/html".into(),
            size_bytes: 12,
            sha256: "ab".repeat(32),
            metadata: Default::default(),
            created_at: recorder.now(),
        };
        recorder
            .attach_artifact(running.id, artifact.clone())
            .await
            .unwrap();

        let execution = recorder.execution(running.id).await.unwrap();
        assert_eq!(execution.produced_artifacts, vec![artifact.id]);

        recorder
            .finish(running.id, Outcome::Success, None, false)
            .await
            .unwrap();

        let late = Artifact {
            id: Uuid::now_v7(),
            ..artifact
        };
        let err = recorder.attach_artifact(running.id, late).await.unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn cancel_execution_tolerates_terminal_race() {
        let (recorder, store) = recorder();
        let job = seed_job(&store, make_test_job("tenant-a")).await;
        let queued = recorder.create_queued(&job).await.unwrap();

        recorder.cancel_execution(queued.id).await.unwrap();
        let execution = recorder.execution(queued.id).await.unwrap();
        assert_eq!(execution.state, ExecutionState::Cancelled);

        // Second cancel is a no-op; cancel after success is swallowed.
        recorder.cancel_execution(queued.id).await.unwrap();
    }

    #[tokio::test]
    async fn recurring_jobs_stay_active_after_success() {
        let (recorder, store) = recorder();
        let mut job = make_test_job("tenant-a");
        job.schedule = crate::job::Schedule::Cron {
            expr: "0 * * * * *".into(),
            missed: Default::default(),
        };
        job.state = JobState::Active;
        let job = seed_job(&store, job).await;

        let queued = recorder.create_queued(&job).await.unwrap();
        recorder.begin(queued.id, "w1").await.unwrap();
        recorder
            .finish(queued.id, Outcome::Success, None, false)
            .await
            .unwrap();

        let job = recorder.job(job.id).await.unwrap();
        assert_eq!(job.state, JobState::Active);
    }
}
