//! C3: the scheduler.
//!
//! Replicas coordinate through a renewable lease document; only the leader
//! converts jobs into execution requests. One-shot jobs dispatch on the
//! intake event, delayed jobs flush when their time arrives, cron jobs fire
//! on a per-second tick with `(priority desc, created_at asc, job_id asc)`
//! emission order. The recovery sweep re-enqueues stale `pending_dispatch`
//! jobs, reconciles dead-lettered messages whose worker died mid-attempt,
//! and applies the retention policy.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::bus::{ExecutionRequest, MessageBus};
use crate::clock::Clock;
use crate::error::CoreError;
use crate::execution::{ErrorKind, Execution, Outcome};
use crate::intake::IntakeEvent;
use crate::job::{JobKind, JobSpec, JobState, MissedFiringPolicy, Schedule};
use crate::recorder::ExecutionRecorder;
use crate::repo;
use crate::store::{BlobStore, Expect, MetadataStore, QueryFilter, collections};

/// Upper bound on cron firings emitted (or counted as skipped) per job per
/// tick, so a long outage cannot wedge the loop.
const MAX_FIRINGS_PER_TICK: u32 = 100;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub instance_id: String,
    /// Leader lease time-to-live.
    pub lease_ttl: Duration,
    /// Lease renewal cadence; must be well under `lease_ttl`.
    pub renew_interval: Duration,
    pub tick_interval: Duration,
    pub sweep_interval: Duration,
    /// Age at which a `pending_dispatch` job is considered stuck.
    pub pending_threshold: Duration,
    /// Artifacts older than this are deleted by the retention sweep.
    pub artifact_retention: Duration,
    /// Terminal executions older than this are deleted.
    pub execution_retention: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            instance_id: format!("scheduler-{}", &Uuid::new_v4().to_string()[..8]),
            lease_ttl: Duration::from_secs(15),
            renew_interval: Duration::from_secs(5),
            tick_interval: Duration::from_secs(1),
            sweep_interval: Duration::from_secs(60),
            pending_threshold: Duration::from_secs(15),
            artifact_retention: Duration::from_secs(90 * 24 * 3600),
            execution_retention: Duration::from_secs(30 * 24 * 3600),
        }
    }
}

#[derive(Clone)]
pub struct SchedulerService<M, Q, B, C>
where
    M: MetadataStore,
    Q: MessageBus,
    B: BlobStore,
    C: Clock,
{
    store: M,
    bus: Q,
    blobs: B,
    clock: C,
    recorder: ExecutionRecorder<M, C>,
    config: SchedulerConfig,
}

impl<M, Q, B, C> SchedulerService<M, Q, B, C>
where
    M: MetadataStore,
    Q: MessageBus,
    B: BlobStore,
    C: Clock,
{
    pub fn new(
        store: M,
        bus: Q,
        blobs: B,
        clock: C,
        recorder: ExecutionRecorder<M, C>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            bus,
            blobs,
            clock,
            recorder,
            config,
        }
    }

    /// Main loop; runs until cancelled. Only processes work while holding
    /// the leader lease.
    pub async fn run(&self, mut events: mpsc::Receiver<IntakeEvent>, cancel: CancellationToken) {
        let mut leader = self.try_acquire_lease().await.unwrap_or(false);
        if leader {
            tracing::info!(instance = %self.config.instance_id, "Scheduler is leader");
            if let Err(e) = self.sweep_once().await {
                tracing::warn!(error = %e, "Startup sweep failed");
            }
        }

        let mut renew = tokio::time::interval(self.config.renew_interval);
        let mut tick = tokio::time::interval(self.config.tick_interval);
        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        // The first interval tick fires immediately; consume it.
        renew.tick().await;
        tick.tick().await;
        sweep.tick().await;

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    if leader {
                        if let Err(e) = self.release_lease().await {
                            tracing::warn!(error = %e, "Lease release failed");
                        }
                    }
                    break;
                }
                _ = renew.tick() => {
                    let was_leader = leader;
                    leader = self.try_acquire_lease().await.unwrap_or(false);
                    if leader && !was_leader {
                        tracing::info!(instance = %self.config.instance_id, "Scheduler became leader");
                        if let Err(e) = self.sweep_once().await {
                            tracing::warn!(error = %e, "Takeover sweep failed");
                        }
                    } else if !leader && was_leader {
                        // Quiesce: stop acting until the lease comes back.
                        tracing::warn!(instance = %self.config.instance_id, "Scheduler lost the lease");
                    }
                }
                event = events.recv() => {
                    match event {
                        Some(IntakeEvent::JobReady { job_id }) if leader => {
                            if let Err(e) = self.handle_ready(job_id).await {
                                tracing::warn!(%job_id, error = %e, "Dispatch on intake failed");
                            }
                        }
                        Some(IntakeEvent::JobReady { job_id }) => {
                            tracing::debug!(%job_id, "Not leader, leaving job to the sweep");
                        }
                        Some(IntakeEvent::JobCancelled { .. }) => {}
                        None => break,
                    }
                }
                _ = tick.tick(), if leader => {
                    if let Err(e) = self.tick_once().await {
                        tracing::warn!(error = %e, "Scheduler tick failed");
                    }
                }
                _ = sweep.tick(), if leader => {
                    if let Err(e) = self.sweep_once().await {
                        tracing::warn!(error = %e, "Scheduler sweep failed");
                    }
                }
            }
        }
        tracing::info!(instance = %self.config.instance_id, "Scheduler stopped");
    }

    // -----------------------------------------------------------------------
    // Leader lease
    // -----------------------------------------------------------------------

    /// Acquire or renew the leader lease. Returns whether we hold it.
    pub async fn try_acquire_lease(&self) -> Result<bool, CoreError> {
        let now = self.clock.now_utc();
        let expires_at = now
            + chrono::Duration::from_std(self.config.lease_ttl)
                .map_err(|e| CoreError::Internal(format!("lease ttl out of range: {e}")))?;
        let body = serde_json::json!({
            "holder": self.config.instance_id,
            "expires_at": expires_at,
        });

        let current = self.store.get(collections::SCHEDULER_LEASE, "leader").await?;
        let expect = match &current {
            None => Expect::Absent,
            Some(doc) => {
                let holder = doc.body["holder"].as_str().unwrap_or_default();
                let lease_expiry: DateTime<Utc> =
                    serde_json::from_value(doc.body["expires_at"].clone()).unwrap_or(now);
                if holder != self.config.instance_id && lease_expiry > now {
                    return Ok(false);
                }
                Expect::Version(doc.version)
            }
        };

        match self
            .store
            .put(collections::SCHEDULER_LEASE, "leader", body, expect)
            .await
        {
            Ok(_) => Ok(true),
            Err(CoreError::Conflict(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn release_lease(&self) -> Result<(), CoreError> {
        if let Some(doc) = self.store.get(collections::SCHEDULER_LEASE, "leader").await? {
            if doc.body["holder"].as_str() == Some(self.config.instance_id.as_str()) {
                match self
                    .store
                    .delete(collections::SCHEDULER_LEASE, "leader", Expect::Version(doc.version))
                    .await
                {
                    Ok(()) | Err(CoreError::Conflict(_)) | Err(CoreError::NotFound(_)) => {}
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Activate a `pending_dispatch` job: one-shot jobs dispatch immediately,
    /// delayed and cron jobs get a `next_fire_at` for the tick loop.
    pub async fn handle_ready(&self, job_id: Uuid) -> Result<(), CoreError> {
        let Some((mut job, version)) = repo::load_job(&self.store, job_id).await? else {
            return Ok(());
        };
        if job.state != JobState::PendingDispatch {
            return Ok(());
        }

        let now = self.clock.now_utc();
        job.state = JobState::Active;
        job.updated_at = now;
        let dispatch_now = match &job.schedule {
            Schedule::Once => {
                job.next_fire_at = None;
                true
            }
            Schedule::Delayed { not_before } if *not_before <= now => {
                job.next_fire_at = None;
                true
            }
            Schedule::Delayed { not_before } => {
                job.next_fire_at = Some(*not_before);
                false
            }
            Schedule::Cron { .. } => {
                job.next_fire_at = job.schedule.next_fire(now);
                false
            }
        };
        repo::save_job(&self.store, &job, Expect::Version(version)).await?;

        if dispatch_now {
            if let Err(e) = self.dispatch_job(&job).await {
                // Put the job back so the recovery sweep retries it.
                let (mut fresh, v) = repo::require_job(&self.store, job.id).await?;
                fresh.state = JobState::PendingDispatch;
                fresh.updated_at = self.clock.now_utc();
                let _ = repo::save_job(&self.store, &fresh, Expect::Version(v)).await;
                return Err(e);
            }
        }
        Ok(())
    }

    /// Create the execution row and publish its request.
    async fn dispatch_job(&self, job: &JobSpec) -> Result<(), CoreError> {
        let execution = self.recorder.create_queued(job).await?;
        let request = ExecutionRequest {
            job_id: job.id,
            execution_id: execution.id,
            kind: job.kind(),
            tenant_id: job.tenant_id.clone(),
            priority: job.priority,
            ordering_key: job.ordering_key.clone(),
            max_attempts: job.retry_policy.max_attempts,
            enqueued_at: self.clock.now_utc(),
        };
        match self.bus.publish(request).await {
            Ok(()) => {
                tracing::debug!(job_id = %job.id, execution_id = %execution.id, "Dispatched");
                Ok(())
            }
            Err(e) => {
                // The row must not dangle without a message behind it.
                let _ = self.recorder.cancel_execution(execution.id).await;
                Err(e)
            }
        }
    }

    /// One scheduler tick: fire every active job whose `next_fire_at` has
    /// arrived, in `(priority desc, created_at asc, job_id asc)` order.
    pub async fn tick_once(&self) -> Result<(), CoreError> {
        let now = self.clock.now_utc();
        let active = self
            .store
            .query(
                collections::JOBS,
                QueryFilter::default().eq("state", JobState::Active.as_str()),
                1_000,
            )
            .await?;

        let mut due: Vec<JobSpec> = Vec::new();
        for doc in active {
            let job: JobSpec = doc.parse()?;
            if let Some(fire_at) = job.next_fire_at {
                if fire_at <= now && !job.cancel_requested {
                    due.push(job);
                }
            }
        }
        due.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });

        for job in due {
            if let Err(e) = self.fire_job(job, now).await {
                tracing::warn!(error = %e, "Firing job failed");
            }
        }
        Ok(())
    }

    async fn fire_job(&self, job: JobSpec, now: DateTime<Utc>) -> Result<(), CoreError> {
        match job.schedule.clone() {
            Schedule::Once | Schedule::Delayed { .. } => {
                self.dispatch_job(&job).await?;
                let (mut fresh, version) = repo::require_job(&self.store, job.id).await?;
                fresh.next_fire_at = None;
                fresh.updated_at = now;
                repo::save_job(&self.store, &fresh, Expect::Version(version)).await?;
            }
            Schedule::Cron { missed, .. } => {
                let first_due = job.next_fire_at.unwrap_or(now);
                let mut emitted = 0u32;
                let mut skipped = 0u32;
                let mut next = Some(first_due);

                match missed {
                    MissedFiringPolicy::CatchUp => {
                        while let Some(fire_at) = next {
                            if fire_at > now || emitted >= MAX_FIRINGS_PER_TICK {
                                break;
                            }
                            self.dispatch_job(&job).await?;
                            emitted += 1;
                            next = job.schedule.next_fire(fire_at);
                        }
                    }
                    MissedFiringPolicy::Skip => {
                        self.dispatch_job(&job).await?;
                        emitted = 1;
                        // Count what we are skipping, then jump past now.
                        let mut cursor = job.schedule.next_fire(first_due);
                        while let Some(fire_at) = cursor {
                            if fire_at > now || skipped >= MAX_FIRINGS_PER_TICK {
                                break;
                            }
                            skipped += 1;
                            cursor = job.schedule.next_fire(fire_at);
                        }
                        next = job.schedule.next_fire(now);
                    }
                }

                if skipped > 0 {
                    tracing::warn!(
                        job_id = %job.id,
                        skipped,
                        "Missed cron firings skipped after scheduler gap"
                    );
                }
                tracing::debug!(job_id = %job.id, emitted, "Cron fired");

                let (mut fresh, version) = repo::require_job(&self.store, job.id).await?;
                if !fresh.state.is_terminal() {
                    fresh.next_fire_at = next.or_else(|| fresh.schedule.next_fire(now));
                    fresh.updated_at = now;
                    repo::save_job(&self.store, &fresh, Expect::Version(version)).await?;
                }
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Sweeps
    // -----------------------------------------------------------------------

    /// Recovery, dead-letter reconciliation, and retention in one pass.
    pub async fn sweep_once(&self) -> Result<(), CoreError> {
        self.recover_pending().await?;
        self.reconcile_dead_letters().await?;
        self.apply_retention().await?;
        Ok(())
    }

    /// Re-enqueue `pending_dispatch` jobs whose intake event went missing.
    async fn recover_pending(&self) -> Result<(), CoreError> {
        let now = self.clock.now_utc();
        let threshold = chrono::Duration::from_std(self.config.pending_threshold)
            .map_err(|e| CoreError::Internal(format!("pending threshold out of range: {e}")))?;

        let pending = self
            .store
            .query(
                collections::JOBS,
                QueryFilter::default().eq("state", JobState::PendingDispatch.as_str()),
                1_000,
            )
            .await?;

        for doc in pending {
            let job: JobSpec = doc.parse()?;
            if now - job.updated_at >= threshold {
                tracing::info!(job_id = %job.id, "Recovering stuck pending_dispatch job");
                if let Err(e) = self.handle_ready(job.id).await {
                    tracing::warn!(job_id = %job.id, error = %e, "Recovery dispatch failed");
                }
            }
        }
        Ok(())
    }

    /// A worker that dies holding the final delivery leaves its execution
    /// `running` while the bus dead-letters the message. Close those rows.
    async fn reconcile_dead_letters(&self) -> Result<(), CoreError> {
        for kind in JobKind::ALL {
            for request in self.bus.dead_letters(kind).await? {
                let executions = self
                    .store
                    .query(
                        collections::EXECUTIONS,
                        QueryFilter::default().eq("job_id", request.job_id.to_string()),
                        1_000,
                    )
                    .await?;
                let latest = executions
                    .iter()
                    .filter_map(|doc| doc.parse::<Execution>().ok())
                    .max_by_key(|e| e.attempt_number);
                if let Some(latest) = latest {
                    if !latest.state.is_terminal() {
                        tracing::info!(
                            execution_id = %latest.id,
                            job_id = %request.job_id,
                            "Reconciling dead-lettered message"
                        );
                        let _ = self
                            .recorder
                            .finish(
                                latest.id,
                                Outcome::RetryableFailure,
                                Some((ErrorKind::Internal, "delivery budget exhausted".into())),
                                true,
                            )
                            .await;
                    }
                }
            }
        }
        Ok(())
    }

    /// Delete artifacts and terminal executions past their retention windows,
    /// blobs first.
    async fn apply_retention(&self) -> Result<(), CoreError> {
        let now = self.clock.now_utc();

        let artifact_cutoff = now
            - chrono::Duration::from_std(self.config.artifact_retention)
                .map_err(|e| CoreError::Internal(format!("retention out of range: {e}")))?;
        let expired = self
            .store
            .query(
                collections::ARTIFACTS,
                QueryFilter {
                    created_before: Some(artifact_cutoff),
                    ..QueryFilter::default()
                },
                500,
            )
            .await?;
        for doc in expired {
            let artifact: crate::artifact::Artifact = doc.parse()?;
            if let Err(e) = self.blobs.delete(&artifact.storage_uri).await {
                tracing::warn!(artifact_id = %artifact.id, error = %e, "Blob delete failed");
                continue;
            }
            self.store
                .delete(collections::ARTIFACTS, &artifact.id.to_string(), Expect::Any)
                .await?;
            tracing::debug!(artifact_id = %artifact.id, "Artifact expired");
        }

        let execution_cutoff = now
            - chrono::Duration::from_std(self.config.execution_retention)
                .map_err(|e| CoreError::Internal(format!("retention out of range: {e}")))?;
        let expired = self
            .store
            .query(
                collections::EXECUTIONS,
                QueryFilter {
                    created_before: Some(execution_cutoff),
                    ..QueryFilter::default()
                },
                500,
            )
            .await?;
        for doc in expired {
            let execution: Execution = doc.parse()?;
            if execution.state.is_terminal() {
                self.store
                    .delete(collections::EXECUTIONS, &execution.id.to_string(), Expect::Any)
                    .await?;
            }
        }
        Ok(())
    }
}
