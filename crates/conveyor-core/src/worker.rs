//! C5: the worker runtime.
//!
//! A worker runs a supervised pool of execution slots. Each slot pulls one
//! message, records the attempt, keeps the bus lease alive from a background
//! renewer (which also watches for job cancellation), invokes the matching
//! engine under the job's deadline, streams output to the blob store, and
//! maps the engine outcome onto the execution record and the message ack.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::artifact::{Artifact, blob_path};
use crate::bus::{DeliveredMessage, MessageBus};
use crate::clock::Clock;
use crate::error::CoreError;
use crate::execution::{ErrorKind, Execution, ExecutionState, Outcome};
use crate::handler::{EngineResult, OcrEngine, OutcomeHint, RunContext, Scraper};
use crate::job::{JobKind, JobSpec, Parameters};
use crate::recorder::ExecutionRecorder;
use crate::store::{BlobStore, MetadataStore};

/// Upload chunk size for artifact streaming.
const UPLOAD_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    /// Requested slot count; clamped by the resource budget.
    pub slots: usize,
    pub poll_interval: Duration,
    /// Bus lease duration per pull; renewed at a third of this.
    pub ack_deadline: Duration,
    /// How long in-flight work may run on after a termination signal.
    pub shutdown_grace: Duration,
    /// How long an engine gets to honour cancellation before the slot
    /// force-aborts.
    pub cancel_grace: Duration,
    pub scrape_ceiling: Duration,
    pub ocr_ceiling: Duration,
    /// Declared per-slot resource demand.
    pub slot_cpu_millis: u32,
    pub slot_memory_mb: u32,
    /// Local budget the slot pool must fit inside.
    pub budget_cpu_millis: u32,
    pub budget_memory_mb: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", &Uuid::new_v4().to_string()[..8]),
            slots: 4,
            poll_interval: Duration::from_secs(1),
            ack_deadline: Duration::from_secs(15),
            shutdown_grace: Duration::from_secs(60),
            cancel_grace: Duration::from_secs(5),
            scrape_ceiling: Duration::from_secs(120),
            ocr_ceiling: Duration::from_secs(300),
            slot_cpu_millis: 500,
            slot_memory_mb: 256,
            budget_cpu_millis: 4_000,
            budget_memory_mb: 2_048,
        }
    }
}

impl WorkerConfig {
    /// Slots the local budget actually permits.
    pub fn effective_slots(&self) -> usize {
        let by_cpu = (self.budget_cpu_millis / self.slot_cpu_millis.max(1)) as usize;
        let by_mem = (self.budget_memory_mb / self.slot_memory_mb.max(1)) as usize;
        self.slots.min(by_cpu).min(by_mem).max(1)
    }

    fn ceiling_for(&self, kind: JobKind) -> Duration {
        match kind {
            JobKind::Scrape => self.scrape_ceiling,
            JobKind::Ocr => self.ocr_ceiling,
        }
    }
}

/// Events emitted by the worker for monitoring/logging.
#[derive(Debug, Clone)]
pub enum WorkerEvent<'a> {
    Started { worker_id: &'a str, slots: usize },
    Polling { slot: usize },
    ExecutionStarted { execution_id: Uuid, attempt: u32 },
    ExecutionSucceeded { execution_id: Uuid, artifacts: usize },
    ExecutionFailed {
        execution_id: Uuid,
        error: &'a str,
        will_retry: bool,
    },
    ExecutionCancelled { execution_id: Uuid },
    DeadLettered { execution_id: Uuid },
    ShuttingDown { worker_id: &'a str },
    Stopped { worker_id: &'a str },
}

/// Trait for receiving worker events (decoupled logging).
pub trait WorkerReporter: Send + Sync {
    fn report(&self, event: WorkerEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingWorkerReporter;

impl WorkerReporter for TracingWorkerReporter {
    fn report(&self, event: WorkerEvent<'_>) {
        match event {
            WorkerEvent::Started { worker_id, slots } => {
                tracing::info!(%worker_id, slots, "Worker started");
            }
            WorkerEvent::Polling { slot } => {
                tracing::trace!(slot, "Polling for messages");
            }
            WorkerEvent::ExecutionStarted { execution_id, attempt } => {
                tracing::info!(%execution_id, attempt, "Executing");
            }
            WorkerEvent::ExecutionSucceeded {
                execution_id,
                artifacts,
            } => {
                tracing::info!(%execution_id, artifacts, "Execution succeeded");
            }
            WorkerEvent::ExecutionFailed {
                execution_id,
                error,
                will_retry,
            } => {
                tracing::warn!(%execution_id, %error, %will_retry, "Execution failed");
            }
            WorkerEvent::ExecutionCancelled { execution_id } => {
                tracing::info!(%execution_id, "Execution cancelled");
            }
            WorkerEvent::DeadLettered { execution_id } => {
                tracing::warn!(%execution_id, "Execution dead-lettered");
            }
            WorkerEvent::ShuttingDown { worker_id } => {
                tracing::info!(%worker_id, "Worker shutting down");
            }
            WorkerEvent::Stopped { worker_id } => {
                tracing::info!(%worker_id, "Worker stopped");
            }
        }
    }
}

/// How an engine invocation ended, before outcome mapping.
enum EngineEnd {
    Done(Result<EngineResult, CoreError>),
    TimedOut(u64),
    ForceAborted,
}

pub struct WorkerService<M, Q, B, S, O, C>
where
    M: MetadataStore,
    Q: MessageBus,
    B: BlobStore,
    S: Scraper,
    O: OcrEngine,
    C: Clock,
{
    recorder: ExecutionRecorder<M, C>,
    bus: Q,
    blobs: B,
    scraper: S,
    ocr: O,
    clock: C,
    config: WorkerConfig,
}

impl<M, Q, B, S, O, C> Clone for WorkerService<M, Q, B, S, O, C>
where
    M: MetadataStore,
    Q: MessageBus,
    B: BlobStore,
    S: Scraper,
    O: OcrEngine,
    C: Clock,
{
    fn clone(&self) -> Self {
        Self {
            recorder: self.recorder.clone(),
            bus: self.bus.clone(),
            blobs: self.blobs.clone(),
            scraper: self.scraper.clone(),
            ocr: self.ocr.clone(),
            clock: self.clock.clone(),
            config: self.config.clone(),
        }
    }
}

impl<M, Q, B, S, O, C> WorkerService<M, Q, B, S, O, C>
where
    M: MetadataStore + 'static,
    Q: MessageBus + 'static,
    B: BlobStore + 'static,
    S: Scraper + 'static,
    O: OcrEngine + 'static,
    C: Clock + 'static,
{
    pub fn new(
        recorder: ExecutionRecorder<M, C>,
        bus: Q,
        blobs: B,
        scraper: S,
        ocr: O,
        clock: C,
        config: WorkerConfig,
    ) -> Self {
        Self {
            recorder,
            bus,
            blobs,
            scraper,
            ocr,
            clock,
            config,
        }
    }

    /// Run the slot pool until cancellation, then drain gracefully.
    pub async fn run<WR: WorkerReporter + Clone + Send + 'static>(
        &self,
        cancel: CancellationToken,
        reporter: WR,
    ) -> Result<(), CoreError> {
        let slots = self.config.effective_slots();
        if slots < self.config.slots {
            tracing::warn!(
                requested = self.config.slots,
                granted = slots,
                "Slot count clamped by resource budget"
            );
        }
        reporter.report(WorkerEvent::Started {
            worker_id: &self.config.worker_id,
            slots,
        });

        // `stop_pulling` ends the pull loops; `abort` interrupts in-flight
        // engine calls once the shutdown grace is spent.
        let stop_pulling = cancel;
        let abort = CancellationToken::new();

        let mut handles = Vec::with_capacity(slots);
        for slot in 0..slots {
            let worker = self.clone();
            let reporter = reporter.clone();
            let stop = stop_pulling.clone();
            let abort = abort.clone();
            handles.push(tokio::spawn(async move {
                worker.slot_loop(slot, stop, abort, &reporter).await;
            }));
        }

        stop_pulling.cancelled().await;
        reporter.report(WorkerEvent::ShuttingDown {
            worker_id: &self.config.worker_id,
        });

        let drain = async {
            for handle in &mut handles {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(self.config.shutdown_grace, drain)
            .await
            .is_err()
        {
            tracing::warn!("Shutdown grace elapsed, aborting in-flight work");
            abort.cancel();
            for handle in handles {
                let _ = handle.await;
            }
        }

        reporter.report(WorkerEvent::Stopped {
            worker_id: &self.config.worker_id,
        });
        Ok(())
    }

    async fn slot_loop<WR: WorkerReporter>(
        &self,
        slot: usize,
        stop: CancellationToken,
        abort: CancellationToken,
        reporter: &WR,
    ) {
        loop {
            if stop.is_cancelled() {
                break;
            }
            reporter.report(WorkerEvent::Polling { slot });

            let mut claimed = None;
            for kind in JobKind::ALL {
                match self
                    .bus
                    .pull(&self.config.worker_id, kind, 1, self.config.ack_deadline)
                    .await
                {
                    Ok(mut batch) if !batch.is_empty() => {
                        claimed = Some(batch.remove(0));
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::error!(slot, error = %e, "Pull failed");
                    }
                }
            }

            match claimed {
                Some(delivery) => {
                    self.process_delivery(delivery, &abort, reporter).await;
                }
                None => {
                    tokio::select! {
                        () = tokio::time::sleep(self.config.poll_interval) => {}
                        () = stop.cancelled() => break,
                    }
                }
            }
        }
    }

    /// Handle one delivered message end to end. Public for tests.
    pub async fn process_delivery<WR: WorkerReporter>(
        &self,
        delivery: DeliveredMessage,
        abort: &CancellationToken,
        reporter: &WR,
    ) {
        let request = delivery.request.clone();

        let job = match self.recorder.job(request.job_id).await {
            Ok(job) => job,
            Err(CoreError::NotFound(_)) => {
                // The job vanished (retention or manual delete); drop the message.
                let _ = self.bus.ack(delivery.lease).await;
                return;
            }
            Err(e) => {
                tracing::error!(job_id = %request.job_id, error = %e, "Job load failed");
                let _ = self
                    .bus
                    .nack(delivery.lease, self.config.poll_interval)
                    .await;
                return;
            }
        };

        // Cancelled before we started: close the queued row and drop.
        if job.cancel_requested || job.state == crate::job::JobState::Cancelled {
            let _ = self.recorder.cancel_execution(request.execution_id).await;
            let _ = self.bus.ack(delivery.lease).await;
            return;
        }

        let execution = match self.claim_execution(&request).await {
            Ok(execution) => execution,
            Err(CoreError::Conflict(_)) => {
                // Another worker won the row; not ours to run.
                let _ = self.bus.ack(delivery.lease).await;
                return;
            }
            Err(e) => {
                tracing::error!(execution_id = %request.execution_id, error = %e, "Claim failed");
                let _ = self
                    .bus
                    .nack(delivery.lease, self.config.poll_interval)
                    .await;
                return;
            }
        };
        reporter.report(WorkerEvent::ExecutionStarted {
            execution_id: execution.id,
            attempt: execution.attempt_number,
        });

        let attempts_exhausted = delivery.attempt >= request.max_attempts;
        let timeout = job.execution_timeout(self.config.ceiling_for(request.kind));

        // Per-execution token: children of `abort` so a hard shutdown
        // interrupts the engine; also cancelled by the lease renewer when it
        // observes the job's cancellation flag.
        let exec_token = abort.child_token();
        let cancel_seen = Arc::new(AtomicBool::new(false));

        let renewer_stop = CancellationToken::new();
        let renewer = tokio::spawn(self.clone().renew_lease_loop(
            delivery.lease,
            request.job_id,
            exec_token.clone(),
            cancel_seen.clone(),
            renewer_stop.clone(),
        ));

        let ctx = RunContext {
            cancel: exec_token.clone(),
            deadline: self.clock.now_utc()
                + chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::seconds(300)),
        };

        let end = self.invoke_engine(&job, &ctx, timeout, &exec_token).await;

        renewer_stop.cancel();
        let _ = renewer.await;

        self.settle(
            &job,
            &execution,
            &delivery,
            end,
            attempts_exhausted,
            cancel_seen.load(Ordering::SeqCst),
            reporter,
        )
        .await;
    }

    /// Resolve the execution row for a delivery: first deliveries claim the
    /// queued row created at publish time; redeliveries start a fresh attempt.
    async fn claim_execution(&self, request: &crate::bus::ExecutionRequest) -> Result<Execution, CoreError> {
        match self.recorder.execution(request.execution_id).await {
            Ok(row) if row.state == ExecutionState::Queued => {
                self.recorder
                    .begin(request.execution_id, &self.config.worker_id)
                    .await
            }
            Ok(_) | Err(CoreError::NotFound(_)) => {
                self.recorder
                    .begin_new_attempt(request.job_id, &self.config.worker_id)
                    .await
            }
            Err(e) => Err(e),
        }
    }

    async fn invoke_engine(
        &self,
        job: &JobSpec,
        ctx: &RunContext,
        timeout: Duration,
        exec_token: &CancellationToken,
    ) -> EngineEnd {
        let engine = async {
            match &job.parameters {
                Parameters::Scrape(p) => self.scraper.run(p, ctx).await,
                Parameters::Ocr(p) => self.ocr.process(p, ctx).await,
            }
        };
        tokio::pin!(engine);

        tokio::select! {
            result = tokio::time::timeout(timeout, &mut engine) => match result {
                Ok(inner) => EngineEnd::Done(inner),
                Err(_) => EngineEnd::TimedOut(timeout.as_secs()),
            },
            () = exec_token.cancelled() => {
                // Cancellation is advisory; give the engine a bounded window
                // to come back on its own before force-aborting the slot.
                match tokio::time::timeout(self.config.cancel_grace, &mut engine).await {
                    Ok(inner) => EngineEnd::Done(inner),
                    Err(_) => EngineEnd::ForceAborted,
                }
            }
        }
    }

    /// Keep the bus lease ahead of the deadline and watch for cancellation.
    async fn renew_lease_loop(
        self,
        lease: Uuid,
        job_id: Uuid,
        exec_token: CancellationToken,
        cancel_seen: Arc<AtomicBool>,
        stop: CancellationToken,
    ) {
        let interval = self.config.ack_deadline / 3;
        loop {
            tokio::select! {
                () = tokio::time::sleep(interval) => {}
                () = stop.cancelled() => break,
            }

            if let Err(e) = self.bus.extend(lease, interval).await {
                tracing::debug!(%lease, error = %e, "Lease extension failed");
                break;
            }

            match self.recorder.job(job_id).await {
                Ok(job) if job.cancel_requested => {
                    cancel_seen.store(true, Ordering::SeqCst);
                    exec_token.cancel();
                }
                Ok(_) => {}
                Err(e) => tracing::debug!(%job_id, error = %e, "Cancellation check failed"),
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn settle<WR: WorkerReporter>(
        &self,
        job: &JobSpec,
        execution: &Execution,
        delivery: &DeliveredMessage,
        end: EngineEnd,
        attempts_exhausted: bool,
        cancel_seen: bool,
        reporter: &WR,
    ) {
        // Cancellation wins over whatever the engine managed to return.
        if cancel_seen {
            reporter.report(WorkerEvent::ExecutionCancelled {
                execution_id: execution.id,
            });
            self.record_finish(
                execution.id,
                Outcome::Cancelled,
                Some((ErrorKind::Cancelled, "cancelled by request".into())),
                false,
            )
            .await;
            let _ = self.bus.ack(delivery.lease).await;
            return;
        }

        match end {
            EngineEnd::Done(Ok(result)) => match result.hint {
                OutcomeHint::Ok => {
                    match self.persist_artifacts(job, execution, result).await {
                        Ok(count) => {
                            // Artifacts are visible before the terminal state.
                            if self
                                .record_finish(execution.id, Outcome::Success, None, false)
                                .await
                            {
                                reporter.report(WorkerEvent::ExecutionSucceeded {
                                    execution_id: execution.id,
                                    artifacts: count,
                                });
                            }
                            let _ = self.bus.ack(delivery.lease).await;
                        }
                        Err(e) => {
                            self.fail_retryable(
                                execution,
                                delivery,
                                ErrorKind::Storage,
                                e.to_string(),
                                attempts_exhausted,
                                reporter,
                            )
                            .await;
                        }
                    }
                }
                OutcomeHint::Retryable { kind, detail } => {
                    self.fail_retryable(
                        execution,
                        delivery,
                        kind,
                        detail,
                        attempts_exhausted,
                        reporter,
                    )
                    .await;
                }
                OutcomeHint::Terminal { kind, detail } => {
                    reporter.report(WorkerEvent::ExecutionFailed {
                        execution_id: execution.id,
                        error: &detail,
                        will_retry: false,
                    });
                    self.record_finish(
                        execution.id,
                        Outcome::TerminalFailure,
                        Some((kind, detail)),
                        false,
                    )
                    .await;
                    let _ = self.bus.ack(delivery.lease).await;
                }
            },
            EngineEnd::Done(Err(e)) => {
                // With the job-cancel case handled above, a cancelled engine
                // means the worker is shutting down: hand the attempt back.
                if matches!(e, CoreError::Cancelled(_)) || e.is_retryable() {
                    self.fail_retryable(
                        execution,
                        delivery,
                        ErrorKind::Internal,
                        e.to_string(),
                        attempts_exhausted,
                        reporter,
                    )
                    .await;
                } else {
                    let detail = e.to_string();
                    reporter.report(WorkerEvent::ExecutionFailed {
                        execution_id: execution.id,
                        error: &detail,
                        will_retry: false,
                    });
                    self.record_finish(
                        execution.id,
                        Outcome::TerminalFailure,
                        Some((ErrorKind::Engine, detail)),
                        false,
                    )
                    .await;
                    let _ = self.bus.ack(delivery.lease).await;
                }
            }
            EngineEnd::TimedOut(secs) => {
                self.fail_retryable(
                    execution,
                    delivery,
                    ErrorKind::Timeout,
                    format!("execution exceeded {secs}s deadline"),
                    attempts_exhausted,
                    reporter,
                )
                .await;
            }
            EngineEnd::ForceAborted => {
                // Shutdown abort: give the attempt back promptly.
                self.fail_retryable(
                    execution,
                    delivery,
                    ErrorKind::Internal,
                    "worker shutting down".into(),
                    attempts_exhausted,
                    reporter,
                )
                .await;
            }
        }
    }

    async fn fail_retryable<WR: WorkerReporter>(
        &self,
        execution: &Execution,
        delivery: &DeliveredMessage,
        kind: ErrorKind,
        detail: String,
        attempts_exhausted: bool,
        reporter: &WR,
    ) {
        reporter.report(WorkerEvent::ExecutionFailed {
            execution_id: execution.id,
            error: &detail,
            will_retry: !attempts_exhausted,
        });
        if attempts_exhausted {
            reporter.report(WorkerEvent::DeadLettered {
                execution_id: execution.id,
            });
        }

        self.record_finish(
            execution.id,
            Outcome::RetryableFailure,
            Some((kind, detail)),
            attempts_exhausted,
        )
        .await;

        let job = self.recorder.job(execution.job_id).await.ok();
        let delay = job
            .map(|j| j.retry_policy.backoff_for_attempt(delivery.attempt))
            .unwrap_or(Duration::from_secs(1));
        if let Err(e) = self.bus.nack(delivery.lease, delay).await {
            tracing::warn!(lease = %delivery.lease, error = %e, "Nack failed");
        }
    }

    /// Returns false when the record could not be written (already logged).
    async fn record_finish(
        &self,
        execution_id: Uuid,
        outcome: Outcome,
        error: Option<(ErrorKind, String)>,
        attempts_exhausted: bool,
    ) -> bool {
        match self
            .recorder
            .finish(execution_id, outcome, error, attempts_exhausted)
            .await
        {
            Ok(_) => true,
            Err(e) => {
                tracing::error!(%execution_id, error = %e, "Recording finish failed");
                false
            }
        }
    }

    /// Stream the engine's blobs into storage and attach artifact records.
    async fn persist_artifacts(
        &self,
        job: &JobSpec,
        execution: &Execution,
        result: EngineResult,
    ) -> Result<usize, CoreError> {
        let count = result.artifacts.len();
        for engine_artifact in result.artifacts {
            let artifact_id = Uuid::now_v7();
            let now = self.clock.now_utc();
            let path = blob_path(&job.tenant_id, job.kind(), now, artifact_id);

            let handle = self.blobs.start_upload(&path).await?;
            for chunk in engine_artifact.payload.chunks(UPLOAD_CHUNK) {
                self.blobs
                    .write_chunk(&handle, Bytes::copy_from_slice(chunk))
                    .await?;
            }
            let finished = self.blobs.finish_upload(&handle).await?;

            let artifact = Artifact {
                id: artifact_id,
                execution_id: execution.id,
                storage_uri: finished.uri,
                content_type: engine_artifact.content_type,
                size_bytes: finished.size_bytes,
                sha256: finished.sha256,
                metadata: engine_artifact.metadata,
                created_at: now,
            };
            self.recorder.attach_artifact(execution.id, artifact).await?;
        }
        Ok(count)
    }
}
