use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;
use crate::job::{JobKind, Priority};

/// A dispatch order for one execution attempt, published by the scheduler and
/// pulled by workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub job_id: Uuid,
    /// Execution row created at publish time (state `queued`).
    pub execution_id: Uuid,
    pub kind: JobKind,
    pub tenant_id: String,
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ordering_key: Option<String>,
    /// Delivery budget before dead-lettering, from the job's retry policy.
    pub max_attempts: u32,
    pub enqueued_at: DateTime<Utc>,
}

/// A message handed to a subscriber, leased until `ack_deadline`.
#[derive(Debug, Clone)]
pub struct DeliveredMessage {
    /// Lease handle for ack/nack/extend.
    pub lease: Uuid,
    pub request: ExecutionRequest,
    /// 1-indexed delivery count for this message (resets on redrive).
    pub attempt: u32,
}

/// Queue depth snapshot for the status surface.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct QueueDepth {
    pub pending: usize,
    pub in_flight: usize,
    pub dead_lettered: usize,
}

/// Typed durable work queues with ordered delivery, at-least-once semantics,
/// ack deadlines, and dead-letter routing.
///
/// One logical queue exists per [`JobKind`]. Messages sharing an
/// `ordering_key` are delivered in publish order to one subscriber at a time;
/// a message blocks its key until acked or dead-lettered.
pub trait MessageBus: Send + Sync + Clone {
    /// Durably enqueue a request. Fails with `QueueFull` past the high-water
    /// mark until the queue drains below the low-water mark.
    fn publish(
        &self,
        request: ExecutionRequest,
    ) -> impl Future<Output = Result<(), CoreError>> + Send;

    /// Pull up to `max_batch` messages. Each carries a lease that must be
    /// acked, nacked, or extended before `ack_deadline` elapses, else the
    /// message is redelivered.
    fn pull(
        &self,
        subscriber_id: &str,
        kind: JobKind,
        max_batch: usize,
        ack_deadline: Duration,
    ) -> impl Future<Output = Result<Vec<DeliveredMessage>, CoreError>> + Send;

    fn ack(&self, lease: Uuid) -> impl Future<Output = Result<(), CoreError>> + Send;

    /// Return the message for redelivery after `requeue_delay` (jittered ±20%
    /// by the bus). Routes to the DLQ instead when the delivery budget is
    /// exhausted.
    fn nack(
        &self,
        lease: Uuid,
        requeue_delay: Duration,
    ) -> impl Future<Output = Result<(), CoreError>> + Send;

    fn extend(
        &self,
        lease: Uuid,
        additional: Duration,
    ) -> impl Future<Output = Result<(), CoreError>> + Send;

    /// Best-effort removal of not-yet-delivered messages for a job.
    /// Returns the removed requests so queued executions can be cancelled.
    fn purge_job(
        &self,
        job_id: Uuid,
    ) -> impl Future<Output = Result<Vec<ExecutionRequest>, CoreError>> + Send;

    /// Operator action: move the given jobs' dead-lettered messages back onto
    /// the main queue with a fresh delivery budget. Returns how many moved.
    fn redrive(
        &self,
        kind: JobKind,
        job_ids: &[Uuid],
    ) -> impl Future<Output = Result<usize, CoreError>> + Send;

    /// Dead-lettered requests for a kind, oldest first.
    fn dead_letters(
        &self,
        kind: JobKind,
    ) -> impl Future<Output = Result<Vec<ExecutionRequest>, CoreError>> + Send;

    fn depth(&self, kind: JobKind) -> impl Future<Output = Result<QueueDepth, CoreError>> + Send;
}
