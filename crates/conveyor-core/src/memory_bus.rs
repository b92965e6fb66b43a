//! In-process implementation of the dispatch bus.
//!
//! Keeps the full [`MessageBus`] contract (per-key ordering, at-least-once
//! delivery with ack deadlines, weighted priority pull with anti-starvation,
//! dead-lettering, watermark flow control) behind a mutex-guarded state
//! machine. Lease expiry is handled lazily on pull, so no background timer
//! task is needed.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::bus::{DeliveredMessage, ExecutionRequest, MessageBus, QueueDepth};
use crate::clock::Clock;
use crate::error::CoreError;
use crate::job::{JobKind, Priority, jitter_pm20};

/// Tunables for the in-memory bus.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Outstanding (pending + in-flight) count above which publish fails.
    pub high_water: usize,
    /// Outstanding count at which a paused queue accepts publishes again.
    pub low_water: usize,
    /// Age past which a low-priority message is promoted to the front band.
    pub starvation_age: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            high_water: 10_000,
            low_water: 8_000,
            starvation_age: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone)]
struct QueuedMessage {
    request: ExecutionRequest,
    /// Deliveries so far; incremented when handed to a subscriber.
    delivery_count: u32,
    available_at: DateTime<Utc>,
    /// Publish-order sequence, global across queues.
    seq: u64,
}

#[derive(Debug)]
struct InFlight {
    msg: QueuedMessage,
    deadline: DateTime<Utc>,
}

/// Round-robin credits implementing the 8:4:1 pull weighting.
#[derive(Debug, Clone, Copy)]
struct Credits {
    high: u32,
    normal: u32,
    low: u32,
}

impl Credits {
    fn refill() -> Self {
        Self {
            high: Priority::High.weight(),
            normal: Priority::Normal.weight(),
            low: Priority::Low.weight(),
        }
    }

    fn take(&mut self, band: Priority) {
        let slot = match band {
            Priority::High => &mut self.high,
            Priority::Normal => &mut self.normal,
            Priority::Low => &mut self.low,
        };
        *slot = slot.saturating_sub(1);
        if self.high == 0 && self.normal == 0 && self.low == 0 {
            *self = Self::refill();
        }
    }

    fn remaining(&self, band: Priority) -> u32 {
        match band {
            Priority::High => self.high,
            Priority::Normal => self.normal,
            Priority::Low => self.low,
        }
    }
}

#[derive(Debug)]
struct QueueState {
    pending: Vec<QueuedMessage>,
    in_flight: HashMap<Uuid, InFlight>,
    dead: Vec<QueuedMessage>,
    paused: bool,
    credits: Credits,
}

impl QueueState {
    fn new() -> Self {
        Self {
            pending: Vec::new(),
            in_flight: HashMap::new(),
            dead: Vec::new(),
            paused: false,
            credits: Credits::refill(),
        }
    }

    fn outstanding(&self) -> usize {
        self.pending.len() + self.in_flight.len()
    }
}

struct Inner {
    queues: HashMap<JobKind, QueueState>,
    next_seq: u64,
}

impl Inner {
    fn queue(&mut self, kind: JobKind) -> &mut QueueState {
        self.queues.entry(kind).or_insert_with(QueueState::new)
    }
}

/// See module docs.
#[derive(Clone)]
pub struct MemoryBus<C: Clock> {
    inner: Arc<Mutex<Inner>>,
    config: BusConfig,
    clock: C,
}

impl<C: Clock> MemoryBus<C> {
    pub fn new(config: BusConfig, clock: C) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                queues: HashMap::new(),
                next_seq: 0,
            })),
            config,
            clock,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered bus state from poisoned mutex");
            poisoned.into_inner()
        })
    }

    /// Move expired leases back to pending, or to the DLQ when the delivery
    /// budget ran out while the lease was held.
    fn expire_leases(queue: &mut QueueState, now: DateTime<Utc>) {
        let expired: Vec<Uuid> = queue
            .in_flight
            .iter()
            .filter(|(_, f)| f.deadline <= now)
            .map(|(lease, _)| *lease)
            .collect();

        for lease in expired {
            let InFlight { mut msg, .. } = queue.in_flight.remove(&lease).expect("lease present");
            if msg.delivery_count >= msg.request.max_attempts {
                tracing::warn!(
                    job_id = %msg.request.job_id,
                    deliveries = msg.delivery_count,
                    "Lease expired with delivery budget exhausted, dead-lettering"
                );
                queue.dead.push(msg);
            } else {
                tracing::debug!(
                    job_id = %msg.request.job_id,
                    deliveries = msg.delivery_count,
                    "Lease expired, message redelivers"
                );
                msg.available_at = now;
                queue.pending.push(msg);
            }
        }
    }

    /// Ordering keys currently blocked by an in-flight message.
    fn blocked_keys(queue: &QueueState) -> HashSet<String> {
        queue
            .in_flight
            .values()
            .filter_map(|f| f.msg.request.ordering_key.clone())
            .collect()
    }

    fn effective_band(&self, msg: &QueuedMessage, now: DateTime<Utc>) -> Priority {
        if msg.request.priority == Priority::Low {
            let age = now - msg.request.enqueued_at;
            if age.to_std().unwrap_or_default() >= self.config.starvation_age {
                return Priority::High;
            }
        }
        msg.request.priority
    }

    /// Pick the index of the next deliverable pending message, honouring
    /// weighted bands and FIFO order within a band.
    fn select_next(
        &self,
        queue: &mut QueueState,
        blocked: &HashSet<String>,
        now: DateTime<Utc>,
    ) -> Option<usize> {
        // Only the earliest pending message per ordering key is eligible.
        let mut earliest_per_key: HashMap<&str, u64> = HashMap::new();
        for msg in &queue.pending {
            if let Some(key) = msg.request.ordering_key.as_deref() {
                let entry = earliest_per_key.entry(key).or_insert(msg.seq);
                if msg.seq < *entry {
                    *entry = msg.seq;
                }
            }
        }

        let eligible: Vec<(usize, Priority, u64)> = queue
            .pending
            .iter()
            .enumerate()
            .filter(|(_, msg)| msg.available_at <= now)
            .filter(|(_, msg)| match msg.request.ordering_key.as_deref() {
                Some(key) => !blocked.contains(key) && earliest_per_key[key] == msg.seq,
                None => true,
            })
            .map(|(i, msg)| (i, self.effective_band(msg, now), msg.seq))
            .collect();

        if eligible.is_empty() {
            return None;
        }

        // Prefer the highest band that still has credits and candidates;
        // fall back to the highest non-empty band.
        let mut chosen_band = None;
        for band in [Priority::High, Priority::Normal, Priority::Low] {
            let has_candidates = eligible.iter().any(|(_, b, _)| *b == band);
            if has_candidates && queue.credits.remaining(band) > 0 {
                chosen_band = Some(band);
                break;
            }
        }
        let band = chosen_band.unwrap_or_else(|| {
            [Priority::High, Priority::Normal, Priority::Low]
                .into_iter()
                .find(|band| eligible.iter().any(|(_, b, _)| b == band))
                .expect("eligible is non-empty")
        });

        queue.credits.take(band);

        eligible
            .into_iter()
            .filter(|(_, b, _)| *b == band)
            .min_by_key(|(_, _, seq)| *seq)
            .map(|(i, _, _)| i)
    }

    fn find_lease(inner: &mut Inner, lease: Uuid) -> Option<(JobKind, InFlight)> {
        let kind = *inner
            .queues
            .iter()
            .find(|(_, q)| q.in_flight.contains_key(&lease))?
            .0;
        let in_flight = inner.queue(kind).in_flight.remove(&lease)?;
        Some((kind, in_flight))
    }
}

impl<C: Clock> MessageBus for MemoryBus<C> {
    async fn publish(&self, request: ExecutionRequest) -> Result<(), CoreError> {
        let now = self.clock.now_utc();
        let mut inner = self.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;

        let kind = request.kind;
        let high_water = self.config.high_water;
        let low_water = self.config.low_water;
        let queue = inner.queue(kind);

        let outstanding = queue.outstanding();
        if queue.paused {
            if outstanding > low_water {
                return Err(CoreError::QueueFull {
                    kind: kind.as_str().into(),
                    outstanding,
                });
            }
            queue.paused = false;
        } else if outstanding >= high_water {
            queue.paused = true;
            tracing::warn!(%kind, outstanding, "Queue crossed high-water mark, pausing publishers");
            return Err(CoreError::QueueFull {
                kind: kind.as_str().into(),
                outstanding,
            });
        }

        queue.pending.push(QueuedMessage {
            request,
            delivery_count: 0,
            available_at: now,
            seq,
        });
        Ok(())
    }

    async fn pull(
        &self,
        subscriber_id: &str,
        kind: JobKind,
        max_batch: usize,
        ack_deadline: Duration,
    ) -> Result<Vec<DeliveredMessage>, CoreError> {
        let now = self.clock.now_utc();
        let deadline = now
            + chrono::Duration::from_std(ack_deadline)
                .map_err(|e| CoreError::Internal(format!("ack_deadline out of range: {e}")))?;

        let mut inner = self.lock();
        let queue = inner.queue(kind);
        Self::expire_leases(queue, now);

        let mut blocked = Self::blocked_keys(queue);
        let mut delivered = Vec::new();

        while delivered.len() < max_batch {
            let Some(index) = self.select_next(queue, &blocked, now) else {
                break;
            };
            let mut msg = queue.pending.swap_remove(index);
            msg.delivery_count += 1;

            if let Some(key) = msg.request.ordering_key.clone() {
                blocked.insert(key);
            }

            let lease = Uuid::new_v4();
            tracing::debug!(
                %subscriber_id,
                job_id = %msg.request.job_id,
                attempt = msg.delivery_count,
                "Delivering message"
            );
            delivered.push(DeliveredMessage {
                lease,
                request: msg.request.clone(),
                attempt: msg.delivery_count,
            });
            queue.in_flight.insert(lease, InFlight { msg, deadline });
        }

        Ok(delivered)
    }

    async fn ack(&self, lease: Uuid) -> Result<(), CoreError> {
        let mut inner = self.lock();
        Self::find_lease(&mut inner, lease)
            .map(|_| ())
            .ok_or_else(|| CoreError::NotFound(format!("lease {lease}")))
    }

    async fn nack(&self, lease: Uuid, requeue_delay: Duration) -> Result<(), CoreError> {
        let now = self.clock.now_utc();
        let mut inner = self.lock();
        let (kind, InFlight { mut msg, .. }) = Self::find_lease(&mut inner, lease)
            .ok_or_else(|| CoreError::NotFound(format!("lease {lease}")))?;

        let queue = inner.queue(kind);
        if msg.delivery_count >= msg.request.max_attempts {
            tracing::info!(
                job_id = %msg.request.job_id,
                deliveries = msg.delivery_count,
                "Delivery budget exhausted, routing to dead-letter queue"
            );
            queue.dead.push(msg);
        } else {
            let delay = jitter_pm20(requeue_delay);
            msg.available_at = now
                + chrono::Duration::from_std(delay)
                    .map_err(|e| CoreError::Internal(format!("requeue delay out of range: {e}")))?;
            queue.pending.push(msg);
        }
        Ok(())
    }

    async fn extend(&self, lease: Uuid, additional: Duration) -> Result<(), CoreError> {
        let mut inner = self.lock();
        let queue = inner
            .queues
            .values_mut()
            .find(|q| q.in_flight.contains_key(&lease))
            .ok_or_else(|| CoreError::NotFound(format!("lease {lease}")))?;
        let in_flight = queue.in_flight.get_mut(&lease).expect("lease present");
        in_flight.deadline += chrono::Duration::from_std(additional)
            .map_err(|e| CoreError::Internal(format!("extension out of range: {e}")))?;
        Ok(())
    }

    async fn purge_job(&self, job_id: Uuid) -> Result<Vec<ExecutionRequest>, CoreError> {
        let mut inner = self.lock();
        let mut purged = Vec::new();
        for queue in inner.queues.values_mut() {
            let mut kept = Vec::with_capacity(queue.pending.len());
            for msg in queue.pending.drain(..) {
                if msg.request.job_id == job_id {
                    purged.push(msg.request);
                } else {
                    kept.push(msg);
                }
            }
            queue.pending = kept;
        }
        Ok(purged)
    }

    async fn redrive(&self, kind: JobKind, job_ids: &[Uuid]) -> Result<usize, CoreError> {
        let now = self.clock.now_utc();
        let mut inner = self.lock();
        let seq_base = inner.next_seq;
        let queue = inner.queue(kind);

        let mut moved = 0;
        let mut kept = Vec::with_capacity(queue.dead.len());
        for mut msg in queue.dead.drain(..) {
            if job_ids.contains(&msg.request.job_id) {
                msg.delivery_count = 0;
                msg.available_at = now;
                msg.seq = seq_base + moved as u64;
                moved += 1;
                queue.pending.push(msg);
            } else {
                kept.push(msg);
            }
        }
        queue.dead = kept;
        inner.next_seq += moved as u64;
        Ok(moved)
    }

    async fn dead_letters(&self, kind: JobKind) -> Result<Vec<ExecutionRequest>, CoreError> {
        let mut inner = self.lock();
        let queue = inner.queue(kind);
        let mut dead: Vec<&QueuedMessage> = queue.dead.iter().collect();
        dead.sort_by_key(|m| m.seq);
        Ok(dead.into_iter().map(|m| m.request.clone()).collect())
    }

    async fn depth(&self, kind: JobKind) -> Result<QueueDepth, CoreError> {
        let mut inner = self.lock();
        let queue = inner.queue(kind);
        Ok(QueueDepth {
            pending: queue.pending.len(),
            in_flight: queue.in_flight.len(),
            dead_lettered: queue.dead.len(),
        })
    }
}
