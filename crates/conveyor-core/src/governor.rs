//! Identity validation and per-key rate limiting.
//!
//! Credentials resolve to a [`Principal`] through the injected
//! [`KeyValidator`]; each `(key, operation class)` pair is then charged
//! against a token bucket. Bucket state is process-local and periodically
//! broadcast to the `rate_buckets` collection so horizontally scaled
//! instances converge; exact global enforcement is not a goal.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::error::CoreError;
use crate::store::{Expect, MetadataStore, collections, to_body};

/// Access role attached to an API key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Developer,
    Analyst,
    Service,
}

/// Coarse operation classes used for both role gating and rate accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationClass {
    Submit,
    Cancel,
    Read,
    Admin,
}

impl OperationClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationClass::Submit => "submit",
            OperationClass::Cancel => "cancel",
            OperationClass::Read => "read",
            OperationClass::Admin => "admin",
        }
    }
}

impl Role {
    /// Role gate: admins do everything, analysts only read, developer and
    /// service keys manage their own jobs.
    pub fn allows(&self, op: OperationClass) -> bool {
        match self {
            Role::Admin => true,
            Role::Analyst => op == OperationClass::Read,
            Role::Developer | Role::Service => matches!(
                op,
                OperationClass::Submit | OperationClass::Cancel | OperationClass::Read
            ),
        }
    }
}

/// Resolved API key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyRecord {
    pub key_id: String,
    pub tenant_id: String,
    pub role: Role,
    /// Keys rotate on a schedule; past this instant the key is dead.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Authenticated caller identity attached to every request.
#[derive(Debug, Clone)]
pub struct Principal {
    pub key_id: String,
    pub tenant_id: String,
    pub role: Role,
}

impl Principal {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

/// External credential validation.
pub trait KeyValidator: Send + Sync + Clone {
    /// Resolve a bearer credential. `Ok(None)` means the key is unknown.
    fn validate(
        &self,
        credential: &str,
    ) -> impl Future<Output = Result<Option<KeyRecord>, CoreError>> + Send;
}

/// Token-bucket configuration.
#[derive(Debug, Clone)]
pub struct GovernorConfig {
    /// Burst capacity per (key, operation class).
    pub capacity: f64,
    /// Steady refill rate in tokens per second.
    pub refill_per_sec: f64,
    /// How often local bucket state is broadcast to the store.
    pub sync_interval: Duration,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            capacity: 20.0,
            refill_per_sec: 5.0,
            sync_interval: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Bucket {
    tokens: f64,
    last_refill: DateTime<Utc>,
}

/// C1: validates credentials and enforces per-key quotas.
#[derive(Clone)]
pub struct RateGovernor<M, V, C>
where
    M: MetadataStore,
    V: KeyValidator,
    C: Clock,
{
    store: M,
    validator: V,
    clock: C,
    config: GovernorConfig,
    instance_id: String,
    buckets: Arc<Mutex<HashMap<(String, OperationClass), Bucket>>>,
}

impl<M, V, C> RateGovernor<M, V, C>
where
    M: MetadataStore,
    V: KeyValidator,
    C: Clock,
{
    pub fn new(store: M, validator: V, clock: C, config: GovernorConfig) -> Self {
        Self {
            store,
            validator,
            clock,
            config,
            instance_id: format!("governor-{}", &uuid::Uuid::new_v4().to_string()[..8]),
            buckets: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Validate the credential, gate the operation by role, and charge the
    /// caller's token bucket.
    pub async fn authorize(
        &self,
        credential: &str,
        op: OperationClass,
    ) -> Result<Principal, CoreError> {
        let record = self
            .validator
            .validate(credential)
            .await?
            .ok_or_else(|| CoreError::Unauthenticated("unknown API key".into()))?;

        let now = self.clock.now_utc();
        if let Some(expires_at) = record.expires_at {
            if expires_at <= now {
                return Err(CoreError::Unauthenticated(format!(
                    "API key {} expired at {expires_at}",
                    record.key_id
                )));
            }
        }

        if !record.role.allows(op) {
            return Err(CoreError::Unauthorized(format!(
                "role {:?} may not perform {} operations",
                record.role,
                op.as_str()
            )));
        }

        self.charge(&record.key_id, op, now)?;

        Ok(Principal {
            key_id: record.key_id,
            tenant_id: record.tenant_id,
            role: record.role,
        })
    }

    fn charge(&self, key_id: &str, op: OperationClass, now: DateTime<Utc>) -> Result<(), CoreError> {
        let mut buckets = self.buckets.lock().unwrap_or_else(|p| p.into_inner());
        let bucket = buckets
            .entry((key_id.to_string(), op))
            .or_insert_with(|| Bucket {
                tokens: self.config.capacity,
                last_refill: now,
            });

        // Continuous refill since the last charge.
        let elapsed = (now - bucket.last_refill)
            .to_std()
            .unwrap_or_default()
            .as_secs_f64();
        bucket.tokens =
            (bucket.tokens + elapsed * self.config.refill_per_sec).min(self.config.capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - bucket.tokens;
            let retry_after_secs = (deficit / self.config.refill_per_sec).ceil().max(1.0) as u64;
            Err(CoreError::RateLimited { retry_after_secs })
        }
    }

    /// Write the local bucket snapshot to the store.
    pub async fn broadcast(&self) -> Result<(), CoreError> {
        let snapshot: Vec<((String, OperationClass), Bucket)> = {
            let buckets = self.buckets.lock().unwrap_or_else(|p| p.into_inner());
            buckets.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };

        for ((key_id, op), bucket) in snapshot {
            let doc_id = format!("{}:{}:{}", self.instance_id, key_id, op.as_str());
            let body = to_body(&serde_json::json!({
                "instance": self.instance_id,
                "key_id": key_id,
                "op": op.as_str(),
                "tokens": bucket.tokens,
                "last_refill": bucket.last_refill,
            }))?;
            self.store
                .put(collections::RATE_BUCKETS, &doc_id, body, Expect::Any)
                .await?;
        }
        Ok(())
    }

    /// Broadcast loop; runs until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                () = tokio::time::sleep(self.config.sync_interval) => {
                    if let Err(e) = self.broadcast().await {
                        tracing::warn!(error = %e, "Rate bucket broadcast failed");
                    }
                }
                () = cancel.cancelled() => break,
            }
        }
    }
}
