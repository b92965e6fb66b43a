use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::CoreError;

/// Kind of work a job performs. One durable queue exists per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Scrape,
    Ocr,
}

impl JobKind {
    pub const ALL: [JobKind; 2] = [JobKind::Scrape, JobKind::Ocr];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Scrape => "scrape",
            JobKind::Ocr => "ocr",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "scrape" => Ok(JobKind::Scrape),
            "ocr" => Ok(JobKind::Ocr),
            other => Err(CoreError::InvalidRequest(format!(
                "unknown job kind: {other}"
            ))),
        }
    }
}

/// Dispatch priority band.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    /// Pull weight for the fairness scheduler (high : normal : low = 8:4:1).
    pub fn weight(&self) -> u32 {
        match self {
            Priority::High => 8,
            Priority::Normal => 4,
            Priority::Low => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What to do with cron firings missed during scheduler downtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MissedFiringPolicy {
    /// Advance to the next future firing, logging the gap.
    #[default]
    Skip,
    /// Emit one request per missed firing.
    CatchUp,
}

/// When a job's executions should be emitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Schedule {
    /// Enqueue immediately on intake.
    Once,
    /// Hold until `not_before`.
    Delayed { not_before: DateTime<Utc> },
    /// Fire on a cron expression until cancelled.
    Cron {
        expr: String,
        #[serde(default)]
        missed: MissedFiringPolicy,
    },
}

impl Schedule {
    /// Validate the schedule at intake time (cron expressions must parse).
    pub fn validate(&self) -> Result<(), CoreError> {
        if let Schedule::Cron { expr, .. } = self {
            cron::Schedule::from_str(expr).map_err(|e| {
                CoreError::InvalidRequest(format!("invalid cron expression '{expr}': {e}"))
            })?;
        }
        Ok(())
    }

    /// Next fire time strictly after `after`, if any.
    pub fn next_fire(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Once => Some(after),
            Schedule::Delayed { not_before } => {
                if *not_before > after {
                    Some(*not_before)
                } else {
                    Some(after)
                }
            }
            Schedule::Cron { expr, .. } => cron::Schedule::from_str(expr)
                .ok()?
                .after(&after)
                .next(),
        }
    }

    pub fn is_recurring(&self) -> bool {
        matches!(self, Schedule::Cron { .. })
    }
}

/// Exponential-backoff retry configuration.
///
/// Delay for attempt `n` (1-indexed) is
/// `min(initial_backoff × multiplier^(n-1), max_backoff)`, jittered ±20% at
/// requeue time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub multiplier: f64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 1_000,
            multiplier: 2.0,
            max_backoff_ms: 60_000,
        }
    }
}

impl RetryPolicy {
    pub const MAX_ATTEMPTS_CEILING: u32 = 10;

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.max_attempts == 0 {
            return Err(CoreError::InvalidRequest(
                "retry_policy.max_attempts must be at least 1".into(),
            ));
        }
        if self.max_attempts > Self::MAX_ATTEMPTS_CEILING {
            return Err(CoreError::InvalidRequest(format!(
                "retry_policy.max_attempts must not exceed {}",
                Self::MAX_ATTEMPTS_CEILING
            )));
        }
        if self.multiplier < 1.0 {
            return Err(CoreError::InvalidRequest(
                "retry_policy.multiplier must be >= 1.0".into(),
            ));
        }
        Ok(())
    }

    /// Base delay before re-delivering attempt `attempt + 1`, without jitter.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32);
        let raw = self.initial_backoff_ms as f64 * self.multiplier.powi(exp as i32);
        Duration::from_millis((raw as u64).min(self.max_backoff_ms))
    }
}

/// Apply ±20% jitter to a delay.
///
/// Seeded from the high-resolution clock via xorshift; this spreads
/// redeliveries, it is not randomness anyone should rely on.
pub fn jitter_pm20(delay: Duration) -> Duration {
    let base = delay.as_millis() as u64;
    if base == 0 {
        return delay;
    }
    let mut x = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
        | 1;
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    // Uniform in [-20%, +20%] of base.
    let span = base / 5;
    let offset = (x % (2 * span + 1)) as i64 - span as i64;
    Duration::from_millis(base.saturating_add_signed(offset))
}

/// Kind-specific payload, validated at the intake boundary into a typed value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Parameters {
    Scrape(ScrapeParameters),
    Ocr(OcrParameters),
}

impl Parameters {
    pub fn kind(&self) -> JobKind {
        match self {
            Parameters::Scrape(_) => JobKind::Scrape,
            Parameters::Ocr(_) => JobKind::Ocr,
        }
    }

    /// Parse and validate a raw payload against the declared kind.
    pub fn from_raw(kind: JobKind, raw: serde_json::Value) -> Result<Self, CoreError> {
        let params = match kind {
            JobKind::Scrape => Parameters::Scrape(
                serde_json::from_value::<ScrapeParameters>(raw)
                    .map_err(|e| CoreError::InvalidRequest(format!("scrape parameters: {e}")))?,
            ),
            JobKind::Ocr => Parameters::Ocr(
                serde_json::from_value::<OcrParameters>(raw)
                    .map_err(|e| CoreError::InvalidRequest(format!("ocr parameters: {e}")))?,
            ),
        };
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        match self {
            Parameters::Scrape(p) => p.validate(),
            Parameters::Ocr(p) => p.validate(),
        }
    }

    /// Caller-supplied per-job timeout, when present.
    pub fn timeout(&self) -> Option<Duration> {
        let secs = match self {
            Parameters::Scrape(p) => p.timeout_secs,
            Parameters::Ocr(p) => p.timeout_secs,
        };
        secs.map(Duration::from_secs)
    }
}

/// Payload for a web-scrape job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeParameters {
    /// Absolute http(s) URL to fetch.
    pub url: String,
    /// Extra request headers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl ScrapeParameters {
    pub fn validate(&self) -> Result<(), CoreError> {
        let url = url::Url::parse(&self.url)
            .map_err(|e| CoreError::InvalidRequest(format!("invalid url '{}': {e}", self.url)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(CoreError::InvalidRequest(format!(
                "unsupported url scheme '{}'",
                url.scheme()
            )));
        }
        Ok(())
    }
}

/// Payload for an OCR job over a PDF document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrParameters {
    /// Address of the source document (http(s) or blob uri).
    pub document_uri: String,
    /// ISO 639 language hint for the OCR engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dpi: Option<u32>,
    /// Page range expression, e.g. "1-5".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pages: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl OcrParameters {
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.document_uri.trim().is_empty() {
            return Err(CoreError::InvalidRequest(
                "document_uri must not be empty".into(),
            ));
        }
        if let Some(lang) = &self.language {
            if lang.len() < 2 || lang.len() > 8 || !lang.chars().all(|c| c.is_ascii_alphabetic()) {
                return Err(CoreError::InvalidRequest(format!(
                    "invalid language hint '{lang}'"
                )));
            }
        }
        if let Some(dpi) = self.dpi {
            if !(72..=1200).contains(&dpi) {
                return Err(CoreError::InvalidRequest(format!(
                    "dpi {dpi} out of range (72-1200)"
                )));
            }
        }
        Ok(())
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Persisted but not yet picked up by the scheduler.
    PendingDispatch,
    /// Owned by the scheduler; executions flow.
    Active,
    Succeeded,
    Failed,
    DeadLettered,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::DeadLettered | JobState::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::PendingDispatch => "pending_dispatch",
            JobState::Active => "active",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::DeadLettered => "dead_lettered",
            JobState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobState {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending_dispatch" => Ok(JobState::PendingDispatch),
            "active" => Ok(JobState::Active),
            "succeeded" => Ok(JobState::Succeeded),
            "failed" => Ok(JobState::Failed),
            "dead_lettered" => Ok(JobState::DeadLettered),
            "cancelled" => Ok(JobState::Cancelled),
            other => Err(CoreError::InvalidRequest(format!(
                "unknown job state: {other}"
            ))),
        }
    }
}

/// Immutable, client-authored description of work.
///
/// Created by intake, never mutated by clients; the scheduler owns
/// `next_fire_at` and the lifecycle fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub id: Uuid,
    pub tenant_id: String,
    pub parameters: Parameters,
    pub schedule: Schedule,
    pub retry_policy: RetryPolicy,
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ordering_key: Option<String>,
    pub state: JobState,
    /// Stable digest of (kind, parameters, schedule, ordering_key).
    pub config_hash: String,
    /// Whether this job participates in tenant-level deduplication.
    pub dedupe: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Next scheduler emission, maintained by the scheduler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_fire_at: Option<DateTime<Utc>>,
    /// Set by cancel; observed by in-flight workers.
    #[serde(default)]
    pub cancel_requested: bool,
    /// Attempt numbers handed out so far; the recorder increments this under
    /// the job document's version lock.
    #[serde(default)]
    pub attempt_counter: u32,
}

impl JobSpec {
    pub fn kind(&self) -> JobKind {
        self.parameters.kind()
    }

    /// Total execution deadline: explicit timeout capped by the per-kind
    /// ceiling supplied by the worker configuration.
    pub fn execution_timeout(&self, kind_ceiling: Duration) -> Duration {
        match self.parameters.timeout() {
            Some(explicit) => explicit.min(kind_ceiling),
            None => kind_ceiling,
        }
    }
}

/// Canonical JSON encoding: object keys sorted recursively, no whitespace.
fn canonicalize(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::Object(map) => {
            let sorted: BTreeMap<_, _> = map.iter().collect();
            out.push('{');
            for (i, (k, v)) in sorted.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(k).expect("string serializes"));
                out.push(':');
                canonicalize(v, out);
            }
            out.push('}');
        }
        serde_json::Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                canonicalize(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

/// Deterministic configuration digest used for idempotent submission.
pub fn config_hash(
    parameters: &Parameters,
    schedule: &Schedule,
    ordering_key: Option<&str>,
) -> Result<String, CoreError> {
    let value = serde_json::json!({
        "kind": parameters.kind().as_str(),
        "parameters": serde_json::to_value(parameters)?,
        "schedule": serde_json::to_value(schedule)?,
        "ordering_key": ordering_key,
    });
    let mut canonical = String::new();
    canonicalize(&value, &mut canonical);

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn scrape_params(url: &str) -> Parameters {
        Parameters::Scrape(ScrapeParameters {
            url: url.into(),
            headers: None,
            timeout_secs: None,
        })
    }

    #[test]
    fn kind_roundtrip() {
        for kind in JobKind::ALL {
            let parsed: JobKind = kind.as_str().parse().unwrap();
            assert_eq!(parsed, kind);
        }
        assert!("video".parse::<JobKind>().is_err());
    }

    #[test]
    fn priority_weights() {
        assert_eq!(Priority::High.weight(), 8);
        assert_eq!(Priority::Normal.weight(), 4);
        assert_eq!(Priority::Low.weight(), 1);
        assert!(Priority::High > Priority::Normal);
    }

    #[test]
    fn retry_backoff_schedule() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_backoff_ms: 1_000,
            multiplier: 2.0,
            max_backoff_ms: 10_000,
        };
        assert_eq!(policy.backoff_for_attempt(1), Duration::from_millis(1_000));
        assert_eq!(policy.backoff_for_attempt(2), Duration::from_millis(2_000));
        assert_eq!(policy.backoff_for_attempt(3), Duration::from_millis(4_000));
        // Capped.
        assert_eq!(policy.backoff_for_attempt(6), Duration::from_millis(10_000));
    }

    #[test]
    fn retry_policy_validation() {
        let mut policy = RetryPolicy::default();
        assert!(policy.validate().is_ok());

        policy.max_attempts = 0;
        assert!(policy.validate().is_err());

        policy.max_attempts = 99;
        assert!(policy.validate().is_err());

        policy = RetryPolicy {
            multiplier: 0.5,
            ..RetryPolicy::default()
        };
        assert!(policy.validate().is_err());
    }

    #[test]
    fn jitter_stays_within_band() {
        let base = Duration::from_millis(10_000);
        for _ in 0..100 {
            let jittered = jitter_pm20(base);
            assert!(jittered >= Duration::from_millis(8_000), "{jittered:?}");
            assert!(jittered <= Duration::from_millis(12_000), "{jittered:?}");
        }
    }

    #[test]
    fn scrape_parameters_reject_bad_urls() {
        assert!(scrape_params("http://example.test/a").validate().is_ok());
        assert!(scrape_params("not a url").validate().is_err());
        assert!(scrape_params("ftp://example.test/a").validate().is_err());
    }

    #[test]
    fn ocr_parameters_validation() {
        let mut params = OcrParameters {
            document_uri: "https://example.test/doc.pdf".into(),
            language: Some("en".into()),
            dpi: Some(300),
            pages: None,
            timeout_secs: None,
        };
        assert!(params.validate().is_ok());

        params.dpi = Some(10_000);
        assert!(params.validate().is_err());

        params.dpi = None;
        params.language = Some("x".into());
        assert!(params.validate().is_err());

        params.language = None;
        params.document_uri = "  ".into();
        assert!(params.validate().is_err());
    }

    #[test]
    fn parameters_from_raw_enforces_kind() {
        let raw = serde_json::json!({"url": "https://example.test"});
        let params = Parameters::from_raw(JobKind::Scrape, raw.clone()).unwrap();
        assert_eq!(params.kind(), JobKind::Scrape);

        // Scrape payload offered as OCR is rejected.
        assert!(Parameters::from_raw(JobKind::Ocr, raw).is_err());
    }

    #[test]
    fn cron_schedule_validation_and_next_fire() {
        let schedule = Schedule::Cron {
            expr: "0 * * * * *".into(),
            missed: MissedFiringPolicy::Skip,
        };
        assert!(schedule.validate().is_ok());

        let after = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 30).unwrap();
        let next = schedule.next_fire(after).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 1, 1, 0, 1, 0).unwrap());

        let bad = Schedule::Cron {
            expr: "not cron".into(),
            missed: MissedFiringPolicy::Skip,
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn delayed_schedule_honours_not_before() {
        let not_before = Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap();
        let schedule = Schedule::Delayed { not_before };

        let early = Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap();
        assert_eq!(schedule.next_fire(early), Some(not_before));

        let late = Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).unwrap();
        assert_eq!(schedule.next_fire(late), Some(late));
    }

    #[test]
    fn config_hash_is_deterministic_and_sensitive() {
        let params = scrape_params("https://example.test/a");
        let schedule = Schedule::Once;

        let h1 = config_hash(&params, &schedule, Some("k")).unwrap();
        let h2 = config_hash(&params, &schedule, Some("k")).unwrap();
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);

        let h3 = config_hash(&params, &schedule, None).unwrap();
        assert_ne!(h1, h3);

        let other = scrape_params("https://example.test/b");
        let h4 = config_hash(&other, &schedule, Some("k")).unwrap();
        assert_ne!(h1, h4);
    }

    #[test]
    fn execution_timeout_caps_at_kind_ceiling() {
        let mut job = crate::testutil::make_test_job("tenant-a");
        job.parameters = Parameters::Scrape(ScrapeParameters {
            url: "https://example.test".into(),
            headers: None,
            timeout_secs: Some(600),
        });
        assert_eq!(
            job.execution_timeout(Duration::from_secs(300)),
            Duration::from_secs(300)
        );

        job.parameters = Parameters::Scrape(ScrapeParameters {
            url: "https://example.test".into(),
            headers: None,
            timeout_secs: Some(30),
        });
        assert_eq!(
            job.execution_timeout(Duration::from_secs(300)),
            Duration::from_secs(30)
        );
    }
}
