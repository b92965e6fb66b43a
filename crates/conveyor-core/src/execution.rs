use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;

/// State of one execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Pending,
    Queued,
    Running,
    Succeeded,
    Failed,
    AwaitingRetry,
    DeadLettered,
    Cancelled,
}

impl ExecutionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionState::Succeeded
                | ExecutionState::Failed
                | ExecutionState::DeadLettered
                | ExecutionState::Cancelled
        )
    }

    /// Whether the state graph permits `self → to`.
    ///
    /// Self-transitions are rejected here; the recorder treats a repeated
    /// identical finish as an idempotent no-op before consulting the graph.
    pub fn can_transition_to(&self, to: ExecutionState) -> bool {
        use ExecutionState::*;
        matches!(
            (self, to),
            (Pending, Queued)
                | (Pending, Cancelled)
                | (Queued, Running)
                | (Queued, Cancelled)
                | (Queued, DeadLettered)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, AwaitingRetry)
                | (Running, DeadLettered)
                | (Running, Cancelled)
                | (AwaitingRetry, Queued)
                | (AwaitingRetry, DeadLettered)
                | (AwaitingRetry, Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionState::Pending => "pending",
            ExecutionState::Queued => "queued",
            ExecutionState::Running => "running",
            ExecutionState::Succeeded => "succeeded",
            ExecutionState::Failed => "failed",
            ExecutionState::AwaitingRetry => "awaiting_retry",
            ExecutionState::DeadLettered => "dead_lettered",
            ExecutionState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ExecutionState {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ExecutionState::Pending),
            "queued" => Ok(ExecutionState::Queued),
            "running" => Ok(ExecutionState::Running),
            "succeeded" => Ok(ExecutionState::Succeeded),
            "failed" => Ok(ExecutionState::Failed),
            "awaiting_retry" => Ok(ExecutionState::AwaitingRetry),
            "dead_lettered" => Ok(ExecutionState::DeadLettered),
            "cancelled" => Ok(ExecutionState::Cancelled),
            other => Err(CoreError::InvalidRequest(format!(
                "unknown execution state: {other}"
            ))),
        }
    }
}

/// Final disposition of an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    RetryableFailure,
    TerminalFailure,
    Cancelled,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::RetryableFailure => "retryable_failure",
            Outcome::TerminalFailure => "terminal_failure",
            Outcome::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Coarse classification of an execution error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Connection-level failure reaching the source.
    Network,
    /// Non-success HTTP status from the source.
    UpstreamStatus,
    Timeout,
    /// The source rejected our credentials.
    SourceAuthorization,
    /// Input failed validation at execution time.
    Validation,
    /// The engine could not process the document/page.
    Engine,
    /// Metadata or blob store failure mid-execution.
    Storage,
    Cancelled,
    Internal,
}

/// One attempted run of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub job_id: Uuid,
    /// 1-indexed; values for a job form a contiguous prefix of ℕ.
    pub attempt_number: u32,
    pub state: ExecutionState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dispatched_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    #[serde(default)]
    pub produced_artifacts: Vec<Uuid>,
}

impl Execution {
    /// Expected terminal state for an outcome.
    pub fn state_for_outcome(outcome: Outcome, attempts_exhausted: bool) -> ExecutionState {
        match outcome {
            Outcome::Success => ExecutionState::Succeeded,
            Outcome::TerminalFailure => ExecutionState::Failed,
            Outcome::Cancelled => ExecutionState::Cancelled,
            Outcome::RetryableFailure if attempts_exhausted => ExecutionState::DeadLettered,
            Outcome::RetryableFailure => ExecutionState::AwaitingRetry,
        }
    }
}
