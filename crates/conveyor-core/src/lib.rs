//! Conveyor task lifecycle engine.
//!
//! Accepts and validates job specifications, enqueues them onto typed durable
//! work queues with retry and dead-letter semantics, dispatches them to a
//! worker pool, records every execution attempt, and serves read-only views
//! of jobs, executions, and artifacts. External collaborators (metadata
//! store, blob store, scrape/OCR engines, key validation, clock) are
//! consumed through the traits in this crate.

pub mod artifact;
pub mod bus;
pub mod clock;
pub mod error;
pub mod execution;
pub mod governor;
pub mod handler;
pub mod intake;
pub mod job;
pub mod memory_bus;
pub mod query;
pub mod recorder;
mod repo;
pub mod scheduler;
pub mod store;
pub mod testutil;
pub mod worker;

pub use artifact::{Artifact, ArtifactMetadata, blob_path};
pub use bus::{DeliveredMessage, ExecutionRequest, MessageBus, QueueDepth};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::CoreError;
pub use execution::{ErrorKind, Execution, ExecutionState, Outcome};
pub use governor::{GovernorConfig, KeyRecord, KeyValidator, OperationClass, Principal, RateGovernor, Role};
pub use handler::{EngineArtifact, EngineResult, OcrEngine, OutcomeHint, RunContext, Scraper};
pub use intake::{IntakeEvent, IntakeService, SubmitRequest};
pub use job::{JobKind, JobSpec, JobState, Parameters, Priority, RetryPolicy, Schedule};
pub use memory_bus::{BusConfig, MemoryBus};
pub use query::{JobFilter, Page, QueryService};
pub use recorder::ExecutionRecorder;
pub use scheduler::{SchedulerConfig, SchedulerService};
pub use store::{BlobStore, Document, Expect, MetadataStore, QueryFilter, TxOp};
pub use worker::{TracingWorkerReporter, WorkerConfig, WorkerService};
