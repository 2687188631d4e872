//! Background job system.
//!
//! This module provides:
//!
//! - **Job Records**: ids, options (attempts, backoff, delay, retention, repeat)
//! - **Queue**: named queues with a pending-job ceiling, idempotent ids and a
//!   bounded dead letter buffer
//! - **Registry**: one queue per name, shared by producers and workers
//! - **Envelope**: the tenant identity a job was enqueued under
//! - **Worker Runtime**: re-authorizes every job through the guard before
//!   running typed business logic, with retry, timeout and graceful close
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  add_authorized   ┌──────────────┐  reserve  ┌──────────────────┐
//! │   Request    │ ────────────────▶ │   JobQueue   │ ────────▶ │  WorkerRuntime   │
//! │   handler    │  (JobEnvelope)    │  (registry)  │           │ decode → guard → │
//! └──────────────┘                   └──────────────┘ ◀──────── │ process → ack    │
//!                                        retry / fail / complete└──────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use warden_core::jobs::{JobOptions, QueueRegistry, WorkerOptions, WorkerRuntime};
//!
//! let queues = Arc::new(QueueRegistry::new(QueueConfig::default()));
//! queues
//!     .get_queue("hr-leave-accrual")
//!     .add_authorized(&ctx, "leave-accrual", payload, JobOptions::new().with_attempts(3))
//!     .await?;
//!
//! let runtime = WorkerRuntime::new(guard, queues.clone());
//! let handle = runtime.register_worker(Arc::new(LeaveAccrualWorker), WorkerOptions::default())?;
//! // ...
//! handle.close().await;
//! ```

pub mod envelope;
pub mod job;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod worker;

pub use envelope::{EnvelopeError, JobEnvelope};
pub use job::{Backoff, JobError, JobId, JobInfo, JobOptions, JobStatus, QueuedJob};
pub use queue::{
    AddOutcome, DeadLetterQueue, InMemoryQueueBackend, InsertOutcome, JobQueue, QueueBackend,
    QueueConfig, QueueError, QueueStats,
};
pub use registry::QueueRegistry;
pub use scheduler::RepeatOptions;
pub use worker::{OrgWorker, WorkerHandle, WorkerOptions, WorkerRuntime, WorkerStats};
