#![allow(clippy::result_large_err)]
//! # Warden Core
//!
//! Tenant-scoped caching and authorized background jobs for multi-tenant
//! HR back ends.
//!
//! ## Architecture
//!
//! - **Authorization**: guard evaluating org membership, tenant status,
//!   classification, residency and typed permissions into an immutable context
//! - **Cache**: bounded LRU with TTL, tenant-namespaced cache tags with
//!   generation-based invalidation, and classification-aware cached reads
//! - **Jobs**: named queues with backpressure, retry/backoff, delays, repeat
//!   schedules and a dead letter buffer; workers re-authorize every job
//! - **Lifecycle**: all-settled cleanup callbacks run once on shutdown
//! - **Telemetry**: structured logging and Prometheus metrics
//! - **Config**: layered file and environment configuration

pub mod authz;
pub mod cache;
pub mod config;
pub mod error;
pub mod jobs;
pub mod lifecycle;
pub mod telemetry;

pub use error::{ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, Result, WardenError};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::authz::{
        AccessRequest, Action, AuthorizationContext, AuthorizationError, AuthorizationGuard,
        DataClassification, DataResidency, InMemoryTenantDirectory, OrganizationId, Permission,
        PermissionResolver, PermissionSet, PolicyEngine, PredefinedRole, Resource, RoleBinding,
        TenantDirectory, TenantRecord, TenantStatus, UserId,
    };
    pub use crate::cache::{
        BoundedCache, CacheBackend, CacheTag, CacheTagEngine, CachedReadOptions, InMemoryBackend,
        InMemoryConfig, InMemoryTagEngine, RateLimiter, TenantCache, TenantCacheConfig,
    };
    pub use crate::config::WardenConfig;
    pub use crate::error::{ErrorCode, ErrorContext, ErrorDetails, Result, WardenError};
    pub use crate::jobs::{
        AddOutcome, Backoff, JobEnvelope, JobError, JobId, JobInfo, JobOptions, JobQueue,
        JobStatus, OrgWorker, QueueConfig, QueueError, QueueRegistry, RepeatOptions,
        WorkerHandle, WorkerOptions, WorkerRuntime,
    };
    pub use crate::lifecycle::{CleanupReport, LifecycleRegistry};
}
