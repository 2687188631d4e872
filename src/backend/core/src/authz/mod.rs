//! Tenant authorization.
//!
//! This module provides:
//! - **Models**: typed permissions, tenant records, classification and residency
//! - **Policy Engine**: roles and bindings resolving a user's capabilities
//! - **Predefined Roles**: OrgAdmin, HrManager, LineManager, Employee, Auditor
//! - **Tenant Directory**: authoritative tenant records and memberships
//! - **Guard**: evaluates an [`AccessRequest`] into an [`AuthorizationContext`]
//!
//! Every cached read and every job execution starts from a context produced
//! by the guard.
//!
//! # Usage
//!
//! ```rust,ignore
//! use warden_core::authz::{AccessRequest, AuthorizationGuard, Permission, Resource, Action};
//!
//! let guard = AuthorizationGuard::new(Arc::new(policy), Arc::new(directory));
//! let ctx = guard
//!     .evaluate(
//!         &AccessRequest::new("org-1", "user-7")
//!             .with_permission(Permission::new(Resource::LeaveBalance, Action::Read))
//!             .with_audit_source("api:leave"),
//!     )
//!     .await?;
//! ```

pub mod context;
pub mod directory;
pub mod error;
pub mod guard;
pub mod models;
pub mod policy;
pub mod roles;

pub use context::{AuthorizationContext, CACHE_SAFE_CORRELATION_ID};
pub use directory::{InMemoryTenantDirectory, TenantDirectory};
pub use error::AuthorizationError;
pub use guard::{AccessRequest, AuthorizationGuard};
pub use models::{
    Action, DataClassification, DataResidency, OrganizationId, Permission, PermissionSet,
    Resource, Role, RoleBinding, RoleId, TenantRecord, TenantStatus, UserId,
};
pub use policy::{PermissionResolver, PolicyEngine};
pub use roles::PredefinedRole;
