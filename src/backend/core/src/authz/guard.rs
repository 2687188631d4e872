//! The authorization guard: the single constructor of [`AuthorizationContext`].

use metrics::counter;
use std::sync::Arc;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::context::AuthorizationContext;
use super::directory::TenantDirectory;
use super::error::AuthorizationError;
use super::models::{DataClassification, DataResidency, OrganizationId, Permission, PermissionSet, TenantStatus, UserId};
use super::policy::PermissionResolver;

// ═══════════════════════════════════════════════════════════════════════════════
// Access Request
// ═══════════════════════════════════════════════════════════════════════════════

/// Everything the guard needs to decide whether an operation may proceed.
#[derive(Debug, Clone)]
pub struct AccessRequest {
    pub org_id: OrganizationId,
    pub user_id: UserId,
    pub required_permissions: PermissionSet,
    /// When set, the tenant's classification must equal this value.
    pub expected_classification: Option<DataClassification>,
    /// When set, the tenant's residency must equal this value.
    pub expected_residency: Option<DataResidency>,
    pub audit_source: String,
    /// Generated when absent.
    pub correlation_id: Option<String>,
}

impl AccessRequest {
    pub fn new(org_id: impl Into<OrganizationId>, user_id: impl Into<UserId>) -> Self {
        Self {
            org_id: org_id.into(),
            user_id: user_id.into(),
            required_permissions: PermissionSet::new(),
            expected_classification: None,
            expected_residency: None,
            audit_source: "unspecified".to_string(),
            correlation_id: None,
        }
    }

    pub fn with_permission(mut self, permission: Permission) -> Self {
        self.required_permissions.insert(permission);
        self
    }

    pub fn with_permissions(mut self, permissions: &PermissionSet) -> Self {
        self.required_permissions.extend_from(permissions);
        self
    }

    pub fn expect_classification(mut self, classification: DataClassification) -> Self {
        self.expected_classification = Some(classification);
        self
    }

    pub fn expect_residency(mut self, residency: DataResidency) -> Self {
        self.expected_residency = Some(residency);
        self
    }

    pub fn with_audit_source(mut self, source: impl Into<String>) -> Self {
        self.audit_source = source.into();
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Guard
// ═══════════════════════════════════════════════════════════════════════════════

/// Evaluates access requests against the tenant directory and permission
/// resolver.
#[derive(Clone)]
pub struct AuthorizationGuard {
    resolver: Arc<dyn PermissionResolver>,
    directory: Arc<dyn TenantDirectory>,
}

impl std::fmt::Debug for AuthorizationGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorizationGuard").finish_non_exhaustive()
    }
}

impl AuthorizationGuard {
    pub fn new(resolver: Arc<dyn PermissionResolver>, directory: Arc<dyn TenantDirectory>) -> Self {
        Self { resolver, directory }
    }

    /// Evaluate a request, producing an immutable context on success.
    ///
    /// Checks run in this order: non-empty ids, tenant exists, tenant active,
    /// expected classification, expected residency, membership, permissions.
    /// The context carries the tenant's authoritative classification and
    /// residency, never the caller's expectation.
    #[instrument(
        skip(self, request),
        fields(org_id = %request.org_id, user_id = %request.user_id, audit_source = %request.audit_source)
    )]
    pub async fn evaluate(&self, request: &AccessRequest) -> Result<AuthorizationContext, AuthorizationError> {
        let result = self.evaluate_inner(request).await;

        match &result {
            Ok(_) => {
                counter!("warden_authz_decisions_total", "outcome" => "allow").increment(1);
                debug!("Access granted");
            }
            Err(e) => {
                counter!(
                    "warden_authz_decisions_total",
                    "outcome" => "deny",
                    "reason" => e.reason(),
                )
                .increment(1);
                warn!(reason = e.reason(), error = %e, "Access denied");
            }
        }

        result
    }

    async fn evaluate_inner(&self, request: &AccessRequest) -> Result<AuthorizationContext, AuthorizationError> {
        if request.org_id.is_blank() {
            return Err(AuthorizationError::InvalidRequest("org_id must not be empty".into()));
        }
        if request.user_id.is_blank() {
            return Err(AuthorizationError::InvalidRequest("user_id must not be empty".into()));
        }

        let tenant = self
            .directory
            .tenant(&request.org_id)
            .await?
            .ok_or_else(|| AuthorizationError::TenantNotFound(request.org_id.clone()))?;

        if tenant.status != TenantStatus::Active {
            return Err(AuthorizationError::TenantSuspended(tenant.org_id));
        }

        if let Some(expected) = request.expected_classification {
            if expected != tenant.classification {
                return Err(AuthorizationError::ClassificationMismatch {
                    expected,
                    actual: tenant.classification,
                });
            }
        }

        if let Some(expected) = request.expected_residency {
            if expected != tenant.residency {
                return Err(AuthorizationError::ResidencyMismatch {
                    expected,
                    actual: tenant.residency,
                });
            }
        }

        if !self.directory.is_member(&request.org_id, &request.user_id).await? {
            return Err(AuthorizationError::MembershipNotFound {
                org: request.org_id.clone(),
                user: request.user_id.clone(),
            });
        }

        let permissions = self.resolver.resolve(&request.org_id, &request.user_id).await?;
        let missing = permissions.missing(&request.required_permissions);
        if !missing.is_empty() {
            return Err(AuthorizationError::PermissionDenied {
                org: request.org_id.clone(),
                user: request.user_id.clone(),
                missing,
            });
        }

        let correlation_id = request
            .correlation_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        Ok(AuthorizationContext::new(
            request.org_id.clone(),
            request.user_id.clone(),
            permissions,
            tenant.classification,
            tenant.residency,
            request.audit_source.clone(),
            correlation_id,
        ))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
