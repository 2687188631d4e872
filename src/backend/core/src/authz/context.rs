//! The validated, read-only authorization context.

use serde::Serialize;

use super::models::{DataClassification, DataResidency, OrganizationId, Permission, PermissionSet, UserId};

/// Correlation id substituted before a context is used to derive cache keys.
pub const CACHE_SAFE_CORRELATION_ID: &str = "00000000-0000-0000-0000-000000000000";

/// Outcome of a successful guard evaluation.
///
/// Fields are private and there is no public constructor: the only way to
/// obtain one is [`AuthorizationGuard::evaluate`](super::AuthorizationGuard::evaluate).
/// It is never deserialized; jobs carry a [`JobEnvelope`](crate::jobs::JobEnvelope)
/// and the worker re-evaluates it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthorizationContext {
    org_id: OrganizationId,
    user_id: UserId,
    permissions: PermissionSet,
    data_classification: DataClassification,
    data_residency: DataResidency,
    audit_source: String,
    correlation_id: String,
}

impl AuthorizationContext {
    pub(crate) fn new(
        org_id: OrganizationId,
        user_id: UserId,
        permissions: PermissionSet,
        data_classification: DataClassification,
        data_residency: DataResidency,
        audit_source: String,
        correlation_id: String,
    ) -> Self {
        Self {
            org_id,
            user_id,
            permissions,
            data_classification,
            data_residency,
            audit_source,
            correlation_id,
        }
    }

    pub fn org_id(&self) -> &OrganizationId {
        &self.org_id
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn permissions(&self) -> &PermissionSet {
        &self.permissions
    }

    pub fn data_classification(&self) -> DataClassification {
        self.data_classification
    }

    pub fn data_residency(&self) -> DataResidency {
        self.data_residency
    }

    pub fn audit_source(&self) -> &str {
        &self.audit_source
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn has_permission(&self, permission: &Permission) -> bool {
        self.permissions.contains(permission)
    }

    /// Copy of this context with only the correlation id replaced by
    /// [`CACHE_SAFE_CORRELATION_ID`].
    pub fn to_cache_safe(&self) -> Self {
        Self {
            correlation_id: CACHE_SAFE_CORRELATION_ID.to_string(),
            ..self.clone()
        }
    }

    pub fn is_cache_safe(&self) -> bool {
        self.correlation_id == CACHE_SAFE_CORRELATION_ID
    }
}

#[cfg(test)]
pub(crate) fn test_context(
    org: &str,
    classification: DataClassification,
    residency: DataResidency,
) -> AuthorizationContext {
    AuthorizationContext::new(
        OrganizationId::new(org),
        UserId::new("user-1"),
        PermissionSet::all(),
        classification,
        residency,
        "unit-test".to_string(),
        uuid::Uuid::new_v4().to_string(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_cache_safe_only_touches_correlation_id() {
        let ctx = test_context("org-1", DataClassification::Official, DataResidency::UkOnly);
        let safe = ctx.to_cache_safe();

        assert_eq!(safe.correlation_id(), CACHE_SAFE_CORRELATION_ID);
        assert!(safe.is_cache_safe());
        assert_eq!(safe.org_id(), ctx.org_id());
        assert_eq!(safe.user_id(), ctx.user_id());
        assert_eq!(safe.permissions(), ctx.permissions());
        assert_eq!(safe.data_classification(), ctx.data_classification());
        assert_eq!(safe.data_residency(), ctx.data_residency());
        assert_eq!(safe.audit_source(), ctx.audit_source());
    }

    #[test]
    fn test_to_cache_safe_is_idempotent() {
        let ctx = test_context("org-1", DataClassification::Official, DataResidency::UkOnly);
        assert_eq!(ctx.to_cache_safe(), ctx.to_cache_safe().to_cache_safe());
    }
}
