//! Authorization failures raised by the guard and its collaborators.

use thiserror::Error;

use super::models::{DataClassification, DataResidency, OrganizationId, Permission, UserId};
use crate::error::{ErrorCode, ErrorDetails, WardenError};

/// Reasons an access request was refused.
///
/// Authorization failures are never retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthorizationError {
    #[error("Invalid access request: {0}")]
    InvalidRequest(String),

    #[error("Organization not found: {0}")]
    TenantNotFound(OrganizationId),

    #[error("Organization is not active: {0}")]
    TenantSuspended(OrganizationId),

    #[error("User {user} is not a member of organization {org}")]
    MembershipNotFound { org: OrganizationId, user: UserId },

    #[error("User {user} lacks {} in organization {org}", format_permissions(.missing))]
    PermissionDenied {
        org: OrganizationId,
        user: UserId,
        missing: Vec<Permission>,
    },

    #[error("Classification mismatch: expected {expected}, tenant is {actual}")]
    ClassificationMismatch {
        expected: DataClassification,
        actual: DataClassification,
    },

    #[error("Residency mismatch: expected {expected}, tenant is {actual}")]
    ResidencyMismatch {
        expected: DataResidency,
        actual: DataResidency,
    },

    #[error("Authorization lookup failed: {0}")]
    Lookup(String),
}

fn format_permissions(permissions: &[Permission]) -> String {
    permissions
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl AuthorizationError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidRequest(_) => ErrorCode::InvalidInput,
            Self::TenantNotFound(_) => ErrorCode::TenantNotFound,
            Self::TenantSuspended(_) => ErrorCode::TenantSuspended,
            Self::MembershipNotFound { .. } => ErrorCode::MembershipNotFound,
            Self::PermissionDenied { .. } => ErrorCode::PermissionDenied,
            Self::ClassificationMismatch { .. } => ErrorCode::ClassificationMismatch,
            Self::ResidencyMismatch { .. } => ErrorCode::ResidencyMismatch,
            Self::Lookup(_) => ErrorCode::Forbidden,
        }
    }

    /// Short label used for metrics and structured logs.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::TenantNotFound(_) => "tenant_not_found",
            Self::TenantSuspended(_) => "tenant_suspended",
            Self::MembershipNotFound { .. } => "membership_not_found",
            Self::PermissionDenied { .. } => "permission_denied",
            Self::ClassificationMismatch { .. } => "classification_mismatch",
            Self::ResidencyMismatch { .. } => "residency_mismatch",
            Self::Lookup(_) => "lookup_failed",
        }
    }
}

impl From<AuthorizationError> for WardenError {
    fn from(error: AuthorizationError) -> Self {
        let code = error.code();
        let details = ErrorDetails::new().with_context("reason", error.reason());
        // Client-facing text stays generic; the detail goes to logs only.
        WardenError::with_internal(code, "Access denied", error.to_string())
            .with_details(details)
            .with_source(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::models::{Action, Resource};

    #[test]
    fn test_permission_denied_message() {
        let error = AuthorizationError::PermissionDenied {
            org: OrganizationId::new("org-1"),
            user: UserId::new("u-1"),
            missing: vec![
                Permission::new(Resource::LeaveBalance, Action::Update),
                Permission::new(Resource::Report, Action::Export),
            ],
        };
        assert_eq!(
            error.to_string(),
            "User u-1 lacks leave_balance:update, report:export in organization org-1"
        );
    }

    #[test]
    fn test_conversion_hides_detail() {
        let error: WardenError = AuthorizationError::ResidencyMismatch {
            expected: DataResidency::UkOnly,
            actual: DataResidency::GlobalRestricted,
        }
        .into();

        assert_eq!(error.code(), ErrorCode::ResidencyMismatch);
        assert_eq!(error.user_message(), "Access denied");
        assert!(error.internal_message().unwrap().contains("GLOBAL_RESTRICTED"));
        assert!(!error.is_retryable());
    }
}
