//! Authorization data models: identifiers, typed permissions, tenant records,
//! data classification and residency, roles and bindings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

// ═══════════════════════════════════════════════════════════════════════════════
// Identifiers
// ═══════════════════════════════════════════════════════════════════════════════

/// Strongly-typed user identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when the id is empty or whitespace only.
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Strongly-typed role identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoleId(pub String);

impl RoleId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RoleId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Strongly-typed organization (tenant) identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrganizationId(pub String);

impl OrganizationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when the id is empty or whitespace only.
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for OrganizationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for OrganizationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for OrganizationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Data Classification & Residency
// ═══════════════════════════════════════════════════════════════════════════════

/// Government-style protective marking attached to a tenant's data.
///
/// Variants are declared in ascending order of sensitivity so the derived
/// `Ord` matches `OFFICIAL < OFFICIAL_SENSITIVE < SECRET < TOP_SECRET`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataClassification {
    Official,
    OfficialSensitive,
    Secret,
    TopSecret,
}

impl DataClassification {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Official => "OFFICIAL",
            Self::OfficialSensitive => "OFFICIAL_SENSITIVE",
            Self::Secret => "SECRET",
            Self::TopSecret => "TOP_SECRET",
        }
    }

    /// Only `OFFICIAL` data may be written to a shared cache.
    pub const fn is_cacheable(&self) -> bool {
        matches!(self, Self::Official)
    }
}

impl Default for DataClassification {
    fn default() -> Self {
        Self::Official
    }
}

impl fmt::Display for DataClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Geographic zone a tenant's data must stay within.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataResidency {
    UkOnly,
    UkAndEea,
    GlobalRestricted,
}

impl DataResidency {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::UkOnly => "UK_ONLY",
            Self::UkAndEea => "UK_AND_EEA",
            Self::GlobalRestricted => "GLOBAL_RESTRICTED",
        }
    }
}

impl Default for DataResidency {
    fn default() -> Self {
        Self::UkOnly
    }
}

impl fmt::Display for DataResidency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Permission
// ═══════════════════════════════════════════════════════════════════════════════

/// Resource families guarded by the permission model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
    Employee,
    LeaveBalance,
    LeaveRequest,
    Notification,
    Report,
    AuditLog,
    Settings,
}

impl Resource {
    pub const ALL: [Resource; 7] = [
        Self::Employee,
        Self::LeaveBalance,
        Self::LeaveRequest,
        Self::Notification,
        Self::Report,
        Self::AuditLog,
        Self::Settings,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Employee => "employee",
            Self::LeaveBalance => "leave_balance",
            Self::LeaveRequest => "leave_request",
            Self::Notification => "notification",
            Self::Report => "report",
            Self::AuditLog => "audit_log",
            Self::Settings => "settings",
        }
    }
}

/// Operations that can be performed on a [`Resource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Read,
    Create,
    Update,
    Delete,
    Approve,
    Export,
}

impl Action {
    pub const ALL: [Action; 6] = [
        Self::Read,
        Self::Create,
        Self::Update,
        Self::Delete,
        Self::Approve,
        Self::Export,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Approve => "approve",
            Self::Export => "export",
        }
    }
}

/// A permission is an action on a resource family, written `resource:action`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Permission {
    pub resource: Resource,
    pub action: Action,
}

impl Permission {
    pub const fn new(resource: Resource, action: Action) -> Self {
        Self { resource, action }
    }

    /// Parse a permission from a colon-separated string like `"leave_balance:update"`.
    pub fn parse(s: &str) -> Option<Self> {
        s.parse().ok()
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.resource.as_str(), self.action.as_str())
    }
}

impl FromStr for Permission {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (resource, action) = s
            .split_once(':')
            .ok_or_else(|| format!("permission '{}' is not in resource:action form", s))?;

        let resource = Resource::ALL
            .into_iter()
            .find(|r| r.as_str() == resource)
            .ok_or_else(|| format!("unknown resource '{}'", resource))?;
        let action = Action::ALL
            .into_iter()
            .find(|a| a.as_str() == action)
            .ok_or_else(|| format!("unknown action '{}'", action))?;

        Ok(Self::new(resource, action))
    }
}

/// An ordered, de-duplicated set of permissions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PermissionSet(BTreeSet<Permission>);

impl PermissionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every permission the model knows about.
    pub fn all() -> Self {
        Resource::ALL
            .into_iter()
            .flat_map(|r| Action::ALL.into_iter().map(move |a| Permission::new(r, a)))
            .collect()
    }

    pub fn insert(&mut self, permission: Permission) -> bool {
        self.0.insert(permission)
    }

    pub fn remove(&mut self, permission: &Permission) -> bool {
        self.0.remove(permission)
    }

    pub fn contains(&self, permission: &Permission) -> bool {
        self.0.contains(permission)
    }

    /// Whether every permission in `required` is present.
    pub fn contains_all(&self, required: &PermissionSet) -> bool {
        self.0.is_superset(&required.0)
    }

    /// Permissions in `required` that this set does not grant.
    pub fn missing(&self, required: &PermissionSet) -> Vec<Permission> {
        required.0.difference(&self.0).copied().collect()
    }

    pub fn extend_from(&mut self, other: &PermissionSet) {
        self.0.extend(other.0.iter().copied());
    }

    pub fn iter(&self) -> impl Iterator<Item = &Permission> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<Permission> for PermissionSet {
    fn from_iter<I: IntoIterator<Item = Permission>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<const N: usize> From<[Permission; N]> for PermissionSet {
    fn from(permissions: [Permission; N]) -> Self {
        permissions.into_iter().collect()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tenant
// ═══════════════════════════════════════════════════════════════════════════════

/// Tenant status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantStatus {
    Active,
    Suspended,
    Deactivated,
}

/// Authoritative record of a tenant's data-handling requirements.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantRecord {
    pub org_id: OrganizationId,
    pub name: String,
    pub classification: DataClassification,
    pub residency: DataResidency,
    pub status: TenantStatus,
    pub created_at: DateTime<Utc>,
}

impl TenantRecord {
    /// Create an active tenant record.
    pub fn new(
        org_id: impl Into<OrganizationId>,
        name: impl Into<String>,
        classification: DataClassification,
        residency: DataResidency,
    ) -> Self {
        Self {
            org_id: org_id.into(),
            name: name.into(),
            classification,
            residency,
            status: TenantStatus::Active,
            created_at: Utc::now(),
        }
    }

    pub fn with_status(mut self, status: TenantStatus) -> Self {
        self.status = status;
        self
    }

    pub fn is_active(&self) -> bool {
        self.status == TenantStatus::Active
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Role
// ═══════════════════════════════════════════════════════════════════════════════

/// A role groups a set of permissions under a named identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Role {
    pub id: RoleId,
    pub name: String,
    pub description: String,
    pub permissions: PermissionSet,
    /// Built-in roles cannot be removed.
    pub is_system: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Role {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
        permissions: PermissionSet,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: RoleId::new(id),
            name: name.into(),
            description: description.into(),
            permissions,
            is_system: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Mark this as a system role.
    pub fn system(mut self) -> Self {
        self.is_system = true;
        self
    }

    pub fn has_permission(&self, permission: &Permission) -> bool {
        self.permissions.contains(permission)
    }

    pub fn grant(&mut self, permission: Permission) {
        self.permissions.insert(permission);
        self.updated_at = Utc::now();
    }

    pub fn revoke(&mut self, permission: &Permission) -> bool {
        let removed = self.permissions.remove(permission);
        if removed {
            self.updated_at = Utc::now();
        }
        removed
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Role Binding
// ═══════════════════════════════════════════════════════════════════════════════

/// Binds a user to a role within an organization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleBinding {
    pub user_id: UserId,
    pub role_id: RoleId,
    pub organization_id: OrganizationId,
    pub created_at: DateTime<Utc>,
    /// When the binding expires (None = never).
    pub expires_at: Option<DateTime<Utc>>,
}

impl RoleBinding {
    pub fn new(user_id: UserId, role_id: RoleId, organization_id: OrganizationId) -> Self {
        Self {
            user_id,
            role_id,
            organization_id,
            created_at: Utc::now(),
            expires_at: None,
        }
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn is_active(&self) -> bool {
        self.expires_at.map_or(true, |exp| Utc::now() < exp)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
