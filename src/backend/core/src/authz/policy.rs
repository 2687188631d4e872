//! Policy engine for resolving what a user may do inside an organization.
//!
//! The policy engine answers the question:
//! "Which capabilities does user X hold within organization O?"

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

use super::error::AuthorizationError;
use super::models::{OrganizationId, PermissionSet, Role, RoleBinding, RoleId, UserId};

// ═══════════════════════════════════════════════════════════════════════════════
// Resolver Seam
// ═══════════════════════════════════════════════════════════════════════════════

/// Source of the capabilities a user holds within an organization.
#[async_trait]
pub trait PermissionResolver: Send + Sync {
    /// Resolve the effective permission set. Users without bindings resolve
    /// to an empty set rather than an error.
    async fn resolve(
        &self,
        org_id: &OrganizationId,
        user_id: &UserId,
    ) -> Result<PermissionSet, AuthorizationError>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// Policy Engine
// ═══════════════════════════════════════════════════════════════════════════════

/// In-memory store of roles and bindings.
///
/// Thread-safe via `DashMap`; clones share state.
#[derive(Debug, Clone)]
pub struct PolicyEngine {
    roles: Arc<DashMap<RoleId, Role>>,

    /// key = (UserId, OrganizationId), value = bound role id to expiry
    /// (`None` = never).
    bindings: Arc<DashMap<(UserId, OrganizationId), HashMap<RoleId, Option<DateTime<Utc>>>>>,
}

impl PolicyEngine {
    pub fn new() -> Self {
        Self {
            roles: Arc::new(DashMap::new()),
            bindings: Arc::new(DashMap::new()),
        }
    }

    /// Create an engine preloaded with the predefined HR roles.
    pub fn with_default_roles() -> Self {
        let engine = Self::new();
        engine.load_roles(super::roles::PredefinedRole::all_defaults());
        engine
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Role management
    // ─────────────────────────────────────────────────────────────────────────

    pub fn add_role(&self, role: Role) {
        debug!(role_id = %role.id, "Adding role to policy engine");
        self.roles.insert(role.id.clone(), role);
    }

    pub fn load_roles(&self, roles: Vec<Role>) {
        for role in roles {
            self.add_role(role);
        }
    }

    pub fn get_role(&self, role_id: &RoleId) -> Option<Role> {
        self.roles.get(role_id).map(|r| r.clone())
    }

    /// Remove a role. Returns `false` if the role is a system role or not found.
    pub fn remove_role(&self, role_id: &RoleId) -> bool {
        if let Some(role) = self.roles.get(role_id) {
            if role.is_system {
                warn!(role_id = %role_id, "Cannot remove system role");
                return false;
            }
        }
        self.roles.remove(role_id).is_some()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Binding management
    // ─────────────────────────────────────────────────────────────────────────

    /// Bind a user to a role within an organization.
    ///
    /// Rebinding the same role replaces its expiry. Expired bindings stop
    /// contributing permissions as soon as they lapse.
    pub fn bind_role(&self, binding: RoleBinding) {
        if !binding.is_active() {
            debug!(
                user_id = %binding.user_id,
                role_id = %binding.role_id,
                "Skipping expired binding"
            );
            return;
        }

        let key = (binding.user_id, binding.organization_id);
        self.bindings
            .entry(key)
            .or_default()
            .insert(binding.role_id, binding.expires_at);
    }

    pub fn unbind_role(
        &self,
        user_id: &UserId,
        role_id: &RoleId,
        organization_id: &OrganizationId,
    ) -> bool {
        let key = (user_id.clone(), organization_id.clone());
        match self.bindings.get_mut(&key) {
            Some(mut role_ids) => role_ids.remove(role_id).is_some(),
            None => false,
        }
    }

    /// Roles currently bound to the user in the organization. Lapsed
    /// bindings are pruned on the way out.
    pub fn user_roles(&self, user_id: &UserId, organization_id: &OrganizationId) -> HashSet<RoleId> {
        let key = (user_id.clone(), organization_id.clone());
        let Some(mut bound) = self.bindings.get_mut(&key) else {
            return HashSet::new();
        };

        let now = Utc::now();
        bound.retain(|role_id, expires_at| {
            let live = expires_at.map_or(true, |at| now < at);
            if !live {
                debug!(user_id = %user_id, role_id = %role_id, "Role binding expired");
            }
            live
        });
        bound.keys().cloned().collect()
    }

    /// Union of the permissions of every role bound to the user in the organization.
    pub fn effective_permissions(
        &self,
        user_id: &UserId,
        organization_id: &OrganizationId,
    ) -> PermissionSet {
        let mut perms = PermissionSet::new();
        for role_id in self.user_roles(user_id, organization_id) {
            if let Some(role) = self.roles.get(&role_id) {
                perms.extend_from(&role.permissions);
            }
        }
        perms
    }
}

impl Default for PolicyEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PermissionResolver for PolicyEngine {
    async fn resolve(
        &self,
        org_id: &OrganizationId,
        user_id: &UserId,
    ) -> Result<PermissionSet, AuthorizationError> {
        Ok(self.effective_permissions(user_id, org_id))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::models::{Action, Permission, Resource};
    use crate::authz::roles::PredefinedRole;

    fn org(id: &str) -> OrganizationId {
        OrganizationId::new(id)
    }

    fn user(id: &str) -> UserId {
        UserId::new(id)
    }

    fn bind(engine: &PolicyEngine, uid: &str, role: PredefinedRole, oid: &str) {
        engine.bind_role(RoleBinding::new(
            UserId::new(uid),
            RoleId::new(role.id()),
            OrganizationId::new(oid),
        ));
    }

    #[test]
    fn test_hr_manager_can_update_balances() {
        let engine = PolicyEngine::with_default_roles();
        bind(&engine, "alice", PredefinedRole::HrManager, "org1");

        let perms = engine.effective_permissions(&user("alice"), &org("org1"));
        assert!(perms.contains(&Permission::new(Resource::LeaveBalance, Action::Update)));
    }

    #[test]
    fn test_bindings_are_org_scoped() {
        let engine = PolicyEngine::with_default_roles();
        bind(&engine, "alice", PredefinedRole::OrgAdmin, "org1");

        let perm = Permission::new(Resource::Employee, Action::Read);
        assert!(engine.effective_permissions(&user("alice"), &org("org1")).contains(&perm));
        assert!(engine.effective_permissions(&user("alice"), &org("org2")).is_empty());
    }

    #[test]
    fn test_effective_permissions_union() {
        let engine = PolicyEngine::with_default_roles();
        bind(&engine, "bob", PredefinedRole::Employee, "org1");
        bind(&engine, "bob", PredefinedRole::Auditor, "org1");

        let perms = engine.effective_permissions(&user("bob"), &org("org1"));
        assert!(perms.contains(&Permission::new(Resource::LeaveRequest, Action::Create)));
        assert!(perms.contains(&Permission::new(Resource::AuditLog, Action::Read)));
    }

    #[tokio::test]
    async fn test_binding_lapses_after_expiry() {
        let engine = PolicyEngine::with_default_roles();
        engine.bind_role(
            RoleBinding::new(user("erin"), RoleId::new(PredefinedRole::HrManager.id()), org("org1"))
                .with_expiry(Utc::now() + chrono::Duration::milliseconds(20)),
        );
        bind(&engine, "erin", PredefinedRole::Employee, "org1");
        assert!(engine
            .effective_permissions(&user("erin"), &org("org1"))
            .contains(&Permission::new(Resource::LeaveBalance, Action::Update)));

        tokio::time::sleep(std::time::Duration::from_millis(40)).await;

        let perms = engine.resolve(&org("org1"), &user("erin")).await.unwrap();
        assert!(!perms.contains(&Permission::new(Resource::LeaveBalance, Action::Update)));
        assert!(perms.contains(&Permission::new(Resource::LeaveRequest, Action::Create)));
        assert_eq!(
            engine.user_roles(&user("erin"), &org("org1")),
            HashSet::from([RoleId::new(PredefinedRole::Employee.id())])
        );
    }

    #[test]
    fn test_cannot_remove_system_role() {
        let engine = PolicyEngine::with_default_roles();
        assert!(!engine.remove_role(&RoleId::new("org_admin")));
        assert!(engine.get_role(&RoleId::new("org_admin")).is_some());
    }

    #[test]
    fn test_unbind_role() {
        let engine = PolicyEngine::with_default_roles();
        bind(&engine, "dave", PredefinedRole::Employee, "org1");
        assert!(engine.unbind_role(&user("dave"), &RoleId::new("employee"), &org("org1")));
        assert!(engine.effective_permissions(&user("dave"), &org("org1")).is_empty());
    }

    #[tokio::test]
    async fn test_resolver_returns_empty_for_unknown_user() {
        let engine = PolicyEngine::with_default_roles();
        let perms = engine.resolve(&org("org1"), &user("nobody")).await.unwrap();
        assert!(perms.is_empty());
    }
}
