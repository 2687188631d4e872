//! Tenant directory: the authoritative source of tenant records and
//! organization membership.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

use super::error::AuthorizationError;
use super::models::{OrganizationId, TenantRecord, TenantStatus, UserId};

/// Lookup seam over wherever tenants and memberships are stored.
#[async_trait]
pub trait TenantDirectory: Send + Sync {
    /// Fetch a tenant record, `None` when the organization is unknown.
    async fn tenant(&self, org_id: &OrganizationId) -> Result<Option<TenantRecord>, AuthorizationError>;

    /// Whether the user belongs to the organization.
    async fn is_member(&self, org_id: &OrganizationId, user_id: &UserId) -> Result<bool, AuthorizationError>;
}

/// In-memory tenant directory for tests, demos and single-node deployments.
///
/// Clones share state.
#[derive(Debug, Clone, Default)]
pub struct InMemoryTenantDirectory {
    tenants: Arc<DashMap<OrganizationId, TenantRecord>>,
    members: Arc<DashMap<OrganizationId, HashSet<UserId>>>,
}

impl InMemoryTenantDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a tenant record.
    pub fn upsert_tenant(&self, record: TenantRecord) {
        debug!(
            org_id = %record.org_id,
            classification = %record.classification,
            residency = %record.residency,
            "Upserting tenant record"
        );
        self.tenants.insert(record.org_id.clone(), record);
    }

    /// Change a tenant's status. Returns `false` when the tenant is unknown.
    pub fn set_status(&self, org_id: &OrganizationId, status: TenantStatus) -> bool {
        match self.tenants.get_mut(org_id) {
            Some(mut record) => {
                record.status = status;
                true
            }
            None => false,
        }
    }

    pub fn remove_tenant(&self, org_id: &OrganizationId) -> Option<TenantRecord> {
        self.members.remove(org_id);
        self.tenants.remove(org_id).map(|(_, record)| record)
    }

    pub fn add_member(&self, org_id: impl Into<OrganizationId>, user_id: impl Into<UserId>) {
        self.members
            .entry(org_id.into())
            .or_default()
            .insert(user_id.into());
    }

    pub fn remove_member(&self, org_id: &OrganizationId, user_id: &UserId) -> bool {
        match self.members.get_mut(org_id) {
            Some(mut users) => users.remove(user_id),
            None => false,
        }
    }

    pub fn tenant_count(&self) -> usize {
        self.tenants.len()
    }
}

#[async_trait]
impl TenantDirectory for InMemoryTenantDirectory {
    async fn tenant(&self, org_id: &OrganizationId) -> Result<Option<TenantRecord>, AuthorizationError> {
        Ok(self.tenants.get(org_id).map(|r| r.clone()))
    }

    async fn is_member(&self, org_id: &OrganizationId, user_id: &UserId) -> Result<bool, AuthorizationError> {
        Ok(self
            .members
            .get(org_id)
            .map_or(false, |users| users.contains(user_id)))
    }
}
