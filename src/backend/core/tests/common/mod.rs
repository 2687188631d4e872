//! Shared fixtures: tenants, memberships and guard-issued contexts.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use warden_core::authz::{
    AccessRequest, AuthorizationContext, AuthorizationGuard, DataClassification, DataResidency,
    InMemoryTenantDirectory, PolicyEngine, PredefinedRole, RoleBinding, TenantRecord,
};
use warden_core::jobs::{JobId, JobQueue, QueuedJob};

pub struct Tenants {
    pub policy: PolicyEngine,
    pub directory: InMemoryTenantDirectory,
    pub guard: AuthorizationGuard,
}

impl Tenants {
    pub fn new() -> Self {
        let policy = PolicyEngine::with_default_roles();
        let directory = InMemoryTenantDirectory::new();
        let guard = AuthorizationGuard::new(Arc::new(policy.clone()), Arc::new(directory.clone()));
        Self {
            policy,
            directory,
            guard,
        }
    }

    pub fn add_tenant(&self, org: &str, classification: DataClassification) {
        self.directory.upsert_tenant(TenantRecord::new(
            org,
            format!("Tenant {}", org),
            classification,
            DataResidency::UkOnly,
        ));
    }

    pub fn add_member(&self, org: &str, user: &str, role: PredefinedRole) {
        self.directory.add_member(org, user);
        self.policy
            .bind_role(RoleBinding::new(user.into(), role.id().into(), org.into()));
    }

    /// Tenant `org` with an HR manager `hr-1`.
    pub fn with_hr_org(org: &str, classification: DataClassification) -> Self {
        let tenants = Self::new();
        tenants.add_tenant(org, classification);
        tenants.add_member(org, "hr-1", PredefinedRole::HrManager);
        tenants
    }

    pub async fn context(&self, org: &str, user: &str) -> AuthorizationContext {
        self.guard
            .evaluate(&AccessRequest::new(org, user).with_audit_source("test"))
            .await
            .expect("guard should allow the fixture user")
    }
}

/// Poll until the job reaches a terminal status.
pub async fn wait_for_terminal(queue: &JobQueue, id: &JobId) -> QueuedJob {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(job) = queue.get_job(id).await.unwrap() {
            if job.status.is_terminal() {
                return job;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {} did not finish in time",
            id
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
