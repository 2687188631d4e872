//! Integration tests for tenant-scoped caching.
//!
//! Tests cover:
//! - Tag determinism and org isolation
//! - Sensitive classifications bypassing the cache
//! - Reuse until invalidation
//! - LRU eviction and TTL expiry of the bounded cache

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::Tenants;
use warden_core::authz::{DataClassification, DataResidency, OrganizationId, PredefinedRole};
use warden_core::cache::{
    BoundedCache, CacheTag, CacheTagEngine, InMemoryConfig, TenantCache, TenantCacheConfig,
};

fn cache() -> TenantCache {
    TenantCache::in_memory(InMemoryConfig::default(), TenantCacheConfig::default())
}

async fn counted_read(
    cache: &TenantCache,
    ctx: &warden_core::authz::AuthorizationContext,
    scope: &str,
    calls: &Arc<AtomicU32>,
) -> Vec<String> {
    let calls = calls.clone();
    cache
        .cached_read(ctx, scope, |loader_ctx| async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![loader_ctx.org_id().to_string(), "balance".to_string()])
        })
        .await
        .unwrap()
}

// ============================================================================
// Tags
// ============================================================================

#[tokio::test]
async fn test_tag_is_deterministic_across_users() {
    let tenants = Tenants::with_hr_org("org-1", DataClassification::Official);
    tenants.add_member("org-1", "emp-1", PredefinedRole::Employee);
    let cache = cache();

    let hr = tenants.context("org-1", "hr-1").await;
    let employee = tenants.context("org-1", "emp-1").await;

    let a = cache.engine().build_tag(&hr, "leave-balances");
    let b = cache.engine().build_tag(&employee, "leave-balances");
    assert_eq!(a, b);
    assert_eq!(
        a,
        CacheTag::build(
            &OrganizationId::new("org-1"),
            "leave-balances",
            DataClassification::Official,
            DataResidency::UkOnly,
        )
    );
}

#[tokio::test]
async fn test_tags_are_isolated_by_org() {
    let tenants = Tenants::with_hr_org("org-1", DataClassification::Official);
    tenants.add_tenant("org-2", DataClassification::Official);
    tenants.add_member("org-2", "hr-1", PredefinedRole::HrManager);
    let cache = cache();

    let org1 = tenants.context("org-1", "hr-1").await;
    let org2 = tenants.context("org-2", "hr-1").await;
    assert_ne!(
        cache.engine().build_tag(&org1, "leave-balances"),
        cache.engine().build_tag(&org2, "leave-balances")
    );

    let calls = Arc::new(AtomicU32::new(0));
    let first = counted_read(&cache, &org1, "leave-balances", &calls).await;
    let second = counted_read(&cache, &org2, "leave-balances", &calls).await;

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(first[0], "org-1");
    assert_eq!(second[0], "org-2");
}

#[tokio::test]
async fn test_tag_separator_in_scope_cannot_collide() {
    let a = CacheTag::build(
        &OrganizationId::new("org-1"),
        "a:class:SECRET",
        DataClassification::Official,
        DataResidency::UkOnly,
    );
    let b = CacheTag::build(
        &OrganizationId::new("org-1:scope:a"),
        "class:SECRET",
        DataClassification::Official,
        DataResidency::UkOnly,
    );
    assert_ne!(a, b);
    assert!(a.as_str().starts_with(&CacheTag::org_prefix(&OrganizationId::new("org-1"))));
}

// ============================================================================
// Cached Reads
// ============================================================================

#[tokio::test]
async fn test_sensitive_context_bypasses_cache() {
    let tenants = Tenants::with_hr_org("org-s", DataClassification::OfficialSensitive);
    let cache = cache();
    let ctx = tenants.context("org-s", "hr-1").await;
    assert!(cache.engine().is_sensitive_payload(&ctx));

    let calls = Arc::new(AtomicU32::new(0));
    counted_read(&cache, &ctx, "payroll", &calls).await;
    counted_read(&cache, &ctx, "payroll", &calls).await;

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(cache.stats().await.unwrap().entries, 0);
}

#[tokio::test]
async fn test_official_reads_reuse_then_invalidate() {
    let tenants = Tenants::with_hr_org("org-1", DataClassification::Official);
    let cache = cache();
    let ctx = tenants.context("org-1", "hr-1").await;
    let calls = Arc::new(AtomicU32::new(0));

    let first = counted_read(&cache, &ctx, "leave-balances", &calls).await;
    let second = counted_read(&cache, &ctx, "leave-balances", &calls).await;
    assert_eq!(first, second);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    cache.invalidate_scope(&ctx, "leave-balances").await.unwrap();

    counted_read(&cache, &ctx, "leave-balances", &calls).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_invalidation_leaves_other_orgs_cached() {
    let tenants = Tenants::with_hr_org("org-1", DataClassification::Official);
    tenants.add_tenant("org-2", DataClassification::Official);
    tenants.add_member("org-2", "hr-1", PredefinedRole::HrManager);
    let cache = cache();
    let org1 = tenants.context("org-1", "hr-1").await;
    let org2 = tenants.context("org-2", "hr-1").await;
    let calls = Arc::new(AtomicU32::new(0));

    counted_read(&cache, &org1, "leave-balances", &calls).await;
    counted_read(&cache, &org2, "leave-balances", &calls).await;
    cache.invalidate_scope(&org1, "leave-balances").await.unwrap();

    counted_read(&cache, &org2, "leave-balances", &calls).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_notifications_scope_loads_once() {
    let tenants = Tenants::with_hr_org("org-1", DataClassification::Official);
    let cache = cache();
    let ctx = tenants.context("org-1", "hr-1").await;
    let calls = Arc::new(AtomicU32::new(0));

    let first = counted_read(&cache, &ctx, "hr-notifications", &calls).await;
    let second = counted_read(&cache, &ctx, "hr-notifications", &calls).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(first, second);
}

// ============================================================================
// Bounded Cache
// ============================================================================

#[test]
fn test_lru_evicts_least_recently_used() {
    let mut cache = BoundedCache::new(2, Duration::from_secs(60));
    cache.set("a", 1);
    cache.set("b", 2);
    cache.set("c", 3);

    assert!(!cache.contains("a"));
    assert_eq!(cache.get("b"), Some(&2));
    assert_eq!(cache.get("c"), Some(&3));
    assert_eq!(cache.len(), 2);
}

#[test]
fn test_get_refreshes_recency() {
    let mut cache = BoundedCache::new(2, Duration::from_secs(60));
    cache.set("a", 1);
    cache.set("b", 2);
    assert_eq!(cache.get("a"), Some(&1));
    cache.set("c", 3);

    assert!(cache.contains("a"));
    assert!(!cache.contains("b"));
}

#[test]
fn test_entries_expire_after_ttl() {
    let mut cache = BoundedCache::new(10, Duration::from_millis(50));
    cache.set("a", 1);
    std::thread::sleep(Duration::from_millis(60));

    assert_eq!(cache.get("a"), None);
    assert!(cache.is_empty());
}
