//! Benchmarks for the caching layer.
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use std::time::Duration;
use warden_core::authz::{
    AccessRequest, AuthorizationContext, AuthorizationGuard, DataClassification, DataResidency, InMemoryTenantDirectory,
    OrganizationId, PolicyEngine, PredefinedRole, RoleBinding, TenantRecord,
};
use warden_core::WardenError;
use warden_core::cache::{key_digest, BoundedCache, CacheTag, InMemoryConfig, TenantCache, TenantCacheConfig};

fn bench_tag_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_tag_build");
    let org = OrganizationId::new("org-1");
    let escaped = OrganizationId::new("org:with:separators");
    group.bench_function("plain", |b| { b.iter(|| black_box(CacheTag::build(&org, "leave-balances", DataClassification::Official, DataResidency::UkOnly))); });
    group.bench_function("escaped", |b| { b.iter(|| black_box(CacheTag::build(&escaped, "reports#q3", DataClassification::Official, DataResidency::UkAndEea))); });
    group.bench_function("key_digest", |b| { b.iter(|| black_box(key_digest(&("employee", 42u64, "2026-10")).unwrap())); });
    group.finish();
}

fn bench_bounded_set(c: &mut Criterion) {
    let mut group = c.benchmark_group("bounded_cache_set");
    for cap in [100usize, 1_000, 10_000] {
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(cap), &cap, |b, &capacity| {
            let mut cache = BoundedCache::new(capacity, Duration::from_secs(60));
            let mut i = 0u64;
            b.iter(|| { i += 1; black_box(cache.set(i % (capacity as u64 * 2), i)); });
        });
    }
    group.finish();
}

fn bench_bounded_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("bounded_cache_get");
    let mut cache = BoundedCache::new(10_000, Duration::from_secs(60));
    for i in 0..10_000u64 { cache.set(i, i); }
    let mut i = 0u64;
    group.bench_function("hit", |b| { b.iter(|| { i = (i + 7) % 10_000; black_box(cache.get(&i).copied()); }); });
    group.bench_function("miss", |b| { b.iter(|| black_box(cache.get(&20_000u64).copied())); });
    group.finish();
}

fn bench_cached_read_hit(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let policy = PolicyEngine::with_default_roles();
    let directory = InMemoryTenantDirectory::new();
    directory.upsert_tenant(TenantRecord::new("org-1", "Bench", DataClassification::Official, DataResidency::UkOnly));
    directory.add_member("org-1", "hr-1");
    policy.bind_role(RoleBinding::new("hr-1".into(), PredefinedRole::HrManager.id().into(), "org-1".into()));
    let guard = AuthorizationGuard::new(Arc::new(policy), Arc::new(directory));
    let ctx = rt.block_on(guard.evaluate(&AccessRequest::new("org-1", "hr-1"))).unwrap();

    let cache = TenantCache::in_memory(InMemoryConfig::default(), TenantCacheConfig::default());
    let load = |_ctx: AuthorizationContext| async { Ok::<_, WardenError>(vec![1u32; 64]) };
    rt.block_on(cache.cached_read(&ctx, "leave-balances", load)).unwrap();

    c.bench_function("tenant_cache_read_hit", |b| {
        b.iter(|| black_box(rt.block_on(cache.cached_read(&ctx, "leave-balances", load)).unwrap()));
    });
}

criterion_group!(benches, bench_tag_build, bench_bounded_set, bench_bounded_get, bench_cached_read_hit);
criterion_main!(benches);
