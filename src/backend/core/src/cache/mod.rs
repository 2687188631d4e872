//! Tenant-scoped, classification-aware caching layer.
//!
//! This module provides:
//!
//! - **BoundedCache**: a generic LRU-with-TTL primitive with no tenant awareness
//! - **Backend Abstraction**: pluggable stores indexed by cache tag
//! - **Tag Engine**: composite `(org, scope, classification, residency)` tags
//!   with generation-based invalidation
//! - **TenantCache**: the read-through entry point every read path goes through
//! - **Rate Limiter**: fixed-window limiting on top of `BoundedCache`
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                          TenantCache                              │
//! │   classification != OFFICIAL ──────────────▶ loader (bypass)      │
//! │   OFFICIAL ──▶ to_cache_safe ──▶ build_tag ──▶ register_tag       │
//! ├──────────────────────────────┬────────────────────────────────────┤
//! │       CacheTagEngine         │           CacheBackend             │
//! │  (generations, invalidate)   │  (entries + tag index)             │
//! │                              │  ┌──────────────────────────────┐  │
//! │                              │  │ BoundedCache (LRU + TTL)     │  │
//! │                              │  └──────────────────────────────┘  │
//! └──────────────────────────────┴────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use warden_core::cache::TenantCache;
//!
//! let cache = TenantCache::in_memory(InMemoryConfig::default(), TenantCacheConfig::default());
//!
//! let summary: LeaveSummary = cache
//!     .cached_read(&ctx, "leave-summary", |ctx| async move { load_summary(&ctx).await })
//!     .await?;
//!
//! // After a write:
//! cache.invalidate_scope(&ctx, "leave-summary").await?;
//! ```

pub mod backend;
pub mod bounded;
pub mod rate_limit;
pub mod tags;

pub use backend::{CacheBackend, CacheEntry, CacheStats, InMemoryBackend, InMemoryConfig};
pub use bounded::BoundedCache;
pub use rate_limit::{RateLimitConfig, RateLimitResult, RateLimiter};
pub use tags::{CacheTag, CacheTagEngine, InMemoryTagEngine, TagInfo, TagOptions, TagRegistration};

use metrics::counter;
use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use crate::authz::AuthorizationContext;
use crate::error::Result;

// ═══════════════════════════════════════════════════════════════════════════════
// Configuration
// ═══════════════════════════════════════════════════════════════════════════════

/// Read-through cache configuration.
#[derive(Debug, Clone)]
pub struct TenantCacheConfig {
    /// TTL for results that do not ask for their own
    pub default_ttl: Duration,

    /// Ceiling applied to results read with `short_lived`
    pub short_lived_ttl: Duration,

    /// Results larger than this are returned but not stored
    pub max_entry_size: usize,
}

impl Default for TenantCacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(300),
            short_lived_ttl: Duration::from_secs(30),
            max_entry_size: 1024 * 1024,
        }
    }
}

/// Per-read options.
#[derive(Debug, Clone, Copy, Default)]
pub struct CachedReadOptions {
    /// Mark the tag short-lived and cap the entry TTL at `short_lived_ttl`.
    pub short_lived: bool,
    /// Entry TTL override.
    pub ttl: Option<Duration>,
}

impl CachedReadOptions {
    pub fn short_lived() -> Self {
        Self {
            short_lived: true,
            ttl: None,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tenant Cache
// ═══════════════════════════════════════════════════════════════════════════════

/// Read-through cache enforcing the tenant caching policy.
#[derive(Clone)]
pub struct TenantCache {
    engine: Arc<dyn CacheTagEngine>,
    backend: Arc<dyn CacheBackend>,
    config: TenantCacheConfig,
}

impl TenantCache {
    /// `engine` must invalidate through the same `backend`.
    pub fn new(
        engine: Arc<dyn CacheTagEngine>,
        backend: Arc<dyn CacheBackend>,
        config: TenantCacheConfig,
    ) -> Self {
        Self {
            engine,
            backend,
            config,
        }
    }

    /// In-memory backend plus versioned tag engine.
    pub fn in_memory(backend_config: InMemoryConfig, config: TenantCacheConfig) -> Self {
        // Tracked tags are capped at the backend's entry capacity.
        let max_tags = backend_config.max_entries;
        let backend: Arc<dyn CacheBackend> = Arc::new(InMemoryBackend::new(backend_config));
        let engine = Arc::new(InMemoryTagEngine::new(backend.clone()).with_max_tags(max_tags));
        Self::new(engine, backend, config)
    }

    pub fn engine(&self) -> &Arc<dyn CacheTagEngine> {
        &self.engine
    }

    pub fn config(&self) -> &TenantCacheConfig {
        &self.config
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Reads
    // ─────────────────────────────────────────────────────────────────────────

    /// Memoize `loader` under the context's tag for `scope`.
    ///
    /// Non-`OFFICIAL` contexts bypass the cache and the loader receives the
    /// original context. Otherwise the loader receives the cache-safe copy.
    pub async fn cached_read<T, F, Fut>(
        &self,
        ctx: &AuthorizationContext,
        scope: &str,
        loader: F,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(AuthorizationContext) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.read_through(ctx, scope, None, CachedReadOptions::default(), loader)
            .await
    }

    /// Like [`cached_read`](Self::cached_read) with explicit options.
    pub async fn cached_read_with<T, F, Fut>(
        &self,
        ctx: &AuthorizationContext,
        scope: &str,
        options: CachedReadOptions,
        loader: F,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(AuthorizationContext) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.read_through(ctx, scope, None, options, loader).await
    }

    /// Memoize per argument set: results for different `key_parts` are stored
    /// separately under the same tag and are invalidated together.
    pub async fn cached_read_keyed<K, T, F, Fut>(
        &self,
        ctx: &AuthorizationContext,
        scope: &str,
        key_parts: &K,
        loader: F,
    ) -> Result<T>
    where
        K: Serialize + ?Sized,
        T: Serialize + DeserializeOwned,
        F: FnOnce(AuthorizationContext) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let digest = key_digest(key_parts)?;
        self.read_through(ctx, scope, Some(digest), CachedReadOptions::default(), loader)
            .await
    }

    #[instrument(
        skip_all,
        fields(org_id = %ctx.org_id(), scope = %scope, classification = %ctx.data_classification())
    )]
    async fn read_through<T, F, Fut>(
        &self,
        ctx: &AuthorizationContext,
        scope: &str,
        digest: Option<String>,
        options: CachedReadOptions,
        loader: F,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(AuthorizationContext) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if self.engine.is_sensitive_payload(ctx) {
            counter!("warden_cache_reads_total", "outcome" => "bypass").increment(1);
            debug!("Sensitive classification, bypassing cache");
            return loader(ctx.clone()).await;
        }

        let safe = ctx.to_cache_safe();
        let tag = self.engine.build_tag(&safe, scope);
        let registration = self
            .engine
            .register_tag(&tag, TagOptions { short_lived: options.short_lived })
            .await?;
        let key = entry_key(&tag, digest.as_deref());

        if let Some(entry) = self.backend.get(&key).await? {
            if is_current(entry.generation, registration.generation) {
                match serde_json::from_slice::<T>(&entry.data) {
                    Ok(value) => {
                        counter!("warden_cache_reads_total", "outcome" => "hit").increment(1);
                        debug!(key = %key, "Cache hit");
                        return Ok(value);
                    }
                    Err(e) => {
                        warn!(key = %key, error = %e, "Discarding undecodable cache entry");
                        self.backend.delete(&key).await?;
                    }
                }
            } else {
                counter!("warden_cache_reads_total", "outcome" => "stale").increment(1);
                self.backend.delete(&key).await?;
            }
        }

        counter!("warden_cache_reads_total", "outcome" => "miss").increment(1);
        let value = loader(safe).await?;

        let data = serde_json::to_vec(&value)?;
        if data.len() > self.config.max_entry_size {
            warn!(
                key = %key,
                size = data.len(),
                max = self.config.max_entry_size,
                "Result too large to cache"
            );
            return Ok(value);
        }

        // Skip the write if the tag was invalidated while the loader ran.
        if self.engine.tag_version(&tag).await? != registration.generation {
            debug!(key = %key, "Tag invalidated during load, not storing");
            return Ok(value);
        }

        let entry = CacheEntry::new(data)
            .with_ttl(self.entry_ttl(&options, registration.short_lived))
            .with_tag(tag.as_str())
            .with_generation(registration.generation);
        self.backend.set(&key, entry).await?;

        // An invalidation that landed between the check and the write wins.
        if self.engine.tag_version(&tag).await? != registration.generation {
            self.backend.delete(&key).await?;
        }

        Ok(value)
    }

    fn entry_ttl(&self, options: &CachedReadOptions, short_lived: bool) -> Option<Duration> {
        let ttl = options.ttl.unwrap_or(self.config.default_ttl);
        let ttl = if short_lived {
            ttl.min(self.config.short_lived_ttl)
        } else {
            ttl
        };
        (!ttl.is_zero()).then_some(ttl)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Invalidation
    // ─────────────────────────────────────────────────────────────────────────

    /// Invalidate the tag a read with this context and scope would use.
    #[instrument(skip(self, ctx), fields(org_id = %ctx.org_id()))]
    pub async fn invalidate_scope(&self, ctx: &AuthorizationContext, scope: &str) -> Result<u64> {
        let tag = self.engine.build_tag(&ctx.to_cache_safe(), scope);
        self.engine.invalidate_tag(&tag).await
    }

    pub async fn invalidate_tag(&self, tag: &CacheTag) -> Result<u64> {
        self.engine.invalidate_tag(tag).await
    }

    pub async fn stats(&self) -> Result<CacheStats> {
        self.backend.stats().await
    }
}

fn is_current(entry_generation: Option<u64>, current: Option<u64>) -> bool {
    match current {
        Some(generation) => entry_generation == Some(generation),
        None => true,
    }
}

fn entry_key(tag: &CacheTag, digest: Option<&str>) -> String {
    format!("{}#{}", tag, digest.unwrap_or("_"))
}

/// Stable digest of a serializable argument set.
pub fn key_digest<K: Serialize + ?Sized>(key_parts: &K) -> Result<String> {
    let bytes = serde_json::to_vec(key_parts)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::context::test_context;
    use crate::authz::{DataClassification, DataResidency};
    use serde::Deserialize;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Summary {
        count: u32,
    }

    fn cache() -> TenantCache {
        TenantCache::in_memory(InMemoryConfig::default(), TenantCacheConfig::default())
    }

    fn official(org: &str) -> AuthorizationContext {
        test_context(org, DataClassification::Official, DataResidency::UkOnly)
    }

    #[tokio::test]
    async fn test_loader_receives_cache_safe_context() {
        let cache = cache();
        let ctx = official("org-1");

        let seen = cache
            .cached_read(&ctx, "s", |ctx| async move { Ok(ctx.correlation_id().to_string()) })
            .await
            .unwrap();
        assert_eq!(seen, crate::authz::CACHE_SAFE_CORRELATION_ID);
    }

    #[tokio::test]
    async fn test_keyed_reads_are_separate() {
        let cache = cache();
        let ctx = official("org-1");
        let calls = AtomicU32::new(0);

        for (args, expected) in [("a", 1), ("b", 2), ("a", 1)] {
            let value: Summary = cache
                .cached_read_keyed(&ctx, "s", &("employee", args), |_| async {
                    Ok(Summary {
                        count: calls.fetch_add(1, Ordering::SeqCst) + 1,
                    })
                })
                .await
                .unwrap();
            assert_eq!(value.count, expected);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalidation_during_load_is_not_stored() {
        let cache = cache();
        let ctx = official("org-1");
        let tag = cache.engine().build_tag(&ctx, "s");

        let engine = cache.engine().clone();
        let first: Summary = cache
            .cached_read(&ctx, "s", |_| async move {
                engine.invalidate_tag(&tag).await?;
                Ok(Summary { count: 1 })
            })
            .await
            .unwrap();
        assert_eq!(first.count, 1);

        let second: Summary = cache
            .cached_read(&ctx, "s", |_| async { Ok(Summary { count: 2 }) })
            .await
            .unwrap();
        assert_eq!(second.count, 2);
    }

    #[tokio::test]
    async fn test_short_lived_entries_expire() {
        let cache = TenantCache::in_memory(
            InMemoryConfig::default(),
            TenantCacheConfig {
                short_lived_ttl: Duration::from_millis(20),
                ..Default::default()
            },
        );
        let ctx = official("org-1");
        let calls = AtomicU32::new(0);
        let load = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(Summary { count: 0 })
        };

        let _: Summary = cache
            .cached_read_with(&ctx, "s", CachedReadOptions::short_lived(), |_| load())
            .await
            .unwrap();
        let _: Summary = cache
            .cached_read_with(&ctx, "s", CachedReadOptions::short_lived(), |_| load())
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(40)).await;
        let _: Summary = cache
            .cached_read_with(&ctx, "s", CachedReadOptions::short_lived(), |_| load())
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_oversized_results_not_stored() {
        let cache = TenantCache::in_memory(
            InMemoryConfig::default(),
            TenantCacheConfig {
                max_entry_size: 4,
                ..Default::default()
            },
        );
        let ctx = official("org-1");

        let _: String = cache
            .cached_read(&ctx, "s", |_| async { Ok("a long string".to_string()) })
            .await
            .unwrap();
        assert_eq!(cache.stats().await.unwrap().entries, 0);
    }

    #[tokio::test]
    async fn test_loader_error_propagates_and_is_not_cached() {
        let cache = cache();
        let ctx = official("org-1");

        let err = cache
            .cached_read::<Summary, _, _>(&ctx, "s", |_| async {
                Err(crate::error::WardenError::internal("backing store down"))
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::InternalError);
        assert_eq!(cache.stats().await.unwrap().entries, 0);
    }

    #[test]
    fn test_key_digest_is_stable() {
        let a = key_digest(&("emp-1", 2024)).unwrap();
        let b = key_digest(&("emp-1", 2024)).unwrap();
        let c = key_digest(&("emp-1", 2025)).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }
}
