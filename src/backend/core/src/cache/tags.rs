//! Tenant-scoped cache tags.
//!
//! A tag names every cached result for one `(org, scope, classification,
//! residency)` tuple. The org id is always the outermost component so one
//! tenant's tags can never prefix-match another's, and each component is
//! escaped so a `:` inside an id cannot forge a boundary.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use super::backend::CacheBackend;
use crate::authz::{AuthorizationContext, DataClassification, DataResidency, OrganizationId};
use crate::error::Result;

// ═══════════════════════════════════════════════════════════════════════════════
// Cache Tag
// ═══════════════════════════════════════════════════════════════════════════════

/// A composite cache tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheTag(String);

impl CacheTag {
    /// Build the tag for a tenant scope.
    ///
    /// Format: `org:{org}:scope:{scope}:class:{CLASSIFICATION}:res:{RESIDENCY}`.
    pub fn build(
        org_id: &OrganizationId,
        scope: &str,
        classification: DataClassification,
        residency: DataResidency,
    ) -> Self {
        Self(format!(
            "org:{}:scope:{}:class:{}:res:{}",
            escape_component(org_id.as_str()),
            escape_component(scope),
            classification.as_str(),
            residency.as_str(),
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Prefix shared by every tag of one organization.
    pub fn org_prefix(org_id: &OrganizationId) -> String {
        format!("org:{}:", escape_component(org_id.as_str()))
    }
}

impl fmt::Display for CacheTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Percent-escape the separator and the escape character itself.
fn escape_component(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '%' => out.push_str("%25"),
            ':' => out.push_str("%3A"),
            '#' => out.push_str("%23"),
            other => out.push(other),
        }
    }
    out
}

// ═══════════════════════════════════════════════════════════════════════════════
// Engine Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Options supplied when a read registers its tag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TagOptions {
    /// Marks the tag as holding sensitive or short-lived results.
    pub short_lived: bool,
}

/// What a read learns when it registers a tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagRegistration {
    pub tag: CacheTag,
    /// Current generation, `None` for engines without versioning.
    pub generation: Option<u64>,
    pub short_lived: bool,
}

/// Builds, registers and invalidates cache tags.
#[async_trait]
pub trait CacheTagEngine: Send + Sync {
    /// Deterministic tag for a context and scope.
    ///
    /// Contexts differing only in user or correlation id share a tag.
    fn build_tag(&self, ctx: &AuthorizationContext, scope: &str) -> CacheTag {
        CacheTag::build(
            ctx.org_id(),
            scope,
            ctx.data_classification(),
            ctx.data_residency(),
        )
    }

    /// Associate the tag with the cached computation about to run.
    async fn register_tag(&self, tag: &CacheTag, options: TagOptions) -> Result<TagRegistration>;

    /// Make every subsequent read under the tag recompute.
    async fn invalidate_tag(&self, tag: &CacheTag) -> Result<u64>;

    /// Whether results for this context must bypass the cache entirely.
    fn is_sensitive_payload(&self, ctx: &AuthorizationContext) -> bool {
        !ctx.data_classification().is_cacheable()
    }

    /// Current generation of the tag, `None` when versioning is unsupported.
    async fn tag_version(&self, _tag: &CacheTag) -> Result<Option<u64>> {
        Ok(None)
    }

    /// Advance the tag's generation, `None` when versioning is unsupported.
    async fn bump_tag_version(&self, _tag: &CacheTag) -> Result<Option<u64>> {
        Ok(None)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-Memory Engine
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
struct TagState {
    generation: u64,
    short_lived: bool,
    registrations: u64,
    last_registered: DateTime<Utc>,
    last_invalidated: Option<DateTime<Utc>>,
}

/// Snapshot of a registered tag.
#[derive(Debug, Clone, Serialize)]
pub struct TagInfo {
    pub generation: u64,
    pub short_lived: bool,
    pub registrations: u64,
    pub last_registered: DateTime<Utc>,
    pub last_invalidated: Option<DateTime<Utc>>,
}

/// Default ceiling on tracked tags.
pub const DEFAULT_MAX_TAGS: usize = 10_000;

/// Versioned tag engine over a [`CacheBackend`].
///
/// Invalidation bumps the tag's generation before deleting its entries, so a
/// read that computed under the old generation cannot store its result.
///
/// At most `max_tags` tags are tracked; the least recently registered are
/// dropped past that. Generations are drawn from one engine-wide epoch that
/// advances on every drop, so a re-created tag never reuses a generation an
/// in-flight read or a stored entry could still hold.
pub struct InMemoryTagEngine {
    backend: Arc<dyn CacheBackend>,
    tags: DashMap<CacheTag, TagState>,
    epoch: AtomicU64,
    max_tags: usize,
}

impl InMemoryTagEngine {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self {
            backend,
            tags: DashMap::new(),
            epoch: AtomicU64::new(0),
            max_tags: DEFAULT_MAX_TAGS,
        }
    }

    pub fn with_max_tags(mut self, max_tags: usize) -> Self {
        self.max_tags = max_tags.max(1);
        self
    }

    pub fn tag_info(&self, tag: &CacheTag) -> Option<TagInfo> {
        self.tags.get(tag).map(|state| TagInfo {
            generation: state.generation,
            short_lived: state.short_lived,
            registrations: state.registrations,
            last_registered: state.last_registered,
            last_invalidated: state.last_invalidated,
        })
    }

    /// Number of tags currently tracked.
    pub fn tag_count(&self) -> usize {
        self.tags.len()
    }

    /// Tags of one organization, for tenant-wide invalidation.
    pub fn tags_for_org(&self, org_id: &OrganizationId) -> Vec<CacheTag> {
        let prefix = CacheTag::org_prefix(org_id);
        self.tags
            .iter()
            .filter(|entry| entry.key().as_str().starts_with(&prefix))
            .map(|entry| entry.key().clone())
            .collect()
    }

    fn fresh_state(&self, short_lived: bool, now: DateTime<Utc>) -> TagState {
        TagState {
            generation: self.epoch.load(Ordering::SeqCst),
            short_lived,
            registrations: 0,
            last_registered: now,
            last_invalidated: None,
        }
    }

    /// Make room for `tag` if it is new and the engine is full.
    fn make_room(&self, tag: &CacheTag) {
        if self.tags.len() < self.max_tags || self.tags.contains_key(tag) {
            return;
        }

        let mut by_age: Vec<(DateTime<Utc>, CacheTag)> = self
            .tags
            .iter()
            .map(|entry| (entry.value().last_registered, entry.key().clone()))
            .collect();
        by_age.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        let excess = self.tags.len() + 1 - self.max_tags;
        let batch = excess.max(self.max_tags / 10).min(by_age.len());

        self.epoch.fetch_add(1, Ordering::SeqCst);
        for (_, stale) in by_age.into_iter().take(batch) {
            self.tags.remove(&stale);
        }
        counter!("cache_tags_pruned_total").increment(batch as u64);
        debug!(pruned = batch, max_tags = self.max_tags, "Pruned least recently used cache tags");
    }

    fn bump(&self, tag: &CacheTag) -> u64 {
        let now = Utc::now();
        self.make_room(tag);
        let generation = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let mut state = self
            .tags
            .entry(tag.clone())
            .or_insert_with(|| self.fresh_state(false, now));
        state.generation = generation;
        state.last_invalidated = Some(now);
        generation
    }
}

#[async_trait]
impl CacheTagEngine for InMemoryTagEngine {
    async fn register_tag(&self, tag: &CacheTag, options: TagOptions) -> Result<TagRegistration> {
        let now = Utc::now();
        self.make_room(tag);
        let mut state = self
            .tags
            .entry(tag.clone())
            .or_insert_with(|| self.fresh_state(options.short_lived, now));
        state.registrations += 1;
        state.last_registered = now;
        state.short_lived |= options.short_lived;

        Ok(TagRegistration {
            tag: tag.clone(),
            generation: Some(state.generation),
            short_lived: state.short_lived,
        })
    }

    async fn invalidate_tag(&self, tag: &CacheTag) -> Result<u64> {
        let generation = self.bump(tag);
        let deleted = self.backend.delete_by_tag(tag.as_str()).await?;

        counter!("cache_invalidations_total", "strategy" => "tag").increment(1);
        debug!(tag = %tag, generation, deleted, "Invalidated cache tag");
        Ok(deleted)
    }

    async fn tag_version(&self, tag: &CacheTag) -> Result<Option<u64>> {
        let generation = match self.tags.get(tag) {
            Some(state) => state.generation,
            None => self.epoch.load(Ordering::SeqCst),
        };
        Ok(Some(generation))
    }

    async fn bump_tag_version(&self, tag: &CacheTag) -> Result<Option<u64>> {
        Ok(Some(self.bump(tag)))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::context::test_context;
    use crate::cache::backend::{CacheEntry, InMemoryBackend};

    fn engine() -> (InMemoryTagEngine, Arc<InMemoryBackend>) {
        let backend = Arc::new(InMemoryBackend::default());
        (InMemoryTagEngine::new(backend.clone()), backend)
    }

    #[test]
    fn test_tag_format() {
        let tag = CacheTag::build(
            &OrganizationId::new("org-1"),
            "hr-notifications",
            DataClassification::Official,
            DataResidency::UkOnly,
        );
        assert_eq!(
            tag.as_str(),
            "org:org-1:scope:hr-notifications:class:OFFICIAL:res:UK_ONLY"
        );
    }

    #[test]
    fn test_separator_cannot_be_forged() {
        let a = CacheTag::build(
            &OrganizationId::new("a:scope:x"),
            "y",
            DataClassification::Official,
            DataResidency::UkOnly,
        );
        let b = CacheTag::build(
            &OrganizationId::new("a"),
            "x:scope:y",
            DataClassification::Official,
            DataResidency::UkOnly,
        );
        assert_ne!(a, b);
        assert!(!a.as_str().starts_with(&CacheTag::org_prefix(&OrganizationId::new("a"))));
    }

    #[test]
    fn test_build_tag_ignores_correlation_id() {
        let (engine, _) = engine();
        let ctx = test_context("org-1", DataClassification::Official, DataResidency::UkOnly);
        let other = test_context("org-1", DataClassification::Official, DataResidency::UkOnly);
        assert_ne!(ctx.correlation_id(), other.correlation_id());
        assert_eq!(engine.build_tag(&ctx, "s"), engine.build_tag(&other, "s"));
    }

    #[test]
    fn test_sensitive_payload() {
        let (engine, _) = engine();
        for (class, sensitive) in [
            (DataClassification::Official, false),
            (DataClassification::OfficialSensitive, true),
            (DataClassification::Secret, true),
            (DataClassification::TopSecret, true),
        ] {
            let ctx = test_context("org-1", class, DataResidency::UkOnly);
            assert_eq!(engine.is_sensitive_payload(&ctx), sensitive);
        }
    }

    #[tokio::test]
    async fn test_register_and_invalidate_bumps_generation() {
        let (engine, backend) = engine();
        let tag = CacheTag::build(
            &OrganizationId::new("org-1"),
            "s",
            DataClassification::Official,
            DataResidency::UkOnly,
        );

        let first = engine.register_tag(&tag, TagOptions::default()).await.unwrap();
        assert_eq!(first.generation, Some(0));

        backend
            .set("k", CacheEntry::new(b"1".to_vec()).with_tag(tag.as_str()))
            .await
            .unwrap();
        assert_eq!(engine.invalidate_tag(&tag).await.unwrap(), 1);
        assert!(backend.get("k").await.unwrap().is_none());

        let second = engine.register_tag(&tag, TagOptions::default()).await.unwrap();
        assert_eq!(second.generation, Some(1));
        assert_eq!(engine.tag_info(&tag).unwrap().registrations, 2);
    }

    fn scoped(scope: &str) -> CacheTag {
        CacheTag::build(
            &OrganizationId::new("org-1"),
            scope,
            DataClassification::Official,
            DataResidency::UkOnly,
        )
    }

    #[tokio::test]
    async fn test_tag_map_is_bounded() {
        let (engine, _) = engine();
        let engine = engine.with_max_tags(10);
        for i in 0..100 {
            engine
                .register_tag(&scoped(&format!("report-{}", i)), TagOptions::default())
                .await
                .unwrap();
        }
        assert!(engine.tag_count() <= 10);
        assert!(engine.tag_info(&scoped("report-99")).is_some());
    }

    #[tokio::test]
    async fn test_pruned_tag_never_reuses_generation() {
        let (engine, _) = engine();
        let engine = engine.with_max_tags(1);
        let tag = scoped("leave-balances");

        let before = engine.register_tag(&tag, TagOptions::default()).await.unwrap();
        engine.register_tag(&scoped("other"), TagOptions::default()).await.unwrap();
        assert!(engine.tag_info(&tag).is_none());

        // A read that registered before the prune must see a different version.
        assert_ne!(engine.tag_version(&tag).await.unwrap(), before.generation);
        let after = engine.register_tag(&tag, TagOptions::default()).await.unwrap();
        assert_ne!(after.generation, before.generation);
    }

    #[tokio::test]
    async fn test_short_lived_is_sticky() {
        let (engine, _) = engine();
        let tag = CacheTag("t".into());
        engine
            .register_tag(&tag, TagOptions { short_lived: true })
            .await
            .unwrap();
        let again = engine.register_tag(&tag, TagOptions::default()).await.unwrap();
        assert!(again.short_lived);
    }

    #[tokio::test]
    async fn test_tags_for_org() {
        let (engine, _) = engine();
        for org in ["org-1", "org-10"] {
            let tag = CacheTag::build(
                &OrganizationId::new(org),
                "s",
                DataClassification::Official,
                DataResidency::UkOnly,
            );
            engine.register_tag(&tag, TagOptions::default()).await.unwrap();
        }
        assert_eq!(engine.tags_for_org(&OrganizationId::new("org-1")).len(), 1);
    }
}
