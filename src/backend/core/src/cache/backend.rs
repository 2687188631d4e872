//! Cache backend implementations.
//!
//! A backend stores serialized entries keyed by string, with each entry
//! indexed under the cache tags it was written for so a tag can be dropped in
//! one call. The in-memory backend sits on top of [`BoundedCache`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics::{counter, gauge, histogram};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

use super::bounded::BoundedCache;
use crate::error::Result;

// ═══════════════════════════════════════════════════════════════════════════════
// Cache Entry
// ═══════════════════════════════════════════════════════════════════════════════

/// Serialized value plus the metadata the backend needs to expire and index it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Serialized data
    pub data: Vec<u8>,

    /// Time-to-live; the backend default applies when unset
    #[serde(default, with = "humantime_serde")]
    pub ttl: Option<Duration>,

    /// Tags for invalidation
    pub tags: Vec<String>,

    /// Tag generation the value was computed under, when the tag engine
    /// supports versioning
    pub generation: Option<u64>,

    /// When this entry was created
    pub created_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            ttl: None,
            tags: Vec::new(),
            generation: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_generation(mut self, generation: Option<u64>) -> Self {
        self.generation = generation;
        self
    }

    /// Check if the entry has expired.
    pub fn is_expired(&self) -> bool {
        if let Some(ttl) = self.ttl {
            let elapsed = Utc::now()
                .signed_duration_since(self.created_at)
                .to_std()
                .unwrap_or(Duration::ZERO);
            elapsed >= ttl
        } else {
            false
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Cache Statistics
// ═══════════════════════════════════════════════════════════════════════════════

/// Cache statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: u64,
    pub size_bytes: u64,
    pub evictions: u64,
    /// Hit rate (0.0 - 1.0)
    pub hit_rate: f64,
    /// Free-form backend details (`max_entries`, `indexed_tags`)
    pub backend_stats: HashMap<String, String>,
}

impl CacheStats {
    pub fn calculate_hit_rate(&mut self) {
        let total = self.hits + self.misses;
        self.hit_rate = if total > 0 {
            self.hits as f64 / total as f64
        } else {
            0.0
        };
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Cache Backend Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Storage behind [`TenantCache`](super::TenantCache).
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Get a live entry.
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>>;

    /// Store an entry, indexing it under its tags.
    async fn set(&self, key: &str, entry: CacheEntry) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<bool>;

    /// Delete every entry indexed under `tag`, returning how many were removed.
    async fn delete_by_tag(&self, tag: &str) -> Result<u64>;

    async fn stats(&self) -> Result<CacheStats>;

    async fn clear(&self) -> Result<()>;

    fn name(&self) -> &'static str;
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-Memory Backend
// ═══════════════════════════════════════════════════════════════════════════════

/// Configuration for the in-memory backend.
#[derive(Debug, Clone)]
pub struct InMemoryConfig {
    /// Maximum number of entries before LRU eviction
    pub max_entries: usize,

    /// TTL given to entries that do not carry their own (zero = none)
    pub default_ttl: Duration,
}

impl Default for InMemoryConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            default_ttl: Duration::from_secs(300),
        }
    }
}

/// In-memory backend: a mutex-guarded [`BoundedCache`] plus a tag index.
pub struct InMemoryBackend {
    entries: Mutex<BoundedCache<String, CacheEntry>>,

    /// Tag to keys mapping for tag-based invalidation
    tag_index: DashMap<String, HashSet<String>>,

    config: InMemoryConfig,

    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    size_bytes: AtomicU64,
}

impl InMemoryBackend {
    pub fn new(config: InMemoryConfig) -> Self {
        Self {
            // Expiry is tracked per entry so the tag index and byte count stay
            // in step with what the bounded cache drops.
            entries: Mutex::new(BoundedCache::new(config.max_entries, Duration::ZERO)),
            tag_index: DashMap::new(),
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            size_bytes: AtomicU64::new(0),
        }
    }

    fn add_to_tag_index(&self, key: &str, tags: &[String]) {
        for tag in tags {
            self.tag_index
                .entry(tag.clone())
                .or_default()
                .insert(key.to_string());
        }
    }

    fn remove_from_tag_index(&self, key: &str, tags: &[String]) {
        for tag in tags {
            let now_empty = match self.tag_index.get_mut(tag) {
                Some(mut keys) => {
                    keys.remove(key);
                    keys.is_empty()
                }
                None => false,
            };
            if now_empty {
                self.tag_index.remove_if(tag, |_, keys| keys.is_empty());
            }
        }
    }

    /// Bookkeeping for an entry that left the cache for any reason.
    fn forget(&self, key: &str, entry: &CacheEntry) {
        self.remove_from_tag_index(key, &entry.tags);
        self.size_bytes
            .fetch_sub(entry.data.len() as u64, Ordering::Relaxed);
    }

    /// Drop expired entries eagerly and return how many were removed.
    pub fn cleanup_expired(&self) -> u64 {
        let expired: Vec<(String, CacheEntry)> = {
            let mut entries = self.entries.lock();
            let keys: Vec<String> = entries.keys_by_recency().cloned().collect();
            keys.into_iter()
                .filter_map(|key| {
                    let stale = entries.get(&key).map_or(false, CacheEntry::is_expired);
                    if stale {
                        entries.delete(&key).map(|entry| (key, entry))
                    } else {
                        None
                    }
                })
                .collect()
        };

        for (key, entry) in &expired {
            self.forget(key, entry);
        }

        if !expired.is_empty() {
            debug!("Cleaned up {} expired cache entries", expired.len());
        }
        expired.len() as u64
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new(InMemoryConfig::default())
    }
}

#[async_trait]
impl CacheBackend for InMemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        // Ok = live hit; Err(Some) = per-entry TTL elapsed; Err(None) = absent.
        let found = {
            let mut entries = self.entries.lock();
            match entries.get(key).filter(|e| !e.is_expired()).cloned() {
                Some(entry) => Ok(entry),
                None => Err(entries.delete(key)),
            }
        };

        match found {
            Ok(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                counter!("cache_hits_total", "backend" => "in_memory").increment(1);
                Ok(Some(entry))
            }
            Err(None) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                counter!("cache_misses_total", "backend" => "in_memory", "reason" => "not_found").increment(1);
                Ok(None)
            }
            Err(Some(expired)) => {
                self.forget(key, &expired);
                self.misses.fetch_add(1, Ordering::Relaxed);
                counter!("cache_misses_total", "backend" => "in_memory", "reason" => "expired").increment(1);
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, mut entry: CacheEntry) -> Result<()> {
        if entry.ttl.is_none() && !self.config.default_ttl.is_zero() {
            entry.ttl = Some(self.config.default_ttl);
        }
        let size = entry.data.len();
        let tags = entry.tags.clone();

        let (previous, evicted) = {
            let mut entries = self.entries.lock();
            let previous = entries.delete(key);
            let evicted = entries.set(key.to_string(), entry);
            (previous, evicted)
        };

        if let Some(previous) = previous {
            self.forget(key, &previous);
        }
        if let Some((evicted_key, evicted_entry)) = evicted {
            self.forget(&evicted_key, &evicted_entry);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            counter!("cache_evictions_total", "backend" => "in_memory").increment(1);
        }

        self.size_bytes.fetch_add(size as u64, Ordering::Relaxed);
        self.add_to_tag_index(key, &tags);

        counter!("cache_sets_total", "backend" => "in_memory").increment(1);
        histogram!("cache_entry_size_bytes", "backend" => "in_memory").record(size as f64);

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let removed = self.entries.lock().delete(key);
        match removed {
            Some(entry) => {
                self.forget(key, &entry);
                counter!("cache_deletes_total", "backend" => "in_memory").increment(1);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_by_tag(&self, tag: &str) -> Result<u64> {
        let keys = match self.tag_index.remove(tag) {
            Some((_, keys)) => keys,
            None => return Ok(0),
        };

        let removed: Vec<(String, CacheEntry)> = {
            let mut entries = self.entries.lock();
            keys.into_iter()
                .filter_map(|key| entries.delete(&key).map(|entry| (key, entry)))
                .collect()
        };

        for (key, entry) in &removed {
            self.forget(key, entry);
        }

        debug!(tag = %tag, deleted = removed.len(), "Deleted cache entries by tag");
        Ok(removed.len() as u64)
    }

    async fn stats(&self) -> Result<CacheStats> {
        let entries = self.entries.lock().len() as u64;
        let size_bytes = self.size_bytes.load(Ordering::Relaxed);

        let mut stats = CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries,
            size_bytes,
            evictions: self.evictions.load(Ordering::Relaxed),
            hit_rate: 0.0,
            backend_stats: HashMap::new(),
        };
        stats.calculate_hit_rate();

        stats
            .backend_stats
            .insert("max_entries".to_string(), self.config.max_entries.to_string());
        stats
            .backend_stats
            .insert("indexed_tags".to_string(), self.tag_index.len().to_string());

        gauge!("cache_entries", "backend" => "in_memory").set(entries as f64);
        gauge!("cache_size_bytes", "backend" => "in_memory").set(size_bytes as f64);
        gauge!("cache_hit_rate", "backend" => "in_memory").set(stats.hit_rate);

        Ok(stats)
    }

    async fn clear(&self) -> Result<()> {
        self.entries.lock().clear();
        self.tag_index.clear();
        self.size_bytes.store(0, Ordering::Relaxed);
        counter!("cache_clears_total", "backend" => "in_memory").increment(1);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "in_memory"
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
