//! Bounded in-memory LRU cache with a uniform TTL.
//!
//! `BoundedCache` has no tenant awareness and no internal locking: callers
//! that share one across tasks wrap it in a mutex (see [`RateLimiter`] and
//! [`InMemoryBackend`]).
//!
//! [`RateLimiter`]: super::rate_limit::RateLimiter
//! [`InMemoryBackend`]: super::backend::InMemoryBackend

use std::borrow::Borrow;
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct Slot<V> {
    value: V,
    expires_at: Option<Instant>,
    /// Position in the recency index; larger is more recent.
    tick: u64,
}

impl<V> Slot<V> {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map_or(false, |at| now >= at)
    }
}

/// LRU cache evicting the least recently used entry once `max_entries` is
/// exceeded, and lazily dropping entries older than `ttl` on access.
#[derive(Debug)]
pub struct BoundedCache<K, V> {
    entries: HashMap<K, Slot<V>>,
    recency: BTreeMap<u64, K>,
    next_tick: u64,
    max_entries: usize,
    ttl: Duration,
}

impl<K, V> BoundedCache<K, V>
where
    K: Eq + Hash + Clone,
{
    /// Create a cache holding at most `max_entries` (clamped to at least 1).
    /// A zero `ttl` means entries never expire.
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            recency: BTreeMap::new(),
            next_tick: 0,
            max_entries: max_entries.max(1),
            ttl,
        }
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Number of stored entries, including expired ones not yet observed.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn bump(&mut self) -> u64 {
        let tick = self.next_tick;
        self.next_tick += 1;
        tick
    }

    /// Look up a value, promoting it to most recently used.
    ///
    /// An expired entry is removed and reported absent.
    pub fn get<Q>(&mut self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.get_mut(key).map(|v| &*v)
    }

    /// Mutable variant of [`get`](Self::get) with the same promotion rules.
    pub fn get_mut<Q>(&mut self, key: &Q) -> Option<&mut V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let now = Instant::now();
        let expired = self.entries.get(key)?.is_expired(now);
        if expired {
            self.delete(key);
            return None;
        }

        let tick = self.bump();
        let slot = self.entries.get_mut(key)?;
        if let Some(owned) = self.recency.remove(&slot.tick) {
            self.recency.insert(tick, owned);
        }
        slot.tick = tick;
        Some(&mut slot.value)
    }

    /// Whether a live entry exists, without promoting it.
    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries
            .get(key)
            .map_or(false, |slot| !slot.is_expired(Instant::now()))
    }

    /// Insert or overwrite a value as most recently used.
    ///
    /// Returns the entry evicted to stay within `max_entries`, if any.
    pub fn set(&mut self, key: K, value: V) -> Option<(K, V)> {
        let tick = self.bump();
        let expires_at = if self.ttl.is_zero() {
            None
        } else {
            Some(Instant::now() + self.ttl)
        };

        if let Some(previous) = self.entries.insert(
            key.clone(),
            Slot {
                value,
                expires_at,
                tick,
            },
        ) {
            self.recency.remove(&previous.tick);
        }
        self.recency.insert(tick, key);

        let mut evicted = None;
        while self.entries.len() > self.max_entries {
            let Some((_, oldest)) = self.recency.pop_first() else {
                break;
            };
            if let Some(slot) = self.entries.remove(&oldest) {
                evicted = Some((oldest, slot.value));
            }
        }
        evicted
    }

    /// Remove an entry, returning its value when present (expired or not).
    pub fn delete<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let slot = self.entries.remove(key)?;
        self.recency.remove(&slot.tick);
        Some(slot.value)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.recency.clear();
    }

    /// Drop every expired entry and return how many were removed.
    pub fn purge_expired(&mut self) -> usize {
        let now = Instant::now();
        let expired: Vec<u64> = self
            .entries
            .values()
            .filter(|slot| slot.is_expired(now))
            .map(|slot| slot.tick)
            .collect();

        for tick in &expired {
            if let Some(key) = self.recency.remove(tick) {
                self.entries.remove(&key);
            }
        }
        expired.len()
    }

    /// Keys from least to most recently used.
    pub fn keys_by_recency(&self) -> impl Iterator<Item = &K> {
        self.recency.values()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
