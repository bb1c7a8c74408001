//! Fast Volatile Tier - In-Process LRU
//!
//! Bounded by entry count and byte budget, strict LRU eviction, no
//! persistence.
//!
//! # Design
//!
//! - `HashMap` for O(1) lookup plus a `BTreeMap` keyed by a monotonic access
//!   tick, so the least recently used entry is always `first_key_value()`
//! - A single `parking_lot::Mutex`; every operation is a short critical
//!   section with no I/O
//! - Evicts one entry at a time until the new entry fits

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::entry::{CacheEntry, ContentType};
use super::policy::Freshness;
use super::tier::{TierCapacity, TierCounters, TierKind, TierStats, TierStore};

/// Default entry limit
pub const DEFAULT_VOLATILE_ENTRIES: usize = 1_000;

/// Default byte budget (4MB)
pub const DEFAULT_VOLATILE_BYTES: u64 = 4 * 1024 * 1024;

/// Volatile tier configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolatileConfig {
    /// Maximum number of entries
    pub max_entries: usize,
    /// Maximum total payload bytes
    pub max_bytes: u64,
}

impl Default for VolatileConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_VOLATILE_ENTRIES,
            max_bytes: DEFAULT_VOLATILE_BYTES,
        }
    }
}

impl From<VolatileConfig> for TierCapacity {
    fn from(config: VolatileConfig) -> Self {
        TierCapacity::new(config.max_entries, config.max_bytes)
    }
}

struct Slot {
    entry: CacheEntry,
    tick: u64,
}

struct LruState {
    slots: HashMap<String, Slot>,
    order: BTreeMap<u64, String>,
    next_tick: u64,
    total_bytes: u64,
    capacity: TierCapacity,
}

impl LruState {
    fn touch(&mut self, key: &str) {
        let tick = self.next_tick;
        self.next_tick += 1;
        if let Some(slot) = self.slots.get_mut(key) {
            self.order.remove(&slot.tick);
            slot.tick = tick;
            self.order.insert(tick, key.to_string());
        }
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let slot = self.slots.remove(key)?;
        self.order.remove(&slot.tick);
        self.total_bytes -= slot.entry.size();
        Some(slot.entry)
    }

    fn insert(&mut self, entry: CacheEntry) {
        let tick = self.next_tick;
        self.next_tick += 1;
        self.total_bytes += entry.size();
        self.order.insert(tick, entry.key.clone());
        self.slots.insert(entry.key.clone(), Slot { entry, tick });
    }

    /// Evict the least recently used entry
    fn evict_one(&mut self) -> Option<String> {
        let (_, key) = self.order.pop_first()?;
        if let Some(slot) = self.slots.remove(&key) {
            self.total_bytes -= slot.entry.size();
        }
        Some(key)
    }

    /// Evict until one more entry of `size` bytes fits; returns evicted count
    fn make_room(&mut self, size: u64) -> u64 {
        let mut evicted = 0;
        while self
            .capacity
            .would_breach(self.slots.len(), self.total_bytes, size)
        {
            match self.evict_one() {
                Some(key) => {
                    tracing::debug!(key = %key, "Volatile tier evicted LRU entry");
                    evicted += 1;
                }
                None => break,
            }
        }
        evicted
    }

    /// Evict until within limits (after a resize)
    fn shrink(&mut self) -> u64 {
        let mut evicted = 0;
        while self.slots.len() > self.capacity.max_entries
            || self.total_bytes > self.capacity.max_bytes
        {
            if self.evict_one().is_none() {
                break;
            }
            evicted += 1;
        }
        evicted
    }
}

/// Fast volatile tier
pub struct VolatileTier {
    state: Mutex<LruState>,
    freshness: Freshness,
    counters: TierCounters,
}

impl VolatileTier {
    /// Create a volatile tier with default capacity
    pub fn new(freshness: Freshness) -> Self {
        Self::with_config(VolatileConfig::default(), freshness)
    }

    /// Create a volatile tier with custom capacity
    pub fn with_config(config: VolatileConfig, freshness: Freshness) -> Self {
        Self {
            state: Mutex::new(LruState {
                slots: HashMap::new(),
                order: BTreeMap::new(),
                next_tick: 0,
                total_bytes: 0,
                capacity: config.into(),
            }),
            freshness,
            counters: TierCounters::default(),
        }
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.state.lock().slots.len()
    }

    /// Check if the tier is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current size in bytes
    pub fn size(&self) -> u64 {
        self.state.lock().total_bytes
    }

    /// Key that would be evicted next
    pub fn lru_key(&self) -> Option<String> {
        self.state
            .lock()
            .order
            .first_key_value()
            .map(|(_, k)| k.clone())
    }

    fn get_sync(&self, key: &str, content_type: ContentType) -> Option<CacheEntry> {
        let now = self.freshness.now_ms();
        let mut state = self.state.lock();

        let Some(slot) = state.slots.get_mut(key) else {
            self.counters.miss();
            return None;
        };

        if self
            .freshness
            .is_stale(slot.entry.created_at, content_type, now)
        {
            state.remove(key);
            self.counters.expired(1);
            self.counters.miss();
            return None;
        }

        slot.entry.record_access(now);
        let entry = slot.entry.clone();
        state.touch(key);
        self.counters.hit();
        Some(entry)
    }

    fn set_sync(&self, entry: CacheEntry) -> bool {
        let mut state = self.state.lock();
        let size = entry.size();

        if state.capacity.max_entries == 0 || size > state.capacity.max_bytes {
            tracing::debug!(
                key = %entry.key,
                size,
                "Entry larger than volatile budget, not cached"
            );
            return false;
        }

        state.remove(&entry.key);
        let evicted = state.make_room(size);
        self.counters.evicted(evicted);
        state.insert(entry);
        true
    }

    fn sweep_sync(&self) -> usize {
        let now = self.freshness.now_ms();
        let mut state = self.state.lock();
        let stale: Vec<String> = state
            .slots
            .iter()
            .filter(|(_, s)| {
                self.freshness
                    .is_stale(s.entry.created_at, s.entry.content_type, now)
            })
            .map(|(k, _)| k.clone())
            .collect();
        for key in &stale {
            state.remove(key);
        }
        self.counters.expired(stale.len() as u64);
        stale.len()
    }
}

#[async_trait]
impl TierStore for VolatileTier {
    fn kind(&self) -> TierKind {
        TierKind::Volatile
    }

    fn is_enabled(&self) -> bool {
        true
    }

    async fn get(&self, key: &str, content_type: ContentType) -> Option<CacheEntry> {
        self.get_sync(key, content_type)
    }

    async fn set(&self, entry: CacheEntry) -> bool {
        self.set_sync(entry)
    }

    async fn delete(&self, key: &str) -> bool {
        self.state.lock().remove(key).is_some()
    }

    async fn has(&self, key: &str) -> bool {
        let now = self.freshness.now_ms();
        let state = self.state.lock();
        state.slots.get(key).is_some_and(|s| {
            !self
                .freshness
                .is_stale(s.entry.created_at, s.entry.content_type, now)
        })
    }

    async fn keys(&self) -> Vec<String> {
        self.state.lock().slots.keys().cloned().collect()
    }

    async fn sweep_expired(&self) -> usize {
        self.sweep_sync()
    }

    async fn resize(&self, capacity: TierCapacity) {
        let mut state = self.state.lock();
        state.capacity = capacity;
        let evicted = state.shrink();
        self.counters.evicted(evicted);
    }

    async fn clear(&self) {
        let mut state = self.state.lock();
        state.slots.clear();
        state.order.clear();
        state.total_bytes = 0;
    }

    fn stats(&self) -> TierStats {
        let state = self.state.lock();
        self.counters.stats(
            TierKind::Volatile,
            true,
            state.slots.len(),
            state.total_bytes,
            state.capacity,
        )
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::clock::{Clock, ManualClock};
    use crate::cache::policy::{TtlPolicy, DEFAULT_CHANNELS_TTL};
    use std::sync::Arc;
    use std::time::Duration;

    fn make_tier(max_entries: usize, max_bytes: u64) -> (VolatileTier, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let freshness = Freshness::new(TtlPolicy::default(), clock.clone());
        let tier = VolatileTier::with_config(
            VolatileConfig {
                max_entries,
                max_bytes,
            },
            freshness,
        );
        (tier, clock)
    }

    fn make_entry(key: &str, payload: &str, now: u64) -> CacheEntry {
        CacheEntry::new(key, payload.to_string(), ContentType::Channels, false, now)
    }

    #[tokio::test]
    async fn test_put_get() {
        let (tier, clock) = make_tier(10, 1024);
        assert!(tier.set(make_entry("a", "[1]", clock.now_ms())).await);

        let entry = tier.get("a", ContentType::Channels).await.unwrap();
        assert_eq!(entry.payload, "[1]");
        assert_eq!(entry.access_count, 1);
        assert!(tier.get("missing", ContentType::Channels).await.is_none());

        let stats = tier.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.total_bytes, 3);
    }

    #[tokio::test]
    async fn test_lru_evicts_exactly_least_recent() {
        let (tier, clock) = make_tier(3, 1024);
        for key in ["a", "b", "c"] {
            assert!(tier.set(make_entry(key, "x", clock.now_ms())).await);
        }

        tier.set(make_entry("d", "x", clock.now_ms())).await;
        assert!(!tier.has("a").await);
        assert!(tier.has("b").await && tier.has("c").await && tier.has("d").await);
        assert_eq!(tier.stats().evictions, 1);
    }

    #[tokio::test]
    async fn test_access_protects_from_eviction() {
        let (tier, clock) = make_tier(3, 1024);
        for key in ["a", "b", "c"] {
            tier.set(make_entry(key, "x", clock.now_ms())).await;
        }

        // refresh "a"; "b" becomes the LRU entry
        assert!(tier.get("a", ContentType::Channels).await.is_some());
        assert_eq!(tier.lru_key().as_deref(), Some("b"));

        tier.set(make_entry("d", "x", clock.now_ms())).await;
        assert!(tier.has("a").await);
        assert!(!tier.has("b").await);
    }

    #[tokio::test]
    async fn test_byte_budget_eviction() {
        let (tier, clock) = make_tier(100, 10);
        tier.set(make_entry("a", "1234", clock.now_ms())).await;
        tier.set(make_entry("b", "1234", clock.now_ms())).await;
        tier.set(make_entry("c", "1234", clock.now_ms())).await;

        assert!(!tier.has("a").await);
        assert_eq!(tier.size(), 8);
        assert_eq!(tier.len(), 2);
    }

    #[tokio::test]
    async fn test_oversized_entry_rejected_without_eviction() {
        let (tier, clock) = make_tier(10, 8);
        tier.set(make_entry("a", "1234", clock.now_ms())).await;
        assert!(!tier.set(make_entry("big", "123456789", clock.now_ms())).await);
        assert!(tier.has("a").await);
    }

    #[tokio::test]
    async fn test_replace_keeps_running_total() {
        let (tier, clock) = make_tier(10, 1024);
        tier.set(make_entry("a", "1234", clock.now_ms())).await;
        tier.set(make_entry("a", "12", clock.now_ms())).await;
        assert_eq!(tier.size(), 2);
        assert_eq!(tier.len(), 1);
        assert!(tier.delete("a").await);
        assert_eq!(tier.size(), 0);
        assert!(!tier.delete("a").await);
    }

    #[tokio::test]
    async fn test_ttl_boundary() {
        let (tier, clock) = make_tier(10, 1024);
        let created = clock.now_ms();
        tier.set(make_entry("a", "x", created)).await;

        let ttl = DEFAULT_CHANNELS_TTL.as_millis() as u64;
        clock.set(created + ttl - 1);
        assert!(tier.get("a", ContentType::Channels).await.is_some());

        clock.set(created + ttl + 1);
        assert!(tier.get("a", ContentType::Channels).await.is_none());
        assert!(tier.is_empty());
        assert_eq!(tier.stats().expirations, 1);
    }

    #[tokio::test]
    async fn test_sweep_and_resize() {
        let (tier, clock) = make_tier(10, 1024);
        let now = clock.now_ms();
        tier.set(CacheEntry::new("epg", "x".into(), ContentType::Epg, false, now))
            .await;
        tier.set(make_entry("ch1", "x", now)).await;
        tier.set(make_entry("ch2", "x", now)).await;

        clock.advance(Duration::from_secs(31 * 60));
        assert_eq!(tier.sweep_expired().await, 1);
        assert_eq!(tier.len(), 2);

        tier.resize(TierCapacity::new(1, 1024)).await;
        assert_eq!(tier.len(), 1);
        assert!(tier.has("ch2").await);

        tier.clear().await;
        assert!(tier.keys().await.is_empty());
        assert_eq!(tier.size(), 0);
    }
}
