//! Tier Store Contract
//!
//! Every storage tier implements [`TierStore`]. The manager only ever talks
//! to tiers through this trait.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::Serialize;

use super::entry::{CacheEntry, ContentType};

/// Tier identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TierKind {
    /// Fast volatile tier (process memory)
    Volatile,
    /// Durable compact tier (quota-limited key-value store)
    Compact,
    /// Durable bulk tier (async indexed store)
    Bulk,
}

impl TierKind {
    /// Stable lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            TierKind::Volatile => "volatile",
            TierKind::Compact => "compact",
            TierKind::Bulk => "bulk",
        }
    }
}

impl fmt::Display for TierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capacity limits of a tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TierCapacity {
    /// Maximum number of entries
    pub max_entries: usize,
    /// Maximum total payload bytes
    pub max_bytes: u64,
}

impl TierCapacity {
    /// Create a capacity
    pub const fn new(max_entries: usize, max_bytes: u64) -> Self {
        Self {
            max_entries,
            max_bytes,
        }
    }

    /// Whether adding one entry of `size` bytes would breach the limits
    #[inline]
    pub fn would_breach(&self, entries: usize, bytes: u64, size: u64) -> bool {
        entries >= self.max_entries || bytes.saturating_add(size) > self.max_bytes
    }

    /// Scale both limits by `factor`
    pub fn scaled(&self, factor: f64) -> Self {
        Self {
            max_entries: ((self.max_entries as f64) * factor).round() as usize,
            max_bytes: ((self.max_bytes as f64) * factor).round() as u64,
        }
    }
}

/// Tier statistics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TierStats {
    /// Which tier
    pub tier: TierKind,
    /// False when the backing medium was unavailable at construction
    pub enabled: bool,
    /// Live entries
    pub entries: usize,
    /// Sum of live entries' stored sizes
    pub total_bytes: u64,
    /// Configured capacity
    pub capacity: TierCapacity,
    /// Hit count
    pub hits: u64,
    /// Miss count
    pub misses: u64,
    /// Capacity evictions
    pub evictions: u64,
    /// TTL expirations (lazy and swept)
    pub expirations: u64,
}

impl TierStats {
    /// Get hit ratio
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits as f64;
        let total = hits + self.misses as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    /// Byte utilization (0.0 - 1.0)
    pub fn utilization(&self) -> f64 {
        if self.capacity.max_bytes == 0 {
            0.0
        } else {
            self.total_bytes as f64 / self.capacity.max_bytes as f64
        }
    }
}

/// Hit/miss/eviction counters shared by the tier implementations
#[derive(Debug, Default)]
pub(crate) struct TierCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl TierCounters {
    pub(crate) fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn evicted(&self, n: u64) {
        self.evictions.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn expired(&self, n: u64) {
        self.expirations.fetch_add(n, Ordering::Relaxed);
    }

    /// Fill the counter fields of a stats record
    pub(crate) fn stats(
        &self,
        tier: TierKind,
        enabled: bool,
        entries: usize,
        total_bytes: u64,
        capacity: TierCapacity,
    ) -> TierStats {
        TierStats {
            tier,
            enabled,
            entries,
            total_bytes,
            capacity,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
        }
    }
}

/// Common contract of every tier
///
/// Disabled tiers answer every call with a miss or `false`.
#[async_trait]
pub trait TierStore: Send + Sync {
    /// Tier identity
    fn kind(&self) -> TierKind;

    /// False when the backing medium is unavailable
    fn is_enabled(&self) -> bool;

    /// Fetch a fresh entry, deleting it if it outlived the TTL of `content_type`
    async fn get(&self, key: &str, content_type: ContentType) -> Option<CacheEntry>;

    /// Store an entry; `false` when the tier cannot hold it
    async fn set(&self, entry: CacheEntry) -> bool;

    /// Remove an entry; `true` if it existed
    async fn delete(&self, key: &str) -> bool;

    /// Whether a fresh entry exists (does not count as an access)
    async fn has(&self, key: &str) -> bool;

    /// All live keys
    async fn keys(&self) -> Vec<String>;

    /// Delete every stale entry; returns how many were removed
    async fn sweep_expired(&self) -> usize;

    /// Change capacity, evicting immediately if now over the limits
    async fn resize(&self, capacity: TierCapacity);

    /// Remove everything
    async fn clear(&self);

    /// Current statistics
    fn stats(&self) -> TierStats;
}
