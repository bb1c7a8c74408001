//! Cache Metrics Collection
//!
//! Manager-level counters for monitoring cache health. Per-tier hit/miss and
//! eviction counters live in each tier's [`TierStats`](super::tier::TierStats);
//! these record where reads were served from and what the write path did.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

use super::tier::TierKind;

/// EMA smoothing factor (weight of the newest sample)
const LATENCY_ALPHA: f64 = 0.1;

/// Cache metrics collector
#[derive(Debug, Default)]
pub struct CacheMetrics {
    // Where reads were served
    volatile_hits: AtomicU64,
    compact_hits: AtomicU64,
    bulk_hits: AtomicU64,
    misses: AtomicU64,

    // Write path
    writes: AtomicU64,
    volatile_writes: AtomicU64,
    compact_writes: AtomicU64,
    bulk_writes: AtomicU64,
    durable_write_failures: AtomicU64,
    compact_redirects: AtomicU64,

    // Tier movement and damage
    promotions: AtomicU64,
    corrupt_entries: AtomicU64,

    // Operation latencies (microseconds, exponential moving average)
    get_latency_us: AtomicU64,
    set_latency_us: AtomicU64,
}

impl CacheMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self, tier: TierKind) {
        let counter = match tier {
            TierKind::Volatile => &self.volatile_hits,
            TierKind::Compact => &self.compact_hits,
            TierKind::Bulk => &self.bulk_hits,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tier_write(&self, tier: TierKind) {
        let counter = match tier {
            TierKind::Volatile => &self.volatile_writes,
            TierKind::Compact => &self.compact_writes,
            TierKind::Bulk => &self.bulk_writes,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_durable_failure(&self) {
        self.durable_write_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_compact_redirect(&self) {
        self.compact_redirects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_promotion(&self) {
        self.promotions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_corrupt(&self) {
        self.corrupt_entries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hits(&self, tier: TierKind) -> u64 {
        match tier {
            TierKind::Volatile => self.volatile_hits.load(Ordering::Relaxed),
            TierKind::Compact => self.compact_hits.load(Ordering::Relaxed),
            TierKind::Bulk => self.bulk_hits.load(Ordering::Relaxed),
        }
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn promotions(&self) -> u64 {
        self.promotions.load(Ordering::Relaxed)
    }

    pub fn corrupt_entries(&self) -> u64 {
        self.corrupt_entries.load(Ordering::Relaxed)
    }

    // Latency tracking
    pub fn record_get_latency(&self, duration: Duration) {
        Self::update_latency_ema(&self.get_latency_us, duration);
    }

    pub fn record_set_latency(&self, duration: Duration) {
        Self::update_latency_ema(&self.set_latency_us, duration);
    }

    fn update_latency_ema(target: &AtomicU64, duration: Duration) {
        let new_us = duration.as_micros() as u64;

        loop {
            let current = target.load(Ordering::Relaxed);
            let updated = if current == 0 {
                new_us
            } else {
                ((1.0 - LATENCY_ALPHA) * current as f64 + LATENCY_ALPHA * new_us as f64) as u64
            };

            if target
                .compare_exchange_weak(current, updated, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }

    pub fn get_latency(&self) -> Duration {
        Duration::from_micros(self.get_latency_us.load(Ordering::Relaxed))
    }

    pub fn set_latency(&self) -> Duration {
        Duration::from_micros(self.set_latency_us.load(Ordering::Relaxed))
    }

    /// Fraction of reads served by any tier
    pub fn overall_hit_ratio(&self) -> f64 {
        let hits = TIERS.iter().map(|t| self.hits(*t)).sum::<u64>();
        let total = hits + self.misses();

        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    /// Get snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            volatile_hits: self.hits(TierKind::Volatile),
            compact_hits: self.hits(TierKind::Compact),
            bulk_hits: self.hits(TierKind::Bulk),
            misses: self.misses(),
            writes: self.writes.load(Ordering::Relaxed),
            volatile_writes: self.volatile_writes.load(Ordering::Relaxed),
            compact_writes: self.compact_writes.load(Ordering::Relaxed),
            bulk_writes: self.bulk_writes.load(Ordering::Relaxed),
            durable_write_failures: self.durable_write_failures.load(Ordering::Relaxed),
            compact_redirects: self.compact_redirects.load(Ordering::Relaxed),
            promotions: self.promotions(),
            corrupt_entries: self.corrupt_entries(),
            get_latency_us: self.get_latency_us.load(Ordering::Relaxed),
            set_latency_us: self.set_latency_us.load(Ordering::Relaxed),
            overall_hit_ratio: self.overall_hit_ratio(),
        }
    }

    /// Reset all counters
    pub fn reset(&self) {
        for counter in [
            &self.volatile_hits,
            &self.compact_hits,
            &self.bulk_hits,
            &self.misses,
            &self.writes,
            &self.volatile_writes,
            &self.compact_writes,
            &self.bulk_writes,
            &self.durable_write_failures,
            &self.compact_redirects,
            &self.promotions,
            &self.corrupt_entries,
            &self.get_latency_us,
            &self.set_latency_us,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

const TIERS: [TierKind; 3] = [TierKind::Volatile, TierKind::Compact, TierKind::Bulk];

/// Snapshot of the manager counters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub volatile_hits: u64,
    pub compact_hits: u64,
    pub bulk_hits: u64,
    pub misses: u64,

    pub writes: u64,
    pub volatile_writes: u64,
    pub compact_writes: u64,
    pub bulk_writes: u64,
    pub durable_write_failures: u64,
    pub compact_redirects: u64,

    pub promotions: u64,
    pub corrupt_entries: u64,

    pub get_latency_us: u64,
    pub set_latency_us: u64,
    pub overall_hit_ratio: f64,
}

/// Latency tracker helper
pub struct LatencyTracker {
    start: Instant,
}

impl LatencyTracker {
    /// Start tracking latency
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

// =============================================================================
// Tests
// =============================================================================
