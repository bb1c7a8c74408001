//! Tiered Cache Manager - Read-Through / Write-Through Hierarchy
//!
//! Orchestrates the volatile, compact and bulk tiers. Reads check the tiers
//! fastest first and promote durable hits into the volatile tier; writes
//! compress by policy, route by stored size, and always populate the
//! volatile tier with the plain payload.
//!
//! The manager only talks to tiers through [`TierStore`].
//!
//! The schema marker lives beside the tiers, not in them: it has no TTL,
//! is never evicted or swept, and survives [`TieredCacheManager::clear`].

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::instrument;

use super::bulk::{BulkConfig, BulkTier, FsBulkBackend, InMemoryBulkBackend};
use super::clock::SharedClock;
use super::compact::{CompactConfig, CompactTier, FileKvBackend, MemoryKvBackend};
use super::compression::{CompressionManager, CompressionStats};
use super::entry::{CacheEntry, ContentType};
use super::metrics::{CacheMetrics, LatencyTracker, MetricsSnapshot};
use super::policy::{CompressionPolicy, Freshness, TtlPolicy};
use super::tier::{TierCapacity, TierKind, TierStats, TierStore};
use super::volatile::{VolatileConfig, VolatileTier};
use crate::error::Result;

/// Bulk utilization above which storage counts as critically low
pub const STORAGE_CRITICAL_UTILIZATION: f64 = 0.95;

/// Default quota of the compact tier's backing medium (10MB)
pub const DEFAULT_COMPACT_QUOTA: u64 = 10 * 1024 * 1024;

/// File under the data directory holding the schema marker
pub const SCHEMA_MARKER_FILE: &str = "schema_version";

/// Cache manager configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerConfig {
    /// TTL per content type
    pub ttl: TtlPolicy,
    /// Compression thresholds
    pub compression: CompressionPolicy,
    /// Volatile tier limits
    pub volatile: VolatileConfig,
    /// Compact tier limits (its per-item ceiling also drives routing)
    pub compact: CompactConfig,
    /// Quota of the compact tier's backing medium
    pub compact_quota_bytes: u64,
    /// Bulk tier limits
    pub bulk: BulkConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            ttl: TtlPolicy::default(),
            compression: CompressionPolicy::default(),
            volatile: VolatileConfig::default(),
            compact: CompactConfig::default(),
            compact_quota_bytes: DEFAULT_COMPACT_QUOTA,
            bulk: BulkConfig::default(),
        }
    }
}

/// Capacities of all three tiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TierCapacities {
    pub volatile: TierCapacity,
    pub compact: TierCapacity,
    pub bulk: TierCapacity,
}

impl TierCapacities {
    /// Capacity of one tier
    pub fn get(&self, tier: TierKind) -> TierCapacity {
        match tier {
            TierKind::Volatile => self.volatile,
            TierKind::Compact => self.compact,
            TierKind::Bulk => self.bulk,
        }
    }

    /// Scale every tier by `factor`
    pub fn scaled(&self, factor: f64) -> Self {
        Self {
            volatile: self.volatile.scaled(factor),
            compact: self.compact.scaled(factor),
            bulk: self.bulk.scaled(factor),
        }
    }
}

/// Where a write landed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WriteOutcome {
    /// Volatile tier holds the plain payload
    pub volatile: bool,
    /// Durable tier that holds the stored payload
    pub durable: Option<TierKind>,
    /// Stored payload went through the schema codec
    pub compressed: bool,
    /// Stored (possibly compressed) size
    pub stored_bytes: u64,
}

impl WriteOutcome {
    /// True when any tier holds the entry
    pub fn is_stored(&self) -> bool {
        self.volatile || self.durable.is_some()
    }

    /// True when a durable tier holds the entry
    pub fn is_durable(&self) -> bool {
        self.durable.is_some()
    }
}

/// Manager statistics
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStats {
    /// Per-tier stats, fastest first
    pub tiers: Vec<TierStats>,
    /// Manager counters
    pub metrics: MetricsSnapshot,
    /// Compression counters
    pub compression: CompressionStats,
}

impl ManagerStats {
    /// Stats of one tier
    pub fn tier(&self, kind: TierKind) -> Option<&TierStats> {
        self.tiers.iter().find(|t| t.tier == kind)
    }
}

/// Unified cache manager
pub struct TieredCacheManager {
    volatile: Arc<dyn TierStore>,
    compact: Arc<dyn TierStore>,
    bulk: Arc<dyn TierStore>,
    /// Stored sizes at or above this go straight to the bulk tier
    compact_ceiling: u64,
    freshness: Freshness,
    compression: CompressionManager,
    metrics: CacheMetrics,
    schema_marker: RwLock<Option<String>>,
    marker_path: Option<PathBuf>,
}

impl TieredCacheManager {
    /// Assemble a manager over existing tiers
    pub fn new(
        volatile: Arc<dyn TierStore>,
        compact: Arc<dyn TierStore>,
        bulk: Arc<dyn TierStore>,
        config: &ManagerConfig,
        freshness: Freshness,
    ) -> Self {
        Self {
            volatile,
            compact,
            bulk,
            compact_ceiling: config.compact.max_item_bytes,
            freshness,
            compression: CompressionManager::with_policy(config.compression),
            metrics: CacheMetrics::new(),
            schema_marker: RwLock::new(None),
            marker_path: None,
        }
    }

    /// Persist the schema marker in `path`, loading any marker already there
    pub async fn with_marker_file(mut self, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        match tokio::fs::read_to_string(&path).await {
            Ok(raw) if !raw.trim().is_empty() => {
                *self.schema_marker.get_mut() = Some(raw.trim().to_string());
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %path.display(), "Failed to read schema marker: {}", e);
            }
        }
        self.marker_path = Some(path);
        self
    }

    /// Manager with in-memory durable media
    pub async fn in_memory(config: ManagerConfig, clock: SharedClock) -> Self {
        let freshness = Freshness::new(config.ttl, clock);
        let compact = CompactTier::open(
            Arc::new(MemoryKvBackend::with_quota(config.compact_quota_bytes)),
            config.compact,
            freshness.clone(),
        );
        let bulk = BulkTier::open(
            Arc::new(InMemoryBulkBackend::new()),
            config.bulk,
            freshness.clone(),
        )
        .await;
        Self::assemble(config, freshness, compact, bulk)
    }

    /// Manager persisting under `dir` (`compact/` and `bulk/` subdirectories)
    pub async fn open_dir(dir: &Path, config: ManagerConfig, clock: SharedClock) -> Self {
        let freshness = Freshness::new(config.ttl, clock);
        let compact = CompactTier::open(
            Arc::new(FileKvBackend::new(dir.join("compact"), config.compact_quota_bytes)),
            config.compact,
            freshness.clone(),
        );
        let bulk = BulkTier::open(
            Arc::new(FsBulkBackend::new(dir.join("bulk"))),
            config.bulk,
            freshness.clone(),
        )
        .await;
        tracing::info!(
            dir = %dir.display(),
            compact = compact.is_enabled(),
            bulk = bulk.is_enabled(),
            "Opened durable cache tiers"
        );
        Self::assemble(config, freshness, compact, bulk)
            .with_marker_file(dir.join(SCHEMA_MARKER_FILE))
            .await
    }

    fn assemble(
        config: ManagerConfig,
        freshness: Freshness,
        compact: CompactTier,
        bulk: BulkTier,
    ) -> Self {
        let volatile = VolatileTier::with_config(config.volatile, freshness.clone());
        Self::new(
            Arc::new(volatile),
            Arc::new(compact),
            Arc::new(bulk),
            &config,
            freshness,
        )
    }

    /// Tier handle
    pub fn tier(&self, kind: TierKind) -> &Arc<dyn TierStore> {
        match kind {
            TierKind::Volatile => &self.volatile,
            TierKind::Compact => &self.compact,
            TierKind::Bulk => &self.bulk,
        }
    }

    fn tiers(&self) -> [&Arc<dyn TierStore>; 3] {
        [&self.volatile, &self.compact, &self.bulk]
    }

    /// Staleness rule and clock
    pub fn freshness(&self) -> &Freshness {
        &self.freshness
    }

    /// Current time according to the manager's clock
    pub fn now_ms(&self) -> u64 {
        self.freshness.now_ms()
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Get the plain payload for `key`
    pub async fn get_raw(&self, key: &str, content_type: ContentType) -> Option<String> {
        let tracker = LatencyTracker::start();
        let result = self.lookup(key, content_type).await;
        self.metrics.record_get_latency(tracker.elapsed());
        result.map(|entry| entry.payload)
    }

    /// Get and deserialize the value for `key`
    ///
    /// A value that does not deserialize is removed from every tier and the
    /// read is a miss.
    pub async fn get<T: DeserializeOwned>(&self, key: &str, content_type: ContentType) -> Option<T> {
        let raw = self.get_raw(key, content_type).await?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(key = %key, "Dropping undecodable cache entry: {}", e);
                self.metrics.record_corrupt();
                self.delete(key).await;
                None
            }
        }
    }

    /// Whether a fresh copy exists in any tier (not counted as an access)
    pub async fn has(&self, key: &str) -> bool {
        for tier in self.tiers() {
            if tier.has(key).await {
                return true;
            }
        }
        false
    }

    async fn lookup(&self, key: &str, content_type: ContentType) -> Option<CacheEntry> {
        if let Some(entry) = self.volatile.get(key, content_type).await {
            self.metrics.record_hit(TierKind::Volatile);
            return Some(entry);
        }

        for tier in [&self.compact, &self.bulk] {
            let Some(entry) = tier.get(key, content_type).await else {
                continue;
            };
            let kind = tier.kind();
            let meta = entry.meta();

            let plain = match self.compression.decompress(key, entry.payload, entry.compressed) {
                Ok(plain) => plain,
                Err(e) => {
                    tracing::warn!(tier = %kind, "Dropping corrupt cache entry: {}", e);
                    self.metrics.record_corrupt();
                    tier.delete(key).await;
                    continue;
                }
            };

            self.metrics.record_hit(kind);
            let mut promoted = CacheEntry::from_parts(key, meta, plain);
            promoted.compressed = false;
            if self.volatile.set(promoted.clone()).await {
                self.metrics.record_promotion();
                tracing::debug!(key = %key, from = %kind, "Promoted entry to volatile tier");
            }
            return Some(promoted);
        }

        self.metrics.record_miss();
        None
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Serialize and store `value`
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        content_type: ContentType,
    ) -> Result<WriteOutcome> {
        let plain = serde_json::to_string(value)?;
        Ok(self.set_raw(key, plain, content_type).await)
    }

    /// Store an already-serialized payload
    pub async fn set_raw(&self, key: &str, plain: String, content_type: ContentType) -> WriteOutcome {
        let tracker = LatencyTracker::start();
        self.metrics.record_write();
        let now = self.freshness.now_ms();

        let (stored, compressed) = self.compression.compress(content_type, &plain);
        let durable_entry = CacheEntry::new(key, stored, content_type, compressed, now);
        let stored_bytes = durable_entry.size();

        let mut durable = None;
        if stored_bytes < self.compact_ceiling {
            if self.compact.set(durable_entry.clone()).await {
                durable = Some(TierKind::Compact);
            } else {
                self.metrics.record_compact_redirect();
                tracing::debug!(key = %key, "Compact tier rejected write, redirecting to bulk");
            }
        }
        if durable.is_none() && self.bulk.set(durable_entry).await {
            durable = Some(TierKind::Bulk);
        }

        match durable {
            Some(TierKind::Compact) => {
                self.bulk.delete(key).await;
            }
            Some(TierKind::Bulk) => {
                self.compact.delete(key).await;
            }
            _ => {
                // no older durable copy may outlive this write
                self.compact.delete(key).await;
                self.bulk.delete(key).await;
                self.metrics.record_durable_failure();
                tracing::warn!(key = %key, size = stored_bytes, "No durable tier accepted write");
            }
        }
        if let Some(tier) = durable {
            self.metrics.record_tier_write(tier);
        }

        let volatile = self
            .volatile
            .set(CacheEntry::new(key, plain, content_type, false, now))
            .await;
        if volatile {
            self.metrics.record_tier_write(TierKind::Volatile);
        } else {
            self.volatile.delete(key).await;
        }

        self.metrics.record_set_latency(tracker.elapsed());
        WriteOutcome {
            volatile,
            durable,
            compressed,
            stored_bytes,
        }
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Delete `key` from every tier
    pub async fn delete(&self, key: &str) -> bool {
        let mut deleted = false;
        for tier in self.tiers() {
            deleted |= tier.delete(key).await;
        }
        deleted
    }

    /// Delete every key starting with `prefix`; returns the distinct keys removed
    pub async fn invalidate_prefix(&self, prefix: &str) -> usize {
        let mut matching = BTreeSet::new();
        for tier in self.tiers() {
            matching.extend(tier.keys().await.into_iter().filter(|k| k.starts_with(prefix)));
        }
        for key in &matching {
            self.delete(key).await;
        }
        if !matching.is_empty() {
            tracing::debug!(prefix = %prefix, removed = matching.len(), "Invalidated keys by prefix");
        }
        matching.len()
    }

    /// Schema version of the cached data, if one was recorded
    pub fn schema_marker(&self) -> Option<String> {
        self.schema_marker.read().clone()
    }

    /// Record the schema version of the cached data
    pub async fn set_schema_marker(&self, version: &str) -> Result<()> {
        if let Some(path) = &self.marker_path {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(path, version).await?;
        }
        *self.schema_marker.write() = Some(version.to_string());
        Ok(())
    }

    /// Entries held across every tier, stale ones included
    pub fn entry_count(&self) -> usize {
        self.tiers().iter().map(|t| t.stats().entries).sum()
    }

    /// Empty every tier (the schema marker is kept)
    pub async fn clear(&self) {
        for tier in self.tiers() {
            tier.clear().await;
        }
        tracing::info!("Cleared all cache tiers");
    }

    /// Run every tier's TTL sweep; returns the total removed
    #[instrument(skip(self))]
    pub async fn sweep_expired(&self) -> usize {
        let mut removed = 0;
        for tier in self.tiers() {
            removed += tier.sweep_expired().await;
        }
        if removed > 0 {
            tracing::info!(removed, "Swept expired cache entries");
        }
        removed
    }

    /// Resize every tier at runtime
    pub async fn apply_capacities(&self, capacities: TierCapacities) {
        for tier in self.tiers() {
            tier.resize(capacities.get(tier.kind())).await;
        }
        tracing::info!(
            volatile_bytes = capacities.volatile.max_bytes,
            compact_bytes = capacities.compact.max_bytes,
            bulk_bytes = capacities.bulk.max_bytes,
            "Applied tier capacities"
        );
    }

    /// Current capacities
    pub fn capacities(&self) -> TierCapacities {
        TierCapacities {
            volatile: self.volatile.stats().capacity,
            compact: self.compact.stats().capacity,
            bulk: self.bulk.stats().capacity,
        }
    }

    /// All durable tiers disabled, or the bulk tier nearly full
    pub fn storage_critical(&self) -> bool {
        if !self.compact.is_enabled() && !self.bulk.is_enabled() {
            return true;
        }
        let bulk = self.bulk.stats();
        bulk.enabled && bulk.utilization() > STORAGE_CRITICAL_UTILIZATION
    }

    /// Per-tier and manager statistics
    pub fn stats(&self) -> ManagerStats {
        ManagerStats {
            tiers: self.tiers().iter().map(|t| t.stats()).collect(),
            metrics: self.metrics.snapshot(),
            compression: self.compression.stats(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::clock::{Clock, ManualClock};
    use serde_json::json;
    use std::time::Duration;

    struct Fixture {
        manager: TieredCacheManager,
        clock: Arc<ManualClock>,
        kv: Arc<MemoryKvBackend>,
    }

    async fn fixture(config: ManagerConfig) -> Fixture {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let freshness = Freshness::new(config.ttl, clock.clone());
        let kv = Arc::new(MemoryKvBackend::new());
        let compact = CompactTier::open(kv.clone(), config.compact, freshness.clone());
        let bulk = BulkTier::open(
            Arc::new(InMemoryBulkBackend::new()),
            config.bulk,
            freshness.clone(),
        )
        .await;
        let volatile = VolatileTier::with_config(config.volatile, freshness.clone());
        let manager = TieredCacheManager::new(
            Arc::new(volatile),
            Arc::new(compact),
            Arc::new(bulk),
            &config,
            freshness,
        );
        Fixture { manager, clock, kv }
    }

    fn channels(n: usize) -> serde_json::Value {
        let list: Vec<_> = (0..n)
            .map(|i| {
                json!({
                    "id": format!("ch{i}"),
                    "name": format!("Channel {i}"),
                    "url": format!("http://cdn.example.tv/live/user/pass/{i}.ts"),
                    "group": "News",
                })
            })
            .collect();
        json!(list)
    }

    #[tokio::test]
    async fn test_set_routes_small_entry_to_compact() {
        let f = fixture(ManagerConfig::default()).await;
        let outcome = f.manager.set("cat:meta", &json!({"a": 1}), ContentType::Metadata).await.unwrap();

        assert!(outcome.is_stored());
        assert!(outcome.volatile);
        assert_eq!(outcome.durable, Some(TierKind::Compact));
        assert!(!outcome.compressed);

        let value: serde_json::Value = f.manager.get("cat:meta", ContentType::Metadata).await.unwrap();
        assert_eq!(value, json!({"a": 1}));
        assert_eq!(f.manager.stats().metrics.volatile_hits, 1);
    }

    #[tokio::test]
    async fn test_large_payload_compressed_and_restored() {
        let f = fixture(ManagerConfig::default()).await;
        let value = channels(50);
        let outcome = f.manager.set("cat:chunk_0", &value, ContentType::Channels).await.unwrap();
        assert!(outcome.compressed);
        assert!(outcome.stored_bytes < serde_json::to_string(&value).unwrap().len() as u64);

        // durable path decompresses
        f.manager.tier(TierKind::Volatile).clear().await;
        let back: serde_json::Value = f.manager.get("cat:chunk_0", ContentType::Channels).await.unwrap();
        assert_eq!(back, value);
    }

    #[tokio::test]
    async fn test_durable_hit_promotes_with_original_timestamp() {
        let f = fixture(ManagerConfig::default()).await;
        f.manager.set("k", &json!([1, 2, 3]), ContentType::Channels).await.unwrap();
        let created = f.clock.now_ms();
        f.manager.tier(TierKind::Volatile).clear().await;

        f.clock.advance(Duration::from_secs(60));
        assert!(f.manager.get_raw("k", ContentType::Channels).await.is_some());

        let stats = f.manager.stats();
        assert_eq!(stats.metrics.compact_hits, 1);
        assert_eq!(stats.metrics.promotions, 1);

        let promoted = f.manager.tier(TierKind::Volatile).get("k", ContentType::Channels).await.unwrap();
        assert_eq!(promoted.created_at, created);
        assert!(!promoted.compressed);
    }

    #[tokio::test]
    async fn test_oversized_goes_to_bulk() {
        let config = ManagerConfig {
            compact: CompactConfig {
                max_item_bytes: 64,
                ..Default::default()
            },
            ..Default::default()
        };
        let f = fixture(config).await;
        let outcome = f
            .manager
            .set_raw("big", "1".repeat(64), ContentType::Epg)
            .await;
        assert_eq!(outcome.durable, Some(TierKind::Bulk));
        assert!(!f.manager.tier(TierKind::Compact).has("big").await);
    }

    #[tokio::test]
    async fn test_compact_rejection_redirects_and_removes_stale_copy() {
        let f = fixture(ManagerConfig::default()).await;
        f.manager.set("k", &json!({"v": 1}), ContentType::Metadata).await.unwrap();
        assert!(f.manager.tier(TierKind::Compact).has("k").await);

        f.kv.set_reject_writes(true);
        let outcome = f.manager.set("k", &json!({"v": 2}), ContentType::Metadata).await.unwrap();
        assert_eq!(outcome.durable, Some(TierKind::Bulk));
        assert!(!f.manager.tier(TierKind::Compact).has("k").await);
        assert_eq!(f.manager.stats().metrics.compact_redirects, 1);

        f.manager.tier(TierKind::Volatile).clear().await;
        let value: serde_json::Value = f.manager.get("k", ContentType::Metadata).await.unwrap();
        assert_eq!(value, json!({"v": 2}));
    }

    #[tokio::test]
    async fn test_ttl_boundary() {
        let f = fixture(ManagerConfig::default()).await;
        f.manager.set("e", &json!([]), ContentType::Epg).await.unwrap();

        f.clock.advance(Duration::from_secs(30 * 60) - Duration::from_millis(1));
        assert!(f.manager.get_raw("e", ContentType::Epg).await.is_some());

        f.clock.advance(Duration::from_millis(2));
        assert!(f.manager.get_raw("e", ContentType::Epg).await.is_none());
        assert!(!f.manager.has("e").await);
    }

    #[tokio::test]
    async fn test_undecodable_value_is_deleted() {
        let f = fixture(ManagerConfig::default()).await;
        f.manager.set("k", &json!("text"), ContentType::Metadata).await.unwrap();

        let value: Option<Vec<u32>> = f.manager.get("k", ContentType::Metadata).await;
        assert!(value.is_none());
        assert!(!f.manager.has("k").await);
        assert_eq!(f.manager.stats().metrics.corrupt_entries, 1);
    }

    #[tokio::test]
    async fn test_corrupt_compressed_entry_is_miss() {
        let f = fixture(ManagerConfig::default()).await;
        let bogus = CacheEntry::new("k", "{\"r\":[1]}".into(), ContentType::Channels, true, f.clock.now_ms());
        assert!(f.manager.tier(TierKind::Compact).set(bogus).await);

        assert!(f.manager.get_raw("k", ContentType::Channels).await.is_none());
        assert!(!f.manager.tier(TierKind::Compact).has("k").await);
        assert_eq!(f.manager.stats().metrics.corrupt_entries, 1);
    }

    #[tokio::test]
    async fn test_invalidate_prefix() {
        let f = fixture(ManagerConfig::default()).await;
        for key in ["a:chunk_0", "a:chunk_1", "a:strategy", "b:chunk_0"] {
            f.manager.set(key, &json!([]), ContentType::Channels).await.unwrap();
        }
        assert_eq!(f.manager.invalidate_prefix("a:").await, 3);
        assert!(f.manager.has("b:chunk_0").await);
        assert!(!f.manager.has("a:strategy").await);
    }

    #[tokio::test]
    async fn test_apply_capacities_and_sweep() {
        let f = fixture(ManagerConfig::default()).await;
        for i in 0..10 {
            f.clock.advance(Duration::from_millis(1));
            f.manager.set(&format!("k{i}"), &json!(i), ContentType::Epg).await.unwrap();
        }
        let mut caps = f.manager.capacities();
        caps.volatile = TierCapacity::new(4, caps.volatile.max_bytes);
        f.manager.apply_capacities(caps).await;
        assert_eq!(f.manager.stats().tier(TierKind::Volatile).unwrap().entries, 4);

        f.clock.advance(Duration::from_secs(31 * 60));
        // volatile copies + compact copies
        assert_eq!(f.manager.sweep_expired().await, 14);
    }

    #[tokio::test]
    async fn test_schema_marker_is_outside_the_tiers() {
        let f = fixture(ManagerConfig::default()).await;
        assert_eq!(f.manager.schema_marker(), None);
        f.manager.set_schema_marker("2.0").await.unwrap();
        f.manager.set("k", &json!(1), ContentType::Metadata).await.unwrap();
        assert_eq!(f.manager.entry_count(), 2);

        f.clock.advance(Duration::from_secs(7 * 60 * 60));
        f.manager.sweep_expired().await;
        assert_eq!(f.manager.entry_count(), 0);
        assert_eq!(f.manager.schema_marker().as_deref(), Some("2.0"));

        f.manager.clear().await;
        assert_eq!(f.manager.schema_marker().as_deref(), Some("2.0"));
        assert_eq!(f.kv.used_bytes(), 0);
    }

    #[tokio::test]
    async fn test_storage_critical_when_durable_disabled() {
        let clock: SharedClock = Arc::new(ManualClock::new(0));
        let config = ManagerConfig::default();
        let freshness = Freshness::new(config.ttl, clock);
        let manager = TieredCacheManager::new(
            Arc::new(VolatileTier::new(freshness.clone())),
            Arc::new(CompactTier::disabled(config.compact, freshness.clone())),
            Arc::new(BulkTier::disabled(config.bulk, freshness.clone())),
            &config,
            freshness,
        );
        assert!(manager.storage_critical());

        let outcome = manager.set("k", &json!(1), ContentType::Channels).await.unwrap();
        assert!(outcome.is_stored());
        assert!(!outcome.is_durable());
        assert_eq!(manager.stats().metrics.durable_write_failures, 1);
    }
}
