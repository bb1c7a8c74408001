//! Durable Compact Tier - Quota-Limited Key-Value Store
//!
//! Small persistent tier over a synchronous, byte-quota-enforced key-value
//! medium.
//!
//! # Design
//!
//! - Entries persist in the tagged wire format; the in-memory index is
//!   rebuilt from the backend on open
//! - Hard per-item ceiling: oversized items fail closed so the caller can
//!   route them to the bulk tier
//! - On a quota rejection, evict `max(5, 30%)` of the least recently
//!   accessed entries and retry exactly once
//! - Access bookkeeping is kept in memory and persisted with the next write
//!   of that entry

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use super::entry::{CacheEntry, ContentType, EntryMeta};
use super::policy::Freshness;
use super::tier::{TierCapacity, TierCounters, TierKind, TierStats, TierStore};
use crate::error::{Error, Result};

/// Per-item ceiling (2MB)
pub const DEFAULT_COMPACT_ITEM_CEILING: u64 = 2 * 1024 * 1024;

/// Default total capacity (5MB)
pub const DEFAULT_COMPACT_BYTES: u64 = 5 * 1024 * 1024;

/// Default entry limit
pub const DEFAULT_COMPACT_ENTRIES: usize = 500;

// =============================================================================
// Backend
// =============================================================================

/// Synchronous key-value medium with a byte quota
///
/// `write` reports [`Error::QuotaExceeded`] when the medium is full.
pub trait KvBackend: Send + Sync {
    /// Check that the medium is usable
    fn verify(&self) -> Result<()>;

    /// Read a value
    fn read(&self, key: &str) -> Result<Option<String>>;

    /// Write a value
    fn write(&self, key: &str, value: &str) -> Result<()>;

    /// Remove a value (missing keys are not an error)
    fn remove(&self, key: &str) -> Result<()>;

    /// All stored keys
    fn keys(&self) -> Result<Vec<String>>;

    /// Remove everything
    fn clear(&self) -> Result<()>;
}

/// In-memory medium with an optional byte quota
///
/// Quota usage counts key and value bytes. Write rejection can be forced to
/// exercise the degradation path.
#[derive(Default)]
pub struct MemoryKvBackend {
    items: RwLock<HashMap<String, String>>,
    quota_bytes: Option<u64>,
    reject_writes: AtomicBool,
    unavailable: bool,
    attempts: Mutex<HashMap<String, u64>>,
}

impl MemoryKvBackend {
    /// Unlimited medium
    pub fn new() -> Self {
        Self::default()
    }

    /// Medium with a byte quota
    pub fn with_quota(quota_bytes: u64) -> Self {
        Self {
            quota_bytes: Some(quota_bytes),
            ..Self::default()
        }
    }

    /// Medium whose check fails
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    /// Force every write to fail with a quota error
    pub fn set_reject_writes(&self, reject: bool) {
        self.reject_writes.store(reject, Ordering::Relaxed);
    }

    /// Number of write attempts seen for `key`
    pub fn write_attempts(&self, key: &str) -> u64 {
        self.attempts.lock().get(key).copied().unwrap_or(0)
    }

    /// Bytes currently used
    pub fn used_bytes(&self) -> u64 {
        self.items
            .read()
            .iter()
            .map(|(k, v)| (k.len() + v.len()) as u64)
            .sum()
    }
}

impl KvBackend for MemoryKvBackend {
    fn verify(&self) -> Result<()> {
        if self.unavailable {
            return Err(Error::unavailable("compact", "medium not present"));
        }
        Ok(())
    }

    fn read(&self, key: &str) -> Result<Option<String>> {
        Ok(self.items.read().get(key).cloned())
    }

    fn write(&self, key: &str, value: &str) -> Result<()> {
        *self.attempts.lock().entry(key.to_string()).or_insert(0) += 1;

        let size = (key.len() + value.len()) as u64;
        if self.reject_writes.load(Ordering::Relaxed) {
            return Err(Error::QuotaExceeded {
                key: key.to_string(),
                size,
            });
        }

        let mut items = self.items.write();
        if let Some(quota) = self.quota_bytes {
            let used: u64 = items
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(k, v)| (k.len() + v.len()) as u64)
                .sum();
            if used + size > quota {
                return Err(Error::QuotaExceeded {
                    key: key.to_string(),
                    size,
                });
            }
        }
        items.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.items.write().remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        Ok(self.items.read().keys().cloned().collect())
    }

    fn clear(&self) -> Result<()> {
        self.items.write().clear();
        Ok(())
    }
}

/// File-per-key medium under one directory
///
/// Keys are percent-encoded into file names. The byte quota is enforced
/// against the sum of file sizes.
pub struct FileKvBackend {
    dir: PathBuf,
    quota_bytes: u64,
}

impl FileKvBackend {
    /// Use `dir` (created on verify) with a byte quota
    pub fn new(dir: impl Into<PathBuf>, quota_bytes: u64) -> Self {
        Self {
            dir: dir.into(),
            quota_bytes,
        }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", urlencoding::encode(key)))
    }

    fn used_bytes_except(&self, skip: &Path) -> Result<u64> {
        let mut used = 0;
        for item in fs::read_dir(&self.dir)? {
            let item = item?;
            if item.path() != skip {
                used += item.metadata()?.len();
            }
        }
        Ok(used)
    }
}

impl KvBackend for FileKvBackend {
    fn verify(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .map_err(|e| Error::unavailable("compact", format!("{}: {}", self.dir.display(), e)))
    }

    fn read(&self, key: &str) -> Result<Option<String>> {
        match fs::read_to_string(self.path_for(key)) {
            Ok(s) => Ok(Some(s)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, key: &str, value: &str) -> Result<()> {
        let path = self.path_for(key);
        let used = self.used_bytes_except(&path)?;
        if used + value.len() as u64 > self.quota_bytes {
            return Err(Error::QuotaExceeded {
                key: key.to_string(),
                size: value.len() as u64,
            });
        }
        fs::write(path, value)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.path_for(key)) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    fn keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for item in fs::read_dir(&self.dir)? {
            let name = item?.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            if let Ok(key) = urlencoding::decode(stem) {
                keys.push(key.into_owned());
            }
        }
        Ok(keys)
    }

    fn clear(&self) -> Result<()> {
        for key in self.keys()? {
            self.remove(&key)?;
        }
        Ok(())
    }
}

// =============================================================================
// Tier
// =============================================================================

/// Compact tier configuration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompactConfig {
    /// Maximum total payload bytes
    pub max_bytes: u64,
    /// Maximum number of entries
    pub max_entries: usize,
    /// Hard per-item ceiling
    pub max_item_bytes: u64,
    /// Fraction of entries evicted after a quota rejection
    pub quota_eviction_fraction: f64,
    /// Minimum entries evicted after a quota rejection
    pub min_quota_evictions: usize,
}

impl Default for CompactConfig {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_COMPACT_BYTES,
            max_entries: DEFAULT_COMPACT_ENTRIES,
            max_item_bytes: DEFAULT_COMPACT_ITEM_CEILING,
            quota_eviction_fraction: 0.30,
            min_quota_evictions: 5,
        }
    }
}

#[derive(Default)]
struct CompactIndex {
    entries: HashMap<String, EntryMeta>,
    total_bytes: u64,
}

impl CompactIndex {
    fn insert(&mut self, key: String, meta: EntryMeta) {
        if let Some(old) = self.entries.insert(key, meta) {
            self.total_bytes -= old.size_bytes;
        }
        self.total_bytes += meta.size_bytes;
    }

    fn remove(&mut self, key: &str) -> Option<EntryMeta> {
        let meta = self.entries.remove(key)?;
        self.total_bytes -= meta.size_bytes;
        Some(meta)
    }

    /// Keys ordered from least to most recently accessed
    fn lru_order(&self) -> Vec<String> {
        let mut keys: Vec<(&String, u64)> = self
            .entries
            .iter()
            .map(|(k, m)| (k, m.last_access_at))
            .collect();
        keys.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(b.0)));
        keys.into_iter().map(|(k, _)| k.clone()).collect()
    }
}

/// Durable compact tier
pub struct CompactTier {
    backend: Option<Arc<dyn KvBackend>>,
    index: Mutex<CompactIndex>,
    config: RwLock<CompactConfig>,
    freshness: Freshness,
    counters: TierCounters,
    quota_retries: AtomicU64,
}

impl CompactTier {
    /// Open the tier over `backend`, rebuilding the index
    ///
    /// A backend that fails verification yields a disabled tier.
    pub fn open(backend: Arc<dyn KvBackend>, config: CompactConfig, freshness: Freshness) -> Self {
        if let Err(e) = backend.verify() {
            tracing::warn!("Compact tier disabled: {}", e);
            return Self::disabled(config, freshness);
        }

        let tier = Self {
            backend: Some(backend),
            index: Mutex::new(CompactIndex::default()),
            config: RwLock::new(config),
            freshness,
            counters: TierCounters::default(),
            quota_retries: AtomicU64::new(0),
        };
        tier.rebuild_index();
        tier
    }

    /// A tier with no medium; every operation is a no-op
    pub fn disabled(config: CompactConfig, freshness: Freshness) -> Self {
        Self {
            backend: None,
            index: Mutex::new(CompactIndex::default()),
            config: RwLock::new(config),
            freshness,
            counters: TierCounters::default(),
            quota_retries: AtomicU64::new(0),
        }
    }

    /// Per-item ceiling
    pub fn max_item_bytes(&self) -> u64 {
        self.config.read().max_item_bytes
    }

    /// Number of evict-and-retry cycles performed
    pub fn quota_retries(&self) -> u64 {
        self.quota_retries.load(Ordering::Relaxed)
    }

    fn rebuild_index(&self) {
        let Some(backend) = &self.backend else { return };
        let keys = match backend.keys() {
            Ok(keys) => keys,
            Err(e) => {
                tracing::warn!("Compact tier could not list entries: {}", e);
                return;
            }
        };

        let mut index = self.index.lock();
        for key in keys {
            let raw = match backend.read(&key) {
                Ok(Some(raw)) => raw,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(key = %key, "Compact tier read failed during rebuild: {}", e);
                    continue;
                }
            };
            match CacheEntry::from_bytes(&key, raw.as_bytes()) {
                Ok(entry) if entry.key == key => index.insert(key, entry.meta()),
                Ok(_) | Err(_) => {
                    tracing::warn!(key = %key, "Dropping corrupt compact entry");
                    if let Err(e) = backend.remove(&key) {
                        tracing::warn!(key = %key, "Failed to remove corrupt compact entry: {}", e);
                    }
                }
            }
        }
        tracing::debug!(entries = index.entries.len(), "Compact tier index rebuilt");
    }

    fn drop_entry(&self, backend: &dyn KvBackend, index: &mut CompactIndex, key: &str) {
        if let Err(e) = backend.remove(key) {
            tracing::warn!(key = %key, "Compact tier remove failed: {}", e);
        }
        index.remove(key);
    }

    /// Evict `n` least recently accessed entries
    fn evict_lru(&self, backend: &dyn KvBackend, index: &mut CompactIndex, n: usize) -> usize {
        let victims: Vec<String> = index.lru_order().into_iter().take(n).collect();
        for key in &victims {
            self.drop_entry(backend, index, key);
        }
        self.counters.evicted(victims.len() as u64);
        victims.len()
    }

    fn get_sync(&self, key: &str, content_type: ContentType) -> Option<CacheEntry> {
        let Some(backend) = self.backend.as_deref() else {
            return None;
        };
        let now = self.freshness.now_ms();
        let mut index = self.index.lock();

        let Some(meta) = index.entries.get(key).copied() else {
            self.counters.miss();
            return None;
        };

        if self.freshness.is_stale(meta.created_at, content_type, now) {
            self.drop_entry(backend, &mut index, key);
            self.counters.expired(1);
            self.counters.miss();
            return None;
        }

        let raw = match backend.read(key) {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                index.remove(key);
                self.counters.miss();
                return None;
            }
            Err(e) => {
                tracing::warn!(key = %key, "Compact tier read failed: {}", e);
                self.counters.miss();
                return None;
            }
        };

        let mut entry = match CacheEntry::from_bytes(key, raw.as_bytes()) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!("{}", e);
                self.drop_entry(backend, &mut index, key);
                self.counters.miss();
                return None;
            }
        };

        entry.last_access_at = meta.last_access_at;
        entry.access_count = meta.access_count;
        entry.record_access(now);
        if let Some(m) = index.entries.get_mut(key) {
            m.record_access(now);
        }
        self.counters.hit();
        Some(entry)
    }

    fn set_sync(&self, entry: CacheEntry) -> bool {
        let Some(backend) = self.backend.as_deref() else {
            return false;
        };
        let config = *self.config.read();
        let size = entry.size();

        if size > config.max_item_bytes {
            tracing::debug!(
                key = %entry.key,
                size,
                ceiling = config.max_item_bytes,
                "Entry exceeds compact per-item ceiling"
            );
            return false;
        }
        if size > config.max_bytes || config.max_entries == 0 {
            return false;
        }

        let raw = match serde_json::to_string(&entry) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(key = %entry.key, "Compact tier serialization failed: {}", e);
                return false;
            }
        };

        let mut index = self.index.lock();
        index.remove(&entry.key);

        let capacity = TierCapacity::new(config.max_entries, config.max_bytes);
        while capacity.would_breach(index.entries.len(), index.total_bytes, size) {
            if self.evict_lru(backend, &mut index, 1) == 0 {
                break;
            }
        }

        match backend.write(&entry.key, &raw) {
            Ok(()) => {}
            Err(e) if e.is_quota_exceeded() => {
                let n = ((index.entries.len() as f64) * config.quota_eviction_fraction).ceil()
                    as usize;
                let n = n.max(config.min_quota_evictions);
                let evicted = self.evict_lru(backend, &mut index, n);
                self.quota_retries.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    key = %entry.key,
                    evicted,
                    "Compact tier quota exceeded, evicted LRU entries and retrying once"
                );

                if let Err(e) = backend.write(&entry.key, &raw) {
                    tracing::warn!(key = %entry.key, "Compact tier write failed after retry: {}", e);
                    return false;
                }
            }
            Err(e) => {
                tracing::warn!(key = %entry.key, "Compact tier write failed: {}", e);
                return false;
            }
        }

        index.insert(entry.key.clone(), entry.meta());
        true
    }

    fn sweep_sync(&self) -> usize {
        let Some(backend) = self.backend.as_deref() else {
            return 0;
        };
        let now = self.freshness.now_ms();
        let candidates: Vec<String> = {
            let index = self.index.lock();
            index
                .entries
                .iter()
                .filter(|(_, m)| self.freshness.is_stale(m.created_at, m.content_type, now))
                .map(|(k, _)| k.clone())
                .collect()
        };

        let mut removed = 0;
        for key in candidates {
            let mut index = self.index.lock();
            // re-validate: a foreground write may have replaced it
            let still_stale = index
                .entries
                .get(&key)
                .is_some_and(|m| self.freshness.is_stale(m.created_at, m.content_type, now));
            if still_stale {
                self.drop_entry(backend, &mut index, &key);
                removed += 1;
            }
        }
        self.counters.expired(removed as u64);
        removed
    }
}

#[async_trait]
impl TierStore for CompactTier {
    fn kind(&self) -> TierKind {
        TierKind::Compact
    }

    fn is_enabled(&self) -> bool {
        self.backend.is_some()
    }

    async fn get(&self, key: &str, content_type: ContentType) -> Option<CacheEntry> {
        self.get_sync(key, content_type)
    }

    async fn set(&self, entry: CacheEntry) -> bool {
        self.set_sync(entry)
    }

    async fn delete(&self, key: &str) -> bool {
        let Some(backend) = self.backend.as_deref() else {
            return false;
        };
        let mut index = self.index.lock();
        let existed = index.entries.contains_key(key);
        if existed {
            self.drop_entry(backend, &mut index, key);
        }
        existed
    }

    async fn has(&self, key: &str) -> bool {
        let now = self.freshness.now_ms();
        self.index
            .lock()
            .entries
            .get(key)
            .is_some_and(|m| !self.freshness.is_stale(m.created_at, m.content_type, now))
    }

    async fn keys(&self) -> Vec<String> {
        self.index.lock().entries.keys().cloned().collect()
    }

    async fn sweep_expired(&self) -> usize {
        self.sweep_sync()
    }

    async fn resize(&self, capacity: TierCapacity) {
        {
            let mut config = self.config.write();
            config.max_entries = capacity.max_entries;
            config.max_bytes = capacity.max_bytes;
        }
        let Some(backend) = self.backend.as_deref() else {
            return;
        };
        let mut index = self.index.lock();
        while index.entries.len() > capacity.max_entries || index.total_bytes > capacity.max_bytes
        {
            if self.evict_lru(backend, &mut index, 1) == 0 {
                break;
            }
        }
    }

    async fn clear(&self) {
        let Some(backend) = self.backend.as_deref() else {
            return;
        };
        let mut index = self.index.lock();
        let keys: Vec<String> = index.entries.keys().cloned().collect();
        for key in keys {
            self.drop_entry(backend, &mut index, &key);
        }
    }

    fn stats(&self) -> TierStats {
        let config = *self.config.read();
        let index = self.index.lock();
        self.counters.stats(
            TierKind::Compact,
            self.backend.is_some(),
            index.entries.len(),
            index.total_bytes,
            TierCapacity::new(config.max_entries, config.max_bytes),
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
    use crate::cache::policy::TtlPolicy;
    use std::time::Duration;

    fn freshness(clock: &Arc<ManualClock>) -> Freshness {
        Freshness::new(TtlPolicy::default(), clock.clone())
    }

    fn make_entry(key: &str, payload: String, now: u64) -> CacheEntry {
        CacheEntry::new(key, payload, ContentType::Channels, false, now)
    }

    fn open(backend: Arc<MemoryKvBackend>, config: CompactConfig) -> (CompactTier, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let tier = CompactTier::open(backend, config, freshness(&clock));
        (tier, clock)
    }

    #[tokio::test]
    async fn test_roundtrip_and_persistence() {
        let backend = Arc::new(MemoryKvBackend::new());
        let (tier, clock) = open(backend.clone(), CompactConfig::default());

        assert!(tier.set(make_entry("a", "[1,2]".into(), clock.now_ms())).await);
        let got = tier.get("a", ContentType::Channels).await.unwrap();
        assert_eq!(got.payload, "[1,2]");
        assert_eq!(got.access_count, 1);

        // a second tier over the same medium sees the entry
        let reopened = CompactTier::open(backend, CompactConfig::default(), freshness(&clock));
        assert!(reopened.has("a").await);
        assert_eq!(reopened.stats().total_bytes, 5);
    }

    #[tokio::test]
    async fn test_per_item_ceiling_fails_closed() {
        let config = CompactConfig {
            max_item_bytes: 16,
            ..Default::default()
        };
        let (tier, clock) = open(Arc::new(MemoryKvBackend::new()), config);
        assert!(!tier.set(make_entry("big", "x".repeat(17), clock.now_ms())).await);
        assert!(tier.set(make_entry("ok", "x".repeat(16), clock.now_ms())).await);
    }

    #[tokio::test]
    async fn test_quota_rejection_single_retry() {
        let backend = Arc::new(MemoryKvBackend::new());
        let (tier, clock) = open(backend.clone(), CompactConfig::default());
        for i in 0..10 {
            clock.advance(Duration::from_millis(1));
            assert!(tier.set(make_entry(&format!("k{i}"), "[0]".into(), clock.now_ms())).await);
        }

        backend.set_reject_writes(true);
        let ok = tier.set(make_entry("new", "[1]".into(), clock.now_ms())).await;

        assert!(!ok);
        assert_eq!(backend.write_attempts("new"), 2);
        assert_eq!(tier.quota_retries(), 1);
        // max(5, ceil(30% of 10)) oldest entries are gone
        let stats = tier.stats();
        assert_eq!(stats.evictions, 5);
        assert_eq!(stats.entries, 5);
        assert!(!tier.has("k0").await);
        assert!(tier.has("k9").await);
    }

    #[tokio::test]
    async fn test_quota_retry_succeeds_after_eviction() {
        let backend = Arc::new(MemoryKvBackend::with_quota(4_000));
        let (tier, clock) = open(backend.clone(), CompactConfig::default());
        for i in 0..6 {
            clock.advance(Duration::from_millis(1));
            assert!(tier.set(make_entry(&format!("k{i}"), "x".repeat(300), clock.now_ms())).await);
        }

        assert!(tier.set(make_entry("big", "y".repeat(1_500), clock.now_ms())).await);
        assert_eq!(backend.write_attempts("big"), 2);
        assert!(tier.has("big").await);
        assert!(tier.has("k5").await);
        assert!(backend.used_bytes() <= 4_000);
    }

    #[tokio::test]
    async fn test_unavailable_medium_disables_tier() {
        let (tier, clock) = open(Arc::new(MemoryKvBackend::unavailable()), CompactConfig::default());
        assert!(!tier.is_enabled());
        assert!(!tier.set(make_entry("a", "1".into(), clock.now_ms())).await);
        assert!(tier.get("a", ContentType::Channels).await.is_none());
        assert!(!tier.stats().enabled);
    }

    #[tokio::test]
    async fn test_corrupt_entry_dropped() {
        let backend = Arc::new(MemoryKvBackend::new());
        let (tier, clock) = open(backend.clone(), CompactConfig::default());
        tier.set(make_entry("a", "[1]".into(), clock.now_ms())).await;

        backend.write("a", "{garbage").unwrap();
        assert!(tier.get("a", ContentType::Channels).await.is_none());
        assert!(!tier.has("a").await);
        assert_eq!(backend.read("a").unwrap(), None);
    }

    /// Medium whose removals always fail
    struct StuckBackend(Arc<MemoryKvBackend>);

    impl KvBackend for StuckBackend {
        fn verify(&self) -> Result<()> {
            self.0.verify()
        }

        fn read(&self, key: &str) -> Result<Option<String>> {
            self.0.read(key)
        }

        fn write(&self, key: &str, value: &str) -> Result<()> {
            self.0.write(key, value)
        }

        fn remove(&self, _key: &str) -> Result<()> {
            Err(Error::Internal("medium is read-only".into()))
        }

        fn keys(&self) -> Result<Vec<String>> {
            self.0.keys()
        }

        fn clear(&self) -> Result<()> {
            self.0.clear()
        }
    }

    #[tokio::test]
    async fn test_rebuild_survives_failed_corrupt_removal() {
        let inner = Arc::new(MemoryKvBackend::new());
        let (tier, clock) = open(inner.clone(), CompactConfig::default());
        tier.set(make_entry("good", "[1]".into(), clock.now_ms())).await;
        inner.write("bad", "{garbage").unwrap();

        let reopened = CompactTier::open(
            Arc::new(StuckBackend(inner.clone())),
            CompactConfig::default(),
            freshness(&clock),
        );
        assert!(reopened.is_enabled());
        assert!(reopened.has("good").await);
        assert!(!reopened.has("bad").await);
        assert_eq!(reopened.stats().entries, 1);
        // removal failed, the record is still on the medium
        assert!(inner.read("bad").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_lazy_expiry_and_sweep() {
        let backend = Arc::new(MemoryKvBackend::new());
        let (tier, clock) = open(backend, CompactConfig::default());
        let now = clock.now_ms();
        tier.set(CacheEntry::new("meta", "{}".into(), ContentType::Metadata, false, now))
            .await;
        tier.set(CacheEntry::new("epg", "{}".into(), ContentType::Epg, false, now))
            .await;

        clock.advance(Duration::from_secs(45 * 60));
        assert_eq!(tier.sweep_expired().await, 1);
        assert!(tier.has("meta").await);

        clock.advance(Duration::from_secs(16 * 60));
        assert!(tier.get("meta", ContentType::Metadata).await.is_none());
        assert_eq!(tier.stats().expirations, 2);
    }

    #[tokio::test]
    async fn test_capacity_eviction_is_lru() {
        let config = CompactConfig {
            max_entries: 2,
            ..Default::default()
        };
        let (tier, clock) = open(Arc::new(MemoryKvBackend::new()), config);
        tier.set(make_entry("a", "1".into(), clock.now_ms())).await;
        clock.advance(Duration::from_millis(1));
        tier.set(make_entry("b", "1".into(), clock.now_ms())).await;
        clock.advance(Duration::from_millis(1));
        tier.get("a", ContentType::Channels).await;
        clock.advance(Duration::from_millis(1));
        tier.set(make_entry("c", "1".into(), clock.now_ms())).await;

        assert!(tier.has("a").await);
        assert!(!tier.has("b").await);
    }

    #[tokio::test]
    async fn test_file_backend() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(FileKvBackend::new(dir.path().join("compact"), 1 << 20));
        let clock = Arc::new(ManualClock::new(1_000));
        let tier = CompactTier::open(backend.clone(), CompactConfig::default(), freshness(&clock));

        assert!(tier.set(make_entry("cat:chunk_0", "[1]".into(), 1_000)).await);
        assert_eq!(backend.keys().unwrap(), vec!["cat:chunk_0".to_string()]);

        let reopened = CompactTier::open(backend.clone(), CompactConfig::default(), freshness(&clock));
        let got = reopened.get("cat:chunk_0", ContentType::Channels).await.unwrap();
        assert_eq!(got.payload, "[1]");

        reopened.clear().await;
        assert!(backend.keys().unwrap().is_empty());
    }

    #[test]
    fn test_file_backend_quota() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileKvBackend::new(dir.path(), 10);
        backend.verify().unwrap();
        backend.write("a", "12345").unwrap();
        assert!(backend.write("b", "123456").unwrap_err().is_quota_exceeded());
        // overwriting does not double count
        backend.write("a", "1234567890").unwrap();
    }
}
