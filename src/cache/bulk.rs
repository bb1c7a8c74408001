//! Durable Bulk Tier - Async Indexed Store
//!
//! Larger persistent tier for big payloads (whole chunks, oversized
//! fragments) over an asynchronous backend.
//!
//! # Design
//!
//! - Pluggable async backend (in-memory `DashMap`, or LZ4-framed files via
//!   `tokio::fs` with atomic temp-file rename)
//! - Ordered indices by `last_access_at` and `created_at`, rebuilt on open
//! - Capacity breach evicts the oldest ~10% by last access, repeated until
//!   the new entry fits
//! - TTL sweep walks the creation index and re-validates each candidate
//!   right before deleting it
//!
//! Index locks are never held across an `.await`.

use std::collections::{BTreeSet, HashMap};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::instrument;

use super::entry::{CacheEntry, ContentType, EntryMeta};
use super::policy::Freshness;
use super::tier::{TierCapacity, TierCounters, TierKind, TierStats, TierStore};
use crate::error::{Error, Result};

/// Default total capacity (50MB)
pub const DEFAULT_BULK_BYTES: u64 = 50 * 1024 * 1024;

/// Default entry limit
pub const DEFAULT_BULK_ENTRIES: usize = 10_000;

// =============================================================================
// Backend
// =============================================================================

/// Bulk storage backend trait
#[async_trait]
pub trait BulkBackend: Send + Sync {
    /// Prepare the medium; failure disables the tier
    async fn open(&self) -> Result<()>;

    /// Get an object
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Put an object
    async fn put(&self, key: &str, data: Bytes) -> Result<()>;

    /// Delete an object
    async fn delete(&self, key: &str) -> Result<bool>;

    /// All stored keys
    async fn keys(&self) -> Result<Vec<String>>;

    /// Remove everything
    async fn clear(&self) -> Result<()>;

    /// Get storage statistics
    fn stats(&self) -> BulkBackendStats;
}

/// Bulk backend statistics
#[derive(Debug, Clone, Default)]
pub struct BulkBackendStats {
    /// Total objects stored
    pub object_count: u64,
    /// Total bytes stored
    pub total_bytes: u64,
    /// Read operations
    pub reads: u64,
    /// Write operations
    pub writes: u64,
    /// Delete operations
    pub deletes: u64,
}

#[derive(Debug, Default)]
struct OpCounters {
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
}

/// In-memory bulk backend
pub struct InMemoryBulkBackend {
    storage: DashMap<String, Bytes>,
    total_bytes: AtomicU64,
    quota_bytes: Option<u64>,
    available: AtomicBool,
    ops: OpCounters,
}

impl Default for InMemoryBulkBackend {
    fn default() -> Self {
        Self {
            storage: DashMap::new(),
            total_bytes: AtomicU64::new(0),
            quota_bytes: None,
            available: AtomicBool::new(true),
            ops: OpCounters::default(),
        }
    }
}

impl InMemoryBulkBackend {
    /// Create a new in-memory backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend with a byte quota
    pub fn with_quota(quota_bytes: u64) -> Self {
        Self {
            quota_bytes: Some(quota_bytes),
            ..Self::default()
        }
    }

    /// Backend that refuses to open
    pub fn unavailable() -> Self {
        let backend = Self::default();
        backend.available.store(false, Ordering::Relaxed);
        backend
    }
}

#[async_trait]
impl BulkBackend for InMemoryBulkBackend {
    async fn open(&self) -> Result<()> {
        if self.available.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(Error::unavailable("bulk", "backend not available"))
        }
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.ops.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self.storage.get(key).map(|v| v.clone()))
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        self.ops.writes.fetch_add(1, Ordering::Relaxed);
        let size = data.len() as u64;
        let old_size = self.storage.get(key).map(|v| v.len() as u64).unwrap_or(0);

        if let Some(quota) = self.quota_bytes {
            let used = self.total_bytes.load(Ordering::Relaxed) - old_size;
            if used + size > quota {
                return Err(Error::QuotaExceeded {
                    key: key.to_string(),
                    size,
                });
            }
        }

        if let Some(old) = self.storage.insert(key.to_string(), data) {
            self.total_bytes
                .fetch_sub(old.len() as u64, Ordering::Relaxed);
        }
        self.total_bytes.fetch_add(size, Ordering::Relaxed);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.ops.deletes.fetch_add(1, Ordering::Relaxed);
        match self.storage.remove(key) {
            Some((_, data)) => {
                self.total_bytes
                    .fetch_sub(data.len() as u64, Ordering::Relaxed);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.storage.iter().map(|e| e.key().clone()).collect())
    }

    async fn clear(&self) -> Result<()> {
        self.storage.clear();
        self.total_bytes.store(0, Ordering::Relaxed);
        Ok(())
    }

    fn stats(&self) -> BulkBackendStats {
        BulkBackendStats {
            object_count: self.storage.len() as u64,
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            reads: self.ops.reads.load(Ordering::Relaxed),
            writes: self.ops.writes.load(Ordering::Relaxed),
            deletes: self.ops.deletes.load(Ordering::Relaxed),
        }
    }
}

const FRAME_EXT: &str = ".lz4";
const TMP_PREFIX: &str = ".tmp-";

/// Filesystem bulk backend
///
/// One LZ4 block-compressed file per key. Writes go to a temp file first and
/// are renamed into place.
pub struct FsBulkBackend {
    root: PathBuf,
    quota_bytes: Option<u64>,
    used_bytes: AtomicU64,
    object_count: AtomicU64,
    ops: OpCounters,
}

impl FsBulkBackend {
    /// Store files under `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            quota_bytes: None,
            used_bytes: AtomicU64::new(0),
            object_count: AtomicU64::new(0),
            ops: OpCounters::default(),
        }
    }

    /// Store files under `root` with an on-disk byte quota
    pub fn with_quota(root: impl Into<PathBuf>, quota_bytes: u64) -> Self {
        Self {
            quota_bytes: Some(quota_bytes),
            ..Self::new(root)
        }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root
            .join(format!("{}{}", urlencoding::encode(key), FRAME_EXT))
    }

    async fn file_len(path: &PathBuf) -> Option<u64> {
        tokio::fs::metadata(path).await.ok().map(|m| m.len())
    }
}

#[async_trait]
impl BulkBackend for FsBulkBackend {
    async fn open(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| Error::unavailable("bulk", format!("{}: {}", self.root.display(), e)))?;

        let mut used = 0;
        let mut count = 0;
        let mut dir = tokio::fs::read_dir(&self.root).await?;
        while let Some(item) = dir.next_entry().await? {
            let name = item.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(TMP_PREFIX) {
                // leftover from an interrupted write
                let _ = tokio::fs::remove_file(item.path()).await;
            } else if name.ends_with(FRAME_EXT) {
                used += item.metadata().await?.len();
                count += 1;
            }
        }
        self.used_bytes.store(used, Ordering::Relaxed);
        self.object_count.store(count, Ordering::Relaxed);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.ops.reads.fetch_add(1, Ordering::Relaxed);
        match tokio::fs::read(self.path_for(key)).await {
            Ok(framed) => {
                let plain = lz4::block::decompress(&framed, None)
                    .map_err(|e| Error::corrupt(key, e))?;
                Ok(Some(Bytes::from(plain)))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        self.ops.writes.fetch_add(1, Ordering::Relaxed);
        let framed = lz4::block::compress(&data, None, true)?;
        let path = self.path_for(key);
        let old = Self::file_len(&path).await;
        let new_len = framed.len() as u64;

        if let Some(quota) = self.quota_bytes {
            let used = self
                .used_bytes
                .load(Ordering::Relaxed)
                .saturating_sub(old.unwrap_or(0));
            if used + new_len > quota {
                return Err(Error::QuotaExceeded {
                    key: key.to_string(),
                    size: new_len,
                });
            }
        }

        let tmp = self
            .root
            .join(format!("{}{}", TMP_PREFIX, uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, &framed).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        match old {
            Some(old) => {
                self.used_bytes.fetch_sub(old.min(self.used_bytes.load(Ordering::Relaxed)), Ordering::Relaxed);
            }
            None => {
                self.object_count.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.used_bytes.fetch_add(new_len, Ordering::Relaxed);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.ops.deletes.fetch_add(1, Ordering::Relaxed);
        let path = self.path_for(key);
        let len = Self::file_len(&path).await;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                let len = len.unwrap_or(0);
                self.used_bytes.fetch_sub(len.min(self.used_bytes.load(Ordering::Relaxed)), Ordering::Relaxed);
                self.object_count.fetch_sub(1, Ordering::Relaxed);
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.root).await?;
        while let Some(item) = dir.next_entry().await? {
            let name = item.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(FRAME_EXT)) else {
                continue;
            };
            if let Ok(key) = urlencoding::decode(stem) {
                keys.push(key.into_owned());
            }
        }
        Ok(keys)
    }

    async fn clear(&self) -> Result<()> {
        for key in self.keys().await? {
            self.delete(&key).await?;
        }
        Ok(())
    }

    fn stats(&self) -> BulkBackendStats {
        BulkBackendStats {
            object_count: self.object_count.load(Ordering::Relaxed),
            total_bytes: self.used_bytes.load(Ordering::Relaxed),
            reads: self.ops.reads.load(Ordering::Relaxed),
            writes: self.ops.writes.load(Ordering::Relaxed),
            deletes: self.ops.deletes.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Tier
// =============================================================================

/// Bulk tier configuration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BulkConfig {
    /// Maximum total payload bytes
    pub max_bytes: u64,
    /// Maximum number of entries
    pub max_entries: usize,
    /// Fraction of entries evicted per breach round
    pub eviction_fraction: f64,
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_BULK_BYTES,
            max_entries: DEFAULT_BULK_ENTRIES,
            eviction_fraction: 0.10,
        }
    }
}

#[derive(Default)]
struct BulkIndex {
    entries: HashMap<String, EntryMeta>,
    by_access: BTreeSet<(u64, String)>,
    by_created: BTreeSet<(u64, String)>,
    total_bytes: u64,
}

impl BulkIndex {
    fn insert(&mut self, key: String, meta: EntryMeta) {
        self.remove(&key);
        self.by_access.insert((meta.last_access_at, key.clone()));
        self.by_created.insert((meta.created_at, key.clone()));
        self.total_bytes += meta.size_bytes;
        self.entries.insert(key, meta);
    }

    fn remove(&mut self, key: &str) -> Option<EntryMeta> {
        let meta = self.entries.remove(key)?;
        self.by_access.remove(&(meta.last_access_at, key.to_string()));
        self.by_created.remove(&(meta.created_at, key.to_string()));
        self.total_bytes -= meta.size_bytes;
        Some(meta)
    }

    fn touch(&mut self, key: &str, now: u64) {
        if let Some(meta) = self.entries.get_mut(key) {
            self.by_access.remove(&(meta.last_access_at, key.to_string()));
            meta.record_access(now);
            self.by_access.insert((meta.last_access_at, key.to_string()));
        }
    }

    /// Usage if `key` were removed
    fn usage_without(&self, key: &str) -> (usize, u64) {
        match self.entries.get(key) {
            Some(meta) => (self.entries.len() - 1, self.total_bytes - meta.size_bytes),
            None => (self.entries.len(), self.total_bytes),
        }
    }

    fn oldest_by_access(&self, n: usize) -> Vec<String> {
        self.by_access.iter().take(n).map(|(_, k)| k.clone()).collect()
    }
}

/// Durable bulk tier
pub struct BulkTier {
    backend: Option<Arc<dyn BulkBackend>>,
    index: Mutex<BulkIndex>,
    config: RwLock<BulkConfig>,
    freshness: Freshness,
    counters: TierCounters,
}

impl BulkTier {
    /// Open the tier over `backend`, rebuilding the index
    ///
    /// A backend that fails to open yields a disabled tier.
    pub async fn open(
        backend: Arc<dyn BulkBackend>,
        config: BulkConfig,
        freshness: Freshness,
    ) -> Self {
        if let Err(e) = backend.open().await {
            tracing::warn!("Bulk tier disabled: {}", e);
            return Self::disabled(config, freshness);
        }

        let tier = Self {
            backend: Some(backend),
            index: Mutex::new(BulkIndex::default()),
            config: RwLock::new(config),
            freshness,
            counters: TierCounters::default(),
        };
        tier.rebuild_index().await;
        tier
    }

    /// A tier with no backend; every operation is a no-op
    pub fn disabled(config: BulkConfig, freshness: Freshness) -> Self {
        Self {
            backend: None,
            index: Mutex::new(BulkIndex::default()),
            config: RwLock::new(config),
            freshness,
            counters: TierCounters::default(),
        }
    }

    /// Backend statistics (None when disabled)
    pub fn backend_stats(&self) -> Option<BulkBackendStats> {
        self.backend.as_ref().map(|b| b.stats())
    }

    /// Keys in least-recently-accessed order
    pub fn keys_by_access(&self) -> Vec<String> {
        self.index
            .lock()
            .by_access
            .iter()
            .map(|(_, k)| k.clone())
            .collect()
    }

    /// Keys in creation order
    pub fn keys_by_creation(&self) -> Vec<String> {
        self.index
            .lock()
            .by_created
            .iter()
            .map(|(_, k)| k.clone())
            .collect()
    }

    async fn rebuild_index(&self) {
        let Some(backend) = self.backend.as_deref() else { return };
        let keys = match backend.keys().await {
            Ok(keys) => keys,
            Err(e) => {
                tracing::warn!("Bulk tier could not list entries: {}", e);
                return;
            }
        };

        for key in keys {
            let loaded = match backend.get(&key).await {
                Ok(Some(data)) => CacheEntry::from_bytes(&key, &data),
                Ok(None) => continue,
                Err(e) => Err(e),
            };
            match loaded {
                Ok(entry) if entry.key == key => self.index.lock().insert(key, entry.meta()),
                _ => {
                    tracing::warn!(key = %key, "Dropping unreadable bulk entry");
                    if let Err(e) = backend.delete(&key).await {
                        tracing::warn!(key = %key, "Failed to remove unreadable bulk entry: {}", e);
                    }
                }
            }
        }
        tracing::debug!(entries = self.index.lock().entries.len(), "Bulk tier index rebuilt");
    }

    fn eviction_batch(&self, entries: usize) -> usize {
        let fraction = self.config.read().eviction_fraction;
        (((entries as f64) * fraction).ceil() as usize).max(1)
    }

    async fn remove_entry(&self, backend: &dyn BulkBackend, key: &str) {
        if let Err(e) = backend.delete(key).await {
            tracing::warn!(key = %key, "Bulk tier delete failed: {}", e);
        }
        self.index.lock().remove(key);
    }

    /// Evict the `n` least recently accessed entries
    async fn evict_oldest(&self, backend: &dyn BulkBackend, n: usize) -> usize {
        let victims = self.index.lock().oldest_by_access(n);
        for key in &victims {
            self.remove_entry(backend, key).await;
        }
        if !victims.is_empty() {
            tracing::debug!(evicted = victims.len(), "Bulk tier evicted oldest entries");
        }
        self.counters.evicted(victims.len() as u64);
        victims.len()
    }

    async fn shrink_to(&self, backend: &dyn BulkBackend, capacity: TierCapacity) {
        loop {
            let (entries, over) = {
                let index = self.index.lock();
                (
                    index.entries.len(),
                    index.entries.len() > capacity.max_entries
                        || index.total_bytes > capacity.max_bytes,
                )
            };
            if !over {
                break;
            }
            let batch = self.eviction_batch(entries);
            if self.evict_oldest(backend, batch).await == 0 {
                break;
            }
        }
    }
}

#[async_trait]
impl TierStore for BulkTier {
    fn kind(&self) -> TierKind {
        TierKind::Bulk
    }

    fn is_enabled(&self) -> bool {
        self.backend.is_some()
    }

    async fn get(&self, key: &str, content_type: ContentType) -> Option<CacheEntry> {
        let backend = self.backend.as_deref()?;
        let now = self.freshness.now_ms();

        let meta = self.index.lock().entries.get(key).copied();
        let Some(meta) = meta else {
            self.counters.miss();
            return None;
        };

        if self.freshness.is_stale(meta.created_at, content_type, now) {
            self.remove_entry(backend, key).await;
            self.counters.expired(1);
            self.counters.miss();
            return None;
        }

        let loaded = match backend.get(key).await {
            Ok(Some(data)) => CacheEntry::from_bytes(key, &data),
            Ok(None) => {
                self.index.lock().remove(key);
                self.counters.miss();
                return None;
            }
            Err(e) => Err(e),
        };

        match loaded {
            Ok(mut entry) => {
                self.index.lock().touch(key, now);
                entry.last_access_at = meta.last_access_at;
                entry.access_count = meta.access_count;
                entry.record_access(now);
                self.counters.hit();
                Some(entry)
            }
            Err(e) => {
                tracing::warn!("Bulk tier read failed, dropping entry: {}", e);
                self.remove_entry(backend, key).await;
                self.counters.miss();
                None
            }
        }
    }

    async fn set(&self, entry: CacheEntry) -> bool {
        let Some(backend) = self.backend.as_deref() else {
            return false;
        };
        let config = *self.config.read();
        let capacity = TierCapacity::new(config.max_entries, config.max_bytes);
        let size = entry.size();
        if size > capacity.max_bytes || capacity.max_entries == 0 {
            return false;
        }

        let raw = match entry.to_bytes() {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(key = %entry.key, "Bulk tier serialization failed: {}", e);
                return false;
            }
        };

        loop {
            let (breach, entries) = {
                let index = self.index.lock();
                let (n, bytes) = index.usage_without(&entry.key);
                (capacity.would_breach(n, bytes, size), index.entries.len())
            };
            if !breach {
                break;
            }
            let batch = self.eviction_batch(entries);
            if self.evict_oldest(backend, batch).await == 0 {
                break;
            }
        }

        match backend.put(&entry.key, raw.clone()).await {
            Ok(()) => {}
            Err(e) if e.is_quota_exceeded() => {
                let entries = self.index.lock().entries.len();
                let evicted = self.evict_oldest(backend, self.eviction_batch(entries)).await;
                tracing::warn!(
                    key = %entry.key,
                    evicted,
                    "Bulk backend quota exceeded, evicted oldest entries and retrying once"
                );
                if let Err(e) = backend.put(&entry.key, raw).await {
                    tracing::warn!(key = %entry.key, "Bulk tier write failed after retry: {}", e);
                    return false;
                }
            }
            Err(e) => {
                tracing::warn!(key = %entry.key, "Bulk tier write failed: {}", e);
                return false;
            }
        }

        self.index.lock().insert(entry.key.clone(), entry.meta());
        true
    }

    async fn delete(&self, key: &str) -> bool {
        let Some(backend) = self.backend.as_deref() else {
            return false;
        };
        let existed = self.index.lock().entries.contains_key(key);
        if existed {
            self.remove_entry(backend, key).await;
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

    #[instrument(skip(self), fields(tier = "bulk"))]
    async fn sweep_expired(&self) -> usize {
        let Some(backend) = self.backend.as_deref() else {
            return 0;
        };
        let now = self.freshness.now_ms();

        let candidates: Vec<(String, u64)> = {
            let index = self.index.lock();
            index
                .by_created
                .iter()
                .filter(|(created, key)| {
                    index
                        .entries
                        .get(key)
                        .is_some_and(|m| self.freshness.is_stale(*created, m.content_type, now))
                })
                .map(|(created, key)| (key.clone(), *created))
                .collect()
        };

        let mut removed = 0;
        for (key, created) in candidates {
            let still_stale = self.index.lock().entries.get(&key).is_some_and(|m| {
                m.created_at == created && self.freshness.is_stale(m.created_at, m.content_type, now)
            });
            if still_stale {
                self.remove_entry(backend, &key).await;
                removed += 1;
            }
        }
        self.counters.expired(removed as u64);
        if removed > 0 {
            tracing::debug!(removed, "Bulk tier sweep removed expired entries");
        }
        removed
    }

    async fn resize(&self, capacity: TierCapacity) {
        {
            let mut config = self.config.write();
            config.max_entries = capacity.max_entries;
            config.max_bytes = capacity.max_bytes;
        }
        if let Some(backend) = self.backend.as_deref() {
            self.shrink_to(backend, capacity).await;
        }
    }

    async fn clear(&self) {
        let Some(backend) = self.backend.as_deref() else {
            return;
        };
        if let Err(e) = backend.clear().await {
            tracing::warn!("Bulk tier clear failed: {}", e);
        }
        *self.index.lock() = BulkIndex::default();
    }

    fn stats(&self) -> TierStats {
        let config = *self.config.read();
        let index = self.index.lock();
        self.counters.stats(
            TierKind::Bulk,
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
