//! One-Time-Parse Cache
//!
//! Fetches and parses a catalog source at most once per time bucket. The
//! parsed channels are partitioned through the [`CatalogStore`], so later
//! loads and windowed reads never touch the network or the parser.
//!
//! # Key derivation
//!
//! ```text
//! catalog_{fx_hash("{source}|{options}|{bucket}"):016x}
//! ```
//!
//! The bucket is `now / granularity`, with the granularity chosen by the
//! kind of source (see [`SourceKind::bucket`]).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::instrument;

use crate::cache::entry::fx_hash;
use crate::cache::{ContentType, TieredCacheManager};
use crate::catalog::{parse_catalog, CatalogFetcher, CatalogFormat, Channel, LoadOptions};
use crate::error::Result;
use crate::partition::{CatalogSlice, CatalogStore, PartitionReport, StrategyKind, WindowRequest};
use crate::selector::AdaptiveSelector;

const HOUR: Duration = Duration::from_secs(60 * 60);

/// Kind of catalog source, by its address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Xtream,
    Epg,
    M3u,
    Other,
}

impl SourceKind {
    pub fn classify(source: &str) -> Self {
        let lower = source.to_ascii_lowercase();
        if ["player_api", "get_live", "action="].iter().any(|m| lower.contains(m)) {
            SourceKind::Xtream
        } else if lower.ends_with(".xml") || lower.contains("epg") || lower.contains("xmltv") {
            SourceKind::Epg
        } else if lower.contains(".m3u") {
            SourceKind::M3u
        } else {
            SourceKind::Other
        }
    }

    /// Time bucket granularity
    pub fn bucket(&self) -> Duration {
        match self {
            SourceKind::Xtream => 6 * HOUR,
            SourceKind::Epg => 12 * HOUR,
            SourceKind::M3u => 24 * HOUR,
            SourceKind::Other => HOUR,
        }
    }
}

/// Cache key of `source` loaded with `options` at `now_ms`
pub fn catalog_key(source: &str, options: &LoadOptions, now_ms: u64) -> String {
    let bucket_ms = SourceKind::classify(source).bucket().as_millis() as u64;
    let bucket = now_ms / bucket_ms.max(1);
    let material = format!("{}|{}|{}", source, options.key_fragment(), bucket);
    format!("catalog_{:016x}", fx_hash(material.as_bytes()))
}

/// Where a load was served from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadOrigin {
    Cache,
    Source,
}

/// Side record describing a cached catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct CatalogInfo {
    source: String,
    format: CatalogFormat,
    channels: usize,
    loaded_at: u64,
}

fn info_key(catalog_id: &str) -> String {
    format!("{catalog_id}:info")
}

/// A loaded catalog
#[derive(Debug, Clone, Serialize)]
pub struct LoadedCatalog {
    pub catalog_id: String,
    pub origin: LoadOrigin,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<CatalogFormat>,
    /// Live partition strategy, if the catalog is stored
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<StrategyKind>,
    #[serde(skip)]
    pub channels: Vec<Channel>,
    /// Ingestion report when this load partitioned the catalog
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<PartitionReport>,
}

impl LoadedCatalog {
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

/// Parse cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ParseCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub parse_failures: u64,
    pub ingest_failures: u64,
}

/// Fetch-once, parse-once catalog cache
pub struct ParseCache {
    store: Arc<CatalogStore>,
    selector: Arc<AdaptiveSelector>,
    fetcher: Arc<dyn CatalogFetcher>,
    schema_version: String,
    schema_checked: AtomicBool,
    loads: DashMap<String, Arc<Mutex<()>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    parse_failures: AtomicU64,
    ingest_failures: AtomicU64,
}

impl ParseCache {
    pub fn new(
        store: Arc<CatalogStore>,
        selector: Arc<AdaptiveSelector>,
        fetcher: Arc<dyn CatalogFetcher>,
        schema_version: impl Into<String>,
    ) -> Self {
        Self {
            store,
            selector,
            fetcher,
            schema_version: schema_version.into(),
            schema_checked: AtomicBool::new(false),
            loads: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            parse_failures: AtomicU64::new(0),
            ingest_failures: AtomicU64::new(0),
        }
    }

    fn manager(&self) -> &TieredCacheManager {
        self.store.manager()
    }

    /// Schema version this process expects
    pub fn schema_version(&self) -> &str {
        &self.schema_version
    }

    /// Compare the stored schema marker with ours, clearing the cache on a
    /// mismatch
    ///
    /// A missing marker over a non-empty cache counts as a mismatch, since
    /// nothing says which schema wrote those entries. Runs once per process
    /// (and again after [`ParseCache::reset_schema_check`]).
    pub async fn ensure_schema(&self) -> Result<()> {
        if self.schema_checked.load(Ordering::Acquire) {
            return Ok(());
        }
        let manager = self.manager();
        let stored = manager.schema_marker();
        let mismatch = match stored.as_deref() {
            Some(v) => v != self.schema_version,
            None => manager.entry_count() > 0,
        };
        if mismatch {
            tracing::warn!(
                stored = stored.as_deref().unwrap_or("none"),
                expected = %self.schema_version,
                "Cache schema version changed, clearing cache"
            );
            manager.clear().await;
        }
        if stored.as_deref() != Some(self.schema_version.as_str()) {
            manager.set_schema_marker(&self.schema_version).await?;
        }
        self.schema_checked.store(true, Ordering::Release);
        Ok(())
    }

    /// Force the schema marker to be checked again on the next load
    pub fn reset_schema_check(&self) {
        self.schema_checked.store(false, Ordering::Release);
    }

    /// Load a catalog, from cache when possible
    #[instrument(skip(self, options))]
    pub async fn get_catalog(&self, source: &str, options: &LoadOptions) -> Result<LoadedCatalog> {
        self.ensure_schema().await?;
        let key = catalog_key(source, options, self.manager().now_ms());

        let lock = self.loads.entry(key.clone()).or_default().clone();
        let result = {
            let _guard = lock.lock().await;
            self.load_locked(&key, source, options).await
        };
        drop(lock);
        self.loads.remove_if(&key, |_, l| Arc::strong_count(l) == 1);
        result
    }

    async fn load_locked(&self, key: &str, source: &str, options: &LoadOptions) -> Result<LoadedCatalog> {
        if let Some(loaded) = self.cached(key).await {
            self.hits.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(catalog = %key, channels = loaded.len(), "Catalog served from cache");
            return Ok(loaded);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let raw = self.fetcher.fetch(source).await?;
        let mut catalog = match parse_catalog(source, &raw) {
            Ok(catalog) => catalog,
            Err(e) => {
                self.parse_failures.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };
        options.apply(&mut catalog.channels);

        let content_type = match catalog.format {
            CatalogFormat::Epg => ContentType::Epg,
            CatalogFormat::M3u | CatalogFormat::Xtream => ContentType::Channels,
        };
        let manager = self.manager();
        self.selector.apply(manager).await;
        let plan = self.selector.plan(
            catalog.len(),
            manager.storage_critical(),
            !self.store.usage().is_empty(),
        );

        let report = match self.store.ingest(key, &catalog.channels, content_type, &plan).await {
            Ok(report) => {
                let info = CatalogInfo {
                    source: source.to_string(),
                    format: catalog.format,
                    channels: catalog.len(),
                    loaded_at: manager.now_ms(),
                };
                if let Err(e) = manager.set(&info_key(key), &info, ContentType::Metadata).await {
                    tracing::debug!(catalog = %key, "Catalog info not cached: {}", e);
                }
                Some(report)
            }
            Err(e) => {
                self.ingest_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(catalog = %key, "Catalog not cached, serving parsed result: {}", e);
                None
            }
        };

        Ok(LoadedCatalog {
            catalog_id: key.to_string(),
            origin: LoadOrigin::Source,
            format: Some(catalog.format),
            strategy: report.as_ref().map(|r| r.strategy),
            channels: catalog.channels,
            report,
        })
    }

    /// Full catalog from cache; metadata-only layouts do not count
    async fn cached(&self, key: &str) -> Option<LoadedCatalog> {
        let metadata = self.store.metadata(key).await?;
        if !metadata.layout.holds_full_channels() {
            return None;
        }
        let channels = self.store.load_all(key).await?;
        let info: Option<CatalogInfo> = self.manager().get(&info_key(key), ContentType::Metadata).await;
        Some(LoadedCatalog {
            catalog_id: key.to_string(),
            origin: LoadOrigin::Cache,
            format: info.map(|i| i.format),
            strategy: Some(metadata.layout.strategy()),
            channels,
            report: None,
        })
    }

    /// Windowed or category view, loading the catalog first if needed
    #[instrument(skip(self, options))]
    pub async fn get_window(
        &self,
        source: &str,
        options: &LoadOptions,
        request: &WindowRequest,
    ) -> Result<CatalogSlice> {
        self.ensure_schema().await?;
        let key = catalog_key(source, options, self.manager().now_ms());
        if let Some(slice) = self.store.retrieve(&key, request).await {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(slice);
        }

        let loaded = self.get_catalog(source, options).await?;
        if let Some(slice) = self.store.retrieve(&key, request).await {
            return Ok(slice);
        }
        let mut channels = loaded.channels;
        if let Some(category) = &request.category {
            channels.retain(|c| c.category() == category);
        }
        Ok(CatalogSlice::Channels(request.slice(channels)))
    }

    /// Drop the cached copy of `source` for the current bucket
    pub async fn invalidate(&self, source: &str, options: &LoadOptions) -> usize {
        let key = catalog_key(source, options, self.manager().now_ms());
        self.store.invalidate(&key).await
    }

    pub fn stats(&self) -> ParseCacheStats {
        ParseCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            parse_failures: self.parse_failures.load(Ordering::Relaxed),
            ingest_failures: self.ingest_failures.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{Clock, ManagerConfig, ManualClock};
    use crate::catalog::StaticFetcher;
    use crate::error::Error;
    use crate::partition::PartitionConfig;
    use crate::selector::{Detection, DetectionSource, Environment, SelectorConfig};
    use assert_matches::assert_matches;

    const M3U: &str = "#EXTM3U\n\
        #EXTINF:-1 tvg-id=\"a\" group-title=\"News\",Alpha\nhttp://s.tv/a\n\
        #EXTINF:-1 tvg-id=\"b\" group-title=\"Sports\",Beta\nhttp://s.tv/b\n\
        #EXTINF:-1 tvg-id=\"c\" group-title=\"XXX\",Gamma\nhttp://s.tv/c\n";

    struct Fixture {
        cache: ParseCache,
        fetcher: Arc<StaticFetcher>,
        clock: Arc<ManualClock>,
    }

    async fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let manager = Arc::new(TieredCacheManager::in_memory(ManagerConfig::default(), clock.clone()).await);
        let store = Arc::new(CatalogStore::with_config(
            manager,
            PartitionConfig {
                batch_pause: Duration::ZERO,
                ..Default::default()
            },
        ));
        let selector = Arc::new(AdaptiveSelector::new(
            SelectorConfig::default(),
            Detection {
                environment: Environment::Development,
                source: DetectionSource::Fallback,
            },
        ));
        let fetcher = Arc::new(StaticFetcher::new().with("http://p.tv/list.m3u", M3U));
        let cache = ParseCache::new(store, selector, fetcher.clone(), "2.0");
        Fixture { cache, fetcher, clock }
    }

    #[test]
    fn test_source_kind() {
        assert_eq!(SourceKind::classify("http://p.tv/player_api.php?u=1"), SourceKind::Xtream);
        assert_eq!(SourceKind::classify("http://p.tv/guide.xml"), SourceKind::Epg);
        assert_eq!(SourceKind::classify("http://p.tv/list.m3u8"), SourceKind::M3u);
        assert_eq!(SourceKind::classify("http://p.tv/list"), SourceKind::Other);
        assert_eq!(SourceKind::M3u.bucket(), Duration::from_secs(86_400));
    }

    #[test]
    fn test_catalog_key_buckets() {
        let options = LoadOptions::default();
        let src = "http://p.tv/player_api.php";
        let t0 = 6 * 3_600_000 * 1_000;
        assert_eq!(catalog_key(src, &options, t0), catalog_key(src, &options, t0 + 3_600_000));
        assert_ne!(catalog_key(src, &options, t0), catalog_key(src, &options, t0 + 6 * 3_600_000));
        let filtered = LoadOptions {
            exclude_adult: true,
            max_channels: None,
        };
        assert_ne!(catalog_key(src, &options, t0), catalog_key(src, &filtered, t0));
        assert!(catalog_key(src, &options, t0).starts_with("catalog_"));
        assert_eq!(catalog_key(src, &options, t0).len(), "catalog_".len() + 16);
    }

    #[tokio::test]
    async fn test_second_load_skips_fetch() {
        let f = fixture().await;
        let options = LoadOptions::default();

        let first = f.cache.get_catalog("http://p.tv/list.m3u", &options).await.unwrap();
        assert_eq!(first.origin, LoadOrigin::Source);
        assert_eq!(first.len(), 3);
        assert_eq!(first.strategy, Some(StrategyKind::Category));

        let second = f.cache.get_catalog("http://p.tv/list.m3u", &options).await.unwrap();
        assert_eq!(second.origin, LoadOrigin::Cache);
        assert_eq!(second.format, Some(CatalogFormat::M3u));
        assert_eq!(second.channels, first.channels);
        assert_eq!(f.fetcher.fetch_count(), 1);

        let stats = f.cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
    }

    #[tokio::test]
    async fn test_options_cache_separately() {
        let f = fixture().await;
        let filtered = LoadOptions {
            exclude_adult: true,
            max_channels: None,
        };
        let loaded = f.cache.get_catalog("http://p.tv/list.m3u", &filtered).await.unwrap();
        assert_eq!(loaded.len(), 2);
        f.cache.get_catalog("http://p.tv/list.m3u", &LoadOptions::default()).await.unwrap();
        assert_eq!(f.fetcher.fetch_count(), 2);
    }

    #[tokio::test]
    async fn test_new_bucket_refetches() {
        let f = fixture().await;
        let options = LoadOptions::default();
        f.cache.get_catalog("http://p.tv/list.m3u", &options).await.unwrap();
        f.clock.advance(Duration::from_secs(86_400));
        f.cache.get_catalog("http://p.tv/list.m3u", &options).await.unwrap();
        assert_eq!(f.fetcher.fetch_count(), 2);
    }

    #[tokio::test]
    async fn test_parse_failure_writes_nothing() {
        let f = fixture().await;
        f.fetcher.insert("http://p.tv/bad.m3u", "<html>nope</html>");
        let result = f.cache.get_catalog("http://p.tv/bad.m3u", &LoadOptions::default()).await;
        assert_matches!(result, Err(Error::ParseFailure { .. }));
        assert_eq!(f.cache.stats().parse_failures, 1);

        let key = catalog_key("http://p.tv/bad.m3u", &LoadOptions::default(), f.clock.now_ms());
        assert_eq!(f.cache.store.invalidate(&key).await, 0);
    }

    #[tokio::test]
    async fn test_window() {
        let f = fixture().await;
        let options = LoadOptions::default();
        let slice = f
            .cache
            .get_window("http://p.tv/list.m3u", &options, &WindowRequest::category("Sports"))
            .await
            .unwrap();
        let channels = slice.into_channels().unwrap();
        assert_eq!(channels.len(), 1);
        assert_eq!(channels[0].name, "Beta");

        let slice = f
            .cache
            .get_window("http://p.tv/list.m3u", &options, &WindowRequest::window(1, 5))
            .await
            .unwrap();
        assert_eq!(slice.len(), 2);
        assert_eq!(f.fetcher.fetch_count(), 1);
    }

    // =========================================================================
    // Schema marker
    // =========================================================================

    #[tokio::test]
    async fn test_schema_mismatch_clears_cache() {
        let f = fixture().await;
        let manager = f.cache.store.manager().clone();
        manager.set_schema_marker("1.0").await.unwrap();
        manager.set("stale:entry", &1, ContentType::Metadata).await.unwrap();

        f.cache.ensure_schema().await.unwrap();
        assert!(!manager.has("stale:entry").await);
        assert_eq!(manager.schema_marker().as_deref(), Some("2.0"));
    }

    #[tokio::test]
    async fn test_matching_schema_keeps_cache() {
        let f = fixture().await;
        let manager = f.cache.store.manager().clone();
        manager.set_schema_marker("2.0").await.unwrap();
        manager.set("kept", &1, ContentType::Metadata).await.unwrap();
        f.cache.ensure_schema().await.unwrap();
        assert!(manager.has("kept").await);
    }

    #[tokio::test]
    async fn test_schema_marker_outlives_ttl_and_sweep() {
        let f = fixture().await;
        let manager = f.cache.store.manager().clone();
        manager.set_schema_marker("1.0").await.unwrap();
        manager.set("catalog_old:chunk_0", &vec!["a"], ContentType::Channels).await.unwrap();

        f.clock.advance(Duration::from_secs(61 * 60));
        manager.sweep_expired().await;
        assert_eq!(manager.schema_marker().as_deref(), Some("1.0"));
        assert!(manager.has("catalog_old:chunk_0").await);

        f.cache.ensure_schema().await.unwrap();
        assert!(!manager.has("catalog_old:chunk_0").await);
        assert_eq!(manager.schema_marker().as_deref(), Some("2.0"));
    }

    #[tokio::test]
    async fn test_schema_marker_survives_eviction_pressure() {
        let f = fixture().await;
        let manager = f.cache.store.manager().clone();
        manager.set_schema_marker("1.0").await.unwrap();
        manager.set("catalog_old:chunk_0", &vec!["a"], ContentType::Channels).await.unwrap();

        // shrink every tier to one entry and churn through it
        let tight = crate::cache::TierCapacity::new(1, 1 << 20);
        manager
            .apply_capacities(crate::cache::TierCapacities {
                volatile: tight,
                compact: tight,
                bulk: tight,
            })
            .await;
        for i in 0..10 {
            manager.set(&format!("filler_{i}"), &i, ContentType::Metadata).await.unwrap();
        }
        assert_eq!(manager.schema_marker().as_deref(), Some("1.0"));

        f.cache.ensure_schema().await.unwrap();
        assert_eq!(manager.entry_count(), 0);
        assert_eq!(manager.schema_marker().as_deref(), Some("2.0"));
    }

    #[tokio::test]
    async fn test_missing_marker_over_entries_clears_cache() {
        let f = fixture().await;
        let manager = f.cache.store.manager().clone();
        manager.set("catalog_old:chunk_0", &vec!["a"], ContentType::Channels).await.unwrap();
        assert_eq!(manager.schema_marker(), None);

        f.cache.ensure_schema().await.unwrap();
        assert!(!manager.has("catalog_old:chunk_0").await);
        assert_eq!(manager.schema_marker().as_deref(), Some("2.0"));
    }

    #[tokio::test]
    async fn test_missing_marker_on_empty_cache_only_records_version() {
        let f = fixture().await;
        let manager = f.cache.store.manager().clone();
        f.cache.ensure_schema().await.unwrap();
        assert_eq!(manager.schema_marker().as_deref(), Some("2.0"));

        // a later load in the same bucket is still a hit
        f.cache.get_catalog("http://p.tv/list.m3u", &LoadOptions::default()).await.unwrap();
        f.cache.reset_schema_check();
        let again = f.cache.get_catalog("http://p.tv/list.m3u", &LoadOptions::default()).await.unwrap();
        assert_eq!(again.origin, LoadOrigin::Cache);
        assert_eq!(f.fetcher.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_schema_marker_persists_in_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(1_699_956_000_000));
        let manager = TieredCacheManager::open_dir(dir.path(), ManagerConfig::default(), clock.clone()).await;
        manager.set_schema_marker("1.0").await.unwrap();
        drop(manager);

        let reopened = TieredCacheManager::open_dir(dir.path(), ManagerConfig::default(), clock).await;
        assert_eq!(reopened.schema_marker().as_deref(), Some("1.0"));
    }
}
