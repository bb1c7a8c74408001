//! Cache Engine
//!
//! The explicit, injectable instance that owns the tiered cache, the
//! catalog store, the selector and the parse cache. Constructed once at
//! startup, torn down with [`CacheEngine::shutdown`], wiped with
//! [`CacheEngine::clear`] on logout or migration.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::cache::{system_clock, ManagerStats, SharedClock, TieredCacheManager};
use crate::catalog::{AutoFetcher, CatalogFetcher, LoadOptions};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::parse_cache::{LoadedCatalog, ParseCache, ParseCacheStats};
use crate::partition::{CatalogSlice, CatalogStore, WindowRequest};
use crate::selector::{
    AdaptiveSelector, DetectionContext, Environment, HttpLoadMonitor, LoadMonitor, PeakEvent,
    Recommendation,
};

/// Everything the diagnostics surface reads
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    #[serde(flatten)]
    pub manager: ManagerStats,
    pub parse_cache: ParseCacheStats,
    pub selector: Recommendation,
}

/// IPTV catalog cache engine
pub struct CacheEngine {
    manager: Arc<TieredCacheManager>,
    store: Arc<CatalogStore>,
    selector: Arc<AdaptiveSelector>,
    parse_cache: Arc<ParseCache>,
    sweep_interval: Duration,
    cancel: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl CacheEngine {
    /// Engine with HTTP/file fetching, the system clock and process-based
    /// environment detection
    pub async fn open(config: &EngineConfig) -> Result<Self> {
        let fetcher = Arc::new(AutoFetcher::with_config(config.fetcher_config())?);
        Self::with_fetcher(config, fetcher, system_clock()).await
    }

    /// Engine with a custom fetcher and clock
    pub async fn with_fetcher(
        config: &EngineConfig,
        fetcher: Arc<dyn CatalogFetcher>,
        clock: SharedClock,
    ) -> Result<Self> {
        let manager_config = config.manager_config();
        let manager = match &config.storage.data_dir {
            Some(dir) => TieredCacheManager::open_dir(dir, manager_config, clock).await,
            None => TieredCacheManager::in_memory(manager_config, clock).await,
        };

        let monitor: Option<Box<dyn LoadMonitor>> = match &config.selector.load_monitor_url {
            Some(url) => Some(Box::new(HttpLoadMonitor::new(url.clone())?)),
            None => None,
        };
        let context = DetectionContext::from_process(config.selector.environment);
        let selector =
            AdaptiveSelector::detect(config.selector_config(), &context, monitor.as_deref()).await;

        Ok(Self::assemble(config, Arc::new(manager), selector, fetcher).await)
    }

    /// Engine over prebuilt parts
    pub async fn assemble(
        config: &EngineConfig,
        manager: Arc<TieredCacheManager>,
        selector: AdaptiveSelector,
        fetcher: Arc<dyn CatalogFetcher>,
    ) -> Self {
        let selector = Arc::new(selector);
        selector.apply(&manager).await;

        let store = Arc::new(CatalogStore::with_config(manager.clone(), config.partition_config()));
        let parse_cache = Arc::new(ParseCache::new(
            store.clone(),
            selector.clone(),
            fetcher,
            config.schema_version.clone(),
        ));

        Self {
            manager,
            store,
            selector,
            parse_cache,
            sweep_interval: config.sweep_interval(),
            cancel: CancellationToken::new(),
            sweeper: Mutex::new(None),
        }
    }

    pub fn manager(&self) -> &Arc<TieredCacheManager> {
        &self.manager
    }

    pub fn store(&self) -> &Arc<CatalogStore> {
        &self.store
    }

    pub fn selector(&self) -> &Arc<AdaptiveSelector> {
        &self.selector
    }

    pub fn parse_cache(&self) -> &Arc<ParseCache> {
        &self.parse_cache
    }

    // =========================================================================
    // Catalog access
    // =========================================================================

    pub async fn get_catalog(&self, source: &str, options: &LoadOptions) -> Result<LoadedCatalog> {
        self.parse_cache.get_catalog(source, options).await
    }

    pub async fn get_window(
        &self,
        source: &str,
        options: &LoadOptions,
        request: &WindowRequest,
    ) -> Result<CatalogSlice> {
        self.parse_cache.get_window(source, options, request).await
    }

    // =========================================================================
    // Load signals
    // =========================================================================

    /// Feed a load sample; tiers are resized when it escalates the profile
    pub async fn record_load(&self, requests_per_min: f64) -> Option<Environment> {
        let escalated = self.selector.record_load(requests_per_min)?;
        self.selector.apply(&self.manager).await;
        Some(escalated)
    }

    pub async fn deescalate(&self, target: Environment) -> Result<Environment> {
        let environment = self.selector.deescalate(target)?;
        self.selector.apply(&self.manager).await;
        Ok(environment)
    }

    pub async fn start_peak_event(&self, event: PeakEvent) {
        self.selector.start_peak_event(event);
        self.selector.apply(&self.manager).await;
    }

    pub async fn end_peak_event(&self) {
        self.selector.end_peak_event();
        self.selector.apply(&self.manager).await;
    }

    pub async fn report_available_memory(&self, bytes: Option<u64>) {
        self.selector.report_available_memory(bytes);
        self.selector.apply(&self.manager).await;
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// One TTL sweep across every tier
    pub async fn sweep(&self) -> usize {
        self.manager.sweep_expired().await
    }

    /// Start the periodic sweeper; a no-op if it is already running
    ///
    /// Each tick also re-applies capacities so peak-hour changes take effect.
    pub fn spawn_sweeper(&self) {
        let mut slot = self.sweeper.lock();
        if slot.is_some() {
            return;
        }

        let manager = self.manager.clone();
        let selector = self.selector.clone();
        let cancel = self.cancel.clone();
        let period = self.sweep_interval;

        *slot = Some(tokio::spawn(async move {
            info!(interval_secs = period.as_secs(), "Starting cache sweeper");
            let mut tick = interval(period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tick.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Cache sweeper shutting down");
                        break;
                    }
                    _ = tick.tick() => {
                        manager.sweep_expired().await;
                        selector.apply(&manager).await;
                    }
                }
            }
        }));
    }

    /// Whether the background sweeper is running
    pub fn sweeper_running(&self) -> bool {
        self.sweeper
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Stop background work and wait for it
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.sweeper.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!("Cache sweeper ended abnormally: {}", e);
            }
        }
        info!("Cache engine stopped");
    }

    /// Wipe every tier (logout, migration)
    pub async fn clear(&self) {
        self.manager.clear().await;
        self.parse_cache.reset_schema_check();
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            manager: self.manager.stats(),
            parse_cache: self.parse_cache.stats(),
            selector: self.selector.recommendation(self.manager.now_ms()),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{ContentType, ManagerConfig, ManualClock, TierKind, SCHEMA_VERSION};
    use crate::catalog::StaticFetcher;
    use crate::selector::{Detection, DetectionSource};

    const MB: u64 = 1024 * 1024;

    async fn engine(environment: Environment) -> (CacheEngine, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_699_956_000_000));
        let mut config = EngineConfig::default();
        config.partition.batch_pause_ms = 0;
        config.sweep_interval_secs = 1;
        let manager = Arc::new(TieredCacheManager::in_memory(ManagerConfig::default(), clock.clone()).await);
        let selector = AdaptiveSelector::new(
            config.selector_config(),
            Detection {
                environment,
                source: DetectionSource::Deployment,
            },
        );
        let fetcher = Arc::new(StaticFetcher::new().with(
            "http://p.tv/a.m3u",
            "#EXTM3U\n#EXTINF:-1 group-title=\"News\",One\nhttp://s.tv/1\n",
        ));
        (CacheEngine::assemble(&config, manager, selector, fetcher).await, clock)
    }

    #[tokio::test]
    async fn test_assemble_applies_profile() {
        let (engine, _) = engine(Environment::ProductionLow).await;
        let caps = engine.manager().capacities();
        assert_eq!(caps.volatile.max_bytes, 20 * MB);
        assert_eq!(caps.bulk.max_bytes, 100 * MB);
    }

    #[tokio::test]
    async fn test_escalation_resizes_tiers() {
        let (engine, _) = engine(Environment::Staging).await;
        assert_eq!(engine.record_load(200.0).await, None);
        assert_eq!(engine.record_load(200.0).await, None);
        assert_eq!(engine.record_load(200.0).await, Some(Environment::ProductionLow));
        assert_eq!(engine.manager().capacities().volatile.max_bytes, 20 * MB);

        engine.start_peak_event(PeakEvent::News).await;
        assert_eq!(engine.manager().capacities().volatile.max_bytes, 40 * MB);
        engine.end_peak_event().await;

        engine.deescalate(Environment::Development).await.unwrap();
        assert_eq!(engine.manager().capacities().volatile.max_bytes, 4 * MB);
    }

    #[tokio::test]
    async fn test_clear_and_stats() {
        let (engine, _) = engine(Environment::Development).await;
        let loaded = engine.get_catalog("http://p.tv/a.m3u", &LoadOptions::default()).await.unwrap();
        assert_eq!(loaded.len(), 1);

        let stats = engine.stats();
        assert_eq!(stats.parse_cache.misses, 1);
        assert_eq!(stats.selector.environment, Environment::Development);
        assert!(stats.manager.tier(TierKind::Volatile).unwrap().entries > 0);
        let json = serde_json::to_value(&stats).unwrap();
        assert!(json.get("tiers").is_some());

        engine.clear().await;
        assert_eq!(engine.manager().stats().tier(TierKind::Volatile).unwrap().entries, 0);
    }

    #[tokio::test]
    async fn test_sweeper_lifecycle() {
        let (engine, clock) = engine(Environment::Development).await;
        engine
            .manager()
            .set("k", &"v", ContentType::Epg)
            .await
            .unwrap();
        clock.advance(Duration::from_secs(3_600));

        engine.spawn_sweeper();
        engine.spawn_sweeper();
        assert!(engine.sweeper_running());

        let stored = || -> usize { engine.manager().stats().tiers.iter().map(|t| t.entries).sum() };
        assert!(stored() > 0);
        for _ in 0..60 {
            if stored() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(stored(), 0);

        engine.shutdown().await;
        assert!(!engine.sweeper_running());
    }

    #[tokio::test]
    async fn test_schema_marker_survives_sweeper_ticks() {
        let (engine, clock) = engine(Environment::Development).await;
        engine.get_catalog("http://p.tv/a.m3u", &LoadOptions::default()).await.unwrap();
        engine.manager().set("short_lived", &1, ContentType::Metadata).await.unwrap();
        assert_eq!(engine.manager().schema_marker().as_deref(), Some(SCHEMA_VERSION));

        // past the metadata TTL, inside the channel TTL
        clock.advance(Duration::from_secs(61 * 60));
        engine.spawn_sweeper();
        for _ in 0..60 {
            if !engine.manager().has("short_lived").await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(!engine.manager().has("short_lived").await);
        assert_eq!(engine.manager().schema_marker().as_deref(), Some(SCHEMA_VERSION));
        assert!(engine.manager().entry_count() > 0);

        let upgraded = ParseCache::new(
            engine.store().clone(),
            engine.selector().clone(),
            Arc::new(StaticFetcher::new()),
            "99.0",
        );
        upgraded.ensure_schema().await.unwrap();
        assert_eq!(engine.manager().entry_count(), 0);
        assert_eq!(engine.manager().schema_marker().as_deref(), Some("99.0"));

        engine.shutdown().await;
    }
}
