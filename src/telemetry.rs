//! Prometheus exposition of engine statistics
//!
//! Metrics are rebuilt from an [`EngineStats`] snapshot on every scrape, so
//! the engine itself carries no registry state.

use prometheus::{Encoder, Gauge, GaugeVec, Opts, Registry, TextEncoder};

use crate::engine::EngineStats;
use crate::error::{Error, Result};

const NAMESPACE: &str = "iptv_cache";

fn metric_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("Failed to build metrics: {}", e))
}

fn tier_gauge(registry: &Registry, name: &str, help: &str) -> Result<GaugeVec> {
    let gauge = GaugeVec::new(Opts::new(name, help).namespace(NAMESPACE), &["tier"]).map_err(metric_error)?;
    registry.register(Box::new(gauge.clone())).map_err(metric_error)?;
    Ok(gauge)
}

fn gauge(registry: &Registry, name: &str, help: &str, value: f64) -> Result<()> {
    let gauge = Gauge::with_opts(Opts::new(name, help).namespace(NAMESPACE)).map_err(metric_error)?;
    gauge.set(value);
    registry.register(Box::new(gauge)).map_err(metric_error)
}

/// Render a stats snapshot in the Prometheus text format
pub fn render_prometheus(stats: &EngineStats) -> Result<String> {
    let registry = Registry::new();

    let entries = tier_gauge(&registry, "tier_entries", "Entries held per tier")?;
    let bytes = tier_gauge(&registry, "tier_bytes", "Bytes held per tier")?;
    let capacity = tier_gauge(&registry, "tier_capacity_bytes", "Byte capacity per tier")?;
    let hits = tier_gauge(&registry, "tier_hits_total", "Reads served per tier")?;
    let misses = tier_gauge(&registry, "tier_misses_total", "Reads missed per tier")?;
    let evictions = tier_gauge(&registry, "tier_evictions_total", "Capacity evictions per tier")?;
    let expirations = tier_gauge(&registry, "tier_expirations_total", "TTL expirations per tier")?;

    for tier in &stats.manager.tiers {
        let label = [tier.tier.as_str()];
        entries.with_label_values(&label).set(tier.entries as f64);
        bytes.with_label_values(&label).set(tier.total_bytes as f64);
        capacity.with_label_values(&label).set(tier.capacity.max_bytes as f64);
        hits.with_label_values(&label).set(tier.hits as f64);
        misses.with_label_values(&label).set(tier.misses as f64);
        evictions.with_label_values(&label).set(tier.evictions as f64);
        expirations.with_label_values(&label).set(tier.expirations as f64);
    }

    let metrics = &stats.manager.metrics;
    gauge(&registry, "misses_total", "Reads that missed every tier", metrics.misses as f64)?;
    gauge(&registry, "promotions_total", "Durable hits promoted to memory", metrics.promotions as f64)?;
    gauge(&registry, "corrupt_entries_total", "Entries dropped as undecodable", metrics.corrupt_entries as f64)?;
    gauge(&registry, "compact_redirects_total", "Compact writes redirected to bulk", metrics.compact_redirects as f64)?;
    gauge(&registry, "hit_ratio", "Overall read hit ratio", metrics.overall_hit_ratio)?;
    gauge(&registry, "parse_cache_hits_total", "Catalogs served from cache", stats.parse_cache.hits as f64)?;
    gauge(&registry, "parse_cache_misses_total", "Catalogs fetched and parsed", stats.parse_cache.misses as f64)?;
    gauge(&registry, "peak_factor", "Current capacity multiplier", stats.selector.peak_factor)?;

    let environment = GaugeVec::new(
        Opts::new("environment", "Active capacity profile").namespace(NAMESPACE),
        &["environment"],
    )
    .map_err(metric_error)?;
    environment.with_label_values(&[stats.selector.environment.as_str()]).set(1.0);
    registry.register(Box::new(environment)).map_err(metric_error)?;

    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&registry.gather(), &mut buffer).map_err(metric_error)?;
    String::from_utf8(buffer).map_err(|e| Error::Internal(format!("Metrics are not UTF-8: {}", e)))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::cache::{ContentType, ManagerConfig, ManualClock, TieredCacheManager};
    use crate::catalog::StaticFetcher;
    use crate::config::EngineConfig;
    use crate::engine::CacheEngine;
    use crate::selector::{AdaptiveSelector, Detection, DetectionSource, Environment};

    #[tokio::test]
    async fn test_render_prometheus() {
        let clock = Arc::new(ManualClock::new(1_699_956_000_000));
        let config = EngineConfig::default();
        let manager = Arc::new(TieredCacheManager::in_memory(ManagerConfig::default(), clock).await);
        let selector = AdaptiveSelector::new(
            config.selector_config(),
            Detection {
                environment: Environment::Staging,
                source: DetectionSource::Fallback,
            },
        );
        let engine = CacheEngine::assemble(&config, manager, selector, Arc::new(StaticFetcher::new())).await;
        engine.manager().set("k", &vec![1, 2, 3], ContentType::Metadata).await.unwrap();
        engine.manager().get_raw("k", ContentType::Metadata).await;
        engine.manager().get_raw("absent", ContentType::Metadata).await;

        let text = render_prometheus(&engine.stats()).unwrap();
        assert!(text.contains("iptv_cache_tier_entries{tier=\"volatile\"} 1"));
        assert!(text.contains("iptv_cache_tier_hits_total{tier=\"volatile\"} 1"));
        assert!(text.contains("iptv_cache_misses_total 1"));
        assert!(text.contains("iptv_cache_environment{environment=\"staging\"} 1"));
        assert!(text.contains("# TYPE iptv_cache_promotions_total gauge"));
    }
}
