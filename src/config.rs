//! Engine Configuration
//!
//! YAML file layout (every field optional):
//!
//! ```yaml
//! storage:
//!   data_dir: /var/cache/iptv
//!   compact_quota_bytes: 10485760
//! ttl:
//!   channels_secs: 21600
//!   metadata_secs: 3600
//!   epg_secs: 1800
//! partition:
//!   chunk_size: 500
//!   batch_pause_ms: 50
//! selector:
//!   environment: production_low
//!   utc_offset_minutes: 60
//! sweep_interval_secs: 300
//! schema_version: "2.0"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::bulk::DEFAULT_BULK_BYTES;
use crate::cache::compact::DEFAULT_COMPACT_ITEM_CEILING;
use crate::cache::manager::DEFAULT_COMPACT_QUOTA;
use crate::cache::policy::{DEFAULT_CHANNELS_TTL, DEFAULT_EPG_TTL, DEFAULT_METADATA_TTL};
use crate::cache::{
    BulkConfig, CompactConfig, CompressionPolicy, ManagerConfig, TtlPolicy, SCHEMA_VERSION,
};
use crate::catalog::HttpFetcherConfig;
use crate::error::{Error, Result};
use crate::partition::{self, PartitionConfig};
use crate::selector::{self, Environment, SelectorConfig};

/// Default background sweep interval
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    /// Durable tiers persist here; in-memory when unset
    pub data_dir: Option<PathBuf>,
    /// Quota of the compact tier's backing medium
    pub compact_quota_bytes: u64,
    /// Bulk tier byte budget before the selector resizes it
    pub bulk_max_bytes: u64,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            data_dir: None,
            compact_quota_bytes: DEFAULT_COMPACT_QUOTA,
            bulk_max_bytes: DEFAULT_BULK_BYTES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TtlSection {
    pub channels_secs: u64,
    pub metadata_secs: u64,
    pub epg_secs: u64,
}

impl Default for TtlSection {
    fn default() -> Self {
        Self {
            channels_secs: DEFAULT_CHANNELS_TTL.as_secs(),
            metadata_secs: DEFAULT_METADATA_TTL.as_secs(),
            epg_secs: DEFAULT_EPG_TTL.as_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionSection {
    pub enabled: bool,
    pub channels_threshold: usize,
    pub metadata_threshold: usize,
    pub epg_threshold: usize,
}

impl Default for CompressionSection {
    fn default() -> Self {
        let policy = CompressionPolicy::default();
        Self {
            enabled: policy.enabled,
            channels_threshold: policy.channels_threshold,
            metadata_threshold: policy.metadata_threshold,
            epg_threshold: policy.epg_threshold,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactSection {
    /// Per-item ceiling; larger stored payloads go to the bulk tier
    pub max_item_bytes: u64,
    pub quota_eviction_fraction: f64,
    pub min_quota_evictions: usize,
}

impl Default for CompactSection {
    fn default() -> Self {
        let config = CompactConfig::default();
        Self {
            max_item_bytes: DEFAULT_COMPACT_ITEM_CEILING,
            quota_eviction_fraction: config.quota_eviction_fraction,
            min_quota_evictions: config.min_quota_evictions,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BulkSection {
    /// Fraction of entries evicted per capacity breach
    pub eviction_fraction: f64,
}

impl Default for BulkSection {
    fn default() -> Self {
        Self {
            eviction_fraction: BulkConfig::default().eviction_fraction,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionSection {
    pub chunk_size: usize,
    pub category_chunk_size: usize,
    pub write_concurrency: usize,
    pub batch_pause_ms: u64,
    pub high_band_size: usize,
    pub medium_band_size: usize,
    pub medium_fragment_size: usize,
    pub low_fragment_size: usize,
}

impl Default for PartitionSection {
    fn default() -> Self {
        let config = PartitionConfig::default();
        Self {
            chunk_size: config.chunk_size,
            category_chunk_size: config.category_chunk_size,
            write_concurrency: config.write_concurrency,
            batch_pause_ms: partition::DEFAULT_BATCH_PAUSE.as_millis() as u64,
            high_band_size: config.high_band_size,
            medium_band_size: config.medium_band_size,
            medium_fragment_size: config.medium_fragment_size,
            low_fragment_size: config.low_fragment_size,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorSection {
    /// Skip detection and use this environment
    pub environment: Option<Environment>,
    /// Monitoring endpoint used as the load monitor
    pub load_monitor_url: Option<String>,
    pub chunk_threshold: usize,
    pub priority_threshold: usize,
    pub escalation_load: f64,
    pub escalation_samples: usize,
    pub peak_start_hour: u32,
    pub peak_end_hour: u32,
    pub peak_hour_factor: f64,
    pub utc_offset_minutes: i32,
}

impl Default for SelectorSection {
    fn default() -> Self {
        let config = SelectorConfig::default();
        Self {
            environment: None,
            load_monitor_url: None,
            chunk_threshold: selector::DEFAULT_CHUNK_THRESHOLD,
            priority_threshold: selector::DEFAULT_PRIORITY_THRESHOLD,
            escalation_load: config.escalation_load,
            escalation_samples: config.escalation_samples,
            peak_start_hour: config.peak_start_hour,
            peak_end_hour: config.peak_end_hour,
            peak_hour_factor: config.peak_hour_factor,
            utc_offset_minutes: config.utc_offset_minutes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchSection {
    pub timeout_secs: u64,
    pub user_agent: String,
}

impl Default for FetchSection {
    fn default() -> Self {
        let config = HttpFetcherConfig::default();
        Self {
            timeout_secs: config.timeout.as_secs(),
            user_agent: config.user_agent,
        }
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub storage: StorageSection,
    pub ttl: TtlSection,
    pub compression: CompressionSection,
    pub compact: CompactSection,
    pub bulk: BulkSection,
    pub partition: PartitionSection,
    pub selector: SelectorSection,
    pub fetch: FetchSection,
    pub sweep_interval_secs: u64,
    pub schema_version: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            storage: StorageSection::default(),
            ttl: TtlSection::default(),
            compression: CompressionSection::default(),
            compact: CompactSection::default(),
            bulk: BulkSection::default(),
            partition: PartitionSection::default(),
            selector: SelectorSection::default(),
            fetch: FetchSection::default(),
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL.as_secs(),
            schema_version: SCHEMA_VERSION.to_string(),
        }
    }
}

impl EngineConfig {
    /// Load and validate a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_yaml(&raw)
    }

    /// Parse and validate YAML text
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let config: EngineConfig = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let fraction = |name: &str, v: f64| {
            if v > 0.0 && v <= 1.0 {
                Ok(())
            } else {
                Err(Error::Config(format!("{name} must be in (0, 1], got {v}")))
            }
        };
        fraction("compact.quota_eviction_fraction", self.compact.quota_eviction_fraction)?;
        fraction("bulk.eviction_fraction", self.bulk.eviction_fraction)?;

        if self.partition.chunk_size == 0 || self.partition.category_chunk_size == 0 {
            return Err(Error::Config("partition chunk sizes must be positive".into()));
        }
        if self.partition.write_concurrency == 0 {
            return Err(Error::Config("partition.write_concurrency must be positive".into()));
        }
        if self.selector.peak_start_hour > 23
            || self.selector.peak_end_hour > 23
            || self.selector.peak_start_hour > self.selector.peak_end_hour
        {
            return Err(Error::Config(format!(
                "invalid peak window {}..={}",
                self.selector.peak_start_hour, self.selector.peak_end_hour
            )));
        }
        if self.selector.utc_offset_minutes.abs() >= 24 * 60 {
            return Err(Error::Config("selector.utc_offset_minutes out of range".into()));
        }
        if self.ttl.channels_secs == 0 || self.ttl.metadata_secs == 0 || self.ttl.epg_secs == 0 {
            return Err(Error::Config("TTLs must be positive".into()));
        }
        if self.schema_version.trim().is_empty() {
            return Err(Error::Config("schema_version must not be empty".into()));
        }
        Ok(())
    }

    pub fn manager_config(&self) -> ManagerConfig {
        let defaults = ManagerConfig::default();
        ManagerConfig {
            ttl: TtlPolicy {
                channels: Duration::from_secs(self.ttl.channels_secs),
                metadata: Duration::from_secs(self.ttl.metadata_secs),
                epg: Duration::from_secs(self.ttl.epg_secs),
            },
            compression: CompressionPolicy {
                enabled: self.compression.enabled,
                channels_threshold: self.compression.channels_threshold,
                metadata_threshold: self.compression.metadata_threshold,
                epg_threshold: self.compression.epg_threshold,
            },
            compact: CompactConfig {
                max_item_bytes: self.compact.max_item_bytes,
                quota_eviction_fraction: self.compact.quota_eviction_fraction,
                min_quota_evictions: self.compact.min_quota_evictions,
                ..defaults.compact
            },
            compact_quota_bytes: self.storage.compact_quota_bytes,
            bulk: BulkConfig {
                max_bytes: self.storage.bulk_max_bytes,
                eviction_fraction: self.bulk.eviction_fraction,
                ..defaults.bulk
            },
            ..defaults
        }
    }

    pub fn partition_config(&self) -> PartitionConfig {
        let p = &self.partition;
        PartitionConfig {
            chunk_size: p.chunk_size,
            category_chunk_size: p.category_chunk_size,
            write_concurrency: p.write_concurrency,
            batch_pause: Duration::from_millis(p.batch_pause_ms),
            high_band_size: p.high_band_size,
            medium_band_size: p.medium_band_size,
            medium_fragment_size: p.medium_fragment_size,
            low_fragment_size: p.low_fragment_size,
        }
    }

    pub fn selector_config(&self) -> SelectorConfig {
        let s = &self.selector;
        SelectorConfig {
            chunk_threshold: s.chunk_threshold,
            priority_threshold: s.priority_threshold,
            escalation_load: s.escalation_load,
            escalation_samples: s.escalation_samples,
            peak_start_hour: s.peak_start_hour,
            peak_end_hour: s.peak_end_hour,
            peak_hour_factor: s.peak_hour_factor,
            utc_offset_minutes: s.utc_offset_minutes,
            ..SelectorConfig::default()
        }
    }

    pub fn fetcher_config(&self) -> HttpFetcherConfig {
        HttpFetcherConfig {
            timeout: Duration::from_secs(self.fetch.timeout_secs),
            user_agent: self.fetch.user_agent.clone(),
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

// =============================================================================
// Tests
// =============================================================================
