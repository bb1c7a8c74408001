//! Catalog Partition Strategies
//!
//! Splits a parsed catalog into fragments stored through the tiered cache
//! manager, and reads windows of it back.
//!
//! # Key layout
//!
//! ```text
//! {catalog_id}:strategy          partition metadata (written last)
//! {catalog_id}:chunk_{n}         chunked
//! {catalog_id}:cat_{idx}_{sub}   by-category
//! {catalog_id}:{band}_{n}        by-priority (high / medium / low)
//! {catalog_id}:summaries         metadata-only
//! ```
//!
//! Strategies run as an ordered fallback chain (see [`store::CatalogStore`]).
//! Fragments only become reachable once the metadata entry is stored, so a
//! failed strategy leaves nothing a reader can see.

pub mod category;
pub mod chunked;
pub mod metadata_only;
pub mod priority;
pub mod store;

use std::fmt;
use std::time::Duration;

use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::cache::{ContentType, TieredCacheManager};
use crate::catalog::Channel;
use crate::error::{Error, Result};

pub use metadata_only::ChannelSummary;
pub use priority::{Band, CategoryPopularity, UsageProfile};
pub use store::{CatalogStore, PartitionReport, StrategyAttempt};

/// Channels per chunk
pub const DEFAULT_CHUNK_SIZE: usize = 500;

/// Channels per category fragment
pub const DEFAULT_CATEGORY_CHUNK_SIZE: usize = 200;

/// Concurrent fragment writes per batch
pub const DEFAULT_WRITE_CONCURRENCY: usize = 10;

/// Pause between write batches
pub const DEFAULT_BATCH_PAUSE: Duration = Duration::from_millis(50);

/// Partition strategy identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StrategyKind {
    #[serde(rename = "chunks")]
    Chunked,
    #[serde(rename = "categories")]
    Category,
    #[serde(rename = "priority")]
    Priority,
    #[serde(rename = "metadata_only")]
    MetadataOnly,
}

impl StrategyKind {
    /// Fallback order
    pub const CANONICAL: [StrategyKind; 4] = [
        StrategyKind::Chunked,
        StrategyKind::Category,
        StrategyKind::Priority,
        StrategyKind::MetadataOnly,
    ];

    /// Stored name
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::Chunked => "chunks",
            StrategyKind::Category => "categories",
            StrategyKind::Priority => "priority",
            StrategyKind::MetadataOnly => "metadata_only",
        }
    }

    /// `lead` followed by the rest in canonical order
    pub fn plan_led_by(lead: StrategyKind) -> Vec<StrategyKind> {
        std::iter::once(lead)
            .chain(Self::CANONICAL.into_iter().filter(|k| *k != lead))
            .collect()
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Partitioning configuration
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionConfig {
    /// Channels per chunk
    pub chunk_size: usize,
    /// Channels per category fragment
    pub category_chunk_size: usize,
    /// Concurrent fragment writes per batch
    pub write_concurrency: usize,
    /// Pause between write batches
    pub batch_pause: Duration,
    /// Size of the high priority band (one fragment)
    pub high_band_size: usize,
    /// Size of the medium priority band
    pub medium_band_size: usize,
    /// Fragment size within the medium band
    pub medium_fragment_size: usize,
    /// Fragment size within the low band
    pub low_fragment_size: usize,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            category_chunk_size: DEFAULT_CATEGORY_CHUNK_SIZE,
            write_concurrency: DEFAULT_WRITE_CONCURRENCY,
            batch_pause: DEFAULT_BATCH_PAUSE,
            high_band_size: 1_000,
            medium_band_size: 4_000,
            medium_fragment_size: 1_000,
            low_fragment_size: 2_000,
        }
    }
}

// =============================================================================
// Metadata
// =============================================================================

/// One category of a by-category layout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryIndex {
    /// Position in first-appearance order (used in keys)
    pub index: usize,
    /// Category label
    pub name: String,
    /// Sanitized label, for diagnostics
    pub slug: String,
    /// Channels in the category
    pub count: usize,
    /// Fragments written
    pub fragments: usize,
}

/// One band of a by-priority layout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandIndex {
    pub band: Band,
    pub count: usize,
    pub fragment_size: usize,
    pub fragments: usize,
}

/// Strategy-specific indices
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy")]
pub enum PartitionLayout {
    #[serde(rename = "chunks")]
    Chunked {
        total_channels: usize,
        chunk_size: usize,
        chunk_count: usize,
    },
    #[serde(rename = "categories")]
    Category {
        total_channels: usize,
        categories: Vec<CategoryIndex>,
    },
    #[serde(rename = "priority")]
    Priority {
        total_channels: usize,
        bands: Vec<BandIndex>,
    },
    #[serde(rename = "metadata_only")]
    MetadataOnly { total_channels: usize },
}

impl PartitionLayout {
    /// Which strategy wrote this layout
    pub fn strategy(&self) -> StrategyKind {
        match self {
            PartitionLayout::Chunked { .. } => StrategyKind::Chunked,
            PartitionLayout::Category { .. } => StrategyKind::Category,
            PartitionLayout::Priority { .. } => StrategyKind::Priority,
            PartitionLayout::MetadataOnly { .. } => StrategyKind::MetadataOnly,
        }
    }

    /// Channels in the catalog
    pub fn total_channels(&self) -> usize {
        match self {
            PartitionLayout::Chunked { total_channels, .. }
            | PartitionLayout::Category { total_channels, .. }
            | PartitionLayout::Priority { total_channels, .. }
            | PartitionLayout::MetadataOnly { total_channels } => *total_channels,
        }
    }

    /// Whether full channels can be rebuilt from this layout
    pub fn holds_full_channels(&self) -> bool {
        !matches!(self, PartitionLayout::MetadataOnly { .. })
    }
}

/// The single metadata record of a partitioned catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionMetadata {
    pub catalog_id: String,
    /// Content type of the fragments
    pub content_type: ContentType,
    /// Epoch ms
    pub written_at: u64,
    #[serde(flatten)]
    pub layout: PartitionLayout,
}

// =============================================================================
// Fragments
// =============================================================================

/// A channel tagged with its source position
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequencedChannel {
    pub seq: usize,
    #[serde(flatten)]
    pub channel: Channel,
}

/// Restore source order and drop sequence numbers
pub(crate) fn into_source_order(mut items: Vec<SequencedChannel>) -> Vec<Channel> {
    items.sort_by_key(|s| s.seq);
    items.into_iter().map(|s| s.channel).collect()
}

/// Result of a retrieval
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum CatalogSlice {
    /// Full channels
    Channels(Vec<Channel>),
    /// Summaries from a metadata-only layout
    Summaries(Vec<ChannelSummary>),
}

impl CatalogSlice {
    pub fn len(&self) -> usize {
        match self {
            CatalogSlice::Channels(c) => c.len(),
            CatalogSlice::Summaries(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Full channels, if this slice holds them
    pub fn into_channels(self) -> Option<Vec<Channel>> {
        match self {
            CatalogSlice::Channels(c) => Some(c),
            CatalogSlice::Summaries(_) => None,
        }
    }
}

/// What to read back
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowRequest {
    /// First position (after the category filter)
    #[serde(default)]
    pub offset: usize,
    /// Maximum items; `None` reads to the end
    #[serde(default)]
    pub limit: Option<usize>,
    /// Restrict to one category
    #[serde(default)]
    pub category: Option<String>,
}

impl WindowRequest {
    /// The whole catalog
    pub fn all() -> Self {
        Self::default()
    }

    /// `[offset, offset + limit)`
    pub fn window(offset: usize, limit: usize) -> Self {
        Self {
            offset,
            limit: Some(limit),
            category: None,
        }
    }

    /// One whole category
    pub fn category(name: impl Into<String>) -> Self {
        Self {
            category: Some(name.into()),
            ..Self::default()
        }
    }

    /// Restrict to one category
    pub fn in_category(mut self, name: impl Into<String>) -> Self {
        self.category = Some(name.into());
        self
    }

    /// Apply offset and limit to an ordered list
    pub(crate) fn slice<T>(&self, items: Vec<T>) -> Vec<T> {
        let take = self.limit.unwrap_or(usize::MAX);
        items.into_iter().skip(self.offset).take(take).collect()
    }
}

pub fn metadata_key(catalog_id: &str) -> String {
    format!("{catalog_id}:strategy")
}

pub fn catalog_prefix(catalog_id: &str) -> String {
    format!("{catalog_id}:")
}

/// Fragment reads and throttled writes for one catalog
pub(crate) struct Fragments<'a> {
    pub manager: &'a TieredCacheManager,
    pub config: &'a PartitionConfig,
    pub catalog_id: &'a str,
    pub content_type: ContentType,
}

impl<'a> Fragments<'a> {
    pub fn key(&self, fragment: &str) -> String {
        format!("{}:{}", self.catalog_id, fragment)
    }

    /// Serialize every fragment, failing the strategy on the first error
    pub fn encode<T: Serialize>(
        &self,
        strategy: StrategyKind,
        fragments: impl IntoIterator<Item = (String, T)>,
    ) -> Result<Vec<(String, String)>> {
        fragments
            .into_iter()
            .map(|(key, value)| {
                serde_json::to_string(&value)
                    .map(|payload| (key, payload))
                    .map_err(|e| self.failure(strategy, e.to_string()))
            })
            .collect()
    }

    /// Write fragments in batches of `write_concurrency`, pausing between batches
    pub async fn write_all(&self, strategy: StrategyKind, items: Vec<(String, String)>) -> Result<()> {
        let batch_size = self.config.write_concurrency.max(1);
        let total = items.len();
        let mut items = items.into_iter();
        let mut written = 0;

        loop {
            let batch: Vec<_> = items.by_ref().take(batch_size).collect();
            if batch.is_empty() {
                break;
            }
            let outcomes = join_all(batch.into_iter().map(|(key, payload)| async move {
                let outcome = self.manager.set_raw(&key, payload, self.content_type).await;
                (key, outcome)
            }))
            .await;

            if let Some((key, _)) = outcomes.iter().find(|(_, o)| !o.is_stored()) {
                return Err(self.failure(strategy, format!("fragment {key} was not stored")));
            }
            written += outcomes.len();

            if written < total && !self.config.batch_pause.is_zero() {
                tokio::time::sleep(self.config.batch_pause).await;
            }
        }
        Ok(())
    }

    /// Read one fragment; `None` if missing or undecodable
    pub async fn read<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.manager.get(key, self.content_type).await
    }

    /// Read fragments concurrently; `None` if any is missing
    pub async fn read_many<T: DeserializeOwned>(&self, keys: &[String]) -> Option<Vec<T>> {
        join_all(keys.iter().map(|k| self.read::<T>(k)))
            .await
            .into_iter()
            .collect()
    }

    pub fn failure(&self, strategy: StrategyKind, reason: impl Into<String>) -> Error {
        Error::PartitionStrategyFailure {
            strategy: strategy.to_string(),
            catalog_id: self.catalog_id.to_string(),
            reason: reason.into(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
