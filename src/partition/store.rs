//! Catalog Store - Strategy Fallback Chain
//!
//! Ingests a channel list by running partition strategies in plan order
//! until one succeeds, then writes the metadata record that makes its
//! fragments reachable. Retrieval dispatches on that record.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::instrument;

use super::{
    category, catalog_prefix, chunked, metadata_key, metadata_only, priority, Band,
    CatalogSlice, CategoryPopularity, Fragments, PartitionConfig, PartitionLayout,
    PartitionMetadata, StrategyKind, UsageProfile, WindowRequest,
};
use crate::cache::{ContentType, TieredCacheManager};
use crate::catalog::Channel;
use crate::error::{Error, Result};

/// Outcome of one strategy in the chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StrategyAttempt {
    pub strategy: StrategyKind,
    pub succeeded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

/// Result of a successful ingestion
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionReport {
    pub catalog_id: String,
    pub total_channels: usize,
    /// Strategy whose layout is now live
    pub strategy: StrategyKind,
    /// Every attempt, in order
    pub attempts: Vec<StrategyAttempt>,
    pub elapsed_ms: u64,
}

impl PartitionReport {
    /// Strategies that failed before the live one
    pub fn failed(&self) -> impl Iterator<Item = &StrategyAttempt> {
        self.attempts.iter().filter(|a| !a.succeeded)
    }
}

/// Partitioned catalog storage over the tiered cache
pub struct CatalogStore {
    manager: Arc<TieredCacheManager>,
    config: PartitionConfig,
    usage: RwLock<UsageProfile>,
    popularity: RwLock<CategoryPopularity>,
}

impl CatalogStore {
    pub fn new(manager: Arc<TieredCacheManager>) -> Self {
        Self::with_config(manager, PartitionConfig::default())
    }

    pub fn with_config(manager: Arc<TieredCacheManager>, config: PartitionConfig) -> Self {
        Self {
            manager,
            config,
            usage: RwLock::new(UsageProfile::default()),
            popularity: RwLock::new(CategoryPopularity::default()),
        }
    }

    pub fn manager(&self) -> &Arc<TieredCacheManager> {
        &self.manager
    }

    pub fn config(&self) -> &PartitionConfig {
        &self.config
    }

    // =========================================================================
    // Usage
    // =========================================================================

    /// Snapshot of the usage profile
    pub fn usage(&self) -> UsageProfile {
        self.usage.read().clone()
    }

    pub fn set_usage(&self, usage: UsageProfile) {
        *self.usage.write() = usage;
    }

    pub fn add_favorite(&self, channel_id: &str) {
        self.usage.write().add_favorite(channel_id);
    }

    pub fn record_view(&self, channel_id: &str) {
        let now = self.manager.now_ms();
        self.usage.write().record_view(channel_id, now);
    }

    pub fn set_popularity(&self, popularity: CategoryPopularity) {
        *self.popularity.write() = popularity;
    }

    // =========================================================================
    // Ingestion
    // =========================================================================

    /// Partition `channels` under `catalog_id`, trying `plan` in order
    ///
    /// Fragments left by the previous ingestion of this id are removed first.
    #[instrument(skip(self, channels, plan), fields(channels = channels.len()))]
    pub async fn ingest(
        &self,
        catalog_id: &str,
        channels: &[Channel],
        content_type: ContentType,
        plan: &[StrategyKind],
    ) -> Result<PartitionReport> {
        let started = Instant::now();
        let removed = self.invalidate(catalog_id).await;
        if removed > 0 {
            tracing::debug!(catalog = %catalog_id, removed, "Removed previous catalog fragments");
        }

        let fragments = Fragments {
            manager: &self.manager,
            config: &self.config,
            catalog_id,
            content_type,
        };
        let usage = self.usage();
        let popularity = self.popularity.read().clone();

        let mut attempts = Vec::with_capacity(plan.len());
        for &strategy in plan {
            let attempt_started = Instant::now();
            let result = match strategy {
                StrategyKind::Chunked => chunked::write(&fragments, channels).await,
                StrategyKind::Category => category::write(&fragments, channels).await,
                StrategyKind::Priority => {
                    priority::write(&fragments, channels, &usage, &popularity).await
                }
                StrategyKind::MetadataOnly => metadata_only::write(&fragments, channels).await,
            };
            let result = match result {
                Ok(layout) => self.commit(&fragments, strategy, layout).await,
                Err(e) => Err(e),
            };
            let elapsed_ms = attempt_started.elapsed().as_millis() as u64;

            match result {
                Ok(()) => {
                    attempts.push(StrategyAttempt {
                        strategy,
                        succeeded: true,
                        error: None,
                        elapsed_ms,
                    });
                    let report = PartitionReport {
                        catalog_id: catalog_id.to_string(),
                        total_channels: channels.len(),
                        strategy,
                        attempts,
                        elapsed_ms: started.elapsed().as_millis() as u64,
                    };
                    tracing::info!(
                        catalog = %catalog_id,
                        strategy = %strategy,
                        channels = channels.len(),
                        failed_attempts = report.failed().count(),
                        elapsed_ms = report.elapsed_ms,
                        "Catalog partitioned"
                    );
                    return Ok(report);
                }
                Err(e) => {
                    tracing::warn!(catalog = %catalog_id, strategy = %strategy, "Partition strategy failed: {}", e);
                    attempts.push(StrategyAttempt {
                        strategy,
                        succeeded: false,
                        error: Some(e.to_string()),
                        elapsed_ms,
                    });
                }
            }
        }

        Err(Error::AllStrategiesFailed {
            catalog_id: catalog_id.to_string(),
            attempted: attempts
                .iter()
                .map(|a| a.strategy.as_str())
                .collect::<Vec<_>>()
                .join(", "),
        })
    }

    /// Store the metadata record; the layout is live once this succeeds
    async fn commit(&self, fragments: &Fragments<'_>, strategy: StrategyKind, layout: PartitionLayout) -> Result<()> {
        let metadata = PartitionMetadata {
            catalog_id: fragments.catalog_id.to_string(),
            content_type: fragments.content_type,
            written_at: self.manager.now_ms(),
            layout,
        };
        let outcome = self
            .manager
            .set(&metadata_key(fragments.catalog_id), &metadata, ContentType::Metadata)
            .await
            .map_err(|e| fragments.failure(strategy, e.to_string()))?;
        if !outcome.is_stored() {
            return Err(fragments.failure(strategy, "metadata record was not stored"));
        }
        Ok(())
    }

    // =========================================================================
    // Retrieval
    // =========================================================================

    /// The live layout of `catalog_id`
    pub async fn metadata(&self, catalog_id: &str) -> Option<PartitionMetadata> {
        self.manager
            .get(&metadata_key(catalog_id), ContentType::Metadata)
            .await
    }

    /// Read a window or category; `None` when the catalog or any needed
    /// fragment is missing
    pub async fn retrieve(&self, catalog_id: &str, request: &WindowRequest) -> Option<CatalogSlice> {
        let metadata = self.metadata(catalog_id).await?;
        let fragments = Fragments {
            manager: &self.manager,
            config: &self.config,
            catalog_id,
            content_type: metadata.content_type,
        };

        let slice = match &metadata.layout {
            PartitionLayout::Chunked {
                total_channels,
                chunk_size,
                chunk_count,
            } => CatalogSlice::Channels(
                chunked::read(&fragments, *total_channels, *chunk_size, *chunk_count, request).await?,
            ),
            PartitionLayout::Category { categories, .. } => {
                CatalogSlice::Channels(category::read(&fragments, categories, request).await?)
            }
            PartitionLayout::Priority { bands, .. } => {
                CatalogSlice::Channels(priority::read(&fragments, bands, request).await?)
            }
            PartitionLayout::MetadataOnly { .. } => {
                CatalogSlice::Summaries(metadata_only::read(&fragments, request).await?)
            }
        };
        if slice.is_empty() {
            tracing::debug!(catalog = %catalog_id, "Retrieval produced no channels");
        }
        Some(slice)
    }

    /// Every channel, in source order; `None` for metadata-only layouts
    pub async fn load_all(&self, catalog_id: &str) -> Option<Vec<Channel>> {
        self.retrieve(catalog_id, &WindowRequest::all())
            .await?
            .into_channels()
    }

    /// One priority band in priority order; `None` unless the layout is
    /// by-priority
    pub async fn band(&self, catalog_id: &str, band: Band) -> Option<Vec<Channel>> {
        let metadata = self.metadata(catalog_id).await?;
        let PartitionLayout::Priority { bands, .. } = &metadata.layout else {
            return None;
        };
        let fragments = Fragments {
            manager: &self.manager,
            config: &self.config,
            catalog_id,
            content_type: metadata.content_type,
        };
        priority::read_band(&fragments, bands, band).await
    }

    /// Drop every key of `catalog_id`
    pub async fn invalidate(&self, catalog_id: &str) -> usize {
        self.manager.invalidate_prefix(&catalog_prefix(catalog_id)).await
    }
}

// =============================================================================
// Tests
// =============================================================================
