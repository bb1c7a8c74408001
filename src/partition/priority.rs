//! By-Priority Partitioning
//!
//! Channels are scored from the viewer's usage and category popularity,
//! then split into bands: a small high band that is always cached whole, a
//! medium band and a low band of larger fragments.
//!
//! # Score packing
//!
//! ```text
//! favorite × 10⁹ + recency(0..=999) × 10⁶ + min(views, 999) × 10³ + min(popularity, 999)
//! ```
//!
//! Each component is capped below the weight of the next, so comparison is
//! lexicographic.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{
    into_source_order, BandIndex, Fragments, PartitionLayout, SequencedChannel, StrategyKind,
    WindowRequest,
};
use crate::catalog::Channel;
use crate::error::Result;

const FAVORITE_WEIGHT: u64 = 1_000_000_000;
const RECENCY_WEIGHT: u64 = 1_000_000;
const VIEWS_WEIGHT: u64 = 1_000;
const COMPONENT_CAP: u64 = 999;

/// Window over which recency decays to zero
pub const RECENCY_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Popularity for categories missing from the table
pub const DEFAULT_POPULARITY: u32 = 30;

/// Priority band
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Band {
    High,
    Medium,
    Low,
}

impl Band {
    pub const ALL: [Band; 3] = [Band::High, Band::Medium, Band::Low];

    pub fn as_str(&self) -> &'static str {
        match self {
            Band::High => "high",
            Band::Medium => "medium",
            Band::Low => "low",
        }
    }
}

impl fmt::Display for Band {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn band_key(band: Band, n: usize) -> String {
    format!("{}_{n}", band.as_str())
}

/// What the viewer watched and pinned
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageProfile {
    /// Favorite channel ids
    #[serde(default)]
    pub favorites: HashSet<String>,
    /// View count per channel id
    #[serde(default)]
    pub views: HashMap<String, u32>,
    /// Last watch per channel id (epoch ms)
    #[serde(default)]
    pub last_watched: HashMap<String, u64>,
}

impl UsageProfile {
    pub fn is_empty(&self) -> bool {
        self.favorites.is_empty() && self.views.is_empty() && self.last_watched.is_empty()
    }

    pub fn add_favorite(&mut self, id: impl Into<String>) {
        self.favorites.insert(id.into());
    }

    /// Record one view of `id` at `at` (epoch ms)
    pub fn record_view(&mut self, id: &str, at: u64) {
        *self.views.entry(id.to_string()).or_default() += 1;
        self.last_watched.insert(id.to_string(), at);
    }

    /// 999 right after a watch, decaying linearly to 0 over 24h
    fn recency(&self, id: &str, now: u64) -> u64 {
        let Some(&watched) = self.last_watched.get(id) else {
            return 0;
        };
        let window = RECENCY_WINDOW.as_millis() as u64;
        let age = now.saturating_sub(watched);
        if age >= window {
            0
        } else {
            COMPONENT_CAP - age * COMPONENT_CAP / window
        }
    }
}

/// Category popularity table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryPopularity {
    table: HashMap<String, u32>,
    fallback: u32,
}

impl Default for CategoryPopularity {
    fn default() -> Self {
        let table = [
            ("sports", 100),
            ("news", 90),
            ("movies", 80),
            ("entertainment", 70),
            ("music", 60),
            ("kids", 50),
            ("documentary", 40),
            ("adult", 10),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        Self {
            table,
            fallback: DEFAULT_POPULARITY,
        }
    }
}

impl CategoryPopularity {
    /// Override or add a category
    pub fn set(&mut self, category: &str, score: u32) {
        self.table.insert(category.to_lowercase(), score);
    }

    /// Popularity of a category (case-insensitive)
    pub fn score(&self, category: &str) -> u32 {
        self.table
            .get(&category.to_lowercase())
            .copied()
            .unwrap_or(self.fallback)
    }
}

/// Packed priority score
pub fn priority_score(
    channel: &Channel,
    usage: &UsageProfile,
    popularity: &CategoryPopularity,
    now: u64,
) -> u64 {
    let favorite = u64::from(usage.favorites.contains(&channel.id));
    let recency = usage.recency(&channel.id, now);
    let views = usage
        .views
        .get(&channel.id)
        .map_or(0, |v| u64::from(*v).min(COMPONENT_CAP));
    let category = u64::from(popularity.score(channel.category())).min(COMPONENT_CAP);

    favorite * FAVORITE_WEIGHT + recency * RECENCY_WEIGHT + views * VIEWS_WEIGHT + category
}

/// Channels in descending score order; ties keep source order
pub fn rank(
    channels: &[Channel],
    usage: &UsageProfile,
    popularity: &CategoryPopularity,
    now: u64,
) -> Vec<SequencedChannel> {
    let mut scored: Vec<(u64, usize)> = channels
        .iter()
        .enumerate()
        .map(|(seq, c)| (priority_score(c, usage, popularity, now), seq))
        .collect();
    scored.sort_by(|a, b| b.0.cmp(&a.0));
    scored
        .into_iter()
        .map(|(_, seq)| SequencedChannel {
            seq,
            channel: channels[seq].clone(),
        })
        .collect()
}

pub(crate) async fn write(
    fragments: &Fragments<'_>,
    channels: &[Channel],
    usage: &UsageProfile,
    popularity: &CategoryPopularity,
) -> Result<PartitionLayout> {
    let config = fragments.config;
    let ranked = rank(channels, usage, popularity, fragments.manager.now_ms());

    let high_end = config.high_band_size.min(ranked.len());
    let medium_end = (high_end + config.medium_band_size).min(ranked.len());
    let bands = [
        (Band::High, &ranked[..high_end], config.high_band_size.max(1)),
        (Band::Medium, &ranked[high_end..medium_end], config.medium_fragment_size.max(1)),
        (Band::Low, &ranked[medium_end..], config.low_fragment_size.max(1)),
    ];

    let mut indices = Vec::with_capacity(bands.len());
    let mut pending = Vec::new();
    for (band, members, fragment_size) in bands {
        let mut written = 0;
        for (n, fragment) in members.chunks(fragment_size).enumerate() {
            pending.push((fragments.key(&band_key(band, n)), fragment));
            written += 1;
        }
        indices.push(BandIndex {
            band,
            count: members.len(),
            fragment_size,
            fragments: written,
        });
    }

    let items = fragments.encode(StrategyKind::Priority, pending)?;
    fragments.write_all(StrategyKind::Priority, items).await?;

    Ok(PartitionLayout::Priority {
        total_channels: channels.len(),
        bands: indices,
    })
}

async fn read_band_items(fragments: &Fragments<'_>, index: &BandIndex) -> Option<Vec<SequencedChannel>> {
    let keys: Vec<String> = (0..index.fragments)
        .map(|n| fragments.key(&band_key(index.band, n)))
        .collect();
    let parts: Vec<Vec<SequencedChannel>> = fragments.read_many(&keys).await?;
    Some(parts.into_iter().flatten().collect())
}

/// One band in priority order
pub(crate) async fn read_band(
    fragments: &Fragments<'_>,
    bands: &[BandIndex],
    band: Band,
) -> Option<Vec<Channel>> {
    let Some(index) = bands.iter().find(|b| b.band == band) else {
        return Some(Vec::new());
    };
    let items = read_band_items(fragments, index).await?;
    Some(items.into_iter().map(|s| s.channel).collect())
}

/// Whole catalog or one category, in source order
pub(crate) async fn read(
    fragments: &Fragments<'_>,
    bands: &[BandIndex],
    request: &WindowRequest,
) -> Option<Vec<Channel>> {
    let mut all = Vec::new();
    for index in bands {
        all.extend(read_band_items(fragments, index).await?);
    }
    let mut channels = into_source_order(all);
    if let Some(category) = &request.category {
        channels.retain(|c| c.category() == category);
    }
    Some(request.slice(channels))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{ContentType, ManagerConfig, ManualClock, TieredCacheManager};
    use crate::partition::PartitionConfig;
    use std::sync::Arc;

    const NOW: u64 = 1_700_000_000_000;

    #[test]
    fn test_favorite_outranks_any_view_count() {
        let popularity = CategoryPopularity::default();
        let fav = Channel::new("fav", "F", "u").with_group("Adult");
        let busy = Channel::new("busy", "B", "u").with_group("Sports");

        let mut usage = UsageProfile::default();
        usage.add_favorite("fav");
        usage.views.insert("busy".into(), 1_000_000);
        usage.last_watched.insert("busy".into(), NOW);

        assert!(
            priority_score(&fav, &usage, &popularity, NOW) > priority_score(&busy, &usage, &popularity, NOW)
        );
    }

    #[test]
    fn test_score_components() {
        let popularity = CategoryPopularity::default();
        let ch = Channel::new("a", "A", "u").with_group("news");
        let mut usage = UsageProfile::default();
        assert_eq!(priority_score(&ch, &usage, &popularity, NOW), 90);

        usage.record_view("a", NOW - RECENCY_WINDOW.as_millis() as u64 / 2);
        let score = priority_score(&ch, &usage, &popularity, NOW);
        assert_eq!(score % 1_000, 90);
        assert_eq!(score / VIEWS_WEIGHT % 1_000, 1);
        assert_eq!(score / RECENCY_WEIGHT, 500);

        let other = Channel::new("b", "B", "u").with_group("Cooking");
        assert_eq!(priority_score(&other, &usage, &popularity, NOW), u64::from(DEFAULT_POPULARITY));
    }

    #[test]
    fn test_rank_is_stable() {
        let channels: Vec<_> = (0..5)
            .map(|i| Channel::new(format!("{i}"), "x", "u").with_group("Music"))
            .collect();
        let mut usage = UsageProfile::default();
        usage.add_favorite("3");
        let ranked = rank(&channels, &usage, &CategoryPopularity::default(), NOW);
        let order: Vec<_> = ranked.iter().map(|s| s.seq).collect();
        assert_eq!(order, vec![3, 0, 1, 2, 4]);
    }

    #[tokio::test]
    async fn test_bands() {
        let manager = TieredCacheManager::in_memory(ManagerConfig::default(), Arc::new(ManualClock::new(NOW))).await;
        let config = PartitionConfig {
            batch_pause: Duration::ZERO,
            high_band_size: 10,
            medium_band_size: 40,
            medium_fragment_size: 10,
            low_fragment_size: 20,
            ..Default::default()
        };
        let fragments = Fragments {
            manager: &manager,
            config: &config,
            catalog_id: "p",
            content_type: ContentType::Channels,
        };
        let channels: Vec<_> = (0..95)
            .map(|i| {
                Channel::new(format!("{i}"), "x", "u").with_group(if i >= 90 { "Sports" } else { "Other" })
            })
            .collect();
        let mut usage = UsageProfile::default();
        usage.add_favorite("42");

        let layout = write(&fragments, &channels, &usage, &CategoryPopularity::default()).await.unwrap();
        let PartitionLayout::Priority { bands, .. } = layout else {
            panic!("unexpected layout");
        };
        let shape: Vec<_> = bands.iter().map(|b| (b.count, b.fragments)).collect();
        assert_eq!(shape, vec![(10, 1), (40, 4), (45, 3)]);

        let high = read_band(&fragments, &bands, Band::High).await.unwrap();
        let ids: Vec<_> = high.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids[..6], ["42", "90", "91", "92", "93", "94"]);

        let whole = read(&fragments, &bands, &WindowRequest::all()).await.unwrap();
        assert!(whole.iter().enumerate().all(|(i, c)| c.id == i.to_string()));

        let sports = read(&fragments, &bands, &WindowRequest::category("Sports")).await.unwrap();
        assert_eq!(sports.len(), 5);
    }
}
