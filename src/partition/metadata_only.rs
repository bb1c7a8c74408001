//! Metadata-Only Partitioning
//!
//! Last resort when storage is critically low: every channel is reduced to a
//! summary and the whole catalog is stored as one fragment. Full channels are
//! rebuilt from the source, never from this layout.

use serde::{Deserialize, Serialize};

use super::{Fragments, PartitionLayout, StrategyKind, WindowRequest};
use crate::catalog::Channel;
use crate::error::Result;

pub const SUMMARIES_KEY: &str = "summaries";

/// Minimal channel fields
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSummary {
    pub id: String,
    pub name: String,
    pub category: String,
    pub has_logo: bool,
    #[serde(rename = "type")]
    pub stream_type: String,
}

impl From<&Channel> for ChannelSummary {
    fn from(channel: &Channel) -> Self {
        Self {
            id: channel.id.clone(),
            name: channel.name.clone(),
            category: channel.category().to_string(),
            has_logo: channel.logo.as_deref().is_some_and(|l| !l.is_empty()),
            stream_type: channel.stream_type.clone(),
        }
    }
}

pub(crate) async fn write(fragments: &Fragments<'_>, channels: &[Channel]) -> Result<PartitionLayout> {
    let summaries: Vec<ChannelSummary> = channels.iter().map(ChannelSummary::from).collect();
    let items = fragments.encode(
        StrategyKind::MetadataOnly,
        [(fragments.key(SUMMARIES_KEY), summaries)],
    )?;
    fragments.write_all(StrategyKind::MetadataOnly, items).await?;

    Ok(PartitionLayout::MetadataOnly {
        total_channels: channels.len(),
    })
}

pub(crate) async fn read(fragments: &Fragments<'_>, request: &WindowRequest) -> Option<Vec<ChannelSummary>> {
    let mut summaries: Vec<ChannelSummary> = fragments.read(&fragments.key(SUMMARIES_KEY)).await?;
    if let Some(category) = &request.category {
        summaries.retain(|s| &s.category == category);
    }
    Some(request.slice(summaries))
}

// =============================================================================
// Tests
// =============================================================================
