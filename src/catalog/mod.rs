//! Catalog Model
//!
//! Channels as parsed from M3U playlists, Xtream-Codes JSON and XMLTV guides,
//! plus the load options that filter a parsed catalog.

pub mod fetch;
pub mod parser;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use fetch::{AutoFetcher, CatalogFetcher, FileFetcher, HttpFetcher, HttpFetcherConfig, StaticFetcher};
pub use parser::{detect_format, parse_catalog};

/// Category label for channels without a group
pub const UNCATEGORIZED: &str = "Uncategorized";

/// Default stream type
pub const DEFAULT_STREAM_TYPE: &str = "live";

fn default_stream_type() -> String {
    DEFAULT_STREAM_TYPE.to_string()
}

fn is_false(v: &bool) -> bool {
    !*v
}

/// A single channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    /// Stable identifier
    pub id: String,
    /// Display name
    pub name: String,
    /// Stream URL
    #[serde(default)]
    pub url: String,
    /// Logo URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logo: Option<String>,
    /// Group (category) label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Guide channel id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tvg_id: Option<String>,
    /// Stream type (`live`, `movie`, ...)
    #[serde(rename = "type", default = "default_stream_type")]
    pub stream_type: String,
    /// Flagged adult by the provider
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_adult: bool,
}

impl Channel {
    /// Minimal live channel
    pub fn new(id: impl Into<String>, name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            url: url.into(),
            logo: None,
            group: None,
            tvg_id: None,
            stream_type: default_stream_type(),
            is_adult: false,
        }
    }

    /// Set the group label
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Category label; empty or missing groups are `Uncategorized`
    pub fn category(&self) -> &str {
        match self.group.as_deref().map(str::trim) {
            Some(g) if !g.is_empty() => g,
            _ => UNCATEGORIZED,
        }
    }

    /// Adult by provider flag or by category name
    pub fn is_adult_content(&self) -> bool {
        if self.is_adult {
            return true;
        }
        let category = self.category().to_ascii_lowercase();
        category.contains("adult") || category.contains("xxx") || category.contains("18+")
    }
}

/// Source format of a catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CatalogFormat {
    /// `#EXTM3U` playlist
    M3u,
    /// Xtream-Codes JSON
    Xtream,
    /// XMLTV program guide
    Epg,
}

impl fmt::Display for CatalogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CatalogFormat::M3u => write!(f, "m3u"),
            CatalogFormat::Xtream => write!(f, "xtream"),
            CatalogFormat::Epg => write!(f, "epg"),
        }
    }
}

/// A parsed catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    /// Format it was parsed from
    pub format: CatalogFormat,
    /// Channels in source order
    pub channels: Vec<Channel>,
}

impl Catalog {
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

/// Options applied to a parsed catalog
///
/// They are part of the parse-cache key: different options cache separately.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LoadOptions {
    /// Drop adult channels
    #[serde(default)]
    pub exclude_adult: bool,
    /// Keep at most this many channels
    #[serde(default)]
    pub max_channels: Option<usize>,
}

impl LoadOptions {
    /// Stable textual form used in cache keys
    pub fn key_fragment(&self) -> String {
        format!(
            "adult={};max={}",
            !self.exclude_adult,
            self.max_channels.map_or_else(|| "all".to_string(), |n| n.to_string())
        )
    }

    /// Filter `channels` in place, keeping source order
    pub fn apply(&self, channels: &mut Vec<Channel>) {
        if self.exclude_adult {
            channels.retain(|c| !c.is_adult_content());
        }
        if let Some(max) = self.max_channels {
            channels.truncate(max);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
