//! IPTV Cache - Multi-Tier Adaptive Catalog Cache
//!
//! A caching engine for very large IPTV catalogs (M3U playlists,
//! Xtream-Codes listings, XMLTV guides). Catalogs are fetched and parsed
//! once, partitioned into fragments sized for the available storage, and
//! spread across three tiers with read-through promotion.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                         CacheEngine                           │
//! ├───────────────────────────────────────────────────────────────┤
//! │  ┌────────────┐    ┌──────────────┐    ┌──────────────────┐   │
//! │  │ ParseCache │───▶│ CatalogStore │───▶│ TieredCache      │   │
//! │  │ (fetch +   │    │ (partition   │    │ Manager          │   │
//! │  │  parse)    │    │  strategies) │    │ volatile/compact │   │
//! │  └────────────┘    └──────────────┘    │ /bulk            │   │
//! │         ▲                              └──────────────────┘   │
//! │         │          ┌──────────────────┐          ▲            │
//! │         └──────────│ AdaptiveSelector │──────────┘            │
//! │                    │ (profile, plan)  │                       │
//! │                    └──────────────────┘                       │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`cache`] - Tier stores, compression, TTL policy and the tiered manager
//! - [`catalog`] - Channel model, catalog parsers and fetchers
//! - [`config`] - YAML engine configuration
//! - [`engine`] - The engine instance and its background sweeper
//! - [`error`] - Error types
//! - [`parse_cache`] - Fetch-once, parse-once catalog cache
//! - [`partition`] - Partition strategies and the catalog store
//! - [`selector`] - Environment profiles and strategy selection
//! - [`telemetry`] - Prometheus exposition

pub mod cache;
pub mod catalog;
pub mod config;
pub mod engine;
pub mod error;
pub mod parse_cache;
pub mod partition;
pub mod selector;
pub mod telemetry;

// Re-export commonly used types
pub use cache::{ContentType, TierKind, TieredCacheManager};
pub use catalog::{Channel, LoadOptions};
pub use config::EngineConfig;
pub use engine::{CacheEngine, EngineStats};
pub use error::{Error, Result};
pub use parse_cache::{LoadedCatalog, ParseCache};
pub use partition::{CatalogSlice, CatalogStore, StrategyKind, WindowRequest};
pub use selector::{AdaptiveSelector, Environment};
