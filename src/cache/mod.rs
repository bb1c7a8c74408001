//! Three-Tiered Catalog Cache
//!
//! Read-through / write-through caching with a volatile in-process tier and
//! two durable tiers.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                        Tiered Cache Manager                               │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  Volatile Tier        │ Compact Tier          │ Bulk Tier                 │
//! │  ┌────────────────┐   │ ┌──────────────────┐  │ ┌────────────────────┐    │
//! │  │ Strict LRU map │   │ │ KvBackend        │  │ │ BulkBackend (async)│    │
//! │  │ entries+bytes  │   │ │ quota, 2MB/item  │  │ │ access/created idx │    │
//! │  │ plain payloads │   │ │ evict 30% + retry│  │ │ evict 10% + retry  │    │
//! │  └────────────────┘   │ └──────────────────┘  │ └────────────────────┘    │
//! │         ▲             │         │             │           │               │
//! │         └─────────────┴─────────┴─────────────┴───────────┘               │
//! │                       promotion of durable hits                           │
//! │                                                                           │
//! │        Schema codec (alias table + URL interning), per-type TTL           │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Entry lifecycle
//!
//! - Written once by the manager: compressed when above the content type's
//!   threshold, routed to compact or bulk by stored size, mirrored plain
//!   into the volatile tier
//! - Read fastest tier first; stale entries are deleted on read
//! - Removed by TTL sweeps, prefix invalidation, or capacity eviction

pub mod bulk;
pub mod clock;
pub mod compact;
pub mod compression;
pub mod entry;
pub mod manager;
pub mod metrics;
pub mod policy;
pub mod tier;
pub mod volatile;

#[cfg(test)]
mod proptest;

pub use bulk::{BulkBackend, BulkConfig, BulkTier, FsBulkBackend, InMemoryBulkBackend};
pub use clock::{system_clock, Clock, ManualClock, SharedClock, SystemClock};
pub use compact::{CompactConfig, CompactTier, FileKvBackend, KvBackend, MemoryKvBackend};
pub use compression::{AliasTable, CompressionManager, CompressionStats, SchemaCodec};
pub use entry::{CacheEntry, ContentType};
pub use manager::{
    ManagerConfig, ManagerStats, TierCapacities, TieredCacheManager, WriteOutcome, SCHEMA_MARKER_FILE,
};
pub use metrics::{CacheMetrics, MetricsSnapshot};
pub use policy::{CompressionPolicy, Freshness, TtlPolicy};
pub use tier::{TierCapacity, TierKind, TierStats, TierStore};
pub use volatile::{VolatileConfig, VolatileTier};

/// Current cache schema version
pub const SCHEMA_VERSION: &str = "2.0";

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_capacities() {
        assert_eq!(volatile::DEFAULT_VOLATILE_BYTES, 4 * 1024 * 1024);
        assert_eq!(compact::DEFAULT_COMPACT_BYTES, 5 * 1024 * 1024);
        assert_eq!(compact::DEFAULT_COMPACT_ITEM_CEILING, 2 * 1024 * 1024);
        assert_eq!(bulk::DEFAULT_BULK_BYTES, 50 * 1024 * 1024);
    }

    #[test]
    fn test_ttl_ordering() {
        let ttl = TtlPolicy::default();
        assert!(ttl.channels > ttl.metadata);
        assert!(ttl.metadata > ttl.epg);
    }
}
