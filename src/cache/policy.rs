//! Cache Lifetime and Compression Policies
//!
//! TTL and compression thresholds are decided per content type, never per
//! entry. [`Freshness`] bundles the TTL table with the shared clock so every
//! tier applies the same staleness rule.

use std::time::Duration;

use super::clock::SharedClock;
use super::entry::ContentType;

/// Default TTL for channel-list fragments (6 hours)
pub const DEFAULT_CHANNELS_TTL: Duration = Duration::from_secs(6 * 60 * 60);

/// Default TTL for metadata fragments (1 hour)
pub const DEFAULT_METADATA_TTL: Duration = Duration::from_secs(60 * 60);

/// Default TTL for EPG fragments (30 minutes)
pub const DEFAULT_EPG_TTL: Duration = Duration::from_secs(30 * 60);

/// Per-content-type time-to-live
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlPolicy {
    /// Channel lists
    pub channels: Duration,
    /// Metadata
    pub metadata: Duration,
    /// Program guide
    pub epg: Duration,
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self {
            channels: DEFAULT_CHANNELS_TTL,
            metadata: DEFAULT_METADATA_TTL,
            epg: DEFAULT_EPG_TTL,
        }
    }
}

impl TtlPolicy {
    /// TTL for a content type
    pub fn ttl_for(&self, content_type: ContentType) -> Duration {
        match content_type {
            ContentType::Channels => self.channels,
            ContentType::Metadata => self.metadata,
            ContentType::Epg => self.epg,
        }
    }
}

/// Per-content-type compression thresholds
///
/// Payloads strictly larger than the threshold go through the schema codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionPolicy {
    /// Enable compression at all
    pub enabled: bool,
    /// Threshold for channel lists in bytes
    pub channels_threshold: usize,
    /// Threshold for metadata in bytes
    pub metadata_threshold: usize,
    /// Threshold for EPG fragments in bytes
    pub epg_threshold: usize,
}

impl Default for CompressionPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            channels_threshold: 512,
            metadata_threshold: 1024,
            epg_threshold: 1024,
        }
    }
}

impl CompressionPolicy {
    /// Threshold for a content type
    pub fn threshold_for(&self, content_type: ContentType) -> usize {
        match content_type {
            ContentType::Channels => self.channels_threshold,
            ContentType::Metadata => self.metadata_threshold,
            ContentType::Epg => self.epg_threshold,
        }
    }

    /// Whether a payload of `len` bytes should be compressed
    pub fn should_compress(&self, content_type: ContentType, len: usize) -> bool {
        self.enabled && len > self.threshold_for(content_type)
    }
}

/// TTL table bound to a clock
#[derive(Debug, Clone)]
pub struct Freshness {
    ttl: TtlPolicy,
    clock: SharedClock,
}

impl Freshness {
    /// Bind a TTL policy to a clock
    pub fn new(ttl: TtlPolicy, clock: SharedClock) -> Self {
        Self { ttl, clock }
    }

    /// Current time in epoch ms
    #[inline]
    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// The TTL table
    pub fn policy(&self) -> &TtlPolicy {
        &self.ttl
    }

    /// Shared clock handle
    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// True when an entry created at `created_at` is stale at `now`
    #[inline]
    pub fn is_stale(&self, created_at: u64, content_type: ContentType, now: u64) -> bool {
        now.saturating_sub(created_at) > self.ttl.ttl_for(content_type).as_millis() as u64
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::clock::ManualClock;
    use std::sync::Arc;

    #[test]
    fn test_ttl_ordering() {
        let ttl = TtlPolicy::default();
        assert!(ttl.ttl_for(ContentType::Channels) > ttl.ttl_for(ContentType::Metadata));
        assert!(ttl.ttl_for(ContentType::Metadata) > ttl.ttl_for(ContentType::Epg));
    }

    #[test]
    fn test_compression_thresholds() {
        let policy = CompressionPolicy::default();
        assert!(!policy.should_compress(ContentType::Channels, 512));
        assert!(policy.should_compress(ContentType::Channels, 513));
        assert!(!policy.should_compress(ContentType::Metadata, 1024));

        let disabled = CompressionPolicy {
            enabled: false,
            ..Default::default()
        };
        assert!(!disabled.should_compress(ContentType::Channels, 1 << 20));
    }

    #[test]
    fn test_freshness_boundary() {
        let clock = Arc::new(ManualClock::new(0));
        let freshness = Freshness::new(TtlPolicy::default(), clock);
        let ttl_ms = DEFAULT_EPG_TTL.as_millis() as u64;

        assert!(!freshness.is_stale(0, ContentType::Epg, ttl_ms - 1));
        assert!(!freshness.is_stale(0, ContentType::Epg, ttl_ms));
        assert!(freshness.is_stale(0, ContentType::Epg, ttl_ms + 1));
        // clock skew never produces a negative age
        assert!(!freshness.is_stale(10, ContentType::Epg, 0));
    }
}
