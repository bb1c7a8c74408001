//! Cache Entry Types
//!
//! The unit of storage shared by every tier, plus the content-type enum that
//! drives TTL and compression policy.
//!
//! # Wire Format
//!
//! Durable tiers persist entries as a tagged JSON structure:
//!
//! ```text
//! {"key":..,"type":..,"compressed":..,"size":..,"createdAt":..,
//!  "lastAccessAt":..,"accessCount":..,"payload":..}
//! ```

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Kind of content held by an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    /// Channel-list fragments (longest TTL)
    Channels,
    /// Partition metadata and other bookkeeping
    Metadata,
    /// Program-guide fragments (shortest TTL)
    Epg,
}

impl ContentType {
    /// Every content type, in TTL order (longest first)
    pub const ALL: [ContentType; 3] = [ContentType::Channels, ContentType::Metadata, ContentType::Epg];

    /// Stable lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Channels => "channels",
            ContentType::Metadata => "metadata",
            ContentType::Epg => "epg",
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Entry bookkeeping without the payload
///
/// Durable tiers keep these in their in-memory indices so scans and
/// eviction never touch payload bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryMeta {
    /// Content type
    pub content_type: ContentType,
    /// Whether the payload is compressed
    pub compressed: bool,
    /// Stored payload size in bytes
    pub size_bytes: u64,
    /// Creation timestamp (epoch ms)
    pub created_at: u64,
    /// Last access timestamp (epoch ms)
    pub last_access_at: u64,
    /// Number of reads
    pub access_count: u64,
}

impl EntryMeta {
    /// Record a read at `now`
    #[inline]
    pub fn record_access(&mut self, now: u64) {
        self.last_access_at = now;
        self.access_count = self.access_count.saturating_add(1);
    }
}

/// A cached value with its metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    /// Namespaced key
    pub key: String,
    /// Content type
    #[serde(rename = "type")]
    pub content_type: ContentType,
    /// Out-of-band compression flag
    pub compressed: bool,
    /// Size of `payload` in bytes
    #[serde(rename = "size")]
    pub size_bytes: u64,
    /// Creation timestamp (epoch ms)
    pub created_at: u64,
    /// Last access timestamp (epoch ms)
    pub last_access_at: u64,
    /// Number of reads
    pub access_count: u64,
    /// Serialized value (JSON text, possibly compressed)
    pub payload: String,
}

impl CacheEntry {
    /// Create a fresh entry stamped at `now`
    pub fn new(
        key: impl Into<String>,
        payload: String,
        content_type: ContentType,
        compressed: bool,
        now: u64,
    ) -> Self {
        Self {
            key: key.into(),
            content_type,
            compressed,
            size_bytes: payload.len() as u64,
            created_at: now,
            last_access_at: now,
            access_count: 0,
            payload,
        }
    }

    /// Rebuild an entry from index metadata and a payload
    pub fn from_parts(key: impl Into<String>, meta: EntryMeta, payload: String) -> Self {
        Self {
            key: key.into(),
            content_type: meta.content_type,
            compressed: meta.compressed,
            size_bytes: payload.len() as u64,
            created_at: meta.created_at,
            last_access_at: meta.last_access_at,
            access_count: meta.access_count,
            payload,
        }
    }

    /// Metadata view
    pub fn meta(&self) -> EntryMeta {
        EntryMeta {
            content_type: self.content_type,
            compressed: self.compressed,
            size_bytes: self.size_bytes,
            created_at: self.created_at,
            last_access_at: self.last_access_at,
            access_count: self.access_count,
        }
    }

    /// Stored size in bytes
    #[inline]
    pub fn size(&self) -> u64 {
        self.size_bytes
    }

    /// Age at `now`
    #[inline]
    pub fn age_ms(&self, now: u64) -> u64 {
        now.saturating_sub(self.created_at)
    }

    /// True once the entry is strictly older than `ttl`
    #[inline]
    pub fn is_expired(&self, ttl: Duration, now: u64) -> bool {
        self.age_ms(now) > ttl.as_millis() as u64
    }

    /// Record a read at `now`
    #[inline]
    pub fn record_access(&mut self, now: u64) {
        self.last_access_at = now;
        self.access_count = self.access_count.saturating_add(1);
    }

    /// Serialize to the durable wire format
    pub fn to_bytes(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Deserialize from the durable wire format
    ///
    /// The declared size must match the payload; anything else is corrupt.
    pub fn from_bytes(key: &str, data: &[u8]) -> Result<Self> {
        let entry: CacheEntry =
            serde_json::from_slice(data).map_err(|e| Error::corrupt(key, e))?;
        if entry.size_bytes != entry.payload.len() as u64 {
            return Err(Error::corrupt(
                key,
                format!(
                    "declared size {} does not match payload size {}",
                    entry.size_bytes,
                    entry.payload.len()
                ),
            ));
        }
        Ok(entry)
    }
}

/// Fast non-cryptographic hash (FxHash algorithm)
#[inline]
pub fn fx_hash(bytes: &[u8]) -> u64 {
    const SEED: u64 = 0x517cc1b727220a95;
    let mut hash = SEED;
    for &byte in bytes {
        hash = hash.rotate_left(5) ^ (byte as u64);
        hash = hash.wrapping_mul(SEED);
    }
    hash
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn make_entry(payload: &str) -> CacheEntry {
        CacheEntry::new("cat:chunk_0", payload.to_string(), ContentType::Channels, false, 1_000)
    }

    #[test]
    fn test_entry_size_tracks_payload() {
        let entry = make_entry("[1,2,3]");
        assert_eq!(entry.size(), 7);
        assert_eq!(entry.access_count, 0);
        assert_eq!(entry.created_at, entry.last_access_at);
    }

    #[test]
    fn test_expiry_is_strict() {
        let entry = make_entry("{}");
        let ttl = Duration::from_millis(500);
        assert!(!entry.is_expired(ttl, 1_499));
        assert!(!entry.is_expired(ttl, 1_500));
        assert!(entry.is_expired(ttl, 1_501));
    }

    #[test]
    fn test_wire_format_field_names() {
        let entry = make_entry("{}");
        let json = String::from_utf8(entry.to_bytes().unwrap().to_vec()).unwrap();
        for field in [
            "\"key\"",
            "\"type\":\"channels\"",
            "\"compressed\"",
            "\"size\"",
            "\"createdAt\"",
            "\"lastAccessAt\"",
            "\"accessCount\"",
            "\"payload\"",
        ] {
            assert!(json.contains(field), "missing {field} in {json}");
        }

        let back = CacheEntry::from_bytes("cat:chunk_0", json.as_bytes()).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn test_size_mismatch_is_corrupt() {
        let mut entry = make_entry("{}");
        entry.size_bytes = 99;
        let bytes = serde_json::to_vec(&entry).unwrap();
        assert_matches!(
            CacheEntry::from_bytes("cat:chunk_0", &bytes),
            Err(Error::CorruptEntry { .. })
        );
        assert_matches!(
            CacheEntry::from_bytes("x", b"not json"),
            Err(Error::CorruptEntry { .. })
        );
    }

    #[test]
    fn test_record_access() {
        let mut entry = make_entry("{}");
        entry.record_access(2_000);
        entry.record_access(3_000);
        assert_eq!(entry.access_count, 2);
        assert_eq!(entry.last_access_at, 3_000);
        assert_eq!(entry.meta().access_count, 2);
    }

    #[test]
    fn test_fx_hash_is_stable() {
        assert_eq!(fx_hash(b"abc"), fx_hash(b"abc"));
        assert_ne!(fx_hash(b"abc"), fx_hash(b"abd"));
    }
}
