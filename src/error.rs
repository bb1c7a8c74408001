//! Error types for the IPTV catalog cache engine

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the cache engine
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Tier Errors
    // =========================================================================
    /// Backing medium missing or disabled
    #[error("Storage unavailable for {tier} tier: {reason}")]
    StorageUnavailable { tier: String, reason: String },

    /// Durable write rejected by the backing medium's quota
    #[error("Quota exceeded writing '{key}' ({size} bytes)")]
    QuotaExceeded { key: String, size: u64 },

    /// Entry could not be deserialized or decompressed
    #[error("Corrupt entry '{key}': {reason}")]
    CorruptEntry { key: String, reason: String },

    // =========================================================================
    // Catalog Errors
    // =========================================================================
    /// Raw source is not a known catalog format
    #[error("Failed to parse catalog from {source_url}: {reason}")]
    ParseFailure { source_url: String, reason: String },

    /// Fetching the raw catalog failed
    #[error("Failed to fetch catalog from {source_url}: {reason}")]
    FetchFailed { source_url: String, reason: String },

    /// A single partition strategy could not write its fragments
    #[error("Partition strategy '{strategy}' failed for catalog {catalog_id}: {reason}")]
    PartitionStrategyFailure {
        strategy: String,
        catalog_id: String,
        reason: String,
    },

    /// Every strategy in the fallback chain failed
    #[error("All partition strategies failed for catalog {catalog_id} (tried: {attempted})")]
    AllStrategiesFailed {
        catalog_id: String,
        attempted: String,
    },

    // =========================================================================
    // Plumbing
    // =========================================================================
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML configuration error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build a corrupt-entry error
    pub fn corrupt(key: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Error::CorruptEntry {
            key: key.into(),
            reason: reason.to_string(),
        }
    }

    /// Build a storage-unavailable error
    pub fn unavailable(tier: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Error::StorageUnavailable {
            tier: tier.into(),
            reason: reason.to_string(),
        }
    }

    /// Returns true for quota rejections (the only error that triggers evict-and-retry)
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, Error::QuotaExceeded { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::QuotaExceeded {
            key: "cat:chunk_0".to_string(),
            size: 2048,
        };
        assert_eq!(
            err.to_string(),
            "Quota exceeded writing 'cat:chunk_0' (2048 bytes)"
        );
        assert!(err.is_quota_exceeded());
        assert!(!Error::corrupt("k", "bad token").is_quota_exceeded());
    }
}
