//! Catalog Fetchers
//!
//! Where raw catalog text comes from: HTTP, the local filesystem, or a
//! canned map for tests and offline use.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::Client;
use tracing::{debug, instrument};

use crate::error::{Error, Result};

/// Loads raw catalog text for a source
#[async_trait]
pub trait CatalogFetcher: Send + Sync {
    /// Fetch the raw text of `source`
    async fn fetch(&self, source: &str) -> Result<String>;
}

fn fetch_failed(source: &str, reason: impl Into<String>) -> Error {
    Error::FetchFailed {
        source_url: source.to_string(),
        reason: reason.into(),
    }
}

// =============================================================================
// HTTP
// =============================================================================

/// HTTP fetcher configuration
#[derive(Debug, Clone)]
pub struct HttpFetcherConfig {
    /// Whole-request timeout
    pub timeout: Duration,
    /// User agent sent to providers
    pub user_agent: String,
}

impl Default for HttpFetcherConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: format!("iptv-cache/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Fetches catalogs over HTTP(S)
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    /// Create a fetcher with default settings
    pub fn new() -> Result<Self> {
        Self::with_config(HttpFetcherConfig::default())
    }

    /// Create a fetcher with custom settings
    pub fn with_config(config: HttpFetcherConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent)
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl CatalogFetcher for HttpFetcher {
    #[instrument(skip(self))]
    async fn fetch(&self, source: &str) -> Result<String> {
        let response = self.client.get(source).send().await?;
        if !response.status().is_success() {
            return Err(fetch_failed(
                source,
                format!("request failed with status: {}", response.status()),
            ));
        }
        let body = response.text().await?;
        debug!(bytes = body.len(), "Fetched catalog over HTTP");
        Ok(body)
    }
}

// =============================================================================
// Filesystem
// =============================================================================

/// Reads catalogs from local files (`file://` prefixes are accepted)
#[derive(Debug, Clone, Default)]
pub struct FileFetcher {
    root: Option<PathBuf>,
}

impl FileFetcher {
    /// Resolve sources as given
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve relative sources against `root`
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    fn resolve(&self, source: &str) -> PathBuf {
        let path = PathBuf::from(source.strip_prefix("file://").unwrap_or(source));
        match &self.root {
            Some(root) if path.is_relative() => root.join(path),
            _ => path,
        }
    }
}

#[async_trait]
impl CatalogFetcher for FileFetcher {
    async fn fetch(&self, source: &str) -> Result<String> {
        let path = self.resolve(source);
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| fetch_failed(source, format!("{}: {}", path.display(), e)))
    }
}

/// Picks HTTP or file fetching by the source's scheme
pub struct AutoFetcher {
    http: HttpFetcher,
    file: FileFetcher,
}

impl AutoFetcher {
    pub fn new() -> Result<Self> {
        Self::with_config(HttpFetcherConfig::default())
    }

    pub fn with_config(http: HttpFetcherConfig) -> Result<Self> {
        Ok(Self {
            http: HttpFetcher::with_config(http)?,
            file: FileFetcher::new(),
        })
    }
}

#[async_trait]
impl CatalogFetcher for AutoFetcher {
    async fn fetch(&self, source: &str) -> Result<String> {
        if source.starts_with("http://") || source.starts_with("https://") {
            self.http.fetch(source).await
        } else {
            self.file.fetch(source).await
        }
    }
}

// =============================================================================
// Canned
// =============================================================================

/// Serves canned bodies and counts fetches
#[derive(Debug, Default)]
pub struct StaticFetcher {
    bodies: RwLock<HashMap<String, String>>,
    fetches: AtomicU64,
}

impl StaticFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the body of `source`
    pub fn insert(&self, source: impl Into<String>, body: impl Into<String>) {
        self.bodies.write().insert(source.into(), body.into());
    }

    /// Builder form of [`insert`](Self::insert)
    pub fn with(self, source: impl Into<String>, body: impl Into<String>) -> Self {
        self.insert(source, body);
        self
    }

    /// Number of fetches served (including failures)
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl CatalogFetcher for StaticFetcher {
    async fn fetch(&self, source: &str) -> Result<String> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        self.bodies
            .read()
            .get(source)
            .cloned()
            .ok_or_else(|| fetch_failed(source, "no such source"))
    }
}

// =============================================================================
// Tests
// =============================================================================
