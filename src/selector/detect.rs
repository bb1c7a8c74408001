//! Environment Detection
//!
//! Runs once at startup. Order: explicit deployment context, host name
//! heuristics, load monitor, then the development fallback.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;

use super::profile::Environment;
use crate::error::{Error, Result};

/// Environment variable naming the deployment environment
pub const ENVIRONMENT_VAR: &str = "IPTV_CACHE_ENV";

/// Load above this selects `production_high`
pub const HIGH_LOAD_THRESHOLD: f64 = 80.0;

/// How the environment was chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionSource {
    /// Explicit configuration or environment variable
    Deployment,
    /// Host name heuristics
    Host,
    /// Load monitor
    LoadMonitor,
    /// Nothing matched
    Fallback,
}

/// Detected environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Detection {
    pub environment: Environment,
    pub source: DetectionSource,
}

/// Source of a current load figure (0-100)
#[async_trait]
pub trait LoadMonitor: Send + Sync {
    async fn sample(&self) -> Result<f64>;
}

/// Load monitor reading `{"cpuUsage": n}` (or `cpu_usage`, `load`) from a
/// monitoring endpoint
pub struct HttpLoadMonitor {
    url: String,
    client: Client,
}

impl HttpLoadMonitor {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

#[async_trait]
impl LoadMonitor for HttpLoadMonitor {
    async fn sample(&self) -> Result<f64> {
        let body: serde_json::Value = self
            .client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        ["cpuUsage", "cpu_usage", "load"]
            .iter()
            .find_map(|field| body.get(*field).and_then(serde_json::Value::as_f64))
            .ok_or_else(|| Error::Internal(format!("no load figure in response from {}", self.url)))
    }
}

/// Fixed load figure
pub struct StaticLoadMonitor(pub f64);

#[async_trait]
impl LoadMonitor for StaticLoadMonitor {
    async fn sample(&self) -> Result<f64> {
        Ok(self.0)
    }
}

/// Inputs to detection
#[derive(Debug, Clone, Default)]
pub struct DetectionContext {
    /// Explicit environment (configuration or CLI)
    pub explicit: Option<Environment>,
    /// Value of `IPTV_CACHE_ENV`
    pub env_var: Option<String>,
    /// Host name
    pub hostname: Option<String>,
}

impl DetectionContext {
    /// Context from the running process
    pub fn from_process(explicit: Option<Environment>) -> Self {
        Self {
            explicit,
            env_var: std::env::var(ENVIRONMENT_VAR).ok(),
            hostname: hostname::get().ok().and_then(|h| h.into_string().ok()),
        }
    }
}

/// Environment implied by a host name, if any
///
/// Matches whole labels (split on `.` and `-`) and the top-level domain, so
/// `contest-edge` or `x.community` imply nothing.
pub fn classify_host(host: &str) -> Option<Environment> {
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    let tld = host.rsplit('.').next().unwrap_or_default();
    let has_label = |wanted: &[&str]| host.split(['.', '-']).any(|label| wanted.contains(&label));

    if has_label(&["localhost"]) || host.starts_with("127.") || tld == "local" {
        Some(Environment::Development)
    } else if has_label(&["staging", "test"]) {
        Some(Environment::Staging)
    } else if host.contains('.') && ["com", "net", "tv"].contains(&tld) {
        Some(Environment::ProductionLow)
    } else {
        None
    }
}

/// Detect the deployment environment
pub async fn detect(context: &DetectionContext, monitor: Option<&dyn LoadMonitor>) -> Detection {
    let deployment = |environment| Detection {
        environment,
        source: DetectionSource::Deployment,
    };

    if let Some(environment) = context.explicit {
        return deployment(environment);
    }
    if let Some(raw) = context.env_var.as_deref() {
        match raw.parse() {
            Ok(environment) => return deployment(environment),
            Err(e) => tracing::warn!("Ignoring {}: {}", ENVIRONMENT_VAR, e),
        }
    }
    if let Some(environment) = context.hostname.as_deref().and_then(classify_host) {
        return Detection {
            environment,
            source: DetectionSource::Host,
        };
    }
    if let Some(monitor) = monitor {
        match monitor.sample().await {
            Ok(load) => {
                let environment = if load > HIGH_LOAD_THRESHOLD {
                    Environment::ProductionHigh
                } else {
                    Environment::ProductionLow
                };
                return Detection {
                    environment,
                    source: DetectionSource::LoadMonitor,
                };
            }
            Err(e) => tracing::warn!("Load monitor failed: {}", e),
        }
    }

    Detection {
        environment: Environment::Development,
        source: DetectionSource::Fallback,
    }
}

// =============================================================================
// Tests
// =============================================================================
