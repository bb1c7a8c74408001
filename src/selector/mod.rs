//! Adaptive Strategy Selector
//!
//! Chooses tier capacities from the deployment environment and current
//! conditions, and the partition strategy plan for a catalog.
//!
//! # Capacity pipeline
//!
//! ```text
//! profile(environment) ──► × max(peak hour, peak event) ──► low-memory caps
//! ```
//!
//! Escalation is automatic and only ever moves to a more generous profile.
//! Moving down takes an explicit [`AdaptiveSelector::deescalate`].

pub mod detect;
pub mod profile;

use chrono::{DateTime, FixedOffset, Timelike};
use parking_lot::RwLock;
use serde::Serialize;

use crate::cache::{TierCapacities, TierCapacity, TieredCacheManager};
use crate::error::{Error, Result};
use crate::partition::StrategyKind;

pub use detect::{
    detect, Detection, DetectionContext, DetectionSource, HttpLoadMonitor, LoadMonitor, StaticLoadMonitor,
};
pub use profile::{Environment, EnvironmentProfile, PeakEvent};

/// Catalogs at least this large lead with chunking
pub const DEFAULT_CHUNK_THRESHOLD: usize = 10_000;

/// Catalogs larger than this lead with priority when usage is known
pub const DEFAULT_PRIORITY_THRESHOLD: usize = 25_000;

/// Selector configuration
#[derive(Debug, Clone, PartialEq)]
pub struct SelectorConfig {
    /// Catalogs at least this large lead with chunking
    pub chunk_threshold: usize,
    /// Catalogs larger than this lead with priority when usage is known
    pub priority_threshold: usize,
    /// Requests per minute considered high load
    pub escalation_load: f64,
    /// Consecutive high-load samples before escalating
    pub escalation_samples: usize,
    /// First peak hour (local)
    pub peak_start_hour: u32,
    /// Last peak hour (local, inclusive)
    pub peak_end_hour: u32,
    /// Capacity multiplier during peak hours
    pub peak_hour_factor: f64,
    /// Local time offset from UTC, in minutes
    pub utc_offset_minutes: i32,
    /// Bulk byte cap as a fraction of available memory
    pub bulk_memory_fraction: f64,
    /// Volatile and compact byte cap as a fraction of available memory
    pub tier_memory_fraction: f64,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            chunk_threshold: DEFAULT_CHUNK_THRESHOLD,
            priority_threshold: DEFAULT_PRIORITY_THRESHOLD,
            escalation_load: 80.0,
            escalation_samples: 3,
            peak_start_hour: 19,
            peak_end_hour: 23,
            peak_hour_factor: 1.5,
            utc_offset_minutes: 0,
            bulk_memory_fraction: 0.10,
            tier_memory_fraction: 0.05,
        }
    }
}

#[derive(Debug)]
struct SelectorState {
    environment: Environment,
    source: DetectionSource,
    high_load_streak: usize,
    peak_event: Option<PeakEvent>,
    available_memory: Option<u64>,
}

/// Snapshot of the selector's decisions, for diagnostics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recommendation {
    pub environment: Environment,
    pub detected_by: DetectionSource,
    pub profile: EnvironmentProfile,
    /// Effective capacities after peak and memory adjustments
    pub capacities: TierCapacities,
    pub peak_factor: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peak_event: Option<PeakEvent>,
    pub memory_capped: bool,
}

/// Adaptive strategy selector
pub struct AdaptiveSelector {
    config: SelectorConfig,
    state: RwLock<SelectorState>,
}

impl AdaptiveSelector {
    /// Selector starting from a detection result
    pub fn new(config: SelectorConfig, detection: Detection) -> Self {
        tracing::info!(
            environment = %detection.environment,
            source = ?detection.source,
            "Cache environment selected"
        );
        Self {
            config,
            state: RwLock::new(SelectorState {
                environment: detection.environment,
                source: detection.source,
                high_load_streak: 0,
                peak_event: None,
                available_memory: None,
            }),
        }
    }

    /// Run detection and build the selector
    pub async fn detect(
        config: SelectorConfig,
        context: &DetectionContext,
        monitor: Option<&dyn LoadMonitor>,
    ) -> Self {
        let detection = detect::detect(context, monitor).await;
        Self::new(config, detection)
    }

    pub fn config(&self) -> &SelectorConfig {
        &self.config
    }

    pub fn environment(&self) -> Environment {
        self.state.read().environment
    }

    pub fn profile(&self) -> EnvironmentProfile {
        self.environment().profile()
    }

    // =========================================================================
    // Escalation
    // =========================================================================

    /// Feed one load sample (requests per minute)
    ///
    /// Returns the new environment when this sample triggered an escalation.
    pub fn record_load(&self, requests_per_min: f64) -> Option<Environment> {
        let mut state = self.state.write();
        if requests_per_min <= self.config.escalation_load {
            state.high_load_streak = 0;
            return None;
        }
        state.high_load_streak += 1;
        if state.high_load_streak < self.config.escalation_samples.max(1) {
            return None;
        }
        state.high_load_streak = 0;
        let next = state.environment.escalated()?;
        tracing::info!(from = %state.environment, to = %next, "Escalating cache profile under sustained load");
        state.environment = next;
        Some(next)
    }

    /// Move down to `target`; only lower profiles are accepted
    pub fn deescalate(&self, target: Environment) -> Result<Environment> {
        let mut state = self.state.write();
        if target >= state.environment {
            return Err(Error::Config(format!(
                "cannot de-escalate from {} to {}",
                state.environment, target
            )));
        }
        tracing::info!(from = %state.environment, to = %target, "De-escalating cache profile");
        state.environment = target;
        state.high_load_streak = 0;
        Ok(target)
    }

    // =========================================================================
    // Real-time adjustments
    // =========================================================================

    pub fn start_peak_event(&self, event: PeakEvent) {
        tracing::info!(event = ?event, factor = event.factor(), "Peak event started");
        self.state.write().peak_event = Some(event);
    }

    pub fn end_peak_event(&self) {
        self.state.write().peak_event = None;
    }

    /// Available host memory in bytes; `None` lifts the caps
    pub fn report_available_memory(&self, bytes: Option<u64>) {
        if let Some(bytes) = bytes {
            tracing::debug!(available = bytes, "Host memory report");
        }
        self.state.write().available_memory = bytes;
    }

    /// Whether `now_ms` falls in the local peak window
    pub fn is_peak_hour(&self, now_ms: u64) -> bool {
        let Some(offset) = FixedOffset::east_opt(self.config.utc_offset_minutes * 60) else {
            return false;
        };
        let Some(utc) = DateTime::from_timestamp_millis(now_ms as i64) else {
            return false;
        };
        let hour = utc.with_timezone(&offset).hour();
        (self.config.peak_start_hour..=self.config.peak_end_hour).contains(&hour)
    }

    /// Capacity multiplier in effect at `now_ms`
    pub fn peak_factor(&self, now_ms: u64) -> f64 {
        let hour = if self.is_peak_hour(now_ms) {
            self.config.peak_hour_factor
        } else {
            1.0
        };
        let event = self.state.read().peak_event.map_or(1.0, |e| e.factor());
        hour.max(event)
    }

    /// Effective capacities at `now_ms`
    pub fn capacities(&self, now_ms: u64) -> TierCapacities {
        let mut capacities = self.profile().capacities.scaled(self.peak_factor(now_ms));
        if let Some(available) = self.state.read().available_memory {
            let cap = |tier: TierCapacity, fraction: f64| TierCapacity {
                max_bytes: tier.max_bytes.min((available as f64 * fraction).round() as u64),
                ..tier
            };
            capacities.volatile = cap(capacities.volatile, self.config.tier_memory_fraction);
            capacities.compact = cap(capacities.compact, self.config.tier_memory_fraction);
            capacities.bulk = cap(capacities.bulk, self.config.bulk_memory_fraction);
        }
        capacities
    }

    /// Resize the manager's tiers to the current capacities
    pub async fn apply(&self, manager: &TieredCacheManager) -> TierCapacities {
        let capacities = self.capacities(manager.now_ms());
        if capacities != manager.capacities() {
            manager.apply_capacities(capacities).await;
        }
        capacities
    }

    // =========================================================================
    // Strategy plan
    // =========================================================================

    /// Ordered partition strategies for a catalog of `catalog_size` channels
    pub fn plan(&self, catalog_size: usize, storage_critical: bool, has_usage: bool) -> Vec<StrategyKind> {
        if storage_critical {
            return vec![StrategyKind::MetadataOnly];
        }
        let lead = if catalog_size > self.config.priority_threshold && has_usage {
            StrategyKind::Priority
        } else if catalog_size >= self.config.chunk_threshold {
            StrategyKind::Chunked
        } else {
            StrategyKind::Category
        };
        StrategyKind::plan_led_by(lead)
    }

    pub fn recommendation(&self, now_ms: u64) -> Recommendation {
        let (environment, detected_by, peak_event, memory_capped) = {
            let state = self.state.read();
            (
                state.environment,
                state.source,
                state.peak_event,
                state.available_memory.is_some(),
            )
        };
        Recommendation {
            environment,
            detected_by,
            profile: environment.profile(),
            capacities: self.capacities(now_ms),
            peak_factor: self.peak_factor(now_ms),
            peak_event,
            memory_capped,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
