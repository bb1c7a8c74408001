//! Environment Profiles
//!
//! Target tier capacities and performance budgets per deployment
//! environment. Profiles are ordered from most conservative to most
//! generous.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::{TierCapacities, TierCapacity};
use crate::error::Error;

const MB: u64 = 1024 * 1024;

/// Deployment environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Development,
    Staging,
    ProductionLow,
    ProductionHigh,
    Emergency,
}

impl Environment {
    pub const ALL: [Environment; 5] = [
        Environment::Development,
        Environment::Staging,
        Environment::ProductionLow,
        Environment::ProductionHigh,
        Environment::Emergency,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Staging => "staging",
            Environment::ProductionLow => "production_low",
            Environment::ProductionHigh => "production_high",
            Environment::Emergency => "emergency",
        }
    }

    /// Next more generous profile, if any
    pub fn escalated(&self) -> Option<Environment> {
        match self {
            Environment::Development => Some(Environment::Staging),
            Environment::Staging => Some(Environment::ProductionLow),
            Environment::ProductionLow => Some(Environment::ProductionHigh),
            Environment::ProductionHigh => Some(Environment::Emergency),
            Environment::Emergency => None,
        }
    }

    /// Capacities and targets of this environment
    pub fn profile(&self) -> EnvironmentProfile {
        let (volatile, compact, bulk, latency_ms, hit_rate) = match self {
            Environment::Development => (
                TierCapacity::new(1_000, 4 * MB),
                TierCapacity::new(500, 10 * MB),
                TierCapacity::new(10_000, 20 * MB),
                200,
                0.85,
            ),
            Environment::Staging => (
                TierCapacity::new(2_000, 8 * MB),
                TierCapacity::new(1_000, 20 * MB),
                TierCapacity::new(20_000, 40 * MB),
                150,
                0.88,
            ),
            Environment::ProductionLow => (
                TierCapacity::new(5_000, 20 * MB),
                TierCapacity::new(2_500, 50 * MB),
                TierCapacity::new(50_000, 100 * MB),
                100,
                0.90,
            ),
            Environment::ProductionHigh => (
                TierCapacity::new(10_000, 50 * MB),
                TierCapacity::new(5_000, 100 * MB),
                TierCapacity::new(100_000, 200 * MB),
                50,
                0.95,
            ),
            Environment::Emergency => (
                TierCapacity::new(100_000, 100 * MB),
                TierCapacity::new(10_000, 200 * MB),
                TierCapacity::new(250_000, 500 * MB),
                50,
                0.95,
            ),
        };
        EnvironmentProfile {
            environment: *self,
            capacities: TierCapacities {
                volatile,
                compact,
                bulk,
            },
            latency_target: Duration::from_millis(latency_ms),
            hit_rate_target: hit_rate,
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "development" | "dev" => Ok(Environment::Development),
            "staging" | "test" => Ok(Environment::Staging),
            "production" | "production_low" | "prod" => Ok(Environment::ProductionLow),
            "production_high" => Ok(Environment::ProductionHigh),
            "emergency" | "production_extreme" => Ok(Environment::Emergency),
            other => Err(Error::Config(format!("unknown environment '{other}'"))),
        }
    }
}

/// Tier capacities and budgets of one environment
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EnvironmentProfile {
    pub environment: Environment,
    pub capacities: TierCapacities,
    /// Maximum acceptable access latency
    #[serde(serialize_with = "serialize_millis")]
    pub latency_target: Duration,
    /// Minimum acceptable overall hit rate
    pub hit_rate_target: f64,
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

impl EnvironmentProfile {
    /// Total byte budget across tiers
    pub fn total_bytes(&self) -> u64 {
        self.capacities.volatile.max_bytes + self.capacities.compact.max_bytes + self.capacities.bulk.max_bytes
    }
}

/// Explicit peak events and their capacity multipliers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeakEvent {
    Sports,
    News,
    General,
}

impl PeakEvent {
    pub fn factor(&self) -> f64 {
        match self {
            PeakEvent::Sports => 3.0,
            PeakEvent::News => 2.0,
            PeakEvent::General => 1.5,
        }
    }
}

impl FromStr for PeakEvent {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sports" => Ok(PeakEvent::Sports),
            "news" => Ok(PeakEvent::News),
            "general" => Ok(PeakEvent::General),
            other => Err(Error::Config(format!("unknown peak event '{other}'"))),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
