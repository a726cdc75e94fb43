// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Optimization modes: how hard the layer sheds work under pressure.
//!
//! Three-level cascade driven by store resource usage:
//! - **Normal** (< relax): everything enabled
//! - **Conservative** (> soft): critical and high-tier features only,
//!   smaller batches spread over longer windows, breakers trip sooner
//! - **Aggressive** (> hard): critical features only, strongest throttling
//!
//! Between relax and soft the current mode is kept, so usage hovering
//! around a single threshold does not flap the mode.
//!
//! # Example
//!
//! ```
//! use resilient_cache::adaptive::{OptimizationMode, UsageThresholds};
//!
//! let t = UsageThresholds::default();
//! assert_eq!(OptimizationMode::from_usage(90.0, OptimizationMode::Normal, &t), OptimizationMode::Aggressive);
//! assert_eq!(OptimizationMode::from_usage(75.0, OptimizationMode::Normal, &t), OptimizationMode::Conservative);
//! assert_eq!(OptimizationMode::from_usage(30.0, OptimizationMode::Aggressive, &t), OptimizationMode::Normal);
//!
//! // Inside the band the mode sticks
//! assert_eq!(OptimizationMode::from_usage(60.0, OptimizationMode::Conservative, &t), OptimizationMode::Conservative);
//! ```

use serde::{Deserialize, Serialize};

use super::features::FeatureTier;
use crate::batching::BatchConfig;
use crate::resilience::circuit_breaker::CircuitConfig;

/// Usage percentages (0 - 100) that drive mode selection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UsageThresholds {
    pub soft: f64,
    pub hard: f64,
    /// Below this, return to normal
    pub relax: f64,
}

impl Default for UsageThresholds {
    fn default() -> Self {
        Self { soft: 70.0, hard: 85.0, relax: 50.0 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizationMode {
    Normal = 0,
    Conservative = 1,
    Aggressive = 2,
}

impl OptimizationMode {
    /// Pick a mode for the measured usage, keeping `current` inside the
    /// hysteresis band.
    #[must_use]
    pub fn from_usage(usage_pct: f64, current: Self, t: &UsageThresholds) -> Self {
        match usage_pct {
            u if u > t.hard => Self::Aggressive,
            u if u > t.soft => Self::Conservative,
            u if u < t.relax => Self::Normal,
            _ => current,
        }
    }

    /// Whether features of `tier` run in this mode.
    #[must_use]
    pub fn tier_enabled(&self, tier: FeatureTier) -> bool {
        match self {
            Self::Normal => true,
            Self::Conservative => matches!(tier, FeatureTier::Critical | FeatureTier::High),
            Self::Aggressive => tier == FeatureTier::Critical,
        }
    }

    /// Scale batching from its baseline: fewer operations per pipeline,
    /// longer collection windows.
    #[must_use]
    pub fn batch_config(&self, baseline: &BatchConfig) -> BatchConfig {
        let (divisor, factor) = match self {
            Self::Normal => return baseline.clone(),
            Self::Conservative => (2, 2),
            Self::Aggressive => (4, 4),
        };
        BatchConfig {
            max_batch_size: (baseline.max_batch_size / divisor).max(1),
            batch_timeout: baseline.batch_timeout.saturating_mul(factor),
            ..baseline.clone()
        }
    }

    /// Tighten a breaker from its baseline so it trips on less evidence.
    #[must_use]
    pub fn circuit_config(&self, baseline: &CircuitConfig) -> CircuitConfig {
        let (threshold_scale, rate_scale, recovery_scale) = match self {
            Self::Normal => return baseline.clone(),
            Self::Conservative => (0.66, 0.8, 1.5),
            Self::Aggressive => (0.5, 0.6, 2.0),
        };
        CircuitConfig {
            failure_threshold: ((f64::from(baseline.failure_threshold) * threshold_scale).round() as u32).max(1),
            expected_error_rate: (baseline.expected_error_rate * rate_scale).clamp(0.05, 1.0),
            recovery_timeout: baseline.recovery_timeout.mul_f64(recovery_scale),
            call_timeout: baseline.call_timeout,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Normal => "Normal operation, all features enabled",
            Self::Conservative => "Conservative - medium and low tier features paused",
            Self::Aggressive => "Aggressive - critical features only",
        }
    }
}

impl std::fmt::Display for OptimizationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::Conservative => write!(f, "conservative"),
            Self::Aggressive => write!(f, "aggressive"),
        }
    }
}
