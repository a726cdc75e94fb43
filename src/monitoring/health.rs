// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Health classification and trend detection.
//!
//! Pure functions over samples; the service owns probing and storage.
//!
//! # Example
//!
//! ```
//! use resilient_cache::monitoring::{classify, HealthStatus};
//!
//! assert_eq!(classify(40.0, 30.0, 0), HealthStatus::Healthy);
//! assert_eq!(classify(600.0, 30.0, 0), HealthStatus::Degraded);
//! assert_eq!(classify(1200.0, 30.0, 0), HealthStatus::Unhealthy);
//!
//! // A burst of recent errors costs one level
//! assert_eq!(classify(40.0, 30.0, 11), HealthStatus::Degraded);
//! ```

use serde::Serialize;

/// Round-trip latency above which the store is unhealthy.
pub const UNHEALTHY_LATENCY_MS: f64 = 1000.0;
/// Round-trip latency above which the store is degraded.
pub const DEGRADED_LATENCY_MS: f64 = 500.0;
/// Memory usage above which the store is degraded.
pub const DEGRADED_MEMORY_PCT: f64 = 90.0;
/// More failures than this in the error window downgrade status one level.
pub const RECENT_ERROR_LIMIT: u64 = 10;

const TREND_WINDOW: usize = 3;
const LATENCY_DEADBAND: f64 = 0.10;
const ERROR_DEADBAND: f64 = 0.10;
const MEMORY_DEADBAND: f64 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy = 0,
    Degraded = 1,
    Unhealthy = 2,
}

impl HealthStatus {
    /// One level worse, saturating at Unhealthy.
    #[must_use]
    pub fn downgrade(self) -> Self {
        match self {
            Self::Healthy => Self::Degraded,
            Self::Degraded | Self::Unhealthy => Self::Unhealthy,
        }
    }

    #[must_use]
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Point-in-time health of the store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSample {
    pub status: HealthStatus,
    pub latency_ms: f64,
    pub memory_pct: f64,
    pub active_connections: u64,
    pub recent_error_count: u64,
    /// Unix millis
    pub timestamp: u64,
}

/// Classify a health reading. Latency dominates; memory can only degrade.
#[must_use]
pub fn classify(latency_ms: f64, memory_pct: f64, recent_errors: u64) -> HealthStatus {
    let base = if latency_ms > UNHEALTHY_LATENCY_MS {
        HealthStatus::Unhealthy
    } else if latency_ms > DEGRADED_LATENCY_MS || memory_pct > DEGRADED_MEMORY_PCT {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    };

    if recent_errors > RECENT_ERROR_LIMIT {
        base.downgrade()
    } else {
        base
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Improving,
    Stable,
    Degrading,
}

impl std::fmt::Display for Trend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Improving => write!(f, "improving"),
            Self::Stable => write!(f, "stable"),
            Self::Degrading => write!(f, "degrading"),
        }
    }
}

/// Per-dimension direction of the last few samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HealthTrends {
    pub latency: Trend,
    pub errors: Trend,
    pub memory: Trend,
}

impl Default for HealthTrends {
    fn default() -> Self {
        Self {
            latency: Trend::Stable,
            errors: Trend::Stable,
            memory: Trend::Stable,
        }
    }
}

impl HealthTrends {
    #[must_use]
    pub fn any_degrading(&self) -> bool {
        [self.latency, self.errors, self.memory].contains(&Trend::Degrading)
    }
}

/// For metrics where lower is better. `band` is relative to the previous mean.
fn direction(previous: f64, recent: f64, band: f64) -> Trend {
    if previous <= f64::EPSILON {
        return if recent > f64::EPSILON { Trend::Degrading } else { Trend::Stable };
    }
    let change = (recent - previous) / previous;
    if change > band {
        Trend::Degrading
    } else if change < -band {
        Trend::Improving
    } else {
        Trend::Stable
    }
}

fn mean(samples: &[&HealthSample], f: impl Fn(&HealthSample) -> f64) -> f64 {
    samples.iter().map(|s| f(s)).sum::<f64>() / samples.len() as f64
}

/// Compare the mean of the newest three samples with the three before them.
/// Fewer than six samples reads as stable across the board.
#[must_use]
pub fn compute_trends<'a, I>(history: I) -> HealthTrends
where
    I: IntoIterator<Item = &'a HealthSample>,
    I::IntoIter: DoubleEndedIterator,
{
    let newest: Vec<&HealthSample> = history.into_iter().rev().take(TREND_WINDOW * 2).collect();
    if newest.len() < TREND_WINDOW * 2 {
        return HealthTrends::default();
    }
    let (recent, previous) = newest.split_at(TREND_WINDOW);

    HealthTrends {
        latency: direction(
            mean(previous, |s| s.latency_ms),
            mean(recent, |s| s.latency_ms),
            LATENCY_DEADBAND,
        ),
        errors: direction(
            mean(previous, |s| s.recent_error_count as f64),
            mean(recent, |s| s.recent_error_count as f64),
            ERROR_DEADBAND,
        ),
        memory: direction(
            mean(previous, |s| s.memory_pct),
            mean(recent, |s| s.memory_pct),
            MEMORY_DEADBAND,
        ),
    }
}
