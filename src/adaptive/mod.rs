// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Adaptive feature gating under resource pressure.

pub mod controller;
pub mod features;
pub mod mode;

pub use controller::{
    AdaptiveController, FeatureListener, OptimizationReport, StoreUsageAuditor, TierCounts, UsageAuditor,
};
pub use features::{default_features, FeatureFlag, FeatureTier};
pub use mode::{OptimizationMode, UsageThresholds};
