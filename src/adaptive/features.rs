// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Feature flags and their tiers.
//!
//! A critical-tier flag is always enabled; nothing in the controller can
//! turn it off.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeatureTier {
    Critical,
    High,
    Medium,
    Low,
}

impl FeatureTier {
    pub const ALL: [FeatureTier; 4] = [Self::Critical, Self::High, Self::Medium, Self::Low];
}

impl std::fmt::Display for FeatureTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Critical => write!(f, "critical"),
            Self::High => write!(f, "high"),
            Self::Medium => write!(f, "medium"),
            Self::Low => write!(f, "low"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureFlag {
    pub name: String,
    pub enabled: bool,
    pub tier: FeatureTier,
    /// Rough share of store load this feature generates (0.0 - 1.0)
    pub estimated_load: f64,
    /// The feature degrades to a non-cached path when disabled
    pub has_fallback: bool,
}

impl FeatureFlag {
    pub fn new(name: impl Into<String>, tier: FeatureTier, estimated_load: f64, has_fallback: bool) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            tier,
            estimated_load,
            has_fallback,
        }
    }

    #[must_use]
    pub fn is_critical(&self) -> bool {
        self.tier == FeatureTier::Critical
    }
}

/// Flags every deployment starts with.
#[must_use]
pub fn default_features() -> Vec<FeatureFlag> {
    use FeatureTier::*;
    vec![
        FeatureFlag::new("auth_caching", Critical, 0.05, false),
        FeatureFlag::new("session_caching", Critical, 0.10, false),
        FeatureFlag::new("rate_limiting", Critical, 0.05, false),
        FeatureFlag::new("course_caching", High, 0.15, true),
        FeatureFlag::new("query_batching", High, 0.05, true),
        FeatureFlag::new("user_profile_caching", Medium, 0.10, true),
        FeatureFlag::new("search_caching", Medium, 0.10, true),
        FeatureFlag::new("realtime_invalidation", Medium, 0.05, true),
        FeatureFlag::new("analytics_caching", Low, 0.15, true),
        FeatureFlag::new("recommendation_caching", Low, 0.10, true),
        FeatureFlag::new("cache_warming", Low, 0.10, true),
    ]
}
