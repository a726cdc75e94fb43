// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public types for the cache layer coordinator.

use serde::Serialize;
use thiserror::Error;

use crate::adaptive::OptimizationReport;
use crate::batching::{BatchError, BatchStats};
use crate::invalidation::{InvalidationStats, RuleError, TransportError};
use crate::monitoring::PerformanceReport;
use crate::resilience::circuit_breaker::CircuitSnapshot;
use crate::storage::traits::StoreError;

/// Layer lifecycle state.
///
/// Use [`super::CacheLayer::state()`] to check the current state or
/// [`super::CacheLayer::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LayerState {
    /// Built, background loops not started
    Created,
    /// Probing the store
    Connecting,
    /// Background loops running, accepting requests
    Ready,
    /// Run loop is applying config updates
    Running,
    /// Draining queued operations
    ShuttingDown,
    /// Every background task has exited
    Stopped,
}

impl std::fmt::Display for LayerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Ready => write!(f, "Ready"),
            Self::Running => write!(f, "Running"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Errors surfaced by the [`super::CacheLayer`] convenience API.
#[derive(Debug, Error)]
pub enum LayerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Batch(#[from] BatchError),

    #[error(transparent)]
    Rule(#[from] RuleError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Everything the layer knows about itself, in one serializable value.
#[derive(Debug, Clone, Serialize)]
pub struct LayerReport {
    pub instance_id: String,
    pub state: LayerState,
    pub circuits: Vec<CircuitSnapshot>,
    pub batching: BatchStats,
    pub optimization: OptimizationReport,
    pub performance: PerformanceReport,
    pub invalidation: InvalidationStats,
}

impl LayerReport {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
