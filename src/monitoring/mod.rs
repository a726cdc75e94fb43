// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Operation metrics, store health sampling and trend detection.

pub mod health;
pub mod service;

pub use health::{classify, compute_trends, HealthSample, HealthStatus, HealthTrends, Trend};
pub use service::{MetricsExport, MonitoringService, OperationMetric, OperationSummary, PerformanceReport};
