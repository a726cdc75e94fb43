// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Usage-driven feature gating.
//!
//! The controller owns the feature flags and the global optimization mode.
//! A mode change re-derives every flag from its tier, then pushes scaled
//! configs to the batch scheduler and the store breaker.
//!
//! Listeners registered with [`AdaptiveController::on_feature_change`] run
//! synchronously after each toggle, outside any lock. A panicking listener
//! is logged and does not stop the others.

use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::features::{FeatureFlag, FeatureTier};
use super::mode::{OptimizationMode, UsageThresholds};
use crate::batching::{BatchConfig, BatchScheduler};
use crate::monitoring::{HealthStatus, MonitoringService};
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitConfig};
use crate::storage::traits::{KvStore, StoreError};

pub type FeatureListener = Arc<dyn Fn(&str, bool) + Send + Sync>;

/// Source of the resource usage figure driving mode selection.
#[async_trait]
pub trait UsageAuditor: Send + Sync {
    /// Usage in percent (0 - 100).
    async fn usage_pct(&self) -> Result<f64, StoreError>;
}

/// Reads store memory usage from `INFO`.
pub struct StoreUsageAuditor {
    store: Arc<dyn KvStore>,
}

impl StoreUsageAuditor {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl UsageAuditor for StoreUsageAuditor {
    async fn usage_pct(&self) -> Result<f64, StoreError> {
        Ok(self.store.info().await?.memory_pct())
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TierCounts {
    pub enabled: usize,
    pub disabled: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct OptimizationReport {
    pub mode: OptimizationMode,
    pub mode_description: &'static str,
    pub last_usage_pct: Option<f64>,
    pub thresholds: UsageThresholds,
    pub mode_changes: u64,
    pub tiers: BTreeMap<FeatureTier, TierCounts>,
    pub disabled_features: Vec<String>,
    /// Sum of estimated load over enabled features
    pub enabled_load: f64,
    pub recommendations: Vec<String>,
}

/// Scheduler and breaker configs the mode scales from.
#[derive(Debug, Clone)]
struct Baselines {
    batch: BatchConfig,
    circuit: CircuitConfig,
}

pub struct AdaptiveController {
    features: RwLock<BTreeMap<String, FeatureFlag>>,
    mode: RwLock<OptimizationMode>,
    thresholds: RwLock<UsageThresholds>,
    last_usage: RwLock<Option<f64>>,
    listeners: RwLock<HashMap<String, Vec<FeatureListener>>>,
    scheduler: Option<Arc<BatchScheduler>>,
    breaker: Option<Arc<CircuitBreaker>>,
    baselines: RwLock<Baselines>,
    mode_changes: AtomicU64,
}

impl AdaptiveController {
    pub fn new(features: Vec<FeatureFlag>, thresholds: UsageThresholds) -> Self {
        let features = features
            .into_iter()
            .map(|mut f| {
                f.enabled = true;
                (f.name.clone(), f)
            })
            .collect();
        Self {
            features: RwLock::new(features),
            mode: RwLock::new(OptimizationMode::Normal),
            thresholds: RwLock::new(thresholds),
            last_usage: RwLock::new(None),
            listeners: RwLock::new(HashMap::new()),
            scheduler: None,
            breaker: None,
            baselines: RwLock::new(Baselines {
                batch: BatchConfig::default(),
                circuit: CircuitConfig::redis(),
            }),
            mode_changes: AtomicU64::new(0),
        }
    }

    /// Scale this scheduler on mode changes; its current config is the baseline.
    #[must_use]
    pub fn with_scheduler(mut self, scheduler: Arc<BatchScheduler>) -> Self {
        self.baselines.get_mut().batch = scheduler.config();
        self.scheduler = Some(scheduler);
        self
    }

    /// Tighten this breaker on mode changes; its current config is the baseline.
    #[must_use]
    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.baselines.get_mut().circuit = breaker.config();
        self.breaker = Some(breaker);
        self
    }

    /// New baselines (config reload). Re-applied under the current mode.
    pub fn set_baselines(&self, batch: BatchConfig, circuit: CircuitConfig) {
        *self.baselines.write() = Baselines { batch, circuit };
        self.push_configs(self.mode());
    }

    pub fn set_thresholds(&self, thresholds: UsageThresholds) {
        *self.thresholds.write() = thresholds;
    }

    #[must_use]
    pub fn thresholds(&self) -> UsageThresholds {
        *self.thresholds.read()
    }

    #[must_use]
    pub fn mode(&self) -> OptimizationMode {
        *self.mode.read()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Flags
    // ═══════════════════════════════════════════════════════════════════════

    /// Add or replace a flag. It starts in whatever state the current mode
    /// implies for its tier.
    pub fn register_feature(&self, mut flag: FeatureFlag) {
        flag.enabled = self.mode().tier_enabled(flag.tier) || flag.is_critical();
        self.features.write().insert(flag.name.clone(), flag);
    }

    /// Unknown features read as enabled, so a missing registration never
    /// silently turns caching off.
    #[must_use]
    pub fn is_feature_enabled(&self, name: &str) -> bool {
        match self.features.read().get(name) {
            Some(flag) => flag.enabled,
            None => {
                debug!(feature = name, "Unknown feature queried, treating as enabled");
                true
            }
        }
    }

    #[must_use]
    pub fn feature(&self, name: &str) -> Option<FeatureFlag> {
        self.features.read().get(name).cloned()
    }

    #[must_use]
    pub fn features(&self) -> Vec<FeatureFlag> {
        self.features.read().values().cloned().collect()
    }

    /// Toggle a flag by hand. Returns true if its state changed.
    ///
    /// Disabling a critical flag is refused and logged. The flag keeps its
    /// state until the next mode change re-derives it.
    pub fn set_feature_enabled(&self, name: &str, enabled: bool) -> bool {
        let changed = {
            let mut features = self.features.write();
            let Some(flag) = features.get_mut(name) else {
                warn!(feature = name, "Cannot toggle unknown feature");
                return false;
            };
            if flag.is_critical() && !enabled {
                warn!(feature = name, "Refusing to disable critical feature");
                return false;
            }
            if flag.enabled == enabled {
                false
            } else {
                flag.enabled = enabled;
                true
            }
        };
        if changed {
            info!(feature = name, enabled, "Feature toggled");
            self.fire(&[(name.to_string(), enabled)]);
        }
        changed
    }

    /// Called with (feature name, enabled) after every change of `name`.
    /// Use `"*"` to hear about every feature.
    pub fn on_feature_change<F>(&self, name: &str, listener: F)
    where
        F: Fn(&str, bool) + Send + Sync + 'static,
    {
        self.listeners
            .write()
            .entry(name.to_string())
            .or_default()
            .push(Arc::new(listener));
    }

    fn fire(&self, changes: &[(String, bool)]) {
        for (name, enabled) in changes {
            crate::metrics::record_feature_toggle(name, *enabled);
            let listeners: Vec<FeatureListener> = {
                let all = self.listeners.read();
                all.get(name.as_str())
                    .into_iter()
                    .chain(all.get("*"))
                    .flatten()
                    .cloned()
                    .collect()
            };
            for listener in listeners {
                if catch_unwind(AssertUnwindSafe(|| listener(name, *enabled))).is_err() {
                    error!(feature = %name, "Feature change listener panicked");
                }
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Modes
    // ═══════════════════════════════════════════════════════════════════════

    /// Switch mode and re-derive every flag. Listeners fire only for flags
    /// whose state actually changed.
    pub fn set_optimization_mode(&self, mode: OptimizationMode) {
        let previous = std::mem::replace(&mut *self.mode.write(), mode);
        if previous != mode {
            self.mode_changes.fetch_add(1, Ordering::Relaxed);
            info!(from = %previous, to = %mode, "Optimization mode changed");
        }
        crate::metrics::set_optimization_mode(mode as u8);

        let soft_pressure = {
            let soft = self.thresholds.read().soft;
            self.last_usage.read().is_some_and(|u| u > soft)
        };

        let changes: Vec<(String, bool)> = {
            let mut features = self.features.write();
            features
                .values_mut()
                .filter_map(|flag| {
                    let target = flag_state(mode, flag, soft_pressure);
                    (flag.enabled != target).then(|| {
                        flag.enabled = target;
                        (flag.name.clone(), target)
                    })
                })
                .collect()
        };

        if !changes.is_empty() {
            debug!(mode = %mode, changed = changes.len(), "Feature flags re-derived");
        }
        self.fire(&changes);
        self.push_configs(mode);
    }

    fn push_configs(&self, mode: OptimizationMode) {
        let baselines = self.baselines.read().clone();
        if let Some(scheduler) = &self.scheduler {
            scheduler.update_config(mode.batch_config(&baselines.batch));
        }
        if let Some(breaker) = &self.breaker {
            breaker.update_config(mode.circuit_config(&baselines.circuit));
        }
    }

    /// Feed a usage measurement; switches mode if the thresholds say so.
    pub fn auto_optimize(&self, usage_pct: f64) -> OptimizationMode {
        *self.last_usage.write() = Some(usage_pct);
        crate::metrics::set_usage_pct(usage_pct);

        let current = self.mode();
        let next = OptimizationMode::from_usage(usage_pct, current, &self.thresholds());
        if next != current {
            self.set_optimization_mode(next);
        } else {
            debug!(usage_pct, mode = %current, "Usage within current mode");
        }
        next
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Reporting
    // ═══════════════════════════════════════════════════════════════════════

    /// Snapshot of mode and flags with advice. Reads only.
    #[must_use]
    pub fn generate_report(&self) -> OptimizationReport {
        let mode = self.mode();
        let thresholds = self.thresholds();
        let last_usage_pct = *self.last_usage.read();
        let features = self.features.read();

        let mut tiers: BTreeMap<FeatureTier, TierCounts> =
            FeatureTier::ALL.iter().map(|t| (*t, TierCounts::default())).collect();
        let mut disabled_features = Vec::new();
        let mut enabled_load = 0.0;
        for flag in features.values() {
            let counts = tiers.entry(flag.tier).or_default();
            if flag.enabled {
                counts.enabled += 1;
                enabled_load += flag.estimated_load;
            } else {
                counts.disabled += 1;
                disabled_features.push(flag.name.clone());
            }
        }

        let mut recommendations = Vec::new();
        match (mode, last_usage_pct) {
            (OptimizationMode::Aggressive, _) => recommendations.push(
                "Store is near capacity: only critical features run. Add capacity or shorten TTLs".to_string(),
            ),
            (OptimizationMode::Conservative, _) => recommendations
                .push("Medium and low tier features are paused until usage drops below the relax threshold".to_string()),
            (OptimizationMode::Normal, Some(u)) if u > thresholds.soft => recommendations
                .push("Usage is above the soft threshold while in normal mode; consider enabling auto-optimization".to_string()),
            _ => {}
        }
        if let Some(u) = last_usage_pct {
            if u < thresholds.relax && !disabled_features.is_empty() {
                recommendations.push(format!(
                    "Usage is low ({:.0}%) but {} feature(s) remain disabled",
                    u,
                    disabled_features.len()
                ));
            }
        }
        if enabled_load > 1.0 {
            recommendations.push("Estimated load of enabled features exceeds 100%".to_string());
        }

        OptimizationReport {
            mode,
            mode_description: mode.description(),
            last_usage_pct,
            thresholds,
            mode_changes: self.mode_changes.load(Ordering::Relaxed),
            tiers,
            disabled_features,
            enabled_load,
            recommendations,
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Background loop
    // ═══════════════════════════════════════════════════════════════════════

    /// One audit: measure usage, escalate if the store is unhealthy, adjust.
    pub async fn audit_once(
        &self,
        auditor: &dyn UsageAuditor,
        monitor: Option<&MonitoringService>,
    ) -> Result<OptimizationMode, StoreError> {
        let usage = auditor.usage_pct().await?;
        let health = monitor.and_then(MonitoringService::latest_health).map(|h| h.status);
        let effective = escalate(usage, health, &self.thresholds());
        if effective > usage {
            debug!(usage, effective, "Unhealthy store, escalating usage");
        }
        Ok(self.auto_optimize(effective))
    }

    /// Audit every `interval` until `shutdown` flips.
    pub fn spawn_auto_optimizer(
        self: &Arc<Self>,
        auditor: Arc<dyn UsageAuditor>,
        monitor: Option<Arc<MonitoringService>>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            info!(?interval, "Adaptive optimizer started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = controller.audit_once(auditor.as_ref(), monitor.as_deref()).await {
                            warn!(error = %e, "Usage audit failed, keeping current mode");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Adaptive optimizer stopped");
        })
    }
}

/// State a flag should have under `mode`.
fn flag_state(mode: OptimizationMode, flag: &FeatureFlag, soft_pressure: bool) -> bool {
    if flag.is_critical() {
        return true;
    }
    match mode {
        OptimizationMode::Normal => !(soft_pressure && flag.tier == FeatureTier::Low && flag.has_fallback),
        _ => mode.tier_enabled(flag.tier),
    }
}

/// An unhealthy store counts as at least soft-threshold pressure.
fn escalate(usage: f64, health: Option<HealthStatus>, t: &UsageThresholds) -> f64 {
    match health {
        Some(HealthStatus::Unhealthy) => usage.max(t.soft + 1.0),
        _ => usage,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adaptive::features::default_features;
    use std::sync::atomic::AtomicUsize;

    fn controller() -> AdaptiveController {
        AdaptiveController::new(default_features(), UsageThresholds::default())
    }

    struct FixedUsage(f64);

    #[async_trait]
    impl UsageAuditor for FixedUsage {
        async fn usage_pct(&self) -> Result<f64, StoreError> {
            Ok(self.0)
        }
    }

    #[test]
    fn test_critical_flag_cannot_be_disabled() {
        let c = controller();
        assert!(!c.set_feature_enabled("auth_caching", false));
        assert!(c.is_feature_enabled("auth_caching"));

        c.set_optimization_mode(OptimizationMode::Aggressive);
        assert!(c.is_feature_enabled("auth_caching"));
        assert!(c.is_feature_enabled("session_caching"));
    }

    #[test]
    fn test_mode_gates_tiers() {
        let c = controller();
        c.set_optimization_mode(OptimizationMode::Conservative);
        assert!(c.is_feature_enabled("course_caching"));
        assert!(!c.is_feature_enabled("search_caching"));
        assert!(!c.is_feature_enabled("analytics_caching"));

        c.set_optimization_mode(OptimizationMode::Aggressive);
        assert!(!c.is_feature_enabled("course_caching"));

        c.set_optimization_mode(OptimizationMode::Normal);
        assert!(c.features().iter().all(|f| f.enabled));
    }

    #[test]
    fn test_auto_optimize_thresholds_and_hysteresis() {
        let c = controller();
        assert_eq!(c.auto_optimize(90.0), OptimizationMode::Aggressive);
        assert_eq!(c.auto_optimize(75.0), OptimizationMode::Conservative);
        assert_eq!(c.auto_optimize(60.0), OptimizationMode::Conservative);
        assert_eq!(c.auto_optimize(40.0), OptimizationMode::Normal);
        assert_eq!(c.generate_report().mode_changes, 3);
    }

    #[test]
    fn test_normal_mode_soft_disables_low_tier_with_fallback() {
        let c = controller();
        c.auto_optimize(80.0);
        // Forced back to normal while usage is still above soft
        c.set_optimization_mode(OptimizationMode::Normal);
        assert!(!c.is_feature_enabled("analytics_caching"));
        assert!(c.is_feature_enabled("search_caching"));

        c.auto_optimize(30.0);
        c.set_optimization_mode(OptimizationMode::Normal);
        assert!(c.is_feature_enabled("analytics_caching"));
    }

    #[test]
    fn test_listeners_fire_on_change_only() {
        let c = controller();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        c.on_feature_change("search_caching", move |name, enabled| {
            assert_eq!(name, "search_caching");
            assert!(!enabled);
            seen.fetch_add(1, Ordering::SeqCst);
        });

        c.set_optimization_mode(OptimizationMode::Conservative);
        c.set_optimization_mode(OptimizationMode::Conservative);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_listener_panic_is_contained() {
        let c = controller();
        let calls = Arc::new(AtomicUsize::new(0));
        c.on_feature_change("*", |_, _| panic!("bad listener"));
        let seen = calls.clone();
        c.on_feature_change("*", move |_, _| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        assert!(c.set_feature_enabled("cache_warming", false));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!c.is_feature_enabled("cache_warming"));
    }

    #[test]
    fn test_unknown_feature_is_enabled_and_untoggleable() {
        let c = controller();
        assert!(c.is_feature_enabled("never_registered"));
        assert!(!c.set_feature_enabled("never_registered", false));
    }

    #[test]
    fn test_report_is_read_only() {
        let c = controller();
        c.set_optimization_mode(OptimizationMode::Aggressive);
        let before = c.features();
        let report = c.generate_report();

        assert_eq!(report.tiers[&FeatureTier::Critical].enabled, 3);
        assert_eq!(report.tiers[&FeatureTier::Critical].disabled, 0);
        assert_eq!(report.tiers[&FeatureTier::Low].enabled, 0);
        assert!(!report.recommendations.is_empty());
        assert_eq!(c.features(), before);
        assert_eq!(c.mode(), OptimizationMode::Aggressive);
    }

    #[tokio::test]
    async fn test_mode_cascades_to_scheduler_and_breaker() {
        use crate::storage::memory::InMemoryStore;

        let store = Arc::new(InMemoryStore::new());
        let breaker = Arc::new(CircuitBreaker::new("redis", CircuitConfig::redis()));
        let scheduler = Arc::new(BatchScheduler::new(store, breaker.clone(), BatchConfig::default()));
        let c = controller().with_scheduler(scheduler.clone()).with_breaker(breaker.clone());

        c.set_optimization_mode(OptimizationMode::Aggressive);
        assert_eq!(scheduler.config().max_batch_size, 25);
        assert!(breaker.config().failure_threshold < CircuitConfig::redis().failure_threshold
            || breaker.config().expected_error_rate < CircuitConfig::redis().expected_error_rate);

        c.set_optimization_mode(OptimizationMode::Normal);
        assert_eq!(scheduler.config(), BatchConfig::default());
        assert_eq!(breaker.config(), CircuitConfig::redis());
    }

    #[tokio::test]
    async fn test_unhealthy_store_escalates() {
        assert_eq!(escalate(20.0, Some(HealthStatus::Unhealthy), &UsageThresholds::default()), 71.0);
        assert_eq!(escalate(20.0, Some(HealthStatus::Degraded), &UsageThresholds::default()), 20.0);

        let c = controller();
        let mode = c.audit_once(&FixedUsage(88.0), None).await.unwrap();
        assert_eq!(mode, OptimizationMode::Aggressive);
    }
}
