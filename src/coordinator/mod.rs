// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cache layer coordinator.
//!
//! The [`CacheLayer`] is the application-owned context that wires the
//! components together around one store:
//! - Circuit breaker registry, with the store breaker pre-created
//! - Batch scheduler sending every command through that breaker
//! - Invalidation engine with the configured transport and default rules
//! - Adaptive controller scaling the scheduler and breaker by mode
//! - Monitoring service shared by all of the above
//!
//! # Lifecycle
//!
//! ```text
//! Created → Connecting → Ready → Running → ShuttingDown → Stopped
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use resilient_cache::{CacheLayer, CacheLayerConfig, LayerState};
//! use tokio::sync::watch;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let config = CacheLayerConfig::default();
//! let (_tx, rx) = watch::channel(config.clone());
//! let layer = CacheLayer::connect(config, rx).await.expect("store");
//!
//! assert_eq!(layer.state(), LayerState::Created);
//! layer.start().await.expect("start");
//!
//! layer.gated_set("course_caching", "cache:course:1", "{}", None).await.unwrap();
//! layer.shutdown().await;
//! # }
//! ```

mod lifecycle;
mod types;

pub use types::{LayerError, LayerReport, LayerState};

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::adaptive::AdaptiveController;
use crate::batching::BatchScheduler;
use crate::config::{CacheLayerConfig, TransportKind};
use crate::invalidation::{
    default_rules, EventTransport, InvalidationEngine, PollTransport, PushTransport,
};
use crate::monitoring::MonitoringService;
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitRegistry, INVALIDATION_CIRCUIT, REDIS_CIRCUIT};
use crate::storage::memory::InMemoryStore;
use crate::storage::redis::RedisStore;
use crate::storage::traits::{KvStore, StoreError};

/// Application-owned context holding every component of the layer.
///
/// Components are shared via `Arc`; clone them out with the accessors to
/// hand them to request handlers.
pub struct CacheLayer {
    /// Current configuration (replaced on reload)
    pub(super) config: RwLock<CacheLayerConfig>,

    /// Runtime config updates (async Mutex so run() can take &self)
    pub(super) config_rx: tokio::sync::Mutex<watch::Receiver<CacheLayerConfig>>,

    pub(super) state: watch::Sender<LayerState>,
    pub(super) state_rx: watch::Receiver<LayerState>,

    /// Stable for the lifetime of the layer, even across reloads
    pub(super) instance_id: String,

    pub(super) store: Arc<dyn KvStore>,
    pub(super) monitor: Arc<MonitoringService>,
    pub(super) circuits: Arc<CircuitRegistry>,
    pub(super) breaker: Arc<CircuitBreaker>,
    pub(super) scheduler: Arc<BatchScheduler>,
    pub(super) invalidation: Arc<InvalidationEngine>,
    pub(super) controller: Arc<AdaptiveController>,

    /// Flipped once to stop background loops
    pub(super) shutdown_tx: watch::Sender<bool>,
    pub(super) tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CacheLayer {
    /// Connect to `redis_url` (or fall back to the in-process store) and
    /// build the layer around it.
    pub async fn connect(
        config: CacheLayerConfig,
        config_rx: watch::Receiver<CacheLayerConfig>,
    ) -> Result<Self, StoreError> {
        let store: Arc<dyn KvStore> = match &config.redis_url {
            Some(url) => Arc::new(RedisStore::new(url).await?),
            None => {
                info!("No redis_url configured, using in-process store");
                Arc::new(InMemoryStore::new())
            }
        };
        Ok(Self::with_store(config, config_rx, store))
    }

    /// Build the layer around an existing store. Must be called from within
    /// a tokio runtime (the scheduler spawns its supervisor here).
    pub fn with_store(
        config: CacheLayerConfig,
        config_rx: watch::Receiver<CacheLayerConfig>,
        store: Arc<dyn KvStore>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(LayerState::Created);
        let (shutdown_tx, _) = watch::channel(false);
        let instance_id = config
            .instance_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let monitor = Arc::new(MonitoringService::new(store.clone(), config.health_history_size));
        let circuits = Arc::new(CircuitRegistry::new(config.circuit_config()).with_monitor(monitor.clone()));
        let breaker = circuits.get_or_create_with(REDIS_CIRCUIT, config.circuit_config());
        let invalidation_breaker = circuits.get_or_create(INVALIDATION_CIRCUIT);

        let scheduler = Arc::new(BatchScheduler::with_monitor(
            store.clone(),
            breaker.clone(),
            monitor.clone(),
            config.batch_config(),
        ));

        let transport: Arc<dyn EventTransport> = match config.invalidation_transport {
            TransportKind::Push => Arc::new(
                PushTransport::new(store.clone(), config.invalidation_channel.clone())
                    .with_breaker(invalidation_breaker.clone()),
            ),
            TransportKind::Poll => Arc::new(
                PollTransport::new(
                    store.clone(),
                    config.invalidation_signal_prefix.clone(),
                    instance_id.clone(),
                    Duration::from_millis(config.poll_interval_ms),
                    Duration::from_secs(config.signal_ttl_secs),
                )
                .with_breaker(invalidation_breaker.clone()),
            ),
        };
        let invalidation = InvalidationEngine::new(store.clone(), config.invalidation_settings(&instance_id))
            .with_transport(transport)
            .with_monitor(monitor.clone())
            .with_breaker(invalidation_breaker);
        for rule in default_rules() {
            invalidation.add_rule(rule);
        }

        let controller = AdaptiveController::new(config.feature_catalog(), config.usage_thresholds())
            .with_scheduler(scheduler.clone())
            .with_breaker(breaker.clone());

        debug!(instance_id = %instance_id, transport = ?config.invalidation_transport, "Cache layer assembled");

        Self {
            config: RwLock::new(config),
            config_rx: tokio::sync::Mutex::new(config_rx),
            state: state_tx,
            state_rx,
            instance_id,
            store,
            monitor,
            circuits,
            breaker,
            scheduler,
            invalidation: Arc::new(invalidation),
            controller: Arc::new(controller),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn state(&self) -> LayerState {
        *self.state_rx.borrow()
    }

    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<LayerState> {
        self.state_rx.clone()
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self.state(), LayerState::Ready | LayerState::Running)
    }

    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    #[must_use]
    pub fn config(&self) -> CacheLayerConfig {
        self.config.read().clone()
    }

    #[must_use]
    pub fn store(&self) -> Arc<dyn KvStore> {
        self.store.clone()
    }

    #[must_use]
    pub fn monitor(&self) -> Arc<MonitoringService> {
        self.monitor.clone()
    }

    #[must_use]
    pub fn circuits(&self) -> Arc<CircuitRegistry> {
        self.circuits.clone()
    }

    /// The breaker every batch goes through.
    #[must_use]
    pub fn breaker(&self) -> Arc<CircuitBreaker> {
        self.breaker.clone()
    }

    #[must_use]
    pub fn scheduler(&self) -> Arc<BatchScheduler> {
        self.scheduler.clone()
    }

    #[must_use]
    pub fn invalidation(&self) -> Arc<InvalidationEngine> {
        self.invalidation.clone()
    }

    #[must_use]
    pub fn controller(&self) -> Arc<AdaptiveController> {
        self.controller.clone()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Gated access
    // ═══════════════════════════════════════════════════════════════════════

    /// Read through the scheduler unless `feature` is disabled, in which
    /// case the cache is skipped and `None` returned.
    pub async fn gated_get(&self, feature: &str, key: &str) -> Result<Option<String>, LayerError> {
        if !self.controller.is_feature_enabled(feature) {
            debug!(feature, key, "Feature disabled, skipping cache read");
            return Ok(None);
        }
        Ok(self.scheduler.get(key).await?)
    }

    /// Write through the scheduler unless `feature` is disabled, in which
    /// case the write is silently dropped.
    pub async fn gated_set(
        &self,
        feature: &str,
        key: &str,
        value: impl Into<String>,
        ttl: Option<Duration>,
    ) -> Result<(), LayerError> {
        if !self.controller.is_feature_enabled(feature) {
            debug!(feature, key, "Feature disabled, skipping cache write");
            return Ok(());
        }
        match ttl {
            Some(ttl) => self.scheduler.set_ex(key, value, ttl).await?,
            None => self.scheduler.set(key, value).await?,
        }
        Ok(())
    }

    /// Snapshot of every component.
    #[must_use]
    pub fn report(&self) -> LayerReport {
        LayerReport {
            instance_id: self.instance_id.clone(),
            state: self.state(),
            circuits: self.circuits.snapshots(),
            batching: self.scheduler.stats(),
            optimization: self.controller.generate_report(),
            performance: self.monitor.performance_report(),
            invalidation: self.invalidation.stats(),
        }
    }
}
