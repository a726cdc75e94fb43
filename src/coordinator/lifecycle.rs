// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Layer lifecycle management: start, run loop, shutdown.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::adaptive::StoreUsageAuditor;
use crate::config::CacheLayerConfig;
use crate::monitoring::HealthSample;
use crate::resilience::circuit_breaker::INVALIDATION_CIRCUIT;
use crate::resilience::retry::{retry, RetryConfig};

use super::{CacheLayer, LayerError, LayerState};

/// How long shutdown waits for each background task.
const TASK_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

impl CacheLayer {
    fn set_state(&self, state: LayerState) {
        let _ = self.state.send(state);
        crate::metrics::set_layer_state(&state.to_string());
    }

    /// Ping the store, then spawn the background loops:
    /// 1. Invalidation listener (peer events)
    /// 2. Health sampler, if `health_interval_secs > 0`
    /// 3. Adaptive optimizer, if `adaptive_interval_secs > 0`
    #[tracing::instrument(skip(self), fields(instance_id = %self.instance_id))]
    pub async fn start(&self) -> Result<(), LayerError> {
        let startup_start = Instant::now();
        info!("Starting cache layer");
        self.set_state(LayerState::Connecting);

        let store = self.store.clone();
        retry("store_ping", &RetryConfig::startup(), || {
            let store = store.clone();
            async move { store.ping().await }
        })
        .await?;

        let config = self.config();
        let mut spawned: Vec<JoinHandle<()>> = Vec::new();

        if let Some(listener) = self.invalidation.spawn_listener(self.shutdown_tx.subscribe()) {
            spawned.push(listener);
        }

        // First sample before the optimizer ever reads one
        self.health_check().await;
        if config.health_interval_secs > 0 {
            spawned.push(self.spawn_health_loop(Duration::from_secs(config.health_interval_secs)));
        }

        if config.adaptive_interval_secs > 0 {
            spawned.push(self.controller.spawn_auto_optimizer(
                Arc::new(StoreUsageAuditor::new(self.store.clone())),
                Some(self.monitor.clone()),
                Duration::from_secs(config.adaptive_interval_secs),
                self.shutdown_tx.subscribe(),
            ));
        }

        let task_count = spawned.len();
        self.tasks.lock().extend(spawned);

        self.set_state(LayerState::Ready);
        crate::metrics::record_startup_total(startup_start.elapsed());
        info!(tasks = task_count, elapsed = ?startup_start.elapsed(), "Cache layer ready");
        Ok(())
    }

    fn spawn_health_loop(&self, interval: Duration) -> JoinHandle<()> {
        let monitor = self.monitor.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // interval fires immediately; start() already took that sample
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let sample = monitor.health_check().await;
                        monitor.publish_gauges();
                        debug!(status = ?sample.status, latency_ms = sample.latency_ms, "Health sampled");
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Health loop stopped");
        })
    }

    /// Take a health sample now and publish gauges.
    pub async fn health_check(&self) -> HealthSample {
        let sample = self.monitor.health_check().await;
        self.monitor.publish_gauges();
        sample
    }

    /// Apply config updates until [`shutdown`](Self::shutdown) is called.
    #[tracing::instrument(skip(self))]
    pub async fn run(&self) {
        self.set_state(LayerState::Running);
        info!("Cache layer running");

        let mut config_rx = self.config_rx.lock().await;
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut reload_enabled = true;

        loop {
            tokio::select! {
                changed = config_rx.changed(), if reload_enabled => {
                    if changed.is_err() {
                        debug!("Config sender dropped, hot reload disabled");
                        reload_enabled = false;
                        continue;
                    }
                    let new_config = config_rx.borrow_and_update().clone();
                    self.apply_config(new_config);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Run loop exited");
    }

    /// Push a new config into every component. The instance id is kept.
    pub fn apply_config(&self, new_config: CacheLayerConfig) {
        info!(
            failure_threshold = new_config.failure_threshold,
            max_batch_size = new_config.max_batch_size,
            batch_timeout_ms = new_config.batch_timeout_ms,
            usage_soft = new_config.usage_soft_threshold,
            usage_hard = new_config.usage_hard_threshold,
            "Config updated"
        );

        if new_config.invalidation_transport != self.config.read().invalidation_transport {
            warn!("invalidation_transport changes take effect on restart");
        }

        self.circuits.set_defaults(new_config.circuit_config());
        if let Some(breaker) = self.circuits.get(INVALIDATION_CIRCUIT) {
            breaker.update_config(new_config.circuit_config());
        }
        self.controller.set_thresholds(new_config.usage_thresholds());
        // Rescaled under the current mode before reaching scheduler and breaker
        self.controller
            .set_baselines(new_config.batch_config(), new_config.circuit_config());
        self.invalidation
            .update_settings(new_config.invalidation_settings(&self.instance_id));
        self.monitor.set_history_size(new_config.health_history_size);

        *self.config.write() = new_config;
    }

    /// Stop background loops and drain the scheduler. Every queued
    /// operation is answered before this returns.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) {
        let shutdown_start = Instant::now();
        info!("Initiating cache layer shutdown");
        self.set_state(LayerState::ShuttingDown);
        let _ = self.shutdown_tx.send(true);

        self.scheduler.shutdown().await;

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if tokio::time::timeout(TASK_JOIN_TIMEOUT, task).await.is_err() {
                warn!("Background task did not stop in time");
            }
        }

        self.set_state(LayerState::Stopped);
        info!(elapsed = ?shutdown_start.elapsed(), "Cache layer shutdown complete");
    }
}
