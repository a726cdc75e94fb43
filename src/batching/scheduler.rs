// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Batch scheduler: many callers, one pipeline per flush.
//!
//! Callers [`enqueue`](BatchScheduler::enqueue) commands and await the
//! returned [`PendingReply`]. A supervisor task flushes when the queue
//! reaches `max_batch_size` or when the timer armed by the first enqueue
//! expires. Each flush sends one pipeline through the circuit breaker.
//!
//! # Guarantees
//!
//! - At most one flush runs at a time (supervisor and [`force_flush`] share
//!   one async mutex).
//! - Every enqueued operation is answered exactly once: with its reply, or
//!   with the batch-level error that sank its batch.
//! - A failed batch is never retried. Every operation in it gets the same
//!   error.
//! - A command the store refuses on its own (wrong type, overflow) fails
//!   only its caller with [`BatchError::Command`]. The pipeline still
//!   counts as a success for the breaker.
//! - A panic inside a flush rejects that batch; the supervisor keeps
//!   running.
//!
//! [`force_flush`]: BatchScheduler::force_flush

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::operation::{is_priority_key, BatchError, BatchedOperation, PendingReply};
use super::queue::{BatchQueue, FlushReason};
use crate::monitoring::MonitoringService;
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitError};
use crate::storage::command::{Command, CommandKind, Reply};
use crate::storage::traits::{KvStore, StoreError};

/// Hot-reloadable scheduler settings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchConfig {
    pub max_batch_size: usize,
    pub batch_timeout: Duration,
    /// Route keys with a priority prefix to the priority lane
    pub priority_queues: bool,
    pub priority_prefixes: Vec<String>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            batch_timeout: Duration::from_millis(10),
            priority_queues: true,
            priority_prefixes: vec!["auth:".into(), "session:".into(), "otp:".into()],
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchStats {
    pub enqueued: u64,
    pub resolved: u64,
    /// Of `resolved`, answered with a per-command store error
    pub refused: u64,
    pub rejected: u64,
    pub flushes: u64,
    pub failed_flushes: u64,
    pub largest_batch: usize,
    pub avg_batch_size: f64,
    pub queued_priority: usize,
    pub queued_regular: usize,
    pub config: BatchConfig,
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    resolved: AtomicU64,
    refused: AtomicU64,
    rejected: AtomicU64,
    flushes: AtomicU64,
    failed_flushes: AtomicU64,
    flushed_ops: AtomicU64,
    largest_batch: AtomicUsize,
}

struct Shared {
    store: Arc<dyn KvStore>,
    breaker: Arc<CircuitBreaker>,
    monitor: Option<Arc<MonitoringService>>,
    config: RwLock<BatchConfig>,
    queue: Mutex<BatchQueue>,
    wake: Notify,
    flush_guard: tokio::sync::Mutex<()>,
    closed: AtomicBool,
    next_id: AtomicU64,
    counters: Counters,
}

pub struct BatchScheduler {
    shared: Arc<Shared>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl BatchScheduler {
    /// Create the scheduler and spawn its supervisor. Must be called from
    /// within a tokio runtime.
    pub fn new(store: Arc<dyn KvStore>, breaker: Arc<CircuitBreaker>, config: BatchConfig) -> Self {
        Self::build(store, breaker, None, config)
    }

    pub fn with_monitor(
        store: Arc<dyn KvStore>,
        breaker: Arc<CircuitBreaker>,
        monitor: Arc<MonitoringService>,
        config: BatchConfig,
    ) -> Self {
        Self::build(store, breaker, Some(monitor), config)
    }

    fn build(
        store: Arc<dyn KvStore>,
        breaker: Arc<CircuitBreaker>,
        monitor: Option<Arc<MonitoringService>>,
        mut config: BatchConfig,
    ) -> Self {
        config.max_batch_size = config.max_batch_size.max(1);
        let shared = Arc::new(Shared {
            store,
            breaker,
            monitor,
            config: RwLock::new(config),
            queue: Mutex::new(BatchQueue::new()),
            wake: Notify::new(),
            flush_guard: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
            next_id: AtomicU64::new(0),
            counters: Counters::default(),
        });
        let handle = tokio::spawn(supervise(shared.clone()));
        Self {
            shared,
            supervisor: Mutex::new(Some(handle)),
        }
    }

    /// Queue a command. The command is queued when this returns; awaiting
    /// the handle only waits for its reply.
    pub fn enqueue(&self, command: Command) -> PendingReply {
        let shared = &self.shared;
        let (max, is_priority) = {
            let config = shared.config.read();
            let priority = config.priority_queues && is_priority_key(command.key(), &config.priority_prefixes);
            (config.max_batch_size, priority)
        };

        let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (op, pending) = BatchedOperation::new(id, command, is_priority);

        let (reason, depths) = {
            let mut queue = shared.queue.lock();
            // Checked under the queue lock so shutdown's final drain sees
            // every operation that got past this point.
            if shared.closed.load(Ordering::Acquire) {
                drop(queue);
                shared.counters.rejected.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_batch_rejected(1, "shutdown");
                return PendingReply::failed(BatchError::ShuttingDown);
            }
            let reason = queue.push(op, max);
            (reason, queue.depths())
        };

        shared.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        crate::metrics::set_batch_queue_depth(depths.0, depths.1);
        if reason.is_some() || depths.0 + depths.1 == 1 {
            // Size reached, or the timer was just armed
            shared.wake.notify_one();
        }
        pending
    }

    /// Flush until the queue is empty. Waits for an in-flight flush first.
    pub async fn force_flush(&self) -> usize {
        let mut total = 0;
        loop {
            let flushed = self.shared.flush_guarded(FlushReason::Manual).await;
            if flushed == 0 {
                return total;
            }
            total += flushed;
        }
    }

    /// Swap in new settings. A `max_batch_size` of 0 is raised to 1.
    pub fn update_config(&self, mut config: BatchConfig) {
        config.max_batch_size = config.max_batch_size.max(1);
        let mut current = self.shared.config.write();
        if *current != config {
            info!(
                max_batch_size = config.max_batch_size,
                batch_timeout = ?config.batch_timeout,
                priority_queues = config.priority_queues,
                "Batch config updated"
            );
            *current = config;
        }
        drop(current);
        self.shared.wake.notify_one();
    }

    #[must_use]
    pub fn config(&self) -> BatchConfig {
        self.shared.config.read().clone()
    }

    #[must_use]
    pub fn stats(&self) -> BatchStats {
        let c = &self.shared.counters;
        let (queued_priority, queued_regular) = self.shared.queue.lock().depths();
        let flushes = c.flushes.load(Ordering::Relaxed);
        let flushed_ops = c.flushed_ops.load(Ordering::Relaxed);
        BatchStats {
            enqueued: c.enqueued.load(Ordering::Relaxed),
            resolved: c.resolved.load(Ordering::Relaxed),
            refused: c.refused.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            flushes,
            failed_flushes: c.failed_flushes.load(Ordering::Relaxed),
            largest_batch: c.largest_batch.load(Ordering::Relaxed),
            avg_batch_size: if flushes == 0 { 0.0 } else { flushed_ops as f64 / flushes as f64 },
            queued_priority,
            queued_regular,
            config: self.config(),
        }
    }

    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.shared.queue.lock().len()
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Stop accepting work, flush everything queued, stop the supervisor.
    pub async fn shutdown(&self) {
        {
            let _queue = self.shared.queue.lock();
            if self.shared.closed.swap(true, Ordering::AcqRel) {
                return;
            }
        }
        info!(queued = self.queue_len(), "Batch scheduler shutting down, draining queue");
        self.shared.wake.notify_one();

        let handle = self.supervisor.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Batch supervisor task failed");
            }
        }
        // Supervisor drains on exit; this covers a supervisor that died early
        while self.shared.flush_guarded(FlushReason::Shutdown).await > 0 {}
        info!("Batch scheduler stopped");
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Convenience API
    // ═══════════════════════════════════════════════════════════════════════

    pub async fn get(&self, key: &str) -> Result<Option<String>, BatchError> {
        Ok(self.enqueue(Command::get(key)).await?.into_value())
    }

    /// GET, handing any batch error to `fallback`. The fallback's own error
    /// is returned unchanged.
    pub async fn get_or_else<F, Fut, E>(&self, key: &str, fallback: F) -> Result<Option<String>, E>
    where
        F: FnOnce(BatchError) -> Fut,
        Fut: Future<Output = Result<Option<String>, E>>,
    {
        match self.get(key).await {
            Ok(value) => Ok(value),
            Err(err) => fallback(err).await,
        }
    }

    pub async fn set(&self, key: &str, value: impl Into<String>) -> Result<(), BatchError> {
        self.enqueue(Command::set(key, value)).await.map(|_| ())
    }

    pub async fn set_ex(&self, key: &str, value: impl Into<String>, ttl: Duration) -> Result<(), BatchError> {
        self.enqueue(Command::set_ex(key, value, ttl.as_secs().max(1)))
            .await
            .map(|_| ())
    }

    /// SET, or SETEX when `ttl` is given, handing any batch error to `fallback`.
    pub async fn set_or_else<F, Fut, E>(
        &self,
        key: &str,
        value: impl Into<String>,
        ttl: Option<Duration>,
        fallback: F,
    ) -> Result<(), E>
    where
        F: FnOnce(BatchError) -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        let result = match ttl {
            Some(ttl) => self.set_ex(key, value, ttl).await,
            None => self.set(key, value).await,
        };
        match result {
            Ok(()) => Ok(()),
            Err(err) => fallback(err).await,
        }
    }

    /// Returns true if the key existed.
    pub async fn del(&self, key: &str) -> Result<bool, BatchError> {
        Ok(self.enqueue(Command::del(key)).await?.as_bool())
    }

    pub async fn exists(&self, key: &str) -> Result<bool, BatchError> {
        Ok(self.enqueue(Command::exists(key)).await?.as_bool())
    }

    /// Returns false if the key does not exist.
    pub async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, BatchError> {
        Ok(self.enqueue(Command::expire(key, ttl.as_secs().max(1))).await?.as_bool())
    }

    pub async fn incr(&self, key: &str) -> Result<i64, BatchError> {
        integer(self.enqueue(Command::incr(key)).await?)
    }

    pub async fn decr(&self, key: &str) -> Result<i64, BatchError> {
        integer(self.enqueue(Command::decr(key)).await?)
    }

    /// Returns true if the member was added.
    pub async fn sadd(&self, key: &str, member: &str) -> Result<bool, BatchError> {
        Ok(self.enqueue(Command::sadd(key, member)).await?.as_bool())
    }

    /// Returns true if the member was removed.
    pub async fn srem(&self, key: &str, member: &str) -> Result<bool, BatchError> {
        Ok(self.enqueue(Command::srem(key, member)).await?.as_bool())
    }
}

fn integer(reply: Reply) -> Result<i64, BatchError> {
    reply
        .as_int()
        .ok_or_else(|| BatchError::Execution(format!("expected integer reply, got {reply:?}")))
}

impl Drop for BatchScheduler {
    fn drop(&mut self) {
        if let Some(handle) = self.supervisor.lock().take() {
            handle.abort();
        }
    }
}

/// Supervisor loop: sleeps until the queue is full or the timer expires,
/// flushes, repeats. Drains and exits once the scheduler is closed.
async fn supervise(shared: Arc<Shared>) {
    debug!("Batch supervisor started");
    loop {
        if shared.closed.load(Ordering::Acquire) {
            while shared.flush_guarded(FlushReason::Shutdown).await > 0 {}
            break;
        }

        let (full, deadline) = {
            let config = shared.config.read();
            let queue = shared.queue.lock();
            (queue.len() >= config.max_batch_size, queue.deadline(config.batch_timeout))
        };

        if full {
            shared.flush_guarded(FlushReason::Count).await;
            continue;
        }

        match deadline {
            Some(at) => {
                tokio::select! {
                    _ = shared.wake.notified() => {}
                    _ = tokio::time::sleep_until(at.into()) => {
                        shared.flush_guarded(FlushReason::Time).await;
                    }
                }
            }
            None => shared.wake.notified().await,
        }
    }
    debug!("Batch supervisor stopped");
}

impl Shared {
    /// [`flush_once`](Self::flush_once) with panics contained. Operations of
    /// a batch lost to a panic are answered as if the scheduler had shut
    /// down (their reply senders are dropped).
    async fn flush_guarded(&self, reason: FlushReason) -> usize {
        match AssertUnwindSafe(self.flush_once(reason)).catch_unwind().await {
            Ok(flushed) => flushed,
            Err(_) => {
                error!(reason = reason.as_str(), "Batch flush panicked, batch dropped");
                crate::metrics::record_batch_flush(0, "panic");
                self.counters.failed_flushes.fetch_add(1, Ordering::Relaxed);
                // Non-zero so drain loops keep going
                1
            }
        }
    }

    /// Take one batch and execute it. Returns the number of operations
    /// answered (0 if the queue was empty).
    async fn flush_once(&self, reason: FlushReason) -> usize {
        let _guard = self.flush_guard.lock().await;

        let max = self.config.read().max_batch_size;
        let (batch, depths) = {
            let mut queue = self.queue.lock();
            let batch = queue.take(max);
            (batch, queue.depths())
        };
        crate::metrics::set_batch_queue_depth(depths.0, depths.1);
        if batch.is_empty() {
            return 0;
        }
        self.execute(batch, reason).await
    }

    async fn execute(&self, batch: Vec<BatchedOperation>, reason: FlushReason) -> usize {
        let size = batch.len();
        let (commands, slots) = build_pipeline(&batch);
        let started = Instant::now();

        let store = self.store.clone();
        let outcome = self
            .breaker
            .call(|| async move {
                match AssertUnwindSafe(store.pipeline(&commands)).catch_unwind().await {
                    Ok(result) => result,
                    Err(_) => Err(StoreError::Backend("store panicked during pipeline".into())),
                }
            })
            .await;
        let elapsed = started.elapsed();

        let c = &self.counters;
        c.flushes.fetch_add(1, Ordering::Relaxed);
        c.flushed_ops.fetch_add(size as u64, Ordering::Relaxed);
        c.largest_batch.fetch_max(size, Ordering::Relaxed);
        crate::metrics::record_flush_duration(elapsed);

        let result = match outcome {
            Ok(replies) if replies.len() == slots.len() => Ok(replies),
            Ok(replies) => Err(BatchError::ResultMismatch { commands: slots.len(), replies: replies.len() }),
            Err(CircuitError::Open { circuit }) => Err(BatchError::Rejected { circuit }),
            Err(CircuitError::Timeout { timeout, .. }) => Err(BatchError::Timeout(timeout)),
            Err(CircuitError::Inner(e)) => Err(BatchError::Execution(e.to_string())),
        };

        if let Some(monitor) = &self.monitor {
            monitor.record_operation("batch.flush", elapsed, result.is_ok());
        }

        match result {
            Ok(replies) => {
                let mut replies: Vec<Option<Reply>> = replies.into_iter().map(Some).collect();
                let mut refused = 0u64;
                for (op, slot) in batch.into_iter().zip(slots) {
                    match replies[slot].take().unwrap_or(Reply::Nil) {
                        Reply::Error(msg) => {
                            refused += 1;
                            debug!(id = op.id, key = op.command.key(), error = %msg, "Command refused by store");
                            op.complete(Err(BatchError::Command(msg)));
                        }
                        reply => op.complete(Ok(reply)),
                    }
                }
                c.resolved.fetch_add(size as u64, Ordering::Relaxed);
                c.refused.fetch_add(refused, Ordering::Relaxed);
                crate::metrics::record_batch_flush(size, "success");
                debug!(size, refused, reason = reason.as_str(), ?elapsed, "Batch flushed");
            }
            Err(err) => {
                c.failed_flushes.fetch_add(1, Ordering::Relaxed);
                c.rejected.fetch_add(size as u64, Ordering::Relaxed);
                crate::metrics::record_batch_flush(size, "failure");
                crate::metrics::record_batch_rejected(size, err.reason());
                warn!(size, reason = reason.as_str(), error = %err, "Batch failed, rejecting all operations");
                for op in batch {
                    op.complete(Err(err.clone()));
                }
            }
        }
        size
    }
}

/// Order the batch's commands for the pipeline, grouped by command kind in
/// order of first appearance. Returns the commands and, for each operation
/// (in batch order), the index of its reply.
///
/// Grouping is skipped when it would reorder a write relative to another
/// command on the same key.
pub(crate) fn build_pipeline(batch: &[BatchedOperation]) -> (Vec<Command>, Vec<usize>) {
    if !can_group(batch) {
        let commands = batch.iter().map(|op| op.command.clone()).collect();
        return (commands, (0..batch.len()).collect());
    }

    let mut kinds: Vec<CommandKind> = Vec::new();
    for op in batch {
        let kind = op.command.kind();
        if !kinds.contains(&kind) {
            kinds.push(kind);
        }
    }

    let mut commands = Vec::with_capacity(batch.len());
    let mut slots = vec![0; batch.len()];
    for kind in kinds {
        for (i, op) in batch.iter().enumerate() {
            if op.command.kind() == kind {
                slots[i] = commands.len();
                commands.push(op.command.clone());
            }
        }
    }
    (commands, slots)
}

fn can_group(batch: &[BatchedOperation]) -> bool {
    let mut seen: HashMap<&str, (CommandKind, bool)> = HashMap::new();
    for op in batch {
        let kind = op.command.kind();
        let write = !kind.is_read();
        match seen.get_mut(op.command.key()) {
            Some((first, any_write)) => {
                *any_write |= write;
                if *first != kind && *any_write {
                    return false;
                }
            }
            None => {
                seen.insert(op.command.key(), (kind, write));
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::circuit_breaker::{CircuitConfig, CircuitState};
    use crate::storage::memory::InMemoryStore;

    fn scheduler(config: BatchConfig) -> (BatchScheduler, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let breaker = Arc::new(CircuitBreaker::new("redis", CircuitConfig::test()));
        (BatchScheduler::new(store.clone(), breaker, config), store)
    }

    fn ops(commands: Vec<Command>) -> Vec<BatchedOperation> {
        commands
            .into_iter()
            .enumerate()
            .map(|(i, c)| BatchedOperation::new(i as u64, c, false).0)
            .collect()
    }

    #[test]
    fn test_pipeline_groups_by_kind() {
        let batch = ops(vec![
            Command::get("a"),
            Command::set("b", "1"),
            Command::get("c"),
            Command::del("d"),
            Command::set("e", "2"),
        ]);
        let (commands, slots) = build_pipeline(&batch);
        let kinds: Vec<_> = commands.iter().map(Command::kind).collect();
        assert_eq!(
            kinds,
            vec![CommandKind::Get, CommandKind::Get, CommandKind::Set, CommandKind::Set, CommandKind::Del]
        );
        assert_eq!(slots, vec![0, 2, 1, 4, 3]);
        for (op, slot) in batch.iter().zip(&slots) {
            assert_eq!(&commands[*slot], &op.command);
        }
    }

    #[test]
    fn test_pipeline_keeps_order_on_same_key_write() {
        let batch = ops(vec![Command::set("k", "1"), Command::del("k"), Command::set("k", "2")]);
        let (commands, slots) = build_pipeline(&batch);
        assert_eq!(slots, vec![0, 1, 2]);
        assert_eq!(commands[2], Command::set("k", "2"));
    }

    #[test]
    fn test_pipeline_groups_repeated_reads() {
        let batch = ops(vec![Command::get("k"), Command::exists("x"), Command::get("k")]);
        let (_, slots) = build_pipeline(&batch);
        assert_eq!(slots, vec![0, 2, 1]);
    }

    #[tokio::test]
    async fn test_enqueue_resolves_after_timeout() {
        let (scheduler, _store) = scheduler(BatchConfig {
            batch_timeout: Duration::from_millis(5),
            ..Default::default()
        });

        scheduler.set("course:1", "intro").await.unwrap();
        assert_eq!(scheduler.get("course:1").await.unwrap(), Some("intro".into()));
        assert_eq!(scheduler.get("course:2").await.unwrap(), None);

        let stats = scheduler.stats();
        assert_eq!(stats.enqueued, 3);
        assert_eq!(stats.resolved, 3);
        assert_eq!(stats.rejected, 0);
    }

    #[tokio::test]
    async fn test_mixed_commands_map_back_positionally() {
        let (scheduler, _store) = scheduler(BatchConfig {
            batch_timeout: Duration::from_millis(20),
            ..Default::default()
        });

        let a = scheduler.enqueue(Command::incr("counter"));
        let b = scheduler.enqueue(Command::set("name", "ada"));
        let c = scheduler.enqueue(Command::sadd("tag:x", "name"));
        let d = scheduler.enqueue(Command::incr("counter"));
        let e = scheduler.enqueue(Command::exists("name"));

        assert_eq!(a.await.unwrap(), Reply::Int(1));
        assert_eq!(b.await.unwrap(), Reply::Ok);
        assert_eq!(c.await.unwrap(), Reply::Int(1));
        assert_eq!(d.await.unwrap(), Reply::Int(2));
        // Same-key write keeps enqueue order, so EXISTS sees the SET
        assert_eq!(e.await.unwrap(), Reply::Int(1));
        assert_eq!(scheduler.stats().flushes, 1);
    }

    #[tokio::test]
    async fn test_force_flush_drains_without_waiting_for_timer() {
        let (scheduler, _store) = scheduler(BatchConfig {
            batch_timeout: Duration::from_secs(60),
            ..Default::default()
        });

        let pending: Vec<_> = (0..10).map(|i| scheduler.enqueue(Command::set(format!("k{}", i), "v"))).collect();
        assert_eq!(scheduler.force_flush().await, 10);
        for p in pending {
            assert_eq!(p.await.unwrap(), Reply::Ok);
        }
        assert_eq!(scheduler.queue_len(), 0);
    }

    #[tokio::test]
    async fn test_open_circuit_rejects_whole_batch() {
        let store = Arc::new(InMemoryStore::new());
        let breaker = Arc::new(CircuitBreaker::new("redis", CircuitConfig::test()));
        let scheduler = BatchScheduler::new(store, breaker.clone(), BatchConfig {
            batch_timeout: Duration::from_secs(60),
            ..Default::default()
        });
        breaker.force_open();

        let pending: Vec<_> = (0..4).map(|i| scheduler.enqueue(Command::get(format!("k{}", i)))).collect();
        scheduler.force_flush().await;

        for p in pending {
            assert_eq!(p.await.unwrap_err(), BatchError::Rejected { circuit: "redis".into() });
        }
        let stats = scheduler.stats();
        assert_eq!(stats.rejected, 4);
        assert_eq!(stats.failed_flushes, 1);
    }

    #[tokio::test]
    async fn test_get_or_else_takes_fallback_on_open_circuit() {
        let store = Arc::new(InMemoryStore::new());
        let breaker = Arc::new(CircuitBreaker::new("redis", CircuitConfig::test()));
        breaker.force_open();
        let scheduler = BatchScheduler::new(store, breaker, BatchConfig {
            batch_timeout: Duration::from_millis(1),
            ..Default::default()
        });

        let value: Result<Option<String>, String> = scheduler
            .get_or_else("k", |_| async { Ok(Some("from-db".to_string())) })
            .await;
        assert_eq!(value.unwrap(), Some("from-db".into()));

        let err: Result<(), String> = scheduler
            .set_or_else("k", "v", None, |e| async move { Err(format!("fallback saw {}", e.reason())) })
            .await;
        assert_eq!(err.unwrap_err(), "fallback saw circuit_open");
    }

    #[tokio::test]
    async fn test_shutdown_drains_then_rejects() {
        let (scheduler, store) = scheduler(BatchConfig {
            batch_timeout: Duration::from_secs(60),
            ..Default::default()
        });

        let pending = scheduler.enqueue(Command::set("k", "v"));
        scheduler.shutdown().await;

        assert_eq!(pending.await.unwrap(), Reply::Ok);
        assert_eq!(store.get("k").await.unwrap(), Some("v".into()));
        assert!(scheduler.is_shutting_down());
        assert_eq!(
            scheduler.enqueue(Command::get("k")).await.unwrap_err(),
            BatchError::ShuttingDown
        );
    }

    #[tokio::test]
    async fn test_update_config_applies_to_next_flush() {
        let (scheduler, _store) = scheduler(BatchConfig {
            batch_timeout: Duration::from_secs(60),
            ..Default::default()
        });

        let first: Vec<_> = (0..2).map(|i| scheduler.enqueue(Command::get(format!("a{}", i)))).collect();

        scheduler.update_config(BatchConfig {
            max_batch_size: 2,
            batch_timeout: Duration::from_secs(60),
            ..Default::default()
        });
        assert_eq!(scheduler.config().max_batch_size, 2);

        for p in first {
            p.await.unwrap();
        }
        assert_eq!(scheduler.stats().largest_batch, 2);
    }

    #[tokio::test]
    async fn test_refused_command_leaves_batch_and_breaker_alone() {
        let store = Arc::new(InMemoryStore::new());
        let breaker = Arc::new(CircuitBreaker::new("redis", CircuitConfig::test()));
        let scheduler = BatchScheduler::new(store.clone(), breaker.clone(), BatchConfig {
            batch_timeout: Duration::from_secs(60),
            ..Default::default()
        });
        store.pipeline(&[Command::set("name", "ada")]).await.unwrap();

        for i in 0..3 {
            let get = scheduler.enqueue(Command::get(format!("course:{}", i)));
            let incr = scheduler.enqueue(Command::incr("name"));
            assert_eq!(scheduler.force_flush().await, 2);
            assert_eq!(get.await.unwrap(), Reply::Nil);
            assert!(matches!(incr.await, Err(BatchError::Command(_))));
        }

        assert_eq!(breaker.state(), CircuitState::Closed);
        let stats = scheduler.stats();
        assert_eq!(stats.flushes, 3);
        assert_eq!(stats.failed_flushes, 0);
        assert_eq!(stats.refused, 3);
        assert_eq!(stats.rejected, 0);
    }

    #[tokio::test]
    async fn test_zero_batch_size_is_raised_to_one() {
        let (scheduler, _store) = scheduler(BatchConfig {
            max_batch_size: 0,
            batch_timeout: Duration::from_secs(60),
            ..Default::default()
        });
        assert_eq!(scheduler.config().max_batch_size, 1);

        scheduler.update_config(BatchConfig {
            max_batch_size: 0,
            batch_timeout: Duration::from_secs(60),
            ..Default::default()
        });
        assert_eq!(scheduler.config().max_batch_size, 1);

        // Size 1 flushes on enqueue without the timer
        let reply = tokio::time::timeout(Duration::from_secs(1), scheduler.set("k", "v")).await;
        assert!(reply.unwrap().is_ok());
        assert_eq!(scheduler.stats().largest_batch, 1);
    }

    #[tokio::test]
    async fn test_priority_lane_toggle() {
        let (scheduler, _store) = scheduler(BatchConfig {
            batch_timeout: Duration::from_secs(60),
            ..Default::default()
        });
        let _a = scheduler.enqueue(Command::get("auth:1"));
        let _b = scheduler.enqueue(Command::get("course:1"));
        assert_eq!(scheduler.stats().queued_priority, 1);

        scheduler.update_config(BatchConfig {
            priority_queues: false,
            batch_timeout: Duration::from_secs(60),
            ..Default::default()
        });
        let _c = scheduler.enqueue(Command::get("auth:2"));
        let stats = scheduler.stats();
        assert_eq!(stats.queued_priority, 1);
        assert_eq!(stats.queued_regular, 2);
        scheduler.force_flush().await;
    }
}
