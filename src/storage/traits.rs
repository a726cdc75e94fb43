// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use super::command::{Command, Reply};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Store backend error: {0}")]
    Backend(String),
    #[error("Unexpected store reply: {0}")]
    Protocol(String),
    #[error("Store connection closed")]
    Closed,
    /// Refused by a circuit breaker, or abandoned at its deadline
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Backend(err.to_string())
    }
}

/// Point-in-time server statistics used by health checks and usage auditing.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StoreInfo {
    /// Bytes currently used by the store
    pub used_memory: u64,
    /// Configured memory ceiling (0 = unbounded)
    pub max_memory: u64,
    /// Connected clients as reported by the server
    pub connected_clients: u64,
}

impl StoreInfo {
    /// Memory usage as a percentage of the ceiling, 0 when unbounded.
    #[must_use]
    pub fn memory_pct(&self) -> f64 {
        if self.max_memory == 0 {
            0.0
        } else {
            self.used_memory as f64 / self.max_memory as f64 * 100.0
        }
    }
}

/// The external key-value store consumed by the cache layer.
///
/// Everything the scheduler sends goes through [`KvStore::pipeline`], which
/// must answer with one reply per command in the same order. The remaining
/// methods serve invalidation (set reads, glob scans, bulk deletes, pub/sub)
/// and health checks.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Execute all commands in one round trip.
    ///
    /// A command the store refuses is answered with [`Reply::Error`] in its
    /// own slot; `Err` is reserved for failures of the round trip itself.
    async fn pipeline(&self, commands: &[Command]) -> Result<Vec<Reply>, StoreError>;

    /// SMEMBERS
    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError>;

    /// Cursor SCAN with a Redis-style glob, collected to completion.
    async fn scan_match(&self, pattern: &str) -> Result<Vec<String>, StoreError>;

    /// DEL over many keys, returning how many existed.
    async fn del_many(&self, keys: &[String]) -> Result<u64, StoreError>;

    /// PUBLISH, returning the number of receivers.
    async fn publish(&self, channel: &str, message: &str) -> Result<u64, StoreError>;

    /// SUBSCRIBE; messages arrive on the returned channel until it is dropped.
    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>, StoreError>;

    /// Liveness check (PING).
    async fn ping(&self) -> Result<(), StoreError>;

    /// Memory and connection statistics.
    async fn info(&self) -> Result<StoreInfo, StoreError>;

    /// GET, routed through a one-command pipeline by default.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut replies = self.pipeline(&[Command::get(key)]).await?;
        match replies.pop() {
            Some(Reply::Error(msg)) => Err(StoreError::Protocol(msg)),
            Some(reply) => Ok(reply.into_value()),
            None => Err(StoreError::Protocol("empty pipeline reply".into())),
        }
    }
}
