// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use super::command::{Command, Reply};
use super::glob::glob_match;
use super::traits::{KvStore, StoreError, StoreInfo};

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Set(HashSet<String>),
}

impl Value {
    fn size_bytes(&self) -> usize {
        match self {
            Value::Str(s) => s.len(),
            Value::Set(members) => members.iter().map(String::len).sum(),
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-process store with Redis semantics for the commands the cache layer uses.
///
/// Keys expire lazily on access. Pub/sub is a process-local broadcast, so
/// several layers sharing one `InMemoryStore` behave like peers on one Redis.
pub struct InMemoryStore {
    data: DashMap<String, Entry>,
    pubsub: broadcast::Sender<(String, String)>,
    max_memory: AtomicU64,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        let (pubsub, _) = broadcast::channel(1024);
        Self {
            data: DashMap::new(),
            pubsub,
            max_memory: AtomicU64::new(0),
        }
    }

    /// Set the memory ceiling reported by [`KvStore::info`].
    #[must_use]
    pub fn with_max_memory(self, bytes: u64) -> Self {
        self.max_memory.store(bytes, Ordering::Relaxed);
        self
    }

    /// Get current key count (including keys not yet lazily expired)
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn clear(&self) {
        self.data.clear();
    }

    fn live_entry(&self, key: &str) -> Option<Entry> {
        let now = Instant::now();
        let entry = self.data.get(key).map(|e| e.value().clone())?;
        if entry.is_expired(now) {
            self.data.remove(key);
            None
        } else {
            Some(entry)
        }
    }

    fn set_string(&self, key: &str, value: &str, ttl: Option<Duration>) {
        self.data.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
    }

    fn add_to_counter(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        let current = match self.live_entry(key) {
            None => 0,
            Some(Entry { value: Value::Str(s), .. }) => s
                .parse::<i64>()
                .map_err(|_| StoreError::Protocol("ERR value is not an integer".into()))?,
            Some(_) => return Err(wrong_type()),
        };
        let next = current
            .checked_add(delta)
            .ok_or_else(|| StoreError::Protocol("ERR increment or decrement would overflow".into()))?;
        let expires_at = self.data.get(key).and_then(|e| e.expires_at);
        self.data.insert(
            key.to_string(),
            Entry { value: Value::Str(next.to_string()), expires_at },
        );
        Ok(next)
    }

    fn apply(&self, command: &Command) -> Result<Reply, StoreError> {
        match command {
            Command::Get { key } => match self.live_entry(key) {
                None => Ok(Reply::Nil),
                Some(Entry { value: Value::Str(s), .. }) => Ok(Reply::Data(s)),
                Some(_) => Err(wrong_type()),
            },
            Command::Set { key, value } => {
                self.set_string(key, value, None);
                Ok(Reply::Ok)
            }
            Command::SetEx { key, ttl_secs, value } => {
                self.set_string(key, value, Some(Duration::from_secs(*ttl_secs)));
                Ok(Reply::Ok)
            }
            Command::Del { key } => {
                let existed = self.live_entry(key).is_some();
                self.data.remove(key);
                Ok(Reply::Int(i64::from(existed)))
            }
            Command::Exists { key } => Ok(Reply::Int(i64::from(self.live_entry(key).is_some()))),
            Command::Expire { key, ttl_secs } => {
                if self.live_entry(key).is_none() {
                    return Ok(Reply::Int(0));
                }
                if let Some(mut entry) = self.data.get_mut(key) {
                    entry.expires_at = Some(Instant::now() + Duration::from_secs(*ttl_secs));
                }
                Ok(Reply::Int(1))
            }
            Command::Incr { key } => self.add_to_counter(key, 1).map(Reply::Int),
            Command::Decr { key } => self.add_to_counter(key, -1).map(Reply::Int),
            Command::SAdd { key, member } => {
                let mut entry = match self.live_entry(key) {
                    None => Entry { value: Value::Set(HashSet::new()), expires_at: None },
                    Some(e @ Entry { value: Value::Set(_), .. }) => e,
                    Some(_) => return Err(wrong_type()),
                };
                let added = match &mut entry.value {
                    Value::Set(members) => members.insert(member.clone()),
                    Value::Str(_) => false,
                };
                self.data.insert(key.clone(), entry);
                Ok(Reply::Int(i64::from(added)))
            }
            Command::SRem { key, member } => {
                let Some(mut entry) = self.live_entry(key) else {
                    return Ok(Reply::Int(0));
                };
                let removed = match &mut entry.value {
                    Value::Set(members) => members.remove(member),
                    Value::Str(_) => return Err(wrong_type()),
                };
                let now_empty = matches!(&entry.value, Value::Set(m) if m.is_empty());
                if now_empty {
                    self.data.remove(key);
                } else {
                    self.data.insert(key.clone(), entry);
                }
                Ok(Reply::Int(i64::from(removed)))
            }
        }
    }
}

fn wrong_type() -> StoreError {
    StoreError::Protocol("WRONGTYPE Operation against a key holding the wrong kind of value".into())
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for InMemoryStore {
    async fn pipeline(&self, commands: &[Command]) -> Result<Vec<Reply>, StoreError> {
        Ok(commands
            .iter()
            .map(|cmd| match self.apply(cmd) {
                Ok(reply) => reply,
                Err(StoreError::Protocol(msg)) => Reply::Error(msg),
                Err(other) => Reply::Error(other.to_string()),
            })
            .collect())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        match self.live_entry(key) {
            None => Ok(Vec::new()),
            Some(Entry { value: Value::Set(members), .. }) => Ok(members.into_iter().collect()),
            Some(_) => Err(wrong_type()),
        }
    }

    async fn scan_match(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let now = Instant::now();
        Ok(self
            .data
            .iter()
            .filter(|e| !e.value().is_expired(now) && glob_match(pattern, e.key()))
            .map(|e| e.key().clone())
            .collect())
    }

    async fn del_many(&self, keys: &[String]) -> Result<u64, StoreError> {
        let now = Instant::now();
        let mut deleted = 0;
        for key in keys {
            if let Some((_, entry)) = self.data.remove(key) {
                if !entry.is_expired(now) {
                    deleted += 1;
                }
            }
        }
        Ok(deleted)
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<u64, StoreError> {
        // No receivers is not an error for PUBLISH
        let receivers = self
            .pubsub
            .send((channel.to_string(), message.to_string()))
            .unwrap_or(0);
        Ok(receivers as u64)
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>, StoreError> {
        let mut rx = self.pubsub.subscribe();
        let (tx, out) = mpsc::channel(256);
        let channel = channel.to_string();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok((ch, msg)) if ch == channel => {
                        if tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, channel = %channel, "In-memory subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(out)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn info(&self) -> Result<StoreInfo, StoreError> {
        let used: usize = self
            .data
            .iter()
            .map(|e| e.key().len() + e.value().value.size_bytes())
            .sum();
        Ok(StoreInfo {
            used_memory: used as u64,
            max_memory: self.max_memory.load(Ordering::Relaxed),
            connected_clients: 1 + self.pubsub.receiver_count() as u64,
        })
    }
}
