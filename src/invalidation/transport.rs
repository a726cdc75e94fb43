// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cross-instance delivery of invalidation events.
//!
//! - [`PushTransport`]: PUBLISH on a channel, peers SUBSCRIBE.
//! - [`PollTransport`]: write a short-lived signal key per event; peers
//!   scan for signals on an interval and delete what they consume. For
//!   stores where pub/sub delivery cannot be relied on.
//!
//! Delivery is at-least-once at best and unordered. Handlers must be
//! idempotent, which deletes are.
//!
//! Store calls go through the transport's circuit breaker when one is set.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::event::InvalidationEvent;
use crate::resilience::circuit_breaker::{guarded, CircuitBreaker};
use crate::storage::command::{Command, Reply};
use crate::storage::traits::{KvStore, StoreError};

/// How many consumed signal ids a poller remembers.
const SEEN_CAPACITY: usize = 4096;
const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport store error: {0}")]
    Store(#[from] StoreError),

    #[error("event encoding failed: {0}")]
    Codec(#[from] serde_json::Error),
}

#[async_trait]
pub trait EventTransport: Send + Sync {
    fn name(&self) -> &'static str;

    /// Announce an event to peers.
    async fn publish(&self, event: &InvalidationEvent) -> Result<(), TransportError>;

    /// Stream of events from peers (and possibly this instance; callers
    /// filter by origin). Ends if the underlying subscription is lost.
    async fn listen(&self) -> Result<mpsc::Receiver<InvalidationEvent>, TransportError>;
}

pub struct PushTransport {
    store: Arc<dyn KvStore>,
    channel: String,
    breaker: Option<Arc<CircuitBreaker>>,
}

impl PushTransport {
    pub fn new(store: Arc<dyn KvStore>, channel: impl Into<String>) -> Self {
        Self { store, channel: channel.into(), breaker: None }
    }

    #[must_use]
    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }
}

#[async_trait]
impl EventTransport for PushTransport {
    fn name(&self) -> &'static str {
        "push"
    }

    async fn publish(&self, event: &InvalidationEvent) -> Result<(), TransportError> {
        let message = event.encode()?;
        let receivers = guarded(self.breaker.as_deref(), || self.store.publish(&self.channel, &message)).await?;
        debug!(channel = %self.channel, event_type = %event.event_type, receivers, "Invalidation published");
        Ok(())
    }

    async fn listen(&self) -> Result<mpsc::Receiver<InvalidationEvent>, TransportError> {
        let mut raw = guarded(self.breaker.as_deref(), || self.store.subscribe(&self.channel)).await?;
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let channel = self.channel.clone();

        tokio::spawn(async move {
            while let Some(message) = raw.recv().await {
                match InvalidationEvent::decode(&message) {
                    Ok(event) => {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(channel = %channel, error = %e, "Dropping malformed invalidation message");
                        crate::metrics::record_transport_error("push", "decode");
                    }
                }
            }
            debug!(channel = %channel, "Push transport stream closed");
        });
        Ok(rx)
    }
}

pub struct PollTransport {
    store: Arc<dyn KvStore>,
    prefix: String,
    instance_id: String,
    interval: Duration,
    signal_ttl: Duration,
    breaker: Option<Arc<CircuitBreaker>>,
}

impl PollTransport {
    pub fn new(
        store: Arc<dyn KvStore>,
        prefix: impl Into<String>,
        instance_id: impl Into<String>,
        interval: Duration,
        signal_ttl: Duration,
    ) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            instance_id: instance_id.into(),
            interval,
            signal_ttl,
            breaker: None,
        }
    }

    #[must_use]
    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    /// `{prefix}:{origin}:{event id}`
    #[must_use]
    pub fn signal_key(&self, event: &InvalidationEvent) -> String {
        format!("{}:{}:{}", self.prefix, event.origin, event.id)
    }
}

/// Bounded memory of consumed signal keys, in case a delete fails and the
/// signal is seen again before its TTL runs out.
struct Seen {
    order: VecDeque<String>,
    set: HashSet<String>,
}

impl Seen {
    fn new() -> Self {
        Self { order: VecDeque::new(), set: HashSet::new() }
    }

    /// Returns false if already present.
    fn insert(&mut self, key: &str) -> bool {
        if self.set.contains(key) {
            return false;
        }
        if self.order.len() >= SEEN_CAPACITY {
            if let Some(old) = self.order.pop_front() {
                self.set.remove(&old);
            }
        }
        self.order.push_back(key.to_string());
        self.set.insert(key.to_string());
        true
    }
}

#[async_trait]
impl EventTransport for PollTransport {
    fn name(&self) -> &'static str {
        "poll"
    }

    async fn publish(&self, event: &InvalidationEvent) -> Result<(), TransportError> {
        let key = self.signal_key(event);
        let ttl = self.signal_ttl.as_secs().max(1);
        let commands = [Command::set_ex(key.as_str(), event.encode()?, ttl)];
        let replies = guarded(self.breaker.as_deref(), || self.store.pipeline(&commands)).await?;
        if let Some(Reply::Error(msg)) = replies.into_iter().next() {
            return Err(StoreError::Protocol(msg).into());
        }
        debug!(key = %key, event_type = %event.event_type, "Invalidation signal written");
        Ok(())
    }

    async fn listen(&self) -> Result<mpsc::Receiver<InvalidationEvent>, TransportError> {
        // Ping once so a dead store fails the call instead of the task
        guarded(self.breaker.as_deref(), || self.store.ping()).await?;

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let store = self.store.clone();
        let breaker = self.breaker.clone();
        let pattern = format!("{}:*", self.prefix);
        let own = format!("{}:{}:", self.prefix, self.instance_id);
        let interval = self.interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut seen = Seen::new();

            loop {
                ticker.tick().await;
                if tx.is_closed() {
                    break;
                }

                let keys = match guarded(breaker.as_deref(), || store.scan_match(&pattern)).await {
                    Ok(keys) => keys,
                    Err(e) => {
                        warn!(error = %e, "Invalidation signal scan failed");
                        crate::metrics::record_transport_error("poll", "scan");
                        continue;
                    }
                };

                let mut consumed = Vec::new();
                for key in keys.into_iter().filter(|k| !k.starts_with(&own)) {
                    if !seen.insert(&key) {
                        consumed.push(key);
                        continue;
                    }
                    match guarded(breaker.as_deref(), || store.get(&key)).await {
                        Ok(Some(raw)) => match InvalidationEvent::decode(&raw) {
                            Ok(event) => {
                                if tx.send(event).await.is_err() {
                                    return;
                                }
                            }
                            Err(e) => {
                                warn!(key = %key, error = %e, "Dropping malformed invalidation signal");
                                crate::metrics::record_transport_error("poll", "decode");
                            }
                        },
                        // Expired or consumed by a peer between SCAN and GET
                        Ok(None) => {}
                        Err(e) => {
                            warn!(key = %key, error = %e, "Invalidation signal read failed");
                            crate::metrics::record_transport_error("poll", "read");
                        }
                    }
                    consumed.push(key);
                }

                if !consumed.is_empty() {
                    if let Err(e) = guarded(breaker.as_deref(), || store.del_many(&consumed)).await {
                        warn!(count = consumed.len(), error = %e, "Failed to delete consumed signals");
                    }
                }
            }
            debug!("Poll transport stopped");
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::circuit_breaker::CircuitConfig;
    use crate::storage::memory::InMemoryStore;
    use serde_json::json;

    fn event(origin: &str) -> InvalidationEvent {
        InvalidationEvent::new("course.updated", json!({"course_id": 1}), None, None, origin)
    }

    #[tokio::test]
    async fn test_push_roundtrip() {
        let store: Arc<dyn KvStore> = Arc::new(InMemoryStore::new());
        let a = PushTransport::new(store.clone(), "cache:invalidation");
        let b = PushTransport::new(store, "cache:invalidation");

        let mut rx = b.listen().await.unwrap();
        let sent = event("node-a");
        a.publish(&sent).await.unwrap();

        let got = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(got, sent);
    }

    #[tokio::test]
    async fn test_poll_delivers_peer_signals_and_deletes_them() {
        let store = Arc::new(InMemoryStore::new());
        let writer = PollTransport::new(store.clone(), "sig", "node-a", Duration::from_millis(10), Duration::from_secs(30));
        let reader = PollTransport::new(store.clone(), "sig", "node-b", Duration::from_millis(10), Duration::from_secs(30));

        let sent = event("node-a");
        writer.publish(&sent).await.unwrap();
        assert!(store.get(&writer.signal_key(&sent)).await.unwrap().is_some());

        let mut rx = reader.listen().await.unwrap();
        let got = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(got.id, sent.id);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(store.get(&writer.signal_key(&sent)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_poll_ignores_own_signals() {
        let store = Arc::new(InMemoryStore::new());
        let node = PollTransport::new(store.clone(), "sig", "node-a", Duration::from_millis(10), Duration::from_secs(30));

        let own = event("node-a");
        node.publish(&own).await.unwrap();
        let mut rx = node.listen().await.unwrap();

        let got = tokio::time::timeout(Duration::from_millis(60), rx.recv()).await;
        assert!(got.is_err());
        // Own signal is left for peers
        assert!(store.get(&node.signal_key(&own)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_open_breaker_stops_publish_before_the_store() {
        let store = Arc::new(InMemoryStore::new());
        let breaker = Arc::new(CircuitBreaker::new("invalidation", CircuitConfig::test()));
        breaker.force_open();
        let poll = PollTransport::new(store.clone(), "sig", "node-a", Duration::from_millis(10), Duration::from_secs(30))
            .with_breaker(breaker.clone());
        let push = PushTransport::new(store.clone(), "cache:invalidation").with_breaker(breaker.clone());

        let sent = event("node-a");
        let err = poll.publish(&sent).await.unwrap_err();
        assert!(matches!(err, TransportError::Store(StoreError::Unavailable(_))));
        assert!(store.get(&poll.signal_key(&sent)).await.unwrap().is_none());

        assert!(push.publish(&sent).await.is_err());
        assert!(poll.listen().await.is_err());
        assert_eq!(breaker.rejections(), 3);
    }

    #[test]
    fn test_seen_is_bounded() {
        let mut seen = Seen::new();
        assert!(seen.insert("a"));
        assert!(!seen.insert("a"));
        for i in 0..SEEN_CAPACITY {
            seen.insert(&i.to_string());
        }
        assert_eq!(seen.order.len(), SEEN_CAPACITY);
        assert!(seen.insert("a"));
    }
}
