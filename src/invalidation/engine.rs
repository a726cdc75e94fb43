// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Rule-driven cache invalidation.
//!
//! [`InvalidationEngine::trigger`] runs every matching rule locally, then
//! hands the event to the transport so peers converge. Events received from
//! peers run the same rules; events carrying this instance's origin are
//! ignored since they were already applied.
//!
//! Rules fail independently: a store error in one rule is logged and
//! counted, and its siblings still run. Subscriber callbacks are isolated
//! the same way, including panics.
//!
//! With a breaker attached ([`InvalidationEngine::with_breaker`]) every
//! store call is deadline-bound and fails fast while the breaker is open.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::event::InvalidationEvent;
use super::rules::{render, render_pattern, InvalidationRule};
use super::transport::EventTransport;
use crate::monitoring::service::now_millis;
use crate::monitoring::MonitoringService;
use crate::resilience::circuit_breaker::{guarded, CircuitBreaker};
use crate::resilience::retry::RetryConfig;
use crate::storage::command::{Command, Reply};
use crate::storage::glob::escape_glob;
use crate::storage::traits::{KvStore, StoreError};

const MILLIS_PER_DAY: u64 = 24 * 60 * 60 * 1000;

/// Subscriber callback, keyed by event type (`"*"` receives everything).
pub type EventCallback = Arc<dyn Fn(&InvalidationEvent) + Send + Sync>;

#[derive(Debug, Error)]
#[error("invalidation rule '{rule}' failed: {source}")]
pub struct RuleError {
    pub rule: String,
    #[source]
    pub source: StoreError,
}

#[derive(Debug, Clone)]
pub struct InvalidationSettings {
    pub instance_id: String,
    /// Prefix of the reverse-index sets (`{tag_prefix}{tag}`)
    pub tag_prefix: String,
    /// Key families deleted for user-scoped rules; `{user}` is substituted
    pub user_key_patterns: Vec<String>,
}

impl Default for InvalidationSettings {
    fn default() -> Self {
        Self {
            instance_id: uuid::Uuid::new_v4().to_string(),
            tag_prefix: "tag:".into(),
            user_key_patterns: vec![
                "user:{user}:*".into(),
                "cache:user:{user}:*".into(),
                "session:{user}:*".into(),
            ],
        }
    }
}

/// Outcome of one local trigger.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TriggerReport {
    pub rules_matched: usize,
    pub rules_executed: usize,
    pub rules_failed: usize,
    pub rules_skipped: usize,
    pub rules_delayed: usize,
    pub keys_invalidated: u64,
    pub propagated: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RuleStats {
    pub invocations: u64,
    pub entries_invalidated: u64,
    pub errors: u64,
    /// Unix millis
    pub last_run_at: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EventStats {
    pub triggered: u64,
    pub received: u64,
    pub entries_invalidated: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DailyStats {
    pub events: u64,
    pub entries_invalidated: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct InvalidationStats {
    pub rules: HashMap<String, RuleStats>,
    pub events: HashMap<String, EventStats>,
    /// Keyed by days since the Unix epoch
    pub daily: HashMap<u64, DailyStats>,
    pub remote_events_ignored: u64,
}

pub struct InvalidationEngine {
    store: Arc<dyn KvStore>,
    transport: Option<Arc<dyn EventTransport>>,
    monitor: Option<Arc<MonitoringService>>,
    breaker: Option<Arc<CircuitBreaker>>,
    settings: RwLock<InvalidationSettings>,
    rules: DashMap<String, Arc<InvalidationRule>>,
    subscribers: RwLock<HashMap<String, Vec<EventCallback>>>,

    rule_stats: DashMap<String, RuleStats>,
    event_stats: DashMap<String, EventStats>,
    daily_stats: DashMap<u64, DailyStats>,
    own_echoes: AtomicU64,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Origin {
    Local,
    Remote,
}

impl Origin {
    fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
        }
    }
}

impl InvalidationEngine {
    pub fn new(store: Arc<dyn KvStore>, settings: InvalidationSettings) -> Self {
        Self {
            store,
            transport: None,
            monitor: None,
            breaker: None,
            settings: RwLock::new(settings),
            rules: DashMap::new(),
            subscribers: RwLock::new(HashMap::new()),
            rule_stats: DashMap::new(),
            event_stats: DashMap::new(),
            daily_stats: DashMap::new(),
            own_echoes: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn with_transport(mut self, transport: Arc<dyn EventTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    #[must_use]
    pub fn with_monitor(mut self, monitor: Arc<MonitoringService>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    #[must_use]
    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    #[must_use]
    pub fn instance_id(&self) -> String {
        self.settings.read().instance_id.clone()
    }

    /// Swap tag prefix and user key patterns. The instance id is kept.
    pub fn update_settings(&self, mut settings: InvalidationSettings) {
        let mut current = self.settings.write();
        settings.instance_id = current.instance_id.clone();
        *current = settings;
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Rules and subscribers
    // ═══════════════════════════════════════════════════════════════════════

    /// Register a rule, replacing any rule with the same name.
    pub fn add_rule(&self, rule: InvalidationRule) {
        debug!(rule = %rule.name, triggers = ?rule.triggers, "Invalidation rule registered");
        self.rules.insert(rule.name.clone(), Arc::new(rule));
    }

    /// Returns false if no rule had that name.
    pub fn remove_rule(&self, name: &str) -> bool {
        self.rules.remove(name).is_some()
    }

    #[must_use]
    pub fn rule_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.rules.iter().map(|r| r.key().clone()).collect();
        names.sort();
        names
    }

    /// Call `callback` for every event of `event_type` handled here, local
    /// or remote. Use `"*"` for all events.
    pub fn subscribe<F>(&self, event_type: &str, callback: F)
    where
        F: Fn(&InvalidationEvent) + Send + Sync + 'static,
    {
        self.subscribers
            .write()
            .entry(event_type.to_string())
            .or_default()
            .push(Arc::new(callback));
    }

    fn notify_subscribers(&self, event: &InvalidationEvent) {
        let callbacks: Vec<EventCallback> = {
            let subs = self.subscribers.read();
            subs.get(&event.event_type)
                .into_iter()
                .chain(subs.get("*"))
                .flatten()
                .cloned()
                .collect()
        };
        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                error!(event_type = %event.event_type, "Invalidation subscriber panicked");
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Triggering
    // ═══════════════════════════════════════════════════════════════════════

    /// Apply matching rules here, then broadcast to peers.
    ///
    /// Never fails: rule errors are counted in the report, and a failed
    /// broadcast leaves `propagated` false.
    pub async fn trigger(
        self: &Arc<Self>,
        event_type: &str,
        payload: Value,
        user_id: Option<String>,
        source: Option<String>,
    ) -> TriggerReport {
        let event = InvalidationEvent::new(event_type, payload, user_id, source, self.instance_id());
        let mut report = self.handle_event(&event, Origin::Local).await;

        if let Some(transport) = &self.transport {
            match transport.publish(&event).await {
                Ok(()) => report.propagated = true,
                Err(e) => {
                    warn!(event_type, transport = transport.name(), error = %e, "Failed to propagate invalidation");
                    crate::metrics::record_transport_error(transport.name(), "publish");
                }
            }
        }
        report
    }

    /// Apply an event received from a peer. Own echoes are skipped.
    pub async fn apply_remote(self: &Arc<Self>, event: InvalidationEvent) -> Option<TriggerReport> {
        if event.origin == self.settings.read().instance_id {
            self.own_echoes.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        Some(self.handle_event(&event, Origin::Remote).await)
    }

    async fn handle_event(self: &Arc<Self>, event: &InvalidationEvent, origin: Origin) -> TriggerReport {
        crate::metrics::record_invalidation_event(&event.event_type, origin.as_str());
        {
            let mut stats = self.event_stats.entry(event.event_type.clone()).or_default();
            match origin {
                Origin::Local => stats.triggered += 1,
                Origin::Remote => stats.received += 1,
            }
        }
        self.daily_stats.entry(today()).or_default().events += 1;

        let mut matching: Vec<Arc<InvalidationRule>> = self
            .rules
            .iter()
            .filter(|r| r.matches(&event.event_type))
            .map(|r| r.value().clone())
            .collect();
        matching.sort_by(|a, b| a.name.cmp(&b.name));

        let mut report = TriggerReport { rules_matched: matching.len(), ..Default::default() };

        for rule in matching {
            if !rule.applies_to(&event.payload) {
                report.rules_skipped += 1;
                continue;
            }
            if let Some(delay) = rule.targets.delay {
                report.rules_delayed += 1;
                self.schedule(rule, event.clone(), delay);
                continue;
            }
            match self.run_rule(&rule, event).await {
                Ok(deleted) => {
                    report.rules_executed += 1;
                    report.keys_invalidated += deleted;
                }
                Err(_) => report.rules_failed += 1,
            }
        }

        self.notify_subscribers(event);
        debug!(
            event_type = %event.event_type,
            origin = origin.as_str(),
            matched = report.rules_matched,
            invalidated = report.keys_invalidated,
            "Invalidation event handled"
        );
        report
    }

    fn schedule(self: &Arc<Self>, rule: Arc<InvalidationRule>, event: InvalidationEvent, delay: Duration) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Errors are already logged and counted by run_rule
            let _ = engine.run_rule(&rule, &event).await;
        });
    }

    async fn run_rule(&self, rule: &InvalidationRule, event: &InvalidationEvent) -> Result<u64, RuleError> {
        let started = Instant::now();
        let result = self.execute_targets(rule, event).await;
        let elapsed = started.elapsed();

        {
            let mut stats = self.rule_stats.entry(rule.name.clone()).or_default();
            stats.invocations += 1;
            stats.last_run_at = Some(now_millis());
            match &result {
                Ok(deleted) => stats.entries_invalidated += deleted,
                Err(_) => stats.errors += 1,
            }
        }
        if let Some(monitor) = &self.monitor {
            monitor.record_operation(&format!("invalidation:{}", rule.name), elapsed, result.is_ok());
        }

        match result {
            Ok(deleted) => {
                self.event_stats
                    .entry(event.event_type.clone())
                    .or_default()
                    .entries_invalidated += deleted;
                self.daily_stats.entry(today()).or_default().entries_invalidated += deleted;
                crate::metrics::record_invalidation(&rule.name, &event.event_type, deleted);
                Ok(deleted)
            }
            Err(source) => {
                let err = RuleError { rule: rule.name.clone(), source };
                warn!(rule = %rule.name, event_type = %event.event_type, error = %err, "Invalidation rule failed");
                crate::metrics::record_rule_error(&rule.name);
                Err(err)
            }
        }
    }

    async fn execute_targets(&self, rule: &InvalidationRule, event: &InvalidationEvent) -> Result<u64, StoreError> {
        let mut deleted = 0;

        for template in &rule.targets.tags {
            match render(template, event) {
                Some(tag) => deleted += self.invalidate_tag(&tag).await?,
                None => debug!(rule = %rule.name, template = %template, "Tag placeholder unresolved, skipping"),
            }
        }
        for template in &rule.targets.patterns {
            match render_pattern(template, event) {
                Some(pattern) => deleted += self.invalidate_pattern(&pattern).await?,
                None => debug!(rule = %rule.name, template = %template, "Pattern placeholder unresolved, skipping"),
            }
        }
        if rule.targets.user_scoped {
            match &event.user_id {
                Some(user) => deleted += self.invalidate_user(user).await?,
                None => debug!(rule = %rule.name, "User-scoped rule fired without a user id"),
            }
        }
        Ok(deleted)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Direct invalidation
    // ═══════════════════════════════════════════════════════════════════════

    fn tag_set_key(&self, tag: &str) -> String {
        format!("{}{}", self.settings.read().tag_prefix, tag)
    }

    /// Register `key` under each tag's reverse index.
    pub async fn tag_key(&self, key: &str, tags: &[&str]) -> Result<(), StoreError> {
        let commands: Vec<Command> = tags
            .iter()
            .map(|tag| Command::sadd(self.tag_set_key(tag), key))
            .collect();
        let replies = guarded(self.breaker.as_deref(), || self.store.pipeline(&commands)).await?;
        match replies.into_iter().find_map(|r| match r {
            Reply::Error(msg) => Some(msg),
            _ => None,
        }) {
            Some(msg) => Err(StoreError::Protocol(msg)),
            None => Ok(()),
        }
    }

    /// Delete every key registered under `tag`, plus the tag set itself.
    /// Returns the number of cache entries removed (the set is not counted).
    pub async fn invalidate_tag(&self, tag: &str) -> Result<u64, StoreError> {
        let set_key = self.tag_set_key(tag);
        let mut keys = guarded(self.breaker.as_deref(), || self.store.smembers(&set_key)).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        let entries = keys.len();
        keys.push(set_key);
        let removed = guarded(self.breaker.as_deref(), || self.store.del_many(&keys)).await?;
        // A non-empty set exists, so one of the removals is the set
        let removed = removed.saturating_sub(1);
        debug!(tag, members = entries, removed, "Tag invalidated");
        Ok(removed)
    }

    pub async fn invalidate_tags(&self, tags: &[&str]) -> Result<u64, StoreError> {
        let mut total = 0;
        for tag in tags {
            total += self.invalidate_tag(tag).await?;
        }
        Ok(total)
    }

    /// SCAN for `pattern` and delete every match. The pattern is used as
    /// given; escape untrusted parts with [`escape_glob`].
    pub async fn invalidate_pattern(&self, pattern: &str) -> Result<u64, StoreError> {
        let keys = guarded(self.breaker.as_deref(), || self.store.scan_match(pattern)).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        let removed = guarded(self.breaker.as_deref(), || self.store.del_many(&keys)).await?;
        debug!(pattern, matched = keys.len(), removed, "Pattern invalidated");
        Ok(removed)
    }

    /// Delete the configured per-user key families for `user_id`. The id
    /// only ever matches itself.
    pub async fn invalidate_user(&self, user_id: &str) -> Result<u64, StoreError> {
        let user = escape_glob(user_id);
        let patterns: Vec<String> = self
            .settings
            .read()
            .user_key_patterns
            .iter()
            .map(|p| p.replace("{user}", &user))
            .collect();
        let mut total = 0;
        for pattern in patterns {
            total += self.invalidate_pattern(&pattern).await?;
        }
        Ok(total)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Peer listener
    // ═══════════════════════════════════════════════════════════════════════

    /// Consume events from peers until `shutdown` flips. A lost
    /// subscription is re-established with backoff.
    pub fn spawn_listener(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Option<JoinHandle<()>> {
        let transport = self.transport.clone()?;
        let engine = Arc::clone(self);

        Some(tokio::spawn(async move {
            let backoff = RetryConfig::resubscribe();
            let mut attempt = 0usize;

            loop {
                if *shutdown.borrow() {
                    break;
                }
                let mut events = match transport.listen().await {
                    Ok(rx) => {
                        if attempt > 0 {
                            info!(transport = transport.name(), attempts = attempt, "Invalidation listener reconnected");
                        }
                        attempt = 0;
                        rx
                    }
                    Err(e) => {
                        attempt += 1;
                        let delay = backoff.delay_for(attempt);
                        warn!(transport = transport.name(), error = %e, retry_in = ?delay, "Invalidation listener failed to subscribe");
                        crate::metrics::record_transport_error(transport.name(), "subscribe");
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => continue,
                            _ = shutdown.changed() => break,
                        }
                    }
                };

                info!(transport = transport.name(), "Invalidation listener started");
                loop {
                    tokio::select! {
                        maybe = events.recv() => match maybe {
                            Some(event) => {
                                engine.apply_remote(event).await;
                            }
                            None => {
                                warn!(transport = transport.name(), "Invalidation stream ended, resubscribing");
                                break;
                            }
                        },
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                info!("Invalidation listener stopped");
                                return;
                            }
                        }
                    }
                }
            }
        }))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Stats
    // ═══════════════════════════════════════════════════════════════════════

    #[must_use]
    pub fn stats(&self) -> InvalidationStats {
        InvalidationStats {
            rules: self.rule_stats.iter().map(|e| (e.key().clone(), e.value().clone())).collect(),
            events: self.event_stats.iter().map(|e| (e.key().clone(), e.value().clone())).collect(),
            daily: self.daily_stats.iter().map(|e| (*e.key(), e.value().clone())).collect(),
            remote_events_ignored: self.own_echoes.load(Ordering::Relaxed),
        }
    }

    #[must_use]
    pub fn rule_stats(&self, name: &str) -> Option<RuleStats> {
        self.rule_stats.get(name).map(|s| s.clone())
    }
}

fn today() -> u64 {
    now_millis() / MILLIS_PER_DAY
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invalidation::rules::default_rules;
    use crate::resilience::circuit_breaker::CircuitConfig;
    use crate::storage::memory::InMemoryStore;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn engine() -> (Arc<InvalidationEngine>, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let settings = InvalidationSettings { instance_id: "node-a".into(), ..Default::default() };
        (Arc::new(InvalidationEngine::new(store.clone(), settings)), store)
    }

    async fn put(store: &InMemoryStore, key: &str) {
        store.pipeline(&[Command::set(key, "v")]).await.unwrap();
    }

    #[tokio::test]
    async fn test_tag_invalidation_removes_members_and_set() {
        let (engine, store) = engine();
        put(&store, "course:1:summary").await;
        put(&store, "course:1:lessons").await;
        engine.tag_key("course:1:summary", &["course:1"]).await.unwrap();
        engine.tag_key("course:1:lessons", &["course:1", "catalog"]).await.unwrap();

        assert_eq!(engine.invalidate_tag("course:1").await.unwrap(), 2);
        assert!(store.get("course:1:summary").await.unwrap().is_none());
        assert!(store.smembers("tag:course:1").await.unwrap().is_empty());
        // Other tag's index survives, pointing at a now-missing key
        assert_eq!(store.smembers("tag:catalog").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_tag_invalidation_is_idempotent() {
        let (engine, _store) = engine();
        assert_eq!(engine.invalidate_tag("nothing").await.unwrap(), 0);
        assert_eq!(engine.invalidate_tag("nothing").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_pattern_and_user_invalidation() {
        let (engine, store) = engine();
        for key in ["user:7:profile", "user:7:prefs", "session:7:abc", "user:8:profile"] {
            put(&store, key).await;
        }
        assert_eq!(engine.invalidate_pattern("user:7:*").await.unwrap(), 2);
        assert_eq!(engine.invalidate_user("7").await.unwrap(), 1);
        assert!(store.get("user:8:profile").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_wildcards_in_values_are_literal() {
        let (engine, store) = engine();
        for rule in default_rules() {
            engine.add_rule(rule);
        }
        for key in ["cache:course:42:outline", "cache:course:43:outline", "user:7:profile", "session:8:abc"] {
            put(&store, key).await;
        }

        let report = engine
            .trigger("course.updated", json!({"course_id": "*"}), None, None)
            .await;
        assert_eq!(report.rules_executed, 1);
        assert_eq!(report.keys_invalidated, 0);

        assert_eq!(engine.invalidate_user("*").await.unwrap(), 0);
        assert_eq!(engine.invalidate_user("?").await.unwrap(), 0);
        let report = engine.trigger("auth.logout", Value::Null, Some("[78]".into()), None).await;
        assert_eq!(report.keys_invalidated, 0);

        for key in ["cache:course:42:outline", "cache:course:43:outline", "user:7:profile", "session:8:abc"] {
            assert!(store.get(key).await.unwrap().is_some(), "{key} was removed");
        }
    }

    #[tokio::test]
    async fn test_tag_key_reports_refused_command() {
        let (engine, store) = engine();
        put(&store, "tag:broken").await;
        let err = engine.tag_key("course:1", &["ok", "broken"]).await.unwrap_err();
        assert!(matches!(err, StoreError::Protocol(_)));
        assert_eq!(store.smembers("tag:ok").await.unwrap(), vec!["course:1".to_string()]);
    }

    #[tokio::test]
    async fn test_open_breaker_fails_rules_without_store_calls() {
        let store = Arc::new(InMemoryStore::new());
        let breaker = Arc::new(CircuitBreaker::new("invalidation", CircuitConfig::test()));
        let settings = InvalidationSettings { instance_id: "node-a".into(), ..Default::default() };
        let engine = Arc::new(InvalidationEngine::new(store.clone(), settings).with_breaker(breaker.clone()));
        engine.add_rule(InvalidationRule::new("all").on("x").pattern("cache:*"));
        put(&store, "cache:a").await;

        breaker.force_open();
        let report = engine.trigger("x", Value::Null, None, None).await;
        assert_eq!(report.rules_failed, 1);
        assert!(store.get("cache:a").await.unwrap().is_some());
        assert!(matches!(engine.invalidate_tag("t").await, Err(StoreError::Unavailable(_))));
        assert_eq!(breaker.rejections(), 2);

        breaker.force_close();
        let report = engine.trigger("x", Value::Null, None, None).await;
        assert_eq!(report.keys_invalidated, 1);
        assert_eq!(breaker.successes(), 2);
    }

    #[tokio::test]
    async fn test_daily_stats_count_events_and_entries() {
        let (engine, store) = engine();
        engine.add_rule(InvalidationRule::new("all").on("x").pattern("cache:*"));
        put(&store, "cache:a").await;
        put(&store, "cache:b").await;

        engine.trigger("x", Value::Null, None, None).await;
        engine.trigger("unmatched", Value::Null, None, None).await;
        let peer = InvalidationEvent::new("x", Value::Null, None, None, "node-b");
        engine.apply_remote(peer).await;

        let stats = engine.stats();
        let day = &stats.daily[&today()];
        assert_eq!(day.events, 3);
        assert_eq!(day.entries_invalidated, 2);
        assert_eq!(stats.daily.len(), 1);
    }

    #[tokio::test]
    async fn test_trigger_runs_matching_rules_with_payload_fields() {
        let (engine, store) = engine();
        for rule in default_rules() {
            engine.add_rule(rule);
        }
        put(&store, "cache:course:42:outline").await;
        put(&store, "cache:course:43:outline").await;

        let report = engine
            .trigger("course.updated", json!({"course_id": 42}), None, Some("cms".into()))
            .await;

        assert_eq!(report.rules_matched, 1);
        assert_eq!(report.rules_executed, 1);
        assert_eq!(report.keys_invalidated, 1);
        assert!(!report.propagated);
        assert!(store.get("cache:course:43:outline").await.unwrap().is_some());

        let stats = engine.rule_stats("course_content").unwrap();
        assert_eq!(stats.invocations, 1);
        assert_eq!(stats.entries_invalidated, 1);
        assert_eq!(engine.stats().events["course.updated"].triggered, 1);
    }

    #[tokio::test]
    async fn test_predicate_skips_rule() {
        let (engine, store) = engine();
        engine.add_rule(
            InvalidationRule::new("published_only")
                .on("course.updated")
                .pattern("cache:*")
                .when(|p| p["published"].as_bool() == Some(true)),
        );
        put(&store, "cache:x").await;

        let report = engine.trigger("course.updated", json!({"published": false}), None, None).await;
        assert_eq!(report.rules_skipped, 1);
        assert_eq!(report.keys_invalidated, 0);
        assert!(store.get("cache:x").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delayed_rule_runs_later() {
        let (engine, store) = engine();
        engine.add_rule(
            InvalidationRule::new("later")
                .on("analytics.updated")
                .pattern("cache:analytics:*")
                .delay(Duration::from_millis(30)),
        );
        put(&store, "cache:analytics:daily").await;

        let report = engine.trigger("analytics.updated", Value::Null, None, None).await;
        assert_eq!(report.rules_delayed, 1);
        assert!(store.get("cache:analytics:daily").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(store.get("cache:analytics:daily").await.unwrap().is_none());
        assert_eq!(engine.rule_stats("later").unwrap().invocations, 1);
    }

    #[tokio::test]
    async fn test_subscriber_panic_is_contained() {
        let (engine, _store) = engine();
        let calls = Arc::new(AtomicUsize::new(0));
        engine.subscribe("user.updated", |_| panic!("listener bug"));
        let c = calls.clone();
        engine.subscribe("*", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        engine.trigger("user.updated", Value::Null, Some("1".into()), None).await;
        engine.trigger("course.updated", Value::Null, None, None).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_own_echo_is_ignored() {
        let (engine, store) = engine();
        engine.add_rule(InvalidationRule::new("all").on("x").pattern("*"));
        put(&store, "k").await;

        let echo = InvalidationEvent::new("x", Value::Null, None, None, "node-a");
        assert!(engine.apply_remote(echo).await.is_none());
        assert!(store.get("k").await.unwrap().is_some());

        let peer = InvalidationEvent::new("x", Value::Null, None, None, "node-b");
        let report = engine.apply_remote(peer).await.unwrap();
        assert_eq!(report.keys_invalidated, 1);
        assert_eq!(engine.stats().remote_events_ignored, 1);
        assert_eq!(engine.stats().events["x"].received, 1);
    }

    #[tokio::test]
    async fn test_remove_rule() {
        let (engine, _store) = engine();
        engine.add_rule(InvalidationRule::new("r").on("x"));
        assert_eq!(engine.rule_names(), vec!["r".to_string()]);
        assert!(engine.remove_rule("r"));
        assert!(!engine.remove_rule("r"));
        let report = engine.trigger("x", Value::Null, None, None).await;
        assert_eq!(report.rules_matched, 0);
    }
}
