// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Invalidation rules.
//!
//! A rule names the event types it reacts to and what to delete when one
//! arrives. Tag and pattern targets may contain `{field}` placeholders,
//! filled from the event payload (`{user}` is the event's user id). A
//! target whose placeholders cannot all be filled is skipped, never
//! widened. Values filled into patterns are glob-escaped, so a payload
//! value of `*` matches a literal `*` only.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use resilient_cache::invalidation::InvalidationRule;
//!
//! let rule = InvalidationRule::new("course_content")
//!     .on("course.updated")
//!     .on("lesson.updated")
//!     .tag("course:{course_id}")
//!     .pattern("cache:course:{course_id}:*")
//!     .delay(Duration::from_millis(500))
//!     .when(|payload| payload.get("published").and_then(|v| v.as_bool()).unwrap_or(true));
//!
//! assert!(rule.triggers.contains("lesson.updated"));
//! assert_eq!(rule.targets.tags, vec!["course:{course_id}".to_string()]);
//! ```

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use super::event::InvalidationEvent;
use crate::storage::glob::escape_glob;

pub type Predicate = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

#[derive(Clone, Default)]
pub struct InvalidationTargets {
    pub tags: Vec<String>,
    pub patterns: Vec<String>,
    /// Also run the per-user key family for the event's user
    pub user_scoped: bool,
    pub delay: Option<Duration>,
    pub predicate: Option<Predicate>,
}

impl fmt::Debug for InvalidationTargets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvalidationTargets")
            .field("tags", &self.tags)
            .field("patterns", &self.patterns)
            .field("user_scoped", &self.user_scoped)
            .field("delay", &self.delay)
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct InvalidationRule {
    pub name: String,
    pub triggers: HashSet<String>,
    pub targets: InvalidationTargets,
}

impl InvalidationRule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            triggers: HashSet::new(),
            targets: InvalidationTargets::default(),
        }
    }

    #[must_use]
    pub fn on(mut self, event_type: impl Into<String>) -> Self {
        self.triggers.insert(event_type.into());
        self
    }

    #[must_use]
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.targets.tags.push(tag.into());
        self
    }

    #[must_use]
    pub fn pattern(mut self, pattern: impl Into<String>) -> Self {
        self.targets.patterns.push(pattern.into());
        self
    }

    #[must_use]
    pub fn user_scoped(mut self) -> Self {
        self.targets.user_scoped = true;
        self
    }

    #[must_use]
    pub fn delay(mut self, delay: Duration) -> Self {
        self.targets.delay = Some(delay);
        self
    }

    /// Only run when `predicate(payload)` holds.
    #[must_use]
    pub fn when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.targets.predicate = Some(Arc::new(predicate));
        self
    }

    #[must_use]
    pub fn matches(&self, event_type: &str) -> bool {
        self.triggers.contains(event_type)
    }

    /// Predicate check; rules without one always apply.
    #[must_use]
    pub fn applies_to(&self, payload: &Value) -> bool {
        self.targets.predicate.as_ref().map_or(true, |p| p(payload))
    }
}

/// Fill `{field}` placeholders from the event. None if any is unresolved.
#[must_use]
pub fn render(template: &str, event: &InvalidationEvent) -> Option<String> {
    fill(template, event, |value| value)
}

/// [`render`] for SCAN patterns: filled values are glob-escaped. The
/// template's own wildcards are kept.
#[must_use]
pub fn render_pattern(template: &str, event: &InvalidationEvent) -> Option<String> {
    fill(template, event, |value| escape_glob(&value))
}

fn fill(template: &str, event: &InvalidationEvent, encode: impl Fn(String) -> String) -> Option<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let close = after.find('}')?;
        let value = event.field(&after[..close])?;
        out.push_str(&encode(value));
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    Some(out)
}

/// Rules a typical deployment starts with.
#[must_use]
pub fn default_rules() -> Vec<InvalidationRule> {
    vec![
        InvalidationRule::new("user_profile")
            .on("user.updated")
            .on("user.deleted")
            .tag("user:{user}")
            .user_scoped(),
        InvalidationRule::new("session_revocation")
            .on("auth.logout")
            .on("auth.password_changed")
            .pattern("session:{user}:*")
            .pattern("auth:{user}:*"),
        InvalidationRule::new("course_content")
            .on("course.updated")
            .on("course.deleted")
            .on("lesson.updated")
            .tag("course:{course_id}")
            .pattern("cache:course:{course_id}:*"),
        InvalidationRule::new("enrollment")
            .on("payment.completed")
            .on("enrollment.changed")
            .tag("user:{user}:enrollments")
            .tag("course:{course_id}:students"),
        InvalidationRule::new("analytics_rollup")
            .on("analytics.updated")
            .pattern("cache:analytics:*")
            .delay(Duration::from_secs(5)),
    ]
}
