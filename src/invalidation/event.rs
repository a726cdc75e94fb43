// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Invalidation events as they travel between instances.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::monitoring::service::now_millis;

/// Something happened that may make cached entries stale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvalidationEvent {
    /// Unique per trigger; lets receivers drop duplicates.
    pub id: String,
    pub event_type: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Unix millis
    pub timestamp: u64,
    /// Free-form label of whoever triggered it (service, handler, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Instance that triggered the event
    pub origin: String,
}

impl InvalidationEvent {
    pub fn new(
        event_type: impl Into<String>,
        payload: Value,
        user_id: Option<String>,
        source: Option<String>,
        origin: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            payload,
            user_id,
            timestamp: now_millis(),
            source,
            origin: origin.into(),
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Look up a payload field as a string, for template placeholders.
    /// Numbers and booleans are rendered; objects, arrays and null are not.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<String> {
        if name == "user" {
            return self.user_id.clone();
        }
        match self.payload.get(name)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }
}
