// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Tag, pattern and user-scoped invalidation, propagated across instances.

pub mod engine;
pub mod event;
pub mod rules;
pub mod transport;

pub use engine::{InvalidationEngine, InvalidationSettings, InvalidationStats, RuleError, TriggerReport};
pub use event::InvalidationEvent;
pub use rules::{default_rules, InvalidationRule, InvalidationTargets};
pub use transport::{EventTransport, PollTransport, PushTransport, TransportError};
