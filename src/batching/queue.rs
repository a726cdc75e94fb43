// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Two-lane queue backing the batch scheduler.
//!
//! Priority operations always leave the queue before regular ones. A timer
//! is armed by the first push after a flush; if a flush leaves items behind
//! it re-arms from the flush instant, so leftovers wait one more timeout
//! rather than going out immediately.

use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::debug;

use super::operation::BatchedOperation;

/// Batch flush trigger reason
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    /// Timer armed by the first enqueue expired
    Time,
    /// Queue reached max batch size
    Count,
    /// Caller asked for it
    Manual,
    /// Draining before shutdown
    Shutdown,
}

impl FlushReason {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Time => "time",
            Self::Count => "count",
            Self::Manual => "manual",
            Self::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Default)]
pub struct BatchQueue {
    priority: VecDeque<BatchedOperation>,
    regular: VecDeque<BatchedOperation>,
    armed_at: Option<Instant>,
}

impl BatchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an operation, returns flush reason if the size threshold is hit
    pub fn push(&mut self, op: BatchedOperation, max_batch_size: usize) -> Option<FlushReason> {
        if self.armed_at.is_none() {
            self.armed_at = Some(Instant::now());
        }
        if op.is_priority {
            self.priority.push_back(op);
        } else {
            self.regular.push_back(op);
        }

        if self.len() >= max_batch_size {
            Some(FlushReason::Count)
        } else {
            None
        }
    }

    /// When the timer fires, if armed.
    #[must_use]
    pub fn deadline(&self, timeout: Duration) -> Option<Instant> {
        self.armed_at.map(|at| at + timeout)
    }

    /// Take up to `max` operations, priority lane first.
    pub fn take(&mut self, max: usize) -> Vec<BatchedOperation> {
        let max = max.max(1);
        let mut batch = Vec::with_capacity(max.min(self.len()));

        let from_priority = max.min(self.priority.len());
        batch.extend(self.priority.drain(..from_priority));
        let from_regular = (max - batch.len()).min(self.regular.len());
        batch.extend(self.regular.drain(..from_regular));

        self.armed_at = if self.is_empty() { None } else { Some(Instant::now()) };
        debug!(
            taken = batch.len(),
            priority = from_priority,
            remaining = self.len(),
            "Batch taken for flush"
        );
        batch
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.priority.len() + self.regular.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.priority.is_empty() && self.regular.is_empty()
    }

    /// (priority, regular)
    #[must_use]
    pub fn depths(&self) -> (usize, usize) {
        (self.priority.len(), self.regular.len())
    }
}
