// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Queued commands and the handle their callers await.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use crate::storage::command::{Command, Reply};

/// Why a batched operation did not get a store reply.
///
/// Cloned to every caller when a whole batch fails.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BatchError {
    /// The pipeline reached the store and failed
    #[error("batch execution failed: {0}")]
    Execution(String),

    /// The store refused this one command; the rest of its batch succeeded
    #[error("command refused by store: {0}")]
    Command(String),

    /// The breaker refused the batch without calling the store
    #[error("batch rejected: circuit '{circuit}' is open")]
    Rejected { circuit: String },

    #[error("batch timed out after {0:?}")]
    Timeout(Duration),

    #[error("batch scheduler is shutting down")]
    ShuttingDown,

    #[error("store returned {replies} replies for {commands} commands")]
    ResultMismatch { commands: usize, replies: usize },
}

impl BatchError {
    /// Short label for metrics.
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Execution(_) => "execution",
            Self::Command(_) => "command",
            Self::Rejected { .. } => "circuit_open",
            Self::Timeout(_) => "timeout",
            Self::ShuttingDown => "shutdown",
            Self::ResultMismatch { .. } => "result_mismatch",
        }
    }
}

pub(crate) type ReplySender = oneshot::Sender<Result<Reply, BatchError>>;

/// One queued command plus the continuation that answers its caller.
#[derive(Debug)]
pub struct BatchedOperation {
    pub id: u64,
    pub command: Command,
    pub is_priority: bool,
    pub enqueued_at: Instant,
    reply: ReplySender,
}

impl BatchedOperation {
    pub(crate) fn new(id: u64, command: Command, is_priority: bool) -> (Self, PendingReply) {
        let (tx, rx) = oneshot::channel();
        let op = Self {
            id,
            command,
            is_priority,
            enqueued_at: Instant::now(),
            reply: tx,
        };
        (op, PendingReply { rx })
    }

    /// Fire the continuation. The operation is consumed either way.
    pub(crate) fn complete(self, result: Result<Reply, BatchError>) {
        // The caller may have stopped waiting; that is not an error here.
        let _ = self.reply.send(result);
    }
}

/// Resolves once the batch carrying the operation has been flushed.
#[derive(Debug)]
#[must_use = "the operation is queued either way, but its reply is lost unless awaited"]
pub struct PendingReply {
    rx: oneshot::Receiver<Result<Reply, BatchError>>,
}

impl PendingReply {
    /// Already-failed handle for operations refused at enqueue time.
    pub(crate) fn failed(err: BatchError) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Err(err));
        Self { rx }
    }
}

impl Future for PendingReply {
    type Output = Result<Reply, BatchError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(BatchError::ShuttingDown)))
    }
}

/// True if `key` belongs in the priority lane.
#[must_use]
pub fn is_priority_key(key: &str, prefixes: &[String]) -> bool {
    prefixes.iter().any(|p| key.starts_with(p.as_str()))
}
