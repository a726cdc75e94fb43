// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

pub mod operation;
pub mod queue;
pub mod scheduler;

pub use operation::{BatchError, BatchedOperation, PendingReply};
pub use queue::FlushReason;
pub use scheduler::{BatchConfig, BatchScheduler, BatchStats};
