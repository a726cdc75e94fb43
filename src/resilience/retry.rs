// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry with exponential backoff for connection setup.
//!
//! Only idempotent operations go through here: connecting to the store and
//! re-establishing invalidation subscriptions. Batched commands are never
//! retried; the circuit breaker decides what happens to them.
//!
//! # Example
//!
//! ```
//! use resilient_cache::RetryConfig;
//!
//! let startup = RetryConfig::startup();
//! assert_eq!(startup.max_retries, Some(5));
//!
//! // Subscriptions keep trying for as long as the layer runs
//! let resubscribe = RetryConfig::resubscribe();
//! assert_eq!(resubscribe.max_retries, None);
//! ```

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    /// `None` retries forever.
    pub max_retries: Option<usize>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::startup()
    }
}

impl RetryConfig {
    /// Five attempts, ~3s worst case. A misconfigured store URL should
    /// surface at startup, not hang it.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_retries: Some(5),
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Unbounded retry capped at 30s between attempts, for pub/sub
    /// subscriptions that must come back after a store outage.
    #[must_use]
    pub fn resubscribe() -> Self {
        Self {
            max_retries: None,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            factor: 2.0,
        }
    }

    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
        }
    }

    /// Delay before attempt `attempt + 1` (attempt is 1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        self.initial_delay
            .mul_f64(self.factor.powi(exp))
            .min(self.max_delay)
    }
}

pub async fn retry<F, Fut, T, E>(
    operation_name: &str,
    config: &RetryConfig,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempts = 0;

    loop {
        match operation().await {
            Ok(val) => {
                if attempts > 0 {
                    info!(operation = operation_name, retries = attempts, "Operation succeeded after retry");
                }
                return Ok(val);
            }
            Err(err) => {
                attempts += 1;

                if let Some(max) = config.max_retries {
                    if attempts >= max {
                        return Err(err);
                    }
                }

                let delay = config.delay_for(attempts);
                warn!(
                    operation = operation_name,
                    attempt = attempts,
                    max = ?config.max_retries,
                    error = %err,
                    next_retry = ?delay,
                    "Operation failed, retrying"
                );
                sleep(delay).await;
            }
        }
    }
}
