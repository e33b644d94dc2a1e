// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry logic with exponential backoff, jitter and an overall deadline.
//!
//! Different presets are available for different use cases.
//!
//! # Example
//!
//! ```
//! use icingadb_sync::RetryConfig;
//! use std::time::Duration;
//!
//! // Startup: fail fast on bad connection settings
//! let startup = RetryConfig::startup();
//! assert_eq!(startup.max_retries, Some(5));
//!
//! // Database writes: 1ms → 1min backoff, give up after 5 minutes
//! let db = RetryConfig::database();
//! assert_eq!(db.deadline, Some(Duration::from_secs(300)));
//!
//! // Cache commands of the running daemon: no attempt limit, same deadline
//! let daemon = RetryConfig::daemon();
//! assert_eq!(daemon.max_retries, None);
//! ```

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::SyncError;

/// Configuration for connection/operation retry behavior.
///
/// Use the preset constructors for common patterns:
/// - [`RetryConfig::startup()`] - Fast-fail for initial connections
/// - [`RetryConfig::daemon()`] - Cache commands once running
/// - [`RetryConfig::database()`] - Bulk writes and transactions
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    pub max_retries: Option<usize>,
    /// Give up once this much time has passed since the first attempt.
    pub deadline: Option<Duration>,
    /// Randomize each delay into `[delay / 2, delay]`.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::daemon()
    }
}

impl RetryConfig {
    /// Fast-fail retry for initial startup connection.
    /// Attempts 5 times with exponential backoff, failing after ~5 seconds.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_retries: Some(5),
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
            deadline: None,
            jitter: false,
        }
    }

    /// Cache commands of the running daemon.
    /// 100ms initial delay doubling up to 10 seconds, abandoned after 5 minutes.
    #[must_use]
    pub fn daemon() -> Self {
        Self {
            max_retries: None,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            factor: 2.0,
            deadline: Some(Duration::from_secs(300)),
            jitter: true,
        }
    }

    /// Bulk DML, HA transactions and pings.
    /// 1ms initial delay doubling up to 1 minute, abandoned after 5 minutes.
    #[must_use]
    pub fn database() -> Self {
        Self {
            max_retries: None,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_secs(60),
            factor: 2.0,
            deadline: Some(Duration::from_secs(300)),
            jitter: true,
        }
    }

    /// Fast retry for tests (minimal delays)
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
            deadline: None,
            jitter: false,
        }
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        delay.mul_f64(self.factor).min(self.max_delay)
    }

    fn sleep_for(&self, delay: Duration) -> Duration {
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let half = delay / 2;
        half + half.mul_f64(rand::thread_rng().gen_range(0.0..=1.0))
    }
}

/// Retry every failure according to `config`.
pub async fn retry<F, Fut, T, E>(
    operation_name: &str,
    config: &RetryConfig,
    operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_if(operation_name, config, |_| true, operation).await
}

/// Retry only failures accepted by `retryable`; others return immediately.
pub async fn retry_if<F, Fut, T, E, P>(
    operation_name: &str,
    config: &RetryConfig,
    retryable: P,
    operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    run(operation_name, config, None, retryable, operation).await
}

/// Retry a [`SyncError`]-returning operation while its errors are transient.
/// Backoff pauses end early once `cancel` fires, returning
/// [`SyncError::Cancelled`].
pub async fn retry_sync<F, Fut, T>(
    operation_name: &str,
    config: &RetryConfig,
    cancel: &CancellationToken,
    operation: F,
) -> Result<T, SyncError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SyncError>>,
{
    match run(operation_name, config, Some(cancel), SyncError::is_retryable, operation).await {
        Err(_) if cancel.is_cancelled() => Err(SyncError::Cancelled),
        result => result,
    }
}

async fn run<F, Fut, T, E, P>(
    operation_name: &str,
    config: &RetryConfig,
    cancel: Option<&CancellationToken>,
    retryable: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let started = Instant::now();
    let mut delay = config.initial_delay;
    let mut attempts = 0;

    loop {
        match operation().await {
            Ok(val) => {
                if attempts > 0 {
                    info!(
                        operation = operation_name,
                        attempts,
                        took = ?started.elapsed(),
                        "Operation succeeded after retries"
                    );
                }
                return Ok(val);
            }
            Err(err) => {
                if !retryable(&err) {
                    return Err(err);
                }
                attempts += 1;

                if let Some(max) = config.max_retries {
                    if attempts >= max {
                        return Err(err);
                    }
                }

                let pause = config.sleep_for(delay);
                if let Some(deadline) = config.deadline {
                    if started.elapsed() + pause >= deadline {
                        warn!(operation = operation_name, attempts, "Retry deadline exceeded: {}", err);
                        return Err(err);
                    }
                }

                match config.max_retries {
                    None => warn!(
                        "Operation '{}' failed (attempt {}): {}. Retrying in {:?}...",
                        operation_name, attempts, err, pause
                    ),
                    Some(max) => warn!(
                        "Operation '{}' failed (attempt {}/{}): {}. Retrying in {:?}...",
                        operation_name, attempts, max, err, pause
                    ),
                }

                match cancel {
                    Some(cancel) => {
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => return Err(err),
                            _ = sleep(pause) => {}
                        }
                    }
                    None => sleep(pause).await,
                }
                delay = config.next_delay(delay);
            }
        }
    }
}
