//! Retry logic with exponential backoff
//!
//! Two retry layers exist in the pipeline:
//!
//! - **Per-request** retries inside an executor, driven by [`download_with_retry`]
//!   with exponential backoff and optional jitter.
//! - **Scheduler-level** retries, where a transiently failed item is re-enqueued
//!   at most [`DEFAULT_MAX_RETRIES`] times with its priority demoted by
//!   [`demoted_priority`].
//!
//! # Example
//!
//! ```no_run
//! use chapter_dl::retry::{IsRetryable, download_with_retry};
//! use chapter_dl::config::RetryConfig;
//!
//! #[derive(Debug)]
//! enum MyError {
//!     Transient,
//!     Permanent,
//! }
//!
//! impl std::fmt::Display for MyError {
//!     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
//!         write!(f, "{:?}", self)
//!     }
//! }
//!
//! impl IsRetryable for MyError {
//!     fn is_retryable(&self) -> bool {
//!         matches!(self, MyError::Transient)
//!     }
//! }
//!
//! # async fn example() -> Result<(), MyError> {
//! let config = RetryConfig::default();
//! download_with_retry(&config, || async { Ok::<_, MyError>(()) }).await?;
//! # Ok(())
//! # }
//! ```

use crate::config::RetryConfig;
use crate::error::Error;
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Number of automatic scheduler-level retries before a transient failure becomes terminal
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Trait for errors that can be classified as retryable or not
///
/// Transient failures (network timeouts, server busy, connection reset) should return `true`.
/// Permanent failures (malformed source, missing page, disk errors) should return `false`.
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            Error::Network(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.is_request()
                    || e.status().is_some_and(|s| is_transient_status(s.as_u16()))
            }
            Error::HttpStatus { status, .. } => is_transient_status(*status),
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::UnexpectedEof
            ),
            // Input, storage, and integrity problems do not heal by waiting
            Error::Config { .. }
            | Error::Storage(_)
            | Error::Sqlx(_)
            | Error::Download(_)
            | Error::Integrity(_)
            | Error::InvalidSource(_)
            | Error::Url(_)
            | Error::Serialization(_)
            | Error::Image(_)
            | Error::Cancelled
            | Error::ShuttingDown
            | Error::Other(_) => false,
        }
    }
}

/// HTTP statuses worth retrying: request timeout, rate limiting, and server-side errors
fn is_transient_status(status: u16) -> bool {
    status == 408 || status == 429 || (500..=599).contains(&status)
}

/// Priority given to an automatically retried item
///
/// Retries sink one level (never below zero) so a persistently failing item
/// falls behind fresh work of the same original priority.
pub fn demoted_priority(priority: i32) -> i32 {
    (priority - 1).max(0)
}

/// Waits between attempts of one request
///
/// Starts at `initial_delay`, grows by `backoff_multiplier` up to `max_delay`,
/// and yields `max_attempts` delays in total. With `jitter` each delay is
/// stretched by a random factor in `[1, 2)`.
struct Backoff<'a> {
    config: &'a RetryConfig,
    base: Duration,
    remaining: u32,
}

impl<'a> Backoff<'a> {
    fn new(config: &'a RetryConfig) -> Self {
        Self {
            config,
            base: config.initial_delay,
            remaining: config.max_attempts,
        }
    }
}

impl Iterator for Backoff<'_> {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        self.remaining = self.remaining.checked_sub(1)?;
        let wait = self.base;
        self.base = scaled(wait, self.config.backoff_multiplier).min(self.config.max_delay);

        if self.config.jitter {
            Some(scaled(wait, 1.0 + rand::thread_rng().r#gen::<f64>()))
        } else {
            Some(wait)
        }
    }
}

fn scaled(delay: Duration, factor: f64) -> Duration {
    Duration::try_from_secs_f64(delay.as_secs_f64() * factor).unwrap_or(Duration::MAX)
}

/// Run `operation` until it succeeds, fails permanently, or runs out of retries
///
/// Only errors whose [`IsRetryable::is_retryable`] is true are retried; the
/// last error is returned unchanged.
pub async fn download_with_retry<F, Fut, T, E>(config: &RetryConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: IsRetryable + std::fmt::Display,
{
    let mut backoff = Backoff::new(config);
    let mut attempt: u32 = 1;

    loop {
        let err = match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::debug!(attempt, "Request succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) => e,
        };

        if !err.is_retryable() {
            tracing::debug!(error = %err, attempt, "Request failed permanently");
            return Err(err);
        }
        let Some(wait) = backoff.next() else {
            tracing::warn!(error = %err, attempts = attempt, "Giving up on request, retries exhausted");
            return Err(err);
        };

        tracing::warn!(
            error = %err,
            attempt,
            wait_ms = wait.as_millis() as u64,
            "Request failed, retrying"
        );
        tokio::time::sleep(wait).await;
        attempt += 1;
    }
}
