//! Unbounded retry with backoff for infrastructure calls.
//!
//! Every external call made by the dispatch engine (cursor fetch, dispatch,
//! cursor update) runs through [`retry_unbounded`]. The outcome is three-way:
//! - success: the value is returned to the caller, which continues
//! - retryable failure: the call is repeated after a backoff delay, forever
//! - logic failure (non-retryable error or panic): the attempt is abandoned
//!   and logged as fatal
//!
//! Backoff delays come from `backon`'s exponential builder with the attempt
//! limit removed.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use futures::FutureExt;
use serde::Deserialize;
use tracing::{error, warn};

/// Classifies an error as transient infrastructure failure or logic failure.
pub trait Retryable {
    /// True when repeating the call may succeed.
    fn is_retryable(&self) -> bool;
}

/// Why a retried operation was given up.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RetryAbort {
    #[error("{action} failed with a non-retryable error: {message}")]
    Fatal { action: String, message: String },

    #[error("{action} panicked: {message}")]
    Panicked { action: String, message: String },
}

/// Backoff configuration for unbounded retries.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Delay before the first retry, in milliseconds.
    pub min_delay_ms: u64,
    /// Delay cap, in milliseconds.
    pub max_delay_ms: u64,
    /// Growth factor between consecutive delays.
    pub factor: f32,
    /// Add random jitter to each delay.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: 10,
            max_delay_ms: 2_000,
            factor: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Near-immediate retries for tests.
    pub fn immediate() -> Self {
        Self {
            min_delay_ms: 1,
            max_delay_ms: 5,
            factor: 2.0,
            jitter: false,
        }
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Exponential backoff with no attempt limit.
    pub fn backoff(&self) -> ExponentialBuilder {
        let builder = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(self.min_delay_ms))
            .with_max_delay(self.max_delay())
            .with_factor(self.factor)
            .without_max_times();
        if self.jitter {
            builder.with_jitter()
        } else {
            builder
        }
    }
}

/// Run `operation` until it succeeds or fails with a logic error.
///
/// `operation` receives the number of retries so far. `describe` renders the
/// message being processed for log lines; it is only called on failure.
pub async fn retry_unbounded<T, E, F, Fut, D>(
    action: &str,
    describe: D,
    config: &RetryConfig,
    mut operation: F,
) -> Result<T, RetryAbort>
where
    E: Retryable + fmt::Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    D: Fn() -> String,
{
    let mut backoff = config.backoff().build();
    let mut retry_times: u32 = 0;

    loop {
        match AssertUnwindSafe(operation(retry_times)).catch_unwind().await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) if e.is_retryable() => {
                let delay = backoff.next().unwrap_or_else(|| config.max_delay());
                warn!(
                    action,
                    retry_times,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    context = %describe(),
                    "Action failed, retrying"
                );
                tokio::time::sleep(delay).await;
                retry_times = retry_times.saturating_add(1);
            }
            Ok(Err(e)) => {
                error!(
                    action,
                    retry_times,
                    error = %e,
                    context = %describe(),
                    "Action failed with an unrecoverable error, abandoning; operator attention required"
                );
                return Err(RetryAbort::Fatal {
                    action: action.to_string(),
                    message: e.to_string(),
                });
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(
                    action,
                    retry_times,
                    panic = %message,
                    context = %describe(),
                    "Action panicked, abandoning; operator attention required"
                );
                return Err(RetryAbort::Panicked {
                    action: action.to_string(),
                    message,
                });
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
