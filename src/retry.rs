//! Retry logic for fallible operations
//!
//! [`retry_it`] calls an operation up to `attempts` times, pausing between
//! calls. A retry hook sees every failure and may cancel the remaining
//! attempts, in which case the failure is returned immediately without
//! sleeping.
//!
//! # Example
//!
//! ```no_run
//! use alf_run::retry::{RetryDecision, retry_it};
//! use alf_run::config::RetryConfig;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), alf_run::Error> {
//! let config = RetryConfig::fixed(3, Duration::from_secs(5));
//! let body = retry_it(
//!     &config,
//!     || async { Ok::<_, alf_run::Error>("payload".to_string()) },
//!     |_err: &alf_run::Error, _attempt| RetryDecision::Retry,
//! )
//! .await?;
//! # Ok(())
//! # }
//! ```

use crate::config::RetryConfig;
use crate::error::{DownloadError, Error};
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Trait for errors that can be classified as retryable or not
///
/// Transient failures (network timeouts, connection reset) should return `true`.
/// Permanent failures (stale data, bad configuration) should return `false`.
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            Error::Network(e) => e.is_timeout() || e.is_connect() || e.is_body(),
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
            Error::Timeout { .. } => true,
            Error::Ftp(msg) | Error::ExternalTool(msg) => {
                msg.contains("timeout")
                    || msg.contains("timed out")
                    || msg.contains("busy")
                    || msg.contains("temporar")
                    || msg.contains("421")
                    || msg.contains("425")
                    || msg.contains("426")
            }
            Error::Download(DownloadError::TransferSizeMismatch { .. }) => true,
            Error::Download(DownloadError::HttpStatus { status, .. }) => {
                matches!(status, 408 | 429 | 500 | 502 | 503 | 504)
            }
            Error::Download(_) => false,
            Error::Mail(_) => false,
            Error::Config { .. } => false,
            Error::LogPath { .. } => false,
            Error::CrashLock(_) => false,
            Error::Initialization { .. } => false,
            Error::Multiprocessing { .. } => false,
            Error::Serialization(_) => false,
            Error::Exit(_) => false,
            Error::Other(_) => false,
        }
    }
}

/// What the retry hook wants after seeing a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep and call the operation again (if attempts remain)
    Retry,
    /// Stop now and return this failure
    Cancel,
}

/// Call `operation` up to `config.attempts` times
///
/// After each failure `hook` is called with the error and the 1-based
/// attempt number. [`RetryDecision::Cancel`] returns the error at once;
/// otherwise the engine sleeps for the current pause and tries again. The
/// last error is returned when attempts are exhausted.
pub async fn retry_it<F, Fut, T, E, H>(config: &RetryConfig, mut operation: F, mut hook: H) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    H: FnMut(&E, u32) -> RetryDecision,
{
    let attempts = config.attempts.max(1);
    let mut attempt = 0;
    let mut pause = config.pause;

    loop {
        attempt += 1;
        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    tracing::info!(attempts = attempt, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) => {
                if hook(&e, attempt) == RetryDecision::Cancel {
                    tracing::warn!(error = %e, attempt, "Retry cancelled by hook");
                    return Err(e);
                }
                if attempt >= attempts {
                    tracing::error!(
                        error = %e,
                        attempts = attempt,
                        "Operation failed after all retry attempts exhausted"
                    );
                    return Err(e);
                }

                let wait = if config.jitter { add_jitter(pause) } else { pause };
                tracing::warn!(
                    error = %e,
                    attempt,
                    max_attempts = attempts,
                    delay_ms = wait.as_millis(),
                    "Operation failed, retrying"
                );
                tokio::time::sleep(wait).await;

                let next = Duration::from_secs_f64(pause.as_secs_f64() * config.backoff_multiplier);
                pause = next.min(config.max_pause.max(config.pause));
            }
        }
    }
}

/// [`retry_it`] with a hook that cancels on non-retryable errors
pub async fn retry_transient<F, Fut, T, E>(config: &RetryConfig, operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: IsRetryable + std::fmt::Display,
{
    retry_it(config, operation, |e: &E, _| {
        if e.is_retryable() {
            RetryDecision::Retry
        } else {
            RetryDecision::Cancel
        }
    })
    .await
}

/// Add random jitter to a delay to prevent thundering herd
///
/// The actual delay will be between `delay` and `2 * delay`.
fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=1.0);
    Duration::from_secs_f64(delay.as_secs_f64() * (1.0 + jitter_factor))
}
