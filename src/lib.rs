//! # alf-run
//!
//! Run harness for recurring batch jobs.
//!
//! ## What it does
//!
//! - **Run Logger** - Archive, Activity and Error logs per job nickname, a
//!   crash lock that reveals runs which never finished, persisted run
//!   counters and notification e-mail on failure, recovery or schedule
//! - **Worker Pool** - bounded async/blocking workers with per-task failure
//!   capture, progress statistics and an estimated completion time
//! - **Download Engine** - HTTP(S), FTP, S3 and local sources with
//!   timestamp checks and resumable transfers
//! - **Command Runner** and **Retry Engine** - subprocesses with an
//!   inactivity timeout, retries with a cancelling hook
//!
//! ## Quick Start
//!
//! ```no_run
//! use alf_run::download::{DownloadRequest, Downloader, Freshness};
//! use alf_run::{DownloadConfig, RunOptions, run};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> std::process::ExitCode {
//!     let mut options = RunOptions::new("ndvi_import", "/var/log/batch");
//!     options.singleton = true;
//!
//!     run(options, |logger| async move {
//!         let downloader = Downloader::new(DownloadConfig::default())?;
//!         let request = DownloadRequest::new("https://example.com/ndvi.tif", "/data/ndvi.tif")
//!             .freshness(Freshness::MaxAge(Duration::from_secs(3 * 86_400)));
//!         if downloader.get_download(&request).await?.require_fresh(&request.url)? {
//!             logger.archive("NDVI updated", true)?;
//!         }
//!         Ok(())
//!     })
//!     .await
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Subprocess runner with inactivity timeout and password masking
pub mod command;
/// Configuration types
pub mod config;
/// Resumable downloads over HTTP(S), FTP, S3 and local paths
pub mod download;
/// Error types
pub mod error;
/// Run Logger
pub mod logger;
/// Notification e-mail over SMTP
pub mod mailer;
/// Worker pools
pub mod pool;
/// Retry logic
pub mod retry;
/// Core types
pub mod types;
/// Utility functions
pub mod utils;

// Re-export commonly used types
pub use command::{CommandOutput, TimerVerdict, call_command_line};
pub use config::{DownloadConfig, MailConfig, RetryConfig, RunOptions};
pub use download::{DownloadOutcome, DownloadRequest, Downloader};
pub use error::{CrashLockError, DownloadError, Error, MailError, Result};
pub use logger::{CloseReport, RunLogger, RunReport, execute, run};
pub use mailer::{MailMessage, Mailer};
pub use pool::{TaskTicket, WaitOptions, WorkerContext, WorkerPool};
pub use retry::{IsRetryable, RetryDecision, retry_it, retry_transient};
pub use types::{ErrorValue, MailState, PoolState, RunState, TaskOutcome};
