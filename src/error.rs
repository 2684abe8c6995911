//! Error types for alf-run
//!
//! This module provides the error taxonomy shared by every component:
//! - Run Logger failures (log paths, crash lock)
//! - Worker Pool failures (initialization, abnormal worker exit)
//! - Download failures (stale data, size mismatch, protocol errors)
//! - Notification failures (all mail servers exhausted)
//!
//! Failures that are part of a normal decision (a remote file that has not
//! changed, for instance) are not errors; see [`crate::download::DownloadOutcome`].

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for alf-run operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for alf-run
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "ALFmail_Port")
        key: Option<String>,
    },

    /// I/O error (log folder creation, log writes, file transfers)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Log path could not be created or is not writable
    #[error("log path {path} is not usable: {reason}")]
    LogPath {
        /// The folder or file that failed
        path: PathBuf,
        /// Why it failed
        reason: String,
    },

    /// Crash lock acquire/release failure
    #[error("crash lock error: {0}")]
    CrashLock(#[from] CrashLockError),

    /// A command or polling loop made no progress before its timeout
    #[error("timed out after {seconds}s: {what}")]
    Timeout {
        /// What was being waited on
        what: String,
        /// The timeout that expired, in seconds
        seconds: u64,
    },

    /// A worker's initialization function failed
    #[error("worker {worker} is not initialized: {reason}")]
    Initialization {
        /// Worker identifier
        worker: usize,
        /// The initialization failure
        reason: String,
    },

    /// A worker exited abnormally or a failure crossed the pool boundary
    #[error("multiprocessing error in pool '{pool}': {reason}")]
    Multiprocessing {
        /// Pool description
        pool: String,
        /// What happened
        reason: String,
    },

    /// Download-related error
    #[error("download error: {0}")]
    Download(#[from] DownloadError),

    /// Notification e-mail error
    #[error("mail error: {0}")]
    Mail(#[from] MailError),

    /// Network error
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// FTP protocol error
    #[error("FTP error: {0}")]
    Ftp(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// External tool execution failed (s3cmd, child commands)
    #[error("external tool error: {0}")]
    ExternalTool(String),

    /// Explicit exit requested by the driving code
    #[error("exit requested with code {}", .0.code)]
    Exit(ExitRequest),

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// An explicit request to end the run with a given exit code.
///
/// Returning `Err(Error::Exit(..))` from a run body is the counterpart of
/// calling `sys.exit(code)` in a batch script: a zero code ends the run
/// cleanly, any other code marks the run as failed and forced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitRequest {
    /// Process exit code
    pub code: i32,
    /// Optional message recorded as the run's error value
    pub message: Option<String>,
}

impl Error {
    /// Build an explicit exit request
    pub fn exit(code: i32, message: Option<String>) -> Self {
        Error::Exit(ExitRequest { code, message })
    }

    /// Build a configuration error for a specific key
    pub fn config(key: &str, message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
            key: Some(key.to_string()),
        }
    }
}

/// Crash lock errors
#[derive(Debug, Error)]
pub enum CrashLockError {
    /// Another process holds the lock for the same nickname and home folder
    #[error("another run of '{nickname}' is active (lock {path})")]
    AlreadyRunning {
        /// Job nickname
        nickname: String,
        /// Lock file path
        path: PathBuf,
    },

    /// The lock could not be released after the retry budget
    #[error("failed to release lock {path} after {attempts} attempts: {reason}")]
    ReleaseFailed {
        /// Lock file path
        path: PathBuf,
        /// Attempts made
        attempts: u32,
        /// Last failure
        reason: String,
    },
}

/// Download-related errors
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Remote resource is older than the required freshness bound
    #[error("remote data for {url} is stale (last modified {modified})")]
    DataStale {
        /// Source URL
        url: String,
        /// Remote modification time
        modified: chrono::DateTime<chrono::Utc>,
    },

    /// Transfer ended before reaching the expected size
    #[error("transfer of {url} stopped at {received} of {expected} bytes")]
    TransferSizeMismatch {
        /// Source URL
        url: String,
        /// Bytes written to the local file
        received: u64,
        /// Size announced by the server
        expected: u64,
    },

    /// Server answered with a non-success status
    #[error("HTTP {status} for {url}")]
    HttpStatus {
        /// Source URL
        url: String,
        /// Status code
        status: u16,
    },

    /// Redirect chain longer than the configured limit
    #[error("too many redirects ({limit}) starting at {url}")]
    TooManyRedirects {
        /// Source URL
        url: String,
        /// Redirects followed
        limit: usize,
    },

    /// URL could not be parsed or uses an unknown scheme
    #[error("unsupported source '{0}'")]
    UnsupportedSource(String),

    /// Transfer was interrupted (cancellation, Ctrl+C)
    #[error("transfer of {url} interrupted after {received} bytes")]
    Interrupted {
        /// Source URL
        url: String,
        /// Bytes written before the interruption
        received: u64,
    },
}

/// Notification e-mail errors
#[derive(Debug, Error)]
pub enum MailError {
    /// No server configured and MX discovery found nothing
    #[error("no mail server available for {0}")]
    NoServer(String),

    /// Message could not be built (bad address, attachment)
    #[error("cannot build message: {0}")]
    Compose(String),

    /// Every candidate server and attempt failed
    #[error("sending failed after {attempts} attempts on {servers:?}: {last_error}")]
    Exhausted {
        /// Servers that were tried
        servers: Vec<String>,
        /// Total attempts made
        attempts: u32,
        /// The final failure
        last_error: String,
    },

    /// Mail sending is disabled by configuration
    #[error("mail is disabled")]
    Disabled,
}
