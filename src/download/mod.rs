//! Resumable Download Engine
//!
//! [`Downloader::get_download`] fetches one resource into a local file. The
//! scheme of the source selects the transport:
//!
//! | Source | Transport |
//! | --- | --- |
//! | `http://`, `https://` | `reqwest` with a cookie jar, manual redirects, Basic/Digest auth |
//! | `ftp://` | passive FTP with `SIZE`/`MDTM` (`LIST` fallback) and `REST` resume |
//! | `s3://` | an S3 command-line helper (`s3cmd info` + `s3cmd get`) |
//! | `file://`, local or UNC path | conditional copy |
//!
//! Before any byte moves, the remote's modification time and size are
//! checked against the local copy (see [`decide`]). Bytes land in a temp
//! file next to the destination which is renamed over it once the expected
//! size was reached; the file then carries the remote modification time.

mod decision;
mod digest;
mod ftp;
mod http;
mod local;
mod partial;
mod s3;

pub use decision::{Decision, Freshness, LocalInfo, RemoteInfo, decide, stale_since};
pub use digest::DigestChallenge;
pub use ftp::parse_list_line;
pub use partial::{same_contents, sweep, temp_path};
pub use s3::{CliS3Client, S3Client, parse_s3_info};

use crate::config::DownloadConfig;
use crate::error::{DownloadError, Error, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::cookie::Jar;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;
use url::Url;

/// Progress callback invoked after every chunk written
pub type ProgressFn = Arc<dyn Fn(DownloadProgress) + Send + Sync>;

/// Bytes written so far for one transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadProgress {
    /// Bytes in the temp file, including a resumed prefix
    pub received: u64,
    /// Expected total, when the remote reported it
    pub total: Option<u64>,
}

/// Login for sources that require one
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// User name
    pub username: String,
    /// Password
    pub password: String,
    /// Host (or URL) the credentials belong to; None means the source's own host
    pub host: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"********")
            .field("host", &self.host)
            .finish()
    }
}

impl Credentials {
    /// Credentials for the source's own host
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            host: None,
        }
    }

    /// Restrict the credentials to `host` (a host name or a URL)
    pub fn for_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Host name the credentials may be sent to
    pub fn auth_host(&self) -> Option<String> {
        let host = self.host.as_deref()?.trim();
        if host.contains("://") {
            Url::parse(host).ok()?.host_str().map(str::to_ascii_lowercase)
        } else {
            Some(host.trim_end_matches('/').to_ascii_lowercase())
        }
    }
}

/// One call of [`Downloader::get_download`]
#[derive(Clone)]
pub struct DownloadRequest {
    /// Source URL or local path
    pub url: String,
    /// Destination file
    pub dest: PathBuf,
    /// Check against the local copy before transferring
    pub freshness: Freshness,
    /// Connect/inactivity timeout (None: the downloader's default)
    pub timeout: Option<Duration>,
    /// Read buffer size in KiB (None: the downloader's default)
    pub read_size_kb: Option<usize>,
    /// Login for the source or its authentication host
    pub credentials: Option<Credentials>,
    /// Extra HTTP request headers
    pub headers: Vec<(String, String)>,
    /// HTTP POST body; GET when None
    pub data: Option<Vec<u8>>,
    /// Abort the transfer when cancelled
    pub cancel: Option<CancellationToken>,
    /// Called after each chunk
    pub progress: Option<ProgressFn>,
}

impl DownloadRequest {
    /// Fetch `url` into `dest` with timestamp checking
    pub fn new(url: impl Into<String>, dest: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            dest: dest.into(),
            freshness: Freshness::Check,
            timeout: None,
            read_size_kb: None,
            credentials: None,
            headers: Vec::new(),
            data: None,
            cancel: None,
            progress: None,
        }
    }

    /// Set the freshness policy
    pub fn freshness(mut self, freshness: Freshness) -> Self {
        self.freshness = freshness;
        self
    }

    /// Set the login
    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Add a request header
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// POST `data` instead of GET
    pub fn data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.data = Some(data.into());
        self
    }

    /// Set the timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the read buffer size
    pub fn read_size_kb(mut self, kb: usize) -> Self {
        self.read_size_kb = Some(kb);
        self
    }

    /// Abort when `token` is cancelled
    pub fn cancel_on(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Report progress to `callback`
    pub fn on_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(DownloadProgress) + Send + Sync + 'static,
    {
        self.progress = Some(Arc::new(callback));
        self
    }
}

/// What a download call did
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// The local file was created or replaced
    Updated {
        /// Size of the new file
        bytes: u64,
    },
    /// The local copy was already current
    Fresh,
    /// The remote is older than the requested maximum age
    Stale {
        /// Remote modification time
        modified: DateTime<Utc>,
    },
}

impl DownloadOutcome {
    /// True when the local file changed
    pub fn is_updated(&self) -> bool {
        matches!(self, DownloadOutcome::Updated { .. })
    }

    /// `true` when updated, `false` when current; stale data becomes an error
    pub fn require_fresh(self, url: &str) -> Result<bool> {
        match self {
            DownloadOutcome::Updated { .. } => Ok(true),
            DownloadOutcome::Fresh => Ok(false),
            DownloadOutcome::Stale { modified } => Err(DownloadError::DataStale {
                url: url.to_string(),
                modified,
            }
            .into()),
        }
    }
}

/// Where a request reads from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// HTTP or HTTPS URL
    Http(Url),
    /// FTP URL
    Ftp(Url),
    /// `s3://bucket/key`
    S3(String),
    /// Local or UNC path
    Local(PathBuf),
}

impl Source {
    /// Classify `url` by its scheme
    pub fn parse(url: &str) -> Result<Self> {
        let trimmed = url.trim();
        if trimmed.starts_with(r"\\") {
            return Ok(Source::Local(PathBuf::from(trimmed)));
        }
        match Url::parse(trimmed) {
            Ok(parsed) => match parsed.scheme() {
                "http" | "https" => Ok(Source::Http(parsed)),
                "ftp" => Ok(Source::Ftp(parsed)),
                "s3" => Ok(Source::S3(trimmed.to_string())),
                "file" => parsed
                    .to_file_path()
                    .map(Source::Local)
                    .map_err(|()| DownloadError::UnsupportedSource(trimmed.to_string()).into()),
                // drive letter of a Windows path
                scheme if scheme.len() == 1 => Ok(Source::Local(PathBuf::from(trimmed))),
                _ => Err(DownloadError::UnsupportedSource(trimmed.to_string()).into()),
            },
            Err(url::ParseError::RelativeUrlWithoutBase) => Ok(Source::Local(PathBuf::from(trimmed))),
            Err(_) => Err(DownloadError::UnsupportedSource(trimmed.to_string()).into()),
        }
    }
}

/// Result of the transport stage
pub(crate) enum Fetched {
    /// No transfer was needed
    Current,
    /// The remote broke the maximum age
    Stale(DateTime<Utc>),
    /// Bytes are in `temp`
    Transferred {
        temp: PathBuf,
        remote: RemoteInfo,
        /// Keep the old copy if both are identical
        compare: bool,
        /// Keep `temp` on failure so a later call can resume it
        resumable: bool,
    },
}

#[derive(Debug, Clone)]
struct Validator {
    etag: reqwest::header::HeaderValue,
    cache_control: Option<reqwest::header::HeaderValue>,
}

/// Download engine holding the HTTP client, its cookie jar and the ETag cache
pub struct Downloader {
    client: reqwest::Client,
    config: DownloadConfig,
    validators: Mutex<HashMap<String, Validator>>,
    s3: Option<Arc<dyn S3Client>>,
}

impl Downloader {
    /// Create a downloader
    ///
    /// # Errors
    /// Returns error if the root certificate cannot be read or the HTTP
    /// client cannot be built.
    pub fn new(config: DownloadConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .cookie_provider(Arc::new(Jar::default()))
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .danger_accept_invalid_certs(config.accept_invalid_certs);
        if let Some(path) = &config.root_certificate {
            let pem = std::fs::read(path)?;
            let certificate = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| Error::config("root_certificate", e.to_string()))?;
            builder = builder.add_root_certificate(certificate);
        }
        let client = builder
            .build()
            .map_err(|e| Error::Other(format!("Failed to create HTTP client: {}", e)))?;

        let s3 = CliS3Client::from_path()
            .map(|c| Arc::new(c.with_timeout(config.timeout)) as Arc<dyn S3Client>);
        Ok(Self {
            client,
            config,
            validators: Mutex::new(HashMap::new()),
            s3,
        })
    }

    /// Replace the S3 helper
    pub fn with_s3_client(mut self, client: Arc<dyn S3Client>) -> Self {
        self.s3 = Some(client);
        self
    }

    /// Settings in use
    pub fn config(&self) -> &DownloadConfig {
        &self.config
    }

    /// Fetch `request.url` into `request.dest`
    ///
    /// # Returns
    /// [`DownloadOutcome::Updated`] when the file was written,
    /// [`DownloadOutcome::Fresh`] when the local copy was current and
    /// [`DownloadOutcome::Stale`] when the remote broke the maximum age.
    ///
    /// # Errors
    /// Returns error on transport failures, non-success HTTP status, a
    /// short transfer ([`DownloadError::TransferSizeMismatch`]) or
    /// cancellation ([`DownloadError::Interrupted`]).
    pub async fn get_download(&self, request: &DownloadRequest) -> Result<DownloadOutcome> {
        let source = Source::parse(&request.url)?;
        if let Some(parent) = request.dest.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        tracing::info!(url = %request.url, dest = %request.dest.display(), "download requested");

        let fetched = match &source {
            Source::Http(url) => http::fetch(self, url, request).await?,
            Source::Ftp(url) => ftp::fetch(url, request, self.timeout(request), self.read_size(request)).await?,
            Source::S3(uri) => {
                let client = self
                    .s3
                    .as_ref()
                    .ok_or_else(|| Error::ExternalTool("s3cmd not found in PATH".to_string()))?;
                s3::fetch(client.as_ref(), uri, request).await?
            }
            Source::Local(path) => local::fetch(path, request).await?,
        };

        let url = request.url.clone();
        let dest = request.dest.clone();
        let outcome = tokio::task::spawn_blocking(move || complete(&url, &dest, fetched))
            .await
            .map_err(|e| Error::Other(format!("download completion task failed: {e}")))??;
        match outcome {
            DownloadOutcome::Updated { bytes } => {
                tracing::info!(url = %request.url, bytes, "download updated local file")
            }
            DownloadOutcome::Fresh => tracing::info!(url = %request.url, "local file is current"),
            DownloadOutcome::Stale { modified } => {
                tracing::warn!(url = %request.url, %modified, "remote data is stale")
            }
        }
        Ok(outcome)
    }

    fn timeout(&self, request: &DownloadRequest) -> Duration {
        request.timeout.unwrap_or(self.config.timeout)
    }

    fn read_size(&self, request: &DownloadRequest) -> usize {
        request.read_size_kb.unwrap_or(self.config.read_size_kb).max(1) * 1024
    }

    fn validator(&self, url: &str) -> Option<Validator> {
        lock(&self.validators).get(url).cloned()
    }

    fn remember_validator(&self, url: &str, headers: &reqwest::header::HeaderMap) {
        use reqwest::header::{CACHE_CONTROL, ETAG};
        let Some(etag) = headers.get(ETAG) else {
            return;
        };
        let validator = Validator {
            etag: etag.clone(),
            cache_control: headers.get(CACHE_CONTROL).cloned(),
        };
        lock(&self.validators).insert(url.to_string(), validator);
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

/// Size check, optional byte compare, rename, time stamp and sweep
pub(crate) fn complete(url: &str, dest: &Path, fetched: Fetched) -> Result<DownloadOutcome> {
    let (temp, remote, compare, resumable) = match fetched {
        Fetched::Current => return Ok(DownloadOutcome::Fresh),
        Fetched::Stale(modified) => return Ok(DownloadOutcome::Stale { modified }),
        Fetched::Transferred {
            temp,
            remote,
            compare,
            resumable,
        } => (temp, remote, compare, resumable),
    };

    let received = partial::existing_len(&temp);
    if let Some(expected) = remote.size
        && received < expected
    {
        if !resumable {
            discard(&temp);
        }
        return Err(DownloadError::TransferSizeMismatch {
            url: url.to_string(),
            received,
            expected,
        }
        .into());
    }

    if compare && dest.is_file() && partial::same_contents(&temp, dest)? {
        tracing::debug!(url, "downloaded copy is identical, keeping the local file");
        discard(&temp);
        partial::sweep(dest);
        return Ok(DownloadOutcome::Fresh);
    }

    partial::finalize(&temp, dest, remote.modified.map(SystemTime::from))?;
    let swept = partial::sweep(dest);
    if !swept.is_empty() {
        tracing::debug!(url, count = swept.len(), "removed leftover temp files");
    }
    Ok(DownloadOutcome::Updated { bytes: received })
}

/// Remove a temp file, logging failures
pub(crate) fn discard(temp: &Path) {
    match std::fs::remove_file(temp) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %temp.display(), error = %e, "cannot remove temp file"),
    }
}

/// Parse an HTTP date (RFC 1123, RFC 850 or asctime)
pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc2822(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    ["%A, %d-%b-%y %H:%M:%S GMT", "%a %b %e %H:%M:%S %Y"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .map(|naive| naive.and_utc())
}

/// Format a time as an HTTP date
pub fn format_http_date(time: DateTime<Utc>) -> String {
    time.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}
