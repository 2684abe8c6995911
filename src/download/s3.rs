//! S3 transport delegated to a command-line helper

use super::decision::{Decision, Freshness, LocalInfo, RemoteInfo, decide};
use super::{DownloadRequest, Fetched, discard, parse_http_date, partial};
use crate::command::{CommandOutput, TimerVerdict, call_command_line};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

/// Object store access used by `s3://` sources
///
/// [`CliS3Client`] drives `s3cmd`; tests substitute their own implementation.
#[async_trait]
pub trait S3Client: Send + Sync {
    /// Size and modification time of an object
    async fn info(&self, uri: &str) -> crate::Result<RemoteInfo>;

    /// Copy an object into `dest`, replacing it
    async fn get(&self, uri: &str, dest: &Path) -> crate::Result<()>;

    /// Name of this implementation
    fn name(&self) -> &'static str;
}

/// [`S3Client`] running the external `s3cmd` binary
pub struct CliS3Client {
    binary_path: PathBuf,
    timeout: Option<Duration>,
}

impl CliS3Client {
    /// Create a client with an explicit binary path
    pub fn new(binary_path: PathBuf) -> Self {
        Self {
            binary_path,
            timeout: None,
        }
    }

    /// Attempt to find `s3cmd` in PATH
    pub fn from_path() -> Option<Self> {
        which::which("s3cmd").ok().map(Self::new)
    }

    /// Kill the helper after `timeout` without output
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    async fn run(&self, args: &[&str], description: &str) -> Result<CommandOutput> {
        let mut command = vec![self.binary_path.to_string_lossy().into_owned()];
        command.extend(args.iter().map(|a| a.to_string()));
        let output =
            call_command_line(&command, description, self.timeout, || TimerVerdict::Tick, false).await?;
        if !output.success() {
            let last = output.lines.last().cloned().unwrap_or_default();
            return Err(Error::ExternalTool(format!(
                "{description} exited with {:?}: {last}",
                output.exit_code
            )));
        }
        Ok(output)
    }
}

#[async_trait]
impl S3Client for CliS3Client {
    async fn info(&self, uri: &str) -> crate::Result<RemoteInfo> {
        let output = self.run(&["info", uri], "s3cmd info").await?;
        Ok(parse_s3_info(&output.lines))
    }

    async fn get(&self, uri: &str, dest: &Path) -> crate::Result<()> {
        let dest = dest.to_string_lossy().into_owned();
        self.run(&["get", "--force", uri, dest.as_str()], "s3cmd get").await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "s3cmd"
    }
}

static FILE_SIZE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*File size:\s*(\d+)").ok());
static LAST_MOD: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*Last mod:\s*(.+?)\s*$").ok());

/// Read `File size:` and `Last mod:` from `s3cmd info` output
pub fn parse_s3_info(lines: &[String]) -> RemoteInfo {
    let mut info = RemoteInfo::default();
    for line in lines {
        if let Some(re) = FILE_SIZE.as_ref()
            && let Some(caps) = re.captures(line)
        {
            info.size = caps[1].parse().ok();
        }
        if let Some(re) = LAST_MOD.as_ref()
            && let Some(caps) = re.captures(line)
        {
            info.modified = parse_http_date(&caps[1]);
        }
    }
    info
}

/// Fetch an object through `client`
pub(super) async fn fetch(client: &dyn S3Client, uri: &str, request: &DownloadRequest) -> Result<Fetched> {
    let remote = client.info(uri).await?;
    let local = match request.freshness {
        Freshness::Off => None,
        _ => LocalInfo::of(&request.dest),
    };
    let compare = match decide(request.freshness, &remote, local.as_ref(), Utc::now()) {
        Decision::Skip => return Ok(Fetched::Current),
        Decision::Stale(modified) => return Ok(Fetched::Stale(modified)),
        decision => decision == Decision::DownloadAndCompare,
    };

    let temp = partial::temp_path(&request.dest, None);
    discard(&temp);
    tracing::debug!(uri, helper = client.name(), "fetching object");
    if let Err(e) = client.get(uri, &temp).await {
        discard(&temp);
        return Err(e);
    }
    Ok(Fetched::Transferred {
        temp,
        remote,
        compare,
        resumable: false,
    })
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_s3cmd_info_output() {
        let lines: Vec<String> = [
            "s3://bucket/tiles/h12v04.hdf (object):",
            "   File size: 52428800",
            "   Last mod:  Fri, 01 Mar 2024 02:00:00 GMT",
            "   MIME type: application/octet-stream",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let info = parse_s3_info(&lines);
        assert_eq!(info.size, Some(52_428_800));
        assert_eq!(info.modified.unwrap().timestamp(), 1_709_258_400);
    }

    #[test]
    fn missing_fields_stay_unknown() {
        let info = parse_s3_info(&["ERROR: S3 error: 404".to_string()]);
        assert_eq!(info, RemoteInfo::default());
    }

    #[test]
    fn from_path_misses_unknown_binaries() {
        assert!(which::which("nonexistent-s3cmd-binary-xyz").is_err());
    }
}
