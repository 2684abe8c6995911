//! FTP transport (passive mode, binary, `REST` resume)

use super::decision::{Decision, Freshness, LocalInfo, RemoteInfo, decide};
use super::{DownloadProgress, DownloadRequest, Fetched, ProgressFn, discard, partial};
use crate::error::{DownloadError, Error, Result};
use chrono::{DateTime, Utc};
use std::fs::OpenOptions;
use std::io::{BufWriter, Read, Write};
use std::net::ToSocketAddrs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use suppaftp::types::FileType;
use suppaftp::{FtpError, FtpStream, Mode};
use tokio_util::sync::CancellationToken;
use url::Url;

const ANONYMOUS_USER: &str = "anonymous";
const ANONYMOUS_PASSWORD: &str = "anonymous@";

/// Everything the blocking transfer needs, owned
struct FtpJob {
    url: String,
    host: String,
    port: u16,
    path: String,
    username: String,
    password: String,
    dest: PathBuf,
    freshness: Freshness,
    timeout: Duration,
    read_size: usize,
    cancel: Option<CancellationToken>,
    progress: Option<ProgressFn>,
}

impl FtpJob {
    fn new(url: &Url, request: &DownloadRequest, timeout: Duration, read_size: usize) -> Result<Self> {
        let host = url
            .host_str()
            .ok_or_else(|| DownloadError::UnsupportedSource(url.to_string()))?
            .to_string();
        let path = urlencoding::decode(url.path())
            .map_err(|e| DownloadError::UnsupportedSource(format!("{url}: {e}")))?
            .into_owned();

        let (username, password) = if !url.username().is_empty() {
            let user = urlencoding::decode(url.username())
                .map(|u| u.into_owned())
                .unwrap_or_else(|_| url.username().to_string());
            let password = url
                .password()
                .and_then(|p| urlencoding::decode(p).ok())
                .map(|p| p.into_owned())
                .unwrap_or_default();
            (user, password)
        } else {
            match &request.credentials {
                Some(c) if c.auth_host().is_none_or(|h| h.eq_ignore_ascii_case(&host)) => {
                    (c.username.clone(), c.password.clone())
                }
                _ => (ANONYMOUS_USER.to_string(), ANONYMOUS_PASSWORD.to_string()),
            }
        };

        Ok(Self {
            url: request.url.clone(),
            host,
            port: url.port().unwrap_or(21),
            path,
            username,
            password,
            dest: request.dest.clone(),
            freshness: request.freshness,
            timeout,
            read_size,
            cancel: request.cancel.clone(),
            progress: request.progress.clone(),
        })
    }
}

/// Fetch an FTP resource on the blocking pool
pub(super) async fn fetch(
    url: &Url,
    request: &DownloadRequest,
    timeout: Duration,
    read_size: usize,
) -> Result<Fetched> {
    let job = FtpJob::new(url, request, timeout, read_size)?;
    tokio::task::spawn_blocking(move || fetch_blocking(&job))
        .await
        .map_err(|e| Error::Ftp(format!("FTP task failed: {e}")))?
}

fn ftp_error(e: FtpError) -> Error {
    Error::Ftp(e.to_string())
}

fn connect(job: &FtpJob) -> Result<FtpStream> {
    let address = (job.host.as_str(), job.port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| Error::Ftp(format!("cannot resolve {}", job.host)))?;
    let mut ftp = FtpStream::connect_timeout(address, job.timeout).map_err(ftp_error)?;
    ftp.get_ref().set_read_timeout(Some(job.timeout))?;
    ftp.set_mode(Mode::Passive);
    ftp.login(job.username.as_str(), job.password.as_str())
        .map_err(ftp_error)?;
    ftp.transfer_type(FileType::Binary).map_err(ftp_error)?;
    Ok(ftp)
}

/// Size and time from `SIZE`/`MDTM`, falling back to a `LIST` entry
fn remote_info(ftp: &mut FtpStream, path: &str) -> RemoteInfo {
    let size = ftp.size(path).ok().map(|s| s as u64);
    let modified = ftp.mdtm(path).ok().map(|m| m.and_utc());
    if size.is_some() && modified.is_some() {
        return RemoteInfo { modified, size };
    }

    let listed = ftp
        .list(Some(path))
        .ok()
        .and_then(|lines| lines.iter().find_map(|l| parse_list_line(l)));
    match listed {
        Some(entry) => RemoteInfo {
            modified: modified.or(entry.modified),
            size: size.or(entry.size),
        },
        None => RemoteInfo { modified, size },
    }
}

/// Size and modification time of one `LIST` line (Unix or DOS format)
pub fn parse_list_line(line: &str) -> Option<RemoteInfo> {
    let file: suppaftp::list::File = line.parse().ok()?;
    if !file.is_file() {
        return None;
    }
    Some(RemoteInfo {
        modified: Some(DateTime::<Utc>::from(file.modified())),
        size: Some(file.size() as u64),
    })
}

fn fetch_blocking(job: &FtpJob) -> Result<Fetched> {
    let mut ftp = connect(job)?;
    let result = transfer(&mut ftp, job);
    if let Err(e) = ftp.quit() {
        tracing::debug!(host = %job.host, error = %e, "FTP quit failed");
    }
    result
}

fn transfer(ftp: &mut FtpStream, job: &FtpJob) -> Result<Fetched> {
    let remote = remote_info(ftp, &job.path);
    let local = match job.freshness {
        Freshness::Off => None,
        _ => LocalInfo::of(&job.dest),
    };
    let compare = match decide(job.freshness, &remote, local.as_ref(), Utc::now()) {
        Decision::Skip => return Ok(Fetched::Current),
        Decision::Stale(modified) => return Ok(Fetched::Stale(modified)),
        decision => decision == Decision::DownloadAndCompare,
    };

    let resumable = remote.is_identified();
    let temp = partial::temp_path(&job.dest, resumable.then_some(&remote));
    let mut offset = if resumable { partial::existing_len(&temp) } else { 0 };
    if !resumable || remote.size.is_some_and(|size| offset > size) {
        discard(&temp);
        offset = 0;
    }
    let transferred = Fetched::Transferred {
        temp: temp.clone(),
        remote,
        compare,
        resumable,
    };
    if offset > 0 && Some(offset) == remote.size {
        return Ok(transferred);
    }

    if offset > 0
        && let Err(e) = ftp.resume_transfer(offset as usize)
    {
        tracing::warn!(url = %job.url, error = %e, "server rejected REST, restarting");
        offset = 0;
    }
    let mut stream = match ftp.retr_as_stream(&job.path) {
        Ok(stream) => stream,
        Err(e) if offset > 0 => {
            tracing::warn!(url = %job.url, error = %e, "resumed RETR failed, restarting");
            offset = 0;
            ftp.resume_transfer(0).ok();
            ftp.retr_as_stream(&job.path).map_err(ftp_error)?
        }
        Err(e) => {
            discard(&temp);
            return Err(ftp_error(e));
        }
    };
    if offset > 0 {
        tracing::info!(url = %job.url, offset, "resuming transfer");
    }

    let copied = copy_to_temp(&mut stream, &temp, offset, remote.size, job);
    let finished = ftp.finalize_retr_stream(stream).map_err(ftp_error);
    if let Err(e) = copied.and(finished) {
        if !resumable {
            discard(&temp);
        }
        return Err(e);
    }
    Ok(transferred)
}

fn copy_to_temp<R: Read>(
    reader: &mut R,
    temp: &Path,
    offset: u64,
    total: Option<u64>,
    job: &FtpJob,
) -> Result<u64> {
    let mut options = OpenOptions::new();
    if offset > 0 {
        options.append(true);
    } else {
        options.write(true).truncate(true);
    }
    let file = options.create(true).open(temp)?;
    let mut writer = BufWriter::with_capacity(job.read_size, file);
    let mut buffer = vec![0u8; job.read_size];
    let mut received = offset;

    loop {
        if job.cancel.as_ref().is_some_and(|t| t.is_cancelled()) {
            writer.flush()?;
            return Err(DownloadError::Interrupted {
                url: job.url.clone(),
                received,
            }
            .into());
        }
        let n = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                writer.flush()?;
                return Err(e.into());
            }
        };
        writer.write_all(&buffer[..n])?;
        received += n as u64;
        if let Some(progress) = &job.progress {
            progress(DownloadProgress { received, total });
        }
    }
    writer.flush()?;
    tracing::info!(url = %job.url, bytes = received - offset, resumed_at = offset, "transfer finished");
    Ok(received)
}
