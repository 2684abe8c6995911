//! HTTP/HTTPS transport

use super::decision::{Decision, Freshness, LocalInfo, RemoteInfo, decide, stale_since};
use super::digest::{DigestChallenge, new_cnonce};
use super::{Credentials, DownloadProgress, DownloadRequest, Downloader, Fetched, discard, format_http_date, parse_http_date, partial};
use crate::error::{DownloadError, Error, Result};
use chrono::Utc;
use reqwest::header::{
    ACCEPT_RANGES, AUTHORIZATION, CACHE_CONTROL, CONTENT_RANGE, HeaderMap, HeaderName, HeaderValue,
    IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED, LOCATION, RANGE, WWW_AUTHENTICATE,
};
use reqwest::{Method, Response, StatusCode};
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::io::{AsyncWriteExt, BufWriter};
use url::{Position, Url};

/// Fetch an HTTP(S) resource
pub(super) async fn fetch(dl: &Downloader, url: &Url, request: &DownloadRequest) -> Result<Fetched> {
    let session = Session::new(dl, request)?;
    let local = match request.freshness {
        Freshness::Off => None,
        _ => LocalInfo::of(&request.dest),
    };

    let mut conditional = HeaderMap::new();
    if let Some(local) = &local {
        if let Ok(since) = HeaderValue::from_str(&format_http_date(local.modified)) {
            conditional.insert(IF_MODIFIED_SINCE, since);
        }
        if let Some(validator) = dl.validator(url.as_str()) {
            conditional.insert(IF_NONE_MATCH, validator.etag);
            if let Some(cache_control) = validator.cache_control {
                conditional.insert(CACHE_CONTROL, cache_control);
            }
        }
    }

    let response = session.send(url, &conditional).await?;
    dl.remember_validator(url.as_str(), response.headers());
    let status = response.status();
    if status == StatusCode::NOT_MODIFIED {
        let modified = last_modified(response.headers()).or(local.map(|l| l.modified));
        if let Some(stale) = stale_since(request.freshness, modified, Utc::now()) {
            return Ok(Fetched::Stale(stale));
        }
        tracing::debug!(url = %url, "not modified");
        return Ok(Fetched::Current);
    }
    check_status(url, status)?;

    let remote = RemoteInfo {
        modified: last_modified(response.headers()),
        size: response.content_length(),
    };
    let compare = match decide(request.freshness, &remote, local.as_ref(), Utc::now()) {
        Decision::Skip => return Ok(Fetched::Current),
        Decision::Stale(modified) => return Ok(Fetched::Stale(modified)),
        decision => decision == Decision::DownloadAndCompare,
    };

    let resumable = accepts_ranges(response.headers()) && remote.is_identified();
    let temp = partial::temp_path(&request.dest, resumable.then_some(&remote));
    let mut offset = if resumable { partial::existing_len(&temp) } else { 0 };
    if !resumable {
        discard(&temp);
    }
    if let Some(size) = remote.size
        && offset > size
    {
        tracing::warn!(temp = %temp.display(), "temp file larger than the remote, restarting");
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
        tracing::debug!(url = %url, "temp file already complete");
        return Ok(transferred);
    }

    let response = if offset > 0 {
        drop(response);
        let (response, start) = session.resume(url, offset).await?;
        if start == 0 {
            discard(&temp);
        }
        offset = start;
        response
    } else {
        response
    };

    match stream_body(&session, response, &temp, offset, remote.size).await {
        Ok(_) => Ok(transferred),
        Err(e) => {
            if !resumable {
                discard(&temp);
            }
            Err(e)
        }
    }
}

fn check_status(url: &Url, status: StatusCode) -> Result<()> {
    if status.is_success() {
        return Ok(());
    }
    Err(DownloadError::HttpStatus {
        url: url.to_string(),
        status: status.as_u16(),
    }
    .into())
}

fn last_modified(headers: &HeaderMap) -> Option<chrono::DateTime<Utc>> {
    headers
        .get(LAST_MODIFIED)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_http_date)
}

fn accepts_ranges(headers: &HeaderMap) -> bool {
    headers
        .get(ACCEPT_RANGES)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.to_ascii_lowercase().contains("bytes"))
}

/// Start offset of a `Content-Range: bytes <start>-<end>/<total>` header
fn content_range_start(headers: &HeaderMap) -> Option<u64> {
    let value = headers.get(CONTENT_RANGE)?.to_str().ok()?;
    let range = value.trim().strip_prefix("bytes")?.trim();
    range.split('-').next()?.trim().parse().ok()
}

enum Authorization {
    Basic,
    Digest(String),
}

/// Request settings shared by every hop of one download
struct Session<'a> {
    client: &'a reqwest::Client,
    request: &'a DownloadRequest,
    headers: HeaderMap,
    timeout: Duration,
    read_size: usize,
    max_redirects: usize,
}

impl<'a> Session<'a> {
    fn new(dl: &'a Downloader, request: &'a DownloadRequest) -> Result<Self> {
        let mut headers = HeaderMap::new();
        for (name, value) in &request.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| Error::config("headers", format!("invalid header name '{name}': {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| Error::config("headers", format!("invalid value for '{name}': {e}")))?;
            headers.append(name, value);
        }
        Ok(Self {
            client: &dl.client,
            request,
            headers,
            timeout: dl.timeout(request),
            read_size: dl.read_size(request),
            max_redirects: dl.config.max_redirects,
        })
    }

    /// Credentials allowed on `url`, and whether the host was named explicitly
    fn credentials_for(&self, url: &Url, origin: &str) -> Option<(&'a Credentials, bool)> {
        let credentials = self.request.credentials.as_ref()?;
        let host = url.host_str()?.to_ascii_lowercase();
        match credentials.auth_host() {
            Some(auth_host) => (host == auth_host).then_some((credentials, true)),
            None => (host == origin).then_some((credentials, false)),
        }
    }

    /// Send with manual redirects; credentials only go to the authentication host
    async fn send(&self, url: &Url, extra: &HeaderMap) -> Result<Response> {
        let origin = url.host_str().unwrap_or_default().to_ascii_lowercase();
        let mut method = if self.request.data.is_some() {
            Method::POST
        } else {
            Method::GET
        };
        let mut body = self.request.data.clone();
        let mut current = url.clone();

        for _ in 0..=self.max_redirects {
            let allowed = self.credentials_for(&current, &origin);
            let preemptive = allowed.filter(|(_, named)| *named).map(|_| Authorization::Basic);
            let mut response = self
                .send_once(&method, &current, body.as_deref(), extra, preemptive, allowed.map(|a| a.0))
                .await?;

            if response.status() == StatusCode::UNAUTHORIZED
                && let Some((credentials, _)) = allowed
                && let Some(answer) = answer_challenge(&response, credentials, &method, &current)
            {
                tracing::debug!(url = %current, "answering authentication challenge");
                response = self
                    .send_once(&method, &current, body.as_deref(), extra, Some(answer), Some(credentials))
                    .await?;
            }

            let status = response.status();
            if !status.is_redirection() || status == StatusCode::NOT_MODIFIED {
                return Ok(response);
            }
            let Some(location) = response.headers().get(LOCATION).and_then(|v| v.to_str().ok()) else {
                return Ok(response);
            };
            let next = current
                .join(location)
                .map_err(|e| DownloadError::UnsupportedSource(format!("{location}: {e}")))?;
            if status == StatusCode::SEE_OTHER
                || (method == Method::POST
                    && matches!(status, StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND))
            {
                method = Method::GET;
                body = None;
            }
            tracing::debug!(from = %current, to = %next, status = status.as_u16(), "following redirect");
            current = next;
        }

        Err(DownloadError::TooManyRedirects {
            url: url.to_string(),
            limit: self.max_redirects,
        }
        .into())
    }

    async fn send_once(
        &self,
        method: &Method,
        url: &Url,
        body: Option<&[u8]>,
        extra: &HeaderMap,
        authorization: Option<Authorization>,
        credentials: Option<&Credentials>,
    ) -> Result<Response> {
        let mut builder = self
            .client
            .request(method.clone(), url.clone())
            .headers(self.headers.clone())
            .headers(extra.clone());
        if let Some(body) = body {
            builder = builder.body(body.to_vec());
        }
        match (authorization, credentials) {
            (Some(Authorization::Basic), Some(c)) => {
                builder = builder.basic_auth(&c.username, Some(&c.password));
            }
            (Some(Authorization::Digest(header)), _) => {
                builder = builder.header(AUTHORIZATION, header);
            }
            _ => {}
        }

        match tokio::time::timeout(self.timeout, builder.send()).await {
            Ok(response) => Ok(response?),
            Err(_) => Err(Error::Timeout {
                what: format!("request to {url}"),
                seconds: self.timeout.as_secs(),
            }),
        }
    }

    /// Ask for the bytes from `offset` on; returns the response and where it starts
    async fn resume(&self, url: &Url, offset: u64) -> Result<(Response, u64)> {
        let mut range = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(&format!("bytes={offset}-")) {
            range.insert(RANGE, value);
        }
        let response = self.send(url, &range).await?;
        match response.status() {
            StatusCode::PARTIAL_CONTENT if content_range_start(response.headers()) == Some(offset) => {
                tracing::info!(url = %url, offset, "resuming transfer");
                Ok((response, offset))
            }
            StatusCode::OK => {
                tracing::warn!(url = %url, "server ignored the range, restarting");
                Ok((response, 0))
            }
            status => {
                tracing::warn!(url = %url, status = status.as_u16(), "resume rejected, restarting");
                drop(response);
                let response = self.send(url, &HeaderMap::new()).await?;
                check_status(url, response.status())?;
                Ok((response, 0))
            }
        }
    }
}

/// Authorization answering a 401: Digest when offered, else Basic
fn answer_challenge(
    response: &Response,
    credentials: &Credentials,
    method: &Method,
    url: &Url,
) -> Option<Authorization> {
    let challenges: Vec<&str> = response
        .headers()
        .get_all(WWW_AUTHENTICATE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();
    if let Some(challenge) = challenges.iter().find_map(|c| DigestChallenge::parse(c)) {
        let uri = &url[Position::BeforePath..];
        return Some(Authorization::Digest(challenge.authorization(
            &credentials.username,
            &credentials.password,
            method.as_str(),
            uri,
            &new_cnonce(),
            1,
        )));
    }
    challenges
        .iter()
        .any(|c| c.trim_start().to_ascii_lowercase().starts_with("basic"))
        .then_some(Authorization::Basic)
}

/// Write the response body to `temp` from `offset`; returns the file length
async fn stream_body(
    session: &Session<'_>,
    mut response: Response,
    temp: &Path,
    offset: u64,
    total: Option<u64>,
) -> Result<u64> {
    let request = session.request;
    let mut options = tokio::fs::OpenOptions::new();
    if offset > 0 {
        options.append(true);
    } else {
        options.write(true).truncate(true);
    }
    let file = options.create(true).open(temp).await?;
    let mut writer = BufWriter::with_capacity(session.read_size, file);

    let started = Instant::now();
    let mut received = offset;
    loop {
        let next = tokio::time::timeout(session.timeout, response.chunk());
        let chunk = match &request.cancel {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => None,
                chunk = next => Some(chunk),
            },
            None => Some(next.await),
        };
        let Some(chunk) = chunk else {
            writer.flush().await?;
            return Err(DownloadError::Interrupted {
                url: request.url.clone(),
                received,
            }
            .into());
        };
        let chunk = match chunk {
            Ok(Ok(chunk)) => chunk,
            Ok(Err(e)) => {
                writer.flush().await?;
                return Err(e.into());
            }
            Err(_) => {
                writer.flush().await?;
                return Err(Error::Timeout {
                    what: format!("reading {}", request.url),
                    seconds: session.timeout.as_secs(),
                });
            }
        };
        let Some(chunk) = chunk else {
            break;
        };
        writer.write_all(&chunk).await?;
        received += chunk.len() as u64;
        if let Some(progress) = &request.progress {
            progress(DownloadProgress { received, total });
        }
    }
    writer.flush().await?;

    let elapsed = started.elapsed().as_secs_f64().max(0.001);
    let fresh_bytes = received - offset;
    tracing::info!(
        url = %request.url,
        bytes = fresh_bytes,
        resumed_at = offset,
        kib_per_sec = (fresh_bytes as f64 / 1024.0 / elapsed).round(),
        "transfer finished"
    );
    Ok(received)
}
