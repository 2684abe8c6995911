//! Local and UNC file sources: a conditional copy

use super::decision::{Decision, Freshness, LocalInfo, RemoteInfo, decide};
use super::{DownloadRequest, Fetched, discard, partial};
use crate::error::Result;
use chrono::{DateTime, Utc};
use std::path::Path;

/// Copy `source` when it differs from the destination
pub(super) async fn fetch(source: &Path, request: &DownloadRequest) -> Result<Fetched> {
    let meta = tokio::fs::metadata(source).await?;
    let remote = RemoteInfo {
        modified: meta.modified().ok().map(DateTime::<Utc>::from),
        size: Some(meta.len()),
    };
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
    if let Err(e) = tokio::fs::copy(source, &temp).await {
        discard(&temp);
        return Err(e.into());
    }
    tracing::debug!(source = %source.display(), bytes = meta.len(), "copied local file");
    Ok(Fetched::Transferred {
        temp,
        remote,
        compare,
        resumable: false,
    })
}
