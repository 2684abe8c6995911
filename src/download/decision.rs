//! Timestamp and size policy deciding whether a transfer is needed

use chrono::{DateTime, Utc};
use std::path::Path;
use std::time::Duration;

/// How the local copy is checked against the remote before downloading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Freshness {
    /// Always download
    Off,
    /// Download only when the remote differs from the local copy
    #[default]
    Check,
    /// Like `Check`, and the remote must be newer than `now - age`
    MaxAge(Duration),
}

/// What the remote side told us about the resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RemoteInfo {
    /// Last modification time, when reported
    pub modified: Option<DateTime<Utc>>,
    /// Size in bytes, when reported
    pub size: Option<u64>,
}

impl RemoteInfo {
    /// Both the time and the size are known, so a partial copy can be matched
    pub fn is_identified(&self) -> bool {
        self.modified.is_some() && self.size.is_some()
    }
}

/// The existing local copy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalInfo {
    /// Modification time of the local file
    pub modified: DateTime<Utc>,
    /// Size in bytes
    pub size: u64,
}

impl LocalInfo {
    /// Stat `path`; None when it does not exist or is not a file
    pub fn of(path: &Path) -> Option<Self> {
        let meta = std::fs::metadata(path).ok().filter(|m| m.is_file())?;
        let modified = meta.modified().ok()?;
        Some(Self {
            modified: DateTime::<Utc>::from(modified),
            size: meta.len(),
        })
    }
}

/// Outcome of [`decide`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Transfer the resource
    Download,
    /// Transfer, then keep the local copy if both are byte-identical
    DownloadAndCompare,
    /// The local copy is current
    Skip,
    /// The remote is older than the freshness bound
    Stale(DateTime<Utc>),
}

/// Decide whether to transfer, before any byte is read
///
/// Times are compared at whole-second granularity since most protocols
/// report no finer resolution.
pub fn decide(
    freshness: Freshness,
    remote: &RemoteInfo,
    local: Option<&LocalInfo>,
    now: DateTime<Utc>,
) -> Decision {
    if let Some(stale) = stale_since(freshness, remote.modified, now) {
        return Decision::Stale(stale);
    }
    let Some(local) = local else {
        return Decision::Download;
    };
    if freshness == Freshness::Off {
        return Decision::Download;
    }

    if let Some(modified) = remote.modified {
        let (remote_secs, local_secs) = (modified.timestamp(), local.modified.timestamp());
        if remote_secs > local_secs {
            return Decision::Download;
        }
        if remote_secs < local_secs {
            return Decision::Skip;
        }
    }
    match remote.size {
        Some(size) if size != local.size => Decision::Download,
        Some(_) => Decision::Skip,
        None => Decision::DownloadAndCompare,
    }
}

/// The remote modification time when it breaks the `MaxAge` bound
pub fn stale_since(
    freshness: Freshness,
    modified: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let Freshness::MaxAge(age) = freshness else {
        return None;
    };
    let modified = modified?;
    let bound = chrono::Duration::from_std(age).ok()?;
    (modified < now - bound).then_some(modified)
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn remote(modified: Option<i64>, size: Option<u64>) -> RemoteInfo {
        RemoteInfo {
            modified: modified.map(at),
            size,
        }
    }

    fn local(modified: i64, size: u64) -> LocalInfo {
        LocalInfo {
            modified: at(modified),
            size,
        }
    }

    #[test]
    fn decision_table() {
        let now = at(10_000);
        let check = Freshness::Check;
        let cases = [
            // (remote modified, local modified, remote size, local size) -> decision
            (remote(Some(100), Some(10)), Some(local(50, 10)), Decision::Download),
            (remote(Some(50), Some(10)), Some(local(100, 10)), Decision::Skip),
            (remote(Some(100), Some(10)), Some(local(100, 10)), Decision::Skip),
            (remote(Some(100), Some(11)), Some(local(100, 10)), Decision::Download),
            (remote(Some(100), None), Some(local(100, 10)), Decision::DownloadAndCompare),
            (remote(None, Some(10)), Some(local(100, 10)), Decision::Skip),
            (remote(None, Some(12)), Some(local(100, 10)), Decision::Download),
            (remote(None, None), Some(local(100, 10)), Decision::DownloadAndCompare),
            (remote(Some(100), Some(10)), None, Decision::Download),
            (remote(None, None), None, Decision::Download),
        ];
        for (remote, local, expected) in cases {
            assert_eq!(
                decide(check, &remote, local.as_ref(), now),
                expected,
                "remote {remote:?} local {local:?}"
            );
        }
    }

    #[test]
    fn sub_second_differences_count_as_equal() {
        let remote = RemoteInfo {
            modified: Some(Utc.timestamp_opt(1_700_000_100, 900_000_000).unwrap()),
            size: Some(10),
        };
        let local = local(100, 10);
        assert_eq!(decide(Freshness::Check, &remote, Some(&local), at(0)), Decision::Skip);
    }

    #[test]
    fn freshness_off_always_downloads() {
        let decision = decide(
            Freshness::Off,
            &remote(Some(50), Some(10)),
            Some(&local(100, 10)),
            at(0),
        );
        assert_eq!(decision, Decision::Download);
    }

    #[test]
    fn max_age_reports_stale_remote_before_anything_else() {
        let now = at(10_000);
        let max_age = Freshness::MaxAge(Duration::from_secs(3600));
        assert_eq!(
            decide(max_age, &remote(Some(0), Some(10)), Some(&local(0, 10)), now),
            Decision::Stale(at(0))
        );
        // stale applies even without a local copy
        assert_eq!(
            decide(max_age, &remote(Some(0), None), None, now),
            Decision::Stale(at(0))
        );
        assert_eq!(
            decide(max_age, &remote(Some(9_000), Some(10)), None, now),
            Decision::Download
        );
        // unknown modification time cannot be stale
        assert_eq!(
            decide(max_age, &remote(None, Some(10)), Some(&local(0, 10)), now),
            Decision::Skip
        );
    }

    #[test]
    fn local_info_of_missing_file_is_none() {
        let temp = tempfile::tempdir().unwrap();
        assert!(LocalInfo::of(&temp.path().join("missing")).is_none());
        assert!(LocalInfo::of(temp.path()).is_none());
        std::fs::write(temp.path().join("f"), b"abc").unwrap();
        assert_eq!(LocalInfo::of(&temp.path().join("f")).unwrap().size, 3);
    }
}
