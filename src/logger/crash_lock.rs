//! Premature-exit detection through an exclusively locked file
//!
//! A run creates and locks `PreMatureExitDetection.tmp` in its error folder
//! and deletes it on a clean close. Finding the file unlocked at startup
//! therefore means the previous run never closed.

use chrono::{DateTime, Local};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the lock file inside the error folder
pub const LOCK_FILE_NAME: &str = "PreMatureExitDetection.tmp";

/// Attempts made to release the lock
pub const RELEASE_ATTEMPTS: u32 = 3;

/// Pause between release attempts
pub const RELEASE_PAUSE: Duration = Duration::from_secs(5);

/// Left behind by a run that did not close
#[derive(Debug, Clone)]
pub struct StaleLock {
    /// What the crashed run wrote into the lock file
    pub contents: String,
    /// When the lock file was last modified
    pub modified: Option<DateTime<Local>>,
}

/// Result of [`CrashLock::acquire`]
#[derive(Debug)]
pub enum LockAcquire {
    /// This run owns the lock; `stale` is set when a crashed run left it
    Acquired {
        /// The held lock
        lock: CrashLock,
        /// Evidence of a previous premature exit
        stale: Option<StaleLock>,
    },
    /// Another live run holds the lock
    Held,
}

/// The held crash lock of the current run
#[derive(Debug)]
pub struct CrashLock {
    path: PathBuf,
    file: Option<File>,
}

impl CrashLock {
    /// Create (or reuse) and lock the file at `path`
    pub fn acquire(path: &Path) -> io::Result<LockAcquire> {
        let existed = path.exists();
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)?;

        if let Err(e) = file.try_lock_exclusive() {
            let contended = e.kind() == io::ErrorKind::WouldBlock
                || e.raw_os_error() == fs2::lock_contended_error().raw_os_error();
            return if contended { Ok(LockAcquire::Held) } else { Err(e) };
        }

        let mut contents = String::new();
        if existed {
            file.read_to_string(&mut contents)?;
        }
        let stale = if !contents.trim().is_empty() {
            let modified = file
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .map(DateTime::<Local>::from);
            Some(StaleLock {
                contents: contents.trim().to_string(),
                modified,
            })
        } else {
            None
        };

        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        writeln!(
            file,
            "started {} pid {}",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            std::process::id()
        )?;
        file.sync_all()?;

        Ok(LockAcquire::Acquired {
            lock: CrashLock {
                path: path.to_path_buf(),
                file: Some(file),
            },
            stale,
        })
    }

    /// Lock file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Unlock and delete the file, retrying `attempts` times
    pub async fn release(mut self, attempts: u32, pause: Duration) -> crate::Result<()> {
        let mut last_error = String::new();
        for attempt in 1..=attempts.max(1) {
            match self.try_release() {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!(path = %self.path.display(), attempt, error = %e, "crash lock release failed");
                    last_error = e.to_string();
                }
            }
            if attempt < attempts {
                tokio::time::sleep(pause).await;
            }
        }
        Err(crate::error::CrashLockError::ReleaseFailed {
            path: self.path.clone(),
            attempts,
            reason: last_error,
        }
        .into())
    }

    fn try_release(&mut self) -> io::Result<()> {
        let Some(file) = self.file.take() else {
            return remove_lock_file(&self.path);
        };
        // emptied first: a run that opens the file before it is gone sees no stale evidence
        let released = file.set_len(0).and_then(|()| {
            #[cfg(unix)]
            remove_lock_file(&self.path)?;
            FileExt::unlock(&file)
        });
        if let Err(e) = released {
            self.file = Some(file);
            return Err(e);
        }
        remove_lock_file(&self.path)
    }
}

fn remove_lock_file(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Rough timestamp of a stale lock: its recorded start, else its mtime
pub fn stale_started(stale: &StaleLock) -> Option<String> {
    stale
        .contents
        .strip_prefix("started ")
        .and_then(|rest| rest.split(" pid ").next())
        .map(str::to_string)
        .or_else(|| {
            stale
                .modified
                .map(|m| m.format("%Y-%m-%d %H:%M:%S").to_string())
        })
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fresh_lock_has_no_stale_evidence() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join(LOCK_FILE_NAME);
        let LockAcquire::Acquired { lock, stale } = CrashLock::acquire(&path).unwrap() else {
            panic!("lock should be free");
        };
        assert!(stale.is_none());
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("started "));
        assert!(contents.contains(&format!("pid {}", std::process::id())));

        lock.release(1, Duration::ZERO).await.unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn leftover_unlocked_file_means_previous_run_crashed() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join(LOCK_FILE_NAME);
        std::fs::write(&path, "started 2024-03-01 02:00:00 pid 4242\n").unwrap();

        let LockAcquire::Acquired { stale, .. } = CrashLock::acquire(&path).unwrap() else {
            panic!("leftover file is not locked");
        };
        let stale = stale.expect("stale evidence");
        assert_eq!(stale.contents, "started 2024-03-01 02:00:00 pid 4242");
        assert_eq!(stale_started(&stale).as_deref(), Some("2024-03-01 02:00:00"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn release_unlinks_before_unlocking() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join(LOCK_FILE_NAME);
        let LockAcquire::Acquired { lock, .. } = CrashLock::acquire(&path).unwrap() else {
            panic!("lock should be free");
        };
        let starting_run = OpenOptions::new().read(true).open(&path).unwrap();

        lock.release(1, Duration::ZERO).await.unwrap();
        assert!(!path.exists());
        assert_eq!(starting_run.metadata().unwrap().len(), 0);
    }

    #[test]
    fn empty_leftover_file_is_not_a_crash() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join(LOCK_FILE_NAME);
        std::fs::write(&path, "").unwrap();

        let LockAcquire::Acquired { stale, .. } = CrashLock::acquire(&path).unwrap() else {
            panic!("leftover file is not locked");
        };
        assert!(stale.is_none());
    }

    #[test]
    fn held_lock_is_reported() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join(LOCK_FILE_NAME);
        let first = CrashLock::acquire(&path).unwrap();
        assert!(matches!(first, LockAcquire::Acquired { .. }));
        assert!(matches!(CrashLock::acquire(&path).unwrap(), LockAcquire::Held));
    }

    #[test]
    fn stale_start_falls_back_to_mtime() {
        let stale = StaleLock {
            contents: "garbage".into(),
            modified: Some(Local::now()),
        };
        assert!(stale_started(&stale).is_some());
        let nothing = StaleLock {
            contents: String::new(),
            modified: None,
        };
        assert!(stale_started(&nothing).is_none());
    }
}
