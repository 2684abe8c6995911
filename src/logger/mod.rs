//! Run Logger: per-run logs, crash detection and notification
//!
//! Opening a [`RunLogger`] claims the job's crash lock, reports a previous
//! run that never closed, opens the Archive, Activity and Error logs and
//! prunes expired ones. Closing it drains the worker pools, releases the
//! lock, updates the persisted counters, sends whatever notification is due
//! and removes the Error log of a clean run.
//!
//! File layout for nickname `nightly` in `home`:
//!
//! | File | Content |
//! |------|---------|
//! | `nightly_YYYYMM.txt` | Archive log, one dated line per event, appended |
//! | `nightly_LastRun.txt` | Activity log of the latest run |
//! | `nightly_Errors/YYYYMMDD_HHMMSS.txt` | Error log of one run |
//! | `nightly_Errors/PreMatureExitDetection.tmp` | Crash lock |
//! | `nightly_EmailLog_YYYYMM.txt` | Notification log, appended |
//! | `nightly_Details.json` | Persisted counters and details |

mod counters;
mod crash_lock;
mod detail;
mod env_overrides;
mod lifecycle;
mod retention;
mod run;
mod sink;

pub use counters::{
    MailDetail, MailKind, Notification, PeriodCounter, Rollover, RunRecord, plan_notification,
};
pub use crash_lock::{CrashLock, LOCK_FILE_NAME, LockAcquire, StaleLock};
pub use detail::{DETAIL_VERSION, DetailStore, EMAIL_SECTION};
pub use env_overrides::{EnvOverlay, GLOBAL_ENV_FILE};
pub use lifecycle::CloseReport;
pub use retention::prune_expired;
pub use run::{EXIT_ALREADY_RUNNING, EXIT_FAILURE, RunReport, execute, run};
pub use sink::{LogHub, RunWriter, Stream};

use crate::config::RunOptions;
use crate::error::{CrashLockError, Error, Result};
use crate::mailer::Mailer;
use crate::pool::{InitFn, PoolSettings, WaitOptions, WorkerPool, resolve_process_count};
use crate::types::{ErrorValue, RunState};
use crate::utils::{ensure_writable_dir, unique_description, with_stem_suffix};
use chrono::{DateTime, Local};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Every path a run writes to
#[derive(Debug, Clone)]
pub struct RunPaths {
    /// Log home folder
    pub home: PathBuf,
    /// `<home>/<nickname>_Errors`
    pub error_dir: PathBuf,
    /// Monthly Archive log
    pub archive: PathBuf,
    /// Activity log of this run
    pub activity: PathBuf,
    /// Error log of this run
    pub error_log: PathBuf,
    /// Monthly notification log
    pub mail_log: PathBuf,
    /// Crash lock file
    pub lock: PathBuf,
}

impl RunPaths {
    /// Paths for `nickname` in `home` for a run started at `start`
    pub fn new(home: &Path, nickname: &str, start: DateTime<Local>) -> Self {
        let error_dir = home.join(format!("{nickname}_Errors"));
        Self {
            home: home.to_path_buf(),
            archive: home.join(format!("{nickname}_{}.txt", start.format("%Y%m"))),
            activity: home.join(format!("{nickname}_LastRun.txt")),
            error_log: error_dir.join(format!("{}.txt", start.format("%Y%m%d_%H%M%S"))),
            mail_log: home.join(format!("{nickname}_EmailLog_{}.txt", start.format("%Y%m"))),
            lock: error_dir.join(LOCK_FILE_NAME),
            error_dir,
        }
    }
}

#[derive(Debug)]
struct Session {
    state: RunState,
    error: Option<ErrorValue>,
    flag: Option<String>,
}

/// Logs, crash lock, pools and notification state of one run
pub struct RunLogger {
    options: RunOptions,
    paths: RunPaths,
    hub: LogHub,
    crash_lock: Mutex<Option<CrashLock>>,
    parallel: bool,
    premature: Option<String>,
    start: DateTime<Local>,
    started: Instant,
    session: Mutex<Session>,
    pools: Mutex<Vec<Arc<WorkerPool>>>,
    next_worker: AtomicUsize,
    details: DetailStore,
    mailer: Mailer,
    env: EnvOverlay,
    closed: AtomicBool,
    report: tokio::sync::OnceCell<CloseReport>,
}

impl RunLogger {
    /// Start a run
    ///
    /// Fails with [`CrashLockError::AlreadyRunning`] before touching any log
    /// when `singleton` is set and another run holds the crash lock.
    pub async fn open(mut options: RunOptions) -> Result<Self> {
        let start = Local::now();
        let started = Instant::now();
        if options.nickname.trim().is_empty() {
            return Err(Error::config("nickname", "a job nickname is required"));
        }
        ensure_writable_dir(&options.home).map_err(|e| Error::LogPath {
            path: options.home.clone(),
            reason: e.to_string(),
        })?;
        let env = EnvOverlay::load(&options.home, &options.nickname);
        options.apply_env_with(|key| env.get(key))?;

        let mut paths = RunPaths::new(&options.home, &options.nickname, start);
        ensure_writable_dir(&paths.error_dir).map_err(|e| Error::LogPath {
            path: paths.error_dir.clone(),
            reason: e.to_string(),
        })?;

        let (crash_lock, stale, parallel) = match CrashLock::acquire(&paths.lock)? {
            LockAcquire::Acquired { lock, stale } => (Some(lock), stale, false),
            LockAcquire::Held if options.singleton => {
                return Err(CrashLockError::AlreadyRunning {
                    nickname: options.nickname.clone(),
                    path: paths.lock.clone(),
                }
                .into());
            }
            LockAcquire::Held => (None, None, true),
        };

        let hub = match open_logs(&mut paths, &options) {
            Ok(hub) => hub,
            Err(e) => {
                if let Some(lock) = crash_lock {
                    lock.release(1, Duration::ZERO).await.ok();
                }
                return Err(e);
            }
        };

        let mailer = Mailer::new(options.mail.clone(), &options.nickname);
        let details = DetailStore::new(&options.home, &options.nickname);
        let mut logger = Self {
            paths,
            hub,
            crash_lock: Mutex::new(crash_lock),
            parallel,
            premature: None,
            start,
            started,
            session: Mutex::new(Session {
                state: RunState::Running,
                error: None,
                flag: None,
            }),
            pools: Mutex::new(Vec::new()),
            next_worker: AtomicUsize::new(1),
            details,
            mailer,
            env,
            closed: AtomicBool::new(false),
            report: tokio::sync::OnceCell::new(),
            options,
        };

        logger.archive(&format!("Started (pid {})", std::process::id()), false)?;
        for source in logger.env.sources() {
            logger.log(&format!("Environment overrides read from {}", source.display()))?;
        }
        if logger.parallel {
            logger.archive(
                "Another run of this job holds the crash lock; running in parallel without it",
                true,
            )?;
        }
        if let Some(stale) = stale {
            logger.premature = Some(logger.recover_premature_exit(&stale)?);
        }

        let pruned = prune_expired(
            &logger.paths.home,
            &logger.paths.error_dir,
            &logger.options.nickname,
            logger.options.retention_months,
            logger.start.date_naive(),
        );
        for name in pruned {
            logger.log(&format!("Deleted expired log {name}"))?;
        }
        Ok(logger)
    }

    /// Record what a crashed run left behind; returns a description
    fn recover_premature_exit(&self, stale: &StaleLock) -> Result<String> {
        let when = crash_lock::stale_started(stale).unwrap_or_else(|| "unknown time".to_string());
        let stamp = stale
            .modified
            .unwrap_or(self.start)
            .format("%Y%m%d_%H%M%S")
            .to_string();
        let report_path = self.paths.error_dir.join(format!("{stamp}_PreMatureExit.txt"));
        let mut report = OpenOptions::new().create(true).append(true).open(&report_path)?;
        writeln!(report, "Previous run did not close: {}", stale.contents)?;

        let mut fragments: Vec<PathBuf> = std::fs::read_dir(&self.paths.error_dir)?
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .is_some_and(|name| name.to_string_lossy().contains("_wpID-"))
            })
            .collect();
        fragments.sort();
        for fragment in &fragments {
            let bytes = std::fs::read(fragment)?;
            report.write_all(&bytes)?;
            std::fs::remove_file(fragment)?;
        }

        let description = format!("previous run started {when} exited prematurely");
        self.archive(
            &format!(
                "Premature exit detected: {description}; {} worker log(s) merged into {}",
                fragments.len(),
                report_path.display()
            ),
            true,
        )?;
        Ok(description)
    }

    /// Job nickname
    pub fn nickname(&self) -> &str {
        &self.options.nickname
    }

    /// Options in effect after environment overrides
    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    /// File locations of this run
    pub fn paths(&self) -> &RunPaths {
        &self.paths
    }

    /// Shared sink over this run's logs
    pub fn hub(&self) -> &LogHub {
        &self.hub
    }

    /// Writer through the sink for one console stream
    pub fn writer(&self, stream: Stream) -> RunWriter {
        self.hub.writer(stream)
    }

    /// When the run started
    pub fn start_time(&self) -> DateTime<Local> {
        self.start
    }

    /// Time since the run started
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Whether another run held the crash lock at startup
    pub fn is_parallel(&self) -> bool {
        self.parallel
    }

    /// Description of the previous run's premature exit, if one was found
    pub fn premature_exit(&self) -> Option<&str> {
        self.premature.as_deref()
    }

    /// Variable from the override files or the process environment
    pub fn env(&self, key: &str) -> Option<String> {
        self.env.get(key)
    }

    /// Send tracing output of the whole process through this run's sink
    ///
    /// Returns false when a global subscriber was already installed.
    pub fn install_tracing(&self) -> bool {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(self.hub.clone())
            .with_ansi(false)
            .with_target(false)
            .try_init()
            .is_ok()
    }

    /// Append a dated line to the Archive log
    pub fn archive(&self, message: &str, echo: bool) -> Result<()> {
        self.hub.archive(message, echo)?;
        Ok(())
    }

    /// Append a line to the Activity log
    pub fn log(&self, message: &str) -> Result<()> {
        self.hub.log(message)?;
        Ok(())
    }

    /// Mark the run failed; the first error value is kept
    pub fn set_error(&self, message: impl Into<String>) {
        self.set_error_value(ErrorValue::raised(message));
    }

    pub(crate) fn set_error_value(&self, value: ErrorValue) {
        let line = format!("ERROR: {value}\n");
        let mut session = lock(&self.session);
        if session.error.is_none() {
            session.error = Some(value);
        }
        drop(session);
        if let Err(e) = self.hub.write_sink(line.as_bytes(), Stream::Stderr) {
            tracing::warn!(error = %e, "cannot write error to run log");
        }
    }

    /// Clear a previously set error value
    pub fn reset_error(&self) {
        lock(&self.session).error = None;
    }

    /// Raise a caution flag: counted, but the run stays successful
    pub fn set_flag(&self, message: impl Into<String>) {
        let message = message.into();
        if let Err(e) = self.hub.log(&format!("CAUTION: {message}")) {
            tracing::warn!(error = %e, "cannot write caution flag to run log");
        }
        lock(&self.session).flag.get_or_insert(message);
    }

    /// Current error value
    pub fn error(&self) -> Option<ErrorValue> {
        lock(&self.session).error.clone()
    }

    /// Current lifecycle state
    pub fn state(&self) -> RunState {
        lock(&self.session).state
    }

    /// Record how the driving code ended
    pub(crate) fn record_exit(&self, state: RunState, error: Option<ErrorValue>) {
        let mut session = lock(&self.session);
        session.state = state;
        if session.error.is_none() {
            session.error = error;
        }
    }

    /// Typed detail stored under `key` in the details file
    pub fn load_detail<T: DeserializeOwned + Default>(&self, key: &str) -> T {
        self.details.load_detail(key)
    }

    /// Persist a detail under `key` in the details file
    pub fn save_detail<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        self.details.save_detail(key, value)
    }

    /// Start a worker pool whose workers log into this run
    ///
    /// `processes` follows [`resolve_process_count`]. Descriptions are made
    /// unique by suffixing `_2`, `_3`, ...
    pub fn create_worker_pool(
        &self,
        description: &str,
        processes: f64,
        init: Option<InitFn>,
    ) -> Result<Arc<WorkerPool>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Multiprocessing {
                pool: description.to_string(),
                reason: "the run is closed".to_string(),
            });
        }
        let mut pools = lock(&self.pools);
        let description = unique_description(description, pools.iter().map(|p| p.description()));
        let processes = resolve_process_count(processes);
        let first_worker = self.next_worker.fetch_add(processes, Ordering::SeqCst);
        let pool = WorkerPool::start(PoolSettings {
            description,
            processes,
            init,
            log_base: Some(self.paths.error_log.clone()),
            first_worker,
            hub: Some(self.hub.clone()),
        })?;
        self.hub
            .log(&format!("Worker pool '{}' started with {processes} workers", pool.description()))?;
        pools.push(pool.clone());
        Ok(pool)
    }

    /// Wait for every pool of this run
    pub async fn wait_for_workers(&self, options: WaitOptions) -> Result<bool> {
        let pools = lock(&self.pools).clone();
        crate::pool::wait_for_workers(&pools, options).await
    }

    /// Pools created by this run
    pub fn pools(&self) -> Vec<Arc<WorkerPool>> {
        lock(&self.pools).clone()
    }
}

fn open_logs(paths: &mut RunPaths, options: &RunOptions) -> Result<LogHub> {
    let log_path_error = |path: &Path, e: std::io::Error| Error::LogPath {
        path: path.to_path_buf(),
        reason: e.to_string(),
    };
    let archive = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&paths.archive)
        .map_err(|e| log_path_error(&paths.archive, e))?;
    let activity = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&paths.activity)
        .map_err(|e| log_path_error(&paths.activity, e))?;

    // runs started in the same second get `_2`, `_3`, ...
    let base = paths.error_log.clone();
    let mut attempt = 1;
    let error = loop {
        match OpenOptions::new().write(true).create_new(true).open(&paths.error_log) {
            Ok(file) => break file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists && attempt < 100 => {
                attempt += 1;
                paths.error_log = with_stem_suffix(&base, &format!("_{attempt}"));
            }
            Err(e) => return Err(log_path_error(&paths.error_log, e)),
        }
    };

    Ok(LogHub::new(
        archive,
        activity,
        error,
        options.echo,
        options.timestamp_mask.clone(),
    ))
}

#[cfg(test)]
mod tests;
