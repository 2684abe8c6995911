//! Worker Pool: a fixed set of worker tasks fed from one queue
//!
//! Each worker runs an optional initialization function once, then pulls
//! jobs until the queue is closed or the pool is terminated. Task results
//! come back through a [`TaskTicket`]; failures inside a task (errors,
//! panics, an uninitialized worker) are reported as
//! [`TaskOutcome::Failed`] without taking the worker down.
//!
//! Workers write to their own log fragment next to the run's Error log
//! (`<error log stem>_wpID-<id>.<ext>`). Fragments are appended to the
//! Activity and Error logs and deleted when the pool closes.

mod stats;
mod wait;

pub use stats::{PoolStats, estimated_completion, resolve_process_count, resolve_process_count_for};
pub use wait::{WAIT_POLL_INTERVAL, WaitOptions, wait_for_workers};

use crate::error::{Error, Result};
use crate::logger::LogHub;
use crate::types::{PoolState, TaskOutcome};
use crate::utils::with_stem_suffix;
use futures::FutureExt;
use futures::future::BoxFuture;
use std::collections::HashSet;
use std::fs::File;
use std::future::Future;
use std::io::Write;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Per-worker initialization function
pub type InitFn = Arc<dyn Fn(&WorkerContext) -> Result<()> + Send + Sync>;

type Job = Box<dyn FnOnce(WorkerContext) -> BoxFuture<'static, (bool, Duration)> + Send>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Settings for [`WorkerPool::start`]
#[derive(Clone)]
pub struct PoolSettings {
    /// Unique pool description used in logs and errors
    pub description: String,
    /// Number of workers (already resolved, at least 1)
    pub processes: usize,
    /// Initialization run once in every worker
    pub init: Option<InitFn>,
    /// Path the worker fragments are derived from (usually the Error log)
    pub log_base: Option<PathBuf>,
    /// Identifier of the first worker; the rest follow consecutively
    pub first_worker: usize,
    /// Run logs that fragments are merged into on close
    pub hub: Option<LogHub>,
}

impl PoolSettings {
    /// Settings for a pool without run logs
    pub fn new(description: impl Into<String>, processes: usize) -> Self {
        Self {
            description: description.into(),
            processes: processes.max(1),
            init: None,
            log_base: None,
            first_worker: 1,
            hub: None,
        }
    }
}

/// What a task sees of the worker running it
#[derive(Clone)]
pub struct WorkerContext {
    /// Worker identifier, unique within the run
    pub worker: usize,
    /// Description of the owning pool
    pub pool: Arc<str>,
    fragment: Arc<Mutex<Option<File>>>,
    init_error: Option<Arc<str>>,
}

impl WorkerContext {
    /// Append a line to this worker's log fragment
    pub fn log(&self, message: &str) {
        tracing::debug!(worker = self.worker, pool = %self.pool, "{message}");
        let mut fragment = lock(&self.fragment);
        if let Some(file) = fragment.as_mut()
            && let Err(e) = writeln!(file, "[{} worker {}] {message}", self.pool, self.worker)
        {
            tracing::warn!(worker = self.worker, error = %e, "failed to write worker log");
        }
    }

    /// Whether the initialization function succeeded in this worker
    pub fn is_initialized(&self) -> bool {
        self.init_error.is_none()
    }
}

struct WorkerHandle {
    id: usize,
    handle: JoinHandle<()>,
}

/// A pool of worker tasks
pub struct WorkerPool {
    description: String,
    processes: usize,
    sender: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    stats: Arc<Mutex<PoolStats>>,
    in_flight: Arc<AtomicUsize>,
    workers: tokio::sync::Mutex<Vec<WorkerHandle>>,
    finished: Mutex<HashSet<usize>>,
    reported_dead: Mutex<HashSet<usize>>,
    cancel: CancellationToken,
    fragments: Vec<PathBuf>,
    hub: Option<LogHub>,
}

impl WorkerPool {
    /// Spawn the workers; must be called inside a Tokio runtime
    pub fn start(settings: PoolSettings) -> Result<Arc<Self>> {
        let processes = settings.processes.max(1);
        let (sender, receiver) = mpsc::unbounded_channel::<Job>();
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let stats = Arc::new(Mutex::new(PoolStats::new(processes)));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let pool_name: Arc<str> = Arc::from(settings.description.as_str());

        let mut workers = Vec::with_capacity(processes);
        let mut fragments = Vec::new();
        for offset in 0..processes {
            let id = settings.first_worker + offset;
            let fragment = match &settings.log_base {
                Some(base) => {
                    let path = with_stem_suffix(base, &format!("_wpID-{id}"));
                    let file = File::create(&path)?;
                    fragments.push(path);
                    Some(file)
                }
                None => None,
            };
            let mut ctx = WorkerContext {
                worker: id,
                pool: pool_name.clone(),
                fragment: Arc::new(Mutex::new(fragment)),
                init_error: None,
            };
            let init = settings.init.clone();
            let receiver = receiver.clone();
            let stats = stats.clone();
            let in_flight = in_flight.clone();
            let cancel = cancel.clone();

            let handle = tokio::spawn(async move {
                if let Some(init) = init {
                    ctx.init_error = run_init(&init, &ctx).err().map(Arc::from);
                }
                worker_loop(ctx, receiver, stats, in_flight, cancel).await;
            });
            workers.push(WorkerHandle { id, handle });
        }

        tracing::info!(pool = %settings.description, processes, "worker pool started");
        Ok(Arc::new(Self {
            description: settings.description,
            processes,
            sender: Mutex::new(Some(sender)),
            stats,
            in_flight,
            workers: tokio::sync::Mutex::new(workers),
            finished: Mutex::new(HashSet::new()),
            reported_dead: Mutex::new(HashSet::new()),
            cancel,
            fragments,
            hub: settings.hub,
        }))
    }

    /// Pool description
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Worker count
    pub fn processes(&self) -> usize {
        self.processes
    }

    /// Snapshot of the pool counters
    pub fn stats(&self) -> PoolStats {
        lock(&self.stats).clone()
    }

    /// Current lifecycle state
    pub fn state(&self) -> PoolState {
        lock(&self.stats).state
    }

    /// Jobs currently executing
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Queue an async task; the returned ticket yields its outcome
    pub fn submit<F, Fut, T>(&self, task: F) -> Result<TaskTicket<T>>
    where
        F: FnOnce(WorkerContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move |ctx: WorkerContext| {
            async move {
                let start = Instant::now();
                let worker = ctx.worker;
                let result = match ctx.init_error.clone() {
                    Some(reason) => Err(Error::Initialization {
                        worker,
                        reason: reason.to_string(),
                    }
                    .to_string()),
                    None => {
                        let task_ctx = ctx.clone();
                        match AssertUnwindSafe(async move { task(task_ctx).await })
                            .catch_unwind()
                            .await
                        {
                            Ok(Ok(value)) => Ok(value),
                            Ok(Err(e)) => Err(e.to_string()),
                            Err(payload) => Err(format!("panic: {}", panic_message(payload.as_ref()))),
                        }
                    }
                };
                let elapsed = start.elapsed();
                let success = result.is_ok();
                let outcome = match result {
                    Ok(value) => TaskOutcome::Succeeded {
                        worker,
                        value,
                        elapsed,
                    },
                    Err(error) => {
                        ctx.log(&format!("task failed: {error}"));
                        TaskOutcome::Failed {
                            worker,
                            error,
                            elapsed,
                        }
                    }
                };
                // the caller may have dropped its ticket
                tx.send(outcome).ok();
                (success, elapsed)
            }
            .boxed()
        });

        let sender = lock(&self.sender);
        let Some(sender) = sender.as_ref() else {
            return Err(Error::Multiprocessing {
                pool: self.description.clone(),
                reason: format!("pool is {}, no new tasks accepted", self.state()),
            });
        };
        lock(&self.stats).on_submit(Instant::now());
        if sender.send(job).is_err() {
            lock(&self.stats).on_complete(false, Duration::ZERO, Instant::now());
            return Err(Error::Multiprocessing {
                pool: self.description.clone(),
                reason: "all workers have exited".to_string(),
            });
        }
        Ok(TaskTicket {
            pool: self.description.clone(),
            receiver: rx,
        })
    }

    /// Queue a blocking task; it runs on Tokio's blocking thread pool
    pub fn submit_blocking<F, T>(&self, task: F) -> Result<TaskTicket<T>>
    where
        F: FnOnce(WorkerContext) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.submit(move |ctx| async move {
            tokio::task::spawn_blocking(move || task(ctx))
                .await
                .map_err(|e| Error::Other(format!("blocking task failed: {e}")))?
        })
    }

    /// Workers that ended while the pool is running, sorted
    ///
    /// Each newly dead worker is logged once, to tracing and the run log.
    pub fn dead_workers(&self) -> Vec<usize> {
        if self.state() != PoolState::Running {
            return Vec::new();
        }
        if let Ok(workers) = self.workers.try_lock() {
            let dead = workers
                .iter()
                .filter(|w| w.handle.is_finished())
                .map(|w| w.id);
            lock(&self.finished).extend(dead);
        }

        let mut ids: Vec<usize> = lock(&self.finished).iter().copied().collect();
        ids.sort_unstable();
        let mut reported = lock(&self.reported_dead);
        for &id in &ids {
            if reported.insert(id) {
                tracing::error!(pool = %self.description, worker = id, "worker exited abnormally");
                if let Some(hub) = &self.hub {
                    hub.log(&format!("Pool '{}': worker {id} exited abnormally", self.description))
                        .ok();
                }
            }
        }
        ids
    }

    /// Fail if a worker ended while the pool is still running
    ///
    /// Each dead worker is logged once; later calls still fail.
    pub fn check_workers(&self) -> Result<()> {
        let ids = self.dead_workers();
        if ids.is_empty() {
            return Ok(());
        }
        Err(Error::Multiprocessing {
            pool: self.description.clone(),
            reason: format!("worker(s) {ids:?} exited abnormally"),
        })
    }

    /// Stop accepting tasks, let queued work drain, then join the workers
    pub async fn close(&self) -> Result<()> {
        {
            let mut stats = lock(&self.stats);
            if stats.state != PoolState::Running {
                return Ok(());
            }
            stats.state = PoolState::Closing;
        }
        lock(&self.sender).take();
        self.join_workers().await;
        lock(&self.stats).state = PoolState::Closed;
        self.finish()
    }

    /// Abort the workers; queued and running tasks are dropped
    pub async fn terminate(&self) -> Result<()> {
        {
            let mut stats = lock(&self.stats);
            if matches!(stats.state, PoolState::Closed | PoolState::Terminated) {
                return Ok(());
            }
            stats.state = PoolState::Terminated;
        }
        lock(&self.sender).take();
        self.cancel.cancel();
        self.join_workers().await;
        self.finish()
    }

    async fn join_workers(&self) {
        let workers: Vec<WorkerHandle> = self.workers.lock().await.drain(..).collect();
        for worker in workers {
            if let Err(e) = worker.handle.await {
                tracing::error!(pool = %self.description, worker = worker.id, error = %e, "worker ended abnormally");
            }
        }
    }

    /// Log the summary line and merge the worker fragments
    fn finish(&self) -> Result<()> {
        let summary = self.stats().summary_line(&self.description);
        tracing::info!(pool = %self.description, "{summary}");
        if let Some(hub) = &self.hub {
            hub.log(&summary)?;
        }
        merge_fragments(&self.fragments, self.hub.as_ref())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Append fragment files to the run logs and delete them
pub(crate) fn merge_fragments(fragments: &[PathBuf], hub: Option<&LogHub>) -> Result<()> {
    for path in fragments {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        if let Some(hub) = hub
            && !bytes.is_empty()
        {
            hub.append_merged(&bytes)?;
        }
        if let Err(e) = std::fs::remove_file(path) {
            tracing::warn!(path = %path.display(), error = %e, "failed to delete worker log");
        }
    }
    Ok(())
}

fn run_init(init: &InitFn, ctx: &WorkerContext) -> std::result::Result<(), String> {
    let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| init(ctx)));
    let reason = match outcome {
        Ok(Ok(())) => return Ok(()),
        Ok(Err(e)) => e.to_string(),
        Err(payload) => format!("panic: {}", panic_message(payload.as_ref())),
    };
    tracing::error!(worker = ctx.worker, pool = %ctx.pool, "worker initialization failed: {reason}");
    ctx.log(&format!("initialization failed: {reason}"));
    Err(reason)
}

async fn worker_loop(
    ctx: WorkerContext,
    receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Job>>>,
    stats: Arc<Mutex<PoolStats>>,
    in_flight: Arc<AtomicUsize>,
    cancel: CancellationToken,
) {
    loop {
        let job = {
            let mut receiver = receiver.lock().await;
            tokio::select! {
                _ = cancel.cancelled() => None,
                job = receiver.recv() => job,
            }
        };
        let Some(job) = job else {
            break;
        };

        in_flight.fetch_add(1, Ordering::SeqCst);
        let outcome = tokio::select! {
            _ = cancel.cancelled() => None,
            outcome = job(ctx.clone()) => Some(outcome),
        };
        in_flight.fetch_sub(1, Ordering::SeqCst);

        let Some((success, elapsed)) = outcome else {
            break;
        };
        lock(&stats).on_complete(success, elapsed, Instant::now());
    }
    tracing::debug!(worker = ctx.worker, pool = %ctx.pool, "worker stopped");
}

/// Text of a panic payload
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Handle to the outcome of one submitted task
pub struct TaskTicket<T> {
    pool: String,
    receiver: oneshot::Receiver<TaskOutcome<T>>,
}

impl<T> TaskTicket<T> {
    /// Wait for the task; a task dropped by termination reports worker 0
    pub async fn outcome(self) -> TaskOutcome<T> {
        match self.receiver.await {
            Ok(outcome) => outcome,
            Err(_) => TaskOutcome::Failed {
                worker: 0,
                error: format!("task in pool '{}' was dropped before completion", self.pool),
                elapsed: Duration::ZERO,
            },
        }
    }

    /// Wait for the task; a failure becomes [`Error::Multiprocessing`]
    pub async fn result(self) -> Result<T> {
        let pool = self.pool.clone();
        match self.outcome().await {
            TaskOutcome::Succeeded { value, .. } => Ok(value),
            TaskOutcome::Failed { error, .. } => Err(Error::Multiprocessing { pool, reason: error }),
        }
    }
}

#[cfg(test)]
mod tests;
