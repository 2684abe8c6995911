//! Pool statistics, process-count resolution and completion estimates

use crate::types::PoolState;
use crate::utils::{format_elapsed, percent_difference};
use chrono::{DateTime, Local, TimeDelta};
use std::time::{Duration, Instant};

/// Resolve a requested process count against the machine's CPU count
///
/// - `0` → all CPUs
/// - negative → `cpus + n`, at least 1
/// - between 0 and 1 → that fraction of the CPUs (floored), at least 1
/// - 1 or more → that many (floored)
pub fn resolve_process_count(requested: f64) -> usize {
    resolve_process_count_for(requested, num_cpus::get())
}

/// [`resolve_process_count`] with an explicit CPU count
pub fn resolve_process_count_for(requested: f64, cpus: usize) -> usize {
    let cpus = cpus.max(1) as i64;
    let resolved = if requested == 0.0 || !requested.is_finite() {
        cpus
    } else if requested < 0.0 {
        cpus + requested.trunc() as i64
    } else if requested < 1.0 {
        (cpus as f64 * requested).floor() as i64
    } else {
        requested.floor() as i64
    };
    resolved.max(1) as usize
}

/// Estimated completion time of a pool's remaining work
///
/// With no completed task the estimate is `now` (unknown). Otherwise the
/// average task time is blended with the time since the last task ended
/// when that is longer, and the remaining batches are projected from the
/// last task end. The estimate never precedes `now`.
pub fn estimated_completion(
    work_remaining: u64,
    processes: usize,
    sum_time: Duration,
    work_completed: u64,
    work_ended: Option<DateTime<Local>>,
    now: DateTime<Local>,
) -> DateTime<Local> {
    let running = (processes as u64).min(work_remaining);
    let Some(work_ended) = work_ended else {
        return now;
    };
    if work_completed == 0 || running == 0 {
        return now;
    }

    let mut avg_time = sum_time.as_secs_f64() / work_completed as f64;
    let process_time = (now - work_ended).to_std().unwrap_or_default().as_secs_f64();
    if process_time >= avg_time {
        avg_time = (process_time + avg_time) / 2.0;
    }
    let batches = work_remaining.div_ceil(running) as f64;
    let projected = TimeDelta::milliseconds((avg_time * batches * 1000.0) as i64);

    (work_ended + projected).max(now)
}

/// Counters for one Worker Pool
///
/// `completed <= submitted` always holds and `remaining()` is their
/// difference. Idle time accrues only while nothing is outstanding.
#[derive(Debug, Clone)]
pub struct PoolStats {
    /// Worker count
    pub processes: usize,
    /// Tasks submitted
    pub submitted: u64,
    /// Tasks finished (successfully or not)
    pub completed: u64,
    /// Tasks finished successfully
    pub succeeded: u64,
    /// Summed task time
    pub sum_time: Duration,
    /// Shortest task
    pub min_time: Option<Duration>,
    /// Longest task
    pub max_time: Duration,
    /// Time with no outstanding work
    pub idle_time: Duration,
    /// When the pool was created
    pub created: Instant,
    /// Wall-clock creation time
    pub created_at: DateTime<Local>,
    /// When the last task ended
    pub last_ended: Option<Instant>,
    /// Wall-clock time the last task ended
    pub last_ended_at: Option<DateTime<Local>>,
    /// Lifecycle state
    pub state: PoolState,
}

impl PoolStats {
    /// Fresh counters for a pool of `processes` workers
    pub fn new(processes: usize) -> Self {
        Self {
            processes,
            submitted: 0,
            completed: 0,
            succeeded: 0,
            sum_time: Duration::ZERO,
            min_time: None,
            max_time: Duration::ZERO,
            idle_time: Duration::ZERO,
            created: Instant::now(),
            created_at: Local::now(),
            last_ended: None,
            last_ended_at: None,
            state: PoolState::Running,
        }
    }

    /// Tasks submitted but not yet finished
    pub fn remaining(&self) -> u64 {
        self.submitted - self.completed
    }

    /// Record a submission; folds idle time when work resumes after a lull
    pub fn on_submit(&mut self, now: Instant) {
        if self.remaining() == 0 {
            let since = self.last_ended.unwrap_or(self.created);
            self.idle_time += now.saturating_duration_since(since);
        }
        self.submitted += 1;
    }

    /// Record a finished task
    pub fn on_complete(&mut self, success: bool, elapsed: Duration, now: Instant) {
        if self.completed >= self.submitted {
            return;
        }
        self.completed += 1;
        if success {
            self.succeeded += 1;
        }
        self.sum_time += elapsed;
        self.min_time = Some(self.min_time.map_or(elapsed, |m| m.min(elapsed)));
        self.max_time = self.max_time.max(elapsed);
        self.last_ended = Some(now);
        self.last_ended_at = Some(Local::now());
    }

    /// Mean task time
    pub fn average(&self) -> Duration {
        if self.completed == 0 {
            return Duration::ZERO;
        }
        self.sum_time.div_f64(self.completed as f64)
    }

    /// Estimated completion of the remaining work
    pub fn estimated_completion(&self, now: DateTime<Local>) -> DateTime<Local> {
        estimated_completion(
            self.remaining(),
            self.processes,
            self.sum_time,
            self.completed,
            self.last_ended_at,
            now,
        )
    }

    /// Percentage of submitted work that has finished
    pub fn percent_complete(&self) -> f64 {
        if self.submitted == 0 {
            return 100.0;
        }
        self.completed as f64 / self.submitted as f64 * 100.0
    }

    /// One-line statistics summary written when the pool is closed
    pub fn summary_line(&self, description: &str) -> String {
        let elapsed = self.created.elapsed();
        format!(
            "Pool '{description}' {}: {} workers, {}/{} tasks succeeded, \
             min {}, max {}, avg {}, idle {}, sum {}, elapsed {} ({:+.1}% busy vs wall)",
            self.state,
            self.processes,
            self.succeeded,
            self.submitted,
            format_elapsed(self.min_time.unwrap_or_default()),
            format_elapsed(self.max_time),
            format_elapsed(self.average()),
            format_elapsed(self.idle_time),
            format_elapsed(self.sum_time),
            format_elapsed(elapsed),
            percent_difference(elapsed, self.sum_time),
        )
    }
}
