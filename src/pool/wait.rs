use super::WorkerPool;
use crate::error::{Error, Result};
use crate::types::PoolState;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How often [`wait_for_workers`] samples the pools
pub const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Options for [`wait_for_workers`]
#[derive(Debug, Clone, Copy)]
pub struct WaitOptions {
    /// Fail when no pool makes progress for this long (None = wait forever)
    pub timeout: Option<Duration>,
    /// Fail when a worker of a running pool has died; otherwise it is only logged
    pub detect_exceptions: bool,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            detect_exceptions: true,
        }
    }
}

#[derive(Debug, PartialEq)]
struct Progress {
    submitted: u64,
    completed: u64,
    in_flight: usize,
    percent: u64,
}

/// Wait until every pool has finished its submitted work
///
/// Pools with nothing left are closed as they drain. Returns `Ok(false)`
/// when a terminated pool still had outstanding work, `Ok(true)` otherwise.
pub async fn wait_for_workers(pools: &[Arc<WorkerPool>], options: WaitOptions) -> Result<bool> {
    let mut interval = tokio::time::interval(WAIT_POLL_INTERVAL);
    let mut last_progress: Option<Vec<Progress>> = None;
    let mut progressed_at = Instant::now();

    loop {
        interval.tick().await;

        let mut all_done = true;
        let mut lost_work = false;
        let mut progress = Vec::with_capacity(pools.len());
        for pool in pools {
            if options.detect_exceptions {
                pool.check_workers()?;
            } else {
                pool.dead_workers();
            }
            let stats = pool.stats();
            match stats.state {
                PoolState::Terminated => {
                    lost_work |= stats.remaining() > 0;
                    continue;
                }
                PoolState::Closed => continue,
                PoolState::Running | PoolState::Closing => {}
            }
            if stats.remaining() == 0 {
                pool.close().await?;
                continue;
            }
            all_done = false;
            progress.push(Progress {
                submitted: stats.submitted,
                completed: stats.completed,
                in_flight: pool.in_flight(),
                percent: stats.percent_complete() as u64,
            });
        }

        if all_done {
            return Ok(!lost_work);
        }

        if last_progress.as_ref() != Some(&progress) {
            last_progress = Some(progress);
            progressed_at = Instant::now();
        } else if let Some(limit) = options.timeout
            && progressed_at.elapsed() >= limit
        {
            let names: Vec<&str> = pools.iter().map(|p| p.description()).collect();
            return Err(Error::Timeout {
                what: format!("worker pools {names:?} made no progress"),
                seconds: limit.as_secs(),
            });
        }
    }
}
