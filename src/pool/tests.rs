// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::*;
use std::fs::OpenOptions;
use std::sync::atomic::AtomicU32;

fn hub_in(dir: &std::path::Path) -> LogHub {
    let open = |name: &str| {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(name))
            .unwrap()
    };
    LogHub::new(open("archive.txt"), open("activity.txt"), open("error.txt"), false, None)
}

#[tokio::test]
async fn tasks_return_values_tagged_with_worker() {
    let pool = WorkerPool::start(PoolSettings::new("squares", 3)).unwrap();
    let tickets: Vec<_> = (1..=6u64)
        .map(|n| pool.submit(move |_ctx| async move { Ok(n * n) }).unwrap())
        .collect();

    let mut values = Vec::new();
    for ticket in tickets {
        match ticket.outcome().await {
            TaskOutcome::Succeeded { worker, value, .. } => {
                assert!((1..=3).contains(&worker));
                values.push(value);
            }
            TaskOutcome::Failed { error, .. } => panic!("unexpected failure: {error}"),
        }
    }
    values.sort_unstable();
    assert_eq!(values, vec![1, 4, 9, 16, 25, 36]);

    pool.close().await.unwrap();
    let stats = pool.stats();
    assert_eq!(stats.state, PoolState::Closed);
    assert_eq!(stats.submitted, 6);
    assert_eq!(stats.completed, 6);
    assert_eq!(stats.succeeded, 6);
}

#[tokio::test]
async fn task_errors_and_panics_do_not_kill_workers() {
    let pool = WorkerPool::start(PoolSettings::new("fragile", 1)).unwrap();
    let failing = pool
        .submit(|_ctx| async { Err::<(), _>(Error::Other("bad tile".into())) })
        .unwrap();
    let panicking = pool
        .submit(|_ctx| async {
            if true {
                panic!("tile exploded");
            }
            Ok(())
        })
        .unwrap();
    let fine = pool.submit(|_ctx| async { Ok("still alive") }).unwrap();

    let err = failing.result().await.unwrap_err();
    assert!(matches!(err, Error::Multiprocessing { .. }));
    assert!(err.to_string().contains("bad tile"));

    match panicking.outcome().await {
        TaskOutcome::Failed { error, .. } => assert!(error.contains("tile exploded")),
        TaskOutcome::Succeeded { .. } => panic!("panic should fail the task"),
    }
    assert_eq!(fine.result().await.unwrap(), "still alive");
    pool.check_workers().unwrap();

    pool.close().await.unwrap();
    assert_eq!(pool.stats().succeeded, 1);
    assert_eq!(pool.stats().completed, 3);
}

#[tokio::test]
async fn failed_initialization_fails_tasks_fast() {
    let mut settings = PoolSettings::new("no-init", 2);
    let init: InitFn = Arc::new(|ctx: &WorkerContext| {
        if ctx.worker == 1 {
            Err(Error::Other("database unreachable".into()))
        } else {
            Ok(())
        }
    });
    settings.init = Some(init);
    let pool = WorkerPool::start(settings).unwrap();

    let mut failed_on_one = 0;
    let tickets: Vec<_> = (0..20)
        .map(|_| {
            pool.submit(|ctx| async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok(ctx.worker)
            })
            .unwrap()
        })
        .collect();
    for ticket in tickets {
        match ticket.outcome().await {
            TaskOutcome::Succeeded { value, .. } => assert_eq!(value, 2),
            TaskOutcome::Failed { worker, error, .. } => {
                assert_eq!(worker, 1);
                assert!(error.contains("not initialized"));
                assert!(error.contains("database unreachable"));
                failed_on_one += 1;
            }
        }
    }
    assert!(failed_on_one > 0);
    pool.close().await.unwrap();
}

#[tokio::test]
async fn panicking_initialization_is_contained() {
    let mut settings = PoolSettings::new("init-panic", 1);
    let init: InitFn = Arc::new(|_ctx: &WorkerContext| panic!("no licence"));
    settings.init = Some(init);
    let pool = WorkerPool::start(settings).unwrap();

    let outcome = pool.submit(|ctx| async move { Ok(ctx.is_initialized()) }).unwrap().outcome().await;
    match outcome {
        TaskOutcome::Failed { error, .. } => assert!(error.contains("no licence")),
        TaskOutcome::Succeeded { .. } => panic!("uninitialized worker must not run tasks"),
    }
    pool.close().await.unwrap();
}

#[tokio::test]
async fn blocking_tasks_run_off_the_runtime() {
    let pool = WorkerPool::start(PoolSettings::new("blocking", 2)).unwrap();
    let ticket = pool
        .submit_blocking(|ctx| {
            std::thread::sleep(Duration::from_millis(20));
            Ok(ctx.worker)
        })
        .unwrap();
    let worker = ticket.result().await.unwrap();
    assert!((1..=2).contains(&worker));
    pool.close().await.unwrap();
}

#[tokio::test]
async fn closed_pool_rejects_new_tasks() {
    let pool = WorkerPool::start(PoolSettings::new("short", 1)).unwrap();
    pool.close().await.unwrap();
    pool.close().await.unwrap();
    let err = pool.submit(|_ctx| async { Ok(()) }).err().unwrap();
    assert!(err.to_string().contains("CLOSED"));
}

#[tokio::test]
async fn terminate_drops_outstanding_work() {
    let pool = WorkerPool::start(PoolSettings::new("endless", 1)).unwrap();
    let started = Arc::new(AtomicU32::new(0));
    let tickets: Vec<_> = (0..3)
        .map(|_| {
            let started = started.clone();
            pool.submit(move |_ctx| async move {
                started.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            })
            .unwrap()
        })
        .collect();

    while started.load(Ordering::SeqCst) == 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    pool.terminate().await.unwrap();
    assert_eq!(pool.state(), PoolState::Terminated);

    for ticket in tickets {
        let outcome = ticket.outcome().await;
        assert!(!outcome.is_success());
        assert_eq!(outcome.worker(), 0);
    }
    let finished = wait_for_workers(&[pool.clone()], WaitOptions::default()).await.unwrap();
    assert!(!finished, "terminated pool with outstanding work reports false");
}

#[tokio::test]
async fn wait_closes_drained_pools() {
    let a = WorkerPool::start(PoolSettings::new("a", 2)).unwrap();
    let b = WorkerPool::start(PoolSettings::new("b", 1)).unwrap();
    for _ in 0..4 {
        a.submit(|_ctx| async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            Ok(())
        })
        .unwrap();
    }
    b.submit(|_ctx| async { Ok(()) }).unwrap();

    let finished = wait_for_workers(&[a.clone(), b.clone()], WaitOptions::default())
        .await
        .unwrap();
    assert!(finished);
    assert_eq!(a.state(), PoolState::Closed);
    assert_eq!(b.state(), PoolState::Closed);
    assert_eq!(a.stats().completed, 4);
}

#[tokio::test]
async fn wait_times_out_without_progress() {
    let pool = WorkerPool::start(PoolSettings::new("stuck", 1)).unwrap();
    pool.submit(|_ctx| async {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(())
    })
    .unwrap();

    let err = wait_for_workers(
        &[pool.clone()],
        WaitOptions {
            timeout: Some(Duration::from_millis(600)),
            detect_exceptions: true,
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::Timeout { .. }));
    pool.terminate().await.unwrap();
}

async fn kill_first_worker(pool: &WorkerPool) -> usize {
    let id = {
        let workers = pool.workers.lock().await;
        workers[0].handle.abort();
        workers[0].id
    };
    while !pool.workers.lock().await[0].handle.is_finished() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    id
}

#[tokio::test]
async fn dead_worker_is_only_logged_when_not_detecting() {
    let temp = tempfile::tempdir().unwrap();
    let hub = hub_in(temp.path());
    let mut settings = PoolSettings::new("mosaic", 2);
    settings.hub = Some(hub.clone());
    let pool = WorkerPool::start(settings).unwrap();
    let dead = kill_first_worker(&pool).await;

    for _ in 0..4 {
        pool.submit(|_ctx| async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        })
        .unwrap();
    }
    let finished = wait_for_workers(
        &[pool.clone()],
        WaitOptions {
            timeout: None,
            detect_exceptions: false,
        },
    )
    .await
    .unwrap();
    assert!(finished);
    assert_eq!(pool.stats().succeeded, 4);
    hub.close();

    let activity = std::fs::read_to_string(temp.path().join("activity.txt")).unwrap();
    let line = format!("worker {dead} exited abnormally");
    assert_eq!(activity.matches(&line).count(), 1);
}

#[tokio::test]
async fn dead_worker_fails_the_wait_when_detecting() {
    let pool = WorkerPool::start(PoolSettings::new("mosaic", 2)).unwrap();
    let dead = kill_first_worker(&pool).await;
    pool.submit(|_ctx| async {
        tokio::time::sleep(Duration::from_millis(400)).await;
        Ok(())
    })
    .unwrap();

    let err = wait_for_workers(&[pool.clone()], WaitOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Multiprocessing { .. }));
    assert_eq!(pool.dead_workers(), vec![dead]);
    pool.terminate().await.unwrap();
}

#[tokio::test]
async fn worker_fragments_merge_into_run_logs() {
    let temp = tempfile::tempdir().unwrap();
    let hub = hub_in(temp.path());
    let mut settings = PoolSettings::new("tiles", 2);
    settings.log_base = Some(temp.path().join("20240102_030405.txt"));
    settings.first_worker = 5;
    settings.hub = Some(hub.clone());
    let pool = WorkerPool::start(settings).unwrap();

    assert!(temp.path().join("20240102_030405_wpID-5.txt").exists());
    assert!(temp.path().join("20240102_030405_wpID-6.txt").exists());

    pool.submit(|ctx| async move {
        ctx.log("processed tile h12v04");
        Ok(())
    })
    .unwrap()
    .result()
    .await
    .unwrap();
    pool.close().await.unwrap();
    hub.close();

    assert!(!temp.path().join("20240102_030405_wpID-5.txt").exists());
    assert!(!temp.path().join("20240102_030405_wpID-6.txt").exists());
    let activity = std::fs::read_to_string(temp.path().join("activity.txt")).unwrap();
    let error = std::fs::read_to_string(temp.path().join("error.txt")).unwrap();
    assert!(activity.contains("processed tile h12v04"));
    assert!(activity.contains("Pool 'tiles' CLOSED"));
    assert!(error.contains("processed tile h12v04"));
}
