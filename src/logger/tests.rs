// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::*;
use crate::types::MailState;
use std::path::Path;

fn options(home: &Path, nickname: &str) -> RunOptions {
    let mut options = RunOptions::new(nickname, home);
    options.echo = false;
    options
}

#[tokio::test]
async fn clean_run_deletes_its_error_log() {
    let temp = tempfile::tempdir().unwrap();
    let logger = RunLogger::open(options(temp.path(), "clean")).await.unwrap();
    let paths = logger.paths().clone();
    assert!(paths.error_log.exists());
    assert!(paths.lock.exists());

    logger.log("working").unwrap();
    let report = logger.close().await;

    assert_eq!(report.mail_state, MailState::Success);
    assert!(report.error.is_none());
    assert!(report.error_log.is_none());
    assert!(!paths.error_log.exists());
    assert!(!paths.lock.exists());
    assert_eq!(logger.state(), RunState::Closed);

    let activity = std::fs::read_to_string(&paths.activity).unwrap();
    assert!(activity.contains("working"));
    assert!(activity.contains("Finished: "));
    let archive = std::fs::read_to_string(&paths.archive).unwrap();
    assert!(archive.contains("Started (pid"));
    assert!(archive.contains("Succeeded (Elapsed:"));
}

#[tokio::test]
async fn keep_activity_renames_the_error_log() {
    let temp = tempfile::tempdir().unwrap();
    let mut opts = options(temp.path(), "keeper");
    opts.keep_activity = true;
    let logger = RunLogger::open(opts).await.unwrap();
    let error_log = logger.paths().error_log.clone();
    logger.hub().write_sink(b"visible output\n", Stream::Stdout).unwrap();

    let report = logger.close().await;
    let kept = report.error_log.expect("activity copy");
    assert!(!error_log.exists());
    assert!(kept.to_string_lossy().ends_with("_activity.txt"));
    assert_eq!(std::fs::read_to_string(kept).unwrap(), "visible output\n");
}

#[tokio::test]
async fn failed_run_keeps_error_log_and_counts_failure() {
    let temp = tempfile::tempdir().unwrap();
    let logger = RunLogger::open(options(temp.path(), "failing")).await.unwrap();
    logger.set_error("tile h12v04 missing");
    logger.set_error("second error is ignored");

    let report = logger.close().await;
    assert_eq!(report.mail_state, MailState::Failure);
    assert_eq!(report.error.unwrap().message, "tile h12v04 missing");
    let error_log = report.error_log.expect("error log kept");
    let text = std::fs::read_to_string(error_log).unwrap();
    assert!(text.contains("ERROR: tile h12v04 missing"));

    let detail: MailDetail = DetailStore::new(temp.path(), "failing").load_detail(EMAIL_SECTION);
    assert_eq!(detail.consecutive_failures, 1);
    assert_eq!(detail.day.failures, 1);
    assert_eq!(detail.last_state, MailState::Failure);
}

#[tokio::test]
async fn reset_error_restores_success() {
    let temp = tempfile::tempdir().unwrap();
    let logger = RunLogger::open(options(temp.path(), "reset")).await.unwrap();
    logger.set_error("transient");
    logger.reset_error();
    assert!(logger.error().is_none());
    assert_eq!(logger.close().await.mail_state, MailState::Success);
}

#[tokio::test]
async fn caution_flag_is_counted_without_failing() {
    let temp = tempfile::tempdir().unwrap();
    let logger = RunLogger::open(options(temp.path(), "flagged")).await.unwrap();
    logger.set_flag("only 3 of 4 tiles were updated");
    let report = logger.close().await;
    assert!(report.error.is_none());

    let detail: MailDetail = DetailStore::new(temp.path(), "flagged").load_detail(EMAIL_SECTION);
    assert_eq!(detail.day.flags, 1);
    assert_eq!(detail.consecutive_failures, 0);
}

#[tokio::test]
async fn singleton_refuses_second_run_before_opening_logs() {
    let temp = tempfile::tempdir().unwrap();
    let first = RunLogger::open(options(temp.path(), "single")).await.unwrap();

    let mut second = options(temp.path(), "single");
    second.singleton = true;
    let err = RunLogger::open(second).await.err().unwrap();
    assert!(matches!(
        err,
        Error::CrashLock(CrashLockError::AlreadyRunning { .. })
    ));
    let logs = std::fs::read_dir(&first.paths().error_dir).unwrap().count();
    // the first run's error log and the lock
    assert_eq!(logs, 2);
    first.close().await;
}

#[tokio::test]
async fn non_singleton_runs_in_parallel() {
    let temp = tempfile::tempdir().unwrap();
    let first = RunLogger::open(options(temp.path(), "multi")).await.unwrap();
    let second = RunLogger::open(options(temp.path(), "multi")).await.unwrap();
    assert!(!first.is_parallel());
    assert!(second.is_parallel());
    second.close().await;
    assert!(first.paths().lock.exists(), "parallel run must not remove the lock");
    first.close().await;
    assert!(!first.paths().lock.exists());
}

#[tokio::test]
async fn leftover_lock_reports_premature_exit() {
    let temp = tempfile::tempdir().unwrap();
    let error_dir = temp.path().join("crashy_Errors");
    std::fs::create_dir_all(&error_dir).unwrap();
    std::fs::write(
        error_dir.join(LOCK_FILE_NAME),
        "started 2024-03-01 02:00:00 pid 4242\n",
    )
    .unwrap();
    std::fs::write(
        error_dir.join("20240301_020000_wpID-3.txt"),
        "worker 3 was busy\n",
    )
    .unwrap();

    let logger = RunLogger::open(options(temp.path(), "crashy")).await.unwrap();
    let premature = logger.premature_exit().unwrap().to_string();
    assert!(premature.contains("2024-03-01 02:00:00"));
    assert!(!error_dir.join("20240301_020000_wpID-3.txt").exists());

    let report_file = std::fs::read_dir(&error_dir)
        .unwrap()
        .flatten()
        .map(|e| e.path())
        .find(|p| p.to_string_lossy().ends_with("_PreMatureExit.txt"))
        .expect("premature exit report");
    let text = std::fs::read_to_string(report_file).unwrap();
    assert!(text.contains("pid 4242"));
    assert!(text.contains("worker 3 was busy"));

    let report = logger.close().await;
    assert_eq!(report.mail_state, MailState::PrematureExit);
    assert!(report.error.is_none());
    let archive = std::fs::read_to_string(&logger.paths().archive).unwrap();
    assert!(archive.contains("Premature exit detected"));
}

#[tokio::test]
async fn close_is_idempotent() {
    let temp = tempfile::tempdir().unwrap();
    let logger = RunLogger::open(options(temp.path(), "twice")).await.unwrap();
    let first = logger.close().await;
    let second = logger.close().await;
    assert_eq!(first.elapsed, second.elapsed);

    let archive = std::fs::read_to_string(&logger.paths().archive).unwrap();
    assert_eq!(archive.matches("Succeeded").count(), 1);
    let detail: MailDetail = logger.load_detail(EMAIL_SECTION);
    assert_eq!(detail.day.runs(), 1);
}

#[tokio::test]
async fn pools_log_into_the_run_and_close_with_it() {
    let temp = tempfile::tempdir().unwrap();
    let logger = RunLogger::open(options(temp.path(), "pooled")).await.unwrap();
    let pool = logger.create_worker_pool("tiles", 2.0, None).unwrap();
    let again = logger.create_worker_pool("tiles", 1.0, None).unwrap();
    assert_eq!(again.description(), "tiles_2");

    for n in 0..4 {
        pool.submit(move |ctx| async move {
            ctx.log(&format!("tile {n} done"));
            Ok(())
        })
        .unwrap();
    }
    assert!(logger.wait_for_workers(WaitOptions::default()).await.unwrap());
    assert_eq!(pool.state(), crate::types::PoolState::Closed);

    let activity_path = logger.paths().activity.clone();
    logger.close().await;
    let activity = std::fs::read_to_string(activity_path).unwrap();
    for n in 0..4 {
        assert!(activity.contains(&format!("tile {n} done")));
    }
    assert!(activity.contains("Pool 'tiles' CLOSED"));
    assert!(activity.contains("Pool 'tiles_2' CLOSED"));
}

#[tokio::test]
async fn details_round_trip_through_the_logger() {
    let temp = tempfile::tempdir().unwrap();
    let logger = RunLogger::open(options(temp.path(), "detail")).await.unwrap();
    logger
        .save_detail("last_tile", &serde_json::json!({"id": "h12v04"}))
        .unwrap();
    let value: serde_json::Value = logger.load_detail("last_tile");
    assert_eq!(value["id"], "h12v04");
    logger.close().await;
}

#[tokio::test]
async fn override_file_changes_options() {
    let temp = tempfile::tempdir().unwrap();
    std::fs::write(temp.path().join("env.env"), "ALFlog_KeepActivity=1\n").unwrap();
    let logger = RunLogger::open(options(temp.path(), "env")).await.unwrap();
    assert!(logger.options().keep_activity);
    let report = logger.close().await;
    assert!(report.error_log.is_some());
}

#[test]
fn run_paths_follow_naming_scheme() {
    use chrono::TimeZone;
    let start = Local.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
    let paths = RunPaths::new(Path::new("/logs"), "nightly", start);
    assert_eq!(paths.archive, Path::new("/logs/nightly_202401.txt"));
    assert_eq!(paths.activity, Path::new("/logs/nightly_LastRun.txt"));
    assert_eq!(
        paths.error_log,
        Path::new("/logs/nightly_Errors/20240102_030405.txt")
    );
    assert_eq!(paths.mail_log, Path::new("/logs/nightly_EmailLog_202401.txt"));
    assert_eq!(
        paths.lock,
        Path::new("/logs/nightly_Errors/PreMatureExitDetection.tmp")
    );
}
