//! Common test utilities for alf-run integration tests

use alf_run::RunOptions;
use alf_run::logger::{DetailStore, EMAIL_SECTION, MailDetail, PeriodCounter};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Scratch home folder removed when dropped
pub fn scratch_home() -> TempDir {
    tempfile::tempdir().expect("Failed to create temp dir")
}

/// Options that keep the console quiet and never send mail
pub fn quiet_options(home: &Path, nickname: &str) -> RunOptions {
    let mut options = RunOptions::new(nickname, home);
    options.echo = false;
    options.mail.enabled = false;
    options
}

/// Persisted counters of `nickname`
pub fn read_counters(home: &Path, nickname: &str) -> MailDetail {
    DetailStore::new(home, nickname).load_detail(EMAIL_SECTION)
}

/// Seed the persisted counters of `nickname`
#[allow(dead_code)]
pub fn write_counters(home: &Path, nickname: &str, detail: &MailDetail) {
    DetailStore::new(home, nickname)
        .save_detail(EMAIL_SECTION, detail)
        .expect("Failed to seed counters");
}

/// Per-run Error logs currently in the job's error folder
pub fn error_logs(home: &Path, nickname: &str) -> Vec<PathBuf> {
    let dir = home.join(format!("{nickname}_Errors"));
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut logs: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|e| e == "txt"))
        .collect();
    logs.sort();
    logs
}

/// Sum of one field over the period ring
pub fn period_total(detail: &MailDetail, field: fn(&PeriodCounter) -> u32) -> u32 {
    detail.periods.iter().map(field).sum()
}
