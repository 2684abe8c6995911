//! Retention pruning of monthly and per-run logs

use chrono::{Datelike, Months, NaiveDate};
use regex::Regex;
use std::path::Path;

/// First day of the oldest month still kept
fn cutoff(today: NaiveDate, months: u32) -> Option<NaiveDate> {
    today
        .with_day(1)
        .and_then(|first| first.checked_sub_months(Months::new(months)))
}

/// Delete logs older than `months` months; returns the deleted file names
///
/// Monthly Archive (`<nickname>_YYYYMM.txt`) and Mail (`<nickname>_EmailLog_YYYYMM.txt`)
/// logs in `home` are compared by month; per-run Error logs in `error_dir`
/// (`YYYYMMDD_HHMMSS*.txt`) by day. `months == 0` keeps everything.
pub fn prune_expired(
    home: &Path,
    error_dir: &Path,
    nickname: &str,
    months: u32,
    today: NaiveDate,
) -> Vec<String> {
    let Some(cutoff) = (months > 0).then(|| cutoff(today, months)).flatten() else {
        return Vec::new();
    };
    let name = regex::escape(nickname);
    let monthly = Regex::new(&format!(r"^{name}_(?:EmailLog_)?(\d{{4}})(\d{{2}})\.txt$"));
    let per_run = Regex::new(r"^(\d{4})(\d{2})(\d{2})_\d{6}.*\.txt$");
    let (Ok(monthly), Ok(per_run)) = (monthly, per_run) else {
        return Vec::new();
    };

    let mut deleted = Vec::new();
    let number = |caps: &regex::Captures<'_>, i: usize| caps[i].parse::<u32>().unwrap_or(0);
    sweep(home, &monthly, &mut deleted, |caps| {
        let year = number(caps, 1) as i32;
        let month = number(caps, 2);
        (year, month) < (cutoff.year(), cutoff.month())
    });
    sweep(error_dir, &per_run, &mut deleted, |caps| {
        NaiveDate::from_ymd_opt(number(caps, 1) as i32, number(caps, 2), number(caps, 3))
            .is_some_and(|date| date < cutoff)
    });

    if !deleted.is_empty() {
        tracing::info!(count = deleted.len(), "pruned expired logs");
    }
    deleted
}

fn sweep<F>(dir: &Path, pattern: &Regex, deleted: &mut Vec<String>, expired: F)
where
    F: Fn(&regex::Captures<'_>) -> bool,
{
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let file_name = entry.file_name().to_string_lossy().into_owned();
        let Some(caps) = pattern.captures(&file_name) else {
            continue;
        };
        if !expired(&caps) {
            continue;
        }
        match std::fs::remove_file(entry.path()) {
            Ok(()) => deleted.push(file_name),
            Err(e) => tracing::warn!(file = %file_name, error = %e, "cannot delete expired log"),
        }
    }
}
