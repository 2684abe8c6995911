//! Utility functions for durations, file naming and path handling

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Format a duration as `H:MM:SS.s`, or `M:SS.s` under an hour
///
/// # Examples
///
/// ```
/// use alf_run::utils::format_elapsed;
/// use std::time::Duration;
///
/// assert_eq!(format_elapsed(Duration::from_millis(65_500)), "1:05.5");
/// assert_eq!(format_elapsed(Duration::from_secs(3_725)), "1:02:05.0");
/// ```
pub fn format_elapsed(duration: Duration) -> String {
    let tenths = duration.as_millis() / 100;
    let secs = tenths / 10;
    let (hours, minutes, seconds) = (secs / 3600, (secs / 60) % 60, secs % 60);
    let fraction = tenths % 10;
    if hours > 0 {
        format!("{hours}:{minutes:02}:{seconds:02}.{fraction}")
    } else {
        format!("{minutes}:{seconds:02}.{fraction}")
    }
}

/// Percentage by which `busy` differs from `elapsed`
///
/// Used in pool summaries to show how much wall-clock time was saved (or
/// lost) compared with the summed busy time of all workers.
pub fn percent_difference(elapsed: Duration, busy: Duration) -> f64 {
    let elapsed = elapsed.as_secs_f64();
    if elapsed <= 0.0 {
        return 0.0;
    }
    (busy.as_secs_f64() - elapsed) / elapsed * 100.0
}

/// Make `wanted` unique among `taken` by adding `_2`, `_3`, ...
pub fn unique_description<'a, I>(wanted: &str, taken: I) -> String
where
    I: IntoIterator<Item = &'a str> + Clone,
{
    let is_taken = |name: &str| taken.clone().into_iter().any(|t| t == name);
    if !is_taken(wanted) {
        return wanted.to_string();
    }
    (2..)
        .map(|n| format!("{wanted}_{n}"))
        .find(|candidate| !is_taken(candidate))
        .unwrap_or_else(|| wanted.to_string())
}

/// Insert `suffix` between a file's stem and extension
///
/// `errors/20240102_030405.txt` + `_wpID-7` → `errors/20240102_030405_wpID-7.txt`
pub fn with_stem_suffix(path: &Path, suffix: &str) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{stem}{suffix}.{}", ext.to_string_lossy()),
        None => format!("{stem}{suffix}"),
    };
    path.with_file_name(name)
}

/// Check that `dir` exists (creating it) and accepts new files
pub fn ensure_writable_dir(dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let probe = dir.join(format!(".alf-probe-{}", std::process::id()));
    std::fs::write(&probe, b"")?;
    std::fs::remove_file(&probe)
}
