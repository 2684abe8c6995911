//! Temp files next to the destination
//!
//! A resumable transfer writes to `~<name>_<epoch>_<size>.tmp`, so a later
//! call only appends to it when the remote still has the same modification
//! time and size. Other transfers use `~<name>.tmp` and always start over.

use super::decision::RemoteInfo;
use regex::Regex;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Temp file for `dest`; `resume` names a resumable transfer of that remote
pub fn temp_path(dest: &Path, resume: Option<&RemoteInfo>) -> PathBuf {
    let name = file_name(dest);
    let (modified, size) = resume.map_or((None, None), |r| (r.modified, r.size));
    let temp = match (modified, size) {
        (Some(modified), Some(size)) => format!("~{name}_{}_{size}.tmp", modified.timestamp()),
        _ => format!("~{name}.tmp"),
    };
    dest.with_file_name(temp)
}

/// Length of an existing temp file (0 when missing)
pub fn existing_len(temp: &Path) -> u64 {
    std::fs::metadata(temp).map(|m| m.len()).unwrap_or(0)
}

/// Delete leftover temp files of `dest`; returns the removed paths
pub fn sweep(dest: &Path) -> Vec<PathBuf> {
    let name = file_name(dest);
    let Ok(pattern) = Regex::new(&format!(r"^~{}(?:_\d+_\d+)?\.tmp$", regex::escape(&name)))
    else {
        return Vec::new();
    };
    let dir = match dest.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };

    let mut removed = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        let matched = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| pattern.is_match(n));
        if matched {
            match std::fs::remove_file(&path) {
                Ok(()) => removed.push(path),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "cannot remove leftover temp file"),
            }
        }
    }
    removed
}

/// Move `temp` over `dest` and stamp it with the remote modification time
pub fn finalize(temp: &Path, dest: &Path, modified: Option<SystemTime>) -> io::Result<()> {
    match std::fs::remove_file(dest) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    std::fs::rename(temp, dest)?;
    if let Some(modified) = modified {
        let file = std::fs::OpenOptions::new().write(true).open(dest)?;
        file.set_modified(modified)?;
    }
    Ok(())
}

/// True when both files hold the same bytes
pub fn same_contents(a: &Path, b: &Path) -> io::Result<bool> {
    let (fa, fb) = (File::open(a)?, File::open(b)?);
    if fa.metadata()?.len() != fb.metadata()?.len() {
        return Ok(false);
    }
    let mut ra = BufReader::new(fa);
    let mut rb = BufReader::new(fb);
    let mut ba = [0u8; 8192];
    let mut bb = [0u8; 8192];
    loop {
        let n = ra.read(&mut ba)?;
        if n == 0 {
            return Ok(true);
        }
        rb.read_exact(&mut bb[..n])?;
        if ba[..n] != bb[..n] {
            return Ok(false);
        }
    }
}

fn file_name(dest: &Path) -> String {
    dest.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".to_string())
}
