//! Environment override files read at startup
//!
//! `ALFlib.env` (shared by every job) and `<nickname>.env` in the home folder
//! use dotenv syntax. Their variables form an overlay consulted before the
//! process environment; `KEY=` in a file hides the process value.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Name of the override file shared by every job
pub const GLOBAL_ENV_FILE: &str = "ALFlib.env";

/// Variables loaded from override files
#[derive(Debug, Clone, Default)]
pub struct EnvOverlay {
    vars: HashMap<String, Option<String>>,
    sources: Vec<PathBuf>,
}

impl EnvOverlay {
    /// Read the global and nickname override files from `home`
    ///
    /// Later files win. A missing file is skipped; an unreadable line is
    /// logged and skipped.
    pub fn load(home: &Path, nickname: &str) -> Self {
        let mut overlay = Self::default();
        for path in [
            home.join(GLOBAL_ENV_FILE),
            home.join(format!("{nickname}.env")),
        ] {
            overlay.read_file(&path);
        }
        overlay
    }

    fn read_file(&mut self, path: &Path) {
        let iter = match dotenvy::from_path_iter(path) {
            Ok(iter) => iter,
            Err(e) if e.not_found() => return,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "cannot read override file");
                return;
            }
        };
        for item in iter {
            match item {
                Ok((key, value)) => {
                    let value = (!value.is_empty()).then_some(value);
                    self.vars.insert(key, value);
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping override line");
                }
            }
        }
        self.sources.push(path.to_path_buf());
    }

    /// Files that contributed variables
    pub fn sources(&self) -> &[PathBuf] {
        &self.sources
    }

    /// Value of `key`: overlay first, then the process environment
    pub fn get(&self, key: &str) -> Option<String> {
        match self.vars.get(key) {
            Some(value) => value.clone(),
            None => std::env::var(key).ok(),
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn nickname_file_overrides_global_file() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::write(
            temp.path().join(GLOBAL_ENV_FILE),
            "ALFmail_Server=smtp.global\nALFlog_Echo=1\n",
        )
        .unwrap();
        std::fs::write(temp.path().join("nightly.env"), "ALFmail_Server=smtp.job\n").unwrap();

        let overlay = EnvOverlay::load(temp.path(), "nightly");
        assert_eq!(overlay.get("ALFmail_Server").as_deref(), Some("smtp.job"));
        assert_eq!(overlay.get("ALFlog_Echo").as_deref(), Some("1"));
        assert_eq!(overlay.sources().len(), 2);
    }

    #[test]
    #[serial]
    fn empty_value_hides_process_variable() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::write(temp.path().join("job.env"), "ALF_TEST_HIDDEN=\n").unwrap();
        // SAFETY: serialized test; no other thread reads this variable
        unsafe { std::env::set_var("ALF_TEST_HIDDEN", "from-process") };

        let overlay = EnvOverlay::load(temp.path(), "job");
        assert_eq!(overlay.get("ALF_TEST_HIDDEN"), None);
        assert_eq!(
            EnvOverlay::default().get("ALF_TEST_HIDDEN").as_deref(),
            Some("from-process")
        );
        unsafe { std::env::remove_var("ALF_TEST_HIDDEN") };
    }

    #[test]
    fn missing_files_give_empty_overlay() {
        let temp = tempfile::tempdir().unwrap();
        let overlay = EnvOverlay::load(temp.path(), "none");
        assert!(overlay.sources().is_empty());
        assert_eq!(overlay.get("ALF_TEST_NEVER_SET"), None);
    }
}
