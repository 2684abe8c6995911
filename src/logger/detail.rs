//! Persisted per-job details (`<nickname>_Details.json`)
//!
//! The document is a JSON object with a numeric `version` and one section
//! per key. Writes go to `~<nickname>_Details.tmp` first and are renamed
//! into place, so a crash mid-write leaves the previous document intact.

use crate::error::Result;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use std::path::{Path, PathBuf};

/// Current document version
pub const DETAIL_VERSION: f64 = 2.0;

/// Section holding the mailer counters
pub const EMAIL_SECTION: &str = "email";

/// Versioned JSON key/value store next to the run logs
#[derive(Debug, Clone)]
pub struct DetailStore {
    path: PathBuf,
    temp: PathBuf,
}

impl DetailStore {
    /// Store for `nickname` in `home`
    pub fn new(home: &Path, nickname: &str) -> Self {
        Self {
            path: home.join(format!("{nickname}_Details.json")),
            temp: home.join(format!("~{nickname}_Details.tmp")),
        }
    }

    /// Path of the JSON document
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the document, upgrading or replacing what cannot be used
    ///
    /// A missing or unparsable file yields an empty current document. An
    /// object without `version` is the old layout and becomes the `email`
    /// section.
    pub fn load_document(&self) -> Map<String, Value> {
        let empty = || {
            let mut doc = Map::new();
            doc.insert("version".into(), json!(DETAIL_VERSION));
            doc
        };
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %self.path.display(), error = %e, "cannot read details, starting fresh");
                }
                return empty();
            }
        };
        match serde_json::from_str::<Value>(&text) {
            Ok(Value::Object(doc)) if doc.contains_key("version") => doc,
            Ok(Value::Object(legacy)) => {
                tracing::info!(path = %self.path.display(), "upgrading unversioned details");
                let mut doc = empty();
                doc.insert(EMAIL_SECTION.into(), Value::Object(legacy));
                doc
            }
            Ok(_) | Err(_) => {
                tracing::warn!(path = %self.path.display(), "details file is damaged, starting fresh");
                empty()
            }
        }
    }

    /// Raw value stored under `key` (`{}` when absent)
    pub fn load_value(&self, key: &str) -> Value {
        self.load_document()
            .remove(key)
            .unwrap_or_else(|| Value::Object(Map::new()))
    }

    /// Typed value stored under `key`; absent or mismatched data gives the default
    pub fn load_detail<T>(&self, key: &str) -> T
    where
        T: DeserializeOwned + Default,
    {
        match serde_json::from_value(self.load_value(key)) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(key, error = %e, "stored detail does not match, using defaults");
                T::default()
            }
        }
    }

    /// Replace the section `key` and write the document atomically
    pub fn save_detail<T>(&self, key: &str, value: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let mut doc = self.load_document();
        doc.insert("version".into(), json!(DETAIL_VERSION));
        doc.insert(key.to_string(), serde_json::to_value(value)?);
        let text = serde_json::to_string_pretty(&Value::Object(doc))?;
        std::fs::write(&self.temp, text)?;
        std::fs::rename(&self.temp, &self.path)?;
        Ok(())
    }
}
