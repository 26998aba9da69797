//! Shared blackboard state store and JSON document helpers.
//!
//! Every engine coordinates through one persisted JSON document (the
//! "blackboard"): reads return the whole document, writes shallow-merge an
//! update set into it and stamp `lastUpdated`. A single mutex guards the
//! read-merge-write cycle, so last-writer-wins holds within one process.
//! Multi-process use of the same project directory is unsupported — there is
//! no file locking.

use crate::errors::StoreError;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Read a JSON document, treating an absent or malformed file as `None`.
///
/// Malformed JSON is logged as a warning and never fatal; callers fall back
/// to their defaults.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    if !path.exists() {
        return None;
    }
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to read document");
            return None;
        }
    };
    match serde_json::from_str(&content) {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "malformed document, treating as absent");
            None
        }
    }
}

/// Write a JSON document, creating parent directories as needed.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| StoreError::WriteFailed {
            path: path.to_path_buf(),
            source,
        })?;
    }
    let json = serde_json::to_string_pretty(value).map_err(|source| StoreError::SerializeFailed {
        path: path.to_path_buf(),
        source,
    })?;
    fs::write(path, json).map_err(|source| StoreError::WriteFailed {
        path: path.to_path_buf(),
        source,
    })
}

/// The shared execution-state document all engines merge updates into.
pub struct StateStore {
    file: PathBuf,
    lock: Mutex<()>,
}

impl StateStore {
    /// Create a store backed by `execution-state.json` under the given
    /// state directory.
    pub fn new(state_dir: &Path) -> Self {
        Self {
            file: state_dir.join("execution-state.json"),
            lock: Mutex::new(()),
        }
    }

    /// Read the current document. Absent or malformed state reads as empty.
    pub fn read(&self) -> Map<String, Value> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.read_unlocked()
    }

    /// Shallow-merge `updates` into the document and persist it, stamping
    /// `lastUpdated` with the current wall clock in milliseconds.
    ///
    /// Keys not present in `updates` are preserved as-is, including keys
    /// this process never wrote.
    pub fn merge(&self, updates: Map<String, Value>) -> Result<(), StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut current = self.read_unlocked();
        for (key, value) in updates {
            current.insert(key, value);
        }
        current.insert(
            "lastUpdated".to_string(),
            Value::from(chrono::Utc::now().timestamp_millis()),
        );
        write_json(&self.file, &Value::Object(current))
    }

    /// Fetch a single key from the document.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.read().get(key).cloned()
    }

    fn read_unlocked(&self) -> Map<String, Value> {
        read_json::<Value>(&self.file)
            .and_then(|v| match v {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .unwrap_or_default()
    }
}
