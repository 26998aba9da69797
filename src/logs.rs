//! Per-feature completion logs.
//!
//! One record per feature id under the logs directory. These records are the
//! sole input to recent-failure risk scoring and context summarization.

use crate::feature::FeatureStatus;
use crate::store;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::SystemTime;

/// Completion record for one feature.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureLog {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub category: String,
    pub status: FeatureStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
    /// Loop iteration this feature completed in.
    #[serde(default)]
    pub iteration: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Flat store of per-feature log records, one JSON file per feature id.
pub struct LogStore {
    dir: PathBuf,
}

impl LogStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Write (or overwrite) the record for a feature.
    pub fn write(&self, log: &FeatureLog) -> Result<(), crate::errors::StoreError> {
        store::write_json(&self.dir.join(format!("{}.json", log.id)), log)
    }

    /// Read the record for a feature id, if present and well-formed.
    pub fn read(&self, feature_id: &str) -> Option<FeatureLog> {
        store::read_json(&self.dir.join(format!("{feature_id}.json")))
    }

    /// The `count` most-recently-modified records, newest first.
    ///
    /// Unreadable entries are skipped; a missing directory reads as empty.
    pub fn recent(&self, count: usize) -> Vec<FeatureLog> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };

        let mut files: Vec<(SystemTime, PathBuf)> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .filter_map(|p| {
                let modified = p.metadata().ok()?.modified().ok()?;
                Some((modified, p))
            })
            .collect();
        files.sort_by(|a, b| b.0.cmp(&a.0));

        files
            .into_iter()
            .take(count)
            .filter_map(|(_, path)| store::read_json(&path))
            .collect()
    }
}
