//! Feature descriptors and the persisted feature list document.

use crate::errors::OrchestratorError;
use crate::store;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use uuid::Uuid;

/// Lifecycle states for a feature. The terminal states are never left.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureStatus {
    #[default]
    Pending,
    InProgress,
    Passed,
    Failed,
    Skipped,
}

impl FeatureStatus {
    /// Passed, failed, and skipped are terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Passed | Self::Failed | Self::Skipped)
    }
}

/// One unit of delegated work.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Feature {
    /// Stable identifier, assigned at load when the document omits one.
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub status: FeatureStatus,
    /// Paths this feature is expected to touch.
    #[serde(default)]
    pub files: Vec<String>,
    /// Ids of features this one depends on.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Ids of features expected to be affected by this one.
    #[serde(default)]
    pub affected_features: Vec<String>,
    /// Free-text description of intent and interface.
    #[serde(default)]
    pub spec: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
}

impl Feature {
    /// Blast radius: how many other features depend on or are affected by
    /// this one.
    pub fn blast_radius(&self) -> usize {
        self.dependencies.len() + self.affected_features.len()
    }
}

/// The persisted feature queue, rewritten after every status mutation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureList {
    #[serde(default)]
    pub features: Vec<Feature>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_feature_id: Option<String>,
}

impl FeatureList {
    /// Load the feature list document, assigning ids to features that have
    /// none yet.
    pub fn load(path: &Path) -> Result<Self, OrchestratorError> {
        if !path.exists() {
            return Err(OrchestratorError::MissingFeatureList {
                path: path.to_path_buf(),
            });
        }
        let content = fs::read_to_string(path).map_err(|e| {
            OrchestratorError::Other(anyhow::Error::new(e).context("Failed to read feature list"))
        })?;
        let mut list: FeatureList =
            serde_json::from_str(&content).map_err(|source| OrchestratorError::InvalidFeatureList {
                path: path.to_path_buf(),
                source,
            })?;
        for feature in &mut list.features {
            if feature.id.is_empty() {
                feature.id = format!("feat-{}", Uuid::new_v4());
            }
        }
        Ok(list)
    }

    /// Persist the list, stamping `updatedAt`.
    pub fn save(&mut self, path: &Path) -> Result<(), OrchestratorError> {
        self.updated_at = Some(chrono::Utc::now().timestamp_millis());
        store::write_json(path, self)?;
        Ok(())
    }

    /// Index of the first pending feature in list order (FIFO).
    pub fn next_pending(&self) -> Option<usize> {
        self.features
            .iter()
            .position(|f| f.status == FeatureStatus::Pending)
    }

    /// All features still pending, in list order.
    pub fn pending(&self) -> Vec<Feature> {
        self.features
            .iter()
            .filter(|f| f.status == FeatureStatus::Pending)
            .cloned()
            .collect()
    }

    /// Whether every feature in `category` has reached a terminal status.
    pub fn category_terminal(&self, category: &str) -> bool {
        let mut any = false;
        for f in self.features.iter().filter(|f| f.category == category) {
            any = true;
            if !f.status.is_terminal() {
                return false;
            }
        }
        any
    }
}
