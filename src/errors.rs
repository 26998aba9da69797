//! Typed error hierarchy for the Waypoint orchestrator.
//!
//! Two top-level enums cover the two subsystems that surface errors to
//! callers:
//! - `StoreError` — persisted document read/write failures
//! - `OrchestratorError` — feature queue loop failures
//!
//! The augmenting engines (checkpoint, impact, context) never return errors
//! to the loop; each degrades to a documented default instead.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from the persistence layer (blackboard and JSON documents).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to read {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize document for {path}: {source}")]
    SerializeFailed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors from the feature queue orchestrator.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Feature list not found at {path}")]
    MissingFeatureList { path: PathBuf },

    #[error("Invalid feature list at {path}: {source}")]
    InvalidFeatureList {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
