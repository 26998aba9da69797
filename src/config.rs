//! Runtime configuration and the `.autonomous/` directory layout.

use anyhow::{Context, Result};
use std::path::PathBuf;

/// Default cap on loop iterations.
pub const DEFAULT_MAX_ITERATIONS: u32 = 100;
/// Default delay between loop iterations, in milliseconds.
pub const DEFAULT_ITERATION_DELAY_MS: u64 = 500;

/// Runtime configuration for a Waypoint run.
///
/// All orchestrator artifacts live under `<project>/.autonomous/`:
/// the feature list document, per-feature logs, checkpoint decisions, impact
/// assessments, context ledgers, and the shared state document.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub autonomous_dir: PathBuf,
    pub feature_list_file: PathBuf,
    pub logs_dir: PathBuf,
    pub checkpoints_dir: PathBuf,
    pub impact_dir: PathBuf,
    pub context_dir: PathBuf,
    pub state_dir: PathBuf,
    /// Optional specification file injected into every prompt.
    pub spec_file: Option<PathBuf>,
    /// Command used to reach the execution collaborator.
    pub collaborator_cmd: String,
    pub max_iterations: u32,
    pub pause_on_error: bool,
    pub iteration_delay_ms: u64,
    pub verbose: bool,
}

impl Config {
    /// Build a config rooted at `project_dir`, which must exist.
    pub fn new(project_dir: PathBuf, spec_file: Option<PathBuf>) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let spec_file = match spec_file {
            Some(path) => Some(
                path.canonicalize()
                    .context("Failed to resolve spec file path")?,
            ),
            None => None,
        };

        let autonomous_dir = project_dir.join(".autonomous");
        let collaborator_cmd =
            std::env::var("WAYPOINT_CMD").unwrap_or_else(|_| "claude".to_string());

        Ok(Self {
            feature_list_file: autonomous_dir.join("feature_list.json"),
            logs_dir: autonomous_dir.join("logs"),
            checkpoints_dir: autonomous_dir.join("checkpoints"),
            impact_dir: autonomous_dir.join("impact"),
            context_dir: autonomous_dir.join("context"),
            state_dir: autonomous_dir.join("state"),
            autonomous_dir,
            project_dir,
            spec_file,
            collaborator_cmd,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            pause_on_error: true,
            iteration_delay_ms: DEFAULT_ITERATION_DELAY_MS,
            verbose: false,
        })
    }

    /// Create every artifact directory.
    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [
            &self.logs_dir,
            &self.checkpoints_dir,
            &self.impact_dir,
            &self.context_dir,
            &self.state_dir,
        ] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        Ok(())
    }

    /// Read the configured spec file, if any. Read failures degrade to
    /// `None` with a warning; a missing spec is not fatal to a run.
    pub fn spec_content(&self) -> Option<String> {
        let path = self.spec_file.as_ref()?;
        match std::fs::read_to_string(path) {
            Ok(content) => Some(content),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to read spec file");
                None
            }
        }
    }
}
