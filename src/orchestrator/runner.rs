//! The queue execution loop.

use crate::checkpoint::{CheckpointEngine, Decision};
use crate::collaborator::Collaborator;
use crate::config::Config;
use crate::context::ContextEngine;
use crate::errors::OrchestratorError;
use crate::events::{Event, EventEmitter};
use crate::feature::{Feature, FeatureList, FeatureStatus};
use crate::impact::{ImpactEngine, Scope, Trigger};
use crate::logs::{FeatureLog, LogStore};
use crate::store::StateStore;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use super::QueueHandle;

/// Summarize the rolling context every this many completed features.
const SUMMARY_INTERVAL: usize = 5;
/// How long a paused loop sleeps between checks.
const PAUSE_POLL: Duration = Duration::from_secs(1);

/// Final tally of one queue run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub iterations: u32,
    pub passed: usize,
    pub failed: usize,
    pub flagged_for_revision: usize,
}

pub struct QueueRunner {
    config: Config,
    store: Arc<StateStore>,
    emitter: Arc<EventEmitter>,
    checkpoint: CheckpointEngine,
    impact: ImpactEngine,
    context: ContextEngine,
    collaborator: Box<dyn Collaborator>,
    logs: LogStore,
    handle: QueueHandle,
}

impl QueueRunner {
    pub fn new(
        config: Config,
        emitter: Arc<EventEmitter>,
        collaborator: Box<dyn Collaborator>,
    ) -> Self {
        let store = Arc::new(StateStore::new(&config.state_dir));
        let checkpoint = CheckpointEngine::new(
            config.checkpoints_dir.clone(),
            config.logs_dir.clone(),
            Arc::clone(&store),
            Arc::clone(&emitter),
        );
        let impact = ImpactEngine::new(
            config.impact_dir.clone(),
            Arc::clone(&store),
            Arc::clone(&emitter),
        );
        let context = ContextEngine::new(
            config.context_dir.clone(),
            config.logs_dir.clone(),
            Arc::clone(&store),
            Arc::clone(&emitter),
        );
        let logs = LogStore::new(config.logs_dir.clone());
        let handle = QueueHandle::new(config.max_iterations);
        Self {
            config,
            store,
            emitter,
            checkpoint,
            impact,
            context,
            collaborator,
            logs,
            handle,
        }
    }

    /// Control handle for pausing, resuming, and stopping the run.
    pub fn handle(&self) -> QueueHandle {
        self.handle.clone()
    }

    /// Drive the queue to completion (or until the iteration budget runs
    /// out). Returns the final tally.
    pub async fn run(&mut self) -> Result<RunReport, OrchestratorError> {
        self.config.ensure_directories()?;
        self.emitter.emit(Event::Status {
            status: "running".into(),
            phase: "startup".into(),
            iteration: 0,
        });

        let mut report = RunReport::default();
        let mut completed_since_summary: Vec<String> = Vec::new();
        let system_prompt = self.config.spec_content();

        loop {
            if self.handle.is_paused() {
                tokio::time::sleep(PAUSE_POLL).await;
                continue;
            }
            let Some(iteration) = self.handle.next_iteration() else {
                break;
            };
            report.iterations = iteration;

            let mut list = FeatureList::load(&self.config.feature_list_file)?;
            let Some(index) = list.next_pending() else {
                self.emitter.emit(Event::Progress {
                    phase: "queue".into(),
                    iteration,
                    message: "No pending features remain".into(),
                });
                break;
            };
            let feature = list.features[index].clone();

            self.emitter.emit(Event::Progress {
                phase: "checkpoint".into(),
                iteration,
                message: format!("Assessing {} ({})", feature.name, feature.id),
            });

            let decision = self.checkpoint.assess(&feature);
            self.emitter.emit(Event::Checkpoint {
                feature_id: decision.feature_id.clone(),
                decision: decision.decision.as_str().to_string(),
                risk_score: decision.risk_score,
                reason: decision.reason.clone(),
            });
            // Unattended runs approve their own checkpoints; the decision is
            // on the event stream and in the ledger before work starts, so a
            // host can veto by pausing.
            if decision.decision != Decision::AutoProceed {
                self.checkpoint.mark_approved(&feature.id);
            }

            let started_at = chrono::Utc::now().timestamp_millis();
            list.features[index].status = FeatureStatus::InProgress;
            list.features[index].started_at = Some(started_at);
            list.current_feature_id = Some(feature.id.clone());
            list.save(&self.config.feature_list_file)?;

            let prompt = self.build_prompt(&feature);
            let outcome = self
                .collaborator
                .send_message(&prompt, system_prompt.as_deref())
                .await;

            let (status, error) = match &outcome {
                Ok(response) => {
                    self.emitter.emit(Event::Stdout {
                        data: response.clone(),
                    });
                    if response_indicates_success(response) {
                        (FeatureStatus::Passed, None)
                    } else {
                        (FeatureStatus::Failed, Some("Tests did not pass".to_string()))
                    }
                }
                Err(e) => {
                    self.emitter.emit_error(format!("Dispatch failed: {e:#}"));
                    (FeatureStatus::Failed, Some(format!("{e:#}")))
                }
            };

            let completed_at = chrono::Utc::now().timestamp_millis();
            let mut list = FeatureList::load(&self.config.feature_list_file)?;
            if let Some(f) = list.features.iter_mut().find(|f| f.id == feature.id) {
                f.status = status;
                f.completed_at = Some(completed_at);
            }
            list.current_feature_id = None;
            list.save(&self.config.feature_list_file)?;

            self.logs.write(&FeatureLog {
                id: feature.id.clone(),
                name: feature.name.clone(),
                category: feature.category.clone(),
                status,
                started_at: Some(started_at),
                completed_at: Some(completed_at),
                iteration,
                error: error.clone(),
            })?;

            match status {
                FeatureStatus::Passed => report.passed += 1,
                FeatureStatus::Failed => report.failed += 1,
                _ => {}
            }
            completed_since_summary.push(feature.id.clone());

            let mut updates = serde_json::Map::new();
            updates.insert(
                "lastCompletedFeature".to_string(),
                json!({
                    "featureId": feature.id,
                    "status": status,
                    "iteration": iteration,
                }),
            );
            self.store.merge(updates)?;

            report.flagged_for_revision +=
                self.run_impact_triggers(decision.decision, &feature, &list);

            if completed_since_summary.len() >= SUMMARY_INTERVAL {
                self.context
                    .summarize(&completed_since_summary, "feature_count");
                completed_since_summary.clear();
            }

            if error.is_some() && self.config.pause_on_error {
                self.handle.pause();
                self.emitter.emit(Event::Status {
                    status: "paused".into(),
                    phase: "error".into(),
                    iteration,
                });
            }

            if self.config.iteration_delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.config.iteration_delay_ms)).await;
            }
        }

        // Fold any stragglers into the summary before reporting done. An
        // empty batch is skipped so a no-op run leaves the rolling summary
        // untouched.
        if !completed_since_summary.is_empty() {
            self.context.summarize(&completed_since_summary, "manual");
        }

        self.emitter.emit(Event::Status {
            status: "completed".into(),
            phase: "shutdown".into(),
            iteration: report.iterations,
        });
        tracing::info!(
            iterations = report.iterations,
            passed = report.passed,
            failed = report.failed,
            "queue run finished"
        );
        Ok(report)
    }

    /// Run whichever impact triggers the completed feature fired. Returns
    /// how many pending features were flagged.
    fn run_impact_triggers(
        &self,
        decision: Decision,
        feature: &Feature,
        list: &FeatureList,
    ) -> usize {
        let mut flagged = 0;
        let Some(completed) = list.features.iter().find(|f| f.id == feature.id) else {
            return 0;
        };

        if decision == Decision::HardCheckpoint && list.next_pending().is_some() {
            let assessment = self.impact.assess(
                Trigger::HighRiskCompletion,
                Scope::DirectDependents,
                completed,
                &list.features,
            );
            flagged += assessment.flagged_features.len();
        }

        if list.category_terminal(&feature.category) {
            let assessment = self.impact.assess(
                Trigger::CategoryCompletion,
                Scope::AllRemaining,
                completed,
                &list.features,
            );
            flagged += assessment.flagged_features.len();
        }

        flagged
    }

    fn build_prompt(&self, feature: &Feature) -> String {
        let mut prompt = format!("# Feature: {}\n\n{}", feature.name, feature.spec);
        if !feature.files.is_empty() {
            prompt.push_str("\n\n## Files\n");
            for file in &feature.files {
                prompt.push_str(&format!("- {file}\n"));
            }
        }
        let injection = self.context.injection_for(&feature.id);
        if injection.token_count > 0 {
            prompt.push_str("\n\n");
            prompt.push_str(&injection.to_prompt_section());
        }
        prompt
    }
}

/// Outcome heuristic over the collaborator transcript: the feature passes
/// only when the response claims its tests pass.
fn response_indicates_success(response: &str) -> bool {
    let lower = response.to_lowercase();
    lower.contains("test") && lower.contains("pass")
}
