//! Context memory engine.
//!
//! Maintains a token-bounded rolling summary of completed work plus three
//! side ledgers (key decisions, failure memory, active constraints), and
//! assembles a compact context injection for each feature's execution prompt.
//! Token counts are a 4-chars-per-token estimate; the summary is clamped to
//! the budget by character truncation.

use crate::events::EventEmitter;
use crate::feature::FeatureStatus;
use crate::logs::{FeatureLog, LogStore};
use crate::store::{self, StateStore};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;

/// Rolling summary token budget.
pub const TOKEN_BUDGET: usize = 2000;
/// Character cap applied when the budget is exceeded (4 chars per token).
const SUMMARY_CHAR_CAP: usize = 8000;
/// How much of the previous summary is carried forward.
const CARRYOVER_CHARS: usize = 500;

const DECISIONS_CAP: usize = 20;
const FAILURES_CAP: usize = 10;

const INJECTED_DECISIONS: usize = 5;
const INJECTED_FAILURES: usize = 3;
const TOKENS_PER_DECISION: usize = 50;
const TOKENS_PER_FAILURE: usize = 50;
const TOKENS_PER_CONSTRAINT: usize = 30;

/// Estimate token count at 4 characters per token.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count() / 4
}

/// The persisted rolling summary document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunningSummary {
    pub content: String,
    pub token_count: usize,
    pub updated_at: i64,
    pub trigger: String,
    pub features_since_last_update: usize,
    pub total_features_completed: usize,
}

/// A design decision worth carrying across features.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyDecision {
    pub id: String,
    pub feature_id: String,
    pub decision: String,
    pub rationale: String,
    pub impact: Vec<String>,
    pub timestamp: i64,
    pub category: String,
}

/// A past failure with its root cause and prevention notes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureRecord {
    pub id: String,
    pub feature_id: String,
    pub description: String,
    pub root_cause: String,
    pub resolution: String,
    pub prevention: String,
    pub timestamp: i64,
    pub severity: String,
}

/// A constraint that limits how future features may be implemented.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveConstraint {
    pub id: String,
    pub description: String,
    pub reason: String,
    pub affected_areas: Vec<String>,
    pub added_at: i64,
    pub expires_at: Option<i64>,
    #[serde(rename = "type")]
    pub kind: String,
}

impl ActiveConstraint {
    fn is_active(&self, now: i64) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// Result of one summarization pass.
#[derive(Debug, Clone)]
pub struct SummarizeOutcome {
    pub success: bool,
    pub error: Option<String>,
    pub summary: Option<RunningSummary>,
    pub new_decisions: usize,
    pub new_failures: usize,
    pub active_constraints: usize,
}

/// Context bundle assembled for one feature's execution prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextInjection {
    pub summary: String,
    pub decisions: Vec<KeyDecision>,
    pub failures: Vec<FailureRecord>,
    pub constraints: Vec<ActiveConstraint>,
    pub token_count: usize,
}

impl ContextInjection {
    /// Render the bundle as a prompt section, or an empty string when there
    /// is nothing to inject.
    pub fn to_prompt_section(&self) -> String {
        if self.token_count == 0 {
            return String::new();
        }
        let mut parts = vec![format!("# Project Context\n\n{}", self.summary)];
        if !self.decisions.is_empty() {
            let lines: Vec<String> = self
                .decisions
                .iter()
                .map(|d| format!("- {} ({})", d.decision, d.rationale))
                .collect();
            parts.push(format!("## Key Decisions\n{}", lines.join("\n")));
        }
        if !self.failures.is_empty() {
            let lines: Vec<String> = self
                .failures
                .iter()
                .map(|f| format!("- {}: {}", f.description, f.prevention))
                .collect();
            parts.push(format!("## Past Failures\n{}", lines.join("\n")));
        }
        if !self.constraints.is_empty() {
            let lines: Vec<String> = self
                .constraints
                .iter()
                .map(|c| format!("- {} ({})", c.description, c.reason))
                .collect();
            parts.push(format!("## Active Constraints\n{}", lines.join("\n")));
        }
        parts.join("\n\n")
    }
}

/// Hook for mining decisions and failures out of completed-feature logs.
///
/// The default distiller extracts nothing; a model-backed implementation can
/// be plugged in without touching the engine.
pub trait LogDistiller: Send + Sync {
    fn extract_decisions(&self, logs: &[FeatureLog]) -> Vec<KeyDecision>;
    fn extract_failures(&self, logs: &[FeatureLog]) -> Vec<FailureRecord>;
}

pub struct NoopDistiller;

impl LogDistiller for NoopDistiller {
    fn extract_decisions(&self, _logs: &[FeatureLog]) -> Vec<KeyDecision> {
        Vec::new()
    }
    fn extract_failures(&self, _logs: &[FeatureLog]) -> Vec<FailureRecord> {
        Vec::new()
    }
}

pub struct ContextEngine {
    context_dir: PathBuf,
    logs: LogStore,
    store: Arc<StateStore>,
    emitter: Arc<EventEmitter>,
    distiller: Box<dyn LogDistiller>,
}

impl ContextEngine {
    pub fn new(
        context_dir: PathBuf,
        logs_dir: PathBuf,
        store: Arc<StateStore>,
        emitter: Arc<EventEmitter>,
    ) -> Self {
        Self {
            context_dir,
            logs: LogStore::new(logs_dir),
            store,
            emitter,
            distiller: Box::new(NoopDistiller),
        }
    }

    pub fn with_distiller(mut self, distiller: Box<dyn LogDistiller>) -> Self {
        self.distiller = distiller;
        self
    }

    /// Fold the given completed features into the rolling summary and
    /// refresh the ledgers. Never fails its caller.
    pub fn summarize(&self, completed_features: &[String], trigger: &str) -> SummarizeOutcome {
        match self.try_summarize(completed_features, trigger) {
            Ok(outcome) => outcome,
            Err(e) => {
                self.emitter
                    .emit_error(format!("Summarization failed: {e:#}"));
                SummarizeOutcome {
                    success: false,
                    error: Some(format!("{e:#}")),
                    summary: None,
                    new_decisions: 0,
                    new_failures: 0,
                    active_constraints: 0,
                }
            }
        }
    }

    fn try_summarize(
        &self,
        completed_features: &[String],
        trigger: &str,
    ) -> Result<SummarizeOutcome> {
        let current = self.load_summary();
        let mut decisions = self.load_decisions();
        let mut failures = self.load_failures();
        let constraints = self.load_constraints();

        let feature_logs: Vec<FeatureLog> = completed_features
            .iter()
            .filter_map(|id| self.logs.read(id))
            .collect();

        let new_summary = build_summary(
            current.as_ref(),
            &feature_logs,
            trigger,
            completed_features.len(),
        );

        let new_decisions = self.distiller.extract_decisions(&feature_logs);
        let new_failures = self.distiller.extract_failures(&feature_logs);
        let new_decision_count = new_decisions.len();
        let new_failure_count = new_failures.len();

        decisions.extend(new_decisions);
        decisions.sort_by_key(|d| std::cmp::Reverse(d.timestamp));
        decisions.truncate(DECISIONS_CAP);

        failures.extend(new_failures);
        failures.sort_by_key(|f| std::cmp::Reverse(f.timestamp));
        failures.truncate(FAILURES_CAP);

        let now = chrono::Utc::now().timestamp_millis();
        let active: Vec<ActiveConstraint> = constraints
            .into_iter()
            .filter(|c| c.is_active(now))
            .collect();

        store::write_json(&self.context_dir.join("running-summary.json"), &new_summary)?;
        store::write_json(&self.context_dir.join("key-decisions.json"), &decisions)?;
        store::write_json(&self.context_dir.join("failure-memory.json"), &failures)?;
        store::write_json(&self.context_dir.join("active-constraints.json"), &active)?;

        let mut updates = serde_json::Map::new();
        updates.insert(
            "contextSummary".to_string(),
            json!({
                "content": new_summary.content,
                "tokenCount": new_summary.token_count,
                "lastUpdated": new_summary.updated_at,
            }),
        );
        updates.insert("lastContextUpdate".to_string(), json!(new_summary.updated_at));
        updates.insert(
            "totalFeaturesCompleted".to_string(),
            json!(new_summary.total_features_completed),
        );
        self.store.merge(updates)?;

        tracing::debug!(
            trigger,
            features = completed_features.len(),
            tokens = new_summary.token_count,
            "context summarized"
        );

        Ok(SummarizeOutcome {
            success: true,
            error: None,
            summary: Some(new_summary),
            new_decisions: new_decision_count,
            new_failures: new_failure_count,
            active_constraints: active.len(),
        })
    }

    /// Assemble the context bundle for a feature's execution prompt.
    pub fn injection_for(&self, _feature_id: &str) -> ContextInjection {
        let Some(summary) = self.load_summary() else {
            return ContextInjection {
                summary: String::new(),
                decisions: Vec::new(),
                failures: Vec::new(),
                constraints: Vec::new(),
                token_count: 0,
            };
        };

        let mut decisions = self.load_decisions();
        decisions.truncate(INJECTED_DECISIONS);
        let mut failures = self.load_failures();
        failures.truncate(INJECTED_FAILURES);
        let constraints = self.load_constraints();

        let token_count = summary.token_count
            + decisions.len() * TOKENS_PER_DECISION
            + failures.len() * TOKENS_PER_FAILURE
            + constraints.len() * TOKENS_PER_CONSTRAINT;

        ContextInjection {
            summary: summary.content,
            decisions,
            failures,
            constraints,
            token_count,
        }
    }

    pub fn load_summary(&self) -> Option<RunningSummary> {
        store::read_json(&self.context_dir.join("running-summary.json"))
    }

    fn load_decisions(&self) -> Vec<KeyDecision> {
        store::read_json(&self.context_dir.join("key-decisions.json")).unwrap_or_default()
    }

    fn load_failures(&self) -> Vec<FailureRecord> {
        store::read_json(&self.context_dir.join("failure-memory.json")).unwrap_or_default()
    }

    fn load_constraints(&self) -> Vec<ActiveConstraint> {
        store::read_json(&self.context_dir.join("active-constraints.json")).unwrap_or_default()
    }
}

fn build_summary(
    current: Option<&RunningSummary>,
    feature_logs: &[FeatureLog],
    trigger: &str,
    num_features: usize,
) -> RunningSummary {
    let mut parts = Vec::new();

    if let Some(current) = current {
        let carryover: String = current.content.chars().take(CARRYOVER_CHARS).collect();
        parts.push(format!("## Previous State\n{carryover}..."));
    }

    parts.push(format!("\n## Recent Updates ({} features)", feature_logs.len()));
    for log in feature_logs {
        parts.push(format!("- {}: {}", log.name, status_label(log.status)));
    }

    let mut content = parts.join("\n");
    let mut token_count = estimate_tokens(&content);
    if token_count > TOKEN_BUDGET {
        content = content.chars().take(SUMMARY_CHAR_CAP).collect();
        token_count = TOKEN_BUDGET;
    }

    let total_features_completed =
        current.map_or(0, |c| c.total_features_completed) + num_features;

    RunningSummary {
        content,
        token_count,
        updated_at: chrono::Utc::now().timestamp_millis(),
        trigger: trigger.to_string(),
        features_since_last_update: num_features,
        total_features_completed,
    }
}

fn status_label(status: FeatureStatus) -> &'static str {
    match status {
        FeatureStatus::Pending => "pending",
        FeatureStatus::InProgress => "in_progress",
        FeatureStatus::Passed => "passed",
        FeatureStatus::Failed => "failed",
        FeatureStatus::Skipped => "skipped",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn make_engine(dir: &std::path::Path) -> (ContextEngine, Arc<StateStore>) {
        let store = Arc::new(StateStore::new(&dir.join("state")));
        let engine = ContextEngine::new(
            dir.join("context"),
            dir.join("logs"),
            Arc::clone(&store),
            Arc::new(EventEmitter::with_sink(Box::new(std::io::sink()))),
        );
        (engine, store)
    }

    fn write_log(dir: &std::path::Path, id: &str, name: &str, status: FeatureStatus) {
        let logs = LogStore::new(dir.join("logs"));
        logs.write(&FeatureLog {
            id: id.into(),
            name: name.into(),
            category: "general".into(),
            status,
            started_at: None,
            completed_at: None,
            iteration: 1,
            error: None,
        })
        .unwrap();
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcdefg"), 1);
        assert_eq!(estimate_tokens("abcdefgh"), 2);
    }

    #[test]
    fn test_summarize_lists_completed_features() {
        let dir = tempdir().unwrap();
        let (engine, _) = make_engine(dir.path());
        write_log(dir.path(), "feat-1", "Add login page", FeatureStatus::Passed);
        write_log(dir.path(), "feat-2", "Fix cart totals", FeatureStatus::Failed);

        let outcome = engine.summarize(&["feat-1".into(), "feat-2".into()], "feature_count");
        assert!(outcome.success);
        let summary = outcome.summary.unwrap();
        assert!(summary.content.contains("## Recent Updates (2 features)"));
        assert!(summary.content.contains("- Add login page: passed"));
        assert!(summary.content.contains("- Fix cart totals: failed"));
        assert_eq!(summary.trigger, "feature_count");
        assert_eq!(summary.total_features_completed, 2);
    }

    #[test]
    fn test_summarize_covers_every_terminal_status() {
        let dir = tempdir().unwrap();
        let (engine, _) = make_engine(dir.path());
        write_log(dir.path(), "feat-1", "Shipped", FeatureStatus::Passed);
        write_log(dir.path(), "feat-2", "Broke", FeatureStatus::Failed);
        write_log(dir.path(), "feat-3", "Deferred", FeatureStatus::Skipped);

        let outcome = engine.summarize(
            &["feat-1".into(), "feat-2".into(), "feat-3".into()],
            "feature_count",
        );
        let summary = outcome.summary.unwrap();
        assert!(summary.content.contains("- Shipped: passed"));
        assert!(summary.content.contains("- Broke: failed"));
        assert!(summary.content.contains("- Deferred: skipped"));
    }

    #[test]
    fn test_summarize_carries_over_previous_state() {
        let dir = tempdir().unwrap();
        let (engine, _) = make_engine(dir.path());
        write_log(dir.path(), "feat-1", "First", FeatureStatus::Passed);
        write_log(dir.path(), "feat-2", "Second", FeatureStatus::Passed);

        engine.summarize(&["feat-1".into()], "feature_count");
        let outcome = engine.summarize(&["feat-2".into()], "feature_count");

        let summary = outcome.summary.unwrap();
        assert!(summary.content.starts_with("## Previous State\n"));
        assert!(summary.content.contains("- First: passed"));
        assert!(summary.content.contains("- Second: passed"));
    }

    #[test]
    fn test_total_completed_is_monotonic_and_counts_ids_not_logs() {
        let dir = tempdir().unwrap();
        let (engine, store) = make_engine(dir.path());

        // No log exists for feat-missing; the counter still advances by the
        // number of ids handed in.
        engine.summarize(&["feat-missing".into()], "feature_count");
        engine.summarize(&["feat-a".into(), "feat-b".into()], "feature_count");

        let summary = engine.load_summary().unwrap();
        assert_eq!(summary.total_features_completed, 3);
        assert_eq!(store.get("totalFeaturesCompleted").unwrap(), 3);
    }

    #[test]
    fn test_summary_clamped_to_token_budget() {
        let dir = tempdir().unwrap();
        let (engine, _) = make_engine(dir.path());
        for i in 0..200 {
            write_log(
                dir.path(),
                &format!("feat-{i}"),
                &format!("Feature with a deliberately long descriptive name number {i}"),
                FeatureStatus::Passed,
            );
        }
        let ids: Vec<String> = (0..200).map(|i| format!("feat-{i}")).collect();

        let outcome = engine.summarize(&ids, "manual");
        let summary = outcome.summary.unwrap();
        assert_eq!(summary.token_count, TOKEN_BUDGET);
        assert_eq!(summary.content.chars().count(), 8000);
    }

    #[test]
    fn test_expired_constraints_are_dropped() {
        let dir = tempdir().unwrap();
        let (engine, _) = make_engine(dir.path());
        let now = chrono::Utc::now().timestamp_millis();
        let constraints = vec![
            ActiveConstraint {
                id: "c-1".into(),
                description: "Keep bundle under 1MB".into(),
                reason: "mobile clients".into(),
                affected_areas: vec!["frontend".into()],
                added_at: now,
                expires_at: None,
                kind: "performance".into(),
            },
            ActiveConstraint {
                id: "c-2".into(),
                description: "Freeze schema during migration".into(),
                reason: "live migration".into(),
                affected_areas: vec!["database".into()],
                added_at: now - 10_000,
                expires_at: Some(now - 1_000),
                kind: "technical".into(),
            },
        ];
        store::write_json(
            &dir.path().join("context/active-constraints.json"),
            &constraints,
        )
        .unwrap();

        let outcome = engine.summarize(&[], "manual");
        assert_eq!(outcome.active_constraints, 1);
        let injection = engine.injection_for("feat-next");
        assert_eq!(injection.constraints.len(), 1);
        assert_eq!(injection.constraints[0].id, "c-1");
    }

    #[test]
    fn test_injection_empty_without_summary() {
        let dir = tempdir().unwrap();
        let (engine, _) = make_engine(dir.path());
        let injection = engine.injection_for("feat-1");
        assert_eq!(injection.token_count, 0);
        assert!(injection.summary.is_empty());
        assert!(injection.to_prompt_section().is_empty());
    }

    #[test]
    fn test_injection_token_accounting() {
        let dir = tempdir().unwrap();
        let (engine, _) = make_engine(dir.path());
        write_log(dir.path(), "feat-1", "Something", FeatureStatus::Passed);
        engine.summarize(&["feat-1".into()], "feature_count");

        let now = chrono::Utc::now().timestamp_millis();
        let decisions: Vec<KeyDecision> = (0..7)
            .map(|i| KeyDecision {
                id: format!("d-{i}"),
                feature_id: "feat-1".into(),
                decision: format!("Decision {i}"),
                rationale: "because".into(),
                impact: Vec::new(),
                timestamp: now,
                category: "architecture".into(),
            })
            .collect();
        store::write_json(&dir.path().join("context/key-decisions.json"), &decisions).unwrap();

        let injection = engine.injection_for("feat-2");
        // Only the top five decisions are injected.
        assert_eq!(injection.decisions.len(), 5);
        let summary_tokens = engine.load_summary().unwrap().token_count;
        assert_eq!(injection.token_count, summary_tokens + 5 * 50);

        let section = injection.to_prompt_section();
        assert!(section.starts_with("# Project Context"));
        assert!(section.contains("## Key Decisions"));
    }

    #[test]
    fn test_decision_ledger_capped_at_twenty() {
        let dir = tempdir().unwrap();
        let (engine, _) = make_engine(dir.path());
        let now = chrono::Utc::now().timestamp_millis();
        let decisions: Vec<KeyDecision> = (0..25)
            .map(|i| KeyDecision {
                id: format!("d-{i}"),
                feature_id: "feat-1".into(),
                decision: format!("Decision {i}"),
                rationale: String::new(),
                impact: Vec::new(),
                timestamp: now + i,
                category: "other".into(),
            })
            .collect();
        store::write_json(&dir.path().join("context/key-decisions.json"), &decisions).unwrap();

        engine.summarize(&[], "manual");
        let kept = engine.load_decisions();
        assert_eq!(kept.len(), 20);
        // Newest first after the trim.
        assert_eq!(kept[0].id, "d-24");
    }
}
