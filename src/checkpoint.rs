//! Checkpoint engine: risk-based intervention points.
//!
//! Before a feature is dispatched, the engine scores it across four
//! independent factors (touched-file count, file-type keywords, recent
//! failures, blast radius) and maps the sum to a decision tier. The engine
//! never fails its caller: any internal error collapses to a soft checkpoint
//! at score 50 so the loop can proceed with human-in-the-loop caution.

use crate::events::EventEmitter;
use crate::feature::{Feature, FeatureStatus};
use crate::logs::LogStore;
use crate::store::{self, StateStore};
use anyhow::Result;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

/// Scores at or below this auto-proceed.
pub const AUTO_PROCEED_THRESHOLD: u32 = 30;
/// Scores at or above this require a hard checkpoint.
pub const HARD_CHECKPOINT_THRESHOLD: u32 = 70;

/// High-risk keyword patterns (security, money, data integrity).
const HIGH_RISK_PATTERNS: &[(&str, u32)] = &[
    ("auth", 30),
    ("login", 30),
    ("password", 30),
    ("token", 30),
    ("session", 30),
    ("payment", 30),
    ("billing", 30),
    ("checkout", 30),
    ("stripe", 30),
    ("paypal", 30),
    ("migration", 25),
    ("schema", 25),
    ("database", 25),
    ("sql", 25),
];

/// Medium-risk keyword patterns (API surface, business logic).
const MEDIUM_RISK_PATTERNS: &[(&str, u32)] = &[
    ("api", 15),
    ("endpoint", 15),
    ("route", 15),
    ("service", 20),
    ("model", 20),
    ("controller", 20),
];

/// Low-risk keyword patterns (UI, tests, docs).
const LOW_RISK_PATTERNS: &[(&str, u32)] = &[
    ("component", 5),
    ("style", 5),
    ("css", 5),
    ("test", 0),
    ("spec", 0),
    ("doc", 0),
    ("readme", 0),
];

/// A lower tier is only consulted when the higher tier's best match stays
/// below that tier's own ceiling.
const HIGH_TIER_CEILING: u32 = 25;
const MEDIUM_TIER_CEILING: u32 = 10;

/// How many recent per-feature logs the failure factor inspects.
const RECENT_LOG_WINDOW: usize = 5;

const STOPWORDS: &[&str] = &["the", "a", "an", "and", "or", "for", "to", "of", "in", "on"];

/// Decision tier derived from the total risk score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Decision {
    AutoProceed,
    SoftCheckpoint,
    HardCheckpoint,
}

impl Decision {
    /// Map a total score to its tier: ≤30 auto, 31–69 soft, ≥70 hard.
    pub fn from_score(score: u32) -> Self {
        if score <= AUTO_PROCEED_THRESHOLD {
            Self::AutoProceed
        } else if score < HARD_CHECKPOINT_THRESHOLD {
            Self::SoftCheckpoint
        } else {
            Self::HardCheckpoint
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AutoProceed => "auto-proceed",
            Self::SoftCheckpoint => "soft-checkpoint",
            Self::HardCheckpoint => "hard-checkpoint",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Breakdown of the risk score by factor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskFactors {
    pub file_count_score: u32,
    pub file_type_score: u32,
    pub recent_failures_score: u32,
    pub blast_radius_score: u32,
    pub total_score: u32,
}

/// Persisted checkpoint decision for one feature.
///
/// Immutable after creation except for the approval/skip fields, which the
/// human-intervention path sets after the fact.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointDecision {
    pub feature_id: String,
    pub decision: Decision,
    pub risk_score: u32,
    pub risk_factors: RiskFactors,
    pub reason: String,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skipped: Option<bool>,
}

/// One entry in the cumulative decisions ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionRecord {
    pub feature_id: String,
    pub decision: Decision,
    pub risk_score: u32,
    pub timestamp: i64,
    #[serde(default)]
    pub approved: Option<bool>,
    #[serde(default)]
    pub skipped: Option<bool>,
}

/// Aggregate counts over the decisions ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionStats {
    pub total_decisions: usize,
    pub auto_proceed: usize,
    pub soft_checkpoints: usize,
    pub hard_checkpoints: usize,
}

/// The append-only decisions ledger document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionsLog {
    #[serde(default)]
    pub decisions: Vec<DecisionRecord>,
    #[serde(default)]
    pub stats: DecisionStats,
}

pub struct CheckpointEngine {
    checkpoints_dir: PathBuf,
    logs: LogStore,
    store: Arc<StateStore>,
    emitter: Arc<EventEmitter>,
}

impl CheckpointEngine {
    pub fn new(
        checkpoints_dir: PathBuf,
        logs_dir: PathBuf,
        store: Arc<StateStore>,
        emitter: Arc<EventEmitter>,
    ) -> Self {
        Self {
            checkpoints_dir,
            logs: LogStore::new(logs_dir),
            store,
            emitter,
        }
    }

    /// Assess a feature and persist the decision.
    ///
    /// Never fails: an internal error yields the safe default (soft
    /// checkpoint at score 50, reason embedding the error).
    pub fn assess(&self, feature: &Feature) -> CheckpointDecision {
        match self.try_assess(feature) {
            Ok(decision) => decision,
            Err(e) => {
                self.emitter
                    .emit_error(format!("Risk assessment failed: {e:#}"));
                CheckpointDecision {
                    feature_id: feature.id.clone(),
                    decision: Decision::SoftCheckpoint,
                    risk_score: 50,
                    risk_factors: RiskFactors {
                        file_count_score: 0,
                        file_type_score: 0,
                        recent_failures_score: 0,
                        blast_radius_score: 0,
                        total_score: 50,
                    },
                    reason: format!("Assessment error: {e:#}"),
                    timestamp: chrono::Utc::now().timestamp_millis(),
                    approved: None,
                    approved_at: None,
                    skipped: None,
                }
            }
        }
    }

    fn try_assess(&self, feature: &Feature) -> Result<CheckpointDecision> {
        let file_count_score = file_count_score(feature);
        let file_type_score = file_type_score(feature);
        let recent_failures_score = self.recent_failures_score(feature);
        let blast_radius_score = blast_radius_score(feature);

        let total_score =
            file_count_score + file_type_score + recent_failures_score + blast_radius_score;
        let decision_type = Decision::from_score(total_score);

        let mut reason_parts = Vec::new();
        if file_type_score > 0 {
            reason_parts.push(format!("High-risk file types ({file_type_score} pts)"));
        }
        if file_count_score > 10 {
            reason_parts.push(format!("Multiple files ({file_count_score} pts)"));
        }
        if recent_failures_score > 0 {
            reason_parts.push(format!("Recent failures ({recent_failures_score} pts)"));
        }
        if blast_radius_score > 10 {
            reason_parts.push(format!("Wide impact ({blast_radius_score} pts)"));
        }
        let reason = if reason_parts.is_empty() {
            "Low risk".to_string()
        } else {
            reason_parts.join(", ")
        };

        let decision = CheckpointDecision {
            feature_id: feature.id.clone(),
            decision: decision_type,
            risk_score: total_score,
            risk_factors: RiskFactors {
                file_count_score,
                file_type_score,
                recent_failures_score,
                blast_radius_score,
                total_score,
            },
            reason,
            timestamp: chrono::Utc::now().timestamp_millis(),
            approved: None,
            approved_at: None,
            skipped: None,
        };

        self.save_decision(&decision)?;

        let mut updates = serde_json::Map::new();
        updates.insert(
            "checkpointDecision".to_string(),
            json!({
                "featureId": decision.feature_id,
                "decision": decision.decision,
                "riskScore": decision.risk_score,
                "reason": decision.reason,
                "timestamp": decision.timestamp,
            }),
        );
        self.store.merge(updates)?;

        tracing::debug!(
            feature = %feature.id,
            score = total_score,
            decision = %decision_type,
            "risk assessment complete"
        );

        Ok(decision)
    }

    /// Mark a persisted decision approved. No-op if the record is missing.
    pub fn mark_approved(&self, feature_id: &str) {
        let path = self.decision_file(feature_id);
        if let Some(mut decision) = store::read_json::<CheckpointDecision>(&path) {
            decision.approved = Some(true);
            decision.approved_at = Some(chrono::Utc::now().timestamp_millis());
            if let Err(e) = store::write_json(&path, &decision) {
                self.emitter
                    .emit_error(format!("Failed to record approval: {e}"));
            }
        }
    }

    /// Mark a persisted decision skipped. No-op if the record is missing.
    pub fn mark_skipped(&self, feature_id: &str) {
        let path = self.decision_file(feature_id);
        if let Some(mut decision) = store::read_json::<CheckpointDecision>(&path) {
            decision.skipped = Some(true);
            if let Err(e) = store::write_json(&path, &decision) {
                self.emitter
                    .emit_error(format!("Failed to record skip: {e}"));
            }
        }
    }

    /// Load the persisted decision for a feature id, if any.
    pub fn load_decision(&self, feature_id: &str) -> Option<CheckpointDecision> {
        store::read_json(&self.decision_file(feature_id))
    }

    /// Load the cumulative decisions ledger.
    pub fn load_log(&self) -> DecisionsLog {
        store::read_json(&self.checkpoints_dir.join("decisions-log.json")).unwrap_or_default()
    }

    fn decision_file(&self, feature_id: &str) -> PathBuf {
        self.checkpoints_dir
            .join(format!("checkpoint-{feature_id}.json"))
    }

    fn save_decision(&self, decision: &CheckpointDecision) -> Result<()> {
        store::write_json(&self.decision_file(&decision.feature_id), decision)?;

        let log_file = self.checkpoints_dir.join("decisions-log.json");
        let mut log: DecisionsLog = store::read_json(&log_file).unwrap_or_default();
        log.decisions.push(DecisionRecord {
            feature_id: decision.feature_id.clone(),
            decision: decision.decision,
            risk_score: decision.risk_score,
            timestamp: decision.timestamp,
            approved: decision.approved,
            skipped: decision.skipped,
        });
        log.stats = DecisionStats {
            total_decisions: log.decisions.len(),
            auto_proceed: log
                .decisions
                .iter()
                .filter(|d| d.decision == Decision::AutoProceed)
                .count(),
            soft_checkpoints: log
                .decisions
                .iter()
                .filter(|d| d.decision == Decision::SoftCheckpoint)
                .count(),
            hard_checkpoints: log
                .decisions
                .iter()
                .filter(|d| d.decision == Decision::HardCheckpoint)
                .count(),
        };
        store::write_json(&log_file, &log)?;
        Ok(())
    }

    /// Score recent failures against the five most-recently-modified logs:
    /// a failed log with a similar name scores 20, a failed log in the same
    /// category 15, any failed log 10.
    fn recent_failures_score(&self, feature: &Feature) -> u32 {
        let recent = self.logs.recent(RECENT_LOG_WINDOW);

        let mut similar_failures = 0u32;
        let mut category_failures = 0u32;
        let mut any_failures = 0u32;

        for log in &recent {
            if log.status == FeatureStatus::Failed {
                any_failures += 1;
                if log.category == feature.category {
                    category_failures += 1;
                }
                if names_are_similar(&feature.name, &log.name) {
                    similar_failures += 1;
                }
            }
        }

        if similar_failures > 0 {
            20
        } else if category_failures > 0 {
            15
        } else if any_failures > 0 {
            10
        } else {
            0
        }
    }
}

/// Step function over the touched-file count.
fn file_count_score(feature: &Feature) -> u32 {
    match feature.files.len() {
        0..=3 => 0,
        4..=6 => 10,
        7..=10 => 15,
        _ => 25,
    }
}

/// Keyword score over touched files, or over name/spec/category text when
/// no files are listed. Takes the maximum match across tiers.
fn file_type_score(feature: &Feature) -> u32 {
    if feature.files.is_empty() {
        let text = format!("{} {} {}", feature.name, feature.spec, feature.category)
            .to_lowercase();
        return score_text_patterns(&text);
    }

    feature
        .files
        .iter()
        .map(|f| score_text_patterns(&f.to_lowercase()))
        .max()
        .unwrap_or(0)
}

fn score_text_patterns(text: &str) -> u32 {
    let mut max_score = 0;

    for (pattern, score) in HIGH_RISK_PATTERNS {
        if text.contains(pattern) {
            max_score = max_score.max(*score);
        }
    }
    if max_score < HIGH_TIER_CEILING {
        for (pattern, score) in MEDIUM_RISK_PATTERNS {
            if text.contains(pattern) {
                max_score = max_score.max(*score);
            }
        }
    }
    if max_score < MEDIUM_TIER_CEILING {
        for (pattern, score) in LOW_RISK_PATTERNS {
            if text.contains(pattern) {
                max_score = max_score.max(*score);
            }
        }
    }

    max_score
}

/// Step function over dependency + affected-feature count.
fn blast_radius_score(feature: &Feature) -> u32 {
    match feature.blast_radius() {
        0 => 0,
        1..=2 => 10,
        3..=4 => 15,
        _ => 25,
    }
}

fn word_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\w+").expect("static regex"))
}

fn significant_words(name: &str) -> HashSet<String> {
    word_regex()
        .find_iter(&name.to_lowercase())
        .map(|m| m.as_str().to_string())
        .filter(|w| !STOPWORDS.contains(&w.as_str()))
        .collect()
}

/// Two names are similar when they share at least two significant words, or
/// their overlap exceeds half the smaller word set.
fn names_are_similar(a: &str, b: &str) -> bool {
    let words_a = significant_words(a);
    let words_b = significant_words(b);
    if words_a.is_empty() || words_b.is_empty() {
        return false;
    }
    let overlap = words_a.intersection(&words_b).count();
    overlap >= 2 || (overlap as f64) / (words_a.len().min(words_b.len()) as f64) > 0.5
}
