//! Impact engine: cross-feature conflict analysis.
//!
//! After a risky or category-closing completion, the engine re-examines the
//! remaining queue against completed work, scores each candidate's conflicts,
//! and flags features whose specs need revision before dispatch. Flags are
//! persisted to a ledger the host can act on; the engine itself never blocks
//! the loop and degrades to an empty assessment on error.

pub mod detectors;

use crate::events::{Event, EventEmitter};
use crate::feature::{Feature, FeatureStatus};
use crate::store::{self, StateStore};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

pub use detectors::{ConflictDetail, ConflictKind, Evidence};

/// Bonus applied when the candidate directly depends on the completed
/// feature. Transitive dependents are analyzed at no extra weight.
const DIRECT_DEPENDENCY_SCORE: u32 = 25;

/// What prompted an impact analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Trigger {
    HighRiskCompletion,
    CategoryCompletion,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HighRiskCompletion => "high-risk-completion",
            Self::CategoryCompletion => "category-completion",
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which pending features an analysis covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Only features that list the completed feature as a dependency.
    DirectDependents,
    /// Every remaining pending feature.
    AllRemaining,
}

/// Concrete change proposals attached to a minor adjustment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposedChanges {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub endpoints: Vec<EndpointChange>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<FileChange>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointChange {
    pub old: String,
    pub action: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChange {
    pub conflicting: String,
    pub action: String,
}

/// Remediation tier plus its payload, keyed by conflict score.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "recommendation", rename_all = "kebab-case")]
pub enum Remediation {
    NoAction,
    #[serde(rename_all = "camelCase")]
    MinorAdjustment { proposed_changes: ProposedChanges },
    #[serde(rename_all = "camelCase")]
    ModerateRevision { proposed_revision: String },
    #[serde(rename_all = "camelCase")]
    MajorRespec { respec_reason: String },
}

impl Remediation {
    /// Build the remediation for a conflict score: ≤30 none, ≤60 minor,
    /// ≤80 moderate, above that a full respec.
    pub fn from_conflicts(score: u32, conflicts: &[ConflictDetail]) -> Self {
        if score <= 30 {
            return Self::NoAction;
        }
        if score <= 60 {
            return Self::MinorAdjustment {
                proposed_changes: minor_changes(conflicts),
            };
        }
        if score <= 80 {
            return Self::ModerateRevision {
                proposed_revision: moderate_revision(conflicts),
            };
        }
        Self::MajorRespec {
            respec_reason: major_respec_reason(conflicts),
        }
    }

    pub fn tier(&self) -> &'static str {
        match self {
            Self::NoAction => "no-action",
            Self::MinorAdjustment { .. } => "minor-adjustment",
            Self::ModerateRevision { .. } => "moderate-revision",
            Self::MajorRespec { .. } => "major-respec",
        }
    }
}

fn minor_changes(conflicts: &[ConflictDetail]) -> ProposedChanges {
    let mut changes = ProposedChanges::default();
    for conflict in conflicts {
        match &conflict.evidence {
            Evidence::Endpoint {
                expected_endpoint, ..
            } => changes.endpoints.push(EndpointChange {
                old: expected_endpoint.clone(),
                action: "verify-or-update".to_string(),
            }),
            Evidence::Files { overlapping_files } => {
                changes.files.extend(overlapping_files.iter().map(|f| FileChange {
                    conflicting: f.clone(),
                    action: "review-collision".to_string(),
                }))
            }
            _ => {}
        }
    }
    changes
}

fn moderate_revision(conflicts: &[ConflictDetail]) -> String {
    let mut lines = Vec::new();
    for conflict in conflicts {
        match (&conflict.kind, &conflict.evidence) {
            (
                ConflictKind::ApiBreak,
                Evidence::Endpoint {
                    expected_endpoint,
                    completed_files: _,
                },
            ) => lines.push(format!(
                "- Verify API endpoint {expected_endpoint} is still valid after {}",
                conflict.completed_feature_id
            )),
            (
                ConflictKind::ArchDrift,
                Evidence::Architecture {
                    completed_pattern,
                    future_pattern,
                    ..
                },
            ) => lines.push(format!(
                "- Adjust architecture to match {completed_pattern} pattern instead of {future_pattern}"
            )),
            (ConflictKind::ResourceCollision, _) => {
                let shown: Vec<&str> = conflict
                    .affected_files
                    .iter()
                    .take(3)
                    .map(String::as_str)
                    .collect();
                lines.push(format!("- Resolve file collision in {}", shown.join(", ")));
            }
            _ => {}
        }
    }
    if lines.is_empty() {
        "Review and update spec based on conflicts".to_string()
    } else {
        lines.join("\n")
    }
}

fn major_respec_reason(conflicts: &[ConflictDetail]) -> String {
    let critical: Vec<String> = conflicts
        .iter()
        .filter(|c| c.severity >= 40)
        .map(|c| format!("Critical {}: {}", kind_label(c.kind), c.description))
        .collect();
    if critical.is_empty() {
        "Multiple high-severity conflicts detected".to_string()
    } else {
        critical.join("; ")
    }
}

fn kind_label(kind: ConflictKind) -> &'static str {
    match kind {
        ConflictKind::ApiBreak => "api-break",
        ConflictKind::DependencyInvalid => "dependency-invalid",
        ConflictKind::ResourceCollision => "resource-collision",
        ConflictKind::ArchDrift => "arch-drift",
    }
}

/// A pending feature whose spec conflicts with completed work.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlaggedFeature {
    pub feature_id: String,
    pub feature_name: String,
    pub conflict_score: u32,
    pub conflicts: Vec<ConflictDetail>,
    #[serde(flatten)]
    pub remediation: Remediation,
    /// Completed feature id first, flagged candidate second.
    pub dependency_chain: Vec<String>,
}

/// Full result of one impact analysis pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImpactAssessment {
    pub trigger: Trigger,
    /// Completed feature that fired the analysis.
    pub trigger_feature_id: Option<String>,
    /// Category that closed out, for category-completion triggers.
    pub trigger_category: Option<String>,
    pub analyzed_features: usize,
    pub flagged_features: Vec<FlaggedFeature>,
    pub analysis_time_ms: u64,
    pub timestamp: i64,
}

impl ImpactAssessment {
    fn empty(trigger: Trigger) -> Self {
        Self {
            trigger,
            trigger_feature_id: None,
            trigger_category: None,
            analyzed_features: 0,
            flagged_features: Vec::new(),
            analysis_time_ms: 0,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// One entry in the revision-flags ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevisionFlag {
    pub feature_id: String,
    pub status: String,
    pub conflict_score: u32,
    pub recommendation: String,
    pub flagged_at: i64,
    pub flagged_by: String,
    pub resolved_at: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevisionStats {
    pub total_flagged: usize,
    pub pending_revision: usize,
    pub auto_adjusted: usize,
    pub manually_revised: usize,
    pub major_respecs: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevisionFlags {
    #[serde(default)]
    pub flags: Vec<RevisionFlag>,
    #[serde(default)]
    pub stats: RevisionStats,
}

pub struct ImpactEngine {
    impact_dir: PathBuf,
    store: Arc<StateStore>,
    emitter: Arc<EventEmitter>,
}

impl ImpactEngine {
    pub fn new(impact_dir: PathBuf, store: Arc<StateStore>, emitter: Arc<EventEmitter>) -> Self {
        Self {
            impact_dir,
            store,
            emitter,
        }
    }

    /// Analyze remaining pending features against the completed one.
    ///
    /// Never fails: internal errors are reported on the event stream and an
    /// empty assessment is returned so the loop keeps moving.
    pub fn assess(
        &self,
        trigger: Trigger,
        scope: Scope,
        completed: &Feature,
        features: &[Feature],
    ) -> ImpactAssessment {
        match self.try_assess(trigger, scope, completed, features) {
            Ok(assessment) => assessment,
            Err(e) => {
                self.emitter
                    .emit_error(format!("Impact analysis failed: {e:#}"));
                ImpactAssessment::empty(trigger)
            }
        }
    }

    fn try_assess(
        &self,
        trigger: Trigger,
        scope: Scope,
        completed: &Feature,
        features: &[Feature],
    ) -> Result<ImpactAssessment> {
        let started = Instant::now();

        let candidates: Vec<&Feature> = features
            .iter()
            .filter(|f| f.status == FeatureStatus::Pending)
            .filter(|f| match scope {
                Scope::AllRemaining => true,
                Scope::DirectDependents => f.dependencies.contains(&completed.id),
            })
            .collect();

        let mut flagged = Vec::new();
        for candidate in &candidates {
            let conflicts = detectors::detect_all(completed, candidate);
            if conflicts.is_empty() {
                continue;
            }
            let mut score: u32 = conflicts.iter().map(|c| c.severity).sum();
            if candidate.dependencies.contains(&completed.id) {
                score += DIRECT_DEPENDENCY_SCORE;
            }
            // Every conflicted candidate is flagged, no-action included, so
            // the ledger keeps a record even when nothing needs changing.
            let remediation = Remediation::from_conflicts(score, &conflicts);
            flagged.push(FlaggedFeature {
                feature_id: candidate.id.clone(),
                feature_name: candidate.name.clone(),
                conflict_score: score,
                conflicts,
                remediation,
                dependency_chain: vec![completed.id.clone(), candidate.id.clone()],
            });
        }

        let assessment = ImpactAssessment {
            trigger,
            trigger_feature_id: Some(completed.id.clone()),
            trigger_category: match trigger {
                Trigger::CategoryCompletion => Some(completed.category.clone()),
                Trigger::HighRiskCompletion => None,
            },
            analyzed_features: candidates.len(),
            flagged_features: flagged,
            analysis_time_ms: started.elapsed().as_millis() as u64,
            timestamp: chrono::Utc::now().timestamp_millis(),
        };

        self.persist(trigger, completed, &assessment)?;

        self.emitter.emit(Event::Impact {
            trigger: trigger.as_str().to_string(),
            analyzed_features: assessment.analyzed_features,
            flagged_features: assessment.flagged_features.len(),
        });
        tracing::debug!(
            trigger = %trigger,
            analyzed = assessment.analyzed_features,
            flagged = assessment.flagged_features.len(),
            "impact analysis complete"
        );

        Ok(assessment)
    }

    fn persist(
        &self,
        trigger: Trigger,
        completed: &Feature,
        assessment: &ImpactAssessment,
    ) -> Result<()> {
        let file = match trigger {
            Trigger::HighRiskCompletion => self
                .impact_dir
                .join(format!("high-risk-{}.json", completed.id)),
            Trigger::CategoryCompletion => self
                .impact_dir
                .join(format!("category-{}-impact.json", completed.category)),
        };
        store::write_json(&file, assessment)?;

        if !assessment.flagged_features.is_empty() {
            self.record_flags(&assessment.flagged_features)?;
        }

        let mut updates = serde_json::Map::new();
        updates.insert(
            "impactAssessment".to_string(),
            json!({
                "trigger": trigger.as_str(),
                "analyzedFeatures": assessment.analyzed_features,
                "flaggedFeatures": assessment.flagged_features.len(),
                "timestamp": assessment.timestamp,
            }),
        );
        self.store.merge(updates)?;
        Ok(())
    }

    fn record_flags(&self, flagged: &[FlaggedFeature]) -> Result<()> {
        let file = self.impact_dir.join("revision-flags.json");
        let mut ledger: RevisionFlags = store::read_json(&file).unwrap_or_default();
        let now = chrono::Utc::now().timestamp_millis();

        for feature in flagged {
            ledger.flags.push(RevisionFlag {
                feature_id: feature.feature_id.clone(),
                status: "pending-revision".to_string(),
                conflict_score: feature.conflict_score,
                recommendation: feature.remediation.tier().to_string(),
                flagged_at: now,
                flagged_by: feature
                    .dependency_chain
                    .first()
                    .cloned()
                    .unwrap_or_else(|| "unknown".to_string()),
                resolved_at: None,
            });
        }

        ledger.stats = RevisionStats {
            total_flagged: ledger.flags.len(),
            pending_revision: ledger
                .flags
                .iter()
                .filter(|f| f.status == "pending-revision")
                .count(),
            auto_adjusted: ledger
                .flags
                .iter()
                .filter(|f| f.status == "auto-adjusted")
                .count(),
            manually_revised: ledger
                .flags
                .iter()
                .filter(|f| f.status == "manually-revised")
                .count(),
            major_respecs: ledger
                .flags
                .iter()
                .filter(|f| f.recommendation == "major-respec")
                .count(),
        };
        store::write_json(&file, &ledger)?;
        Ok(())
    }

    /// Load the revision-flags ledger.
    pub fn load_flags(&self) -> RevisionFlags {
        store::read_json(&self.impact_dir.join("revision-flags.json")).unwrap_or_default()
    }
}
