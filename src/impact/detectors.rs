//! Conflict detectors for completed-vs-pending feature pairs.
//!
//! Each detector inspects one axis of interference and returns zero or more
//! conflicts with a fixed severity. Detectors are pure over the two feature
//! documents; all I/O stays in the engine.

use crate::feature::{Feature, FeatureStatus};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

pub const API_BREAK_SEVERITY: u32 = 40;
pub const RESOURCE_COLLISION_SEVERITY: u32 = 20;
pub const ARCH_DRIFT_SEVERITY: u32 = 15;
pub const DEPENDENCY_INVALID_SEVERITY: u32 = 35;

/// Conflict taxonomy, in descending typical severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictKind {
    ApiBreak,
    DependencyInvalid,
    ResourceCollision,
    ArchDrift,
}

/// Machine-readable evidence backing a conflict.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Evidence {
    #[serde(rename_all = "camelCase")]
    Endpoint {
        expected_endpoint: String,
        completed_files: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    Architecture {
        pattern_type: String,
        completed_pattern: String,
        future_pattern: String,
    },
    #[serde(rename_all = "camelCase")]
    Files { overlapping_files: Vec<String> },
    #[serde(rename_all = "camelCase")]
    Dependency {
        dependency_id: String,
        dependency_status: String,
    },
}

/// One detected conflict between a completed and a pending feature.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictDetail {
    #[serde(rename = "type")]
    pub kind: ConflictKind,
    pub severity: u32,
    pub description: String,
    /// Files implicated in the conflict: the overlap for collisions, the
    /// completed feature's files otherwise.
    pub affected_files: Vec<String>,
    /// Id of the completed feature this conflict traces back to.
    pub completed_feature_id: String,
    pub evidence: Evidence,
}

/// Run all detectors for one completed/candidate pair.
pub fn detect_all(completed: &Feature, candidate: &Feature) -> Vec<ConflictDetail> {
    let mut conflicts = Vec::new();
    conflicts.extend(detect_api_breaks(completed, candidate));
    conflicts.extend(detect_arch_drift(completed, candidate));
    conflicts.extend(detect_resource_collisions(completed, candidate));
    conflicts.extend(detect_invalid_dependency(completed, candidate));
    conflicts
}

fn endpoint_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"/[a-zA-Z0-9/_-]+").expect("static regex"))
}

/// Pull `/api/...` and `/auth/...` endpoint paths out of free text.
pub fn extract_endpoints(text: &str) -> Vec<String> {
    endpoint_regex()
        .find_iter(text)
        .map(|m| m.as_str().to_string())
        .filter(|p| p.starts_with("/api") || p.starts_with("/auth"))
        .collect()
}

/// The candidate references endpoints while the completed feature touched
/// route-shaped files; those endpoints may no longer exist as specified.
fn detect_api_breaks(completed: &Feature, candidate: &Feature) -> Vec<ConflictDetail> {
    let endpoints = extract_endpoints(&candidate.spec);
    if endpoints.is_empty() {
        return Vec::new();
    }

    let touched_routes = completed.files.iter().any(|f| {
        let lower = f.to_lowercase();
        lower.contains("route")
            || lower.contains("api")
            || lower.contains("endpoint")
            || lower.contains("controller")
    });
    if !touched_routes {
        return Vec::new();
    }

    endpoints
        .into_iter()
        .map(|endpoint| ConflictDetail {
            kind: ConflictKind::ApiBreak,
            severity: API_BREAK_SEVERITY,
            description: format!("API endpoint {endpoint} may have changed"),
            affected_files: completed.files.clone(),
            completed_feature_id: completed.id.clone(),
            evidence: Evidence::Endpoint {
                expected_endpoint: endpoint,
                completed_files: completed.files.clone(),
            },
        })
        .collect()
}

/// Architectural vocabulary detected per axis from a feature's spec text.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArchPatterns {
    pub api: Option<String>,
    pub state: Option<String>,
    pub data: Option<String>,
    pub auth: Option<String>,
}

impl ArchPatterns {
    pub fn from_text(text: &str) -> Self {
        let lower = text.to_lowercase();
        let pick = |options: &[(&str, &str)]| -> Option<String> {
            options
                .iter()
                .find(|(needle, _)| lower.contains(needle))
                .map(|(_, label)| label.to_string())
        };
        Self {
            api: pick(&[("graphql", "graphql"), ("rest", "rest")]),
            state: pick(&[("redux", "redux"), ("context", "context")]),
            // The sql family is checked first, so "nosql" text classifies
            // as sql. Coarse, but matching what queue authors already see.
            data: pick(&[
                ("sql", "sql"),
                ("postgres", "sql"),
                ("mysql", "sql"),
                ("nosql", "nosql"),
                ("mongo", "nosql"),
            ]),
            auth: pick(&[("oauth", "oauth"), ("jwt", "jwt")]),
        }
    }

    fn axes(&self) -> [(&'static str, Option<&String>); 4] {
        [
            ("api", self.api.as_ref()),
            ("state", self.state.as_ref()),
            ("data", self.data.as_ref()),
            ("auth", self.auth.as_ref()),
        ]
    }
}

/// Both features commit to an architectural choice on the same axis but the
/// choices differ.
fn detect_arch_drift(completed: &Feature, candidate: &Feature) -> Vec<ConflictDetail> {
    let completed_patterns = ArchPatterns::from_text(&completed.spec);
    let candidate_patterns = ArchPatterns::from_text(&candidate.spec);

    completed_patterns
        .axes()
        .iter()
        .zip(candidate_patterns.axes().iter())
        .filter_map(|((axis, a), (_, b))| match (a, b) {
            (Some(a), Some(b)) if a != b => Some(ConflictDetail {
                kind: ConflictKind::ArchDrift,
                severity: ARCH_DRIFT_SEVERITY,
                description: format!("Architecture mismatch in {axis}: {a} vs {b}"),
                affected_files: completed.files.clone(),
                completed_feature_id: completed.id.clone(),
                evidence: Evidence::Architecture {
                    pattern_type: axis.to_string(),
                    completed_pattern: (*a).clone(),
                    future_pattern: (*b).clone(),
                },
            }),
            _ => None,
        })
        .collect()
}

/// Both features plan to modify the same files.
fn detect_resource_collisions(completed: &Feature, candidate: &Feature) -> Vec<ConflictDetail> {
    let candidate_files: std::collections::HashSet<&String> = candidate.files.iter().collect();
    let overlapping: Vec<String> = completed
        .files
        .iter()
        .filter(|f| candidate_files.contains(f))
        .cloned()
        .collect();
    if overlapping.is_empty() {
        return Vec::new();
    }
    vec![ConflictDetail {
        kind: ConflictKind::ResourceCollision,
        severity: RESOURCE_COLLISION_SEVERITY,
        description: format!("{} files modified by both features", overlapping.len()),
        affected_files: overlapping.clone(),
        completed_feature_id: completed.id.clone(),
        evidence: Evidence::Files {
            overlapping_files: overlapping,
        },
    }]
}

/// The candidate depends on a feature that failed.
fn detect_invalid_dependency(completed: &Feature, candidate: &Feature) -> Vec<ConflictDetail> {
    if completed.status != FeatureStatus::Failed
        || !candidate.dependencies.contains(&completed.id)
    {
        return Vec::new();
    }
    vec![ConflictDetail {
        kind: ConflictKind::DependencyInvalid,
        severity: DEPENDENCY_INVALID_SEVERITY,
        description: format!("Depends on failed feature {}", completed.id),
        affected_files: completed.files.clone(),
        completed_feature_id: completed.id.clone(),
        evidence: Evidence::Dependency {
            dependency_id: completed.id.clone(),
            dependency_status: "failed".to_string(),
        },
    }]
}
