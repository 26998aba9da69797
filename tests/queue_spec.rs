use anyhow::Result;
use assert_cmd::Command;
use async_trait::async_trait;
use predicates::prelude::*;
use serde_json::{Value, json};
use std::io::Write;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use waypoint::collaborator::Collaborator;
use waypoint::config::Config;
use waypoint::events::EventEmitter;
use waypoint::orchestrator::QueueRunner;
use waypoint::store::StateStore;

/// Collaborator that replies from a fixed script, one entry per dispatch.
struct ScriptedCollaborator {
    responses: Mutex<Vec<Result<String, String>>>,
}

impl ScriptedCollaborator {
    fn passing(count: usize) -> Self {
        Self {
            responses: Mutex::new(vec![Ok("All tests pass.".to_string()); count]),
        }
    }

    fn from_script(script: Vec<Result<String, String>>) -> Self {
        Self {
            responses: Mutex::new(script),
        }
    }
}

#[async_trait]
impl Collaborator for ScriptedCollaborator {
    async fn send_message(&self, _prompt: &str, _system: Option<&str>) -> Result<String> {
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            anyhow::bail!("script exhausted");
        }
        responses.remove(0).map_err(|e| anyhow::anyhow!(e))
    }
}

/// Write sink that keeps everything in memory for later inspection.
#[derive(Clone)]
struct Capture(Arc<Mutex<Vec<u8>>>);

impl Capture {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(Vec::new())))
    }

    fn events(&self) -> Vec<Value> {
        let bytes = self.0.lock().unwrap();
        String::from_utf8_lossy(&bytes)
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }
}

impl Write for Capture {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn test_config(dir: &TempDir) -> Config {
    let mut config = Config::new(dir.path().to_path_buf(), None).unwrap();
    config.iteration_delay_ms = 0;
    config.pause_on_error = false;
    config
}

fn write_queue(config: &Config, features: Value) {
    std::fs::create_dir_all(&config.autonomous_dir).unwrap();
    std::fs::write(
        &config.feature_list_file,
        serde_json::to_string_pretty(&json!({ "features": features })).unwrap(),
    )
    .unwrap();
}

fn three_feature_queue() -> Value {
    json!([
        {
            "id": "feat-1",
            "name": "Polish button styles",
            "category": "frontend",
            "status": "pending",
            "files": ["src/ui/button.css"],
            "dependencies": [],
            "affectedFeatures": [],
            "spec": "Round the corners and fix hover color."
        },
        {
            "id": "feat-2",
            "name": "Add user listing endpoint",
            "category": "backend",
            "status": "pending",
            "files": [
                "src/api/users.ts",
                "src/services/user_service.ts",
                "src/types/user.ts",
                "src/index.ts"
            ],
            "dependencies": ["feat-1"],
            "affectedFeatures": [],
            "spec": "Expose GET /api/users returning the user roster."
        },
        {
            "id": "feat-3",
            "name": "OAuth sign-in",
            "category": "security",
            "status": "pending",
            "files": [
                "src/auth/oauth.ts",
                "src/auth/session.ts",
                "src/auth/callbacks.ts",
                "src/routes/login.ts",
                "src/middleware/guard.ts",
                "src/config/providers.ts",
                "src/types/identity.ts"
            ],
            "dependencies": ["feat-2"],
            "affectedFeatures": ["feat-4", "feat-5", "feat-6", "feat-7"],
            "spec": "Add oauth login with provider callbacks."
        }
    ])
}

#[tokio::test]
async fn full_queue_run_records_decisions_logs_and_context() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    write_queue(&config, three_feature_queue());

    let capture = Capture::new();
    let emitter = Arc::new(EventEmitter::with_sink(Box::new(capture.clone())));
    let mut runner = QueueRunner::new(
        config.clone(),
        emitter,
        Box::new(ScriptedCollaborator::passing(3)),
    );

    let report = runner.run().await.unwrap();
    assert_eq!(report.passed, 3);
    assert_eq!(report.failed, 0);

    // Every feature ended up passed, in FIFO order.
    let list: Value =
        serde_json::from_str(&std::fs::read_to_string(&config.feature_list_file).unwrap())
            .unwrap();
    for feature in list["features"].as_array().unwrap() {
        assert_eq!(feature["status"], "passed");
        assert!(feature["completedAt"].is_i64());
    }
    assert!(list["currentFeatureId"].is_null());

    // One checkpoint per feature, spread across all three tiers.
    let ledger: Value = serde_json::from_str(
        &std::fs::read_to_string(config.checkpoints_dir.join("decisions-log.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(ledger["stats"]["totalDecisions"], 3);
    assert_eq!(ledger["stats"]["autoProceed"], 1);
    assert_eq!(ledger["stats"]["softCheckpoints"], 1);
    assert_eq!(ledger["stats"]["hardCheckpoints"], 1);

    // Soft and hard checkpoints were auto-approved after emission.
    let hard: Value = serde_json::from_str(
        &std::fs::read_to_string(config.checkpoints_dir.join("checkpoint-feat-3.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(hard["decision"], "hard-checkpoint");
    assert_eq!(hard["riskScore"], 70);
    assert_eq!(hard["approved"], true);

    // A per-feature execution log exists for each feature.
    for id in ["feat-1", "feat-2", "feat-3"] {
        let log: Value = serde_json::from_str(
            &std::fs::read_to_string(config.logs_dir.join(format!("{id}.json"))).unwrap(),
        )
        .unwrap();
        assert_eq!(log["status"], "passed");
    }

    // The final summarize folded all three features into the blackboard.
    let store = StateStore::new(&config.state_dir);
    assert_eq!(store.get("totalFeaturesCompleted").unwrap(), 3);
    assert!(store.get("contextSummary").is_some());
    assert!(config.context_dir.join("running-summary.json").exists());

    // Each category closed out, so a category impact file exists per category.
    for category in ["frontend", "backend", "security"] {
        assert!(
            config
                .impact_dir
                .join(format!("category-{category}-impact.json"))
                .exists(),
            "missing impact file for {category}"
        );
    }

    // The event stream carried every checkpoint decision.
    let events = capture.events();
    let checkpoints: Vec<&Value> = events
        .iter()
        .filter(|e| e["type"] == "checkpoint")
        .collect();
    assert_eq!(checkpoints.len(), 3);
    assert_eq!(checkpoints[0]["decision"], "auto-proceed");
    assert_eq!(checkpoints[1]["decision"], "soft-checkpoint");
    assert_eq!(checkpoints[2]["decision"], "hard-checkpoint");
    assert!(events.iter().all(|e| e["timestamp"].is_i64()));
}

#[tokio::test]
async fn failed_dispatch_marks_feature_failed_and_run_continues() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    write_queue(
        &config,
        json!([
            {
                "id": "feat-1",
                "name": "First",
                "category": "general",
                "status": "pending",
                "files": [],
                "dependencies": [],
                "affectedFeatures": [],
                "spec": ""
            },
            {
                "id": "feat-2",
                "name": "Second",
                "category": "general",
                "status": "pending",
                "files": [],
                "dependencies": [],
                "affectedFeatures": [],
                "spec": ""
            }
        ]),
    );

    let emitter = Arc::new(EventEmitter::with_sink(Box::new(std::io::sink())));
    let mut runner = QueueRunner::new(
        config.clone(),
        emitter,
        Box::new(ScriptedCollaborator::from_script(vec![
            Err("collaborator crashed".to_string()),
            Ok("All tests pass.".to_string()),
        ])),
    );

    let report = runner.run().await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.passed, 1);

    let log: Value = serde_json::from_str(
        &std::fs::read_to_string(config.logs_dir.join("feat-1.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(log["status"], "failed");
    assert!(log["error"].as_str().unwrap().contains("collaborator crashed"));
}

#[tokio::test]
async fn run_without_success_marker_fails_the_feature() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    write_queue(
        &config,
        json!([{
            "id": "feat-1",
            "name": "Only",
            "category": "general",
            "status": "pending",
            "files": [],
            "dependencies": [],
            "affectedFeatures": [],
            "spec": ""
        }]),
    );

    let emitter = Arc::new(EventEmitter::with_sink(Box::new(std::io::sink())));
    let mut runner = QueueRunner::new(
        config.clone(),
        emitter,
        Box::new(ScriptedCollaborator::from_script(vec![Ok(
            "Implemented, did not run anything.".to_string(),
        )])),
    );

    let report = runner.run().await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.passed, 0);
}

#[tokio::test]
async fn stop_handle_halts_before_next_feature() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    write_queue(&config, three_feature_queue());

    let emitter = Arc::new(EventEmitter::with_sink(Box::new(std::io::sink())));
    let mut runner = QueueRunner::new(
        config.clone(),
        emitter,
        Box::new(ScriptedCollaborator::passing(3)),
    );
    runner.handle().stop();

    let report = runner.run().await.unwrap();
    assert_eq!(report.passed + report.failed, 0);

    let list: Value =
        serde_json::from_str(&std::fs::read_to_string(&config.feature_list_file).unwrap())
            .unwrap();
    assert_eq!(list["features"][0]["status"], "pending");

    // Nothing completed, so shutdown must not rewrite the rolling summary.
    assert!(!config.context_dir.join("running-summary.json").exists());
}

#[tokio::test]
async fn missing_feature_list_is_an_error() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);

    let emitter = Arc::new(EventEmitter::with_sink(Box::new(std::io::sink())));
    let mut runner = QueueRunner::new(config, emitter, Box::new(ScriptedCollaborator::passing(0)));
    assert!(runner.run().await.is_err());
}

#[test]
fn cli_help_mentions_feature_queues() {
    Command::cargo_bin("waypoint")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("feature queues"));
}

#[test]
fn cli_status_without_queue_reports_nothing_to_show() {
    let dir = TempDir::new().unwrap();
    Command::cargo_bin("waypoint")
        .unwrap()
        .args(["--project-dir"])
        .arg(dir.path())
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("No feature queue found"));
}

#[test]
fn cli_reset_requires_force() {
    let dir = TempDir::new().unwrap();
    std::fs::create_dir_all(dir.path().join(".autonomous")).unwrap();

    Command::cargo_bin("waypoint")
        .unwrap()
        .args(["--project-dir"])
        .arg(dir.path())
        .arg("reset")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--force"));

    Command::cargo_bin("waypoint")
        .unwrap()
        .args(["--project-dir"])
        .arg(dir.path())
        .args(["reset", "--force"])
        .assert()
        .success();
    assert!(!dir.path().join(".autonomous").exists());
}
