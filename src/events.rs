//! Newline-delimited JSON event stream.
//!
//! Events are the sole interface to any host process consuming the
//! orchestrator: one JSON object per line on stdout, each stamped with a
//! millisecond timestamp. Human-oriented diagnostics go through `tracing`
//! on stderr so the two streams never interleave.

use serde::Serialize;
use serde_json::Value;
use std::io::Write;
use std::sync::Mutex;

/// A structured event for the host process.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Event {
    /// Progress update from the loop or an engine.
    #[serde(rename_all = "camelCase")]
    Progress {
        phase: String,
        iteration: u32,
        message: String,
    },
    /// Lifecycle status change (starting, running, paused, completed, error).
    #[serde(rename_all = "camelCase")]
    Status {
        status: String,
        phase: String,
        iteration: u32,
    },
    /// Checkpoint preview emitted before a feature is dispatched.
    #[serde(rename_all = "camelCase")]
    Checkpoint {
        feature_id: String,
        decision: String,
        risk_score: u32,
        reason: String,
    },
    /// Summary of an impact assessment run.
    #[serde(rename_all = "camelCase")]
    Impact {
        trigger: String,
        analyzed_features: usize,
        flagged_features: usize,
    },
    /// Collaborator output for a feature.
    Stdout { data: String },
    /// Non-fatal errors and collaborator failures.
    Stderr { data: String },
    /// Startup and shutdown notices.
    System { data: String },
    /// Fatal configuration or input problems.
    Error { data: String },
}

/// Writes events as NDJSON to a sink (stdout in production).
pub struct EventEmitter {
    sink: Mutex<Box<dyn Write + Send>>,
}

impl EventEmitter {
    /// Emit to the process's standard output.
    pub fn stdout() -> Self {
        Self::with_sink(Box::new(std::io::stdout()))
    }

    /// Emit to an arbitrary sink. Used by tests to capture the stream.
    pub fn with_sink(sink: Box<dyn Write + Send>) -> Self {
        Self {
            sink: Mutex::new(sink),
        }
    }

    /// Serialize and write one event line, stamping `timestamp` (ms).
    ///
    /// Emission is best-effort: a failed write is logged and swallowed so
    /// event plumbing can never take down the loop.
    pub fn emit(&self, event: Event) {
        let mut value = match serde_json::to_value(&event) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize event");
                return;
            }
        };
        if let Value::Object(ref mut map) = value {
            map.insert(
                "timestamp".to_string(),
                Value::from(chrono::Utc::now().timestamp_millis()),
            );
        }
        let mut sink = self.sink.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = writeln!(sink, "{}", value) {
            tracing::warn!(error = %e, "failed to write event");
        }
        let _ = sink.flush();
    }

    /// Shorthand for a `stderr` event carrying an error message.
    pub fn emit_error(&self, message: impl Into<String>) {
        self.emit(Event::Stderr {
            data: message.into(),
        });
    }
}
