//! Collaborator seam: the external agent that actually implements features.
//!
//! The orchestrator is transport-agnostic; anything that can take a prompt
//! and return a transcript can sit behind this trait. The shipped
//! implementation shells out to a CLI agent, writing the prompt to stdin and
//! collecting stdout.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

#[async_trait]
pub trait Collaborator: Send + Sync {
    /// Send one implementation request and return the full response text.
    async fn send_message(&self, prompt: &str, system_prompt: Option<&str>) -> Result<String>;
}

/// Runs an external CLI agent as a subprocess per request.
pub struct CommandCollaborator {
    program: String,
    args: Vec<String>,
}

impl CommandCollaborator {
    pub fn new(command: &str) -> Self {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next().unwrap_or_else(|| "claude".to_string());
        Self {
            program,
            args: parts.collect(),
        }
    }
}

#[async_trait]
impl Collaborator for CommandCollaborator {
    async fn send_message(&self, prompt: &str, system_prompt: Option<&str>) -> Result<String> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(system) = system_prompt {
            cmd.env("COLLABORATOR_SYSTEM_PROMPT", system);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn collaborator '{}'", self.program))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(prompt.as_bytes())
                .await
                .context("failed to write prompt to collaborator stdin")?;
            // Dropping stdin closes the pipe so the child sees EOF.
        }

        let output = child
            .wait_with_output()
            .await
            .context("failed to wait for collaborator")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "collaborator exited with {}: {}",
                output.status,
                stderr.trim()
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_collaborator_round_trip() {
        let collaborator = CommandCollaborator::new("/bin/cat");
        let response = collaborator
            .send_message("implement the feature", None)
            .await
            .unwrap();
        assert_eq!(response, "implement the feature");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_collaborator_nonzero_exit_is_error() {
        let collaborator = CommandCollaborator::new("/bin/false");
        let result = collaborator.send_message("anything", None).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_command_parsing_splits_args() {
        let collaborator = CommandCollaborator::new("claude --print --model sonnet");
        assert_eq!(collaborator.program, "claude");
        assert_eq!(collaborator.args, vec!["--print", "--model", "sonnet"]);
    }
}
