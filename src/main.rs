use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use waypoint::collaborator::CommandCollaborator;
use waypoint::config::Config;
use waypoint::events::{Event, EventEmitter};
use waypoint::feature::FeatureList;
use waypoint::orchestrator::QueueRunner;
use waypoint::store::StateStore;

#[derive(Parser)]
#[command(name = "waypoint")]
#[command(version, about = "Risk-gated orchestrator for autonomous feature queues")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Path to a project spec used as the collaborator's system prompt.
    #[arg(long, global = true)]
    pub spec_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Work through the feature queue until it is empty
    Run {
        /// Maximum loop iterations before giving up
        #[arg(long)]
        max_iterations: Option<u32>,

        /// Command used to dispatch features (overrides WAYPOINT_CMD)
        #[arg(long)]
        collaborator_cmd: Option<String>,

        /// Keep going when a dispatch fails instead of pausing
        #[arg(long)]
        no_pause_on_error: bool,

        /// Delay between iterations, in milliseconds
        #[arg(long)]
        iteration_delay_ms: Option<u64>,
    },
    /// Show queue progress and the latest blackboard state
    Status,
    /// Delete orchestrator state (decisions, logs, context, blackboard)
    Reset {
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Run {
            max_iterations,
            collaborator_cmd,
            no_pause_on_error,
            iteration_delay_ms,
        } => {
            let mut config = Config::new(project_dir, cli.spec_file.clone())?;
            config.verbose = cli.verbose;
            if let Some(max) = max_iterations {
                config.max_iterations = *max;
            }
            if let Some(cmd) = collaborator_cmd {
                config.collaborator_cmd = cmd.clone();
            }
            if *no_pause_on_error {
                config.pause_on_error = false;
            }
            if let Some(delay) = iteration_delay_ms {
                config.iteration_delay_ms = *delay;
            }
            cmd_run(config).await?;
        }
        Commands::Status => cmd_status(&project_dir)?,
        Commands::Reset { force } => cmd_reset(&project_dir, *force)?,
    }

    Ok(())
}

async fn cmd_run(config: Config) -> Result<()> {
    let emitter = Arc::new(EventEmitter::stdout());
    let collaborator = Box::new(CommandCollaborator::new(&config.collaborator_cmd));
    let mut runner = QueueRunner::new(config, Arc::clone(&emitter), collaborator);

    let handle = runner.handle();
    let signal_emitter = Arc::clone(&emitter);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_emitter.emit(Event::System {
                data: "Interrupt received, finishing current feature".into(),
            });
            handle.stop();
        }
    });

    let report = match runner.run().await {
        Ok(report) => report,
        Err(e) => {
            emitter.emit(Event::Error {
                data: format!("{e}"),
            });
            return Err(e.into());
        }
    };
    tracing::info!(
        passed = report.passed,
        failed = report.failed,
        flagged = report.flagged_for_revision,
        "run complete"
    );
    Ok(())
}

fn cmd_status(project_dir: &PathBuf) -> Result<()> {
    let config = Config::new(project_dir.clone(), None)?;
    if !config.feature_list_file.exists() {
        println!("No feature queue found at {}", config.feature_list_file.display());
        return Ok(());
    }

    let list = FeatureList::load(&config.feature_list_file)?;
    let pending = list.pending().len();
    let total = list.features.len();
    println!("Features: {total} total, {pending} pending");
    for feature in &list.features {
        println!("  [{:?}] {} ({})", feature.status, feature.name, feature.id);
    }

    let store = StateStore::new(&config.state_dir);
    if let Some(summary) = store.get("contextSummary") {
        if let Some(tokens) = summary.get("tokenCount") {
            println!("Context summary: {tokens} tokens");
        }
    }
    if let Some(checkpoint) = store.get("checkpointDecision") {
        println!(
            "Last checkpoint: {} ({})",
            checkpoint.get("decision").cloned().unwrap_or_default(),
            checkpoint.get("featureId").cloned().unwrap_or_default(),
        );
    }
    Ok(())
}

fn cmd_reset(project_dir: &PathBuf, force: bool) -> Result<()> {
    let config = Config::new(project_dir.clone(), None)?;
    if !config.autonomous_dir.exists() {
        println!("Nothing to reset.");
        return Ok(());
    }
    if !force {
        anyhow::bail!(
            "Refusing to delete {} without --force",
            config.autonomous_dir.display()
        );
    }
    std::fs::remove_dir_all(&config.autonomous_dir).with_context(|| {
        format!("Failed to remove {}", config.autonomous_dir.display())
    })?;
    println!("Removed {}", config.autonomous_dir.display());
    Ok(())
}
