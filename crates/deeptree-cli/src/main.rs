use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use deeptree_core::render::{render_outline, render_text};
use deeptree_core::stub::offline_capabilities;
use deeptree_core::{
    CancellationToken, Config, ConfigLoader, DEFAULT_DEPTH, DEFAULT_MAX_QUESTIONS,
    EventCollector, Orchestrator, ResearchError, ResearchEvent, ResearchQuery, TelemetryOptions,
    init_metrics_from_env, init_telemetry,
};
use tokio::runtime::Runtime;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};

/// Engine settings used by `--offline` when no configuration file is found.
const OFFLINE_CONFIG: &str = include_str!("../offline.toml");

#[derive(Parser, Debug)]
#[command(
    name = "deeptree-cli",
    version,
    about = "Hierarchical web research from the terminal"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Research a topic and print the compiled report.
    Run(RunArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Topic to research.
    #[arg(long)]
    topic: String,

    /// Levels of sub-questions below the root questions.
    #[arg(long, default_value_t = DEFAULT_DEPTH)]
    depth: usize,

    /// Number of root questions to generate.
    #[arg(long, default_value_t = DEFAULT_MAX_QUESTIONS)]
    max_questions: usize,

    /// Configuration file (falls back to `DEEPTREE_CONFIG`, then `config.toml`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Use the deterministic in-process providers; no network access.
    #[arg(long)]
    offline: bool,

    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
    Outline,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let rt = Runtime::new()?;
    rt.block_on(async move {
        match cli.command {
            Command::Run(args) => run_command(args).await?,
        }
        Ok::<(), anyhow::Error>(())
    })?;

    Ok(())
}

async fn run_command(args: RunArgs) -> Result<()> {
    let config = load_config(args.config.clone(), args.offline)?;
    init_telemetry(TelemetryOptions::from_logging(&config.logging))?;
    init_metrics_from_env("deeptree-cli");

    let orchestrator = if args.offline {
        Orchestrator::with_capabilities(&config, offline_capabilities())
    } else {
        Orchestrator::from_config(&config)
    };
    let orchestrator = orchestrator.context("failed to build orchestrator")?;

    let (events, receiver) = EventCollector::new();
    let orchestrator = orchestrator.with_events(events);
    let progress = tokio::spawn(log_progress(receiver));

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling research run");
            ctrl_c.cancel();
        }
    });

    let query = ResearchQuery::new(args.topic, args.depth, args.max_questions);
    info!(
        topic = %query.topic,
        depth = query.depth,
        max_questions = query.max_questions,
        offline = args.offline,
        "starting research run"
    );

    let outcome = orchestrator.run_with_cancel(&query, cancel).await;
    // Dropping the orchestrator closes the event channel so the logger drains.
    drop(orchestrator);
    if let Err(err) = progress.await {
        debug!(error = %err, "progress logger ended abnormally");
    }

    let report = outcome?;
    let rendered = match args.format {
        OutputFormat::Text => render_text(&report),
        OutputFormat::Outline => render_outline(&report),
        OutputFormat::Json => serde_json::to_string_pretty(&report)?,
    };
    println!("{rendered}");
    Ok(())
}

fn load_config(path: Option<PathBuf>, offline: bool) -> Result<Config> {
    match ConfigLoader::load(path) {
        Ok(config) => Ok(config),
        Err(ResearchError::ConfigIo { path, .. }) if offline => {
            debug!(
                path = %path.display(),
                "no configuration file, using built-in offline settings"
            );
            ConfigLoader::from_toml(OFFLINE_CONFIG).context("built-in configuration is invalid")
        }
        Err(err) => Err(err).context("failed to load DeepTree configuration"),
    }
}

async fn log_progress(mut receiver: UnboundedReceiver<ResearchEvent>) {
    while let Some(event) = receiver.recv().await {
        match event {
            ResearchEvent::PhaseChanged { from, to, .. } => {
                info!(from = from.as_str(), to = to.as_str(), "phase");
            }
            ResearchEvent::TreeExpanded {
                roots, questions, ..
            } => {
                info!(roots, questions, "question tree expanded");
            }
            ResearchEvent::NodeRetrieved {
                question_id,
                sources,
                error: Some(error),
                ..
            } => {
                warn!(question = %question_id, sources, error = %error, "retrieval failed");
            }
            ResearchEvent::NodeRetrieved {
                question_id,
                sources,
                ..
            } => {
                info!(question = %question_id, sources, "sources retrieved");
            }
            ResearchEvent::SourceFinished {
                question_id,
                url,
                status,
                duration_ms,
                ..
            } => {
                debug!(
                    question = %question_id,
                    url = %url,
                    status = status.as_str(),
                    duration_ms,
                    "source finished"
                );
            }
            ResearchEvent::Completed {
                stats,
                degraded,
                duration_ms,
                ..
            } => {
                info!(
                    questions = stats.questions,
                    sources = stats.sources,
                    analyzed = stats.analyzed,
                    failed = stats.failed,
                    degraded,
                    duration_ms,
                    "research complete"
                );
            }
        }
    }
}
