//! reconflow command-line entry point
//!
//! Loads the run configuration, builds the pipeline (the built-in surface
//! pipeline or a JSON pipeline file) and validates or runs it.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use reconflow::config::{ExecutionMode, RunConfig};
use reconflow::dataset::DirectoryDataset;
use reconflow::runtime::{ExecutionEngine, NodeState, RunOutcome, StatusBoard};
use reconflow::workflow::storage::{load_pipeline, save_pipeline};
use reconflow::workflow::surface::{surface_pipeline, SUBJECT_AXIS};
use reconflow::workflow::PipelineTemplate;

#[derive(Parser)]
#[command(name = "reconflow", version, about = "Per-subject surface reconstruction pipelines")]
struct Cli {
    /// Path to a TOML config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// JSON pipeline file (default: built-in surface pipeline)
    #[arg(short, long, global = true)]
    pipeline: Option<PathBuf>,

    /// Subject to process; repeat for several (overrides subject_ids)
    #[arg(short, long = "subject", global = true)]
    subjects: Vec<String>,

    /// Execution mode: local or remote-queue
    #[arg(long, global = true)]
    mode: Option<ExecutionMode>,

    /// Maximum concurrent local workers
    #[arg(long, global = true)]
    workers: Option<usize>,

    /// Fingerprint inputs by size and mtime instead of content
    #[arg(long, global = true)]
    no_content_hash: bool,

    /// Neither read nor write the execution cache
    #[arg(long, global = true)]
    no_cache: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate and execute the pipeline
    Run,
    /// Validate only and print the execution plan
    Validate,
    /// Print the pipeline definition as JSON
    ShowPipeline {
        /// Write the definition to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let pipeline = build_pipeline(&cli, &config).await?;

    match &cli.command {
        Commands::ShowPipeline { output: Some(path) } => {
            save_pipeline(&pipeline, path).await?;
            println!("Wrote pipeline '{}' to {}", pipeline.name, path.display());
            Ok(ExitCode::SUCCESS)
        }
        Commands::ShowPipeline { output: None } => {
            println!("{}", serde_json::to_string_pretty(&pipeline)?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Validate => validate(config, &pipeline),
        Commands::Run => {
            let dataset = dataset_for(&cli, &config);
            run(config, &pipeline, dataset).await
        }
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<RunConfig> {
    let mut config = RunConfig::load(cli.config.as_deref())?;
    if !cli.subjects.is_empty() {
        config.subject_ids = cli.subjects.clone();
    }
    if let Some(mode) = cli.mode {
        config.execution_mode = mode;
    }
    if let Some(workers) = cli.workers {
        config.max_concurrent_local_workers = workers;
    }
    if cli.no_content_hash {
        config.enable_content_hash_cache = false;
    }
    if cli.no_cache {
        config.use_cache = false;
    }
    config.absolutize().context("Failed to resolve configured directories")?;
    Ok(config)
}

async fn build_pipeline(cli: &Cli, config: &RunConfig) -> anyhow::Result<PipelineTemplate> {
    match &cli.pipeline {
        Some(path) => {
            let pipeline = load_pipeline(path).await?;
            if config.subject_ids.is_empty() {
                Ok(pipeline)
            } else {
                Ok(pipeline.with_axis_values(SUBJECT_AXIS, config.subject_ids.clone()))
            }
        }
        None => Ok(surface_pipeline(config)),
    }
}

fn validate(config: RunConfig, pipeline: &PipelineTemplate) -> anyhow::Result<ExitCode> {
    let engine = ExecutionEngine::new(config);
    match engine.validate(pipeline) {
        Ok(graph) => {
            println!(
                "Pipeline '{}' is valid: {} instances in {} tuple families",
                graph.name(),
                graph.instances().len(),
                graph.tuples().len()
            );
            for (step, id) in graph.order().iter().enumerate() {
                println!("  {:>3}. {}", step + 1, graph.instance(*id).key);
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(errors) => {
            eprintln!("Pipeline '{}' is invalid:\n{}", pipeline.name, errors);
            Ok(ExitCode::FAILURE)
        }
    }
}

/// The built-in pipeline only consumes T1 images, so discovery keeps just those
fn dataset_for(cli: &Cli, config: &RunConfig) -> DirectoryDataset {
    let dataset = DirectoryDataset::new(config.dataset_root());
    match cli.pipeline {
        Some(_) => dataset,
        None => dataset.with_suffix(config.surface.t1_suffix.clone()),
    }
}

async fn run(config: RunConfig, pipeline: &PipelineTemplate, dataset: DirectoryDataset) -> anyhow::Result<ExitCode> {
    let engine = ExecutionEngine::new(config);

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("🛑 Interrupt received, cancelling run");
                cancel.cancel();
            }
        }
    });
    let progress = tokio::spawn(log_progress(engine.status_board()));

    let report = engine.run(pipeline, &dataset, cancel).await;
    progress.abort();
    let report = report?;

    println!("{}", report);
    Ok(if report.outcome == RunOutcome::Succeeded {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn log_progress(board: Arc<StatusBoard>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(30));
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let snapshot = board.snapshot();
        if snapshot.finished {
            break;
        }
        tracing::info!(
            "⏳ {}/{} nodes done ({} running, {} submitted, {} failed)",
            snapshot.done(),
            snapshot.total,
            snapshot.count(NodeState::Running),
            snapshot.count(NodeState::Submitted),
            snapshot.count(NodeState::Failed)
        );
    }
}
