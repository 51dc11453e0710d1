use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use illustration_pipeline::{PipelineConfig, PipelineCoordinator, Scheduler, Storage};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "illustrate", about = "Harvests feeds for sermon illustrations: scores relevance and tags themes")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config/pipeline.toml", global = true)]
    config: PathBuf,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the pipeline once over every enabled source and print the run report
    Run,
    /// Keep running, fetching each source when its interval comes due
    Watch,
    /// List configured sources
    Sources,
    /// Validate the configuration and exit
    CheckConfig,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn build(config: &PipelineConfig) -> anyhow::Result<PipelineCoordinator> {
    let storage = Storage::open(&config.storage)
        .await
        .context("opening article store")?;
    PipelineCoordinator::from_config(config, storage).context("building pipeline")
}

async fn run(cli: Cli) -> anyhow::Result<bool> {
    let config = PipelineConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    match cli.command {
        Command::CheckConfig => {
            config.validate().context("invalid configuration")?;
            println!(
                "configuration OK: {} source(s), {} theme(s)",
                config.sources.len(),
                config.pipeline.vocabulary().len()
            );
            Ok(true)
        }
        Command::Sources => {
            let registry = config.registry().context("invalid sources")?;
            for source in registry.all() {
                println!(
                    "{:<24} {:<11} {:<8} every {:>6}s  {}",
                    source.id,
                    source.discipline,
                    if source.enabled { "enabled" } else { "disabled" },
                    source.fetch_interval.as_secs(),
                    source.endpoint
                );
            }
            Ok(true)
        }
        Command::Run => {
            let coordinator = build(&config).await?;
            let report = coordinator.run().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(report.is_completed())
        }
        Command::Watch => {
            let coordinator = Arc::new(build(&config).await?);
            let scheduler = Scheduler::new(coordinator);
            let shutdown = async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("Failed to listen for Ctrl-C: {}", e);
                    std::future::pending::<()>().await;
                }
                info!("Shutdown requested");
            };
            scheduler.run_until(shutdown).await;
            Ok(true)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(2),
        Err(e) => {
            error!("{:#}", e);
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
