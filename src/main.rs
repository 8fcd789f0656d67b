mod offline;
mod pipeline;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{CommandFactory, Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tessera_core::config::AppConfig;
use tessera_core::event::EventBus;
use tessera_core::types::{FieldStatus, OperatingMode, RunId};
use tessera_graph::{GraphExecutor, RunLogger, RunOptions, RunOutcome};

use crate::offline::OfflineModel;
use crate::pipeline::Models;

#[derive(Parser)]
#[command(name = "tessera", version, about = "Concurrent stage-graph executor")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "tessera.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the research pipeline for one ticker
    Run {
        /// Symbol to analyze
        ticker: String,
        /// Trade date (default: today)
        #[arg(long)]
        date: Option<String>,
        /// Debate rounds (capped by pipeline.round_ceiling)
        #[arg(long)]
        debate_rounds: Option<usize>,
        /// Risk discussion rounds (capped by pipeline.round_ceiling)
        #[arg(long)]
        risk_rounds: Option<usize>,
        /// Disable capability fallback retries for this run
        #[arg(long)]
        low_latency: bool,
        /// Run ID (auto-generated if not provided)
        #[arg(long)]
        run_id: Option<String>,
        /// Print the full outcome as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the pipeline graph
    Graph,
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("tessera=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Some(Commands::Completions { shell }) = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "tessera", &mut std::io::stdout());
        return Ok(());
    }

    let config = if cli.config.exists() {
        AppConfig::load(&cli.config)?
    } else {
        warn!(path = %cli.config.display(), "Config file not found, using defaults");
        AppConfig::default()
    };

    let models = Models {
        quick: Arc::new(OfflineModel::fast()),
        deep: Arc::new(OfflineModel::deep()),
    };

    match cli.command {
        Some(Commands::Run {
            ticker,
            date,
            debate_rounds,
            risk_rounds,
            low_latency,
            run_id,
            json,
        }) => {
            let mut options = RunOptions::from(&config.engine);
            if low_latency {
                options.mode = OperatingMode::LowLatency;
            }
            let graph = pipeline::build(&config.pipeline, &models)?;
            let bus = Arc::new(EventBus::default());
            let run_id = run_id.map(|id| RunId::from(id.as_str())).unwrap_or_default();
            let cancel = tokio_util::sync::CancellationToken::new();

            let logger = match &config.log {
                Some(log_config) if log_config.enabled => {
                    let logger = RunLogger::new(log_config.resolved_dir(), log_config.level);
                    info!("RunLogger started (level {})", log_config.level);
                    Some(logger.spawn(&bus, run_id.clone(), cancel.clone()))
                }
                _ => None,
            };

            let executor = GraphExecutor::new(graph)
                .with_actions(offline::data_actions())
                .with_options(options)
                .with_event_bus(bus.clone());

            let date = date.unwrap_or_else(|| chrono::Utc::now().format("%Y-%m-%d").to_string());
            let initial = pipeline::inputs(
                &ticker,
                &date,
                debate_rounds.unwrap_or(config.pipeline.max_debate_rounds),
                risk_rounds.unwrap_or(config.pipeline.max_risk_rounds),
            );

            let result = executor.run_with_id(run_id, initial).await;
            if result.is_err() {
                cancel.cancel();
            }
            if let Some(handle) = logger {
                match handle.await {
                    Ok(Some(path)) => info!(path = %path.display(), "Run log written"),
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "RunLogger task failed"),
                }
            }

            let outcome = match result {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(error = %e, "Run aborted");
                    return Err(e.into());
                }
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            } else {
                print_summary(&outcome);
            }
        }
        Some(Commands::Graph) => {
            let graph = pipeline::build(&config.pipeline, &models)?;
            println!("{} nodes, entry '{}'", graph.len(), graph.entry());
            for line in graph.describe() {
                println!("  {}", line);
            }
        }
        Some(Commands::Config) => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Some(Commands::Completions { .. }) => unreachable!("handled before config load"),
        None => {
            Cli::command().print_help()?;
        }
    }

    Ok(())
}

fn print_summary(outcome: &RunOutcome) {
    println!("Run {} ({} ms)", outcome.run_id, outcome.total_elapsed_ms);
    if let Some(report) = outcome.state.get_str("report") {
        println!();
        println!("{}", report);
        println!();
    }

    println!(
        "{} stages over {} branches",
        outcome.node_results.len(),
        outcome.branches.len()
    );
    let failed = outcome.failed_nodes();
    if !failed.is_empty() {
        println!("Failed: {}", failed.join(", "));
    }
    for field in &outcome.degraded {
        if let Some(FieldStatus::Degraded { reason }) = outcome.state.status(field) {
            println!("Degraded: {} ({})", field, reason);
        }
    }
    if !outcome.missing.is_empty() {
        println!("Missing: {}", outcome.missing.join(", "));
    }
}
