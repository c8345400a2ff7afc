//! workrun CLI: start a run or inspect one.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;
use uuid::Uuid;

use workrun::config::Config;
use workrun::event::TracingSink;
use workrun::generator::GeneratorConfig;
use workrun::model::RunId;
use workrun::orchestrator::{Orchestrator, RunConfig};
use workrun::processor::{DelayStep, ProcessorConfig};
use workrun::store::{PgStore, Store};
use workrun::telemetry::init_logging;

#[derive(Parser)]
#[command(name = "workrun", about = "Coordinated generate/process runs")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Drive one run to completion or fatal abort
    Run {
        /// Human label for the run
        label: String,
        /// Total items the generator produces
        #[arg(long, default_value_t = 1_000_000)]
        target: u64,
        /// Items per generated chunk
        #[arg(long, default_value_t = 1000)]
        chunk: usize,
        /// Items per claimed batch
        #[arg(long, default_value_t = 1000)]
        batch: usize,
    },
    /// Show a run row
    Status {
        /// Run ID
        id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;
    init_logging(&config.log_level);

    let store = Arc::new(PgStore::connect(config.database_url.expose_secret()).await?);

    match cli.command {
        Command::Run {
            label,
            target,
            chunk,
            batch,
        } => cmd_run(store, label, target, chunk, batch).await,
        Command::Status { id } => cmd_status(store, &id).await,
    }
}

async fn cmd_run(
    store: Arc<PgStore>,
    label: String,
    target: u64,
    chunk: usize,
    batch: usize,
) -> anyhow::Result<()> {
    let run_config = RunConfig {
        label,
        generator: GeneratorConfig {
            target,
            chunk_size: chunk,
            ..GeneratorConfig::default()
        },
        processor: ProcessorConfig {
            batch_size: batch,
            ..ProcessorConfig::default()
        },
        ..RunConfig::default()
    };

    let orchestrator = Arc::new(Orchestrator::new(
        store,
        Arc::new(TracingSink),
        Arc::new(DelayStep {
            delay: Duration::from_secs(1),
        }),
        run_config,
    ));

    let orch = Arc::clone(&orchestrator);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        orch.shutdown();
    });

    let summary = orchestrator.run().await?;
    println!(
        "run {} finished: state={} generated={} processed={}",
        summary.run.id, summary.run.state, summary.generated, summary.processed
    );
    Ok(())
}

async fn cmd_status(store: Arc<PgStore>, id: &str) -> anyhow::Result<()> {
    let run_id = RunId(Uuid::parse_str(id)?);
    let run = store.get_run(run_id).await?;

    println!("ID:          {}", run.id);
    println!("Label:       {}", run.label);
    println!("State:       {}", run.state);
    println!("Correlation: {}", run.correlation);
    println!("Started:     {}", run.started_at);
    match run.ended_at {
        Some(ended) => println!("Ended:       {ended}"),
        None => println!("Ended:       -"),
    }
    Ok(())
}
