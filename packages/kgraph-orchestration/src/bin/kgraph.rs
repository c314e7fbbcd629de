/*
 * kgraph - operator CLI for the ingestion pipeline
 *
 * Reads batch state from the SQLite item store named in the pipeline
 * configuration (`--config` or KGRAPH_CONFIG).
 *
 * Usage:
 *   kgraph batches
 *   kgraph status <BATCH_ID> [--json]
 *   kgraph logs <BATCH_ID>
 *   kgraph pause <BATCH_ID>
 *   kgraph config
 */

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use kgraph_orchestration::{BatchController, BatchLocks, BatchStatusReport, PipelineConfig};
use kgraph_store::SqliteItemStore;

#[derive(Parser, Debug)]
#[command(name = "kgraph", about = "Knowledge-graph ingestion pipeline operator CLI")]
struct Cli {
    /// Pipeline configuration file (defaults to $KGRAPH_CONFIG, then built-in defaults)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List batches with their status
    Batches,
    /// Show status and per-stage item counts of a batch
    Status {
        batch_id: Uuid,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the operator log of a batch
    Logs { batch_id: Uuid },
    /// Request a pause at the next stage boundary
    Pause { batch_id: Uuid },
    /// Print the effective configuration as YAML
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::load(cli.config.as_deref()).context("loading configuration")?;

    if let Command::Config = cli.command {
        print!("{}", config.to_yaml()?);
        return Ok(());
    }

    let store = SqliteItemStore::new(&config.store.path)
        .with_context(|| format!("opening item store {}", config.store.path.display()))?;
    let controller = BatchController::new(Arc::new(store), BatchLocks::new());

    match cli.command {
        Command::Batches => {
            for batch in controller.list_batches().await? {
                let paused = if batch.paused { " (paused)" } else { "" };
                println!("{}  {:<32} {}{}", batch.id, batch.name, batch.status, paused);
            }
        }
        Command::Status { batch_id, json } => {
            let report = controller.get_batch_status(batch_id).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }
        }
        Command::Logs { batch_id } => {
            for entry in controller.list_logs(batch_id).await? {
                let stage = entry.stage.map(|s| s.as_str()).unwrap_or("-");
                println!(
                    "{:>5} {} {:<5} {:<12} {}",
                    entry.seq,
                    entry.at.format("%Y-%m-%d %H:%M:%S"),
                    entry.level.as_str(),
                    stage,
                    entry.message
                );
            }
        }
        Command::Pause { batch_id } => {
            controller.pause(batch_id).await?;
            println!("pause requested for {}", batch_id);
        }
        Command::Config => {}
    }

    Ok(())
}

fn print_report(report: &BatchStatusReport) {
    println!("═══════════════════════════════════════════════════════════════");
    println!("Batch {} ({})", report.name, report.batch_id);
    println!("═══════════════════════════════════════════════════════════════");
    println!("status:           {}", report.status);
    if let Some(stage) = report.stage {
        println!("stage:            {}", stage);
    }
    println!("paused:           {}", report.paused);
    println!("items:            {}", report.item_total);
    println!("outstanding jobs: {}", report.outstanding_jobs);
    match report.literacy_score {
        Some(score) => println!("literacy score:   {:.3}", score),
        None => println!("literacy score:   -"),
    }

    println!();
    for (stage, counts) in &report.counts {
        let line: Vec<String> = counts
            .iter()
            .filter(|(_, n)| **n > 0)
            .map(|(status, n)| format!("{}={}", status, n))
            .collect();
        println!("  {:<10} {}", stage, line.join(" "));
    }

    if !report.quality_warnings.is_empty() {
        println!();
        println!("quality warnings:");
        for warning in &report.quality_warnings {
            println!("  [{}] {}", warning.stage, warning.message);
        }
    }
}
