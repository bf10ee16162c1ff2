use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use palisade_bitget::{BitgetClient, BitgetClientConfig, BitgetGateway};
use palisade_core::{ConfigLoader, DriftClass, PalisadeConfig};
use palisade_reconciler::{
    FileTargetStore, InProcessMetrics, JsonlAuditStore, MemoryAuditStore, ReconcilerRunner,
    TracingNotifier,
};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "palisade")]
#[command(about = "Position-protection reconciler for Bitget USDT-futures", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the reconciliation loop until interrupted
    Run {
        /// Config file path
        #[arg(short, long, default_value = "config/Palisade.toml")]
        config: String,
        /// Accepted-signal export (JSON array)
        #[arg(long, default_value = "data/accepted_signals.json")]
        signals: String,
        /// Audit log path (JSON lines, append-only)
        #[arg(long, default_value = "data/audit.jsonl")]
        audit: String,
        /// Config profile overlay (e.g. "paper" loads Palisade.paper.toml)
        #[arg(long)]
        profile: Option<String>,
    },
    /// Run one detection-only pass and print the drift report
    Check {
        /// Config file path
        #[arg(short, long, default_value = "config/Palisade.toml")]
        config: String,
        /// Accepted-signal export (JSON array)
        #[arg(long, default_value = "data/accepted_signals.json")]
        signals: String,
    },
    /// Print the effective configuration after merging file and env
    Config {
        /// Config file path
        #[arg(short, long, default_value = "config/Palisade.toml")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            signals,
            audit,
            profile,
        } => run(&config, &signals, &audit, profile.as_deref()).await,
        Commands::Check { config, signals } => check(&config, &signals).await,
        Commands::Config { config } => print_config(&config),
    }
}

async fn run(
    config_path: &str,
    signals_path: &str,
    audit_path: &str,
    profile: Option<&str>,
) -> Result<()> {
    let config = load(config_path, profile)?;
    let config = Arc::new(config);

    let gateway = build_gateway(&config)?;
    let store = Arc::new(
        FileTargetStore::load(signals_path)
            .with_context(|| format!("loading accepted signals from {signals_path}"))?,
    );
    let audit = Arc::new(
        JsonlAuditStore::open(audit_path)
            .with_context(|| format!("opening audit log {audit_path}"))?,
    );
    let metrics = Arc::new(InProcessMetrics::new());
    let notifier = Arc::new(TracingNotifier::new());

    let runner = Arc::new(ReconcilerRunner::new(
        gateway,
        store,
        audit,
        metrics.clone(),
        notifier,
        config,
    ));

    let handle = runner.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
            handle.shutdown();
        }
    });

    runner.run().await;

    let snapshot = metrics.snapshot();
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

async fn check(config_path: &str, signals_path: &str) -> Result<()> {
    let config = Arc::new(load(config_path, None)?);

    let gateway = build_gateway(&config)?;
    let store = Arc::new(
        FileTargetStore::load(signals_path)
            .with_context(|| format!("loading accepted signals from {signals_path}"))?,
    );
    // A one-shot read-only pass keeps its audit in memory.
    let audit = Arc::new(MemoryAuditStore::new());
    let metrics = Arc::new(InProcessMetrics::new());
    let notifier = Arc::new(TracingNotifier::new());

    let runner = ReconcilerRunner::new(gateway, store, audit, metrics, notifier, config);
    let records = runner.detection_pass().await?;

    if records.is_empty() {
        println!("no open positions");
        return Ok(());
    }

    println!("{:<14} {:<12} {:>8} {:>11} {:>9}", "SYMBOL", "STATUS", "MISSING", "MISMATCHED", "ORPHANED");
    for record in &records {
        println!(
            "{:<14} {:<12} {:>8} {:>11} {:>9}",
            record.symbol,
            record.classification.as_str(),
            record.missing.len(),
            record.mismatched.len(),
            record.orphaned.len(),
        );
    }

    let drifted = records
        .iter()
        .filter(|r| r.classification.needs_remediation())
        .count();
    let unmanaged = records
        .iter()
        .filter(|r| r.classification == DriftClass::Unmanaged)
        .count();
    println!(
        "\n{} positions, {} drifted, {} unmanaged",
        records.len(),
        drifted,
        unmanaged
    );

    Ok(())
}

fn print_config(config_path: &str) -> Result<()> {
    let config = load(config_path, None)?;
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

fn load(config_path: &str, profile: Option<&str>) -> Result<PalisadeConfig> {
    match profile {
        Some(profile) => ConfigLoader::load_with_profile(config_path, profile),
        None => ConfigLoader::load(config_path),
    }
}

fn build_gateway(config: &Arc<PalisadeConfig>) -> Result<Arc<BitgetGateway>> {
    let client_config = BitgetClientConfig::from_exchange_config(&config.exchange)?;
    let client = BitgetClient::new(client_config).context("building Bitget client")?;
    Ok(Arc::new(BitgetGateway::new(client, Arc::clone(config))))
}
