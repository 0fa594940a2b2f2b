//! Withdrawal Anomaly Pipeline - Main Entry Point
//!
//! Trains per-cohort outlier models from a transaction table and scores new
//! account feature rows against them.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use withdrawal_anomaly_pipeline::{
    config::{AppConfig, LogFormat, DEFAULT_CONFIG_PATH},
    source::{self, BanList},
    FsArtifactStore, Pipeline,
};

#[derive(Parser)]
#[command(name = "withdrawal-anomaly-pipeline")]
#[command(about = "Cohort-partitioned anomaly detection for cash withdrawals")]
#[command(version)]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Artifact store root (overrides store.root)
    #[arg(long)]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Partition accounts and train one model per cohort
    Train {
        /// Transaction table (overrides input.transactions)
        #[arg(short, long)]
        transactions: Option<PathBuf>,

        /// Banned districts table (overrides input.banned_districts)
        #[arg(short, long)]
        banned: Option<PathBuf>,
    },
    /// Score account feature rows with the persisted cohort models
    Score {
        /// Scoring table (overrides input.scoring)
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Score only the first N rows (overrides input.scoring_limit)
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// Train, then score
    Run,
}

fn init_logging(config: &AppConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("withdrawal_anomaly_pipeline={}", config.logging.level)))
        .context("Invalid log level")?;

    match config.logging.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
        LogFormat::Pretty => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
    Ok(())
}

async fn train(pipeline: &Pipeline) -> Result<()> {
    let input = &pipeline.config().input;
    let bans = match &input.banned_districts {
        Some(path) => source::load_ban_list(path)
            .with_context(|| format!("Failed to read ban list {}", path.display()))?,
        None => BanList::default(),
    };
    info!(districts = bans.len(), "Ban list loaded");

    let records = source::load_transactions(&input.transactions, &bans)
        .with_context(|| format!("Failed to read transactions {}", input.transactions.display()))?;

    let summary = pipeline.train(records).await?;
    if !summary.failures.is_empty() {
        tracing::warn!(failed = summary.failures.len(), "Some cohorts did not train");
    }
    Ok(())
}

async fn score(pipeline: &Pipeline) -> Result<()> {
    let input = &pipeline.config().input;
    let rows = source::load_scoring_rows(&input.scoring, input.scoring_limit)
        .with_context(|| format!("Failed to read scoring rows {}", input.scoring.display()))?;

    let report = pipeline.score(rows).await?;
    for failure in &report.failures {
        info!(
            account_id = failure.account_id,
            cohort_id = ?failure.cohort_id,
            error = %failure.error,
            "Row not scored"
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load_from_path(&cli.config)?;
    if let Some(root) = cli.store {
        config.store.root = root;
    }
    match &cli.command {
        Commands::Train {
            transactions,
            banned,
        } => {
            if let Some(path) = transactions {
                config.input.transactions = path.clone();
            }
            if let Some(path) = banned {
                config.input.banned_districts = Some(path.clone());
            }
        }
        Commands::Score { input, limit } => {
            if let Some(path) = input {
                config.input.scoring = path.clone();
            }
            if limit.is_some() {
                config.input.scoring_limit = *limit;
            }
        }
        Commands::Run => {}
    }

    init_logging(&config)?;
    info!("Starting Withdrawal Anomaly Pipeline");
    info!(
        store = %config.store.root.display(),
        n_clusters = config.clustering.n_clusters,
        contamination = config.detection.contamination,
        workers = config.pipeline.workers,
        "Configuration loaded successfully"
    );

    let store = Arc::new(FsArtifactStore::new(&config.store.root));
    let pipeline = Pipeline::new(config, store)?;

    match cli.command {
        Commands::Train { .. } => train(&pipeline).await?,
        Commands::Score { .. } => score(&pipeline).await?,
        Commands::Run => {
            train(&pipeline).await?;
            score(&pipeline).await?;
        }
    }

    pipeline.metrics().print_summary();
    Ok(())
}
