mod artifact;
mod cli;
mod config;
mod db;
mod jobs;
mod models;
mod parser;
mod sandbox;
mod scan;
mod security;
mod store;

use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    cli::{Cli, Command},
    config::AppConfig,
    store::SqliteJobStore,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = Arc::new(AppConfig::load(cli.config.as_deref())?);

    let pool = db::create_pool(&config.database_url).await?;
    db::run_migrations(&pool).await?;
    let store = SqliteJobStore::new(pool);

    match cli.subcommand() {
        Command::Run { drain } => {
            let shutdown = CancellationToken::new();
            tokio::spawn(shutdown_signal(shutdown.clone()));
            cli::run_worker(config, store, drain, shutdown).await?;
        }
        Command::Enqueue { target, name, kind } => {
            let id = cli::enqueue(&store, &target, &name, &kind).await?;
            println!("{id}");
        }
        Command::Requeue { job_id } => cli::requeue(&store, &job_id).await?,
        Command::Show { job_id } => {
            let report = cli::show(&store, &job_id).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Verify { job_id } => {
            let report = cli::verify(&store, &job_id).await?;
            if !report.intact() {
                error!(
                    job_id = %job_id,
                    recorded = %report.recorded,
                    actual = %report.actual,
                    "artifact hash mismatch"
                );
                anyhow::bail!(
                    "artifact {} does not match its recorded hash",
                    report.path.display()
                );
            }
            println!("{}  {}", report.actual, report.path.display());
        }
    }
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown requested, finishing the current job"),
        Err(e) => warn!(error = %e, "failed to listen for ctrl-c"),
    }
    shutdown.cancel();
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_writer(std::io::stderr)
        .init();
}
