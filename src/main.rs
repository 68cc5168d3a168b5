use anyhow::Context;
use api_client::{BitgetClient, CachedVenue, VenueAdapter};
use clap::Parser;
use configuration::settings::Config;
use core_types::Strategy;
use database::{DbRepository, MemoryStore, StateStore, connect, database_url, run_migrations};
use engine::{Engine, provider_from_settings};
use executor::PaperVenue;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Keeps declared trading strategies and the venue in agreement.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path of the configuration file. Environment variables prefixed with
    /// `VIGIL__` override its values.
    #[arg(long, default_value = "config.toml")]
    config: String,

    /// Run against the in-memory paper venue instead of the exchange.
    #[arg(long)]
    paper: bool,
}

/// A strategy file holds one strategy or a list of them.
#[derive(Deserialize)]
#[serde(untagged)]
enum StrategyFile {
    Many(Vec<Strategy>),
    One(Strategy),
}

fn load_strategies(path: &Path) -> anyhow::Result<Vec<Strategy>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading strategy file {}", path.display()))?;
    let parsed: StrategyFile = serde_json::from_str(&raw)
        .with_context(|| format!("parsing strategy file {}", path.display()))?;
    Ok(match parsed {
        StrategyFile::Many(strategies) => strategies,
        StrategyFile::One(strategy) => vec![strategy],
    })
}

fn build_venue(config: &Config, paper: bool) -> anyhow::Result<Arc<dyn VenueAdapter>> {
    let inner: Arc<dyn VenueAdapter> = if paper {
        info!(balance = %config.engine.paper_balance, "using the paper venue");
        Arc::new(PaperVenue::new(config.engine.paper_balance))
    } else {
        // Invalid credentials are the one fatal startup error.
        Arc::new(BitgetClient::new(&config.venue).context("building the Bitget client")?)
    };
    Ok(Arc::new(CachedVenue::new(inner, config.venue.cache_ttl())))
}

async fn build_store() -> anyhow::Result<Arc<dyn StateStore>> {
    match database_url() {
        Some(url) => {
            let pool = connect(&url).await.context("connecting to the database")?;
            run_migrations(&pool).await.context("running database migrations")?;
            info!("persisting state to PostgreSQL");
            Ok(Arc::new(DbRepository::new(pool)))
        }
        None => {
            warn!("DATABASE_URL not set, state is kept in memory and lost on exit");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

/// The main entry point for the Vigil reconciliation engine.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = configuration::load_config(&cli.config).context("loading configuration")?;
    // The guard flushes the log file on drop, so it lives as long as `main`.
    let _log_guard = configuration::init_tracing(&config.logging)?;

    let venue = build_venue(&config, cli.paper)?;
    let store = build_store().await?;
    let provider = provider_from_settings(&config.decision)?;
    let strategy_file = config.engine.strategy_file.clone();

    let engine = Arc::new(Engine::new(config, venue, store, provider)?);
    if let Some(path) = strategy_file {
        for strategy in load_strategies(&path)? {
            let strategy_id = strategy.id.clone();
            if let Err(e) = engine.bus().publish(Some(engine.trader_id()), strategy) {
                error!(strategy_id = %strategy_id, error = %e, "strategy rejected");
            }
        }
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, stopping");
            let _ = stop_tx.send(true);
        }
    });

    engine.run(stop_rx).await?;
    Ok(())
}
