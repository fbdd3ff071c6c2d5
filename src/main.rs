use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use walletwatch_indexer::api::{self, AppState};
use walletwatch_indexer::cache;
use walletwatch_indexer::config::Config;
use walletwatch_indexer::price::LlamaPriceOracle;
use walletwatch_indexer::rpc::pool::{run_health_probe, ProviderPool};
use walletwatch_indexer::scan::head_scanner::run_head_scanner;
use walletwatch_indexer::snapshot::SnapshotEngine;
use walletwatch_indexer::tokens::TokenRegistry;
use walletwatch_indexer::tracked::{
    run_refresher, run_tracked_set_refresher, TrackedSet, TrackedWallets,
};

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(e) = color_eyre::install() {
        eprintln!("failed to install error reporting: {e}");
        return ExitCode::FAILURE;
    }

    // Structured logging (set RUST_LOG=info for output)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Fatal initialization error");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> eyre::Result<()> {
    tracing::info!("WalletWatch Indexer starting");

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());
    let config = Arc::new(Config::load(&config_path)?);
    tracing::info!(
        chains = config.chains.len(),
        "Configuration loaded from {}",
        config_path
    );

    // Database. Unreachable at startup is fatal; every statement carries a
    // timeout so background tasks cannot pin the pool.
    let connect_options = PgConnectOptions::from_str(&config.database.url)
        .map_err(|e| eyre::eyre!("Invalid database URL: {}", e))?
        .options([("statement_timeout", "5000")]);
    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect_with(connect_options)
        .await
        .map_err(|e| eyre::eyre!("Failed to connect to database: {}", e))?;
    tracing::info!("Connected to PostgreSQL");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|e| eyre::eyre!("Failed to run migrations: {}", e))?;
    tracing::info!("Database migrations complete");

    // RPC providers; at least one healthy chain is required to start.
    let providers = Arc::new(ProviderPool::from_config(&config.chains, &config.rpc)?);
    let mut any_reachable = false;
    for profile in &config.chains {
        match providers.chain(profile.chain_id) {
            Ok(chain) => match chain.block_number().await {
                Ok(block) => {
                    any_reachable = true;
                    tracing::info!(chain = %profile.name, block, "Chain reachable");
                }
                Err(e) => {
                    tracing::warn!(chain = %profile.name, error = %e, "Chain unreachable at startup")
                }
            },
            Err(e) => tracing::warn!(chain = %profile.name, error = %e, "No providers"),
        }
    }
    if !any_reachable {
        return Err(eyre::eyre!("No healthy RPC provider on any configured chain"));
    }

    // Long-lived services, passed explicitly to every task.
    let registry = Arc::new(TokenRegistry::new(pool.clone()));
    registry.seed(&config.chains).await?;
    tracing::info!("Verified tokens seeded");

    let oracle = Arc::new(LlamaPriceOracle::new(&config.price));
    let engine = Arc::new(SnapshotEngine::new(
        pool.clone(),
        Arc::clone(&config),
        Arc::clone(&providers),
        Arc::clone(&registry),
        oracle,
    ));
    let tracked = Arc::new(TrackedWallets::new(pool.clone()));
    let tracked_set = Arc::new(TrackedSet::new());

    let shutdown = CancellationToken::new();
    let mut handles = Vec::new();

    // One head scanner per chain, supervised: a panicked tick restarts the
    // scanner rather than taking the process down.
    for profile in config.chains.clone() {
        let engine = Arc::clone(&engine);
        let tracked_set = Arc::clone(&tracked_set);
        let pool = pool.clone();
        let shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            loop {
                let scanner = tokio::spawn(run_head_scanner(
                    Arc::clone(&engine),
                    Arc::clone(&tracked_set),
                    pool.clone(),
                    profile.clone(),
                    shutdown.clone(),
                ));
                match scanner.await {
                    Ok(()) => return,
                    Err(e) => {
                        tracing::error!(
                            chain = %profile.name,
                            error = %e,
                            "Head scanner crashed, restarting"
                        );
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        if shutdown.is_cancelled() {
                            return;
                        }
                    }
                }
            }
        }));
    }

    handles.push(tokio::spawn(run_tracked_set_refresher(
        Arc::clone(&tracked_set),
        pool.clone(),
        shutdown.clone(),
    )));

    handles.push(tokio::spawn(run_refresher(
        Arc::clone(&engine),
        pool.clone(),
        Duration::from_secs(config.cache.refresh_interval_seconds),
        shutdown.clone(),
    )));

    handles.push(tokio::spawn(cache::run_sweeper(
        pool.clone(),
        *engine.settings(),
        shutdown.clone(),
    )));

    handles.push(tokio::spawn(run_health_probe(
        Arc::clone(&providers),
        pool.clone(),
        Duration::from_secs(config.rpc.probe_interval_secs),
        shutdown.clone(),
    )));

    tracing::info!("Background tasks started");

    let state = Arc::new(AppState {
        engine,
        tracked,
        registry,
        db: pool,
        request_deadline: Duration::from_secs(config.server.request_deadline_secs),
        config,
    });

    let server_shutdown = shutdown.clone();
    let server = tokio::spawn(async move {
        tokio::select! {
            result = api::serve(state) => {
                if let Err(e) = result {
                    tracing::error!(error = %e, "API server failed");
                }
            }
            _ = server_shutdown.cancelled() => {}
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received, stopping all tasks...");
    shutdown.cancel();

    for handle in handles {
        let _ = handle.await;
    }
    server.abort();
    let _ = server.await;

    tracing::info!("WalletWatch Indexer stopped gracefully");
    Ok(())
}
