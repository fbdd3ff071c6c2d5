pub mod handlers;
pub mod types;

use axum::http::HeaderValue;
use axum::routing::{delete, get, post};
use axum::Router;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::snapshot::SnapshotEngine;
use crate::tokens::TokenRegistry;
use crate::tracked::TrackedWallets;

pub struct AppState {
    pub engine: Arc<SnapshotEngine>,
    pub tracked: Arc<TrackedWallets>,
    pub registry: Arc<TokenRegistry>,
    pub db: PgPool,
    pub config: Arc<Config>,
    pub request_deadline: Duration,
}

pub fn router(state: Arc<AppState>) -> Router {
    let cors = if state.config.server.cors_origin == "*" {
        CorsLayer::permissive()
    } else {
        match state.config.server.cors_origin.parse::<HeaderValue>() {
            Ok(origin) => CorsLayer::new().allow_origin(AllowOrigin::exact(origin)),
            Err(_) => {
                tracing::warn!(
                    origin = %state.config.server.cors_origin,
                    "Invalid CORS origin, falling back to permissive"
                );
                CorsLayer::permissive()
            }
        }
    };

    Router::new()
        .route("/api/wallet/{chain}/{address}", get(handlers::wallet_snapshot))
        .route("/api/wallet/{address}", get(handlers::wallet_multi_chain))
        .route(
            "/api/wallet/{chain}/{address}/transactions",
            get(handlers::wallet_transactions),
        )
        .route("/api/tokens", get(handlers::search_tokens))
        .route("/api/tokens/{chainId}", get(handlers::list_chain_tokens))
        .route("/api/wallets/add-wallet", post(handlers::add_tracked_wallet))
        .route("/api/wallets/get-wallet", get(handlers::list_tracked_wallets))
        .route(
            "/api/wallets/remove-wallet/{address}",
            delete(handlers::remove_tracked_wallet),
        )
        .route("/health", get(handlers::health))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

pub async fn serve(state: Arc<AppState>) -> eyre::Result<()> {
    let addr = format!(
        "{}:{}",
        state.config.server.host, state.config.server.port
    );
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "API server listening");
    axum::serve(listener, app).await?;
    Ok(())
}
