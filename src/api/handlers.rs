use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use std::sync::Arc;

use super::types::*;
use super::AppState;
use crate::db::repository;
use crate::error::canonical_address;
use crate::snapshot::types::WalletSnapshot;

fn parse_chain_id(raw: &str) -> Result<i64, ApiError> {
    raw.parse::<i64>()
        .ok()
        .filter(|id| *id > 0)
        .ok_or_else(|| ApiError::bad_request(format!("invalid chain id '{}'", raw)))
}

// ============================================================
// Wallet snapshots
// ============================================================

pub async fn wallet_snapshot(
    State(state): State<Arc<AppState>>,
    Path((chain, address)): Path<(String, String)>,
    Query(params): Query<WalletQuery>,
) -> ApiResult<WalletSnapshot> {
    let chain_id = parse_chain_id(&chain)?;
    if state.config.chain(chain_id).is_none() {
        return Err(ApiError::not_found(format!("unsupported chain {}", chain_id)));
    }
    let refresh = params.refresh.unwrap_or(false);

    // The build must survive the request deadline: run it detached and give
    // up on the join handle, not the build, when the deadline passes.
    let engine = Arc::clone(&state.engine);
    let handle =
        tokio::spawn(async move { engine.get_snapshot(chain_id, &address, refresh).await });

    match tokio::time::timeout(state.request_deadline, handle).await {
        Ok(Ok(result)) => result.map(Json).map_err(ApiError::from),
        Ok(Err(join_error)) => Err(ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("snapshot task failed: {}", join_error),
        )),
        Err(_) => Err(ApiError::new(
            StatusCode::GATEWAY_TIMEOUT,
            "snapshot build did not finish in time; retry shortly",
        )),
    }
}

pub async fn wallet_multi_chain(
    State(state): State<Arc<AppState>>,
    Path(address): Path<String>,
) -> ApiResult<MultiChainSnapshot> {
    let wallet = canonical_address(&address).map_err(ApiError::from)?;

    let lookups = state.config.chains.iter().map(|profile| {
        let engine = Arc::clone(&state.engine);
        let wallet = wallet.clone();
        let chain_id = profile.chain_id;
        let chain_name = profile.name.clone();
        async move {
            match engine.get_snapshot(chain_id, &wallet, false).await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    // Per-chain degradation: an empty syncing snapshot.
                    tracing::warn!(chain_id, wallet = %wallet, error = %e, "Chain lookup degraded");
                    WalletSnapshot {
                        chain_id,
                        chain_name,
                        native: "0".to_string(),
                        result: vec![],
                        block_number: 0,
                        syncing: true,
                        count: 0,
                    }
                }
            }
        }
    });

    let chains: Vec<WalletSnapshot> = futures::future::join_all(lookups).await;

    let total_usd: f64 = chains
        .iter()
        .flat_map(|c| c.result.iter())
        .filter(|t| !t.possible_spam)
        .map(|t| t.usd_value)
        .sum();
    let total_tokens: usize = chains.iter().map(|c| c.count).sum();

    Ok(Json(MultiChainSnapshot {
        wallet,
        total_usd,
        total_tokens,
        chains_count: chains.len(),
        chains,
    }))
}

pub async fn wallet_transactions(
    State(state): State<Arc<AppState>>,
    Path((chain, address)): Path<(String, String)>,
    Query(params): Query<PageQuery>,
) -> ApiResult<TransactionsResponse> {
    let chain_id = parse_chain_id(&chain)?;
    if state.config.chain(chain_id).is_none() {
        return Err(ApiError::not_found(format!("unsupported chain {}", chain_id)));
    }
    let wallet = canonical_address(&address).map_err(ApiError::from)?;

    let page = params.page.unwrap_or(1).max(1);
    let limit = params.limit.unwrap_or(50).clamp(1, 100);
    let offset = (page - 1) * limit;

    let (transactions, total) =
        repository::get_wallet_transactions(&state.db, chain_id, &wallet, limit, offset)
            .await
            .map_err(ApiError::from)?;

    Ok(Json(TransactionsResponse {
        has_next_page: page * limit < total,
        transactions,
        page,
        limit,
        total,
    }))
}

// ============================================================
// Tokens
// ============================================================

pub async fn search_tokens(
    State(state): State<Arc<AppState>>,
    Query(params): Query<TokenSearchQuery>,
) -> ApiResult<crate::tokens::TokenPage> {
    let page = state
        .registry
        .search(
            params.chain_id,
            params.search_query.as_deref(),
            params.is_verified,
            params.is_spam,
            params.page.unwrap_or(1),
            params.limit.unwrap_or(20),
        )
        .await
        .map_err(ApiError::from)?;
    Ok(Json(page))
}

pub async fn list_chain_tokens(
    State(state): State<Arc<AppState>>,
    Path(chain): Path<String>,
    Query(params): Query<PageQuery>,
) -> ApiResult<crate::tokens::TokenPage> {
    let chain_id = parse_chain_id(&chain)?;
    if state.config.chain(chain_id).is_none() {
        return Err(ApiError::not_found(format!("unsupported chain {}", chain_id)));
    }
    let page = state
        .registry
        .search(
            Some(chain_id),
            None,
            None,
            None,
            params.page.unwrap_or(1),
            params.limit.unwrap_or(20),
        )
        .await
        .map_err(ApiError::from)?;
    Ok(Json(page))
}

// ============================================================
// Tracked wallets
// ============================================================

pub async fn add_tracked_wallet(
    State(state): State<Arc<AppState>>,
    Json(body): Json<AddWalletRequest>,
) -> ApiResult<AddWalletResponse> {
    let chains = state
        .tracked
        .add(&state.engine, &body.address, &body.chains)
        .await
        .map_err(ApiError::from)?;
    let wallet = canonical_address(&body.address).map_err(ApiError::from)?;
    Ok(Json(AddWalletResponse {
        wallet,
        chains,
        tracked: true,
    }))
}

pub async fn list_tracked_wallets(
    State(state): State<Arc<AppState>>,
) -> ApiResult<TrackedListResponse> {
    let wallets = state.tracked.list().await.map_err(ApiError::from)?;
    Ok(Json(TrackedListResponse {
        count: wallets.len(),
        wallets,
    }))
}

pub async fn remove_tracked_wallet(
    State(state): State<Arc<AppState>>,
    Path(address): Path<String>,
) -> ApiResult<RemoveWalletResponse> {
    state
        .tracked
        .remove(&address)
        .await
        .map_err(ApiError::from)?;
    let wallet = canonical_address(&address).map_err(ApiError::from)?;
    Ok(Json(RemoveWalletResponse {
        wallet,
        removed: true,
    }))
}

// ============================================================
// Health
// ============================================================

pub async fn health(State(state): State<Arc<AppState>>) -> ApiResult<HealthResponse> {
    let database = sqlx::query("SELECT 1").execute(&state.db).await.is_ok();
    let chains = repository::list_block_sync(&state.db)
        .await
        .unwrap_or_default();
    let providers = state.engine.providers().health();

    let degraded = !database || providers.values().any(|eps| eps.iter().all(|e| !e.healthy));
    Ok(Json(HealthResponse {
        status: if degraded { "degraded" } else { "ok" }.to_string(),
        database,
        chains,
        providers,
    }))
}
