use alloy::primitives::Address;
use sqlx::PgPool;
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::db::repository::{self, TrackedWalletRow};
use crate::error::{canonical_address, EngineError, Result};
use crate::snapshot::SnapshotEngine;

/// How often the in-memory tracked set is reloaded from the database.
/// Readers may lag registration by up to this long.
const SET_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// Registry of wallets kept warm: proactively refreshed and reactively
/// invalidated by the head scanner.
pub struct TrackedWallets {
    db: PgPool,
}

impl TrackedWallets {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    /// Upsert (chain sets union on conflict) and kick off an immediate
    /// cache-bypassing build per chain. Idempotent.
    pub async fn add(
        &self,
        engine: &Arc<SnapshotEngine>,
        wallet: &str,
        chains: &[i64],
    ) -> Result<Vec<i64>> {
        let wallet = canonical_address(wallet)?;
        if chains.is_empty() {
            return Err(EngineError::InvalidInput(
                "at least one chain id is required".to_string(),
            ));
        }

        let mut unique: Vec<i64> = Vec::new();
        for &chain_id in chains {
            if engine.config().chain(chain_id).is_none() {
                return Err(EngineError::InvalidInput(format!(
                    "unsupported chain id {}",
                    chain_id
                )));
            }
            if !unique.contains(&chain_id) {
                unique.push(chain_id);
            }
        }

        repository::upsert_tracked_wallet(&self.db, &wallet, &unique).await?;
        tracing::info!(wallet = %wallet, chains = ?unique, "Tracking wallet");

        for &chain_id in &unique {
            engine.spawn_background_build(chain_id, wallet.clone(), true);
        }

        Ok(unique)
    }

    /// Deactivate; history and cache rows stay until the sweeper ages the
    /// cache out naturally.
    pub async fn remove(&self, wallet: &str) -> Result<()> {
        let wallet = canonical_address(wallet)?;
        if repository::deactivate_tracked_wallet(&self.db, &wallet).await? {
            tracing::info!(wallet = %wallet, "Untracked wallet");
            Ok(())
        } else {
            Err(EngineError::NotTracked(wallet))
        }
    }

    pub async fn list(&self) -> Result<Vec<TrackedWalletRow>> {
        repository::list_tracked_wallets(&self.db).await
    }
}

/// Read-mostly in-memory view of the active tracked wallets, grouped by
/// chain. The head scanner consults this on every poll without touching
/// the database.
#[derive(Default)]
pub struct TrackedSet {
    by_chain: RwLock<HashMap<i64, HashSet<Address>>>,
}

impl TrackedSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn reload(&self, db: &PgPool) -> Result<()> {
        let rows = repository::list_tracked_wallets(db).await?;
        let mut by_chain: HashMap<i64, HashSet<Address>> = HashMap::new();
        for row in rows {
            let Ok(address) = Address::from_str(&row.wallet) else {
                continue;
            };
            for chain_id in row.chains {
                by_chain.entry(chain_id).or_default().insert(address);
            }
        }
        *self.by_chain.write().expect("tracked-set lock poisoned") = by_chain;
        Ok(())
    }

    pub fn for_chain(&self, chain_id: i64) -> HashSet<Address> {
        self.by_chain
            .read()
            .expect("tracked-set lock poisoned")
            .get(&chain_id)
            .cloned()
            .unwrap_or_default()
    }
}

/// Keep the in-memory tracked set close to the database.
pub async fn run_tracked_set_refresher(
    set: Arc<TrackedSet>,
    db: PgPool,
    shutdown: CancellationToken,
) {
    loop {
        if let Err(e) = set.reload(&db).await {
            tracing::warn!(error = %e, "Tracked-set reload failed");
        }
        tokio::select! {
            _ = tokio::time::sleep(SET_REFRESH_INTERVAL) => {}
            _ = shutdown.cancelled() => {
                tracing::info!("Shutdown received, stopping tracked-set refresher");
                return;
            }
        }
    }
}

/// Proactive refresher: walks every (tracked wallet, chain) pair through
/// the stale-while-revalidate read path. Rebuild concurrency is bounded by
/// the engine's per-chain and global semaphores.
pub async fn run_refresher(
    engine: Arc<SnapshotEngine>,
    db: PgPool,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut backoff = Duration::from_secs(1);
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.cancelled() => {
                tracing::info!("Shutdown received, stopping tracked-wallet refresher");
                return;
            }
        }

        let rows = match repository::list_tracked_wallets(&db).await {
            Ok(rows) => {
                backoff = Duration::from_secs(1);
                rows
            }
            Err(e) => {
                tracing::error!(error = %e, backoff_secs = backoff.as_secs(), "Refresher DB read failed");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(Duration::from_secs(60));
                continue;
            }
        };

        let mut pairs = 0usize;
        for row in rows {
            for chain_id in row.chains {
                if engine.config().chain(chain_id).is_none() {
                    continue;
                }
                pairs += 1;
                let engine = Arc::clone(&engine);
                let wallet = row.wallet.clone();
                tokio::spawn(async move {
                    // The stale path schedules the actual rebuild.
                    if let Err(e) = engine.get_snapshot(chain_id, &wallet, false).await {
                        tracing::warn!(chain_id, wallet = %wallet, error = %e, "Tracked refresh failed");
                    }
                });
            }
        }
        if pairs > 0 {
            tracing::debug!(pairs, "Tracked-wallet refresh pass scheduled");
        }
    }
}
