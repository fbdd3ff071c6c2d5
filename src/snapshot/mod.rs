pub mod builder;
pub mod discovery;
pub mod types;

use chrono::Utc;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::cache::{classify, CacheSettings, Flight, SharedBuild, SingleFlight};
use crate::config::{ChainProfile, Config};
use crate::db::repository;
use crate::error::{canonical_address, EngineError, Result, NATIVE_TOKEN_ADDRESS};
use crate::explorer::ExplorerClient;
use crate::price::PriceOracle;
use crate::rpc::ProviderPool;
use crate::tokens::TokenRegistry;
use crate::snapshot::types::WalletSnapshot;

/// The snapshot engine: one long-lived service owning the cache contract,
/// single-flight deduplication, and the discovery/build pipeline. Handlers,
/// the refresher and the head scanners all go through it.
pub struct SnapshotEngine {
    db: PgPool,
    config: Arc<Config>,
    providers: Arc<ProviderPool>,
    registry: Arc<TokenRegistry>,
    oracle: Arc<dyn PriceOracle>,
    explorers: HashMap<i64, ExplorerClient>,
    flights: SingleFlight,
    settings: CacheSettings,
    global_slots: Semaphore,
    chain_slots: HashMap<i64, Arc<Semaphore>>,
}

impl SnapshotEngine {
    pub fn new(
        db: PgPool,
        config: Arc<Config>,
        providers: Arc<ProviderPool>,
        registry: Arc<TokenRegistry>,
        oracle: Arc<dyn PriceOracle>,
    ) -> Self {
        let explorers = config
            .chains
            .iter()
            .filter_map(|profile| {
                profile
                    .explorer
                    .as_ref()
                    .map(|e| (profile.chain_id, ExplorerClient::new(e)))
            })
            .collect();

        let chain_slots = config
            .chains
            .iter()
            .map(|profile| {
                (
                    profile.chain_id,
                    Arc::new(Semaphore::new(profile.scanner_concurrency)),
                )
            })
            .collect();

        Self {
            settings: CacheSettings::from(&config.cache),
            global_slots: Semaphore::new(config.cache.global_build_slots),
            flights: SingleFlight::new(),
            db,
            providers,
            registry,
            oracle,
            explorers,
            chain_slots,
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn providers(&self) -> &ProviderPool {
        &self.providers
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    /// Total snapshot builds led since startup. Test hook for the
    /// one-build-per-key guarantee.
    pub fn builds_started(&self) -> u64 {
        self.flights.builds_started()
    }

    fn profile(&self, chain_id: i64) -> Result<&ChainProfile> {
        self.config
            .chain(chain_id)
            .ok_or(EngineError::UnsupportedChain(chain_id))
    }

    /// The request contract of the cache layer:
    ///
    /// | state   | refresh=false              | refresh=true       |
    /// |---------|----------------------------|--------------------|
    /// | fresh   | cached                     | join/start build   |
    /// | stale   | cached + background build  | join/start build   |
    /// | expired | join/start build           | join/start build   |
    pub async fn get_snapshot(
        self: &Arc<Self>,
        chain_id: i64,
        wallet: &str,
        refresh: bool,
    ) -> Result<WalletSnapshot> {
        let profile = self.profile(chain_id)?;
        let wallet = canonical_address(wallet)?;

        let cached = repository::get_cache_entry(&self.db, chain_id, &wallet).await?;
        let now = Utc::now();

        if !refresh {
            if let Some(row) = &cached {
                match classify(row.last_updated, now, self.settings.ttl, self.settings.hard_expiry)
                {
                    crate::cache::Freshness::Fresh => {
                        let mut snapshot = row.data.clone();
                        snapshot.syncing = row.syncing;
                        return Ok(snapshot);
                    }
                    crate::cache::Freshness::Stale => {
                        self.spawn_background_build(chain_id, wallet.clone(), false);
                        let mut snapshot = row.data.clone();
                        snapshot.syncing = true;
                        return Ok(snapshot);
                    }
                    crate::cache::Freshness::Expired => {}
                }
            }
        }

        match self.build_or_join(profile.chain_id, &wallet, refresh).await {
            Ok(snapshot) => Ok((*snapshot).clone()),
            Err(e) => {
                // Degraded mode: a transient failure with anything cached at
                // all still produces an answer, flagged as syncing.
                if e.is_transient() {
                    if let Some(row) = cached {
                        tracing::warn!(
                            chain_id,
                            wallet = %wallet,
                            error = %e,
                            "Serving cached snapshot after failed build"
                        );
                        let mut snapshot = row.data;
                        snapshot.syncing = true;
                        return Ok(snapshot);
                    }
                }
                Err(e)
            }
        }
    }

    /// Join the in-flight build for this key, or become its leader. At most
    /// one build runs per (chain, wallet) across all callers.
    pub async fn build_or_join(
        self: &Arc<Self>,
        chain_id: i64,
        wallet: &str,
        force_deep: bool,
    ) -> std::result::Result<Arc<WalletSnapshot>, EngineError> {
        match self.flights.join(chain_id, wallet) {
            Flight::Leader(tx) => {
                let result = self.lead_build(chain_id, wallet, force_deep).await;
                self.flights.finish(chain_id, wallet, &tx, result.clone());
                result.map_err(|e| (*e).clone())
            }
            Flight::Follower(mut rx) => {
                let grace = self.settings.build_timeout + std::time::Duration::from_secs(5);
                match tokio::time::timeout(grace, rx.recv()).await {
                    Ok(Ok(result)) => result.map_err(|e| (*e).clone()),
                    Ok(Err(_)) => Err(EngineError::ProviderUnavailable {
                        chain_id,
                        reason: "snapshot build aborted".to_string(),
                    }),
                    Err(_) => Err(EngineError::BuildTimeout(self.settings.build_timeout)),
                }
            }
        }
    }

    async fn lead_build(&self, chain_id: i64, wallet: &str, force_deep: bool) -> SharedBuild {
        // Persist the syncing marker so a crash is observable (and
        // recoverable by the stuck-sync sweeper).
        if let Err(e) = repository::set_cache_syncing(&self.db, chain_id, wallet, true).await {
            tracing::debug!(error = %e, "Could not set syncing flag");
        }

        let built = tokio::time::timeout(
            self.settings.build_timeout,
            self.run_build(chain_id, wallet, force_deep),
        )
        .await;

        let result: SharedBuild = match built {
            Ok(Ok(snapshot)) => Ok(Arc::new(snapshot)),
            Ok(Err(e)) => Err(Arc::new(e)),
            Err(_) => Err(Arc::new(EngineError::BuildTimeout(
                self.settings.build_timeout,
            ))),
        };

        if let Err(e) = &result {
            tracing::warn!(chain_id, wallet, error = %e, "Snapshot build failed");
            if let Err(e) = repository::set_cache_syncing(&self.db, chain_id, wallet, false).await {
                tracing::debug!(error = %e, "Could not clear syncing flag");
            }
        }

        result
    }

    async fn run_build(
        &self,
        chain_id: i64,
        wallet: &str,
        force_deep: bool,
    ) -> Result<WalletSnapshot> {
        let profile = self.profile(chain_id)?;

        // Semaphores never close while the engine lives.
        let _global = self
            .global_slots
            .acquire()
            .await
            .expect("global build semaphore closed");
        let chain_slots = self
            .chain_slots
            .get(&chain_id)
            .ok_or(EngineError::UnsupportedChain(chain_id))?;
        let _chain = chain_slots
            .acquire()
            .await
            .expect("chain build semaphore closed");

        let providers = self.providers.chain(chain_id)?;
        let discovery = discovery::discover(
            &self.db,
            providers,
            &self.registry,
            self.explorers.get(&chain_id),
            profile,
            wallet,
            force_deep,
        )
        .await?;

        let mut price_keys: Vec<String> = discovery
            .candidates
            .iter()
            .map(|c| format!("{:#x}", c.address))
            .collect();
        price_keys.push(NATIVE_TOKEN_ADDRESS.to_string());

        // Missing prices degrade to zero-valued entries, never a failed build.
        let prices = match self.oracle.get_prices(profile, &price_keys).await {
            Ok(prices) => prices,
            Err(e) => {
                tracing::warn!(chain_id, wallet, error = %e, "Price lookup failed, valuing at zero");
                HashMap::new()
            }
        };

        let snapshot = builder::build_snapshot(profile, discovery, &prices);
        repository::upsert_cache_entry(
            &self.db,
            chain_id,
            wallet,
            &snapshot,
            self.settings.ttl.as_secs(),
        )
        .await?;

        tracing::info!(
            chain_id,
            wallet,
            tokens = snapshot.count,
            block = snapshot.block_number,
            "Snapshot built"
        );
        Ok(snapshot)
    }

    /// Fire-and-forget rebuild through the single-flight map; used by the
    /// stale path, the head scanner and the refresher. Request deadlines
    /// never cancel these.
    pub fn spawn_background_build(self: &Arc<Self>, chain_id: i64, wallet: String, force_deep: bool) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = engine.build_or_join(chain_id, &wallet, force_deep).await {
                tracing::warn!(chain_id, wallet = %wallet, error = %e, "Background build failed");
            }
        });
    }

    /// Mark a cache entry stale so the next read rebuilds it. Idempotent.
    pub async fn invalidate(&self, chain_id: i64, wallet: &str) -> Result<()> {
        repository::invalidate_cache_entry(&self.db, chain_id, wallet).await
    }
}
