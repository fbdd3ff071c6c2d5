use alloy::network::TransactionBuilder;
use alloy::primitives::{Address, Bytes, U256};
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::rpc::types::{Filter, Log, TransactionRequest};
use serde::Serialize;
use sqlx::PgPool;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::{ChainProfile, RpcConfig};
use crate::db::repository;
use crate::error::{EngineError, Result};

const MAX_CONSECUTIVE_ERRORS: u32 = 3;

/// One RPC endpoint with atomic health state. Latency is a rolling EWMA.
pub struct Endpoint {
    pub url: String,
    provider: DynProvider,
    healthy: AtomicBool,
    consecutive_errors: AtomicU32,
    latency_ms: AtomicU64,
    last_check_ms: AtomicU64,
    cooldown_until_ms: AtomicU64,
}

impl Endpoint {
    fn connect(url: &str) -> eyre::Result<Self> {
        let parsed = url
            .parse()
            .map_err(|e| eyre::eyre!("Invalid RPC URL '{}': {}", url, e))?;
        let provider = ProviderBuilder::new().connect_http(parsed).erased();
        Ok(Self {
            url: url.to_string(),
            provider,
            healthy: AtomicBool::new(true),
            consecutive_errors: AtomicU32::new(0),
            latency_ms: AtomicU64::new(0),
            last_check_ms: AtomicU64::new(0),
            cooldown_until_ms: AtomicU64::new(0),
        })
    }

    fn record_success(&self, elapsed: Duration, now_ms: u64) {
        self.consecutive_errors.store(0, Ordering::Relaxed);
        self.healthy.store(true, Ordering::Relaxed);
        self.last_check_ms.store(now_ms, Ordering::Relaxed);
        // EWMA with alpha 1/4
        let sample = elapsed.as_millis() as u64;
        let prev = self.latency_ms.load(Ordering::Relaxed);
        let next = if prev == 0 { sample } else { (prev * 3 + sample) / 4 };
        self.latency_ms.store(next, Ordering::Relaxed);
    }

    fn record_failure(&self, now_ms: u64, cooldown: Duration) {
        let errors = self.consecutive_errors.fetch_add(1, Ordering::Relaxed) + 1;
        self.last_check_ms.store(now_ms, Ordering::Relaxed);
        if errors >= MAX_CONSECUTIVE_ERRORS {
            self.healthy.store(false, Ordering::Relaxed);
            self.cooldown_until_ms
                .store(now_ms + cooldown.as_millis() as u64, Ordering::Relaxed);
        }
    }

    /// Healthy, or unhealthy but past its cooldown (half-open probe).
    fn is_candidate(&self, now_ms: u64) -> bool {
        self.healthy.load(Ordering::Relaxed)
            || now_ms >= self.cooldown_until_ms.load(Ordering::Relaxed)
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EndpointHealth {
    pub url: String,
    pub healthy: bool,
    pub response_time_ms: u64,
    pub consecutive_errors: u32,
}

/// Priority-ordered endpoints for one chain, with failover and quorum reads.
pub struct ChainProviders {
    pub chain_id: i64,
    endpoints: Vec<Endpoint>,
    timeout: Duration,
    cooldown: Duration,
    epoch: Instant,
}

impl ChainProviders {
    pub fn from_profile(profile: &ChainProfile, rpc: &RpcConfig) -> eyre::Result<Self> {
        let mut endpoints = Vec::with_capacity(profile.rpc_urls.len());
        for url in &profile.rpc_urls {
            endpoints.push(Endpoint::connect(url)?);
        }
        Ok(Self {
            chain_id: profile.chain_id,
            endpoints,
            timeout: Duration::from_millis(rpc.timeout_ms),
            cooldown: Duration::from_secs(rpc.cooldown_secs),
            epoch: Instant::now(),
        })
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Walk endpoints in priority order, skipping unhealthy ones while any
    /// candidate remains; every failure advances to the next endpoint.
    async fn failover<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut(DynProvider) -> Fut,
        Fut: Future<Output = std::result::Result<T, alloy::transports::TransportError>>,
    {
        let now = self.now_ms();
        let any_candidate = self.endpoints.iter().any(|e| e.is_candidate(now));
        let mut last_error = String::from("no providers configured");

        for endpoint in &self.endpoints {
            if any_candidate && !endpoint.is_candidate(self.now_ms()) {
                continue;
            }
            let started = Instant::now();
            match tokio::time::timeout(self.timeout, op(endpoint.provider.clone())).await {
                Ok(Ok(value)) => {
                    endpoint.record_success(started.elapsed(), self.now_ms());
                    return Ok(value);
                }
                Ok(Err(e)) => {
                    // A well-formed JSON-RPC error (revert, bad params, range
                    // limit) is the call's fault, not the provider's; only
                    // transport faults and rate limits count against health.
                    if let Some(reason) = terminal_call_error(&e) {
                        endpoint.record_success(started.elapsed(), self.now_ms());
                        return Err(EngineError::CallFailed {
                            target: what.to_string(),
                            reason,
                        });
                    }
                    last_error = e.to_string();
                    endpoint.record_failure(self.now_ms(), self.cooldown);
                    tracing::warn!(
                        chain_id = self.chain_id,
                        url = %endpoint.url,
                        what,
                        error = %last_error,
                        "RPC call failed, trying next provider"
                    );
                }
                Err(_) => {
                    last_error = format!("timeout after {:?}", self.timeout);
                    endpoint.record_failure(self.now_ms(), self.cooldown);
                    tracing::warn!(
                        chain_id = self.chain_id,
                        url = %endpoint.url,
                        what,
                        "RPC call timed out, trying next provider"
                    );
                }
            }
        }

        Err(EngineError::ProviderUnavailable {
            chain_id: self.chain_id,
            reason: format!("{}: {}", what, last_error),
        })
    }

    pub async fn block_number(&self) -> Result<u64> {
        self.failover("eth_blockNumber", |p| async move { p.get_block_number().await })
            .await
    }

    pub async fn native_balance(&self, address: Address) -> Result<U256> {
        self.failover("eth_getBalance", move |p| async move {
            p.get_balance(address).await
        })
        .await
    }

    pub async fn eth_call(&self, to: Address, data: Vec<u8>) -> Result<Bytes> {
        self.failover("eth_call", move |p| {
            let tx = TransactionRequest::default()
                .with_to(to)
                .with_input(Bytes::from(data.clone()));
            async move { p.call(tx).await }
        })
        .await
    }

    pub async fn get_logs(&self, filter: &Filter) -> Result<Vec<Log>> {
        self.failover("eth_getLogs", move |p| {
            let filter = filter.clone();
            async move { p.get_logs(&filter).await }
        })
        .await
    }

    /// Quorum read of the chain head: `quorum` distinct endpoints must agree
    /// by strict majority. Disagreement is retried once with a wider quorum
    /// before degrading to `ProviderUnavailable`.
    pub async fn block_number_quorum(&self, quorum: usize) -> Result<u64> {
        match self.block_number_vote(quorum).await {
            Ok(n) => Ok(n),
            Err(EngineError::ProviderDisagreement { .. }) => {
                tracing::warn!(
                    chain_id = self.chain_id,
                    quorum,
                    "quorum disagreement, retrying with wider quorum"
                );
                match self.block_number_vote(quorum + 1).await {
                    Ok(n) => Ok(n),
                    Err(EngineError::ProviderDisagreement { context }) => {
                        Err(EngineError::ProviderUnavailable {
                            chain_id: self.chain_id,
                            reason: format!("persistent disagreement on {}", context),
                        })
                    }
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn block_number_vote(&self, quorum: usize) -> Result<u64> {
        if self.endpoints.len() < 2 || quorum < 2 {
            // Not enough distinct providers to vote; plain failover read.
            return self.block_number().await;
        }
        let quorum = quorum.min(self.endpoints.len());
        let now = self.now_ms();

        let mut voters: Vec<&Endpoint> = self
            .endpoints
            .iter()
            .filter(|e| e.is_candidate(now))
            .take(quorum)
            .collect();
        if voters.len() < quorum {
            voters = self.endpoints.iter().take(quorum).collect();
        }

        let calls = voters.iter().map(|endpoint| {
            let provider = endpoint.provider.clone();
            let timeout = self.timeout;
            async move { tokio::time::timeout(timeout, provider.get_block_number()).await }
        });
        let outcomes = futures::future::join_all(calls).await;

        let mut votes: HashMap<u64, usize> = HashMap::new();
        let mut responses = 0usize;
        for (endpoint, outcome) in voters.iter().zip(outcomes) {
            match outcome {
                Ok(Ok(n)) => {
                    endpoint.record_success(Duration::ZERO, self.now_ms());
                    responses += 1;
                    *votes.entry(n).or_default() += 1;
                }
                Ok(Err(_)) | Err(_) => {
                    endpoint.record_failure(self.now_ms(), self.cooldown);
                }
            }
        }

        if responses == 0 {
            return Err(EngineError::ProviderUnavailable {
                chain_id: self.chain_id,
                reason: "no quorum voter responded to eth_blockNumber".to_string(),
            });
        }

        match strict_majority(&votes, responses) {
            Some(value) => Ok(value),
            None => Err(EngineError::ProviderDisagreement {
                context: format!("eth_blockNumber ({} distinct values)", votes.len()),
            }),
        }
    }

    pub fn health(&self) -> Vec<EndpointHealth> {
        self.endpoints
            .iter()
            .map(|e| EndpointHealth {
                url: e.url.clone(),
                healthy: e.is_healthy(),
                response_time_ms: e.latency_ms.load(Ordering::Relaxed),
                consecutive_errors: e.consecutive_errors.load(Ordering::Relaxed),
            })
            .collect()
    }

    pub fn any_healthy(&self) -> bool {
        self.endpoints.iter().any(|e| e.is_healthy())
    }

    /// Probe every endpoint with a cheap head read, restoring health on
    /// success. Returns the per-endpoint view for persistence.
    pub async fn probe(&self) -> Vec<EndpointHealth> {
        for endpoint in &self.endpoints {
            let started = Instant::now();
            match tokio::time::timeout(self.timeout, endpoint.provider.get_block_number()).await {
                Ok(Ok(_)) => endpoint.record_success(started.elapsed(), self.now_ms()),
                Ok(Err(_)) | Err(_) => endpoint.record_failure(self.now_ms(), self.cooldown),
            }
        }
        self.health()
    }
}

/// Heads drift by a block between providers; a value that more than half of
/// the responders agree on wins, anything less is a disagreement. At most
/// one value can clear the strict-majority bar, so ties never pass.
fn strict_majority(votes: &HashMap<u64, usize>, responses: usize) -> Option<u64> {
    votes
        .iter()
        .max_by_key(|(_, count)| **count)
        .filter(|(_, count)| **count * 2 > responses)
        .map(|(value, _)| *value)
}

/// Server-reported errors that no amount of failover will fix. Rate limits
/// are excluded: those are the provider's problem and the next endpoint may
/// accept the same call.
fn terminal_call_error(e: &alloy::transports::TransportError) -> Option<String> {
    use alloy::transports::RpcError;
    if let RpcError::ErrorResp(payload) = e {
        let message = payload.message.to_string();
        let lowered = message.to_lowercase();
        let rate_limited = payload.code == -32005
            || payload.code == -32016
            || lowered.contains("rate limit")
            || lowered.contains("too many requests");
        if !rate_limited {
            return Some(format!("code {}: {}", payload.code, message));
        }
    }
    None
}

/// All chains' provider sets, initialized once at startup and shared.
pub struct ProviderPool {
    chains: HashMap<i64, ChainProviders>,
}

impl ProviderPool {
    pub fn from_config(profiles: &[ChainProfile], rpc: &RpcConfig) -> eyre::Result<Self> {
        let mut chains = HashMap::with_capacity(profiles.len());
        for profile in profiles {
            chains.insert(profile.chain_id, ChainProviders::from_profile(profile, rpc)?);
        }
        Ok(Self { chains })
    }

    pub fn chain(&self, chain_id: i64) -> Result<&ChainProviders> {
        self.chains
            .get(&chain_id)
            .ok_or(EngineError::UnsupportedChain(chain_id))
    }

    pub fn health(&self) -> HashMap<i64, Vec<EndpointHealth>> {
        self.chains
            .iter()
            .map(|(id, c)| (*id, c.health()))
            .collect()
    }

    pub fn any_chain_healthy(&self) -> bool {
        self.chains.values().any(|c| c.any_healthy())
    }
}

/// Background probe restoring unhealthy endpoints; health rows are persisted
/// opportunistically (a DB failure never stops the probe).
pub async fn run_health_probe(
    pool: Arc<ProviderPool>,
    db: PgPool,
    interval: Duration,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.cancelled() => {
                tracing::info!("Shutdown received, stopping provider health probe");
                return;
            }
        }

        for (chain_id, chain) in &pool.chains {
            let snapshot = chain.probe().await;
            for health in &snapshot {
                if let Err(e) = repository::upsert_provider_health(
                    &db,
                    *chain_id,
                    &health.url,
                    health.healthy,
                    health.response_time_ms as i64,
                    health.consecutive_errors as i64,
                )
                .await
                {
                    tracing::debug!(error = %e, "Skipping provider health persistence");
                }
            }
            let unhealthy = snapshot.iter().filter(|h| !h.healthy).count();
            if unhealthy > 0 {
                tracing::warn!(
                    chain_id,
                    unhealthy,
                    total = snapshot.len(),
                    "Providers unhealthy after probe"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::rpc::json_rpc::ErrorPayload;
    use alloy::transports::RpcError;

    const COOLDOWN: Duration = Duration::from_secs(30);

    fn endpoint() -> Endpoint {
        Endpoint::connect("http://localhost:8545").unwrap()
    }

    fn error_resp(code: i64, message: &str) -> alloy::transports::TransportError {
        RpcError::ErrorResp(ErrorPayload {
            code,
            message: message.to_string().into(),
            data: None,
        })
    }

    // ----- endpoint health state machine -----

    #[test]
    fn stays_healthy_below_failure_threshold() {
        let ep = endpoint();
        ep.record_failure(100, COOLDOWN);
        ep.record_failure(200, COOLDOWN);
        assert!(ep.is_healthy());
        assert!(ep.is_candidate(300));
    }

    #[test]
    fn three_consecutive_failures_mark_unhealthy() {
        let ep = endpoint();
        for now in [100, 200, 300] {
            ep.record_failure(now, COOLDOWN);
        }
        assert!(!ep.is_healthy());
        // Inside the cooldown window: not even a candidate.
        assert!(!ep.is_candidate(300));
        assert!(!ep.is_candidate(300 + COOLDOWN.as_millis() as u64 - 1));
    }

    #[test]
    fn success_resets_the_failure_counter() {
        let ep = endpoint();
        ep.record_failure(100, COOLDOWN);
        ep.record_failure(200, COOLDOWN);
        ep.record_success(Duration::from_millis(10), 300);
        ep.record_failure(400, COOLDOWN);
        ep.record_failure(500, COOLDOWN);
        assert!(ep.is_healthy());
    }

    #[test]
    fn cooldown_expiry_reopens_endpoint_for_probing() {
        let ep = endpoint();
        for now in [100, 200, 300] {
            ep.record_failure(now, COOLDOWN);
        }
        let after_cooldown = 300 + COOLDOWN.as_millis() as u64;
        // Half-open: a candidate again, but not yet healthy.
        assert!(ep.is_candidate(after_cooldown));
        assert!(!ep.is_healthy());
    }

    #[test]
    fn probe_success_restores_health_after_cooldown() {
        let ep = endpoint();
        for now in [100, 200, 300] {
            ep.record_failure(now, COOLDOWN);
        }
        let after_cooldown = 300 + COOLDOWN.as_millis() as u64;
        ep.record_success(Duration::from_millis(25), after_cooldown);
        assert!(ep.is_healthy());
        assert!(ep.is_candidate(after_cooldown + 1));
        assert_eq!(ep.consecutive_errors.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn latency_ewma_tracks_samples() {
        let ep = endpoint();
        ep.record_success(Duration::from_millis(100), 0);
        assert_eq!(ep.latency_ms.load(Ordering::Relaxed), 100);
        // (100 * 3 + 20) / 4 = 80
        ep.record_success(Duration::from_millis(20), 10);
        assert_eq!(ep.latency_ms.load(Ordering::Relaxed), 80);
    }

    // ----- quorum voting -----

    fn votes(entries: &[(u64, usize)]) -> HashMap<u64, usize> {
        entries.iter().copied().collect()
    }

    #[test]
    fn strict_majority_wins() {
        assert_eq!(strict_majority(&votes(&[(100, 2), (99, 1)]), 3), Some(100));
        assert_eq!(strict_majority(&votes(&[(100, 3)]), 3), Some(100));
    }

    #[test]
    fn unanimous_single_responder_wins() {
        assert_eq!(strict_majority(&votes(&[(42, 1)]), 1), Some(42));
    }

    #[test]
    fn even_split_is_a_disagreement() {
        assert_eq!(strict_majority(&votes(&[(100, 1), (99, 1)]), 2), None);
        assert_eq!(strict_majority(&votes(&[(100, 2), (99, 2)]), 4), None);
    }

    #[test]
    fn plurality_without_majority_is_a_disagreement() {
        assert_eq!(
            strict_majority(&votes(&[(100, 2), (99, 1), (98, 1), (97, 1)]), 5),
            None
        );
    }

    // ----- error classification -----

    #[test]
    fn revert_is_terminal() {
        let reason = terminal_call_error(&error_resp(3, "execution reverted")).unwrap();
        assert!(reason.contains("execution reverted"));
    }

    #[test]
    fn range_limit_rejection_is_terminal() {
        assert!(
            terminal_call_error(&error_resp(-32000, "query returned more than 10000 results"))
                .is_some()
        );
    }

    #[test]
    fn rate_limits_are_provider_failures() {
        assert!(terminal_call_error(&error_resp(-32005, "limit exceeded")).is_none());
        assert!(terminal_call_error(&error_resp(-32016, "over quota")).is_none());
        assert!(terminal_call_error(&error_resp(-32000, "Too Many Requests")).is_none());
        assert!(terminal_call_error(&error_resp(429, "rate limit reached")).is_none());
    }

    #[test]
    fn transport_faults_are_provider_failures() {
        assert!(terminal_call_error(&RpcError::NullResp).is_none());
    }
}
