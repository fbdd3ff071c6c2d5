use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

use crate::config::{ChainProfile, PriceConfig};
use crate::error::{EngineError, Result, NATIVE_TOKEN_ADDRESS};

/// USD price source for token addresses on a chain. Implementations return
/// only the prices they actually know; missing entries default to zero in
/// the snapshot builder.
#[async_trait]
pub trait PriceOracle: Send + Sync {
    async fn get_prices(
        &self,
        profile: &ChainProfile,
        addresses: &[String],
    ) -> Result<HashMap<String, f64>>;
}

// ---------------------------------------------------------------------------
// DefiLlama coins API
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct CoinsResponse {
    coins: HashMap<String, CoinPrice>,
}

#[derive(Deserialize)]
struct CoinPrice {
    price: f64,
    timestamp: Option<u64>,
}

/// Batched price lookups against the DefiLlama coins API. Keys are
/// `{chain_slug}:{address}`; the native sentinel maps to the profile's
/// configured coin id. Prices older than the configured age are dropped.
pub struct LlamaPriceOracle {
    client: reqwest::Client,
    endpoint: String,
    max_age: Duration,
}

impl LlamaPriceOracle {
    pub fn new(config: &PriceConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            max_age: Duration::from_secs(config.max_age_secs),
        }
    }

    fn key_for(&self, profile: &ChainProfile, address: &str) -> Option<String> {
        if address == NATIVE_TOKEN_ADDRESS {
            profile.native_price_id.clone()
        } else {
            Some(format!("{}:{}", profile.price_slug, address))
        }
    }
}

#[async_trait]
impl PriceOracle for LlamaPriceOracle {
    async fn get_prices(
        &self,
        profile: &ChainProfile,
        addresses: &[String],
    ) -> Result<HashMap<String, f64>> {
        if addresses.is_empty() {
            return Ok(HashMap::new());
        }

        // key on the wire → canonical address
        let mut key_map: HashMap<String, String> = HashMap::new();
        for address in addresses {
            if let Some(key) = self.key_for(profile, address) {
                key_map.insert(key, address.clone());
            }
        }

        let mut prices = HashMap::new();
        let keys: Vec<&String> = key_map.keys().collect();

        for chunk in keys.chunks(100) {
            let joined = chunk
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(",");
            let url = format!("{}/prices/current/{}", self.endpoint, joined);

            let response = self
                .client
                .get(&url)
                .send()
                .await
                .map_err(|e| EngineError::Oracle(format!("price request failed: {}", e)))?;

            let status = response.status();
            if !status.is_success() {
                return Err(EngineError::Oracle(format!(
                    "price API returned {}",
                    status
                )));
            }

            let body: CoinsResponse = response
                .json()
                .await
                .map_err(|e| EngineError::Oracle(format!("price decode failed: {}", e)))?;

            let now = chrono::Utc::now().timestamp() as u64;
            for (key, coin) in body.coins {
                // Stale quotes are worse than missing ones.
                if let Some(ts) = coin.timestamp {
                    if now.saturating_sub(ts) > self.max_age.as_secs() {
                        continue;
                    }
                }
                if coin.price < 0.0 {
                    continue;
                }
                if let Some(address) = key_map.get(&key) {
                    prices.insert(address.clone(), coin.price);
                }
            }
        }

        Ok(prices)
    }
}

// ---------------------------------------------------------------------------
// Static oracle for tests and offline runs
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct StaticPriceOracle {
    prices: HashMap<String, f64>,
}

impl StaticPriceOracle {
    pub fn new(prices: HashMap<String, f64>) -> Self {
        Self { prices }
    }
}

#[async_trait]
impl PriceOracle for StaticPriceOracle {
    async fn get_prices(
        &self,
        _profile: &ChainProfile,
        addresses: &[String],
    ) -> Result<HashMap<String, f64>> {
        Ok(addresses
            .iter()
            .filter_map(|a| self.prices.get(a).map(|p| (a.clone(), *p)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> ChainProfile {
        toml::from_str(
            r#"
chain_id = 1
name = "ethereum"
native_symbol = "ETH"
rpc_urls = ["http://localhost:8545"]
price_slug = "ethereum"
native_price_id = "coingecko:ethereum"
"#,
        )
        .unwrap()
    }

    #[test]
    fn native_sentinel_maps_to_coin_id() {
        let oracle = LlamaPriceOracle::new(&PriceConfig::default());
        let key = oracle.key_for(&profile(), NATIVE_TOKEN_ADDRESS);
        assert_eq!(key.as_deref(), Some("coingecko:ethereum"));
    }

    #[test]
    fn erc20_maps_to_chain_prefixed_key() {
        let oracle = LlamaPriceOracle::new(&PriceConfig::default());
        let key = oracle.key_for(&profile(), "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48");
        assert_eq!(
            key.as_deref(),
            Some("ethereum:0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48")
        );
    }

    #[tokio::test]
    async fn static_oracle_returns_known_subset() {
        let mut prices = HashMap::new();
        prices.insert("0xaaa".to_string(), 1.5);
        let oracle = StaticPriceOracle::new(prices);
        let out = oracle
            .get_prices(&profile(), &["0xaaa".to_string(), "0xbbb".to_string()])
            .await
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out["0xaaa"], 1.5);
    }
}
