use alloy::primitives::Address;
use serde::Deserialize;
use std::collections::HashSet;
use std::str::FromStr;

use crate::config::ExplorerConfig;
use crate::error::{EngineError, Result};

// ---------------------------------------------------------------------------
// Etherscan-family API types
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct ExplorerResponse<T> {
    status: String,
    #[allow(dead_code)]
    message: String,
    result: T,
}

#[derive(Deserialize)]
struct TokenTransferEntry {
    #[serde(rename = "contractAddress")]
    contract_address: String,
}

/// Optional acceleration for deep discovery: etherscan-style explorers index
/// token transfers per wallet, which replaces a full log crawl with one
/// paginated HTTP call. Any failure here falls back to the crawler.
pub struct ExplorerClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl ExplorerClient {
    pub fn new(config: &ExplorerConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.api_key.is_empty()
    }

    /// Distinct token contracts the wallet transferred within the range.
    pub async fn token_contracts(
        &self,
        wallet: &str,
        start_block: u64,
        end_block: u64,
    ) -> Result<HashSet<Address>> {
        let mut tokens = HashSet::new();
        let page_size = 10_000u32;

        for page in 1..=10u32 {
            let response = self
                .client
                .get(&self.base_url)
                .query(&[
                    ("module", "account"),
                    ("action", "tokentx"),
                    ("address", wallet),
                    ("startblock", &start_block.to_string()),
                    ("endblock", &end_block.to_string()),
                    ("page", &page.to_string()),
                    ("offset", &page_size.to_string()),
                    ("sort", "asc"),
                    ("apikey", &self.api_key),
                ])
                .send()
                .await
                .map_err(|e| EngineError::CallFailed {
                    target: self.base_url.clone(),
                    reason: format!("explorer request failed: {}", e),
                })?;

            let status = response.status();
            if !status.is_success() {
                return Err(EngineError::CallFailed {
                    target: self.base_url.clone(),
                    reason: format!("explorer returned {}", status),
                });
            }

            let body: ExplorerResponse<Vec<TokenTransferEntry>> =
                response.json().await.map_err(|e| EngineError::CallFailed {
                    target: self.base_url.clone(),
                    reason: format!("explorer decode failed: {}", e),
                })?;

            // status "0" with an empty result means "no records", which is a
            // normal end of pagination, not an error.
            if body.status != "1" && !body.result.is_empty() {
                return Err(EngineError::CallFailed {
                    target: self.base_url.clone(),
                    reason: "explorer rejected the query".to_string(),
                });
            }

            let count = body.result.len();
            for entry in body.result {
                if let Ok(address) = Address::from_str(&entry.contract_address) {
                    tokens.insert(address);
                }
            }

            if count < page_size as usize {
                break;
            }
        }

        Ok(tokens)
    }
}
