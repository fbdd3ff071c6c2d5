use alloy::primitives::Address;
use serde::Serialize;
use sqlx::PgPool;
use std::collections::HashMap;

use crate::config::ChainProfile;
use crate::db::repository::{self, TokenMetaRow};
use crate::error::Result;
use crate::rpc::multicall::{self, MulticallEngine};
use crate::rpc::pool::ChainProviders;

pub const MAX_PAGE_LIMIT: i64 = 100;

// ERC-20 decimals above this are treated as garbage metadata.
const MAX_DECIMALS: u8 = 38;

#[derive(Debug, Serialize)]
pub struct TokenPage {
    pub tokens: Vec<TokenMetaRow>,
    pub page: i64,
    pub limit: i64,
    pub total: i64,
    pub has_next_page: bool,
}

/// Persistent (chain, address) → metadata mapping. Discovery writes through
/// here so every token that ever appears in a snapshot has a row.
pub struct TokenRegistry {
    db: PgPool,
}

impl TokenRegistry {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    /// Seed curated tokens from config at startup (idempotent).
    pub async fn seed(&self, chains: &[ChainProfile]) -> Result<()> {
        for chain in chains {
            for token in &chain.tokens {
                let address = token.address.to_lowercase();
                let name = if token.name.is_empty() {
                    &token.symbol
                } else {
                    &token.name
                };
                repository::upsert_verified_token(
                    &self.db,
                    chain.chain_id,
                    &address,
                    &token.symbol,
                    name,
                    token.decimals as i16,
                )
                .await?;

                tracing::debug!(
                    chain = %chain.name,
                    symbol = %token.symbol,
                    address = %address,
                    "Seeded verified token"
                );
            }
        }
        Ok(())
    }

    /// Batched metadata lookup keyed by canonical address.
    pub async fn get(
        &self,
        chain_id: i64,
        addresses: &[String],
    ) -> Result<HashMap<String, TokenMetaRow>> {
        if addresses.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = repository::get_tokens(&self.db, chain_id, addresses).await?;
        Ok(rows.into_iter().map(|r| (r.address.clone(), r)).collect())
    }

    pub async fn list_verified(&self, chain_id: i64) -> Result<Vec<TokenMetaRow>> {
        repository::get_verified_tokens(&self.db, chain_id).await
    }

    pub async fn search(
        &self,
        chain_id: Option<i64>,
        query: Option<&str>,
        verified: Option<bool>,
        spam: Option<bool>,
        page: i64,
        limit: i64,
    ) -> Result<TokenPage> {
        let page = page.max(1);
        let limit = limit.clamp(1, MAX_PAGE_LIMIT);
        let offset = (page - 1) * limit;

        let query = query.map(str::trim).filter(|q| !q.is_empty());
        let (tokens, total) =
            repository::search_tokens(&self.db, chain_id, query, verified, spam, limit, offset)
                .await?;

        Ok(TokenPage {
            has_next_page: page * limit < total,
            tokens,
            page,
            limit,
            total,
        })
    }

    /// Ensure registry rows exist for freshly discovered token contracts,
    /// fetching symbol/name/decimals in one multicall batch. Returns the
    /// metadata for every requested address.
    pub async fn upsert_discovered(
        &self,
        providers: &ChainProviders,
        multicall_contract: Address,
        chain_id: i64,
        addresses: &[Address],
    ) -> Result<HashMap<String, TokenMetaRow>> {
        let canonical: Vec<String> = addresses.iter().map(|a| format!("{:#x}", a)).collect();
        let known = self.get(chain_id, &canonical).await?;

        let unknown: Vec<Address> = addresses
            .iter()
            .zip(&canonical)
            .filter(|(_, c)| !known.contains_key(*c))
            .map(|(a, _)| *a)
            .collect();

        if !unknown.is_empty() {
            let engine = MulticallEngine::new(providers, multicall_contract);
            let mut calls = Vec::with_capacity(unknown.len() * 3);
            for token in &unknown {
                calls.push(multicall::symbol_of(*token));
                calls.push(multicall::name_of(*token));
                calls.push(multicall::decimals_of(*token));
            }
            let outcomes = engine.run(&calls).await?;

            for (i, token) in unknown.iter().enumerate() {
                let symbol = outcomes[i * 3]
                    .success()
                    .and_then(multicall::decode_string)
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty());
                let name = outcomes[i * 3 + 1]
                    .success()
                    .and_then(multicall::decode_string)
                    .unwrap_or_default();
                let decimals = outcomes[i * 3 + 2]
                    .success()
                    .and_then(multicall::decode_decimals)
                    .filter(|d| *d <= MAX_DECIMALS);

                // A contract that cannot answer the standard metadata calls
                // is either not an ERC-20 or actively hostile.
                let suspicious = symbol.is_none() || decimals.is_none();
                let symbol = symbol.unwrap_or_else(|| "UNKNOWN".to_string());
                let decimals = decimals.unwrap_or(18);

                repository::insert_discovered_token(
                    &self.db,
                    chain_id,
                    &format!("{:#x}", token),
                    &symbol,
                    &name,
                    decimals as i16,
                    suspicious,
                )
                .await?;
            }

            tracing::info!(
                chain_id,
                discovered = unknown.len(),
                "Registered newly discovered tokens"
            );
        }

        self.get(chain_id, &canonical).await
    }
}
