use alloy::primitives::{Address, U256};
use bigdecimal::BigDecimal;
use chrono::Utc;
use sqlx::PgPool;
use std::collections::HashSet;
use std::str::FromStr;

use crate::config::ChainProfile;
use crate::db::repository::{self, TokenMetaRow, WalletTransactionRow};
use crate::error::{EngineError, Result};
use crate::explorer::ExplorerClient;
use crate::rpc::multicall::{self, MulticallEngine};
use crate::rpc::pool::ChainProviders;
use crate::scan::log_crawler::{LogCrawler, WalletTransfer};
use crate::snapshot::types::{DiscoveryOutcome, TokenCandidate};
use crate::tokens::registry::TokenRegistry;

/// Two-phase balance discovery.
///
/// Phase 1 sweeps `balanceOf` over every verified token on the chain plus
/// the native balance. Phase 2 (when phase 1 comes up short, or on a forced
/// refresh) enumerates the wallet's historical Transfer logs to find tokens
/// the registry has never verified, registering any unknown contracts.
pub async fn discover(
    db: &PgPool,
    providers: &ChainProviders,
    registry: &TokenRegistry,
    explorer: Option<&ExplorerClient>,
    profile: &ChainProfile,
    wallet: &str,
    force_deep: bool,
) -> Result<DiscoveryOutcome> {
    let wallet_addr = Address::from_str(wallet)
        .map_err(|_| EngineError::InvalidInput(format!("malformed address '{}'", wallet)))?;
    let multicall_contract = Address::from_str(&profile.multicall)
        .map_err(|_| EngineError::InvalidInput(format!("bad multicall '{}'", profile.multicall)))?;

    let latest_block = providers.block_number().await?;
    let native_raw = providers.native_balance(wallet_addr).await?;

    // ---- Phase 1: verified-token sweep ----
    let engine = MulticallEngine::new(providers, multicall_contract);
    let verified = registry.list_verified(profile.chain_id).await?;

    let calls: Vec<_> = verified
        .iter()
        .filter_map(|meta| Address::from_str(&meta.address).ok())
        .map(|token| multicall::balance_of(token, wallet_addr))
        .collect();
    let outcomes = engine.run(&calls).await?;

    let mut candidates: Vec<TokenCandidate> = Vec::new();
    let mut held: HashSet<Address> = HashSet::new();
    for (meta, outcome) in verified.iter().zip(&outcomes) {
        // A failed entry means the balance is unknown; leave it out.
        let Some(raw) = outcome.success().and_then(multicall::decode_balance) else {
            continue;
        };
        if raw.is_zero() {
            continue;
        }
        if let Ok(address) = Address::from_str(&meta.address) {
            held.insert(address);
            candidates.push(candidate_from_meta(meta, address, raw));
        }
    }

    tracing::debug!(
        chain_id = profile.chain_id,
        wallet,
        verified_swept = verified.len(),
        held = candidates.len(),
        "Fast-path discovery complete"
    );

    // ---- Phase 2: deep discovery over transfer history ----
    let deep_scanned = candidates.len() < profile.discovery_min_tokens || force_deep;
    if deep_scanned {
        let last_scanned = repository::get_last_scanned_block(db, profile.chain_id, wallet)
            .await?
            .unwrap_or(0);
        let from_block = (last_scanned + 1).max(profile.start_block);

        if from_block <= latest_block {
            let touched =
                collect_touched_tokens(db, providers, explorer, profile, wallet, wallet_addr, from_block, latest_block)
                    .await?;

            let unseen: Vec<Address> = touched
                .into_iter()
                .filter(|t| !held.contains(t))
                .collect();

            if !unseen.is_empty() {
                let metadata = registry
                    .upsert_discovered(providers, multicall_contract, profile.chain_id, &unseen)
                    .await?;

                let deep_calls: Vec<_> = unseen
                    .iter()
                    .map(|token| multicall::balance_of(*token, wallet_addr))
                    .collect();
                let deep_outcomes = engine.run(&deep_calls).await?;

                for (token, outcome) in unseen.iter().zip(&deep_outcomes) {
                    let Some(raw) = outcome.success().and_then(multicall::decode_balance) else {
                        continue;
                    };
                    if raw.is_zero() {
                        continue;
                    }
                    let canonical = format!("{:#x}", token);
                    match metadata.get(&canonical) {
                        Some(meta) => candidates.push(candidate_from_meta(meta, *token, raw)),
                        None => candidates.push(TokenCandidate {
                            address: *token,
                            raw,
                            symbol: "UNKNOWN".to_string(),
                            name: String::new(),
                            decimals: 18,
                            possible_spam: true,
                        }),
                    }
                }
            }

            repository::upsert_last_scanned_block(db, profile.chain_id, wallet, latest_block)
                .await?;
        }

        tracing::info!(
            chain_id = profile.chain_id,
            wallet,
            tokens = candidates.len(),
            from_block,
            to_block = latest_block,
            "Deep discovery complete"
        );
    }

    Ok(DiscoveryOutcome {
        candidates,
        native_raw,
        block_number: latest_block,
        deep_scanned,
    })
}

/// Enumerate token contracts the wallet has transfer history with. Prefers
/// the block explorer when one is configured; any explorer failure falls
/// back to crawling the logs.
async fn collect_touched_tokens(
    db: &PgPool,
    providers: &ChainProviders,
    explorer: Option<&ExplorerClient>,
    profile: &ChainProfile,
    wallet: &str,
    wallet_addr: Address,
    from_block: u64,
    to_block: u64,
) -> Result<HashSet<Address>> {
    if let Some(client) = explorer.filter(|c| c.is_configured()) {
        match client.token_contracts(wallet, from_block, to_block).await {
            Ok(tokens) => return Ok(tokens),
            Err(e) => {
                tracing::warn!(
                    chain_id = profile.chain_id,
                    wallet,
                    error = %e,
                    "Explorer discovery failed, falling back to log crawl"
                );
            }
        }
    }

    let crawler = LogCrawler::new(providers);
    let outcome = crawler.crawl_wallet(wallet_addr, from_block, to_block).await?;

    if outcome.skipped_blocks > 0 {
        tracing::warn!(
            chain_id = profile.chain_id,
            wallet,
            skipped = outcome.skipped_blocks,
            "Blocks skipped during wallet crawl"
        );
    }

    // Keep the normalized transfer history for the transactions endpoint.
    let rows = normalize_transfers(profile.chain_id, wallet, wallet_addr, &outcome.transfers);
    if let Err(e) = repository::insert_wallet_transactions(db, &rows).await {
        tracing::warn!(error = %e, "Skipping transfer history persistence");
    }

    Ok(outcome.tokens)
}

pub fn normalize_transfers(
    chain_id: i64,
    wallet: &str,
    wallet_addr: Address,
    transfers: &[WalletTransfer],
) -> Vec<WalletTransactionRow> {
    let now = Utc::now();
    transfers
        .iter()
        .map(|t| {
            let (direction, counterparty) = if t.from == wallet_addr && t.to == wallet_addr {
                ("self", t.to)
            } else if t.from == wallet_addr {
                ("out", t.to)
            } else {
                ("in", t.from)
            };
            WalletTransactionRow {
                chain_id,
                wallet: wallet.to_string(),
                tx_hash: format!("{:#x}", t.tx_hash),
                log_index: t.log_index as i64,
                block_number: t.block_number as i64,
                token_address: format!("{:#x}", t.token),
                counterparty: format!("{:#x}", counterparty),
                direction: direction.to_string(),
                amount: BigDecimal::from_str(&t.value.to_string()).unwrap_or_default(),
                block_timestamp: now,
            }
        })
        .collect()
}

fn candidate_from_meta(meta: &TokenMetaRow, address: Address, raw: U256) -> TokenCandidate {
    TokenCandidate {
        address,
        raw,
        symbol: meta.symbol.clone(),
        name: meta.name.clone(),
        decimals: meta.decimals.clamp(0, 38) as u8,
        possible_spam: meta.possible_spam,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::B256;

    #[test]
    fn normalizes_directions() {
        let wallet = Address::repeat_byte(0xaa);
        let other = Address::repeat_byte(0xbb);
        let token = Address::repeat_byte(0x01);

        let transfer = |from, to, index| WalletTransfer {
            token,
            from,
            to,
            value: U256::from(5u64),
            block_number: 10,
            log_index: index,
            tx_hash: B256::repeat_byte(1),
        };

        let rows = normalize_transfers(
            1,
            "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa",
            wallet,
            &[
                transfer(other, wallet, 0),
                transfer(wallet, other, 1),
                transfer(wallet, wallet, 2),
            ],
        );

        assert_eq!(rows[0].direction, "in");
        assert_eq!(rows[1].direction, "out");
        assert_eq!(rows[2].direction, "self");
        assert_eq!(rows[0].counterparty, format!("{:#x}", other));
    }
}
