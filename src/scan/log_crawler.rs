use alloy::primitives::{Address, B256, U256};
use alloy::rpc::types::{Filter, Log};
use alloy::sol;
use alloy::sol_types::SolEvent;
use std::collections::HashSet;

use crate::error::{EngineError, Result};
use crate::rpc::pool::ChainProviders;

sol! {
    event Transfer(address indexed from, address indexed to, uint256 value);
}

/// Responses larger than this are treated like a provider range-limit error
/// and the range is split, even if the provider happily returned them.
const SOFT_RESULT_CAP: usize = 10_000;

/// A decoded ERC-20 Transfer touching the crawled target.
#[derive(Debug, Clone)]
pub struct WalletTransfer {
    pub token: Address,
    pub from: Address,
    pub to: Address,
    pub value: U256,
    pub block_number: u64,
    pub log_index: u64,
    pub tx_hash: B256,
}

#[derive(Debug, Default)]
pub struct CrawlOutcome {
    /// Transfers in (block_number, log_index) ascending order, deduplicated
    /// across the two filter directions by (tx_hash, log_index).
    pub transfers: Vec<WalletTransfer>,
    /// Distinct token contracts the target interacted with.
    pub tokens: HashSet<Address>,
    /// Single blocks dropped after an irrecoverable getLogs failure.
    pub skipped_blocks: u64,
}

enum Target<'a> {
    Wallet(Address),
    Set(&'a [Address]),
}

impl Target<'_> {
    /// One filter per indexed topic position; `from` and `to` are both
    /// indexed, so a wallet match needs two queries.
    fn filters(&self, from_block: u64, to_block: u64) -> Vec<Filter> {
        let base = || {
            Filter::new()
                .event_signature(Transfer::SIGNATURE_HASH)
                .from_block(from_block)
                .to_block(to_block)
        };
        match self {
            Target::Wallet(wallet) => {
                let word: B256 = wallet.into_word();
                vec![base().topic1(word), base().topic2(word)]
            }
            Target::Set(addrs) => {
                let words: Vec<B256> = addrs.iter().map(|a| a.into_word()).collect();
                vec![base().topic1(words.clone()), base().topic2(words)]
            }
        }
    }
}

/// Enumerates Transfer logs over a block range with iterative bisection:
/// any range the provider rejects (or that exceeds the soft cap) is split
/// at its midpoint until it fits, down to single blocks.
pub struct LogCrawler<'a> {
    providers: &'a ChainProviders,
}

impl<'a> LogCrawler<'a> {
    pub fn new(providers: &'a ChainProviders) -> Self {
        Self { providers }
    }

    /// All transfers where the wallet is sender or recipient.
    pub async fn crawl_wallet(
        &self,
        wallet: Address,
        from_block: u64,
        to_block: u64,
    ) -> Result<CrawlOutcome> {
        self.crawl(Target::Wallet(wallet), from_block, to_block).await
    }

    /// All transfers where any address of the set is sender or recipient.
    /// Used by the head scanner over its catch-up window.
    pub async fn crawl_set(
        &self,
        addresses: &[Address],
        from_block: u64,
        to_block: u64,
    ) -> Result<CrawlOutcome> {
        self.crawl(Target::Set(addresses), from_block, to_block).await
    }

    async fn crawl(&self, target: Target<'_>, from_block: u64, to_block: u64) -> Result<CrawlOutcome> {
        let mut outcome = CrawlOutcome::default();
        if from_block > to_block {
            return Ok(outcome);
        }

        let mut seen: HashSet<(B256, u64)> = HashSet::new();
        let mut work: Vec<(u64, u64)> = vec![(from_block, to_block)];

        while let Some((from, to)) = work.pop() {
            match self.fetch_range(&target, from, to).await {
                Ok(logs) => {
                    if logs.len() > SOFT_RESULT_CAP && from < to {
                        let mid = from + (to - from) / 2;
                        work.push((mid + 1, to));
                        work.push((from, mid));
                        continue;
                    }
                    for log in &logs {
                        if let Some(transfer) = decode_transfer(log) {
                            if seen.insert((transfer.tx_hash, transfer.log_index)) {
                                outcome.tokens.insert(transfer.token);
                                outcome.transfers.push(transfer);
                            }
                        }
                    }
                }
                Err(EngineError::CallFailed { reason, .. }) => {
                    if from == to {
                        // A single block that still fails cannot be split
                        // further; drop it and keep scanning.
                        let err = EngineError::LogRangeIrrecoverable {
                            from,
                            to,
                            reason,
                        };
                        tracing::warn!(
                            chain_id = self.providers.chain_id,
                            block = from,
                            error = %err,
                            "Skipping irrecoverable block"
                        );
                        outcome.skipped_blocks += 1;
                        continue;
                    }
                    let mid = from + (to - from) / 2;
                    work.push((mid + 1, to));
                    work.push((from, mid));
                }
                Err(e) => return Err(e),
            }
        }

        outcome
            .transfers
            .sort_by_key(|t| (t.block_number, t.log_index));
        Ok(outcome)
    }

    async fn fetch_range(&self, target: &Target<'_>, from: u64, to: u64) -> Result<Vec<Log>> {
        let mut logs = Vec::new();
        for filter in target.filters(from, to) {
            logs.extend(self.providers.get_logs(&filter).await?);
        }
        Ok(logs)
    }
}

/// Decode an ERC-20 Transfer log. Returns `None` for anything that does not
/// match the canonical 3-topic layout (NFT transfers share topic0 but carry
/// a fourth indexed topic).
pub fn decode_transfer(log: &Log) -> Option<WalletTransfer> {
    let inner = &log.inner;
    let topics = inner.data.topics();
    if topics.len() != 3 || topics[0] != Transfer::SIGNATURE_HASH {
        return None;
    }

    let data = inner.data.data.as_ref();
    if data.len() < 32 {
        return None;
    }

    Some(WalletTransfer {
        token: inner.address,
        from: Address::from_word(topics[1]),
        to: Address::from_word(topics[2]),
        value: U256::from_be_slice(&data[..32]),
        block_number: log.block_number?,
        log_index: log.log_index.unwrap_or(0),
        tx_hash: log.transaction_hash?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{Bytes, LogData};

    fn transfer_log(
        token: Address,
        from: Address,
        to: Address,
        value: U256,
        block: u64,
        index: u64,
    ) -> Log {
        let data = LogData::new_unchecked(
            vec![Transfer::SIGNATURE_HASH, from.into_word(), to.into_word()],
            Bytes::from(value.to_be_bytes::<32>().to_vec()),
        );
        Log {
            inner: alloy::primitives::Log {
                address: token,
                data,
            },
            block_number: Some(block),
            log_index: Some(index),
            transaction_hash: Some(B256::repeat_byte(index as u8)),
            ..Default::default()
        }
    }

    #[test]
    fn decodes_canonical_transfer() {
        let token = Address::repeat_byte(0x01);
        let from = Address::repeat_byte(0x02);
        let to = Address::repeat_byte(0x03);
        let log = transfer_log(token, from, to, U256::from(42u64), 100, 7);

        let decoded = decode_transfer(&log).unwrap();
        assert_eq!(decoded.token, token);
        assert_eq!(decoded.from, from);
        assert_eq!(decoded.to, to);
        assert_eq!(decoded.value, U256::from(42u64));
        assert_eq!(decoded.block_number, 100);
        assert_eq!(decoded.log_index, 7);
    }

    #[test]
    fn rejects_nft_style_transfer() {
        // ERC-721 Transfer carries tokenId as a fourth topic.
        let data = LogData::new_unchecked(
            vec![
                Transfer::SIGNATURE_HASH,
                Address::repeat_byte(0x02).into_word(),
                Address::repeat_byte(0x03).into_word(),
                B256::repeat_byte(0x09),
            ],
            Bytes::new(),
        );
        let log = Log {
            inner: alloy::primitives::Log {
                address: Address::repeat_byte(0x01),
                data,
            },
            block_number: Some(1),
            log_index: Some(0),
            transaction_hash: Some(B256::ZERO),
            ..Default::default()
        };
        assert!(decode_transfer(&log).is_none());
    }

    #[test]
    fn wallet_target_builds_both_directions() {
        let wallet = Address::repeat_byte(0xaa);
        let filters = Target::Wallet(wallet).filters(10, 20);
        assert_eq!(filters.len(), 2);
    }
}
