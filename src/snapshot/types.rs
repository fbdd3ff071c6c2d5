use alloy::primitives::{Address, U256};
use serde::{Deserialize, Serialize};

/// One row of a portfolio snapshot. Raw balances travel as decimal strings;
/// `balance_formatted` is the exact scaling by the token's decimals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenBalance {
    pub token_address: String,
    pub symbol: String,
    pub name: String,
    pub decimals: u8,
    pub balance: String,
    pub balance_formatted: String,
    pub native_token: bool,
    pub possible_spam: bool,
    pub usd_price: f64,
    pub usd_value: f64,
    pub portfolio_percentage: f64,
}

/// The canonical portfolio document served by the API and stored as the
/// cache row's JSONB payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletSnapshot {
    pub chain_id: i64,
    pub chain_name: String,
    /// Raw native balance in wei, as a decimal string.
    pub native: String,
    pub result: Vec<TokenBalance>,
    pub block_number: u64,
    pub syncing: bool,
    pub count: usize,
}

/// A non-zero balance discovered for a wallet, before pricing.
#[derive(Debug, Clone)]
pub struct TokenCandidate {
    pub address: Address,
    pub raw: U256,
    pub symbol: String,
    pub name: String,
    pub decimals: u8,
    pub possible_spam: bool,
}

/// Everything discovery hands the snapshot builder.
#[derive(Debug)]
pub struct DiscoveryOutcome {
    pub candidates: Vec<TokenCandidate>,
    pub native_raw: U256,
    pub block_number: u64,
    /// Whether the deep (log-crawl) phase ran.
    pub deep_scanned: bool,
}
