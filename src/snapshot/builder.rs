use bigdecimal::num_bigint::BigInt;
use bigdecimal::{BigDecimal, ToPrimitive};
use std::collections::HashMap;
use std::str::FromStr;

use crate::config::ChainProfile;
use crate::error::NATIVE_TOKEN_ADDRESS;
use crate::snapshot::types::{DiscoveryOutcome, TokenBalance, WalletSnapshot};

/// Exact `raw / 10^decimals` as a decimal string. BigDecimal carries the
/// scale directly, so no precision is lost for any uint256.
pub fn format_units(raw: &str, decimals: u8) -> String {
    match BigInt::from_str(raw) {
        Ok(int) => BigDecimal::new(int, decimals as i64).normalized().to_string(),
        Err(_) => "0".to_string(),
    }
}

/// Join discovered balances with USD prices and assemble the snapshot
/// document: values, non-spam portfolio shares, canonical ordering.
pub fn build_snapshot(
    profile: &ChainProfile,
    discovery: DiscoveryOutcome,
    prices: &HashMap<String, f64>,
) -> WalletSnapshot {
    let mut entries: Vec<TokenBalance> = Vec::with_capacity(discovery.candidates.len() + 1);

    let native_raw = discovery.native_raw.to_string();
    if !discovery.native_raw.is_zero() {
        let formatted = format_units(&native_raw, 18);
        let usd_price = prices.get(NATIVE_TOKEN_ADDRESS).copied().unwrap_or(0.0);
        let amount = BigDecimal::from_str(&formatted)
            .ok()
            .and_then(|d| d.to_f64())
            .unwrap_or(0.0);
        entries.push(TokenBalance {
            token_address: NATIVE_TOKEN_ADDRESS.to_string(),
            symbol: profile.native_symbol.clone(),
            name: profile.native_symbol.clone(),
            decimals: 18,
            balance: native_raw.clone(),
            balance_formatted: formatted,
            native_token: true,
            possible_spam: false,
            usd_price,
            usd_value: amount * usd_price,
            portfolio_percentage: 0.0,
        });
    }

    for candidate in discovery.candidates {
        let address = format!("{:#x}", candidate.address);
        let raw = candidate.raw.to_string();
        let formatted = format_units(&raw, candidate.decimals);
        let usd_price = prices.get(&address).copied().unwrap_or(0.0);
        let amount = BigDecimal::from_str(&formatted)
            .ok()
            .and_then(|d| d.to_f64())
            .unwrap_or(0.0);
        entries.push(TokenBalance {
            token_address: address,
            symbol: candidate.symbol,
            name: candidate.name,
            decimals: candidate.decimals,
            balance: raw,
            balance_formatted: formatted,
            native_token: false,
            possible_spam: candidate.possible_spam,
            usd_price,
            usd_value: amount * usd_price,
            portfolio_percentage: 0.0,
        });
    }

    // Spam entries stay in the list but never count toward the denominator
    // and always show 0%.
    let denominator: f64 = entries
        .iter()
        .filter(|e| !e.possible_spam)
        .map(|e| e.usd_value)
        .sum();
    if denominator > 0.0 {
        for entry in &mut entries {
            if !entry.possible_spam {
                entry.portfolio_percentage = entry.usd_value / denominator * 100.0;
            }
        }
    }

    entries.sort_by(|a, b| {
        b.native_token
            .cmp(&a.native_token)
            .then_with(|| {
                b.usd_value
                    .partial_cmp(&a.usd_value)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| a.symbol.cmp(&b.symbol))
    });

    let count = entries.len();
    WalletSnapshot {
        chain_id: profile.chain_id,
        chain_name: profile.name.clone(),
        native: native_raw,
        result: entries,
        block_number: discovery.block_number,
        syncing: false,
        count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::types::TokenCandidate;
    use alloy::primitives::{Address, U256};

    fn profile() -> ChainProfile {
        toml::from_str(
            r#"
chain_id = 1
name = "ethereum"
native_symbol = "ETH"
rpc_urls = ["http://localhost:8545"]
price_slug = "ethereum"
"#,
        )
        .unwrap()
    }

    fn candidate(addr_byte: u8, raw: u64, decimals: u8, symbol: &str, spam: bool) -> TokenCandidate {
        TokenCandidate {
            address: Address::repeat_byte(addr_byte),
            raw: U256::from(raw),
            symbol: symbol.to_string(),
            name: symbol.to_string(),
            decimals,
            possible_spam: spam,
        }
    }

    #[test]
    fn format_units_is_exact() {
        assert_eq!(format_units("1500000", 6), "1.5");
        assert_eq!(format_units("1", 18), "0.000000000000000001");
        assert_eq!(format_units("0", 6), "0");
        // No float involved: a value beyond f64 precision stays exact.
        assert_eq!(
            format_units("123456789012345678901234567890", 18),
            "123456789012.34567890123456789"
        );
    }

    #[test]
    fn zero_balance_wallet_is_empty() {
        let snapshot = build_snapshot(
            &profile(),
            DiscoveryOutcome {
                candidates: vec![],
                native_raw: U256::ZERO,
                block_number: 100,
                deep_scanned: false,
            },
            &HashMap::new(),
        );
        assert_eq!(snapshot.native, "0");
        assert!(snapshot.result.is_empty());
        assert_eq!(snapshot.count, 0);
        assert!(!snapshot.syncing);
    }

    #[test]
    fn native_only_wallet_is_full_share() {
        let mut prices = HashMap::new();
        prices.insert(NATIVE_TOKEN_ADDRESS.to_string(), 3000.0);
        let snapshot = build_snapshot(
            &profile(),
            DiscoveryOutcome {
                candidates: vec![],
                native_raw: U256::from(2_000_000_000_000_000_000u64), // 2 ETH
                block_number: 100,
                deep_scanned: false,
            },
            &prices,
        );
        assert_eq!(snapshot.result.len(), 1);
        let native = &snapshot.result[0];
        assert!(native.native_token);
        assert_eq!(native.balance_formatted, "2");
        assert!((native.usd_value - 6000.0).abs() < 1e-9);
        assert!((native.portfolio_percentage - 100.0).abs() < 0.01);
    }

    #[test]
    fn percentages_sum_to_hundred_excluding_spam() {
        let mut prices = HashMap::new();
        prices.insert(format!("{:#x}", Address::repeat_byte(0x01)), 2.0);
        prices.insert(format!("{:#x}", Address::repeat_byte(0x02)), 1.0);
        prices.insert(format!("{:#x}", Address::repeat_byte(0x03)), 100.0);

        let snapshot = build_snapshot(
            &profile(),
            DiscoveryOutcome {
                candidates: vec![
                    candidate(0x01, 3_000_000, 6, "AAA", false),
                    candidate(0x02, 4_000_000, 6, "BBB", false),
                    candidate(0x03, 9_000_000, 6, "SCAM", true),
                ],
                native_raw: U256::ZERO,
                block_number: 5,
                deep_scanned: true,
            },
            &prices,
        );

        let non_spam_total: f64 = snapshot
            .result
            .iter()
            .filter(|e| !e.possible_spam)
            .map(|e| e.portfolio_percentage)
            .sum();
        assert!((non_spam_total - 100.0).abs() < 0.01);

        let spam = snapshot.result.iter().find(|e| e.possible_spam).unwrap();
        assert_eq!(spam.portfolio_percentage, 0.0);
        assert!(spam.usd_value > 0.0); // value kept, share zeroed
    }

    #[test]
    fn ordering_native_first_then_value_then_symbol() {
        let mut prices = HashMap::new();
        prices.insert(NATIVE_TOKEN_ADDRESS.to_string(), 1.0);
        prices.insert(format!("{:#x}", Address::repeat_byte(0x01)), 1.0);
        prices.insert(format!("{:#x}", Address::repeat_byte(0x02)), 1.0);
        prices.insert(format!("{:#x}", Address::repeat_byte(0x03)), 5.0);

        let snapshot = build_snapshot(
            &profile(),
            DiscoveryOutcome {
                candidates: vec![
                    // Equal USD value: tie broken by symbol.
                    candidate(0x02, 1_000_000, 6, "ZZZ", false),
                    candidate(0x01, 1_000_000, 6, "AAA", false),
                    candidate(0x03, 1_000_000, 6, "MMM", false),
                ],
                native_raw: U256::from(1u64),
                block_number: 5,
                deep_scanned: false,
            },
            &prices,
        );

        let symbols: Vec<&str> = snapshot.result.iter().map(|e| e.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["ETH", "MMM", "AAA", "ZZZ"]);
    }

    #[test]
    fn all_worthless_tokens_have_zero_share() {
        let snapshot = build_snapshot(
            &profile(),
            DiscoveryOutcome {
                candidates: vec![candidate(0x01, 1_000_000, 6, "DUST", false)],
                native_raw: U256::ZERO,
                block_number: 5,
                deep_scanned: false,
            },
            &HashMap::new(),
        );
        assert_eq!(snapshot.result[0].portfolio_percentage, 0.0);
    }
}
