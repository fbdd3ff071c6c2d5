use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Error taxonomy of the snapshot engine. Component-local retries (provider
/// failover, multicall bisection) happen below this layer; anything that
/// reaches a caller is one of these. Clone so a single-flight failure can be
/// delivered to every joiner.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("unsupported chain: {0}")]
    UnsupportedChain(i64),

    #[error("wallet not tracked: {0}")]
    NotTracked(String),

    #[error("all providers exhausted for chain {chain_id}: {reason}")]
    ProviderUnavailable { chain_id: i64, reason: String },

    #[error("providers disagree on {context}")]
    ProviderDisagreement { context: String },

    #[error("log range [{from}, {to}] irrecoverable: {reason}")]
    LogRangeIrrecoverable { from: u64, to: u64, reason: String },

    #[error("call to {target} failed: {reason}")]
    CallFailed { target: String, reason: String },

    #[error("snapshot build exceeded {0:?}")]
    BuildTimeout(Duration),

    #[error("database error: {0}")]
    Database(String),

    #[error("price oracle error: {0}")]
    Oracle(String),
}

impl From<sqlx::Error> for EngineError {
    fn from(e: sqlx::Error) -> Self {
        EngineError::Database(e.to_string())
    }
}

impl EngineError {
    /// Background tasks treat these as transient: log, back off, continue.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::ProviderUnavailable { .. }
                | EngineError::ProviderDisagreement { .. }
                | EngineError::Database(_)
                | EngineError::Oracle(_)
                | EngineError::BuildTimeout(_)
        )
    }
}

/// Canonicalize an EVM address: 40 hex chars, optional 0x prefix, checksum
/// accepted, stored and compared as lowercase `0x…`.
pub fn canonical_address(input: &str) -> Result<String> {
    let trimmed = input.trim();
    let stripped = trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")).unwrap_or(trimmed);
    if stripped.len() != 40 || !stripped.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(EngineError::InvalidInput(format!(
            "malformed address '{}'",
            input
        )));
    }
    Ok(format!("0x{}", stripped.to_lowercase()))
}

/// Sentinel address representing the chain's native token in snapshots.
pub const NATIVE_TOKEN_ADDRESS: &str = "0xeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeee";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalizes_checksummed_address() {
        let canon = canonical_address("0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48").unwrap();
        assert_eq!(canon, "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48");
    }

    #[test]
    fn accepts_bare_hex() {
        let canon = canonical_address("A0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48").unwrap();
        assert!(canon.starts_with("0x"));
        assert_eq!(canon.len(), 42);
    }

    #[test]
    fn rejects_short_and_nonhex() {
        assert!(canonical_address("0x1234").is_err());
        assert!(canonical_address("0xZZb86991c6218b36c1d19D4a2e9Eb0cE3606eB48").is_err());
        assert!(canonical_address("").is_err());
    }
}
