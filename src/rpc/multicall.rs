use alloy::primitives::{Address, Bytes, U256};
use alloy::sol;
use alloy::sol_types::SolCall;

use crate::error::{EngineError, Result};
use crate::rpc::pool::ChainProviders;

// Multicall3 ABI; the same contract is deployed on every chain we support.
sol! {
    interface IMulticall3 {
        struct Call3 {
            address target;
            bool allowFailure;
            bytes callData;
        }

        struct Result {
            bool success;
            bytes returnData;
        }

        function aggregate3(Call3[] calldata calls) external payable returns (Result[] memory returnData);
    }
}

sol! {
    interface IERC20 {
        function balanceOf(address owner) external view returns (uint256);
        function symbol() external view returns (string);
        function name() external view returns (string);
        function decimals() external view returns (uint8);
    }
}

/// One view call to be aggregated.
#[derive(Debug, Clone)]
pub struct CallSpec {
    pub target: Address,
    pub call_data: Vec<u8>,
}

/// Per-entry outcome; a failed entry never aborts its batch.
#[derive(Debug, Clone)]
pub enum CallOutcome {
    Success(Bytes),
    Failed(String),
}

impl CallOutcome {
    pub fn success(&self) -> Option<&Bytes> {
        match self {
            CallOutcome::Success(data) => Some(data),
            CallOutcome::Failed(_) => None,
        }
    }
}

const MAX_BATCH: usize = 100;

/// Batches view calls through the chain's Multicall3 contract. Entries are
/// issued with `allowFailure = true`; when the aggregate call itself reverts
/// the batch is bisected down to singletons.
pub struct MulticallEngine<'a> {
    providers: &'a ChainProviders,
    contract: Address,
}

impl<'a> MulticallEngine<'a> {
    pub fn new(providers: &'a ChainProviders, contract: Address) -> Self {
        Self { providers, contract }
    }

    /// Execute all calls, returning a parallel list of outcomes.
    pub async fn run(&self, calls: &[CallSpec]) -> Result<Vec<CallOutcome>> {
        let mut outcomes = Vec::with_capacity(calls.len());
        for chunk in calls.chunks(MAX_BATCH) {
            self.run_range(chunk, &mut outcomes).await?;
        }
        Ok(outcomes)
    }

    async fn run_range(&self, calls: &[CallSpec], out: &mut Vec<CallOutcome>) -> Result<()> {
        if calls.is_empty() {
            return Ok(());
        }
        match self.aggregate_once(calls).await {
            Ok(results) => {
                out.extend(results);
                Ok(())
            }
            Err(EngineError::CallFailed { reason, .. }) => {
                if calls.len() == 1 {
                    out.push(CallOutcome::Failed(reason));
                    return Ok(());
                }
                let mid = calls.len() / 2;
                Box::pin(self.run_range(&calls[..mid], out)).await?;
                Box::pin(self.run_range(&calls[mid..], out)).await?;
                Ok(())
            }
            // Provider exhaustion is not recoverable by bisection.
            Err(e) => Err(e),
        }
    }

    async fn aggregate_once(&self, calls: &[CallSpec]) -> Result<Vec<CallOutcome>> {
        let entries: Vec<IMulticall3::Call3> = calls
            .iter()
            .map(|c| IMulticall3::Call3 {
                target: c.target,
                allowFailure: true,
                callData: Bytes::from(c.call_data.clone()),
            })
            .collect();

        let call_data = IMulticall3::aggregate3Call { calls: entries }.abi_encode();
        let raw = self.providers.eth_call(self.contract, call_data).await?;

        let results = IMulticall3::aggregate3Call::abi_decode_returns(&raw).map_err(|e| {
            EngineError::CallFailed {
                target: format!("{:#x}", self.contract),
                reason: format!("aggregate3 return decode: {}", e),
            }
        })?;

        if results.len() != calls.len() {
            return Err(EngineError::CallFailed {
                target: format!("{:#x}", self.contract),
                reason: format!(
                    "aggregate3 returned {} results for {} calls",
                    results.len(),
                    calls.len()
                ),
            });
        }

        Ok(results
            .into_iter()
            .map(|r| {
                if r.success {
                    CallOutcome::Success(r.returnData)
                } else {
                    CallOutcome::Failed("entry reverted".to_string())
                }
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// ERC-20 call builders and decoders
// ---------------------------------------------------------------------------

pub fn balance_of(token: Address, owner: Address) -> CallSpec {
    CallSpec {
        target: token,
        call_data: IERC20::balanceOfCall { owner }.abi_encode(),
    }
}

pub fn symbol_of(token: Address) -> CallSpec {
    CallSpec {
        target: token,
        call_data: IERC20::symbolCall {}.abi_encode(),
    }
}

pub fn name_of(token: Address) -> CallSpec {
    CallSpec {
        target: token,
        call_data: IERC20::nameCall {}.abi_encode(),
    }
}

pub fn decimals_of(token: Address) -> CallSpec {
    CallSpec {
        target: token,
        call_data: IERC20::decimalsCall {}.abi_encode(),
    }
}

pub fn decode_balance(data: &Bytes) -> Option<U256> {
    IERC20::balanceOfCall::abi_decode_returns(data).ok()
}

pub fn decode_string(data: &Bytes) -> Option<String> {
    IERC20::symbolCall::abi_decode_returns(data).ok()
}

pub fn decode_decimals(data: &Bytes) -> Option<u8> {
    IERC20::decimalsCall::abi_decode_returns(data).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::sol_types::SolValue;

    #[test]
    fn balance_of_calldata_shape() {
        let token = Address::repeat_byte(0x11);
        let owner = Address::repeat_byte(0x22);
        let spec = balance_of(token, owner);
        // 4-byte selector + 32-byte padded address
        assert_eq!(spec.call_data.len(), 36);
        assert_eq!(&spec.call_data[..4], &[0x70, 0xa0, 0x82, 0x31]);
        assert_eq!(spec.target, token);
    }

    #[test]
    fn decodes_balance_word() {
        let value = U256::from(123_456_789u64);
        let encoded = Bytes::from(value.abi_encode());
        assert_eq!(decode_balance(&encoded), Some(value));
    }

    #[test]
    fn decodes_symbol_string() {
        let encoded = Bytes::from("USDC".to_string().abi_encode());
        assert_eq!(decode_string(&encoded).as_deref(), Some("USDC"));
    }

    #[test]
    fn decode_rejects_garbage() {
        let garbage = Bytes::from(vec![0xde, 0xad]);
        assert!(decode_balance(&garbage).is_none());
        assert!(decode_decimals(&garbage).is_none());
    }
}
