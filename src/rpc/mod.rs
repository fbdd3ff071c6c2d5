pub mod multicall;
pub mod pool;

pub use multicall::MulticallEngine;
pub use pool::{ChainProviders, ProviderPool};
