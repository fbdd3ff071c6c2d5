use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub rpc: RpcConfig,
    #[serde(default)]
    pub price: PriceConfig,
    pub chains: Vec<ChainProfile>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    20
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Allowed CORS origin; "*" means permissive.
    #[serde(default = "default_cors_origin")]
    pub cors_origin: String,
    #[serde(default = "default_request_deadline_secs")]
    pub request_deadline_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origin: default_cors_origin(),
            request_deadline_secs: default_request_deadline_secs(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_cors_origin() -> String {
    "*".to_string()
}

fn default_request_deadline_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_ttl_seconds")]
    pub ttl_seconds: u64,
    #[serde(default = "default_hard_expiry_minutes")]
    pub hard_expiry_minutes: u64,
    #[serde(default = "default_build_timeout_seconds")]
    pub build_timeout_seconds: u64,
    #[serde(default = "default_stuck_sync_threshold_seconds")]
    pub stuck_sync_threshold_seconds: u64,
    #[serde(default = "default_sweep_interval_minutes")]
    pub sweep_interval_minutes: u64,
    #[serde(default = "default_refresh_interval_seconds")]
    pub refresh_interval_seconds: u64,
    #[serde(default = "default_global_build_slots")]
    pub global_build_slots: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: default_ttl_seconds(),
            hard_expiry_minutes: default_hard_expiry_minutes(),
            build_timeout_seconds: default_build_timeout_seconds(),
            stuck_sync_threshold_seconds: default_stuck_sync_threshold_seconds(),
            sweep_interval_minutes: default_sweep_interval_minutes(),
            refresh_interval_seconds: default_refresh_interval_seconds(),
            global_build_slots: default_global_build_slots(),
        }
    }
}

fn default_ttl_seconds() -> u64 {
    60
}

fn default_hard_expiry_minutes() -> u64 {
    30
}

fn default_build_timeout_seconds() -> u64 {
    90
}

fn default_stuck_sync_threshold_seconds() -> u64 {
    300
}

fn default_sweep_interval_minutes() -> u64 {
    10
}

fn default_refresh_interval_seconds() -> u64 {
    60
}

fn default_global_build_slots() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct RpcConfig {
    #[serde(default = "default_rpc_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_rpc_timeout_ms(),
            probe_interval_secs: default_probe_interval_secs(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

fn default_rpc_timeout_ms() -> u64 {
    4000
}

fn default_probe_interval_secs() -> u64 {
    60
}

fn default_cooldown_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct PriceConfig {
    #[serde(default = "default_price_endpoint")]
    pub endpoint: String,
    /// Prices older than this are treated as missing.
    #[serde(default = "default_price_max_age_secs")]
    pub max_age_secs: u64,
}

impl Default for PriceConfig {
    fn default() -> Self {
        Self {
            endpoint: default_price_endpoint(),
            max_age_secs: default_price_max_age_secs(),
        }
    }
}

fn default_price_endpoint() -> String {
    "https://coins.llama.fi".to_string()
}

fn default_price_max_age_secs() -> u64 {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChainProfile {
    pub chain_id: i64,
    pub name: String,
    pub native_symbol: String,
    pub rpc_urls: Vec<String>,
    #[serde(default = "default_multicall")]
    pub multicall: String,
    #[serde(default = "default_log_chunk_size")]
    pub log_chunk_size: u64,
    #[serde(default = "default_scanner_concurrency")]
    pub scanner_concurrency: usize,
    #[serde(default)]
    pub start_block: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_catchup")]
    pub max_catchup: u64,
    #[serde(default = "default_reorg_depth")]
    pub reorg_depth: u64,
    #[serde(default = "default_discovery_min_tokens")]
    pub discovery_min_tokens: usize,
    /// Chain slug on the price API (e.g. "ethereum", "bsc", "base").
    pub price_slug: String,
    /// Price-API identifier for the native coin (e.g. "coingecko:ethereum",
    /// "coingecko:binancecoin"). Native prices are reported missing without it.
    pub native_price_id: Option<String>,
    pub explorer: Option<ExplorerConfig>,
    #[serde(default)]
    pub tokens: Vec<SeedToken>,
}

// Multicall3 is deployed at the same address on every supported chain.
fn default_multicall() -> String {
    "0xca11bde05977b3631167028862be2a173976ca11".to_string()
}

fn default_log_chunk_size() -> u64 {
    2000
}

fn default_scanner_concurrency() -> usize {
    4
}

fn default_poll_interval_ms() -> u64 {
    10_000
}

fn default_max_catchup() -> u64 {
    200
}

fn default_reorg_depth() -> u64 {
    32
}

fn default_discovery_min_tokens() -> usize {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExplorerConfig {
    pub url: String,
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
    #[serde(default, skip_deserializing)]
    pub api_key: String,
}

/// Verified token seeded into the registry at startup.
#[derive(Debug, Deserialize, Clone)]
pub struct SeedToken {
    pub symbol: String,
    pub address: String,
    pub decimals: u8,
    #[serde(default)]
    pub name: String,
}

impl Config {
    pub fn load(path: &str) -> eyre::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| eyre::eyre!("Failed to read config file '{}': {}", path, e))?;
        let mut config: Config = toml::from_str(&content)
            .map_err(|e| eyre::eyre!("Failed to parse config file '{}': {}", path, e))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Environment takes precedence over the file for deploy-time knobs.
    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("DATABASE_URL") {
            self.database.url = url;
        } else if let Ok(host) = std::env::var("PGHOST") {
            let port = std::env::var("PGPORT").unwrap_or_else(|_| "5432".to_string());
            let user = std::env::var("PGUSER").unwrap_or_else(|_| "postgres".to_string());
            let password = std::env::var("PGPASSWORD").unwrap_or_default();
            let dbname = std::env::var("PGDATABASE").unwrap_or_else(|_| "postgres".to_string());
            self.database.url =
                format!("postgres://{}:{}@{}:{}/{}", user, password, host, port, dbname);
        }
        if let Some(v) = env_parse::<u32>("PG_MAX_CONNECTIONS") {
            self.database.max_connections = v;
        }
        if let Some(v) = env_parse::<u64>("CACHE_TTL_SECONDS") {
            self.cache.ttl_seconds = v;
        }
        if let Some(v) = env_parse::<u64>("CLEANUP_INTERVAL_MINUTES") {
            self.cache.sweep_interval_minutes = v;
        }
        if let Some(v) = env_parse::<u64>("BACKGROUND_REFRESH_INTERVAL_SECONDS") {
            self.cache.refresh_interval_seconds = v;
        }
        if let Some(v) = env_parse::<u64>("RPC_TIMEOUT_MS") {
            self.rpc.timeout_ms = v;
        }
        if let Ok(origin) = std::env::var("CORS_ORIGIN") {
            self.server.cors_origin = origin;
        }

        for chain in &mut self.chains {
            // e.g. ETHEREUM_RPC_URL=https://a,https://b
            let var = format!("{}_RPC_URL", chain.name.to_uppercase());
            if let Ok(urls) = std::env::var(&var) {
                chain.rpc_urls = urls
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
            }
            if let Some(explorer) = &mut chain.explorer {
                explorer.api_key = std::env::var(&explorer.api_key_env).unwrap_or_default();
            }
        }
    }

    fn validate(&self) -> eyre::Result<()> {
        if self.chains.is_empty() {
            return Err(eyre::eyre!("At least one chain must be configured"));
        }
        for chain in &self.chains {
            if chain.chain_id <= 0 {
                return Err(eyre::eyre!(
                    "Chain '{}' has invalid chain_id {}",
                    chain.name,
                    chain.chain_id
                ));
            }
            if chain.rpc_urls.is_empty() {
                return Err(eyre::eyre!(
                    "Chain '{}' must have at least one RPC URL",
                    chain.name
                ));
            }
            if !is_hex_address(&chain.multicall) {
                return Err(eyre::eyre!(
                    "Invalid multicall address '{}' on chain '{}'",
                    chain.multicall,
                    chain.name
                ));
            }
            if chain.scanner_concurrency == 0 {
                return Err(eyre::eyre!(
                    "Chain '{}' scanner_concurrency must be at least 1",
                    chain.name
                ));
            }
            for token in &chain.tokens {
                if !is_hex_address(&token.address) {
                    return Err(eyre::eyre!(
                        "Invalid token address '{}' for {} on chain '{}'",
                        token.address,
                        token.symbol,
                        chain.name
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn chain(&self, chain_id: i64) -> Option<&ChainProfile> {
        self.chains.iter().find(|c| c.chain_id == chain_id)
    }
}

fn is_hex_address(s: &str) -> bool {
    let stripped = s.strip_prefix("0x").unwrap_or(s);
    stripped.len() == 40 && stripped.bytes().all(|b| b.is_ascii_hexdigit())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml_str = r#"
[database]
url = "postgres://localhost/test"
max_connections = 5

[[chains]]
chain_id = 1
name = "ethereum"
native_symbol = "ETH"
rpc_urls = ["http://localhost:8545"]
price_slug = "ethereum"

[[chains.tokens]]
symbol = "USDC"
address = "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48"
decimals = 6
"#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.chains.len(), 1);
        assert_eq!(config.chains[0].chain_id, 1);
        assert_eq!(config.chains[0].native_symbol, "ETH");
        assert_eq!(config.chains[0].log_chunk_size, 2000); // default
        assert_eq!(config.chains[0].max_catchup, 200); // default
        assert_eq!(config.chains[0].reorg_depth, 32); // default
        assert_eq!(config.cache.ttl_seconds, 60); // default
        assert_eq!(config.rpc.timeout_ms, 4000); // default
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_empty_chains() {
        let config = Config {
            database: DatabaseConfig {
                url: "postgres://localhost/test".to_string(),
                max_connections: 5,
            },
            server: ServerConfig::default(),
            cache: CacheConfig::default(),
            rpc: RpcConfig::default(),
            price: PriceConfig::default(),
            chains: vec![],
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_bad_multicall() {
        let toml_str = r#"
[database]
url = "postgres://localhost/test"

[[chains]]
chain_id = 56
name = "bsc"
native_symbol = "BNB"
rpc_urls = ["http://localhost:8545"]
multicall = "not-an-address"
price_slug = "bsc"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_chain_lookup() {
        let toml_str = r#"
[database]
url = "postgres://localhost/test"

[[chains]]
chain_id = 8453
name = "base"
native_symbol = "ETH"
rpc_urls = ["http://localhost:8545"]
price_slug = "base"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert!(config.chain(8453).is_some());
        assert!(config.chain(42).is_none());
    }
}
