//! Configuration management for the Nexus Relayer
//!
//! Loads configuration from TOML files with environment variable substitution.

use crate::chain::finality::recommended_confirmations;
use crate::types::{Amount, ChainFamily, SupportedToken, ValidatorSet};

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub relayer: RelayerConfig,
    pub database: DatabaseConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    pub consensus: ConsensusConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub rpc: RpcConfig,
    pub chains: HashMap<String, ChainConfig>,
    pub wallet: WalletConfig,
    #[serde(default)]
    pub tokens: Vec<TokenConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayerConfig {
    pub instance_id: String,
    pub poll_interval_ms: u64,
    pub max_concurrent_transfers: usize,
    pub health_check_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub backend: DatabaseBackend,
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

/// Per-deployment consensus parameters
#[derive(Debug, Clone, Deserialize)]
pub struct ConsensusConfig {
    /// Minimum distinct authorized signers (T)
    pub threshold: usize,
    /// Authorized relayer addresses (0x-prefixed)
    pub relayers: Vec<String>,
    #[serde(default = "default_set_version")]
    pub validator_set_version: u64,
    pub signature_timeout_secs: u64,
    /// Base URLs of peer relayers' APIs
    #[serde(default)]
    pub peers: Vec<String>,
    #[serde(default = "default_rebroadcast_secs")]
    pub rebroadcast_interval_secs: u64,
}

fn default_set_version() -> u64 {
    1
}

fn default_rebroadcast_secs() -> u64 {
    30
}

impl ConsensusConfig {
    pub fn signature_timeout(&self) -> Duration {
        Duration::from_secs(self.signature_timeout_secs)
    }

    pub fn validator_set(&self) -> ValidatorSet {
        ValidatorSet::new(
            self.relayers.clone(),
            self.threshold,
            self.validator_set_version,
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcConfig {
    pub request_timeout_ms: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 10_000,
        }
    }
}

impl RpcConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub name: String,
    #[serde(default)]
    pub family: ChainFamily,
    /// JSON-RPC endpoints for EVM chains, LCD endpoints for Cosmos chains
    pub rpc_urls: Vec<String>,
    /// Cosmos network id (e.g. "cosmoshub-4"); unused for EVM chains
    pub network: Option<String>,
    pub bridge_contract: String,
    pub required_confirmations: u64,
    pub block_time_ms: u64,
    #[serde(default)]
    pub gas: GasConfig,
    pub enabled: bool,
}

impl ChainConfig {
    /// Watchers poll at roughly twice per block
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis((self.block_time_ms / 2).max(100))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GasConfig {
    pub gas_limit: Option<u64>,
    pub gas_price_strategy: GasPriceStrategy,
    pub max_gas_price_gwei: u64,
    pub limit_buffer_percent: u64,
    pub price_buffer_percent: u64,
}

impl Default for GasConfig {
    fn default() -> Self {
        Self {
            gas_limit: None,
            gas_price_strategy: GasPriceStrategy::Eip1559,
            max_gas_price_gwei: 500,
            limit_buffer_percent: 20,
            price_buffer_percent: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum GasPriceStrategy {
    Legacy,
    Eip1559,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WalletConfig {
    pub private_key_env: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenConfig {
    pub chain_id: u64,
    pub address: String,
    pub name: String,
    pub symbol: String,
    pub decimals: u8,
    #[serde(default)]
    pub is_native: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub min_amount: Option<String>,
    pub max_amount: Option<String>,
}

fn default_true() -> bool {
    true
}

impl TokenConfig {
    pub fn to_supported_token(&self) -> Result<SupportedToken> {
        let parse = |v: &Option<String>| -> Result<Option<Amount>> {
            v.as_deref()
                .map(|s| s.parse::<Amount>().map_err(|e| anyhow::anyhow!(e)))
                .transpose()
        };
        Ok(SupportedToken {
            chain_id: self.chain_id,
            token_address: self.address.to_lowercase(),
            name: self.name.clone(),
            symbol: self.symbol.clone(),
            decimals: self.decimals,
            is_native: self.is_native,
            enabled: self.enabled,
            min_amount: parse(&self.min_amount)?,
            max_amount: parse(&self.max_amount)?,
        })
    }
}

impl Settings {
    /// Load settings from configuration files
    pub fn load() -> Result<Self> {
        let config_path = env::var("NEXUS_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    pub fn load_from(config_path: &PathBuf) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::parse(&config_str)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        // Substitute environment variables
        let config_str = substitute_env_vars(raw);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.enabled_chains().is_empty() {
            anyhow::bail!("At least one chain must be enabled");
        }

        if self.database.backend == DatabaseBackend::Postgres && self.database.url.is_empty() {
            anyhow::bail!("Postgres backend requires database.url");
        }

        let consensus = &self.consensus;
        if consensus.threshold == 0 {
            anyhow::bail!("Signature threshold must be at least 1");
        }
        let distinct: HashSet<String> = consensus
            .relayers
            .iter()
            .map(|r| r.to_lowercase())
            .collect();
        if consensus.threshold > distinct.len() {
            anyhow::bail!(
                "Signature threshold {} exceeds the {} authorized relayers",
                consensus.threshold,
                distinct.len()
            );
        }
        if consensus.signature_timeout_secs == 0 {
            anyhow::bail!("Signature collection timeout must be positive");
        }

        let mut seen = HashSet::new();
        for (name, chain) in &self.chains {
            if !seen.insert(chain.chain_id) {
                anyhow::bail!("Chain id {} configured more than once", chain.chain_id);
            }
            if !chain.enabled {
                continue;
            }
            if chain.rpc_urls.is_empty() {
                anyhow::bail!("Chain {} has no RPC URLs configured", name);
            }
            if chain.bridge_contract.is_empty() {
                anyhow::bail!("Chain {} has no bridge contract configured", name);
            }
            if chain.required_confirmations == 0 {
                anyhow::bail!("Chain {} must require at least one confirmation", name);
            }
            if chain.block_time_ms == 0 {
                anyhow::bail!("Chain {} block time must be positive", name);
            }
            if chain.family == ChainFamily::Cosmos && chain.network.is_none() {
                anyhow::bail!("Cosmos chain {} needs a network id", name);
            }
            let recommended = recommended_confirmations(chain.chain_id);
            if chain.family == ChainFamily::Evm && chain.required_confirmations < recommended {
                tracing::warn!(
                    "Chain {} requires {} confirmations, below the recommended {}",
                    name,
                    chain.required_confirmations,
                    recommended
                );
            }
        }

        for token in &self.tokens {
            if token.decimals > 18 {
                anyhow::bail!("Token {} decimals cannot exceed 18", token.symbol);
            }
            token.to_supported_token()?;
        }

        Ok(())
    }

    /// Get list of enabled chains
    pub fn enabled_chains(&self) -> Vec<(&String, &ChainConfig)> {
        self.chains.iter().filter(|(_, c)| c.enabled).collect()
    }

    /// Get chain config by chain ID
    pub fn get_chain_by_id(&self, chain_id: u64) -> Option<&ChainConfig> {
        self.chains.values().find(|c| c.chain_id == chain_id)
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    lazy_static::lazy_static! {
        static ref ENV_VAR: regex::Regex =
            regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("static regex");
    }

    let mut result = input.to_string();
    for cap in ENV_VAR.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
[relayer]
instance_id = "relayer-a"
poll_interval_ms = 1000
max_concurrent_transfers = 8
health_check_interval_secs = 30

[database]
backend = "memory"

[api]
host = "127.0.0.1"
port = 8080

[metrics]
enabled = false
port = 9090

[consensus]
threshold = 2
relayers = ["0x1111111111111111111111111111111111111111", "0x2222222222222222222222222222222222222222", "0x3333333333333333333333333333333333333333"]
signature_timeout_secs = 600

[wallet]
private_key_env = "RELAYER_PRIVATE_KEY"

[chains.ethereum]
chain_id = 1
name = "Ethereum"
rpc_urls = ["http://localhost:8545"]
bridge_contract = "0x00000000000000000000000000000000000000aa"
required_confirmations = 32
block_time_ms = 12000
enabled = true

[chains.polygon]
chain_id = 137
name = "Polygon"
rpc_urls = ["http://localhost:8546"]
bridge_contract = "0x00000000000000000000000000000000000000bb"
required_confirmations = 128
block_time_ms = 2000
enabled = true

[[tokens]]
chain_id = 1
address = "0x00000000000000000000000000000000000000CC"
name = "Test Token"
symbol = "TT"
decimals = 18
max_amount = "1000000000000000000000"
"#;

    #[test]
    fn test_env_var_substitution() {
        env::set_var("NEXUS_TEST_VAR", "test_value");
        let input = "url = \"https://api.example.com/${NEXUS_TEST_VAR}/endpoint\"";
        let result = substitute_env_vars(input);
        assert_eq!(result, "url = \"https://api.example.com/test_value/endpoint\"");
    }

    #[test]
    fn test_parse_sample_config() {
        let settings = Settings::parse(SAMPLE).unwrap();
        assert_eq!(settings.enabled_chains().len(), 2);
        assert_eq!(settings.consensus.threshold, 2);
        assert_eq!(settings.retry.max_attempts, 5);
        let polygon = settings.get_chain_by_id(137).unwrap();
        assert_eq!(polygon.family, ChainFamily::Evm);
        assert_eq!(polygon.poll_interval(), Duration::from_millis(1000));

        let token = settings.tokens[0].to_supported_token().unwrap();
        assert_eq!(token.token_address, "0x00000000000000000000000000000000000000cc");
        assert!(token.max_amount.is_some());
    }

    #[test]
    fn test_threshold_above_relayer_count_rejected() {
        let raw = SAMPLE.replace("threshold = 2", "threshold = 4");
        let err = Settings::parse(&raw).unwrap_err();
        assert!(err.to_string().contains("exceeds"));
    }

    #[test]
    fn test_zero_confirmations_rejected() {
        let raw = SAMPLE.replace("required_confirmations = 128", "required_confirmations = 0");
        assert!(Settings::parse(&raw).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let settings = Settings::load_from(&file.path().to_path_buf()).unwrap();
        assert_eq!(settings.relayer.instance_id, "relayer-a");
    }

    /// The shipped default file with every placeholder filled in
    fn shipped_default() -> String {
        let placeholder = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap();
        let mut n = 0u64;
        placeholder
            .replace_all(include_str!("../config/default.toml"), |cap: &regex::Captures| {
                n += 1;
                match &cap[1] {
                    "RELAYER_INSTANCE_ID" => "relayer-a".to_string(),
                    name if name.ends_with("_URL") => format!("http://localhost:{}", 8000 + n),
                    _ => format!("0x{:040x}", n),
                }
            })
            .into_owned()
    }

    #[test]
    fn test_shipped_defaults() {
        let settings = Settings::parse(&shipped_default()).unwrap();
        assert_eq!(settings.consensus.signature_timeout(), Duration::from_secs(600));
        assert_eq!(settings.consensus.threshold, 2);
        assert_eq!(settings.enabled_chains().len(), 2);
        assert_eq!(settings.tokens.len(), 2);
    }
}
