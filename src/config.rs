//! Configuration management for the maker relayer
//!
//! Loads configuration from TOML files with environment variable substitution.

use anyhow::{Context, Result};
use lazy_static::lazy_static;
use regex::Regex;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::env;
use std::path::{Path, PathBuf};

lazy_static! {
    static ref ENV_VAR_PATTERN: Regex =
        Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("valid env var pattern");
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub relayer: RelayerConfig,
    pub database: DatabaseConfig,
    pub metrics: MetricsConfig,
    pub chains: HashMap<String, ChainConfig>,
    #[serde(default)]
    pub makers: Vec<MakerConfig>,
    #[serde(default)]
    pub pools: Vec<PoolConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayerConfig {
    pub instance_id: String,
    /// Delay between confirmation polls
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_confirmations")]
    pub source_confirmations: u64,
    #[serde(default = "default_confirmations")]
    pub destination_confirmations: u64,
    #[serde(default = "default_retry_sweep_interval_secs")]
    pub retry_sweep_interval_secs: u64,
    #[serde(default = "default_listener_interval_ms")]
    pub listener_interval_ms: u64,
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Optional limits on the otherwise unbounded retry loops.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RetryConfig {
    /// Multiplier applied to the poll delay after consecutive adapter failures
    pub backoff_factor: Option<u32>,
    pub max_delay_ms: Option<u64>,
    /// Consecutive failures after which an error is logged and counted
    pub alert_after: Option<u32>,
    /// Give up polling after this many consecutive failures
    pub max_poll_attempts: Option<u32>,
    /// Stop re-driving a failed send after this many attempts
    pub max_send_attempts: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    /// Bridge-internal chain id, the one embedded in transfer amounts
    pub chain_id: u64,
    pub name: String,
    /// EIP-155 chain id used for signing, when it differs from `chain_id`
    pub network_id: Option<u64>,
    #[serde(default)]
    pub kind: ChainKind,
    #[serde(default)]
    pub rpc_urls: Vec<String>,
    pub confirmation_blocks: Option<u64>,
    #[serde(default)]
    pub gas_price_strategy: GasPriceStrategy,
    #[serde(default = "default_max_gas_price_gwei")]
    pub max_gas_price_gwei: u64,
    /// Below this node price the `doubled` strategy uses `floor_gas_price_gwei`
    pub gas_price_floor_gwei: Option<u64>,
    pub floor_gas_price_gwei: Option<u64>,
    pub fallback_gas_price_gwei: Option<u64>,
    pub gas_limit: Option<u64>,
    pub gas_oracle_url: Option<String>,
    pub gas_oracle_key: Option<String>,
    pub tag_digits: Option<u32>,
    pub significant_digits: Option<u32>,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChainKind {
    #[default]
    Evm,
    Rollup,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GasPriceStrategy {
    /// Gas-tracker oracle with a ceiling
    Oracle,
    /// Node price, doubled, with a floor
    Doubled,
    #[default]
    Node,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MakerConfig {
    pub address: String,
    pub private_key_env: String,
}

/// A two-way market between chain `c1` and chain `c2`
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    pub maker_address: String,
    pub token_name: String,
    pub precision: u32,
    pub c1: PoolSideConfig,
    pub c2: PoolSideConfig,
}

/// Prices and fees charged for transfers leaving one side of a pool
#[derive(Debug, Clone, Deserialize)]
pub struct PoolSideConfig {
    pub chain_id: u64,
    pub token_address: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub min_price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub max_price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub trading_fee: Decimal,
    /// Per mille of the post-fee amount
    #[serde(with = "rust_decimal::serde::str")]
    pub gas_fee: Decimal,
}

fn default_poll_interval_ms() -> u64 {
    8_000
}

fn default_confirmations() -> u64 {
    3
}

fn default_retry_sweep_interval_secs() -> u64 {
    10
}

fn default_listener_interval_ms() -> u64 {
    2_000
}

fn default_health_check_interval_secs() -> u64 {
    30
}

fn default_max_gas_price_gwei() -> u64 {
    165
}

impl Settings {
    /// Load settings from the configured file
    pub fn load() -> Result<Self> {
        let config_path = env::var("MAKER_RELAYER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from a specific path
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::parse(&config_str)
    }

    /// Parse settings from TOML text
    pub fn parse(config_str: &str) -> Result<Self> {
        // Substitute environment variables
        let config_str = substitute_env_vars(config_str);

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

        let mut seen_ids = HashSet::new();
        for (name, chain) in &self.chains {
            if !seen_ids.insert(chain.chain_id) {
                anyhow::bail!("Chain id {} is configured twice", chain.chain_id);
            }
            if chain.enabled && chain.kind == ChainKind::Evm && chain.rpc_urls.is_empty() {
                anyhow::bail!("Chain {} has no RPC URLs configured", name);
            }
            if chain.gas_price_strategy == GasPriceStrategy::Oracle
                && chain.gas_oracle_url.is_none()
            {
                anyhow::bail!("Chain {} uses the oracle gas strategy without gas_oracle_url", name);
            }
        }

        for pool in &self.pools {
            for side in [&pool.c1, &pool.c2] {
                match self.get_chain_by_id(side.chain_id) {
                    None => anyhow::bail!(
                        "Pool {} references unknown chain {}",
                        pool.token_name,
                        side.chain_id
                    ),
                    Some(chain) if !chain.enabled => anyhow::bail!(
                        "Pool {} references disabled chain {}",
                        pool.token_name,
                        side.chain_id
                    ),
                    Some(_) => {}
                }
                if side.min_price > side.max_price {
                    anyhow::bail!(
                        "Pool {} on chain {} has min_price above max_price",
                        pool.token_name,
                        side.chain_id
                    );
                }
            }
            if !self
                .makers
                .iter()
                .any(|m| m.address.eq_ignore_ascii_case(&pool.maker_address))
            {
                tracing::warn!(
                    "Pool {} maker {} has no signing key configured",
                    pool.token_name,
                    pool.maker_address
                );
            }
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
    let mut result = input.to_string();

    for cap in ENV_VAR_PATTERN.captures_iter(input) {
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
    use std::str::FromStr;

    const SAMPLE: &str = r#"
[relayer]
instance_id = "maker-1"

[database]
url = "postgres://relayer@localhost/${MAKER_TEST_DB}"
max_connections = 5
min_connections = 1

[metrics]
enabled = false
port = 9100

[chains.mainnet]
chain_id = 1
name = "mainnet"
rpc_urls = ["http://localhost:8545"]
gas_price_strategy = "oracle"
gas_oracle_url = "https://api.etherscan.io/api"
enabled = true

[chains.zksync]
chain_id = 3
name = "zksync"
kind = "rollup"
significant_digits = 10
enabled = true

[[makers]]
address = "0x0043d60e87c5dd08c86c3123340705a1556c4719"
private_key_env = "MAKER_KEY"

[[pools]]
maker_address = "0x0043d60e87c5dd08c86c3123340705a1556c4719"
token_name = "ETH"
precision = 18

[pools.c1]
chain_id = 1
token_address = "0x0000000000000000000000000000000000000000"
min_price = "0.005"
max_price = "1"
trading_fee = "0.0006"
gas_fee = "1"

[pools.c2]
chain_id = 3
token_address = "0x0000000000000000000000000000000000000000"
min_price = "0.005"
max_price = "1"
trading_fee = "0.0005"
gas_fee = "1.5"
"#;

    #[test]
    fn test_env_var_substitution() {
        env::set_var("TEST_VAR", "test_value");
        let input = "url = \"https://api.example.com/${TEST_VAR}/endpoint\"";
        let result = substitute_env_vars(input);
        assert_eq!(result, "url = \"https://api.example.com/test_value/endpoint\"");
    }

    #[test]
    fn test_parse_sample_with_defaults() {
        env::set_var("MAKER_TEST_DB", "bridge");
        let settings = Settings::parse(SAMPLE).unwrap();

        assert_eq!(settings.database.url, "postgres://relayer@localhost/bridge");
        assert_eq!(settings.relayer.poll_interval_ms, 8_000);
        assert_eq!(settings.relayer.source_confirmations, 3);
        assert!(settings.relayer.retry.max_send_attempts.is_none());

        let zk = settings.get_chain_by_id(3).unwrap();
        assert_eq!(zk.kind, ChainKind::Rollup);
        assert_eq!(zk.significant_digits, Some(10));

        let pool = &settings.pools[0];
        assert_eq!(pool.c2.gas_fee, Decimal::from_str("1.5").unwrap());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.enabled_chains().len(), 2);
    }

    #[test]
    fn test_pool_with_unknown_chain_is_rejected() {
        let broken = SAMPLE.replace("chain_id = 3\ntoken_address", "chain_id = 42\ntoken_address");
        assert!(Settings::parse(&broken).is_err());
    }

    #[test]
    fn test_pool_with_disabled_chain_is_rejected() {
        let disabled = SAMPLE.replace(
            "significant_digits = 10\nenabled = true",
            "significant_digits = 10\nenabled = false",
        );
        assert_ne!(disabled, SAMPLE);
        let err = Settings::parse(&disabled).unwrap_err();
        assert!(err.to_string().contains("disabled chain 3"));
    }
}
