//! Gas pricing strategies for payout transactions

use crate::chain::ChainAdapter;
use crate::config::{ChainConfig, GasPriceStrategy};
use crate::error::{RelayerError, RelayerResult};

use ethers::types::U256;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

const GWEI: u64 = 1_000_000_000;
const DEFAULT_GAS_LIMIT: u64 = 100_000;
/// Added to the oracle's proposed price
const ORACLE_PREMIUM_GWEI: u64 = 10;

/// Per-chain gas settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GasPolicy {
    pub strategy: GasPriceStrategy,
    pub ceiling_gwei: u64,
    pub floor_threshold_gwei: Option<u64>,
    pub floor_price_gwei: Option<u64>,
    pub fallback_gwei: Option<u64>,
    pub gas_limit: u64,
    pub oracle_url: Option<String>,
    pub oracle_key: Option<String>,
}

impl GasPolicy {
    pub fn from_config(config: &ChainConfig) -> Self {
        Self {
            strategy: config.gas_price_strategy,
            ceiling_gwei: config.max_gas_price_gwei,
            floor_threshold_gwei: config.gas_price_floor_gwei,
            floor_price_gwei: config.floor_gas_price_gwei,
            fallback_gwei: config.fallback_gas_price_gwei,
            gas_limit: config.gas_limit.unwrap_or(DEFAULT_GAS_LIMIT),
            oracle_url: config.gas_oracle_url.clone(),
            oracle_key: config.gas_oracle_key.clone(),
        }
    }

    /// Node price, no ceiling
    pub fn node_default() -> Self {
        Self {
            strategy: GasPriceStrategy::Node,
            ceiling_gwei: 165,
            floor_threshold_gwei: None,
            floor_price_gwei: None,
            fallback_gwei: None,
            gas_limit: DEFAULT_GAS_LIMIT,
            oracle_url: None,
            oracle_key: None,
        }
    }

    fn ceiling(&self) -> U256 {
        gwei(self.ceiling_gwei)
    }
}

/// Gas-tracker reply; `result` is an error string unless `status` is "1"
#[derive(Debug, Deserialize)]
struct OracleResponse {
    status: String,
    result: serde_json::Value,
}

/// Prices payout transactions according to each chain's [`GasPolicy`]
#[derive(Debug, Clone)]
pub struct GasPricer {
    client: reqwest::Client,
}

impl GasPricer {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self { client }
    }

    /// Gas price in wei for the next payout on `adapter`'s chain
    pub async fn gas_price(
        &self,
        policy: &GasPolicy,
        adapter: &dyn ChainAdapter,
    ) -> RelayerResult<U256> {
        let chain_id = adapter.chain_id();
        let price = match policy.strategy {
            GasPriceStrategy::Oracle => {
                let proposed = match self.fetch_oracle_price(policy).await {
                    Ok(price) => Some(price),
                    Err(e) => {
                        warn!("Gas oracle failed for chain {}: {}", chain_id, e);
                        None
                    }
                };
                oracle_price(policy, proposed)
            }
            GasPriceStrategy::Doubled | GasPriceStrategy::Node => match adapter.get_gas_price().await {
                Ok(price) if policy.strategy == GasPriceStrategy::Doubled => {
                    doubled_price(policy, price)
                }
                Ok(price) => price,
                Err(e) => match policy.fallback_gwei {
                    Some(fallback) => {
                        warn!(
                            "Node gas price failed for chain {}, using fallback {} gwei: {}",
                            chain_id, fallback, e
                        );
                        gwei(fallback)
                    }
                    None => return Err(e),
                },
            },
        };

        debug!("Gas price for chain {}: {} wei", chain_id, price);
        Ok(price)
    }

    async fn fetch_oracle_price(&self, policy: &GasPolicy) -> RelayerResult<U256> {
        let url = policy
            .oracle_url
            .as_deref()
            .ok_or_else(|| RelayerError::Config("gas oracle url missing".to_string()))?;

        let response = self
            .client
            .get(url)
            .query(&[
                ("module", "gastracker"),
                ("action", "gasoracle"),
                ("apikey", policy.oracle_key.as_deref().unwrap_or_default()),
            ])
            .send()
            .await
            .map_err(|e| RelayerError::Internal(format!("gas oracle request: {}", e)))?
            .json::<OracleResponse>()
            .await
            .map_err(|e| RelayerError::Internal(format!("gas oracle response: {}", e)))?;

        if response.status != "1" {
            return Err(RelayerError::Internal(format!(
                "gas oracle status {}: {}",
                response.status, response.result
            )));
        }
        let proposed = response
            .result
            .get("ProposeGasPrice")
            .and_then(|v| v.as_str())
            .ok_or_else(|| RelayerError::Internal("gas oracle reply without ProposeGasPrice".to_string()))?;

        parse_gwei(proposed)
    }
}

impl Default for GasPricer {
    fn default() -> Self {
        Self::new()
    }
}

fn gwei(amount: u64) -> U256 {
    U256::from(amount) * U256::from(GWEI)
}

/// Decimal gwei string to wei
fn parse_gwei(value: &str) -> RelayerResult<U256> {
    let gwei_price = Decimal::from_str(value.trim())
        .map_err(|e| RelayerError::Internal(format!("gas price {:?}: {}", value, e)))?;
    (gwei_price * Decimal::from(GWEI))
        .trunc()
        .to_u128()
        .map(U256::from)
        .ok_or_else(|| RelayerError::Internal(format!("gas price {:?} out of range", value)))
}

/// Proposed price plus premium, never above the ceiling; the ceiling when
/// the oracle is unavailable
fn oracle_price(policy: &GasPolicy, proposed: Option<U256>) -> U256 {
    match proposed {
        Some(price) => (price + gwei(ORACLE_PREMIUM_GWEI)).min(policy.ceiling()),
        None => policy.ceiling(),
    }
}

/// Node price doubled, or the fixed floor price when the node reports a
/// price under the floor threshold
fn doubled_price(policy: &GasPolicy, node_price: U256) -> U256 {
    match (policy.floor_threshold_gwei, policy.floor_price_gwei) {
        (Some(threshold), Some(floor)) if node_price < gwei(threshold) => gwei(floor),
        _ => node_price * 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MockChainAdapter;

    fn policy(strategy: GasPriceStrategy) -> GasPolicy {
        GasPolicy {
            strategy,
            ceiling_gwei: 165,
            floor_threshold_gwei: Some(5),
            floor_price_gwei: Some(10),
            fallback_gwei: Some(20),
            ..GasPolicy::node_default()
        }
    }

    #[test]
    fn oracle_adds_premium_under_ceiling() {
        let policy = policy(GasPriceStrategy::Oracle);
        assert_eq!(oracle_price(&policy, Some(gwei(30))), gwei(40));
        assert_eq!(oracle_price(&policy, Some(gwei(200))), gwei(165));
        assert_eq!(oracle_price(&policy, None), gwei(165));
    }

    #[test]
    fn parses_fractional_gwei() {
        assert_eq!(parse_gwei("23").unwrap(), gwei(23));
        assert_eq!(parse_gwei("1.5").unwrap(), U256::from(1_500_000_000u64));
        assert!(parse_gwei("fast").is_err());
    }

    #[test]
    fn doubled_uses_floor_for_cheap_chains() {
        let policy = policy(GasPriceStrategy::Doubled);
        assert_eq!(doubled_price(&policy, gwei(1)), gwei(10));
        assert_eq!(doubled_price(&policy, gwei(6)), gwei(12));
    }

    #[tokio::test]
    async fn node_strategy_falls_back_on_error() {
        let mut adapter = MockChainAdapter::new();
        adapter.expect_chain_id().return_const(1u64);
        adapter.expect_get_gas_price().returning(|| {
            Err(RelayerError::ChainConnection {
                chain_id: 1,
                message: "timeout".to_string(),
            })
        });

        let price = GasPricer::new()
            .gas_price(&policy(GasPriceStrategy::Node), &adapter)
            .await
            .unwrap();
        assert_eq!(price, gwei(20));
    }

    #[tokio::test]
    async fn doubled_strategy_queries_node() {
        let mut adapter = MockChainAdapter::new();
        adapter.expect_chain_id().return_const(5u64);
        adapter
            .expect_get_gas_price()
            .returning(|| Ok(U256::from(7_000_000_000u64)));

        let price = GasPricer::new()
            .gas_price(&policy(GasPriceStrategy::Doubled), &adapter)
            .await
            .unwrap();
        assert_eq!(price, U256::from(14_000_000_000u64));
    }
}
