//! Chain module - per-chain adapters and the registry that routes to them
//!
//! This module provides:
//! - The [`ChainAdapter`] / [`RollupClient`] capability traits
//! - An ethers-backed EVM adapter with RPC failover
//! - Confirmation depth lookups
//! - A polling transfer listener for EVM source chains
//! - [`ChainRegistry`], mapping chain id to profile and backend

pub mod adapter;
pub mod confirmation;
pub mod erc20;
pub mod listener;
pub mod provider;

pub use adapter::{
    ChainAdapter, ChainReceipt, ChainTransaction, RollupClient, RollupReceipt, RollupTransfer,
};
#[cfg(test)]
pub use adapter::{MockChainAdapter, MockRollupClient};
pub use confirmation::{confirmation_status, ConfirmationStatus};
pub use listener::{TransferListener, WatchList};
pub use provider::EvmChainProvider;

use crate::codec::{AmountCodec, CodecRule, TAG_DIGITS};
use crate::config::{ChainConfig, ChainKind, Settings};
use crate::error::{RelayerError, RelayerResult};
use crate::pool::PoolBook;
use crate::tx::GasPolicy;

use dashmap::DashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Significant digits kept by rollup amount packing
const ROLLUP_SIGNIFICANT_DIGITS: u32 = 10;

/// Static facts about a chain
#[derive(Debug, Clone)]
pub struct ChainProfile {
    /// Bridge-internal id, the one embedded in amounts
    pub chain_id: u64,
    pub name: String,
    /// EIP-155 id used when signing
    pub network_id: u64,
    pub kind: ChainKind,
    pub confirmation_blocks: Option<u64>,
    pub gas: GasPolicy,
    pub codec_rule: CodecRule,
}

impl ChainProfile {
    pub fn from_config(config: &ChainConfig) -> Self {
        let significant_digits = match config.kind {
            ChainKind::Rollup => config
                .significant_digits
                .or(Some(ROLLUP_SIGNIFICANT_DIGITS)),
            ChainKind::Evm => config.significant_digits,
        };

        Self {
            chain_id: config.chain_id,
            name: config.name.clone(),
            network_id: config.network_id.unwrap_or(config.chain_id),
            kind: config.kind,
            confirmation_blocks: config.confirmation_blocks,
            gas: GasPolicy::from_config(config),
            codec_rule: CodecRule {
                tag_digits: config.tag_digits.unwrap_or(TAG_DIGITS),
                significant_digits,
            },
        }
    }

    /// Minimal EVM profile where the network id equals the chain id
    pub fn evm(chain_id: u64, name: &str) -> Self {
        Self {
            chain_id,
            name: name.to_string(),
            network_id: chain_id,
            kind: ChainKind::Evm,
            confirmation_blocks: None,
            gas: GasPolicy::node_default(),
            codec_rule: CodecRule::default(),
        }
    }

    /// Minimal rollup profile
    pub fn rollup(chain_id: u64, name: &str) -> Self {
        Self {
            kind: ChainKind::Rollup,
            codec_rule: CodecRule::packed(ROLLUP_SIGNIFICANT_DIGITS),
            ..Self::evm(chain_id, name)
        }
    }

    pub fn required_confirmations(&self, default: u64) -> u64 {
        self.confirmation_blocks.unwrap_or(default)
    }
}

/// How a chain is reached
#[derive(Clone)]
pub enum ChainBackend {
    Evm(Arc<dyn ChainAdapter>),
    Rollup(Arc<dyn RollupClient>),
}

pub struct ChainEntry {
    pub profile: ChainProfile,
    pub backend: ChainBackend,
}

/// Chain id to adapter; new chains register here
#[derive(Default)]
pub struct ChainRegistry {
    chains: DashMap<u64, Arc<ChainEntry>>,
    /// Every configured chain, served or not yet
    profiles: DashMap<u64, ChainProfile>,
}

impl ChainRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build EVM adapters for every enabled EVM chain in `settings`.
    ///
    /// Rollup chains need a client supplied by the caller through
    /// [`ChainRegistry::register`]; their profiles, and so their amount
    /// layout, are known from the start.
    pub fn from_settings(settings: &Settings) -> RelayerResult<Self> {
        let registry = Self::new();

        for (name, chain_config) in settings.enabled_chains() {
            registry
                .profiles
                .insert(chain_config.chain_id, ChainProfile::from_config(chain_config));
            match chain_config.kind {
                ChainKind::Evm => {
                    info!(
                        "Initializing chain {} (ID: {})",
                        chain_config.name, chain_config.chain_id
                    );
                    let provider = EvmChainProvider::new(chain_config)?;
                    registry.register(
                        ChainProfile::from_config(chain_config),
                        ChainBackend::Evm(Arc::new(provider)),
                    );
                }
                ChainKind::Rollup => {
                    warn!("Chain {} is a rollup; waiting for a client to be registered", name);
                }
            }
        }

        Ok(registry)
    }

    pub fn register(&self, profile: ChainProfile, backend: ChainBackend) {
        info!("Registered chain {} (ID: {})", profile.name, profile.chain_id);
        self.profiles.insert(profile.chain_id, profile.clone());
        self.chains.insert(
            profile.chain_id,
            Arc::new(ChainEntry { profile, backend }),
        );
    }

    pub fn get(&self, chain_id: u64) -> RelayerResult<Arc<ChainEntry>> {
        self.chains
            .get(&chain_id)
            .map(|e| e.clone())
            .ok_or(RelayerError::ChainNotFound { chain_id })
    }

    /// EVM adapter for `chain_id`
    pub fn evm(&self, chain_id: u64) -> RelayerResult<Arc<dyn ChainAdapter>> {
        match &self.get(chain_id)?.backend {
            ChainBackend::Evm(adapter) => Ok(adapter.clone()),
            ChainBackend::Rollup(_) => Err(RelayerError::Config(format!(
                "chain {} is not an EVM chain",
                chain_id
            ))),
        }
    }

    pub fn chain_ids(&self) -> Vec<u64> {
        self.chains.iter().map(|e| *e.key()).collect()
    }

    /// Amount codec with every configured chain's tag layout, including
    /// chains whose backend is registered later
    pub fn codec(&self) -> AmountCodec {
        let mut codec = AmountCodec::new();
        for profile in self.profiles.iter() {
            codec.set_rule(*profile.key(), profile.value().codec_rule);
        }
        codec
    }

    /// Fail unless both chains of every pool rule have a backend
    pub fn ensure_serves(&self, book: &PoolBook) -> RelayerResult<()> {
        for rule in book.rules() {
            for chain_id in [rule.source_chain_id, rule.dest_chain_id] {
                if !self.chains.contains_key(&chain_id) {
                    let kind = match self.profiles.get(&chain_id) {
                        Some(profile) if profile.kind == ChainKind::Rollup => {
                            "rollup chain without a client"
                        }
                        Some(_) => "chain without a backend",
                        None => "chain that is not enabled",
                    };
                    return Err(RelayerError::Config(format!(
                        "pool {} ({} -> {}) uses {}, a {}",
                        rule.token_name, rule.source_chain_id, rule.dest_chain_id, chain_id, kind
                    )));
                }
            }
        }
        Ok(())
    }

    /// Health check for all EVM chains
    pub async fn health_check(&self) -> Vec<(u64, bool)> {
        let adapters: Vec<(u64, Arc<dyn ChainAdapter>)> = self
            .chains
            .iter()
            .filter_map(|e| match &e.value().backend {
                ChainBackend::Evm(adapter) => Some((*e.key(), adapter.clone())),
                ChainBackend::Rollup(_) => None,
            })
            .collect();

        let mut results = Vec::with_capacity(adapters.len());
        for (chain_id, adapter) in adapters {
            let healthy = match adapter.get_block_number().await {
                Ok(_) => true,
                Err(e) => {
                    error!("Health check failed for chain {}: {}", chain_id, e);
                    false
                }
            };
            crate::metrics::record_chain_health(chain_id, healthy);
            results.push((chain_id, healthy));
        }

        results
    }
}
