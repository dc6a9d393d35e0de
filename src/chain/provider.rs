//! EVM chain adapter with multi-RPC support and automatic failover

use super::adapter::{ChainAdapter, ChainReceipt, ChainTransaction};
use super::erc20;
use crate::config::ChainConfig;
use crate::error::{RelayerError, RelayerResult};

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::providers::{Http, Provider, ProviderError};
use ethers::types::transaction::eip2718::TypedTransaction;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// HTTP providers for one chain, rotated on failure
pub struct EvmChainProvider {
    chain_id: u64,
    http_providers: Vec<Provider<Http>>,
    current_provider: AtomicUsize,
}

impl EvmChainProvider {
    pub fn new(config: &ChainConfig) -> RelayerResult<Self> {
        let mut http_providers = Vec::new();

        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    http_providers.push(provider.interval(Duration::from_millis(100)));
                    debug!("Added HTTP provider for chain {}: {}", config.chain_id, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if http_providers.is_empty() {
            return Err(RelayerError::ChainConnection {
                chain_id: config.chain_id,
                message: "No valid RPC providers".to_string(),
            });
        }

        Ok(Self {
            chain_id: config.chain_id,
            http_providers,
            current_provider: AtomicUsize::new(0),
        })
    }

    /// Get the active HTTP provider
    pub fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Switch to next available provider
    pub fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("Chain {} failover to provider {}", self.chain_id, next);
    }

    /// Run a read-only call, trying each provider once
    async fn with_failover<T, F, Fut>(&self, what: &str, call: F) -> RelayerResult<T>
    where
        F: Fn(Provider<Http>) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut last_error = String::new();

        for _ in 0..self.http_providers.len() {
            match call(self.http().clone()).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!("Failed to {} on chain {}: {}", what, self.chain_id, e);
                    last_error = e.to_string();
                    self.failover();
                }
            }
        }

        Err(RelayerError::ChainConnection {
            chain_id: self.chain_id,
            message: format!("All providers failed to {}: {}", what, last_error),
        })
    }

    /// Block with full transaction bodies
    pub async fn get_block_with_txs(&self, number: u64) -> RelayerResult<Option<Block<Transaction>>> {
        self.with_failover("get block with transactions", |p| async move {
            p.get_block_with_txs(number).await
        })
        .await
    }

    pub async fn get_logs(&self, filter: &Filter) -> RelayerResult<Vec<Log>> {
        self.with_failover("get logs", |p| async move { p.get_logs(filter).await })
            .await
    }
}

#[async_trait]
impl ChainAdapter for EvmChainProvider {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn get_transaction(&self, hash: H256) -> RelayerResult<Option<ChainTransaction>> {
        let tx = self
            .with_failover("get transaction", |p| async move { p.get_transaction(hash).await })
            .await?;
        Ok(tx.map(ChainTransaction::from))
    }

    async fn get_transaction_receipt(&self, hash: H256) -> RelayerResult<Option<ChainReceipt>> {
        let receipt = self
            .with_failover("get receipt", |p| async move {
                p.get_transaction_receipt(hash).await
            })
            .await?;
        Ok(receipt.map(ChainReceipt::from))
    }

    async fn get_block_number(&self) -> RelayerResult<u64> {
        self.with_failover("get block number", |p| async move { p.get_block_number().await })
            .await
            .map(|b| b.as_u64())
    }

    async fn get_block_timestamp(&self, block_number: u64) -> RelayerResult<Option<u64>> {
        let block = self
            .with_failover("get block", |p| async move { p.get_block(block_number).await })
            .await?;
        Ok(block.map(|b| b.timestamp.low_u64()))
    }

    async fn get_balance(&self, address: Address) -> RelayerResult<U256> {
        self.with_failover("get balance", |p| async move { p.get_balance(address, None).await })
            .await
    }

    async fn get_token_balance(&self, token: Address, owner: Address) -> RelayerResult<U256> {
        let call: TypedTransaction = TransactionRequest::new()
            .to(token)
            .data(erc20::balance_of_calldata(owner))
            .into();

        let output = self
            .with_failover("call balanceOf", |p| {
                let call = call.clone();
                async move { p.call(&call, None).await }
            })
            .await?;

        erc20::decode_uint(&output).ok_or_else(|| RelayerError::ChainConnection {
            chain_id: self.chain_id,
            message: format!("Malformed balanceOf response from token {:?}", token),
        })
    }

    async fn get_transaction_count(&self, address: Address) -> RelayerResult<u64> {
        let pending = Some(BlockId::Number(BlockNumber::Pending));
        self.with_failover("get transaction count", |p| async move {
            p.get_transaction_count(address, pending).await
        })
        .await
        .map(|n| n.low_u64())
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> RelayerResult<H256> {
        // Active provider only; a rejection is not retried elsewhere
        match self.http().send_raw_transaction(raw).await {
            Ok(pending) => Ok(pending.tx_hash()),
            Err(e) => {
                let message = e.to_string();
                if message.contains("insufficient funds") {
                    Err(RelayerError::InsufficientBalance {
                        chain_id: self.chain_id,
                        have: "unknown".to_string(),
                        need: "unknown".to_string(),
                    })
                } else {
                    Err(RelayerError::Transaction {
                        chain_id: self.chain_id,
                        message,
                    })
                }
            }
        }
    }

    async fn get_gas_price(&self) -> RelayerResult<U256> {
        self.with_failover("get gas price", |p| async move { p.get_gas_price().await })
            .await
    }
}
