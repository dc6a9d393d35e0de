//! Capabilities the pipeline needs from a chain
//!
//! EVM chains are reached through [`ChainAdapter`]; zk-rollups through
//! [`RollupClient`], which signs on the maker's behalf.

use crate::error::RelayerResult;

use async_trait::async_trait;
use ethers::types::{Address, Bytes, Transaction, TransactionReceipt, H256, U256};

/// Transaction as seen by the pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainTransaction {
    pub hash: H256,
    pub from: Address,
    pub to: Option<Address>,
    pub nonce: u64,
    pub value: U256,
    pub input: Bytes,
    /// `None` while the transaction is still in the mempool
    pub block_number: Option<u64>,
}

impl From<Transaction> for ChainTransaction {
    fn from(tx: Transaction) -> Self {
        Self {
            hash: tx.hash,
            from: tx.from,
            to: tx.to,
            nonce: tx.nonce.low_u64(),
            value: tx.value,
            input: tx.input,
            block_number: tx.block_number.map(|b| b.as_u64()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainReceipt {
    pub hash: H256,
    pub block_number: Option<u64>,
    pub success: bool,
}

impl From<TransactionReceipt> for ChainReceipt {
    fn from(receipt: TransactionReceipt) -> Self {
        Self {
            hash: receipt.transaction_hash,
            block_number: receipt.block_number.map(|b| b.as_u64()),
            success: receipt.status.map(|s| s.as_u64() == 1).unwrap_or(false),
        }
    }
}

/// Read and broadcast access to an EVM chain
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainAdapter: Send + Sync {
    fn chain_id(&self) -> u64;

    async fn get_transaction(&self, hash: H256) -> RelayerResult<Option<ChainTransaction>>;

    async fn get_transaction_receipt(&self, hash: H256) -> RelayerResult<Option<ChainReceipt>>;

    async fn get_block_number(&self) -> RelayerResult<u64>;

    /// Unix timestamp of a block, `None` if the node does not know it
    async fn get_block_timestamp(&self, block_number: u64) -> RelayerResult<Option<u64>>;

    async fn get_balance(&self, address: Address) -> RelayerResult<U256>;

    async fn get_token_balance(&self, token: Address, owner: Address) -> RelayerResult<U256>;

    /// Pending-block transaction count, i.e. the next usable nonce
    async fn get_transaction_count(&self, address: Address) -> RelayerResult<u64>;

    async fn send_raw_transaction(&self, raw: Bytes) -> RelayerResult<H256>;

    async fn get_gas_price(&self) -> RelayerResult<U256>;
}

/// Transfer on a zk-rollup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollupTransfer {
    pub from: Address,
    pub to: Address,
    pub token: Address,
    pub amount: U256,
    pub nonce: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RollupReceipt {
    pub executed: bool,
    pub success: bool,
    pub fail_reason: Option<String>,
}

impl RollupReceipt {
    pub fn is_confirmed(&self) -> bool {
        self.executed
            && self.success
            && self.fail_reason.as_deref().map_or(true, str::is_empty)
    }
}

/// zk-rollup operator client; holds the makers' signers
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RollupClient: Send + Sync {
    fn chain_id(&self) -> u64;

    /// Rollup account id, `None` if the address never deposited
    async fn account_id(&self, address: Address) -> RelayerResult<Option<u64>>;

    async fn is_signing_key_set(&self, address: Address) -> RelayerResult<bool>;

    /// Submit a change-pubkey operation; returns its hash
    async fn set_signing_key(&self, address: Address) -> RelayerResult<String>;

    async fn committed_nonce(&self, address: Address) -> RelayerResult<u64>;

    /// Returns the rollup transaction hash
    async fn transfer(&self, transfer: RollupTransfer) -> RelayerResult<String>;

    async fn tx_receipt(&self, hash: &str) -> RelayerResult<Option<RollupReceipt>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rollup_receipt_predicate() {
        let mut receipt = RollupReceipt {
            executed: true,
            success: true,
            fail_reason: None,
        };
        assert!(receipt.is_confirmed());

        receipt.fail_reason = Some(String::new());
        assert!(receipt.is_confirmed());

        receipt.fail_reason = Some("nonce mismatch".to_string());
        assert!(!receipt.is_confirmed());

        assert!(!RollupReceipt::default().is_confirmed());
    }
}
