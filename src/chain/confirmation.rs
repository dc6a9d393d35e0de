//! Confirmation depth of EVM transactions

use super::adapter::{ChainAdapter, ChainTransaction};
use crate::error::RelayerResult;

use ethers::types::H256;
use tracing::debug;

/// A transaction together with how deep it is buried
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmationStatus {
    pub tx: ChainTransaction,
    /// `current block - inclusion block`, 0 while unmined
    pub confirmations: u64,
}

impl ConfirmationStatus {
    pub fn is_final(&self, required: u64) -> bool {
        self.tx.block_number.is_some() && self.confirmations >= required
    }
}

/// Look up `hash` and its confirmation depth; `None` if the node does not
/// know the transaction
pub async fn confirmation_status(
    adapter: &dyn ChainAdapter,
    hash: H256,
) -> RelayerResult<Option<ConfirmationStatus>> {
    let tx = match adapter.get_transaction(hash).await? {
        Some(tx) => tx,
        None => return Ok(None),
    };

    let confirmations = match tx.block_number {
        Some(block_number) => {
            let current = adapter.get_block_number().await?;
            current.saturating_sub(block_number)
        }
        None => 0,
    };

    debug!(
        "Transaction {:?} on chain {}: {} confirmations",
        hash,
        adapter.chain_id(),
        confirmations
    );

    Ok(Some(ConfirmationStatus { tx, confirmations }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MockChainAdapter;
    use ethers::types::{Address, Bytes, U256};

    fn tx(block_number: Option<u64>) -> ChainTransaction {
        ChainTransaction {
            hash: H256::repeat_byte(1),
            from: Address::repeat_byte(2),
            to: Some(Address::repeat_byte(3)),
            nonce: 4,
            value: U256::from(1_000u64),
            input: Bytes::default(),
            block_number,
        }
    }

    fn adapter(block_number: Option<u64>, head: u64) -> MockChainAdapter {
        let mut adapter = MockChainAdapter::new();
        adapter.expect_chain_id().return_const(5u64);
        adapter
            .expect_get_transaction()
            .returning(move |_| Ok(Some(tx(block_number))));
        adapter.expect_get_block_number().returning(move || Ok(head));
        adapter
    }

    #[tokio::test]
    async fn depth_is_distance_from_head() {
        let status = confirmation_status(&adapter(Some(100), 103), H256::repeat_byte(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.confirmations, 3);
        assert!(status.is_final(3));
        assert!(!status.is_final(4));
    }

    #[tokio::test]
    async fn unmined_has_no_depth() {
        let status = confirmation_status(&adapter(None, 103), H256::repeat_byte(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.confirmations, 0);
        assert!(!status.is_final(0));
    }

    #[tokio::test]
    async fn unknown_transaction_is_none() {
        let mut adapter = MockChainAdapter::new();
        adapter.expect_get_transaction().returning(|_| Ok(None));
        assert!(confirmation_status(&adapter, H256::zero())
            .await
            .unwrap()
            .is_none());
    }
}
