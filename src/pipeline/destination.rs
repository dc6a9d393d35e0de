//! Destination-side confirmation tracking

use crate::chain::{confirmation_status, ChainAdapter, ChainBackend, ChainRegistry, RollupClient};
use crate::error::{RelayerError, RelayerResult};
use crate::retry::{PollStatus, Poller};
use crate::state::{SettlementLedger, StateUpdate, TransactionIdentity};

use ethers::types::H256;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Follows a sent payout until it is final and records the confirmation
pub struct DestinationConfirmationTracker {
    registry: Arc<ChainRegistry>,
    ledger: Arc<dyn SettlementLedger>,
    poller: Poller,
    default_confirmations: u64,
}

impl DestinationConfirmationTracker {
    pub fn new(
        registry: Arc<ChainRegistry>,
        ledger: Arc<dyn SettlementLedger>,
        poller: Poller,
        default_confirmations: u64,
    ) -> Self {
        Self {
            registry,
            ledger,
            poller,
            default_confirmations,
        }
    }

    /// Wait for `tx_hash` on `chain_id` and move `identity` to DestConfirmed.
    ///
    /// Returns whether this call made the transition.
    pub async fn track(
        &self,
        identity: &TransactionIdentity,
        chain_id: u64,
        tx_hash: &str,
    ) -> RelayerResult<bool> {
        let entry = self.registry.get(chain_id)?;
        let dest_timestamp = match &entry.backend {
            ChainBackend::Evm(adapter) => {
                let required = entry
                    .profile
                    .required_confirmations(self.default_confirmations);
                self.wait_evm(adapter.as_ref(), tx_hash, required).await?
            }
            ChainBackend::Rollup(client) => self.wait_rollup(client.as_ref(), tx_hash).await?,
        };

        let applied = self
            .ledger
            .update_state(identity, StateUpdate::DestConfirmed { dest_timestamp })
            .await?;
        if applied {
            info!("Payout {} for {} confirmed on chain {}", tx_hash, identity, chain_id);
            crate::metrics::record_tx_confirmed(chain_id);
        } else {
            debug!("{} was not awaiting confirmation", identity);
        }
        Ok(applied)
    }

    /// Block timestamp of the payout once it has enough confirmations
    async fn wait_evm(
        &self,
        adapter: &dyn ChainAdapter,
        tx_hash: &str,
        required: u64,
    ) -> RelayerResult<u64> {
        let chain_id = adapter.chain_id();
        let hash = H256::from_str(tx_hash)
            .map_err(|e| RelayerError::Internal(format!("bad tx hash {}: {}", tx_hash, e)))?;
        let label = format!("payout {:?} on chain {}", hash, chain_id);

        let status = self
            .poller
            .poll_until(&label, || async move {
                Ok(match confirmation_status(adapter, hash).await? {
                    Some(status) if status.is_final(required) => PollStatus::Ready(status),
                    _ => PollStatus::Pending,
                })
            })
            .await?;

        let block = status.tx.block_number.unwrap_or_default();
        let timestamp = match adapter.get_block_timestamp(block).await {
            Ok(Some(timestamp)) => Some(timestamp),
            Ok(None) => None,
            Err(e) => {
                warn!("No timestamp for block {} on chain {}: {}", block, chain_id, e);
                None
            }
        };
        Ok(timestamp.unwrap_or_else(observed_now))
    }

    /// Rollup receipts carry no block time; the observation time stands in
    async fn wait_rollup(&self, client: &dyn RollupClient, tx_hash: &str) -> RelayerResult<u64> {
        let label = format!("rollup payout {} on chain {}", tx_hash, client.chain_id());

        self.poller
            .poll_until(&label, || async move {
                Ok(match client.tx_receipt(tx_hash).await? {
                    Some(receipt) if receipt.is_confirmed() => PollStatus::Ready(()),
                    _ => PollStatus::Pending,
                })
            })
            .await?;

        Ok(observed_now())
    }
}

fn observed_now() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp()).unwrap_or_default()
}
