//! Source-side confirmation tracking
//!
//! An intent leaves the tracker either confirmed, with the sender's nonce and
//! the ledger record moved to SourceConfirmed by this tracker, or not at all.
//! Only the tracker that wins the Observed -> SourceConfirmed transition hands
//! the intent on, so at-least-once delivery of the same transfer settles it
//! once.

use super::intent::SettlementIntent;
use crate::chain::{
    confirmation_status, erc20, ChainAdapter, ChainBackend, ChainRegistry, ChainTransaction,
    RollupClient,
};
use crate::error::{RelayerError, RelayerResult};
use crate::retry::{PollStatus, Poller};
use crate::state::{
    InsertOutcome, LedgerRecord, SettlementLedger, SettlementState, StateUpdate,
    TransactionIdentity,
};

use ethers::types::{H256, U256};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of tracking one source transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceOutcome {
    /// Confirmed by this tracker; the intent now carries the source nonce
    Confirmed(SettlementIntent),
    /// Another tracker, or an earlier run, owns this settlement
    AlreadyTracked(TransactionIdentity),
    /// The chain reports a different transfer than the one observed
    Mismatch,
}

/// Build the ledger record for a confirmed-nonce intent
pub(crate) fn ledger_record(
    intent: &SettlementIntent,
    identity: TransactionIdentity,
    source_nonce: u64,
    state: SettlementState,
) -> LedgerRecord {
    LedgerRecord {
        identity,
        maker_address: intent.maker_address,
        user_address: intent.user_address,
        source_chain_id: intent.source_chain_id,
        dest_chain_id: intent.dest_chain_id,
        source_tx_hash: intent.source_tx_hash.clone(),
        source_timestamp: intent.source_timestamp,
        source_amount: intent.source_amount.clone(),
        source_nonce,
        token_address: intent.token_address,
        dest_tx_hash: None,
        dest_amount: None,
        dest_timestamp: None,
        state,
    }
}

pub struct SourceConfirmationTracker {
    registry: Arc<ChainRegistry>,
    ledger: Arc<dyn SettlementLedger>,
    poller: Poller,
    default_confirmations: u64,
}

impl SourceConfirmationTracker {
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

    /// Wait for `intent`'s source transfer to be final and claim it
    pub async fn track(&self, intent: SettlementIntent) -> RelayerResult<SourceOutcome> {
        let entry = self.registry.get(intent.source_chain_id)?;
        match &entry.backend {
            ChainBackend::Evm(adapter) => {
                let required = entry
                    .profile
                    .required_confirmations(self.default_confirmations);
                self.track_evm(adapter.as_ref(), intent, required).await
            }
            ChainBackend::Rollup(client) => self.track_rollup(client.as_ref(), intent).await,
        }
    }

    async fn track_evm(
        &self,
        adapter: &dyn ChainAdapter,
        intent: SettlementIntent,
        required: u64,
    ) -> RelayerResult<SourceOutcome> {
        let chain_id = intent.source_chain_id;
        let hash = H256::from_str(&intent.source_tx_hash).map_err(|e| {
            RelayerError::Internal(format!("bad tx hash {}: {}", intent.source_tx_hash, e))
        })?;
        let label = format!("source tx {:?} on chain {}", hash, chain_id);

        let found = self
            .poller
            .poll_until(&label, || async move {
                Ok(match confirmation_status(adapter, hash).await? {
                    Some(status) => PollStatus::Ready(status),
                    None => PollStatus::Pending,
                })
            })
            .await?;

        let tx = &found.tx;
        if !transfer_matches(&intent, tx) {
            warn!(
                "Source tx {:?} on chain {} does not carry amount {} to {:?}",
                hash, chain_id, intent.source_amount, intent.maker_address
            );
            return Ok(SourceOutcome::Mismatch);
        }

        let identity = TransactionIdentity::new(tx.from, chain_id, tx.nonce);
        let timestamp = match tx.block_number {
            Some(block) => adapter.get_block_timestamp(block).await.unwrap_or_else(|e| {
                warn!("No timestamp for block {} on chain {}: {}", block, chain_id, e);
                None
            }),
            None => None,
        };
        let confirmed = intent.confirmed(tx.from, tx.nonce, timestamp);

        match self.ledger.find_by_identity(&identity).await? {
            Some(record) if record.state != SettlementState::Observed => {
                debug!("{} already in state {:?}", identity, record.state);
                return Ok(SourceOutcome::AlreadyTracked(identity));
            }
            Some(_) => {}
            None => {
                let record = ledger_record(
                    &confirmed,
                    identity.clone(),
                    tx.nonce,
                    SettlementState::Observed,
                );
                if self.ledger.insert_pending(record).await? == InsertOutcome::Inserted {
                    info!("Tracking {} from source tx {:?}", identity, hash);
                }
            }
        }

        if !found.is_final(required) {
            let label = label.as_str();
            self.poller
                .poll_until(label, || async move {
                    Ok(match confirmation_status(adapter, hash).await? {
                        Some(status) if status.is_final(required) => PollStatus::Ready(()),
                        Some(status) => {
                            debug!(
                                "{}: {} of {} confirmations",
                                label, status.confirmations, required
                            );
                            PollStatus::Pending
                        }
                        None => PollStatus::Pending,
                    })
                })
                .await?;
        }

        if !self
            .ledger
            .update_state(&identity, StateUpdate::SourceConfirmed)
            .await?
        {
            debug!("{} was confirmed by another tracker", identity);
            return Ok(SourceOutcome::AlreadyTracked(identity));
        }

        info!("Source tx {:?} confirmed for {}", hash, identity);
        crate::metrics::record_source_confirmed(chain_id);
        Ok(SourceOutcome::Confirmed(confirmed))
    }

    async fn track_rollup(
        &self,
        client: &dyn RollupClient,
        intent: SettlementIntent,
    ) -> RelayerResult<SourceOutcome> {
        let chain_id = intent.source_chain_id;
        let nonce = intent.source_nonce.ok_or_else(|| RelayerError::Rollup {
            chain_id,
            message: format!("transfer {} without sender nonce", intent.source_tx_hash),
        })?;
        let identity = TransactionIdentity::new(intent.user_address, chain_id, nonce);

        let label = format!("rollup tx {} on chain {}", intent.source_tx_hash, chain_id);
        let hash = intent.source_tx_hash.as_str();
        self.poller
            .poll_until(&label, || async move {
                Ok(match client.tx_receipt(hash).await? {
                    Some(receipt) if receipt.is_confirmed() => PollStatus::Ready(()),
                    _ => PollStatus::Pending,
                })
            })
            .await?;

        let timestamp = intent
            .source_timestamp
            .or_else(|| u64::try_from(chrono::Utc::now().timestamp()).ok());
        let confirmed = intent.confirmed(intent.user_address, nonce, timestamp);
        let record = ledger_record(
            &confirmed,
            identity.clone(),
            nonce,
            SettlementState::SourceConfirmed,
        );

        match self.ledger.insert_pending(record).await? {
            InsertOutcome::Inserted => {
                info!("Rollup tx {} confirmed for {}", intent.source_tx_hash, identity);
                crate::metrics::record_source_confirmed(chain_id);
                Ok(SourceOutcome::Confirmed(confirmed))
            }
            InsertOutcome::AlreadyExists => Ok(SourceOutcome::AlreadyTracked(identity)),
        }
    }
}

/// The mined transaction moves the observed amount to the maker
fn transfer_matches(intent: &SettlementIntent, tx: &ChainTransaction) -> bool {
    let Ok(expected) = U256::from_dec_str(&intent.source_amount) else {
        return false;
    };

    if intent.token_address.is_zero() {
        tx.to == Some(intent.maker_address) && tx.value == expected
    } else {
        tx.to == Some(intent.token_address)
            && erc20::decode_transfer(&tx.input) == Some((intent.maker_address, expected))
    }
}

#[cfg(test)]
mod tests {
    use super::super::intent::fixtures::*;
    use super::*;
    use crate::chain::{ChainProfile, MockChainAdapter, MockRollupClient, RollupReceipt};
    use crate::codec::AmountCodec;
    use crate::pipeline::TransferValidator;
    use crate::retry::testing::instant_poller;
    use crate::state::InMemoryLedger;
    use ethers::types::Bytes;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn intent() -> SettlementIntent {
        TransferValidator::new(AmountCodec::new())
            .validate(&event("1230009077", 1), &rule())
            .unwrap()
    }

    fn mined_tx(value: u64) -> ChainTransaction {
        ChainTransaction {
            hash: H256::repeat_byte(1),
            from: user(),
            to: Some(maker()),
            nonce: 7,
            value: U256::from(value),
            input: Bytes::default(),
            block_number: Some(100),
        }
    }

    /// Head advances by one block per lookup, starting at `head`
    fn advancing_chain(value: u64, head: u64) -> MockChainAdapter {
        let head = Arc::new(AtomicU64::new(head));
        let mut adapter = MockChainAdapter::new();
        adapter.expect_chain_id().return_const(5u64);
        adapter
            .expect_get_transaction()
            .returning(move |_| Ok(Some(mined_tx(value))));
        adapter
            .expect_get_block_number()
            .returning(move || Ok(head.fetch_add(1, Ordering::SeqCst)));
        adapter
            .expect_get_block_timestamp()
            .returning(|_| Ok(Some(1_700_000_000)));
        adapter
    }

    fn tracker(backend: ChainBackend, ledger: Arc<InMemoryLedger>) -> SourceConfirmationTracker {
        let registry = ChainRegistry::new();
        let profile = match backend {
            ChainBackend::Evm(_) => ChainProfile::evm(5, "source"),
            ChainBackend::Rollup(_) => ChainProfile::rollup(5, "source"),
        };
        registry.register(profile, backend);
        SourceConfirmationTracker::new(Arc::new(registry), ledger, instant_poller(), 3)
    }

    #[tokio::test]
    async fn confirms_after_required_depth() {
        let ledger = Arc::new(InMemoryLedger::new());
        let tracker = tracker(
            ChainBackend::Evm(Arc::new(advancing_chain(1_230_009_077, 100))),
            ledger.clone(),
        );

        let confirmed = match tracker.track(intent()).await.unwrap() {
            SourceOutcome::Confirmed(confirmed) => confirmed,
            other => panic!("expected confirmation, got {:?}", other),
        };
        assert_eq!(confirmed.source_nonce, Some(7));
        assert_eq!(confirmed.source_timestamp, Some(1_700_000_000));

        let identity = TransactionIdentity::new(user(), 5, 7);
        let record = ledger.find_by_identity(&identity).await.unwrap().unwrap();
        assert_eq!(record.state, SettlementState::SourceConfirmed);
        assert_eq!(record.source_amount, "1230009077");
    }

    #[tokio::test]
    async fn second_tracker_for_same_transfer_is_a_no_op() {
        let ledger = Arc::new(InMemoryLedger::new());
        let tracker = tracker(
            ChainBackend::Evm(Arc::new(advancing_chain(1_230_009_077, 200))),
            ledger.clone(),
        );

        assert!(matches!(
            tracker.track(intent()).await.unwrap(),
            SourceOutcome::Confirmed(_)
        ));
        assert_eq!(
            tracker.track(intent()).await.unwrap(),
            SourceOutcome::AlreadyTracked(TransactionIdentity::new(user(), 5, 7))
        );
        assert_eq!(ledger.record_count(), 1);
    }

    #[tokio::test]
    async fn different_on_chain_amount_is_not_settled() {
        let ledger = Arc::new(InMemoryLedger::new());
        let tracker = tracker(
            ChainBackend::Evm(Arc::new(advancing_chain(1_000, 200))),
            ledger.clone(),
        );

        assert_eq!(tracker.track(intent()).await.unwrap(), SourceOutcome::Mismatch);
        assert_eq!(ledger.record_count(), 0);
    }

    #[tokio::test]
    async fn rollup_source_is_recorded_confirmed() {
        let mut client = MockRollupClient::new();
        client.expect_chain_id().return_const(5u64);
        let polls = Arc::new(AtomicU64::new(0));
        client.expect_tx_receipt().returning(move |_| {
            let executed = polls.fetch_add(1, Ordering::SeqCst) > 0;
            Ok(Some(RollupReceipt {
                executed,
                success: executed,
                fail_reason: None,
            }))
        });

        let ledger = Arc::new(InMemoryLedger::new());
        let tracker = tracker(ChainBackend::Rollup(Arc::new(client)), ledger.clone());

        let mut observed = intent();
        observed.source_tx_hash = "sync-tx:abc".to_string();
        observed.source_nonce = Some(12);

        assert!(matches!(
            tracker.track(observed.clone()).await.unwrap(),
            SourceOutcome::Confirmed(_)
        ));
        let identity = TransactionIdentity::new(user(), 5, 12);
        let record = ledger.find_by_identity(&identity).await.unwrap().unwrap();
        assert_eq!(record.state, SettlementState::SourceConfirmed);

        assert_eq!(
            tracker.track(observed).await.unwrap(),
            SourceOutcome::AlreadyTracked(identity)
        );
    }

    #[test]
    fn token_transfers_are_read_from_calldata() {
        let mut observed = intent();
        observed.token_address = ethers::types::Address::repeat_byte(0x33);

        let mut tx = mined_tx(0);
        tx.to = Some(observed.token_address);
        tx.input = erc20::transfer_calldata(maker(), U256::from(1_230_009_077u64));
        assert!(transfer_matches(&observed, &tx));

        tx.input = erc20::transfer_calldata(user(), U256::from(1_230_009_077u64));
        assert!(!transfer_matches(&observed, &tx));
    }
}
