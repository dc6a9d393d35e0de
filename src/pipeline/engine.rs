//! The match-confirm-settle pipeline
//!
//! Every matched transfer gets its own task: source confirmation, payout
//! through the destination chain's send queue, then destination
//! confirmation. Failed payouts are parked in the retry ledger and re-driven
//! on request or by the periodic sweep.

use super::destination::DestinationConfirmationTracker;
use super::intent::{SettlementIntent, TransferEvent};
use super::source::{SourceConfirmationTracker, SourceOutcome};
use super::validator::TransferValidator;
use crate::chain::ChainRegistry;
use crate::codec::AmountCodec;
use crate::error::{RelayerError, RelayerResult};
use crate::pool::PoolRule;
use crate::retry::Poller;
use crate::state::{
    RetryLedger, RetryState, SettlementLedger, SettlementState, StateUpdate, TransactionIdentity,
};
use crate::tx::{SendBackend, SendQueues, SendRequest};

use dashmap::DashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// How long an accepted transfer hash is remembered by the validator
const SEEN_TRANSFER_TTL: Duration = Duration::from_secs(60 * 60);

/// Pipeline tunables taken from `[relayer]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineSettings {
    pub source_confirmations: u64,
    pub destination_confirmations: u64,
    /// Stop re-driving a payout after this many failed attempts
    pub max_send_attempts: Option<u32>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            source_confirmations: 3,
            destination_confirmations: 3,
            max_send_attempts: None,
        }
    }
}

/// What one settle call did
#[derive(Debug)]
pub enum SettleOutcome {
    /// Payout broadcast; the handle tracks destination confirmation
    Submitted {
        tx_hash: String,
        tracking: JoinHandle<()>,
    },
    /// Payout failed and was recorded for a retry
    Failed { attempts: u32 },
    /// Already paid out, nothing sent
    AlreadySettled,
    /// Source not confirmed yet, or the record is missing
    NotReady,
    /// Another task is settling this identity
    InFlight,
}

/// What a retry drive request did
#[derive(Debug)]
pub enum RetryDriveOutcome {
    NotFound,
    AlreadyResolved,
    CapReached { attempts: u32 },
    InFlight,
    AlreadySettled,
    Dispatched(JoinHandle<()>),
}

/// Removes the identity from the in-flight set when dropped
struct InFlightGuard<'a> {
    set: &'a DashSet<TransactionIdentity>,
    identity: TransactionIdentity,
}

impl<'a> InFlightGuard<'a> {
    fn acquire(set: &'a DashSet<TransactionIdentity>, identity: &TransactionIdentity) -> Option<Self> {
        set.insert(identity.clone()).then(|| Self {
            set,
            identity: identity.clone(),
        })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set.remove(&self.identity);
    }
}

pub struct SettlementPipeline {
    validator: TransferValidator,
    source: SourceConfirmationTracker,
    destination: Arc<DestinationConfirmationTracker>,
    queues: SendQueues,
    ledger: Arc<dyn SettlementLedger>,
    retries: Arc<dyn RetryLedger>,
    in_flight: DashSet<TransactionIdentity>,
    settings: PipelineSettings,
}

impl SettlementPipeline {
    pub fn new(
        registry: Arc<ChainRegistry>,
        ledger: Arc<dyn SettlementLedger>,
        retries: Arc<dyn RetryLedger>,
        backend: Arc<dyn SendBackend>,
        poller: Poller,
        settings: PipelineSettings,
    ) -> Self {
        let validator = TransferValidator::new(registry.codec());
        let source = SourceConfirmationTracker::new(
            registry.clone(),
            ledger.clone(),
            poller.clone(),
            settings.source_confirmations,
        );
        let destination = Arc::new(DestinationConfirmationTracker::new(
            registry,
            ledger.clone(),
            poller.clone(),
            settings.destination_confirmations,
        ));

        Self {
            validator,
            source,
            destination,
            queues: SendQueues::new(backend, poller),
            ledger,
            retries,
            in_flight: DashSet::new(),
            settings,
        }
    }

    /// Codec the validator decodes source amounts with
    pub fn codec(&self) -> &AmountCodec {
        self.validator.codec()
    }

    /// Entry point for transfer sources.
    ///
    /// Returns the handle of the settlement task, or `None` if the transfer
    /// was rejected.
    pub fn submit_observed_transfer(
        self: &Arc<Self>,
        event: TransferEvent,
        rule: &PoolRule,
    ) -> Option<JoinHandle<()>> {
        let intent = self.validator.validate(&event, rule).ok()?;
        let this = self.clone();
        Some(tokio::spawn(async move { this.observe(intent).await }))
    }

    async fn observe(self: Arc<Self>, intent: SettlementIntent) {
        let source_tx = intent.source_tx_hash.clone();
        match self.source.track(intent).await {
            Ok(SourceOutcome::Confirmed(confirmed)) => self.settle_logged(confirmed, None).await,
            Ok(SourceOutcome::AlreadyTracked(identity)) => {
                debug!("Source tx {} already tracked as {}", source_tx, identity);
            }
            Ok(SourceOutcome::Mismatch) => {
                warn!("Source tx {} dropped after chain lookup", source_tx);
            }
            Err(e) => error!("Source tracking of {} failed: {}", source_tx, e),
        }
    }

    async fn settle_logged(self: &Arc<Self>, intent: SettlementIntent, reuse_nonce: Option<u64>) {
        let source_tx = intent.source_tx_hash.clone();
        match self.settle(intent, reuse_nonce).await {
            Ok(SettleOutcome::Submitted { tx_hash, .. }) => {
                debug!("Source tx {} paid out in {}", source_tx, tx_hash);
            }
            Ok(other) => debug!("Settlement of {}: {:?}", source_tx, other),
            Err(e) => error!("Settlement of {} failed: {}", source_tx, e),
        }
    }

    /// Pay out a source-confirmed intent through its destination queue
    pub async fn settle(
        self: &Arc<Self>,
        intent: SettlementIntent,
        reuse_nonce: Option<u64>,
    ) -> RelayerResult<SettleOutcome> {
        let identity = intent.identity().ok_or_else(|| {
            RelayerError::Internal(format!("intent {} has no source nonce", intent.source_tx_hash))
        })?;
        let Some(_guard) = InFlightGuard::acquire(&self.in_flight, &identity) else {
            return Ok(SettleOutcome::InFlight);
        };

        match self.ledger.find_by_identity(&identity).await? {
            Some(record) if record.state.is_settled() => {
                self.retries.mark_resolved(&identity).await?;
                return Ok(SettleOutcome::AlreadySettled);
            }
            Some(record)
                if matches!(
                    record.state,
                    SettlementState::SourceConfirmed | SettlementState::SendFailed
                ) => {}
            Some(record) => {
                debug!("{} is {:?}, not ready to pay out", identity, record.state);
                return Ok(SettleOutcome::NotReady);
            }
            None => {
                warn!("{} has no ledger record", identity);
                return Ok(SettleOutcome::NotReady);
            }
        }

        let amount = intent.payout_amount(self.validator.codec())?;
        let request = SendRequest {
            identity: identity.clone(),
            chain_id: intent.dest_chain_id,
            maker: intent.maker_address,
            recipient: intent.user_address,
            token: intent.dest_token_address,
            amount,
        };

        let queue = self.queues.queue(intent.dest_chain_id);
        match queue.send(request, reuse_nonce).await {
            Ok(sent) => {
                let submitted = StateUpdate::DestSubmitted {
                    dest_tx_hash: sent.tx_hash.clone(),
                    dest_amount: sent.amount.to_string(),
                };
                if !self.ledger.update_state(&identity, submitted).await? {
                    warn!("{} changed state while its payout was sent", identity);
                }
                self.retries.mark_resolved(&identity).await?;

                let tracking = self.track_destination(identity, intent.dest_chain_id, &sent.tx_hash);
                Ok(SettleOutcome::Submitted {
                    tx_hash: sent.tx_hash,
                    tracking,
                })
            }
            Err(failure) => {
                error!("Payout for {} failed: {}", identity, failure.error);
                if failure.error.should_alert() {
                    crate::metrics::record_send_alert(intent.dest_chain_id);
                }
                self.ledger
                    .update_state(&identity, StateUpdate::SendFailed)
                    .await?;

                let serialized = serde_json::to_string(&intent)?;
                let record = self
                    .retries
                    .record_failure(
                        &identity,
                        intent.maker_address,
                        &serialized,
                        failure.reusable_nonce,
                    )
                    .await?;
                info!(
                    "{} parked for retry (attempt {}, nonce {:?})",
                    identity, record.attempt_count, record.reusable_nonce
                );
                Ok(SettleOutcome::Failed {
                    attempts: record.attempt_count,
                })
            }
        }
    }

    fn track_destination(
        &self,
        identity: TransactionIdentity,
        chain_id: u64,
        tx_hash: &str,
    ) -> JoinHandle<()> {
        let tracker = self.destination.clone();
        let tx_hash = tx_hash.to_string();
        tokio::spawn(async move {
            if let Err(e) = tracker.track(&identity, chain_id, &tx_hash).await {
                error!("Destination tracking of {} failed: {}", identity, e);
            }
        })
    }

    /// Re-dispatch a failed payout, reusing the nonce it may have left behind
    pub async fn request_retry_drive(
        self: &Arc<Self>,
        identity: &TransactionIdentity,
    ) -> RelayerResult<RetryDriveOutcome> {
        let outcome = self.retry_drive(identity).await?;
        crate::metrics::record_retry_drive(match &outcome {
            RetryDriveOutcome::NotFound => "not_found",
            RetryDriveOutcome::AlreadyResolved => "already_resolved",
            RetryDriveOutcome::CapReached { .. } => "cap_reached",
            RetryDriveOutcome::InFlight => "in_flight",
            RetryDriveOutcome::AlreadySettled => "already_settled",
            RetryDriveOutcome::Dispatched(_) => "dispatched",
        });
        Ok(outcome)
    }

    async fn retry_drive(
        self: &Arc<Self>,
        identity: &TransactionIdentity,
    ) -> RelayerResult<RetryDriveOutcome> {
        let Some(record) = self.retries.find_retry(identity).await? else {
            return Ok(RetryDriveOutcome::NotFound);
        };
        if record.state == RetryState::Resolved {
            return Ok(RetryDriveOutcome::AlreadyResolved);
        }
        if let Some(max) = self.settings.max_send_attempts {
            if record.attempt_count >= max {
                error!(
                    "{} failed {} times, not retrying; needs manual settlement",
                    identity, record.attempt_count
                );
                return Ok(RetryDriveOutcome::CapReached {
                    attempts: record.attempt_count,
                });
            }
        }
        if self.in_flight.contains(identity) {
            return Ok(RetryDriveOutcome::InFlight);
        }

        if let Some(ledger_record) = self.ledger.find_by_identity(identity).await? {
            if ledger_record.state.is_settled() {
                self.retries.mark_resolved(identity).await?;
                return Ok(RetryDriveOutcome::AlreadySettled);
            }
        }

        let intent: SettlementIntent = serde_json::from_str(&record.serialized_intent)?;
        info!(
            "Re-driving {} (attempt {}, nonce {:?})",
            identity,
            record.attempt_count + 1,
            record.reusable_nonce
        );

        let this = self.clone();
        let reuse_nonce = record.reusable_nonce;
        Ok(RetryDriveOutcome::Dispatched(tokio::spawn(async move {
            this.settle_logged(intent, reuse_nonce).await
        })))
    }

    /// Re-drive every pending retry record and wait for the dispatched
    /// attempts. Returns how many were dispatched.
    pub async fn redrive_pending(self: &Arc<Self>) -> RelayerResult<usize> {
        let pending = self.retries.pending_retries().await?;
        let mut dispatched = Vec::new();

        for record in pending {
            match self.request_retry_drive(&record.identity).await {
                Ok(RetryDriveOutcome::Dispatched(handle)) => dispatched.push(handle),
                Ok(_) => {}
                Err(e) => error!("Retry drive of {} failed: {}", record.identity, e),
            }
        }

        let count = dispatched.len();
        for result in futures::future::join_all(dispatched).await {
            if let Err(e) = result {
                error!("Retry task panicked: {}", e);
            }
        }
        Ok(count)
    }

    /// Periodic re-drive; a sweep starts only after the previous one finished
    pub async fn run_retry_sweep(self: Arc<Self>, every: Duration) {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Retry sweep running every {:?}", every);

        loop {
            ticker.tick().await;
            let pruned = self.validator.prune_seen(SEEN_TRANSFER_TTL);
            if pruned > 0 {
                debug!("Forgot {} settled transfer hashes", pruned);
            }
            match self.redrive_pending().await {
                Ok(0) => {}
                Ok(n) => info!("Retry sweep re-drove {} payouts", n),
                Err(e) => error!("Retry sweep failed: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::intent::fixtures::*;
    use super::*;
    use crate::chain::{ChainBackend, ChainProfile, ChainTransaction, MockChainAdapter};
    use crate::retry::testing::instant_poller;
    use crate::state::InMemoryLedger;
    use crate::tx::{SendFailure, SendOutcome, SentTransfer};
    use async_trait::async_trait;
    use ethers::types::{Address, Bytes, H256, U256};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// Backend that records payouts; can be told to fail them
    struct RecordingBackend {
        live: u64,
        sent: Mutex<Vec<(SendRequest, u64)>>,
        fail_at_broadcast: AtomicBool,
        fail_before_broadcast: AtomicBool,
    }

    impl RecordingBackend {
        fn new(live: u64) -> Arc<Self> {
            Arc::new(Self {
                live,
                sent: Mutex::new(Vec::new()),
                fail_at_broadcast: AtomicBool::new(false),
                fail_before_broadcast: AtomicBool::new(false),
            })
        }

        fn nonces(&self) -> Vec<u64> {
            self.sent.lock().unwrap().iter().map(|(_, n)| *n).collect()
        }
    }

    #[async_trait]
    impl SendBackend for RecordingBackend {
        async fn live_nonce(&self, _chain_id: u64, _maker: Address) -> RelayerResult<u64> {
            Ok(self.live)
        }

        async fn send(&self, request: &SendRequest, nonce: u64) -> SendOutcome {
            if self.fail_before_broadcast.load(Ordering::SeqCst) {
                return Err(SendFailure::before_broadcast(RelayerError::InsufficientBalance {
                    chain_id: request.chain_id,
                    have: "0".to_string(),
                    need: request.amount.to_string(),
                }));
            }
            if self.fail_at_broadcast.load(Ordering::SeqCst) {
                return Err(SendFailure::at_broadcast(
                    RelayerError::Transaction {
                        chain_id: request.chain_id,
                        message: "timeout".to_string(),
                    },
                    nonce,
                ));
            }
            self.sent.lock().unwrap().push((request.clone(), nonce));
            Ok(SentTransfer {
                tx_hash: format!("{:?}", H256::from_low_u64_be(1000 + nonce)),
                amount: request.amount,
                nonce,
            })
        }
    }

    /// Source chain 5 and destination chain 77 on one mock; every
    /// transaction is mined at block 100 and the head is far ahead.
    fn chains(transfers: HashMap<H256, (Address, u64, u64)>) -> Arc<ChainRegistry> {
        let transfers = Arc::new(transfers);
        let registry = ChainRegistry::new();

        for chain_id in [5u64, 77] {
            let transfers = transfers.clone();
            let mut adapter = MockChainAdapter::new();
            adapter.expect_chain_id().return_const(chain_id);
            adapter.expect_get_transaction().returning(move |hash| {
                let (from, nonce, value) = transfers
                    .get(&hash)
                    .copied()
                    .unwrap_or((Address::repeat_byte(0x11), 0, 0));
                Ok(Some(ChainTransaction {
                    hash,
                    from,
                    to: Some(maker()),
                    nonce,
                    value: U256::from(value),
                    input: Bytes::default(),
                    block_number: Some(100),
                }))
            });
            adapter.expect_get_block_number().returning(|| Ok(200));
            adapter
                .expect_get_block_timestamp()
                .returning(|_| Ok(Some(1_700_000_000)));
            registry.register(
                ChainProfile::evm(chain_id, "test"),
                ChainBackend::Evm(Arc::new(adapter)),
            );
        }
        Arc::new(registry)
    }

    fn pipeline(
        registry: Arc<ChainRegistry>,
        ledger: Arc<InMemoryLedger>,
        backend: Arc<RecordingBackend>,
        settings: PipelineSettings,
    ) -> Arc<SettlementPipeline> {
        Arc::new(SettlementPipeline::new(
            registry,
            ledger.clone(),
            ledger,
            backend,
            instant_poller(),
            settings,
        ))
    }

    fn source_hash(n: u8) -> H256 {
        H256::repeat_byte(n)
    }

    async fn settled_state(ledger: &InMemoryLedger, nonce: u64) -> SettlementState {
        ledger
            .find_by_identity(&TransactionIdentity::new(user(), 5, nonce))
            .await
            .unwrap()
            .unwrap()
            .state
    }

    #[tokio::test]
    async fn happy_path_settles_exactly_once() {
        let registry = chains(HashMap::from([(source_hash(1), (user(), 7, 1_230_009_077))]));
        let ledger = Arc::new(InMemoryLedger::new());
        let backend = RecordingBackend::new(10);
        let pipeline = pipeline(registry, ledger.clone(), backend.clone(), PipelineSettings::default());

        let task = pipeline
            .submit_observed_transfer(event("1230009077", 1), &rule())
            .unwrap();
        task.await.unwrap();
        // Redelivery of the same event is dropped by the validator
        assert!(pipeline
            .submit_observed_transfer(event("1230009077", 1), &rule())
            .is_none());

        let sent = backend.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        let (request, nonce) = &sent[0];
        assert_eq!(*nonce, 10);
        assert_eq!(request.chain_id, 77);
        assert_eq!(request.recipient, user());
        assert_eq!(request.amount, U256::from(1_210_000_007u64));

        // Destination tracking runs in its own task
        for _ in 0..100 {
            if settled_state(&ledger, 7).await == SettlementState::DestConfirmed {
                break;
            }
            tokio::task::yield_now().await;
        }
        let record = ledger
            .find_by_identity(&TransactionIdentity::new(user(), 5, 7))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.state, SettlementState::DestConfirmed);
        assert_eq!(record.dest_amount.as_deref(), Some("1210000007"));
        assert_eq!(record.dest_timestamp, Some(1_700_000_000));
    }

    #[tokio::test]
    async fn concurrent_transfers_share_the_nonce_sequence() {
        let transfers: HashMap<_, _> = (1..=5u8)
            .map(|n| (source_hash(n), (user(), n as u64, 1_230_009_077)))
            .collect();
        let registry = chains(transfers);
        let ledger = Arc::new(InMemoryLedger::new());
        let backend = RecordingBackend::new(40);
        let pipeline = pipeline(registry, ledger.clone(), backend.clone(), PipelineSettings::default());

        let tasks: Vec<_> = (1..=5u8)
            .map(|n| {
                pipeline
                    .submit_observed_transfer(event("1230009077", n), &rule())
                    .unwrap()
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        let mut nonces = backend.nonces();
        nonces.sort_unstable();
        assert_eq!(nonces, vec![40, 41, 42, 43, 44]);
    }

    #[tokio::test]
    async fn failed_payout_is_retried_with_its_nonce() {
        let registry = chains(HashMap::from([(source_hash(1), (user(), 7, 1_230_009_077))]));
        let ledger = Arc::new(InMemoryLedger::new());
        let backend = RecordingBackend::new(10);
        backend.fail_at_broadcast.store(true, Ordering::SeqCst);
        let pipeline = pipeline(registry, ledger.clone(), backend.clone(), PipelineSettings::default());

        pipeline
            .submit_observed_transfer(event("1230009077", 1), &rule())
            .unwrap()
            .await
            .unwrap();

        let identity = TransactionIdentity::new(user(), 5, 7);
        assert_eq!(settled_state(&ledger, 7).await, SettlementState::SendFailed);
        let retry = ledger.find_retry(&identity).await.unwrap().unwrap();
        assert_eq!(retry.attempt_count, 1);
        assert_eq!(retry.reusable_nonce, Some(10));

        backend.fail_at_broadcast.store(false, Ordering::SeqCst);
        match pipeline.request_retry_drive(&identity).await.unwrap() {
            RetryDriveOutcome::Dispatched(handle) => handle.await.unwrap(),
            other => panic!("expected dispatch, got {:?}", other),
        }

        assert_eq!(backend.nonces(), vec![10]);
        assert_ne!(settled_state(&ledger, 7).await, SettlementState::SendFailed);
        assert_eq!(
            ledger.find_retry(&identity).await.unwrap().unwrap().state,
            RetryState::Resolved
        );

        // Settled identities are not paid twice
        assert!(matches!(
            pipeline.request_retry_drive(&identity).await.unwrap(),
            RetryDriveOutcome::AlreadyResolved
        ));
        assert_eq!(backend.nonces(), vec![10]);
    }

    #[tokio::test]
    async fn insufficient_balance_releases_the_nonce() {
        let registry = chains(HashMap::from([
            (source_hash(1), (user(), 7, 1_230_009_077)),
            (source_hash(2), (user(), 8, 1_230_009_077)),
        ]));
        let ledger = Arc::new(InMemoryLedger::new());
        let backend = RecordingBackend::new(10);
        backend.fail_before_broadcast.store(true, Ordering::SeqCst);
        let pipeline = pipeline(registry, ledger.clone(), backend.clone(), PipelineSettings::default());

        pipeline
            .submit_observed_transfer(event("1230009077", 1), &rule())
            .unwrap()
            .await
            .unwrap();
        let retry = ledger
            .find_retry(&TransactionIdentity::new(user(), 5, 7))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(retry.reusable_nonce, None);

        backend.fail_before_broadcast.store(false, Ordering::SeqCst);
        pipeline
            .submit_observed_transfer(event("1230009077", 2), &rule())
            .unwrap()
            .await
            .unwrap();
        assert_eq!(backend.nonces(), vec![10]);

        // The sweep picks up the parked payout with a fresh nonce
        assert_eq!(pipeline.redrive_pending().await.unwrap(), 1);
        assert_eq!(backend.nonces(), vec![10, 11]);
        assert!(ledger.pending_retries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn retry_cap_stops_redrives() {
        let registry = chains(HashMap::from([(source_hash(1), (user(), 7, 1_230_009_077))]));
        let ledger = Arc::new(InMemoryLedger::new());
        let backend = RecordingBackend::new(10);
        backend.fail_at_broadcast.store(true, Ordering::SeqCst);
        let settings = PipelineSettings {
            max_send_attempts: Some(2),
            ..PipelineSettings::default()
        };
        let pipeline = pipeline(registry, ledger.clone(), backend.clone(), settings);

        pipeline
            .submit_observed_transfer(event("1230009077", 1), &rule())
            .unwrap()
            .await
            .unwrap();
        assert_eq!(pipeline.redrive_pending().await.unwrap(), 1);

        let identity = TransactionIdentity::new(user(), 5, 7);
        assert!(matches!(
            pipeline.request_retry_drive(&identity).await.unwrap(),
            RetryDriveOutcome::CapReached { attempts: 2 }
        ));
        assert_eq!(pipeline.redrive_pending().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unknown_identity_is_not_found() {
        let ledger = Arc::new(InMemoryLedger::new());
        let pipeline = pipeline(
            chains(HashMap::new()),
            ledger,
            RecordingBackend::new(0),
            PipelineSettings::default(),
        );
        assert!(matches!(
            pipeline
                .request_retry_drive(&TransactionIdentity::from_raw("0xdead57"))
                .await
                .unwrap(),
            RetryDriveOutcome::NotFound
        ));
    }

    #[tokio::test]
    async fn marker_range_nonce_is_not_paid() {
        let registry = chains(HashMap::from([(source_hash(1), (user(), 9_500, 1_230_009_077))]));
        let ledger = Arc::new(InMemoryLedger::new());
        let backend = RecordingBackend::new(10);
        let pipeline = pipeline(registry, ledger.clone(), backend.clone(), PipelineSettings::default());

        pipeline
            .submit_observed_transfer(event("1230009077", 1), &rule())
            .unwrap()
            .await
            .unwrap();

        assert!(backend.nonces().is_empty());
        assert_eq!(settled_state(&ledger, 9_500).await, SettlementState::SourceConfirmed);
    }

    #[tokio::test]
    async fn settle_guards_against_concurrent_runs() {
        let registry = chains(HashMap::new());
        let ledger = Arc::new(InMemoryLedger::new());
        let pipeline = pipeline(registry, ledger, RecordingBackend::new(0), PipelineSettings::default());

        let intent = pipeline
            .validator
            .validate(&event("1230009077", 9), &rule())
            .unwrap()
            .confirmed(user(), 3, None);
        let identity = intent.identity().unwrap();

        let _held = InFlightGuard::acquire(&pipeline.in_flight, &identity).unwrap();
        assert!(matches!(
            pipeline.settle(intent.clone(), None).await.unwrap(),
            SettleOutcome::InFlight
        ));
        drop(_held);
        assert!(matches!(
            pipeline.settle(intent, None).await.unwrap(),
            SettleOutcome::NotReady
        ));
    }
}
