//! In-memory ledgers for tests and dry runs

use super::{
    InsertOutcome, LedgerRecord, RetryLedger, RetryRecord, RetryState, SettlementLedger,
    StateUpdate, TransactionIdentity,
};
use crate::error::RelayerResult;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ethers::types::Address;
use tracing::debug;

/// Both ledgers in process memory. Contents are lost on restart.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    records: DashMap<TransactionIdentity, LedgerRecord>,
    retries: DashMap<TransactionIdentity, RetryRecord>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }
}

#[async_trait]
impl SettlementLedger for InMemoryLedger {
    async fn find_by_identity(
        &self,
        identity: &TransactionIdentity,
    ) -> RelayerResult<Option<LedgerRecord>> {
        Ok(self.records.get(identity).map(|r| r.clone()))
    }

    async fn insert_pending(&self, record: LedgerRecord) -> RelayerResult<InsertOutcome> {
        match self.records.entry(record.identity.clone()) {
            Entry::Occupied(_) => Ok(InsertOutcome::AlreadyExists),
            Entry::Vacant(slot) => {
                debug!("Ledger insert {} as {:?}", record.identity, record.state);
                slot.insert(record);
                Ok(InsertOutcome::Inserted)
            }
        }
    }

    async fn update_state(
        &self,
        identity: &TransactionIdentity,
        update: StateUpdate,
    ) -> RelayerResult<bool> {
        Ok(match self.records.get_mut(identity) {
            Some(mut record) => update.apply(&mut record),
            None => false,
        })
    }
}

#[async_trait]
impl RetryLedger for InMemoryLedger {
    async fn find_retry(
        &self,
        identity: &TransactionIdentity,
    ) -> RelayerResult<Option<RetryRecord>> {
        Ok(self.retries.get(identity).map(|r| r.clone()))
    }

    async fn record_failure(
        &self,
        identity: &TransactionIdentity,
        maker_address: Address,
        serialized_intent: &str,
        reusable_nonce: Option<u64>,
    ) -> RelayerResult<RetryRecord> {
        let record = match self.retries.entry(identity.clone()) {
            Entry::Occupied(mut existing) => {
                let record = existing.get_mut();
                record.attempt_count += 1;
                record.serialized_intent = serialized_intent.to_string();
                record.reusable_nonce = reusable_nonce;
                record.state = RetryState::Pending;
                record.clone()
            }
            Entry::Vacant(slot) => slot
                .insert(RetryRecord {
                    identity: identity.clone(),
                    maker_address,
                    serialized_intent: serialized_intent.to_string(),
                    attempt_count: 1,
                    reusable_nonce,
                    state: RetryState::Pending,
                })
                .clone(),
        };
        Ok(record)
    }

    async fn mark_resolved(&self, identity: &TransactionIdentity) -> RelayerResult<()> {
        if let Some(mut record) = self.retries.get_mut(identity) {
            record.state = RetryState::Resolved;
        }
        Ok(())
    }

    async fn pending_retries(&self) -> RelayerResult<Vec<RetryRecord>> {
        let mut pending: Vec<RetryRecord> = self
            .retries
            .iter()
            .filter(|r| r.state == RetryState::Pending)
            .map(|r| r.clone())
            .collect();
        pending.sort_by(|a, b| a.identity.cmp(&b.identity));
        Ok(pending)
    }
}
