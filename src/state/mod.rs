//! Settlement state and its persistence
//!
//! Handles:
//! - The settlement ledger: one record per source transfer, moved forward by
//!   compare-and-set state transitions
//! - The retry ledger: failed payouts awaiting a re-drive
//!
//! Backed by PostgreSQL in production and by memory in tests.

mod memory;
mod postgres;

pub use memory::InMemoryLedger;
pub use postgres::PgLedger;

use crate::error::RelayerResult;

use async_trait::async_trait;
use ethers::types::Address;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Key of one settlement: lowercase user address, source chain id and
/// source nonce, concatenated
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionIdentity(String);

impl TransactionIdentity {
    pub fn new(user_address: Address, source_chain_id: u64, source_nonce: u64) -> Self {
        Self(format!("{:?}{}{}", user_address, source_chain_id, source_nonce))
    }

    /// Wrap an identity read back from storage or an operator request
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransactionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SettlementState {
    Observed,
    SourceConfirmed,
    DestSubmitted,
    DestConfirmed,
    SendFailed,
}

impl SettlementState {
    /// Stored representation
    pub fn code(self) -> i16 {
        match self {
            SettlementState::Observed => 0,
            SettlementState::SourceConfirmed => 1,
            SettlementState::DestSubmitted => 2,
            SettlementState::DestConfirmed => 3,
            SettlementState::SendFailed => 20,
        }
    }

    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            0 => Some(SettlementState::Observed),
            1 => Some(SettlementState::SourceConfirmed),
            2 => Some(SettlementState::DestSubmitted),
            3 => Some(SettlementState::DestConfirmed),
            20 => Some(SettlementState::SendFailed),
            _ => None,
        }
    }

    /// A payout has been broadcast for this record
    pub fn is_settled(self) -> bool {
        matches!(
            self,
            SettlementState::DestSubmitted | SettlementState::DestConfirmed
        )
    }
}

/// One settlement, from source transfer to confirmed payout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerRecord {
    pub identity: TransactionIdentity,
    pub maker_address: Address,
    pub user_address: Address,
    pub source_chain_id: u64,
    pub dest_chain_id: u64,
    pub source_tx_hash: String,
    pub source_timestamp: Option<u64>,
    /// Wire amount, tag included
    pub source_amount: String,
    pub source_nonce: u64,
    pub token_address: Address,
    pub dest_tx_hash: Option<String>,
    pub dest_amount: Option<String>,
    pub dest_timestamp: Option<u64>,
    pub state: SettlementState,
}

/// A state transition with the data it records
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateUpdate {
    SourceConfirmed,
    DestSubmitted {
        dest_tx_hash: String,
        dest_amount: String,
    },
    SendFailed,
    DestConfirmed {
        dest_timestamp: u64,
    },
}

impl StateUpdate {
    pub fn target(&self) -> SettlementState {
        match self {
            StateUpdate::SourceConfirmed => SettlementState::SourceConfirmed,
            StateUpdate::DestSubmitted { .. } => SettlementState::DestSubmitted,
            StateUpdate::SendFailed => SettlementState::SendFailed,
            StateUpdate::DestConfirmed { .. } => SettlementState::DestConfirmed,
        }
    }

    /// States the record must be in for this update to apply
    pub fn allowed_from(&self) -> &'static [SettlementState] {
        use SettlementState::*;
        match self {
            StateUpdate::SourceConfirmed => &[Observed],
            StateUpdate::DestSubmitted { .. } => &[SourceConfirmed, SendFailed],
            StateUpdate::SendFailed => &[SourceConfirmed, SendFailed],
            StateUpdate::DestConfirmed { .. } => &[DestSubmitted],
        }
    }

    /// Apply to `record` if its current state allows it
    pub fn apply(&self, record: &mut LedgerRecord) -> bool {
        if !self.allowed_from().contains(&record.state) {
            return false;
        }
        match self {
            StateUpdate::DestSubmitted {
                dest_tx_hash,
                dest_amount,
            } => {
                record.dest_tx_hash = Some(dest_tx_hash.clone());
                record.dest_amount = Some(dest_amount.clone());
            }
            StateUpdate::DestConfirmed { dest_timestamp } => {
                record.dest_timestamp = Some(*dest_timestamp);
            }
            StateUpdate::SourceConfirmed | StateUpdate::SendFailed => {}
        }
        record.state = self.target();
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A record with this identity was already present and was left as is
    AlreadyExists,
}

/// Durable record of settlements
#[async_trait]
pub trait SettlementLedger: Send + Sync {
    async fn find_by_identity(
        &self,
        identity: &TransactionIdentity,
    ) -> RelayerResult<Option<LedgerRecord>>;

    /// Insert unless the identity exists
    async fn insert_pending(&self, record: LedgerRecord) -> RelayerResult<InsertOutcome>;

    /// Compare-and-set transition; false if the record is missing or in a
    /// state the update does not apply to
    async fn update_state(
        &self,
        identity: &TransactionIdentity,
        update: StateUpdate,
    ) -> RelayerResult<bool>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetryState {
    Pending,
    Resolved,
}

impl RetryState {
    pub fn code(self) -> i16 {
        match self {
            RetryState::Pending => 20,
            RetryState::Resolved => 1,
        }
    }

    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            20 => Some(RetryState::Pending),
            1 => Some(RetryState::Resolved),
            _ => None,
        }
    }
}

/// A failed payout and what is needed to redo it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryRecord {
    pub identity: TransactionIdentity,
    pub maker_address: Address,
    /// JSON of the confirmed intent
    pub serialized_intent: String,
    pub attempt_count: u32,
    /// Nonce the failed attempt may have left on the network
    pub reusable_nonce: Option<u64>,
    pub state: RetryState,
}

/// Durable record of failed payouts
#[async_trait]
pub trait RetryLedger: Send + Sync {
    async fn find_retry(&self, identity: &TransactionIdentity)
        -> RelayerResult<Option<RetryRecord>>;

    /// Insert with one attempt, or count one more attempt and store the
    /// latest intent and nonce
    async fn record_failure(
        &self,
        identity: &TransactionIdentity,
        maker_address: Address,
        serialized_intent: &str,
        reusable_nonce: Option<u64>,
    ) -> RelayerResult<RetryRecord>;

    async fn mark_resolved(&self, identity: &TransactionIdentity) -> RelayerResult<()>;

    async fn pending_retries(&self) -> RelayerResult<Vec<RetryRecord>>;
}
