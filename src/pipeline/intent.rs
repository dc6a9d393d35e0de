//! Observed transfers and the settlement intents derived from them

use crate::codec::{AmountCodec, SequenceTag};
use crate::error::{RelayerError, RelayerResult};
use crate::pool::FeeSchedule;
use crate::state::TransactionIdentity;

use ethers::types::{Address, U256};
use serde::{Deserialize, Serialize};

/// An inbound transfer to a maker address, as reported by a transfer source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferEvent {
    pub chain_id: u64,
    pub from: Address,
    pub to: Address,
    /// Zero address for the native token
    pub token: Address,
    /// Wire amount in base units, decimal
    pub value: String,
    pub tx_hash: String,
    pub block_number: Option<u64>,
    pub timestamp: Option<u64>,
    /// Sender nonce, known up front only on rollups
    pub nonce: Option<u64>,
}

/// A validated request to pay a user out on the destination chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementIntent {
    pub source_chain_id: u64,
    pub dest_chain_id: u64,
    pub maker_address: Address,
    pub user_address: Address,
    pub token_address: Address,
    pub dest_token_address: Address,
    pub source_tx_hash: String,
    /// Wire amount as received
    pub source_amount: String,
    pub real_amount: U256,
    pub sequence_tag: SequenceTag,
    pub source_nonce: Option<u64>,
    pub source_timestamp: Option<u64>,
    pub fees: FeeSchedule,
}

impl SettlementIntent {
    /// Ledger key; only known once the source nonce is
    pub fn identity(&self) -> Option<TransactionIdentity> {
        self.source_nonce
            .map(|nonce| TransactionIdentity::new(self.user_address, self.source_chain_id, nonce))
    }

    /// Copy carrying what the source chain reported for the transfer
    pub fn confirmed(&self, user_address: Address, nonce: u64, timestamp: Option<u64>) -> Self {
        Self {
            user_address,
            source_nonce: Some(nonce),
            source_timestamp: timestamp.or(self.source_timestamp),
            ..self.clone()
        }
    }

    /// Wire amount to send on the destination chain: the real amount less
    /// fees, tagged with the source nonce
    pub fn payout_amount(&self, codec: &AmountCodec) -> RelayerResult<U256> {
        let nonce = self.source_nonce.ok_or_else(|| {
            RelayerError::Internal(format!("intent {} has no source nonce", self.source_tx_hash))
        })?;
        let tag = SequenceTag::ordinary(nonce).ok_or_else(|| RelayerError::Codec {
            chain_id: self.dest_chain_id,
            amount: self.real_amount.to_string(),
            message: format!("source nonce {} too high for a payout tag", nonce),
        })?;

        let payout = self.fees.payout_amount(self.real_amount)?;
        codec.encode(self.dest_chain_id, payout, tag)
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use crate::pool::PoolRule;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    pub fn maker() -> Address {
        Address::repeat_byte(0x11)
    }

    pub fn user() -> Address {
        Address::repeat_byte(0x22)
    }

    /// Native-token pool from chain 5 to chain 77, precision 9
    pub fn rule() -> PoolRule {
        PoolRule {
            maker_address: maker(),
            token_name: "ETH".to_string(),
            source_chain_id: 5,
            dest_chain_id: 77,
            source_token: Address::zero(),
            dest_token: Address::zero(),
            min_price: Decimal::from_str("0.5").unwrap(),
            max_price: Decimal::from_str("2").unwrap(),
            fees: FeeSchedule {
                trading_fee: Decimal::from_str("0.01").unwrap(),
                gas_fee: Decimal::from_str("1").unwrap(),
                precision: 9,
            },
        }
    }

    pub fn event(value: &str, tx_byte: u8) -> TransferEvent {
        TransferEvent {
            chain_id: 5,
            from: user(),
            to: maker(),
            token: Address::zero(),
            value: value.to_string(),
            tx_hash: format!("{:?}", ethers::types::H256::repeat_byte(tx_byte)),
            block_number: Some(100),
            timestamp: None,
            nonce: None,
        }
    }
}
