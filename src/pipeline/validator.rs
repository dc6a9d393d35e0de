//! Matching observed transfers against pool rules

use super::intent::{SettlementIntent, TransferEvent};
use crate::codec::AmountCodec;
use crate::pool::PoolRule;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Why a transfer was not turned into an intent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Event does not belong to the rule it was matched with
    RuleMismatch,
    /// Amount carries no readable tag
    Undecodable,
    OutOfBounds,
    TagMismatch,
    /// Transaction hash already accepted by this validator
    Duplicate,
}

impl Rejection {
    pub fn reason(self) -> &'static str {
        match self {
            Rejection::RuleMismatch => "rule_mismatch",
            Rejection::Undecodable => "undecodable",
            Rejection::OutOfBounds => "out_of_bounds",
            Rejection::TagMismatch => "tag_mismatch",
            Rejection::Duplicate => "duplicate",
        }
    }
}

/// Stateless checks plus a seen-set of accepted transaction hashes.
///
/// Entries are dropped by [`TransferValidator::prune_seen`] once they are old
/// enough that no listener will deliver the transfer again; past that, and
/// across restarts, the ledger's identity key catches replays.
pub struct TransferValidator {
    codec: AmountCodec,
    seen: DashMap<String, Instant>,
}

impl TransferValidator {
    pub fn new(codec: AmountCodec) -> Self {
        Self {
            codec,
            seen: DashMap::new(),
        }
    }

    /// Forget hashes accepted more than `max_age` ago; returns how many
    pub fn prune_seen(&self, max_age: Duration) -> usize {
        let before = self.seen.len();
        self.seen.retain(|_, accepted| accepted.elapsed() < max_age);
        before.saturating_sub(self.seen.len())
    }

    pub fn seen_count(&self) -> usize {
        self.seen.len()
    }

    pub fn codec(&self) -> &AmountCodec {
        &self.codec
    }

    /// Turn `event` into an intent for `rule`, or say why not
    pub fn validate(
        &self,
        event: &TransferEvent,
        rule: &PoolRule,
    ) -> Result<SettlementIntent, Rejection> {
        let result = self.check(event, rule);
        match &result {
            Ok(_) => {
                info!(
                    "Matched transfer {} on chain {} for chain {}",
                    event.tx_hash, event.chain_id, rule.dest_chain_id
                );
                crate::metrics::record_transfer_matched(event.chain_id);
            }
            Err(rejection) => {
                debug!(
                    "Dropped transfer {} on chain {}: {}",
                    event.tx_hash,
                    event.chain_id,
                    rejection.reason()
                );
                crate::metrics::record_transfer_rejected(event.chain_id, rejection.reason());
            }
        }
        result
    }

    fn check(&self, event: &TransferEvent, rule: &PoolRule) -> Result<SettlementIntent, Rejection> {
        if event.chain_id != rule.source_chain_id
            || event.to != rule.maker_address
            || event.token != rule.source_token
        {
            return Err(Rejection::RuleMismatch);
        }

        let decoded = self
            .codec
            .decode(event.chain_id, &event.value)
            .map_err(|_| Rejection::Undecodable)?;

        let in_bounds = rule.accepts_amount(decoded.real_amount).unwrap_or_else(|e| {
            warn!("Pool {} has unusable bounds: {}", rule.token_name, e);
            false
        });
        if !in_bounds {
            return Err(Rejection::OutOfBounds);
        }
        if decoded.tag != rule.destination_tag() {
            return Err(Rejection::TagMismatch);
        }

        match self.seen.entry(event.tx_hash.to_lowercase()) {
            Entry::Occupied(_) => return Err(Rejection::Duplicate),
            Entry::Vacant(slot) => {
                slot.insert(Instant::now());
            }
        }

        Ok(SettlementIntent {
            source_chain_id: event.chain_id,
            dest_chain_id: rule.dest_chain_id,
            maker_address: rule.maker_address,
            user_address: event.from,
            token_address: rule.source_token,
            dest_token_address: rule.dest_token,
            source_tx_hash: event.tx_hash.clone(),
            source_amount: event.value.clone(),
            real_amount: decoded.real_amount,
            sequence_tag: decoded.tag,
            source_nonce: event.nonce,
            source_timestamp: event.timestamp,
            fees: rule.fees.clone(),
        })
    }
}
