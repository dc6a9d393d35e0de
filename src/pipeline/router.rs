//! Fan-in from chain listeners to the settlement pipeline

use super::engine::SettlementPipeline;
use super::intent::TransferEvent;
use crate::codec::AmountCodec;
use crate::pool::{PoolBook, PoolRule};

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// The rule `event` was sent for.
///
/// A maker can serve one token from one chain to several destinations, so
/// the destination is read from the amount's tag. Transfers without a usable
/// tag fall back to any matching rule and are rejected by validation.
pub fn select_rule<'a>(
    book: &'a PoolBook,
    codec: &AmountCodec,
    event: &TransferEvent,
) -> Option<&'a PoolRule> {
    let destination = codec
        .decode(event.chain_id, &event.value)
        .ok()
        .and_then(|decoded| decoded.tag.destination_chain());

    destination
        .and_then(|dest| book.find(event.chain_id, event.to, event.token, dest))
        .or_else(|| book.candidates(event.chain_id, event.to, event.token).next())
}

/// Hand each transfer to the pipeline under the rule it was sent for.
///
/// Runs until every sender is dropped.
pub async fn route_transfers(
    mut events: mpsc::Receiver<TransferEvent>,
    book: Arc<PoolBook>,
    pipeline: Arc<SettlementPipeline>,
) {
    while let Some(event) = events.recv().await {
        match select_rule(&book, pipeline.codec(), &event) {
            Some(rule) => {
                pipeline.submit_observed_transfer(event, rule);
            }
            None => debug!(
                "No pool for transfer {} to {:?} on chain {}",
                event.tx_hash, event.to, event.chain_id
            ),
        }
    }
    info!("All transfer sources closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PoolConfig, PoolSideConfig};
    use crate::pipeline::{Rejection, TransferValidator};
    use ethers::types::{Address, U256};
    use rust_decimal::Decimal;
    use std::str::FromStr;

    const MAKER: &str = "0x0043d60e87c5dd08c86c3123340705a1556c4719";

    fn side(chain_id: u64) -> PoolSideConfig {
        PoolSideConfig {
            chain_id,
            token_address: format!("{:?}", Address::zero()),
            min_price: Decimal::from_str("0.005").unwrap(),
            max_price: Decimal::ONE,
            trading_fee: Decimal::from_str("0.0006").unwrap(),
            gas_fee: Decimal::ONE,
        }
    }

    fn eth_pool(c1: u64, c2: u64) -> PoolConfig {
        PoolConfig {
            maker_address: MAKER.to_string(),
            token_name: "ETH".to_string(),
            precision: 18,
            c1: side(c1),
            c2: side(c2),
        }
    }

    fn transfer(value: &str) -> TransferEvent {
        TransferEvent {
            chain_id: 1,
            from: Address::repeat_byte(0x22),
            to: Address::from_str(MAKER).unwrap(),
            token: Address::zero(),
            value: value.to_string(),
            tx_hash: format!("0x{}", "ab".repeat(32)),
            block_number: Some(10),
            timestamp: None,
            nonce: None,
        }
    }

    #[test]
    fn tag_picks_destination_among_shared_pools() {
        let book = PoolBook::from_configs(&[eth_pool(1, 2), eth_pool(1, 6)]).unwrap();
        let codec = AmountCodec::new();
        let validator = TransferValidator::new(AmountCodec::new());

        // 0.1 ETH bound for chain 6
        let event = transfer("100000000000009006");
        let rule = select_rule(&book, &codec, &event).unwrap();
        assert_eq!(rule.dest_chain_id, 6);

        let intent = validator.validate(&event, rule).unwrap();
        assert_eq!(intent.dest_chain_id, 6);
        assert_eq!(intent.real_amount, U256::from(100_000_000_000_000_000u64));

        let to_two = transfer("100000000000009002");
        assert_eq!(select_rule(&book, &codec, &to_two).unwrap().dest_chain_id, 2);
    }

    #[test]
    fn unknown_destination_is_still_rejected() {
        let book = PoolBook::from_configs(&[eth_pool(1, 2), eth_pool(1, 6)]).unwrap();
        let codec = AmountCodec::new();
        let validator = TransferValidator::new(AmountCodec::new());

        let event = transfer("100000000000009077");
        let rule = select_rule(&book, &codec, &event).unwrap();
        assert_eq!(validator.validate(&event, rule), Err(Rejection::TagMismatch));
    }

    #[test]
    fn transfers_to_other_addresses_have_no_rule() {
        let book = PoolBook::from_configs(&[eth_pool(1, 2)]).unwrap();
        let mut event = transfer("100000000000009002");
        event.to = Address::repeat_byte(0x99);
        assert!(select_rule(&book, &AmountCodec::new(), &event).is_none());
    }
}
