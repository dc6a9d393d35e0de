//! Polling transfer listener for EVM source chains
//!
//! Starts at the block after the current head, so a restart never replays
//! old transfers; anything missed while down is the ledger's concern. Native
//! transfers are read from block bodies, ERC-20 transfers from `Transfer`
//! logs.

use super::adapter::{ChainAdapter, ChainTransaction};
use super::erc20;
use super::provider::EvmChainProvider;
use crate::error::RelayerResult;
use crate::pipeline::TransferEvent;
use crate::pool::PoolBook;

use ethers::types::{Address, Block, Filter, Log, Transaction, H256};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Most blocks scanned per poll
const MAX_BLOCK_RANGE: u64 = 100;

/// Maker addresses and tokens watched on one chain
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchList {
    /// Makers receiving the native token
    pub native_makers: HashSet<Address>,
    /// Makers receiving ERC-20 tokens
    pub token_makers: HashSet<Address>,
    pub tokens: HashSet<Address>,
}

impl WatchList {
    pub fn for_chain(book: &PoolBook, chain_id: u64) -> Self {
        let mut watch = Self::default();
        for rule in book.rules_for_chain(chain_id) {
            if rule.source_token.is_zero() {
                watch.native_makers.insert(rule.maker_address);
            } else {
                watch.token_makers.insert(rule.maker_address);
                watch.tokens.insert(rule.source_token);
            }
        }
        watch
    }

    pub fn is_empty(&self) -> bool {
        self.native_makers.is_empty() && self.tokens.is_empty()
    }
}

/// Native transfers to watched makers in `block`
pub fn native_transfer_events(
    chain_id: u64,
    block: &Block<Transaction>,
    watch: &WatchList,
) -> Vec<TransferEvent> {
    let timestamp = Some(block.timestamp.low_u64());

    block
        .transactions
        .iter()
        .map(|tx| ChainTransaction::from(tx.clone()))
        .filter(|tx| !tx.value.is_zero())
        .filter_map(|tx| {
            let to = tx.to.filter(|to| watch.native_makers.contains(to))?;
            Some(TransferEvent {
                chain_id,
                from: tx.from,
                to,
                token: Address::zero(),
                value: tx.value.to_string(),
                tx_hash: format!("{:?}", tx.hash),
                block_number: tx.block_number,
                timestamp,
                nonce: None,
            })
        })
        .collect()
}

/// ERC-20 transfers to watched makers among `logs`
pub fn token_transfer_events(chain_id: u64, logs: &[Log], watch: &WatchList) -> Vec<TransferEvent> {
    let topic = erc20::transfer_event_topic();

    logs.iter()
        .filter_map(|log| {
            if log.topics.len() != 3 || log.topics[0] != topic || log.removed == Some(true) {
                return None;
            }
            if !watch.tokens.contains(&log.address) {
                return None;
            }
            let to = erc20::topic_address(&log.topics[2]);
            if !watch.token_makers.contains(&to) {
                return None;
            }
            let value = erc20::decode_uint(&log.data)?;
            if value.is_zero() {
                return None;
            }

            Some(TransferEvent {
                chain_id,
                from: erc20::topic_address(&log.topics[1]),
                to,
                token: log.address,
                value: value.to_string(),
                tx_hash: format!("{:?}", log.transaction_hash?),
                block_number: log.block_number.map(|b| b.as_u64()),
                timestamp: None,
                nonce: None,
            })
        })
        .collect()
}

/// Scans one chain and forwards matching transfers
pub struct TransferListener {
    chain_id: u64,
    provider: Arc<EvmChainProvider>,
    watch: WatchList,
    events: mpsc::Sender<TransferEvent>,
    poll_interval: Duration,
}

impl TransferListener {
    pub fn new(
        provider: Arc<EvmChainProvider>,
        watch: WatchList,
        events: mpsc::Sender<TransferEvent>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            chain_id: provider.chain_id(),
            provider,
            watch,
            events,
            poll_interval,
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// Poll until the event receiver goes away
    pub async fn listen(&self) -> RelayerResult<()> {
        let mut last_processed = self.wait_for_head().await;
        info!(
            "Listening for transfers on chain {} from block {}",
            self.chain_id,
            last_processed + 1
        );

        loop {
            tokio::time::sleep(self.poll_interval).await;

            let head = match self.provider.get_block_number().await {
                Ok(head) => head,
                Err(e) => {
                    warn!("Failed to get block number on chain {}: {}", self.chain_id, e);
                    continue;
                }
            };
            if head <= last_processed {
                continue;
            }

            let from_block = last_processed + 1;
            let to_block = head.min(from_block + MAX_BLOCK_RANGE - 1);
            debug!(
                "Chain {}: scanning blocks {} to {}",
                self.chain_id, from_block, to_block
            );

            let events = match self.scan(from_block, to_block).await {
                Ok(events) => events,
                Err(e) => {
                    warn!(
                        "Scan of blocks {}..={} on chain {} failed: {}",
                        from_block, to_block, self.chain_id, e
                    );
                    continue;
                }
            };

            for event in events {
                debug!("Transfer {} to {:?} on chain {}", event.tx_hash, event.to, self.chain_id);
                if self.events.send(event).await.is_err() {
                    info!("Transfer receiver closed, listener for chain {} stopping", self.chain_id);
                    return Ok(());
                }
            }

            last_processed = to_block;
            crate::metrics::record_blocks_processed(self.chain_id, to_block);
        }
    }

    async fn wait_for_head(&self) -> u64 {
        loop {
            match self.provider.get_block_number().await {
                Ok(head) => return head,
                Err(e) => {
                    warn!("Waiting for chain {} head: {}", self.chain_id, e);
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
    }

    async fn scan(&self, from_block: u64, to_block: u64) -> RelayerResult<Vec<TransferEvent>> {
        let mut events = Vec::new();

        if !self.watch.native_makers.is_empty() {
            for number in from_block..=to_block {
                match self.provider.get_block_with_txs(number).await? {
                    Some(block) => {
                        events.extend(native_transfer_events(self.chain_id, &block, &self.watch))
                    }
                    None => warn!("Block {} missing on chain {}", number, self.chain_id),
                }
            }
        }

        if !self.watch.tokens.is_empty() {
            let makers: Vec<H256> = self
                .watch
                .token_makers
                .iter()
                .map(|maker| H256::from(*maker))
                .collect();
            let filter = Filter::new()
                .address(self.watch.tokens.iter().copied().collect::<Vec<_>>())
                .topic0(erc20::transfer_event_topic())
                .topic2(makers)
                .from_block(from_block)
                .to_block(to_block);

            let logs = self.provider.get_logs(&filter).await?;
            events.extend(token_transfer_events(self.chain_id, &logs, &self.watch));
        }

        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{FeeSchedule, PoolRule};
    use ethers::types::{U256, U64};
    use rust_decimal::Decimal;

    fn maker() -> Address {
        Address::repeat_byte(0x11)
    }

    fn word(value: U256) -> ethers::types::Bytes {
        let mut data = [0u8; 32];
        value.to_big_endian(&mut data);
        ethers::types::Bytes::from(data.to_vec())
    }

    fn token() -> Address {
        Address::repeat_byte(0x33)
    }

    fn book() -> PoolBook {
        let rule = |source_token| PoolRule {
            maker_address: maker(),
            token_name: "T".to_string(),
            source_chain_id: 5,
            dest_chain_id: 77,
            source_token,
            dest_token: Address::zero(),
            min_price: Decimal::ONE,
            max_price: Decimal::TEN,
            fees: FeeSchedule {
                trading_fee: Decimal::ZERO,
                gas_fee: Decimal::ZERO,
                precision: 18,
            },
        };
        PoolBook::new(vec![rule(Address::zero()), rule(token())])
    }

    #[test]
    fn watch_list_splits_native_and_tokens() {
        let watch = WatchList::for_chain(&book(), 5);
        assert!(watch.native_makers.contains(&maker()));
        assert!(watch.tokens.contains(&token()));
        assert!(WatchList::for_chain(&book(), 77).is_empty());
    }

    #[test]
    fn picks_native_transfers_to_makers() {
        let watch = WatchList::for_chain(&book(), 5);
        let tx = |to: Address, value: u64| Transaction {
            hash: H256::from_low_u64_be(value),
            from: Address::repeat_byte(0x22),
            to: Some(to),
            value: U256::from(value),
            block_number: Some(U64::from(9)),
            ..Default::default()
        };
        let block = Block {
            timestamp: U256::from(1_700_000_000u64),
            transactions: vec![
                tx(maker(), 1_230_009_077),
                tx(Address::repeat_byte(0x44), 5),
                tx(maker(), 0),
            ],
            ..Default::default()
        };

        let events = native_transfer_events(5, &block, &watch);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].value, "1230009077");
        assert_eq!(events[0].from, Address::repeat_byte(0x22));
        assert_eq!(events[0].timestamp, Some(1_700_000_000));
        assert_eq!(events[0].block_number, Some(9));
    }

    #[test]
    fn picks_token_transfer_logs_to_makers() {
        let watch = WatchList::for_chain(&book(), 5);
        let log = |to: Address, address: Address| Log {
            address,
            topics: vec![
                erc20::transfer_event_topic(),
                H256::from(Address::repeat_byte(0x22)),
                H256::from(to),
            ],
            data: word(U256::from(5_000_009_077u64)),
            transaction_hash: Some(H256::repeat_byte(7)),
            block_number: Some(U64::from(12)),
            ..Default::default()
        };

        let logs = vec![
            log(maker(), token()),
            log(Address::repeat_byte(0x44), token()),
            log(maker(), Address::repeat_byte(0x55)),
        ];
        let events = token_transfer_events(5, &logs, &watch);

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].token, token());
        assert_eq!(events[0].to, maker());
        assert_eq!(events[0].value, "5000009077");
        assert_eq!(events[0].tx_hash, format!("{:?}", H256::repeat_byte(7)));
    }
}
