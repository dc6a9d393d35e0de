//! Nonce arbitration for one destination chain
//!
//! The cursor remembers the last nonce handed out per maker. The chain's
//! pending count is authoritative, except that it lags behind sends that were
//! just broadcast, so the cursor wins whenever it is ahead.

use ethers::types::Address;
use std::collections::HashMap;
use tracing::debug;

/// Nonce chosen for one send, with what the cursor held before
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NonceAssignment {
    pub nonce: u64,
    pub previous: Option<u64>,
}

/// Last assigned nonce per maker on one chain.
///
/// Owned by the chain's send-queue consumer; never shared.
#[derive(Debug, Default)]
pub struct NonceCursor {
    chain_id: u64,
    last_assigned: HashMap<Address, u64>,
}

impl NonceCursor {
    pub fn new(chain_id: u64) -> Self {
        Self {
            chain_id,
            last_assigned: HashMap::new(),
        }
    }

    /// Pick the nonce for `maker` given the chain's live count, and advance
    /// the cursor to it
    pub fn resolve(&mut self, maker: Address, live_nonce: u64) -> NonceAssignment {
        let previous = self.last_assigned.get(&maker).copied();
        let nonce = match previous {
            Some(cursor) => live_nonce.max(cursor + 1),
            None => live_nonce,
        };
        self.last_assigned.insert(maker, nonce);

        debug!(
            "Allocated nonce {} for {:?} on chain {} (live {}, cursor {:?})",
            nonce, maker, self.chain_id, live_nonce, previous
        );
        NonceAssignment { nonce, previous }
    }

    /// Undo an assignment whose transaction never reached the network
    pub fn rollback(&mut self, maker: Address, assignment: NonceAssignment) {
        if self.last_assigned.get(&maker) != Some(&assignment.nonce) {
            return;
        }
        match assignment.previous {
            Some(previous) => {
                self.last_assigned.insert(maker, previous);
            }
            None => {
                self.last_assigned.remove(&maker);
            }
        }
        debug!(
            "Released nonce {} for {:?} on chain {}",
            assignment.nonce, maker, self.chain_id
        );
    }

    pub fn peek(&self, maker: Address) -> Option<u64> {
        self.last_assigned.get(&maker).copied()
    }
}
