//! Payout submission: per-chain send queues, nonce arbitration and gas pricing

mod gas;
mod nonce;
mod queue;
mod sender;

pub use gas::{GasPolicy, GasPricer};
pub use nonce::{NonceAssignment, NonceCursor};
pub use queue::{
    ChainSendQueue, SendBackend, SendFailure, SendOutcome, SendQueues, SendRequest, SentTransfer,
};
pub use sender::{MakerKeys, SettlementExecutor};
