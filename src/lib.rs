//! Maker relayer - settles cross-chain liquidity bridge transfers
//!
//! Watches maker addresses on every configured chain, matches incoming
//! transfers against pool rules, and pays the user out on the destination
//! chain once the source transfer is final.

pub mod chain;
pub mod codec;
pub mod config;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod pool;
pub mod retry;
pub mod state;
pub mod tx;

pub use error::{RelayerError, RelayerResult};
