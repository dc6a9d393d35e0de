//! Settlement pipeline: match, confirm, pay out, confirm again
//!
//! Transfers arrive as [`TransferEvent`]s, are checked by the
//! [`TransferValidator`], and become [`SettlementIntent`]s that the
//! [`SettlementPipeline`] drives through the ledger states.

mod destination;
mod engine;
mod intent;
mod router;
mod source;
mod validator;

pub use destination::DestinationConfirmationTracker;
pub use engine::{PipelineSettings, RetryDriveOutcome, SettleOutcome, SettlementPipeline};
pub use intent::{SettlementIntent, TransferEvent};
pub use router::{route_transfers, select_rule};
pub use source::{SourceConfirmationTracker, SourceOutcome};
pub use validator::{Rejection, TransferValidator};
