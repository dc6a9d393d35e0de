//! Error types for the maker relayer

use thiserror::Error;

/// Main error type for the relayer
#[derive(Error, Debug)]
pub enum RelayerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Chain connection error for chain {chain_id}: {message}")]
    ChainConnection { chain_id: u64, message: String },

    #[error("Transaction error on chain {chain_id}: {message}")]
    Transaction { chain_id: u64, message: String },

    #[error("Nonce error for chain {chain_id}: {message}")]
    Nonce { chain_id: u64, message: String },

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Rollup error on chain {chain_id}: {message}")]
    Rollup { chain_id: u64, message: String },

    #[error("Invalid amount {amount} for chain {chain_id}: {message}")]
    Codec {
        chain_id: u64,
        amount: String,
        message: String,
    },

    #[error("Ledger error: {0}")]
    Ledger(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Chain {chain_id} not found")]
    ChainNotFound { chain_id: u64 },

    #[error("Transaction {tx_id} not found")]
    TransactionNotFound { tx_id: String },

    #[error("Insufficient balance on chain {chain_id}: have {have}, need {need}")]
    InsufficientBalance {
        chain_id: u64,
        have: String,
        need: String,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayerError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RelayerError::ChainConnection { .. }
                | RelayerError::Timeout { .. }
                | RelayerError::TransactionNotFound { .. }
                | RelayerError::Database(_)
                | RelayerError::Ledger(_)
        )
    }

    /// Check if error should trigger an alert
    pub fn should_alert(&self) -> bool {
        matches!(
            self,
            RelayerError::InsufficientBalance { .. } | RelayerError::Wallet(_)
        )
    }

    /// Short label used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            RelayerError::Config(_) => "config",
            RelayerError::Database(_) => "database",
            RelayerError::ChainConnection { .. } => "chain_connection",
            RelayerError::Transaction { .. } => "transaction",
            RelayerError::Nonce { .. } => "nonce",
            RelayerError::Wallet(_) => "wallet",
            RelayerError::Rollup { .. } => "rollup",
            RelayerError::Codec { .. } => "codec",
            RelayerError::Ledger(_) => "ledger",
            RelayerError::Serialization(_) => "serialization",
            RelayerError::Timeout { .. } => "timeout",
            RelayerError::ChainNotFound { .. } => "chain_not_found",
            RelayerError::TransactionNotFound { .. } => "tx_not_found",
            RelayerError::InsufficientBalance { .. } => "insufficient_balance",
            RelayerError::Internal(_) => "internal",
        }
    }
}

/// Result type for relayer operations
pub type RelayerResult<T> = Result<T, RelayerError>;
