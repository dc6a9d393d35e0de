//! PostgreSQL ledgers

use super::{
    InsertOutcome, LedgerRecord, RetryLedger, RetryRecord, RetryState, SettlementLedger,
    SettlementState, StateUpdate, TransactionIdentity,
};
use crate::config::DatabaseConfig;
use crate::error::{RelayerError, RelayerResult};

use async_trait::async_trait;
use ethers::types::Address;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::str::FromStr;
use tracing::{debug, info};

/// Settlement and retry ledgers in PostgreSQL
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    /// Create a new ledger
    pub async fn new(config: &DatabaseConfig) -> RelayerResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> RelayerResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS settlements (
                identity VARCHAR(128) PRIMARY KEY,
                maker_address VARCHAR(42) NOT NULL,
                user_address VARCHAR(42) NOT NULL,
                source_chain_id BIGINT NOT NULL,
                dest_chain_id BIGINT NOT NULL,
                source_tx_hash VARCHAR(128) NOT NULL,
                source_timestamp BIGINT,
                source_amount VARCHAR(80) NOT NULL,
                source_nonce BIGINT NOT NULL,
                token_address VARCHAR(42) NOT NULL,
                dest_tx_hash VARCHAR(128),
                dest_amount VARCHAR(80),
                dest_timestamp BIGINT,
                state SMALLINT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_settlements_source_tx
            ON settlements (source_chain_id, source_tx_hash)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS retry_records (
                identity VARCHAR(128) PRIMARY KEY,
                maker_address VARCHAR(42) NOT NULL,
                serialized_intent JSONB NOT NULL,
                attempt_count INTEGER NOT NULL,
                reusable_nonce BIGINT,
                state SMALLINT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_retry_records_state
            ON retry_records (state)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }

    /// Health check
    pub async fn health_check(&self) -> RelayerResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

fn address_column(row: &PgRow, column: &str) -> RelayerResult<Address> {
    let value: String = row.try_get(column)?;
    Address::from_str(&value)
        .map_err(|e| RelayerError::Ledger(format!("bad address in {}: {} ({})", column, value, e)))
}

fn optional_u64(row: &PgRow, column: &str) -> RelayerResult<Option<u64>> {
    Ok(row.try_get::<Option<i64>, _>(column)?.map(|v| v as u64))
}

fn ledger_record(row: &PgRow) -> RelayerResult<LedgerRecord> {
    let code: i16 = row.try_get("state")?;
    let state = SettlementState::from_code(code)
        .ok_or_else(|| RelayerError::Ledger(format!("unknown settlement state {}", code)))?;

    Ok(LedgerRecord {
        identity: TransactionIdentity::from_raw(row.try_get::<String, _>("identity")?),
        maker_address: address_column(row, "maker_address")?,
        user_address: address_column(row, "user_address")?,
        source_chain_id: row.try_get::<i64, _>("source_chain_id")? as u64,
        dest_chain_id: row.try_get::<i64, _>("dest_chain_id")? as u64,
        source_tx_hash: row.try_get("source_tx_hash")?,
        source_timestamp: optional_u64(row, "source_timestamp")?,
        source_amount: row.try_get("source_amount")?,
        source_nonce: row.try_get::<i64, _>("source_nonce")? as u64,
        token_address: address_column(row, "token_address")?,
        dest_tx_hash: row.try_get("dest_tx_hash")?,
        dest_amount: row.try_get("dest_amount")?,
        dest_timestamp: optional_u64(row, "dest_timestamp")?,
        state,
    })
}

fn retry_record(row: &PgRow) -> RelayerResult<RetryRecord> {
    let code: i16 = row.try_get("state")?;
    let state = RetryState::from_code(code)
        .ok_or_else(|| RelayerError::Ledger(format!("unknown retry state {}", code)))?;
    let intent: serde_json::Value = row.try_get("serialized_intent")?;

    Ok(RetryRecord {
        identity: TransactionIdentity::from_raw(row.try_get::<String, _>("identity")?),
        maker_address: address_column(row, "maker_address")?,
        serialized_intent: intent.to_string(),
        attempt_count: row.try_get::<i32, _>("attempt_count")? as u32,
        reusable_nonce: optional_u64(row, "reusable_nonce")?,
        state,
    })
}

const RETRY_COLUMNS: &str =
    "identity, maker_address, serialized_intent, attempt_count, reusable_nonce, state";

#[async_trait]
impl SettlementLedger for PgLedger {
    async fn find_by_identity(
        &self,
        identity: &TransactionIdentity,
    ) -> RelayerResult<Option<LedgerRecord>> {
        let row = sqlx::query("SELECT * FROM settlements WHERE identity = $1")
            .bind(identity.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(ledger_record).transpose()
    }

    async fn insert_pending(&self, record: LedgerRecord) -> RelayerResult<InsertOutcome> {
        let result = sqlx::query(
            r#"
            INSERT INTO settlements
                (identity, maker_address, user_address, source_chain_id, dest_chain_id,
                 source_tx_hash, source_timestamp, source_amount, source_nonce,
                 token_address, state)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (identity) DO NOTHING
            "#,
        )
        .bind(record.identity.as_str())
        .bind(format!("{:?}", record.maker_address))
        .bind(format!("{:?}", record.user_address))
        .bind(record.source_chain_id as i64)
        .bind(record.dest_chain_id as i64)
        .bind(&record.source_tx_hash)
        .bind(record.source_timestamp.map(|t| t as i64))
        .bind(&record.source_amount)
        .bind(record.source_nonce as i64)
        .bind(format!("{:?}", record.token_address))
        .bind(record.state.code())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            debug!("Ledger record {} already exists", record.identity);
            Ok(InsertOutcome::AlreadyExists)
        } else {
            Ok(InsertOutcome::Inserted)
        }
    }

    async fn update_state(
        &self,
        identity: &TransactionIdentity,
        update: StateUpdate,
    ) -> RelayerResult<bool> {
        let (dest_tx_hash, dest_amount, dest_timestamp) = match &update {
            StateUpdate::DestSubmitted {
                dest_tx_hash,
                dest_amount,
            } => (Some(dest_tx_hash.clone()), Some(dest_amount.clone()), None),
            StateUpdate::DestConfirmed { dest_timestamp } => {
                (None, None, Some(*dest_timestamp as i64))
            }
            StateUpdate::SourceConfirmed | StateUpdate::SendFailed => (None, None, None),
        };
        let allowed: Vec<i16> = update.allowed_from().iter().map(|s| s.code()).collect();

        let result = sqlx::query(
            r#"
            UPDATE settlements
            SET state = $2,
                dest_tx_hash = COALESCE($3, dest_tx_hash),
                dest_amount = COALESCE($4, dest_amount),
                dest_timestamp = COALESCE($5, dest_timestamp),
                updated_at = NOW()
            WHERE identity = $1 AND state = ANY($6)
            "#,
        )
        .bind(identity.as_str())
        .bind(update.target().code())
        .bind(dest_tx_hash)
        .bind(dest_amount)
        .bind(dest_timestamp)
        .bind(allowed)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl RetryLedger for PgLedger {
    async fn find_retry(
        &self,
        identity: &TransactionIdentity,
    ) -> RelayerResult<Option<RetryRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM retry_records WHERE identity = $1",
            RETRY_COLUMNS
        ))
        .bind(identity.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(retry_record).transpose()
    }

    async fn record_failure(
        &self,
        identity: &TransactionIdentity,
        maker_address: Address,
        serialized_intent: &str,
        reusable_nonce: Option<u64>,
    ) -> RelayerResult<RetryRecord> {
        let intent: serde_json::Value = serde_json::from_str(serialized_intent)?;

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO retry_records
                (identity, maker_address, serialized_intent, attempt_count, reusable_nonce, state)
            VALUES ($1, $2, $3, 1, $4, $5)
            ON CONFLICT (identity)
            DO UPDATE SET
                attempt_count = retry_records.attempt_count + 1,
                serialized_intent = EXCLUDED.serialized_intent,
                reusable_nonce = EXCLUDED.reusable_nonce,
                state = EXCLUDED.state,
                updated_at = NOW()
            RETURNING {}
            "#,
            RETRY_COLUMNS
        ))
        .bind(identity.as_str())
        .bind(format!("{:?}", maker_address))
        .bind(intent)
        .bind(reusable_nonce.map(|n| n as i64))
        .bind(RetryState::Pending.code())
        .fetch_one(&self.pool)
        .await?;

        retry_record(&row)
    }

    async fn mark_resolved(&self, identity: &TransactionIdentity) -> RelayerResult<()> {
        sqlx::query(
            r#"
            UPDATE retry_records
            SET state = $2, updated_at = NOW()
            WHERE identity = $1
            "#,
        )
        .bind(identity.as_str())
        .bind(RetryState::Resolved.code())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn pending_retries(&self) -> RelayerResult<Vec<RetryRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM retry_records WHERE state = $1 ORDER BY created_at",
            RETRY_COLUMNS
        ))
        .bind(RetryState::Pending.code())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(retry_record).collect()
    }
}
