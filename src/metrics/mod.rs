//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Chain connection status and scanned block height
//! - Transfer matching and source confirmation
//! - Payout submission, failure and confirmation
//! - Send queue depth and retry activity

use crate::error::{RelayerError, RelayerResult};

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, CounterVec, Encoder, GaugeVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::{error, info};

lazy_static! {
    // Chain metrics
    pub static ref CHAIN_CONNECTED: GaugeVec = register_gauge_vec!(
        "maker_relayer_chain_connected",
        "Chain connection status (1=connected, 0=disconnected)",
        &["chain_id"]
    ).expect("chain_connected registers once");

    pub static ref CHAIN_BLOCK_HEIGHT: GaugeVec = register_gauge_vec!(
        "maker_relayer_chain_block_height",
        "Last block scanned for transfers per chain",
        &["chain_id"]
    ).expect("chain_block_height registers once");

    pub static ref ADAPTER_ERRORS: CounterVec = register_counter_vec!(
        "maker_relayer_adapter_errors_total",
        "Failed chain adapter calls while polling, by error kind",
        &["kind"]
    ).expect("adapter_errors registers once");

    pub static ref POLL_ALERTS: CounterVec = register_counter_vec!(
        "maker_relayer_poll_alerts_total",
        "Polls that crossed the consecutive failure alert threshold",
        &[]
    ).expect("poll_alerts registers once");

    // Transfer metrics
    pub static ref TRANSFERS_MATCHED: CounterVec = register_counter_vec!(
        "maker_relayer_transfers_matched_total",
        "Transfers accepted by a pool rule",
        &["chain_id"]
    ).expect("transfers_matched registers once");

    pub static ref TRANSFERS_REJECTED: CounterVec = register_counter_vec!(
        "maker_relayer_transfers_rejected_total",
        "Transfers dropped by validation",
        &["chain_id", "reason"]
    ).expect("transfers_rejected registers once");

    pub static ref SOURCE_CONFIRMED: CounterVec = register_counter_vec!(
        "maker_relayer_source_confirmed_total",
        "Source transfers that reached finality",
        &["chain_id"]
    ).expect("source_confirmed registers once");

    // Payout metrics
    pub static ref TX_SUBMITTED: CounterVec = register_counter_vec!(
        "maker_relayer_payouts_submitted_total",
        "Payouts broadcast",
        &["chain_id"]
    ).expect("payouts_submitted registers once");

    pub static ref TX_FAILED: CounterVec = register_counter_vec!(
        "maker_relayer_payouts_failed_total",
        "Payouts that failed to send",
        &["chain_id", "kind"]
    ).expect("payouts_failed registers once");

    pub static ref TX_CONFIRMED: CounterVec = register_counter_vec!(
        "maker_relayer_payouts_confirmed_total",
        "Payouts confirmed on the destination chain",
        &["chain_id"]
    ).expect("payouts_confirmed registers once");

    pub static ref SEND_ALERTS: CounterVec = register_counter_vec!(
        "maker_relayer_send_alerts_total",
        "Payout failures needing operator attention",
        &["chain_id"]
    ).expect("send_alerts registers once");

    pub static ref QUEUE_DEPTH: GaugeVec = register_gauge_vec!(
        "maker_relayer_send_queue_depth",
        "Send jobs waiting per destination chain",
        &["chain_id"]
    ).expect("send_queue_depth registers once");

    pub static ref RETRY_DRIVES: CounterVec = register_counter_vec!(
        "maker_relayer_retry_drives_total",
        "Retry drive requests by outcome",
        &["outcome"]
    ).expect("retry_drives registers once");

    // Health metrics
    pub static ref HEALTH_CHECK_SUCCESS: CounterVec = register_counter_vec!(
        "maker_relayer_health_check_success_total",
        "Total successful health checks",
        &[]
    ).expect("health_check_success registers once");

    pub static ref HEALTH_CHECK_FAILURE: CounterVec = register_counter_vec!(
        "maker_relayer_health_check_failure_total",
        "Total failed health checks",
        &[]
    ).expect("health_check_failure registers once");
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> RelayerResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| RelayerError::Config(format!("cannot bind metrics port {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| RelayerError::Internal(format!("metrics server stopped: {}", e)))?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, StatusCode> {
    render().map_err(|e| {
        error!("Failed to encode metrics: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

/// Text exposition of every registered metric
pub fn render() -> RelayerResult<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| RelayerError::Internal(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| RelayerError::Internal(e.to_string()))
}

// Helper functions to record metrics

pub fn record_chain_health(chain_id: u64, healthy: bool) {
    CHAIN_CONNECTED
        .with_label_values(&[&chain_id.to_string()])
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_blocks_processed(chain_id: u64, block_number: u64) {
    CHAIN_BLOCK_HEIGHT
        .with_label_values(&[&chain_id.to_string()])
        .set(block_number as f64);
}

pub fn record_adapter_error(kind: &str) {
    ADAPTER_ERRORS.with_label_values(&[kind]).inc();
}

pub fn record_poll_alert() {
    POLL_ALERTS.with_label_values(&[]).inc();
}

pub fn record_transfer_matched(chain_id: u64) {
    TRANSFERS_MATCHED
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_transfer_rejected(chain_id: u64, reason: &str) {
    TRANSFERS_REJECTED
        .with_label_values(&[&chain_id.to_string(), reason])
        .inc();
}

pub fn record_source_confirmed(chain_id: u64) {
    SOURCE_CONFIRMED
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_tx_submitted(chain_id: u64) {
    TX_SUBMITTED
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_tx_failed(chain_id: u64, kind: &str) {
    TX_FAILED
        .with_label_values(&[&chain_id.to_string(), kind])
        .inc();
}

pub fn record_tx_confirmed(chain_id: u64) {
    TX_CONFIRMED
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_send_alert(chain_id: u64) {
    SEND_ALERTS
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_queue_enqueued(chain_id: u64) {
    QUEUE_DEPTH
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_queue_dequeued(chain_id: u64) {
    QUEUE_DEPTH
        .with_label_values(&[&chain_id.to_string()])
        .dec();
}

pub fn record_retry_drive(outcome: &str) {
    RETRY_DRIVES.with_label_values(&[outcome]).inc();
}

pub fn record_health_check() {
    HEALTH_CHECK_SUCCESS.with_label_values(&[]).inc();
}

pub fn record_health_check_failure() {
    HEALTH_CHECK_FAILURE.with_label_values(&[]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recorded_metrics_show_up_in_exposition() {
        record_transfer_rejected(4242, "tag_mismatch");
        record_tx_failed(4242, "insufficient_balance");

        let text = render().unwrap();
        assert!(text.contains("maker_relayer_transfers_rejected_total"));
        assert!(text.contains("reason=\"tag_mismatch\""));
        assert!(text.contains("kind=\"insufficient_balance\""));
    }
}
