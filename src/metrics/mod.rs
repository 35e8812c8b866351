//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Chain connection status and watcher progress
//! - Bridge events and transfer lifecycle
//! - Signature collection
//! - Destination submissions
//! - Reorgs and critical flags

use crate::error::{RelayerError, RelayerResult};
use crate::types::{EventKind, TransferStatus};

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Chain metrics
    pub static ref CHAIN_CONNECTED: GaugeVec = register_gauge_vec!(
        "nexus_chain_connected",
        "Chain connection status (1=connected, 0=disconnected)",
        &["chain_id"]
    ).unwrap();

    pub static ref CHAIN_PROCESSED_BLOCK: GaugeVec = register_gauge_vec!(
        "nexus_chain_processed_block",
        "Last confirmed block scanned per chain",
        &["chain_id"]
    ).unwrap();

    pub static ref CHAIN_REORGS: CounterVec = register_counter_vec!(
        "nexus_chain_reorgs_total",
        "Total reorganizations detected",
        &["chain_id"]
    ).unwrap();

    // Event metrics
    pub static ref EVENTS_RECEIVED: CounterVec = register_counter_vec!(
        "nexus_events_received_total",
        "Total bridge events received by type",
        &["chain_id", "event_type"]
    ).unwrap();

    pub static ref EVENTS_REJECTED: CounterVec = register_counter_vec!(
        "nexus_events_rejected_total",
        "Bridge events rejected by validation",
        &["chain_id", "error_kind"]
    ).unwrap();

    // Transfer metrics
    pub static ref TRANSFER_TRANSITIONS: CounterVec = register_counter_vec!(
        "nexus_transfer_transitions_total",
        "Transfers entering each status",
        &["status"]
    ).unwrap();

    pub static ref TRANSFERS_BY_STATUS: GaugeVec = register_gauge_vec!(
        "nexus_transfers",
        "Current transfers per status",
        &["status"]
    ).unwrap();

    // Signature metrics
    pub static ref SIGNATURES: CounterVec = register_counter_vec!(
        "nexus_signatures_total",
        "Signatures processed by outcome",
        &["outcome"]
    ).unwrap();

    // Transaction metrics
    pub static ref TX_SUBMITTED: CounterVec = register_counter_vec!(
        "nexus_transactions_submitted_total",
        "Total release transactions submitted",
        &["chain_id"]
    ).unwrap();

    pub static ref TX_FINALIZED: CounterVec = register_counter_vec!(
        "nexus_transactions_finalized_total",
        "Total release transactions finalized",
        &["chain_id"]
    ).unwrap();

    pub static ref TX_FAILED: CounterVec = register_counter_vec!(
        "nexus_transactions_failed_total",
        "Total release transactions failed",
        &["chain_id"]
    ).unwrap();

    pub static ref TX_PENDING: GaugeVec = register_gauge_vec!(
        "nexus_transactions_pending",
        "Release transactions broadcast and not yet final",
        &["chain_id"]
    ).unwrap();

    pub static ref TX_LATENCY: HistogramVec = register_histogram_vec!(
        "nexus_transaction_latency_seconds",
        "Submission to finality latency",
        &["chain_id"],
        vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]
    ).unwrap();

    // Escalation metrics
    pub static ref RETRIES_EXHAUSTED: CounterVec = register_counter_vec!(
        "nexus_retries_exhausted_total",
        "Operations that hit the retry cap",
        &["operation"]
    ).unwrap();

    pub static ref CRITICAL_FLAGS: CounterVec = register_counter_vec!(
        "nexus_critical_flags_total",
        "Conditions requiring operator intervention",
        &["reason"]
    ).unwrap();

    // Health metrics
    pub static ref HEALTH_CHECK_SUCCESS: CounterVec = register_counter_vec!(
        "nexus_health_check_success_total",
        "Total successful health checks",
        &[]
    ).unwrap();

    pub static ref HEALTH_CHECK_FAILURE: CounterVec = register_counter_vec!(
        "nexus_health_check_failure_total",
        "Total failed health checks",
        &[]
    ).unwrap();
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
            .map_err(|e| RelayerError::Config(format!("metrics bind {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| RelayerError::Internal(format!("metrics server: {}", e)))?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, StatusCode> {
    render().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

/// Text exposition of every registered metric
pub fn render() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

// Helper functions to record metrics

pub fn record_chain_health(chain_id: u64, healthy: bool) {
    CHAIN_CONNECTED
        .with_label_values(&[&chain_id.to_string()])
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_blocks_processed(chain_id: u64, block_number: u64) {
    CHAIN_PROCESSED_BLOCK
        .with_label_values(&[&chain_id.to_string()])
        .set(block_number as f64);
}

pub fn record_reorg(chain_id: u64) {
    CHAIN_REORGS.with_label_values(&[&chain_id.to_string()]).inc();
}

pub fn record_event(chain_id: u64, kind: EventKind) {
    EVENTS_RECEIVED
        .with_label_values(&[&chain_id.to_string(), kind.as_str()])
        .inc();
}

pub fn record_event_rejected(chain_id: u64, err: &RelayerError) {
    EVENTS_REJECTED
        .with_label_values(&[&chain_id.to_string(), err.kind().as_str()])
        .inc();
}

pub fn record_transition(status: TransferStatus) {
    TRANSFER_TRANSITIONS
        .with_label_values(&[status.as_str()])
        .inc();
}

pub fn record_transfer_count(status: TransferStatus, count: u64) {
    TRANSFERS_BY_STATUS
        .with_label_values(&[status.as_str()])
        .set(count as f64);
}

/// `outcome` is one of own, accepted, duplicate, unauthorized, invalid
pub fn record_signature(outcome: &str) {
    SIGNATURES.with_label_values(&[outcome]).inc();
}

pub fn record_tx_submitted(chain_id: u64) {
    TX_SUBMITTED
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_tx_finalized(chain_id: u64) {
    TX_FINALIZED
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_tx_failed(chain_id: u64) {
    TX_FAILED
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_tx_pending(chain_id: u64, count: usize) {
    TX_PENDING
        .with_label_values(&[&chain_id.to_string()])
        .set(count as f64);
}

pub fn record_tx_latency(chain_id: u64, latency_secs: f64) {
    TX_LATENCY
        .with_label_values(&[&chain_id.to_string()])
        .observe(latency_secs);
}

pub fn record_retries_exhausted(operation: &str) {
    RETRIES_EXHAUSTED.with_label_values(&[operation]).inc();
}

pub fn record_critical(reason: &str) {
    CRITICAL_FLAGS.with_label_values(&[reason]).inc();
}

pub fn record_health_check() {
    HEALTH_CHECK_SUCCESS.with_label_values(&[]).inc();
}

pub fn record_health_check_failure() {
    HEALTH_CHECK_FAILURE.with_label_values(&[]).inc();
}
