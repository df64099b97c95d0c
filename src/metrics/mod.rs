//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Chain connection status and scanned heights
//! - Deposit lifecycle counts and relay latency
//! - Distribution submissions and retries

use crate::error::{RelayerError, RelayerResult};

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::{error, info};

lazy_static! {
    // Chain metrics
    pub static ref CHAIN_CONNECTED: GaugeVec = register_gauge_vec!(
        "relayer_chain_connected",
        "Chain connection status (1=connected, 0=disconnected)",
        &["chain_id"]
    ).unwrap();

    pub static ref CHAIN_BLOCK_HEIGHT: GaugeVec = register_gauge_vec!(
        "relayer_chain_block_height",
        "Latest head seen per chain",
        &["chain_id"]
    ).unwrap();

    pub static ref WATCHER_ERRORS: CounterVec = register_counter_vec!(
        "relayer_watcher_errors_total",
        "Scan passes that ended in an error",
        &["chain_id"]
    ).unwrap();

    // Deposit metrics
    pub static ref DEPOSITS_OBSERVED: CounterVec = register_counter_vec!(
        "relayer_deposits_observed_total",
        "New deposits recorded",
        &["source_chain"]
    ).unwrap();

    pub static ref DEPOSITS_CONFIRMED: CounterVec = register_counter_vec!(
        "relayer_deposits_confirmed_total",
        "Deposits that reached confirmation depth",
        &["source_chain"]
    ).unwrap();

    pub static ref DEPOSITS_COMPLETED: CounterVec = register_counter_vec!(
        "relayer_deposits_completed_total",
        "Deposits distributed on the destination chain",
        &["source_chain", "target_chain"]
    ).unwrap();

    pub static ref DEPOSITS_FAILED: CounterVec = register_counter_vec!(
        "relayer_deposits_failed_total",
        "Deposits moved to failed",
        &["source_chain", "stage"]
    ).unwrap();

    pub static ref RELAY_LATENCY: HistogramVec = register_histogram_vec!(
        "relayer_deposit_latency_seconds",
        "Time from first observation to completed distribution",
        &["source_chain", "target_chain"],
        vec![5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0]
    ).unwrap();

    // Transaction metrics
    pub static ref TX_SUBMITTED: CounterVec = register_counter_vec!(
        "relayer_distributions_submitted_total",
        "Distribution transactions broadcast",
        &["chain_id"]
    ).unwrap();

    pub static ref TX_RETRIES: CounterVec = register_counter_vec!(
        "relayer_distribution_retries_total",
        "Distribution attempts retried after a transient failure",
        &["chain_id"]
    ).unwrap();

    // Health metrics
    pub static ref HEALTH_CHECK_SUCCESS: CounterVec = register_counter_vec!(
        "relayer_health_check_success_total",
        "Total successful health checks",
        &[]
    ).unwrap();

    pub static ref HEALTH_CHECK_FAILURE: CounterVec = register_counter_vec!(
        "relayer_health_check_failure_total",
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
            .map_err(|e| RelayerError::Config(format!("cannot bind metrics on {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| RelayerError::Internal(format!("metrics server: {}", e)))?;

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
pub fn render() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

// Helper functions to record metrics

pub fn record_chain_health(chain_id: u64, healthy: bool) {
    CHAIN_CONNECTED
        .with_label_values(&[&chain_id.to_string()])
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_chain_height(chain_id: u64, block_number: u64) {
    CHAIN_BLOCK_HEIGHT
        .with_label_values(&[&chain_id.to_string()])
        .set(block_number as f64);
}

pub fn record_watcher_error(chain_id: u64) {
    WATCHER_ERRORS
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_deposit_observed(source_chain: u64) {
    DEPOSITS_OBSERVED
        .with_label_values(&[&source_chain.to_string()])
        .inc();
}

pub fn record_deposit_confirmed(source_chain: u64) {
    DEPOSITS_CONFIRMED
        .with_label_values(&[&source_chain.to_string()])
        .inc();
}

pub fn record_deposit_completed(source_chain: u64, target_chain: u64, latency_secs: f64) {
    let labels = [source_chain.to_string(), target_chain.to_string()];
    DEPOSITS_COMPLETED
        .with_label_values(&[&labels[0], &labels[1]])
        .inc();
    RELAY_LATENCY
        .with_label_values(&[&labels[0], &labels[1]])
        .observe(latency_secs);
}

pub fn record_deposit_failed(source_chain: u64, stage: &str) {
    DEPOSITS_FAILED
        .with_label_values(&[&source_chain.to_string(), stage])
        .inc();
}

pub fn record_tx_submitted(chain_id: u64) {
    TX_SUBMITTED
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_distribution_retry(chain_id: u64) {
    TX_RETRIES
        .with_label_values(&[&chain_id.to_string()])
        .inc();
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
    fn test_render_contains_recorded_metrics() {
        record_deposit_observed(17000);
        record_deposit_completed(17000, 8453, 42.0);

        let text = render().unwrap();
        assert!(text.contains("relayer_deposits_observed_total"));
        assert!(text.contains("relayer_deposit_latency_seconds"));
    }
}
