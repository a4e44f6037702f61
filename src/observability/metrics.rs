//! Metrics collection and exposition.
//!
//! # Metrics
//! - `grpc_downgrade_requests_total` (counter): server-side classification outcome
//! - `grpc_downgrade_frames_decoded_total` (counter): web frames decoded, by kind
//! - `grpc_downgrade_framing_errors_total` (counter): decode failures, by reason
//! - `grpc_downgrade_side_channel_handshakes_total` (counter): by result
//! - `grpc_downgrade_proxy_connections_total` (counter): connections served
//!
//! Recording is a no-op until a recorder is installed (see [`init_metrics`]).

use std::net::SocketAddr;

use metrics::counter;
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus exporter on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(error = %e, "Failed to install metrics exporter"),
    }
}

/// Record how the server handler classified a request.
pub fn record_request(outcome: &'static str) {
    counter!("grpc_downgrade_requests_total", "outcome" => outcome).increment(1);
}

pub fn record_frame_decoded(kind: &'static str) {
    counter!("grpc_downgrade_frames_decoded_total", "kind" => kind).increment(1);
}

pub fn record_framing_error(reason: &'static str) {
    counter!("grpc_downgrade_framing_errors_total", "reason" => reason).increment(1);
}

pub fn record_handshake(result: &'static str) {
    counter!("grpc_downgrade_side_channel_handshakes_total", "result" => result).increment(1);
}

pub fn record_connection() {
    counter!("grpc_downgrade_proxy_connections_total").increment(1);
}
