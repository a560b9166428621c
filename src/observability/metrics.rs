//! Metrics collection and exposition.
//!
//! # Metrics
//! - `event_server_requests_total` (counter): requests by status
//! - `event_server_request_duration_seconds` (histogram): time from queue to response
//! - `event_server_active_connections` (gauge): open TCP connections
//! - `event_server_queue_rejections_total` (counter): 503/404/401 before dispatch, by reason
//! - `event_server_events_posted_total` (counter): events accepted by channels
//! - `event_server_events_delivered_total` (counter): deliveries by transport
//! - `event_server_transport_failures_total` (counter): failed writes by transport
//! - `event_server_websocket_frames_total` (counter): frames by direction
//!
//! Without an installed recorder every call is a no-op.

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder and its scrape endpoint.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_request(status: u16, start: Instant) {
    counter!("event_server_requests_total", "status" => status.to_string()).increment(1);
    histogram!("event_server_request_duration_seconds").record(start.elapsed().as_secs_f64());
}

pub fn record_connection_opened() {
    gauge!("event_server_active_connections").increment(1.0);
}

pub fn record_connection_closed() {
    gauge!("event_server_active_connections").decrement(1.0);
}

pub fn record_queue_rejection(reason: &'static str) {
    counter!("event_server_queue_rejections_total", "reason" => reason).increment(1);
}

pub fn record_event_posted() {
    counter!("event_server_events_posted_total").increment(1);
}

pub fn record_event_delivered(transport: &'static str) {
    counter!("event_server_events_delivered_total", "transport" => transport).increment(1);
}

pub fn record_transport_failure(transport: &'static str) {
    counter!("event_server_transport_failures_total", "transport" => transport).increment(1);
}

pub fn record_frame(direction: &'static str) {
    counter!("event_server_websocket_frames_total", "direction" => direction).increment(1);
}
