//! Prometheus metrics for the relay.
//!
//! Connection counts are recorded by the acceptor as sockets come and go.
//! Hub statistics are sampled on a timer and published as absolute values.

use anyhow::{Context, Result};
use courier_core::HubStats;
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::{Ipv4Addr, SocketAddr};
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "courier_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "courier_connections_active";
    pub const HUB_REGISTRATIONS: &str = "courier_hub_registrations_total";
    pub const HUB_DEVICES: &str = "courier_hub_devices_active";
    pub const MESSAGES_RELAYED: &str = "courier_messages_relayed_total";
    pub const FRAMES_DROPPED: &str = "courier_frames_dropped_total";
    pub const ERRORS_TOTAL: &str = "courier_errors_total";
}

const COUNTERS: &[(&str, &str)] = &[
    (names::CONNECTIONS_TOTAL, "Upgraded connections since start"),
    (names::HUB_REGISTRATIONS, "Registrations handled by the hub"),
    (names::MESSAGES_RELAYED, "Relays accepted by at least one device"),
    (names::FRAMES_DROPPED, "Frames dropped on full outbound queues"),
    (names::ERRORS_TOTAL, "Errors by kind"),
];

const GAUGES: &[(&str, &str)] = &[
    (names::CONNECTIONS_ACTIVE, "Open connections"),
    (names::HUB_DEVICES, "Devices registered with the hub"),
];

/// Register metric descriptions.
pub fn init_metrics() {
    for &(name, help) in COUNTERS {
        metrics::describe_counter!(name, help);
    }
    for &(name, help) in GAUGES {
        metrics::describe_gauge!(name, help);
    }
    info!("Metrics initialized");
}

/// Install the Prometheus recorder with an HTTP listener on `port`.
///
/// # Errors
///
/// Returns an error if a recorder is already installed or the listener
/// cannot bind.
pub fn start_metrics_server(port: u16) -> Result<()> {
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .with_context(|| format!("Failed to start metrics listener on {addr}"))?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Publish a hub statistics snapshot.
pub fn record_hub_stats(stats: &HubStats) {
    counter!(names::HUB_REGISTRATIONS).absolute(stats.total_connections);
    gauge!(names::HUB_DEVICES).set(stats.active_connections as f64);
    counter!(names::MESSAGES_RELAYED).absolute(stats.messages_relayed);
    counter!(names::FRAMES_DROPPED).absolute(stats.dropped_frames);
}

pub fn record_error(kind: &'static str) {
    counter!(names::ERRORS_TOTAL, "kind" => kind).increment(1);
}

/// Counts one open connection for as long as it lives.
pub struct ConnectionGauge(());

impl ConnectionGauge {
    #[must_use]
    pub fn open() -> Self {
        counter!(names::CONNECTIONS_TOTAL).increment(1);
        gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
        Self(())
    }
}

impl Drop for ConnectionGauge {
    fn drop(&mut self) {
        gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_recorder() {
        // The facade is a no-op until a recorder is installed.
        init_metrics();
        let gauge = ConnectionGauge::open();
        record_hub_stats(&HubStats::default());
        record_error("auth");
        drop(gauge);
    }

    #[test]
    fn test_every_name_is_described() {
        let described: Vec<&str> = COUNTERS.iter().chain(GAUGES).map(|(n, _)| *n).collect();
        for name in [
            names::CONNECTIONS_TOTAL,
            names::CONNECTIONS_ACTIVE,
            names::HUB_REGISTRATIONS,
            names::HUB_DEVICES,
            names::MESSAGES_RELAYED,
            names::FRAMES_DROPPED,
            names::ERRORS_TOTAL,
        ] {
            assert!(described.contains(&name), "{name} is not described");
        }
    }
}
