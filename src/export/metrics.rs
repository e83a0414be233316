use prometheus::{Encoder, Gauge, GaugeVec, Opts, Registry, TextEncoder};
use std::io::Write;

use crate::state::{ProbeReport, ProbeResult};

/// Metric families exposed for every probe
pub const PROBE_SUCCESS: &str = "probe_success";
pub const PROBE_DURATION_SECONDS: &str = "probe_duration_seconds";
/// Metric families exposed only when echoes were sent
pub const PACKETS_SENT: &str = "probe_ping_packets_sent";
pub const PACKETS_RECEIVED: &str = "probe_ping_packets_received";
pub const PACKET_LOSS_RATIO: &str = "probe_ping_packet_loss_ratio";
pub const RTT_SECONDS: &str = "probe_ping_rtt_seconds";

fn register_gauge(
    registry: &Registry,
    name: &str,
    help: &str,
    value: f64,
) -> prometheus::Result<()> {
    let gauge = Gauge::with_opts(Opts::new(name, help))?;
    gauge.set(value);
    registry.register(Box::new(gauge))
}

/// Register packet counters, loss and RTT statistics of a ping
fn register_ping_metrics(registry: &Registry, result: &ProbeResult) -> prometheus::Result<()> {
    register_gauge(registry, PACKETS_SENT, "Number of ICMP packets sent", result.sent as f64)?;
    register_gauge(
        registry,
        PACKETS_RECEIVED,
        "Number of ICMP packets received",
        result.received as f64,
    )?;
    register_gauge(registry, PACKET_LOSS_RATIO, "Packet loss ratio", result.loss_ratio)?;

    let Some(stats) = result.rtt else {
        return Ok(());
    };

    let rtt = GaugeVec::new(
        Opts::new(RTT_SECONDS, "Round-trip time statistics in seconds"),
        &["type"],
    )?;
    rtt.with_label_values(&["best"]).set(stats.best);
    rtt.with_label_values(&["worst"]).set(stats.worst);
    rtt.with_label_values(&["mean"]).set(stats.mean);
    rtt.with_label_values(&["sum"]).set(stats.sum);
    rtt.with_label_values(&["range"]).set(stats.range);
    rtt.with_label_values(&["sd"]).set(stats.sd);
    rtt.with_label_values(&["usd"]).set(stats.usd);
    if let Some(csd) = stats.csd {
        rtt.with_label_values(&["csd"]).set(csd);
    }
    registry.register(Box::new(rtt))
}

/// Build a fresh registry holding the metrics of one probe
pub fn probe_registry(report: &ProbeReport) -> prometheus::Result<Registry> {
    let registry = Registry::new();

    if let Some(result) = &report.result {
        register_ping_metrics(&registry, result)?;
    }
    register_gauge(
        &registry,
        PROBE_DURATION_SECONDS,
        "Returns how long the probe took to complete in seconds",
        report.duration.as_secs_f64(),
    )?;
    register_gauge(
        &registry,
        PROBE_SUCCESS,
        "Displays whether or not the probe was a success",
        if report.success { 1.0 } else { 0.0 },
    )?;

    Ok(registry)
}

/// Write a registry in the Prometheus text exposition format
pub fn write_metrics<W: Write>(registry: &Registry, mut writer: W) -> prometheus::Result<()> {
    let encoder = TextEncoder::new();
    encoder.encode(&registry.gather(), &mut writer)
}

/// Content type of the text exposition format
pub fn content_type() -> String {
    TextEncoder::new().format_type().to_string()
}
