use clap::Parser;
use std::net::IpAddr;

use ping_exporter::config::{ExporterConfig, ProbeParams, parse_duration};
use ping_exporter::lookup::AddressFamily;
use ping_exporter::probe::IdentifierMatching;

/// Probe a host with ICMP echoes and print Prometheus metrics about it
#[derive(Parser, Debug, Clone)]
#[command(name = "ping_exporter")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Target to probe (IP address or hostname)
    pub target: String,

    /// Number of echo requests to send
    #[arg(short = 'c', long = "count")]
    pub count: Option<u64>,

    /// Pause between echo requests (e.g. 1s, 250ms)
    #[arg(short = 'i', long = "interval")]
    pub interval: Option<String>,

    /// Echo payload size in bytes
    #[arg(short = 's', long = "packet-size")]
    pub packet_size: Option<u64>,

    /// Overall probe timeout (e.g. 5s)
    #[arg(long = "timeout")]
    pub timeout: Option<String>,

    /// Address family to resolve the target in (ip4, ip6, auto)
    #[arg(long = "ip-protocol", default_value = "ip4")]
    pub ip_protocol: String,

    /// Send from this source address
    #[arg(long = "source-ip")]
    pub source_ip: Option<IpAddr>,

    /// Set the Don't Fragment flag
    #[arg(long = "dont-fragment")]
    pub dont_fragment: bool,

    /// Print the probe trace ahead of the metrics
    #[arg(long = "debug")]
    pub debug: bool,

    /// Print the probe report as JSON instead of metrics
    #[arg(long = "json", conflicts_with = "debug")]
    pub json: bool,

    /// Maximum allowed packet count
    #[arg(long = "ping.max-count", default_value = "100")]
    pub max_count: u64,

    /// Maximum allowed packet size
    #[arg(long = "ping.max-packet-size", default_value = "65507")]
    pub max_packet_size: usize,

    /// Require the echo identifier to match even on unprivileged sockets
    #[arg(long = "strict-identifier")]
    pub strict_identifier: bool,

    /// Log filter (error, warn, info, debug, trace or a tracing directive)
    #[arg(long = "log.level", default_value = "info")]
    pub log_level: String,
}

impl Args {
    /// Exporter limits and policies from the flags
    pub fn exporter_config(&self) -> ExporterConfig {
        ExporterConfig {
            max_count: self.max_count,
            max_packet_size: self.max_packet_size,
            identifier_matching: if self.strict_identifier {
                IdentifierMatching::Strict
            } else {
                IdentifierMatching::SequenceOnlyWhenUnprivileged
            },
            ..ExporterConfig::default()
        }
    }

    /// Probe parameters in the shape the probe endpoint receives them
    pub fn params(&self) -> ProbeParams {
        let mut params = ProbeParams::new();
        params.set("target", self.target.as_str());
        params.set("ip_protocol", self.ip_protocol.as_str());
        if let Some(count) = self.count {
            params.set("count", count.to_string());
        }
        if let Some(ref interval) = self.interval {
            params.set("interval", interval.as_str());
        }
        if let Some(size) = self.packet_size {
            params.set("packet_size", size.to_string());
        }
        if let Some(ref timeout) = self.timeout {
            params.set("timeout", timeout.as_str());
        }
        if let Some(source) = self.source_ip {
            params.set("source_ip", source.to_string());
        }
        if self.dont_fragment {
            params.set("dont_fragment", "true");
        }
        if self.debug {
            params.set("debug", "true");
        }
        params
    }

    /// Validate arguments
    pub fn validate(&self) -> Result<(), String> {
        if self.target.trim().is_empty() {
            return Err("Target cannot be empty".into());
        }

        if self.count == Some(0) {
            return Err("Count must be at least 1".into());
        }

        if self.packet_size == Some(0) {
            return Err("Packet size must be at least 1".into());
        }

        if let Some(ref interval) = self.interval {
            match parse_duration(interval) {
                Ok(d) if d.is_zero() => return Err("Interval must be positive".into()),
                Ok(_) => {}
                Err(e) => return Err(format!("Invalid interval: {}", e)),
            }
        }

        if let Some(ref timeout) = self.timeout {
            match parse_duration(timeout) {
                Ok(d) if d.is_zero() => return Err("Timeout must be positive".into()),
                Ok(_) => {}
                Err(e) => return Err(format!("Invalid timeout: {}", e)),
            }
        }

        let family: AddressFamily = self.ip_protocol.parse()?;

        if let Some(source) = self.source_ip {
            let family_mismatch = match family {
                AddressFamily::Ip4 => source.is_ipv6(),
                AddressFamily::Ip6 => source.is_ipv4(),
                AddressFamily::Auto => false,
            };
            if family_mismatch {
                return Err(format!("Source IP {} does not match ip-protocol {}", source, family));
            }
        }

        if self.max_count == 0 {
            return Err("ping.max-count must be at least 1".into());
        }

        if self.max_packet_size == 0 {
            return Err("ping.max-packet-size must be at least 1".into());
        }

        Ok(())
    }
}
