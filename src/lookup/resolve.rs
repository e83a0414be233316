use serde::{Deserialize, Serialize};
use std::ffi::CString;
use std::fmt;
use std::net::{IpAddr, Ipv6Addr, SocketAddr, SocketAddrV6};
use std::str::FromStr;
use tracing::debug;

use crate::error::ProbeError;

/// Address family preference for target resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    #[default]
    Ip4,
    Ip6,
    /// Whatever the platform resolver returns first
    Auto,
}

impl AddressFamily {
    fn accepts(&self, ip: &IpAddr) -> bool {
        match self {
            AddressFamily::Ip4 => ip.is_ipv4(),
            AddressFamily::Ip6 => ip.is_ipv6(),
            AddressFamily::Auto => true,
        }
    }
}

impl FromStr for AddressFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ip4" | "v4" | "ipv4" | "4" => Ok(AddressFamily::Ip4),
            "ip6" | "v6" | "ipv6" | "6" => Ok(AddressFamily::Ip6),
            "auto" | "ip" => Ok(AddressFamily::Auto),
            other => Err(format!("Unknown address family: {}. Use ip4, ip6 or auto", other)),
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AddressFamily::Ip4 => "ip4",
            AddressFamily::Ip6 => "ip6",
            AddressFamily::Auto => "auto",
        };
        f.write_str(name)
    }
}

/// Concrete address a probe is sent to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    pub ip: IpAddr,
    /// IPv6 zone as written by the caller (e.g. `eth0` in `fe80::1%eth0`)
    pub zone: Option<String>,
    /// Interface index for the zone, 0 when unscoped
    pub scope_id: u32,
}

impl ResolvedTarget {
    pub fn new(ip: IpAddr) -> Self {
        Self {
            ip,
            zone: None,
            scope_id: 0,
        }
    }

    pub fn is_ipv6(&self) -> bool {
        self.ip.is_ipv6()
    }

    /// Socket address for sendto (port is ignored by ICMP sockets)
    pub fn socket_addr(&self) -> SocketAddr {
        match self.ip {
            IpAddr::V4(_) => SocketAddr::new(self.ip, 0),
            IpAddr::V6(v6) => SocketAddr::V6(SocketAddrV6::new(v6, 0, 0, self.scope_id)),
        }
    }

    /// Does a packet received from `source` originate from this target?
    ///
    /// The zone only takes part in the comparison when both sides carry one.
    pub fn matches_source(&self, source: &SocketAddr) -> bool {
        if source.ip() != self.ip {
            return false;
        }
        match source {
            SocketAddr::V6(v6) if self.scope_id != 0 && v6.scope_id() != 0 => {
                v6.scope_id() == self.scope_id
            }
            _ => true,
        }
    }
}

impl fmt::Display for ResolvedTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.zone {
            Some(zone) => write!(f, "{}%{}", self.ip, zone),
            None => write!(f, "{}", self.ip),
        }
    }
}

/// Resolve a target string within the requested address family.
///
/// IP literals (including scoped IPv6 literals) are used as-is. Names go
/// through the system resolver; with `Auto` the first address it returns
/// wins. Nothing is retried.
pub async fn resolve_target(
    target: &str,
    family: AddressFamily,
) -> Result<ResolvedTarget, ProbeError> {
    let literal = target.trim().trim_start_matches('[').trim_end_matches(']');
    if literal.is_empty() {
        return Err(ProbeError::resolution(target, "empty target"));
    }

    if let Some(resolved) = parse_literal(literal).map_err(|e| ProbeError::resolution(target, e))? {
        if !family.accepts(&resolved.ip) {
            return Err(ProbeError::resolution(
                target,
                format!("address {} is not in family {}", resolved, family),
            ));
        }
        return Ok(resolved);
    }

    let addrs: Vec<IpAddr> = tokio::net::lookup_host((literal, 0))
        .await
        .map_err(|e| ProbeError::resolution(target, e))?
        .map(|s| s.ip())
        .collect();

    debug!(host = target, ?addrs, "Name lookup returned addresses");

    addrs
        .into_iter()
        .find(|ip| family.accepts(ip))
        .map(ResolvedTarget::new)
        .ok_or_else(|| ProbeError::resolution(target, format!("no {} address found", family)))
}

/// Parse an IP literal; `Ok(None)` means "not a literal, try DNS"
fn parse_literal(s: &str) -> Result<Option<ResolvedTarget>, String> {
    if let Ok(ip) = s.parse::<IpAddr>() {
        return Ok(Some(ResolvedTarget::new(ip)));
    }

    let Some((addr, zone)) = s.split_once('%') else {
        return Ok(None);
    };
    let Ok(ip) = addr.parse::<Ipv6Addr>() else {
        return Ok(None);
    };
    if zone.is_empty() {
        return Err("empty IPv6 zone".to_string());
    }

    Ok(Some(ResolvedTarget {
        ip: IpAddr::V6(ip),
        zone: Some(zone.to_string()),
        scope_id: zone_to_scope_id(zone)?,
    }))
}

/// Map a zone (interface name or numeric index) to a scope id
fn zone_to_scope_id(zone: &str) -> Result<u32, String> {
    if let Ok(index) = zone.parse::<u32>() {
        return Ok(index);
    }
    let name = CString::new(zone).map_err(|_| format!("invalid zone: {}", zone))?;
    // SAFETY: `name` is a valid NUL-terminated string for the duration of the call
    let index = unsafe { libc::if_nametoindex(name.as_ptr()) };
    if index == 0 {
        return Err(format!("unknown interface for zone: {}", zone));
    }
    Ok(index)
}
