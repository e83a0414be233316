use pnet::packet::MutablePacket;
use pnet::packet::icmp::echo_request::MutableEchoRequestPacket;
use pnet::packet::icmp::{IcmpCode, IcmpPacket, IcmpType, IcmpTypes, checksum};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::{self, Ipv4Flags, MutableIpv4Packet};
use std::net::Ipv4Addr;

use crate::error::ProbeError;

/// ICMP echo header size (type, code, checksum, identifier, sequence)
pub const ICMP_HEADER_SIZE: usize = 8;
/// IPv4 header without options
pub const IPV4_HEADER_SIZE: usize = 20;
/// TTL written into self-built IPv4 headers
pub const DEFAULT_TTL: u8 = 64;
/// ICMPv6 Echo Request type
pub const ICMPV6_ECHO_REQUEST: u8 = 128;

/// Largest echo payload that still fits an IPv4 datagram
pub const MAX_PAYLOAD_V4: usize = u16::MAX as usize - IPV4_HEADER_SIZE - ICMP_HEADER_SIZE;
/// Largest echo payload that fits the IPv6 payload length field
pub const MAX_PAYLOAD_V6: usize = u16::MAX as usize - ICMP_HEADER_SIZE;

/// Fixed text at the start of every echo payload
const PAYLOAD_TEXT: &[u8] = b"Prometheus Ping Exporter";

/// Echo payload of exactly `size` bytes: the fixed text, truncated or zero-padded
pub fn build_payload(size: usize) -> Vec<u8> {
    let mut payload = vec![0u8; size];
    let n = size.min(PAYLOAD_TEXT.len());
    payload[..n].copy_from_slice(&PAYLOAD_TEXT[..n]);
    payload
}

/// Build an ICMP (or ICMPv6, with `ipv6`) Echo Request.
///
/// The ICMPv6 checksum covers a pseudo-header only the kernel knows
/// (source address), so it is left zero for the kernel to fill in.
pub fn build_echo_request(
    identifier: u16,
    sequence: u16,
    payload: &[u8],
    ipv6: bool,
) -> Result<Vec<u8>, ProbeError> {
    let max_payload = if ipv6 { MAX_PAYLOAD_V6 } else { MAX_PAYLOAD_V4 };
    if payload.len() > max_payload {
        return Err(ProbeError::Marshal(format!(
            "payload of {} bytes exceeds the {} byte maximum",
            payload.len(),
            max_payload
        )));
    }

    let mut buffer = vec![0u8; ICMP_HEADER_SIZE + payload.len()];
    {
        let mut packet = MutableEchoRequestPacket::new(&mut buffer)
            .ok_or_else(|| ProbeError::Marshal("echo request buffer too small".into()))?;

        if ipv6 {
            packet.set_icmp_type(IcmpType::new(ICMPV6_ECHO_REQUEST));
        } else {
            packet.set_icmp_type(IcmpTypes::EchoRequest);
        }
        packet.set_icmp_code(IcmpCode::new(0));
        packet.set_identifier(identifier);
        packet.set_sequence_number(sequence);
        packet.payload_mut().copy_from_slice(payload);
    }

    if !ipv6 {
        let cksum = IcmpPacket::new(&buffer)
            .map(|p| checksum(&p))
            .ok_or_else(|| ProbeError::Marshal("echo request too short for checksum".into()))?;
        buffer[2..4].copy_from_slice(&cksum.to_be_bytes());
    }

    Ok(buffer)
}

/// Wrap an ICMP message in an IPv4 header with the Don't Fragment flag set.
///
/// An unspecified source lets the kernel fill in the outgoing address.
pub fn build_ipv4_dont_fragment(
    source: Ipv4Addr,
    destination: Ipv4Addr,
    icmp: &[u8],
) -> Result<Vec<u8>, ProbeError> {
    let total_len = IPV4_HEADER_SIZE + icmp.len();
    let total_len_field = u16::try_from(total_len).map_err(|_| {
        ProbeError::Marshal(format!("IPv4 datagram of {} bytes is too large", total_len))
    })?;

    let mut buffer = vec![0u8; total_len];
    let mut packet = MutableIpv4Packet::new(&mut buffer)
        .ok_or_else(|| ProbeError::Marshal("IPv4 buffer too small".into()))?;

    packet.set_version(4);
    packet.set_header_length((IPV4_HEADER_SIZE / 4) as u8);
    packet.set_total_length(total_len_field);
    packet.set_ttl(DEFAULT_TTL);
    packet.set_next_level_protocol(IpNextHeaderProtocols::Icmp);
    packet.set_flags(Ipv4Flags::DontFragment);
    packet.set_source(source);
    packet.set_destination(destination);
    packet.set_payload(icmp);
    let cksum = ipv4::checksum(&packet.to_immutable());
    packet.set_checksum(cksum);

    Ok(buffer)
}
