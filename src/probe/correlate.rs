use pnet::packet::icmp::{IcmpPacket, IcmpTypes};
use pnet::packet::ipv4::Ipv4Packet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

use crate::lookup::ResolvedTarget;
use crate::probe::icmp::ICMP_HEADER_SIZE;
use crate::probe::socket::TransportMode;

// IP protocol numbers
const IPPROTO_ICMP: u8 = 1;

// ICMPv6 Echo Reply type
const ICMPV6_ECHO_REPLY: u8 = 129;

/// How strictly the identifier of an Echo Reply is checked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IdentifierMatching {
    /// Identifier and sequence must both match
    Strict,
    /// Skip the identifier on unprivileged datagram sockets, where the
    /// kernel substitutes its own
    #[default]
    SequenceOnlyWhenUnprivileged,
}

impl IdentifierMatching {
    /// Whether replies on a socket of this mode must carry our identifier
    pub fn checks_identifier(&self, mode: TransportMode) -> bool {
        match self {
            IdentifierMatching::Strict => true,
            IdentifierMatching::SequenceOnlyWhenUnprivileged => !mode.rewrites_identifier(),
        }
    }
}

/// Identifier and sequence of an accepted Echo Reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EchoReply {
    pub identifier: u16,
    pub sequence: u16,
}

/// Why a received packet was not the reply we wait for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discard {
    UnexpectedSource,
    Malformed,
    WrongProtocol,
    WrongType(u8),
    BadChecksum,
    WrongIdentifier(u16),
    WrongSequence(u16),
}

impl fmt::Display for Discard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Discard::UnexpectedSource => write!(f, "reply from unexpected source"),
            Discard::Malformed => write!(f, "malformed ICMP message"),
            Discard::WrongProtocol => write!(f, "IP payload is not ICMP"),
            Discard::WrongType(t) => write!(f, "ICMP type {} is not an echo reply", t),
            Discard::BadChecksum => write!(f, "invalid ICMP checksum"),
            Discard::WrongIdentifier(id) => write!(f, "identifier {} is not ours", id),
            Discard::WrongSequence(seq) => write!(f, "sequence {} is not the one in flight", seq),
        }
    }
}

/// Calculate ICMP checksum (RFC 1071)
/// Returns true if checksum is valid (sums to 0xFFFF or 0x0000 after folding)
fn validate_icmp_checksum(data: &[u8]) -> bool {
    if data.len() < 4 {
        return false;
    }

    let mut sum: u32 = 0;
    let mut words = data.chunks_exact(2);
    for word in &mut words {
        sum += u16::from_be_bytes([word[0], word[1]]) as u32;
    }
    if let [last] = words.remainder() {
        sum += (*last as u32) << 8;
    }

    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    sum == 0xFFFF || sum == 0x0000
}

/// Locate the ICMP message in a received datagram.
///
/// Raw IPv4 sockets prepend the IP header; everything else starts at ICMP.
pub fn icmp_message(data: &[u8], has_ip_header: bool) -> Result<&[u8], Discard> {
    if !has_ip_header {
        return Ok(data);
    }

    let ip_packet = Ipv4Packet::new(data).ok_or(Discard::Malformed)?;
    let ip_header_len = (ip_packet.get_header_length() as usize) * 4;
    if ip_header_len < 20 || data.len() < ip_header_len {
        return Err(Discard::Malformed);
    }
    if ip_packet.get_next_level_protocol().0 != IPPROTO_ICMP {
        return Err(Discard::WrongProtocol);
    }
    Ok(&data[ip_header_len..])
}

/// Parse an ICMP or ICMPv6 Echo Reply, returning its identifier and sequence
pub fn parse_echo_reply(icmp: &[u8], ipv6: bool) -> Result<EchoReply, Discard> {
    if icmp.len() < ICMP_HEADER_SIZE {
        return Err(Discard::Malformed);
    }

    if ipv6 {
        if icmp[0] != ICMPV6_ECHO_REPLY {
            return Err(Discard::WrongType(icmp[0]));
        }
    } else {
        let packet = IcmpPacket::new(icmp).ok_or(Discard::Malformed)?;
        let icmp_type = packet.get_icmp_type();
        if icmp_type != IcmpTypes::EchoReply {
            return Err(Discard::WrongType(icmp_type.0));
        }
        // ICMPv6 checksums are verified by the kernel
        if !validate_icmp_checksum(icmp) {
            return Err(Discard::BadChecksum);
        }
    }

    Ok(EchoReply {
        identifier: u16::from_be_bytes([icmp[4], icmp[5]]),
        sequence: u16::from_be_bytes([icmp[6], icmp[7]]),
    })
}

/// Decides whether a received datagram answers the echo in flight
#[derive(Debug, Clone)]
pub struct ReplyMatcher<'a> {
    target: &'a ResolvedTarget,
    identifier: u16,
    sequence: u16,
    check_identifier: bool,
    has_ip_header: bool,
}

impl<'a> ReplyMatcher<'a> {
    pub fn new(
        target: &'a ResolvedTarget,
        mode: TransportMode,
        matching: IdentifierMatching,
        identifier: u16,
        sequence: u16,
    ) -> Self {
        Self {
            target,
            identifier,
            sequence,
            check_identifier: matching.checks_identifier(mode),
            has_ip_header: mode.delivers_ip_header(target.is_ipv6()),
        }
    }

    /// Check one datagram: source, then protocol, then type, then echo body
    pub fn check(&self, source: &SocketAddr, data: &[u8]) -> Result<EchoReply, Discard> {
        if !self.target.matches_source(source) {
            return Err(Discard::UnexpectedSource);
        }

        let icmp = icmp_message(data, self.has_ip_header)?;
        let reply = parse_echo_reply(icmp, self.target.is_ipv6())?;

        if self.check_identifier && reply.identifier != self.identifier {
            return Err(Discard::WrongIdentifier(reply.identifier));
        }
        if reply.sequence != self.sequence {
            return Err(Discard::WrongSequence(reply.sequence));
        }
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::icmp::{build_echo_request, build_payload};
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddrV6};

    /// Turn a v4 echo request into the matching reply
    fn echo_reply_v4(identifier: u16, sequence: u16) -> Vec<u8> {
        let mut packet =
            build_echo_request(identifier, sequence, &build_payload(16), false).unwrap();
        packet[0] = 0;
        packet[2] = 0;
        packet[3] = 0;
        let cksum = IcmpPacket::new(&packet)
            .map(|p| pnet::packet::icmp::checksum(&p))
            .unwrap();
        packet[2..4].copy_from_slice(&cksum.to_be_bytes());
        packet
    }

    fn echo_reply_v6(identifier: u16, sequence: u16) -> Vec<u8> {
        let mut packet =
            build_echo_request(identifier, sequence, &build_payload(16), true).unwrap();
        packet[0] = ICMPV6_ECHO_REPLY;
        packet
    }

    fn with_ipv4_header(icmp: &[u8], protocol: u8) -> Vec<u8> {
        let mut packet = vec![0u8; 20];
        packet[0] = 0x45;
        packet[9] = protocol;
        packet.extend_from_slice(icmp);
        packet
    }

    fn v4_target() -> ResolvedTarget {
        ResolvedTarget::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)))
    }

    fn v4_source() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)), 0)
    }

    #[test]
    fn test_strict_always_checks_identifier() {
        assert!(IdentifierMatching::Strict.checks_identifier(TransportMode::UnprivilegedDgram));
        assert!(IdentifierMatching::Strict.checks_identifier(TransportMode::PrivilegedRaw));
    }

    #[test]
    fn test_default_checks_identifier_on_raw_sockets() {
        let matching = IdentifierMatching::default();
        assert!(matching.checks_identifier(TransportMode::PrivilegedRaw));
        assert!(matching.checks_identifier(TransportMode::RawDontFragment));
        assert!(!matching.checks_identifier(TransportMode::UnprivilegedDgram));
    }

    #[test]
    fn test_parse_echo_reply_v4() {
        let reply = parse_echo_reply(&echo_reply_v4(0x1234, 7), false).unwrap();
        assert_eq!(reply.identifier, 0x1234);
        assert_eq!(reply.sequence, 7);
    }

    #[test]
    fn test_parse_echo_reply_rejects_request() {
        let request = build_echo_request(1, 1, &build_payload(8), false).unwrap();
        assert_eq!(parse_echo_reply(&request, false), Err(Discard::WrongType(8)));
    }

    #[test]
    fn test_parse_echo_reply_rejects_bad_checksum() {
        let mut packet = echo_reply_v4(1, 1);
        packet[2] ^= 0xFF;
        assert_eq!(parse_echo_reply(&packet, false), Err(Discard::BadChecksum));
    }

    #[test]
    fn test_parse_echo_reply_short() {
        assert_eq!(parse_echo_reply(&[0, 0, 0], false), Err(Discard::Malformed));
        assert_eq!(parse_echo_reply(&[129, 0, 0, 0], true), Err(Discard::Malformed));
    }

    #[test]
    fn test_parse_echo_reply_v6() {
        let reply = parse_echo_reply(&echo_reply_v6(42, 9), true).unwrap();
        assert_eq!(reply, EchoReply { identifier: 42, sequence: 9 });
        assert_eq!(
            parse_echo_reply(&build_echo_request(42, 9, &[], true).unwrap(), true),
            Err(Discard::WrongType(128))
        );
    }

    #[test]
    fn test_icmp_message_strips_header() {
        let icmp = echo_reply_v4(1, 2);
        let packet = with_ipv4_header(&icmp, IPPROTO_ICMP);
        assert_eq!(icmp_message(&packet, true).unwrap(), icmp.as_slice());
        assert_eq!(icmp_message(&icmp, false).unwrap(), icmp.as_slice());
    }

    #[test]
    fn test_icmp_message_rejects_other_protocol() {
        let packet = with_ipv4_header(&echo_reply_v4(1, 2), 17);
        assert_eq!(icmp_message(&packet, true), Err(Discard::WrongProtocol));
    }

    #[test]
    fn test_matcher_accepts_matching_reply() {
        let target = v4_target();
        let matcher = ReplyMatcher::new(
            &target,
            TransportMode::PrivilegedRaw,
            IdentifierMatching::Strict,
            0xAAAA,
            5,
        );
        let packet = with_ipv4_header(&echo_reply_v4(0xAAAA, 5), IPPROTO_ICMP);
        assert_eq!(
            matcher.check(&v4_source(), &packet),
            Ok(EchoReply { identifier: 0xAAAA, sequence: 5 })
        );
    }

    #[test]
    fn test_matcher_rejects_wrong_source_first() {
        let target = v4_target();
        let matcher = ReplyMatcher::new(
            &target,
            TransportMode::PrivilegedRaw,
            IdentifierMatching::Strict,
            1,
            1,
        );
        let other = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(198, 51, 100, 1)), 0);
        // Garbage payload: the source check must reject before parsing
        assert_eq!(matcher.check(&other, &[0xFF; 3]), Err(Discard::UnexpectedSource));
    }

    #[test]
    fn test_matcher_rejects_wrong_identifier_and_sequence() {
        let target = v4_target();
        let matcher = ReplyMatcher::new(
            &target,
            TransportMode::PrivilegedRaw,
            IdentifierMatching::Strict,
            10,
            20,
        );
        let wrong_id = with_ipv4_header(&echo_reply_v4(11, 20), IPPROTO_ICMP);
        assert_eq!(matcher.check(&v4_source(), &wrong_id), Err(Discard::WrongIdentifier(11)));

        let wrong_seq = with_ipv4_header(&echo_reply_v4(10, 21), IPPROTO_ICMP);
        assert_eq!(matcher.check(&v4_source(), &wrong_seq), Err(Discard::WrongSequence(21)));
    }

    #[test]
    fn test_matcher_dgram_has_no_ip_header() {
        let target = v4_target();
        let matcher = ReplyMatcher::new(
            &target,
            TransportMode::UnprivilegedDgram,
            IdentifierMatching::Strict,
            3,
            4,
        );
        assert!(matcher.check(&v4_source(), &echo_reply_v4(3, 4)).is_ok());
    }

    #[test]
    fn test_matcher_dgram_ignores_kernel_identifier() {
        let target = v4_target();
        let matcher = ReplyMatcher::new(
            &target,
            TransportMode::UnprivilegedDgram,
            IdentifierMatching::SequenceOnlyWhenUnprivileged,
            3,
            4,
        );
        // Kernel substituted identifier 999
        let reply = matcher.check(&v4_source(), &echo_reply_v4(999, 4)).unwrap();
        assert_eq!(reply.identifier, 999);
    }

    #[test]
    fn test_matcher_v6_zone() {
        let ip = "fe80::1".parse::<Ipv6Addr>().unwrap();
        let target = ResolvedTarget {
            ip: IpAddr::V6(ip),
            zone: Some("eth0".to_string()),
            scope_id: 2,
        };
        let matcher = ReplyMatcher::new(
            &target,
            TransportMode::PrivilegedRaw,
            IdentifierMatching::Strict,
            1,
            2,
        );
        let packet = echo_reply_v6(1, 2);

        let same_zone = SocketAddr::V6(SocketAddrV6::new(ip, 0, 0, 2));
        assert!(matcher.check(&same_zone, &packet).is_ok());

        let other_zone = SocketAddr::V6(SocketAddrV6::new(ip, 0, 0, 3));
        assert_eq!(matcher.check(&other_zone, &packet), Err(Discard::UnexpectedSource));
    }

    // Property-based tests (proptest)
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn proptest_matcher_no_panic(
            data in prop::collection::vec(0u8..=255, 0..1500),
            raw in any::<bool>(),
        ) {
            let target = v4_target();
            let mode = if raw {
                TransportMode::PrivilegedRaw
            } else {
                TransportMode::UnprivilegedDgram
            };
            let matcher = ReplyMatcher::new(&target, mode, IdentifierMatching::Strict, 1, 1);
            let _ = matcher.check(&v4_source(), &data);
        }

        #[test]
        fn proptest_ipv4_header_length(
            ihl in 0u8..=15,
            rest in prop::collection::vec(0u8..=255, 19..100),
        ) {
            let mut data = vec![0x40 | ihl];
            data.extend(rest);
            let _ = icmp_message(&data, true);
        }
    }
}
