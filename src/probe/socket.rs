use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::fmt;
use std::io;
use std::mem::MaybeUninit;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::Interest;
use tokio::io::unix::AsyncFd;
use tracing::{debug, info};

use crate::error::ProbeError;
use crate::lookup::ResolvedTarget;
use crate::probe::icmp::build_ipv4_dont_fragment;

/// How the transport talks ICMP
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportMode {
    /// Raw ICMP socket (needs CAP_NET_RAW or root)
    PrivilegedRaw,
    /// SOCK_DGRAM ICMP socket (ping_group_range on Linux)
    UnprivilegedDgram,
    /// Raw IPv4 socket writing its own header with the DF bit set
    RawDontFragment,
}

impl TransportMode {
    pub fn is_privileged(&self) -> bool {
        !matches!(self, TransportMode::UnprivilegedDgram)
    }

    /// Unprivileged ICMP sockets own the identifier field; the kernel
    /// replaces whatever we put there with its own port-like id.
    pub fn rewrites_identifier(&self) -> bool {
        matches!(self, TransportMode::UnprivilegedDgram)
    }

    /// Raw IPv4 sockets hand us the IP header in front of the ICMP message
    pub fn delivers_ip_header(&self, ipv6: bool) -> bool {
        !ipv6 && self.is_privileged()
    }
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportMode::PrivilegedRaw => "privileged",
            TransportMode::UnprivilegedDgram => "unprivileged",
            TransportMode::RawDontFragment => "privileged-dont-fragment",
        };
        f.write_str(name)
    }
}

/// Socket modes to try, in order, for a target family and DF request.
///
/// - IPv6: raw first, datagram fallback
/// - IPv4 with DF: raw header write only, DF cannot be honored otherwise
/// - IPv4: datagram first (no privilege needed), raw fallback
pub fn transport_ladder(ipv6: bool, dont_fragment: bool) -> &'static [TransportMode] {
    const V6: &[TransportMode] = &[TransportMode::PrivilegedRaw, TransportMode::UnprivilegedDgram];
    const V4_DF: &[TransportMode] = &[TransportMode::RawDontFragment];
    const V4: &[TransportMode] = &[TransportMode::UnprivilegedDgram, TransportMode::PrivilegedRaw];

    if ipv6 {
        V6
    } else if dont_fragment {
        V4_DF
    } else {
        V4
    }
}

/// An open ICMP socket owned by a single probe. Closed on drop.
pub struct Transport {
    socket: AsyncFd<Socket>,
    mode: TransportMode,
    ipv6: bool,
    /// Source for self-built IPv4 headers (unspecified lets the kernel pick)
    source: Ipv4Addr,
}

impl Transport {
    /// Open the first transport mode the environment permits
    pub fn open(
        target: &ResolvedTarget,
        source: Option<IpAddr>,
        dont_fragment: bool,
    ) -> Result<Self, ProbeError> {
        let ipv6 = target.is_ipv6();
        if let Some(src) = source
            && src.is_ipv6() != ipv6
        {
            return Err(ProbeError::Transport(format!(
                "source address {} does not match the family of target {}",
                src, target
            )));
        }

        let mut failures = Vec::new();
        for &mode in transport_ladder(ipv6, dont_fragment) {
            match open_socket(mode, ipv6, source, dont_fragment) {
                Ok(socket) => {
                    let interest = Interest::READABLE | Interest::WRITABLE;
                    let socket = AsyncFd::with_interest(socket, interest).map_err(|e| {
                        ProbeError::Transport(format!("failed to register socket: {}", e))
                    })?;
                    info!(%mode, ipv6, "Using {} ICMP socket", mode);
                    let source = match source {
                        Some(IpAddr::V4(v4)) => v4,
                        _ => Ipv4Addr::UNSPECIFIED,
                    };
                    return Ok(Self {
                        socket,
                        mode,
                        ipv6,
                        source,
                    });
                }
                Err(e) => {
                    debug!(%mode, ipv6, error = %e, "Failed to open ICMP socket, trying next mode");
                    failures.push(format!("{}: {}", mode, e));
                }
            }
        }

        Err(ProbeError::Transport(format!(
            "{}.\n\n\
             Fix options:\n\
             \u{2022} Run with CAP_NET_RAW: sudo setcap cap_net_raw+ep <binary>\n\
             \u{2022} Enable unprivileged ICMP: \
             sudo sysctl -w net.ipv4.ping_group_range='0 2147483647'",
            failures.join("; ")
        )))
    }

    pub fn mode(&self) -> TransportMode {
        self.mode
    }

    pub fn is_ipv6(&self) -> bool {
        self.ipv6
    }

    /// Send one serialized ICMP message to the target
    pub async fn send(&self, icmp: &[u8], target: &ResolvedTarget) -> Result<(), ProbeError> {
        let packet;
        let bytes = match (self.mode, target.ip) {
            (TransportMode::RawDontFragment, IpAddr::V4(dst)) => {
                packet = build_ipv4_dont_fragment(self.source, dst, icmp)?;
                packet.as_slice()
            }
            _ => icmp,
        };
        let addr = SockAddr::from(target.socket_addr());

        loop {
            let mut guard = self.socket.writable().await.map_err(ProbeError::Send)?;
            match guard.try_io(|inner| inner.get_ref().send_to(bytes, &addr)) {
                Ok(result) => return result.map(|_| ()).map_err(ProbeError::Send),
                Err(_would_block) => continue,
            }
        }
    }

    /// Receive one datagram, returning its length and source
    pub async fn recv(&self, buffer: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        loop {
            let mut guard = self.socket.readable().await?;
            match guard.try_io(|inner| recv_from(inner.get_ref(), buffer)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        debug!(mode = %self.mode, "Closing ICMP socket");
    }
}

fn recv_from(socket: &Socket, buffer: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
    // SAFETY: MaybeUninit<u8> has the layout of u8, and the buffer is already
    // initialized, so viewing it as possibly-uninitialized is sound
    let uninit = unsafe { &mut *(buffer as *mut [u8] as *mut [MaybeUninit<u8>]) };
    let (len, addr) = socket.recv_from(uninit)?;
    let source = addr
        .as_socket()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "non-IP source address"))?;
    Ok((len, source))
}

/// Create and configure a socket for one transport mode
fn open_socket(
    mode: TransportMode,
    ipv6: bool,
    source: Option<IpAddr>,
    dont_fragment: bool,
) -> io::Result<Socket> {
    let socket = match (mode, ipv6) {
        (TransportMode::PrivilegedRaw, false) => create_raw_icmp_socket(false)?,
        (TransportMode::PrivilegedRaw, true) => create_raw_icmp_socket(true)?,
        (TransportMode::UnprivilegedDgram, ipv6) => create_dgram_icmp_socket(ipv6)?,
        (TransportMode::RawDontFragment, false) => {
            let socket = create_raw_icmp_socket(false)?;
            // We supply the IPv4 header, DF flag included
            socket.set_header_included_v4(true)?;
            socket
        }
        (TransportMode::RawDontFragment, true) => {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "IPv6 has no header-level don't-fragment mode",
            ));
        }
    };

    socket.set_nonblocking(true)?;

    if ipv6 {
        // Raw ICMPv6 always binds, to the unspecified address by default
        let bind_ip = source.unwrap_or(IpAddr::V6(Ipv6Addr::UNSPECIFIED));
        if mode == TransportMode::PrivilegedRaw || source.is_some() {
            bind_to_source_ip(&socket, bind_ip)?;
        }
        if dont_fragment {
            set_ipv6_dont_fragment(&socket)?;
        }
    } else if let Some(ip) = source {
        bind_to_source_ip(&socket, ip)?;
    }

    Ok(socket)
}

/// Create a raw ICMP socket
pub fn create_raw_icmp_socket(ipv6: bool) -> io::Result<Socket> {
    let domain = if ipv6 { Domain::IPV6 } else { Domain::IPV4 };
    let protocol = if ipv6 {
        Protocol::ICMPV6
    } else {
        Protocol::ICMPV4
    };
    Socket::new(domain, Type::RAW, Some(protocol))
}

/// Create an unprivileged ICMP socket (SOCK_DGRAM)
pub fn create_dgram_icmp_socket(ipv6: bool) -> io::Result<Socket> {
    if ipv6 {
        Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::ICMPV6))
    } else {
        Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4))
    }
}

/// Bind socket to a specific source IP address
pub fn bind_to_source_ip(socket: &Socket, ip: IpAddr) -> io::Result<()> {
    let addr = SocketAddr::new(ip, 0);
    socket.bind(&SockAddr::from(addr))
}

/// Set IPV6_DONTFRAG so oversized echoes fail instead of fragmenting at the source
#[cfg(any(target_os = "linux", target_os = "macos"))]
fn set_ipv6_dont_fragment(socket: &Socket) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    // IPV6_DONTFRAG = 62 on both Linux and macOS
    const IPV6_DONTFRAG: libc::c_int = 62;
    let val: libc::c_int = 1;
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_IPV6,
            IPV6_DONTFRAG,
            &val as *const _ as *const libc::c_void,
            std::mem::size_of_val(&val) as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn set_ipv6_dont_fragment(_socket: &Socket) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "IPV6_DONTFRAG is not supported on this platform",
    ))
}
