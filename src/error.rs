use std::fmt;
use std::io;

/// Failure kinds of a single probe.
///
/// Resolution, transport and marshal failures stop the probe. Send
/// failures, reply timeouts and read errors only ever cost one packet.
#[derive(Debug)]
pub enum ProbeError {
    /// Target name could not be resolved in the requested family
    Resolution { target: String, reason: String },
    /// No socket mode could be opened for the target
    Transport(String),
    /// Echo request could not be written to the socket
    Send(io::Error),
    /// No matching reply arrived before the echo deadline
    ReplyTimeout,
    /// Socket-level failure other than a timeout
    Read(io::Error),
    /// Outgoing message could not be built
    Marshal(String),
    /// Request rejected before any network activity
    InvalidRequest(String),
}

impl ProbeError {
    pub fn resolution(target: &str, reason: impl fmt::Display) -> Self {
        ProbeError::Resolution {
            target: target.to_string(),
            reason: reason.to_string(),
        }
    }

    /// True for errors that abort the whole probe
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            ProbeError::Send(_) | ProbeError::ReplyTimeout | ProbeError::Read(_)
        )
    }
}

impl fmt::Display for ProbeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeError::Resolution { target, reason } => {
                write!(f, "failed to resolve target {}: {}", target, reason)
            }
            ProbeError::Transport(msg) => write!(f, "no usable ICMP transport: {}", msg),
            ProbeError::Send(e) => write!(f, "failed to send ICMP packet: {}", e),
            ProbeError::ReplyTimeout => write!(f, "timeout waiting for ICMP reply"),
            ProbeError::Read(e) => write!(f, "failed to read ICMP reply: {}", e),
            ProbeError::Marshal(msg) => write!(f, "failed to marshal ICMP packet: {}", msg),
            ProbeError::InvalidRequest(msg) => write!(f, "invalid probe request: {}", msg),
        }
    }
}

impl std::error::Error for ProbeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProbeError::Send(e) | ProbeError::Read(e) => Some(e),
            _ => None,
        }
    }
}
