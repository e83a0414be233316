//! Process-wide echo identity.
//!
//! Every probe in the process stamps its echo requests with the same 16-bit
//! identifier and draws sequence numbers from one shared counter, so replies
//! can be told apart from unrelated ICMP traffic and from sibling exporter
//! instances on the same host.

use parking_lot::Mutex;
use rand::Rng;

/// Identifier plus the shared sequence counter
#[derive(Debug)]
pub struct EchoIdentity {
    identifier: u16,
    sequence: Mutex<u16>,
}

impl EchoIdentity {
    /// Identity derived from the current process.
    ///
    /// The sequence starts at a random offset so that exporters restarted
    /// together do not emit the same sequence numbers in lockstep.
    pub fn from_process() -> Self {
        let mut rng = rand::thread_rng();
        let identifier = identifier_for_pid(std::process::id(), &mut rng);
        Self::with_values(identifier, rng.r#gen())
    }

    /// Identity with fixed values. The first `next_sequence` returns `start + 1`.
    pub fn with_values(identifier: u16, start: u16) -> Self {
        Self {
            identifier,
            sequence: Mutex::new(start),
        }
    }

    pub fn identifier(&self) -> u16 {
        self.identifier
    }

    /// Advance the shared counter and return the new value (wraps at 65536)
    pub fn next_sequence(&self) -> u16 {
        let mut seq = self.sequence.lock();
        *seq = seq.wrapping_add(1);
        *seq
    }
}

/// Derive the echo identifier from a process id.
///
/// PID 1 (a container's init process) is the same for every containerized
/// instance, so it is replaced by a random value.
pub fn identifier_for_pid<R: Rng + ?Sized>(pid: u32, rng: &mut R) -> u16 {
    if pid == 1 {
        rng.r#gen()
    } else {
        (pid & 0xffff) as u16
    }
}
