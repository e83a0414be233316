use std::time::Instant;
use tokio::time::{self, Instant as Deadline};
use tracing::{debug, trace};

use crate::error::ProbeError;
use crate::lookup::ResolvedTarget;
use crate::probe::correlate::{IdentifierMatching, ReplyMatcher};
use crate::probe::icmp::build_echo_request;
use crate::probe::socket::Transport;
use crate::state::PingSample;

/// Largest datagram we expect back: max IPv4 packet
const RECV_BUFFER_SIZE: usize = 65536;

/// Sends single echoes over a transport and waits for their replies
pub struct EchoExchange<'a> {
    transport: &'a Transport,
    target: &'a ResolvedTarget,
    identifier: u16,
    payload: Vec<u8>,
    matching: IdentifierMatching,
    buffer: Vec<u8>,
}

impl<'a> EchoExchange<'a> {
    pub fn new(
        transport: &'a Transport,
        target: &'a ResolvedTarget,
        identifier: u16,
        payload: Vec<u8>,
        matching: IdentifierMatching,
    ) -> Self {
        Self {
            transport,
            target,
            identifier,
            payload,
            matching,
            buffer: vec![0u8; RECV_BUFFER_SIZE],
        }
    }

    /// One echo: send `sequence`, then read until its reply or `deadline`.
    ///
    /// Unrelated datagrams are dropped and reading continues; they never
    /// extend the deadline.
    pub async fn run(
        &mut self,
        sequence: u16,
        deadline: Deadline,
    ) -> Result<PingSample, ProbeError> {
        let request = build_echo_request(
            self.identifier,
            sequence,
            &self.payload,
            self.transport.is_ipv6(),
        )?;
        let matcher = ReplyMatcher::new(
            self.target,
            self.transport.mode(),
            self.matching,
            self.identifier,
            sequence,
        );

        let sent_at = Instant::now();
        self.transport.send(&request, self.target).await?;
        trace!(sequence, bytes = request.len(), "Echo request sent");

        loop {
            let received = time::timeout_at(deadline, self.transport.recv(&mut self.buffer)).await;
            let (len, source) = match received {
                Ok(Ok(received)) => received,
                Ok(Err(e)) => return Err(ProbeError::Read(e)),
                Err(_elapsed) => return Err(ProbeError::ReplyTimeout),
            };
            let received_at = Instant::now();

            match matcher.check(&source, &self.buffer[..len]) {
                Ok(reply) => {
                    trace!(sequence, identifier = reply.identifier, "Echo reply matched");
                    return Ok(PingSample {
                        sequence,
                        sent_at,
                        received_at,
                    });
                }
                Err(reason) => {
                    debug!(%source, len, %reason, "Discarding datagram");
                }
            }
        }
    }
}
