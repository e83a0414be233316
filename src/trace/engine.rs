use chrono::Utc;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, trace, warn};

use crate::config::{ExporterConfig, ProbeRequest};
use crate::error::ProbeError;
use crate::lookup::{ResolvedTarget, resolve_target};
use crate::probe::{EchoExchange, IdentifierMatching, Transport, build_payload};
use crate::state::{EchoIdentity, ProbeReport, ProbeResult};

/// Where a probe is in its life, for logs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbePhase {
    Resolving,
    TransportOpen,
    /// Echo `n` sent or awaiting its reply
    Exchanging(u64),
    Pausing(u64),
    Done,
}

impl fmt::Display for ProbePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbePhase::Resolving => write!(f, "resolving"),
            ProbePhase::TransportOpen => write!(f, "transport-open"),
            ProbePhase::Exchanging(i) => write!(f, "exchanging({})", i),
            ProbePhase::Pausing(i) => write!(f, "pausing({})", i),
            ProbePhase::Done => write!(f, "done"),
        }
    }
}

/// The probe engine resolves a target and runs one echo train against it.
///
/// One engine serves every probe in the process; concurrent probes share
/// its identity, so their sequence numbers never collide.
pub struct ProbeEngine {
    identity: Arc<EchoIdentity>,
    echo_timeout: Duration,
    matching: IdentifierMatching,
}

impl ProbeEngine {
    pub fn new(identity: Arc<EchoIdentity>, config: &ExporterConfig) -> Self {
        Self {
            identity,
            echo_timeout: config.echo_timeout,
            matching: config.identifier_matching,
        }
    }

    pub fn identity(&self) -> &EchoIdentity {
        &self.identity
    }

    /// Run a complete probe and report on it. Never fails: every failure
    /// is folded into the report.
    pub async fn probe(&self, request: &ProbeRequest, cancel: &CancellationToken) -> ProbeReport {
        let span = info_span!(
            "probe",
            target = %request.target,
            count = request.count,
            interval = ?request.interval,
            packet_size = request.packet_size,
        );
        self.probe_inner(request, cancel).instrument(span).await
    }

    async fn probe_inner(&self, request: &ProbeRequest, cancel: &CancellationToken) -> ProbeReport {
        let started_at = Utc::now();
        let start = Instant::now();
        let deadline = start + request.timeout;
        info!("Beginning probe");
        trace!(phase = %ProbePhase::Resolving);

        let target = match self.resolve(request, cancel, deadline).await {
            Ok(Some(target)) => target,
            Ok(None) => {
                debug!("Probe budget exhausted before the target was resolved");
                return ProbeReport::interrupted(
                    &request.target,
                    ProbeResult::new(0, Vec::new()),
                    start.elapsed(),
                    started_at,
                );
            }
            Err(e) => {
                error!(error = %e, "Probe failed");
                return ProbeReport::failed(&request.target, None, e, start.elapsed(), started_at);
            }
        };

        let report = match self.ping(&target, request, cancel, deadline).await {
            Ok(result) => ProbeReport::completed(
                &request.target,
                target.to_string(),
                result,
                start.elapsed(),
                started_at,
            ),
            Err(e) => ProbeReport::failed(
                &request.target,
                Some(target.to_string()),
                e,
                start.elapsed(),
                started_at,
            ),
        };

        trace!(phase = %ProbePhase::Done);
        let duration_seconds = report.duration.as_secs_f64();
        if report.success {
            info!(duration_seconds, "Probe succeeded");
        } else {
            error!(duration_seconds, error = report.error.as_deref(), "Probe failed");
        }
        report
    }

    /// Resolve within the probe budget; `Ok(None)` when cancellation or
    /// the deadline came first
    pub async fn resolve(
        &self,
        request: &ProbeRequest,
        cancel: &CancellationToken,
        deadline: Instant,
    ) -> Result<Option<ResolvedTarget>, ProbeError> {
        let target = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(None),
            _ = time::sleep_until(deadline) => return Ok(None),
            resolved = resolve_target(&request.target, request.family) => resolved?,
        };
        debug!(resolved = %target, family = %request.family, "Resolved target");
        Ok(Some(target))
    }

    /// Send `request.count` echoes to a resolved target.
    ///
    /// Lost packets are logged and counted, never fatal. Cancellation or
    /// the deadline end the train early with the samples gathered so far.
    pub async fn ping(
        &self,
        target: &ResolvedTarget,
        request: &ProbeRequest,
        cancel: &CancellationToken,
        deadline: Instant,
    ) -> Result<ProbeResult, ProbeError> {
        let transport = Transport::open(target, request.source, request.dont_fragment)?;
        trace!(phase = %ProbePhase::TransportOpen, mode = %transport.mode());
        let mut exchange = EchoExchange::new(
            &transport,
            target,
            self.identity.identifier(),
            build_payload(request.packet_size),
            self.matching,
        );

        let mut sent: u64 = 0;
        let mut samples = Vec::new();

        for packet in 1..=request.count {
            if cancel.is_cancelled() || Instant::now() >= deadline {
                debug!(sent, "Probe budget exhausted, stopping");
                break;
            }

            sent += 1;
            let seq = self.identity.next_sequence();
            let echo_deadline = (Instant::now() + self.echo_timeout).min(deadline);
            debug!(seq, packet, of = request.count, "Sending echo request");
            trace!(phase = %ProbePhase::Exchanging(packet));
            let outcome = tokio::select! {
                _ = cancel.cancelled() => None,
                outcome = exchange.run(seq, echo_deadline) => Some(outcome),
            };

            match outcome {
                None => {
                    debug!(seq, "Probe cancelled while waiting for reply");
                    break;
                }
                Some(Ok(sample)) => {
                    debug!(seq, rtt = ?sample.rtt(), "Echo reply received");
                    samples.push(sample);
                }
                Some(Err(e)) if e.is_fatal() => return Err(e),
                Some(Err(e)) => warn!(seq, error = %e, "Echo failed"),
            }

            // No pause after the last packet
            if packet < request.count {
                trace!(phase = %ProbePhase::Pausing(packet));
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = time::sleep_until(deadline) => break,
                    _ = time::sleep(request.interval) => {}
                }
            }
        }

        Ok(ProbeResult::from_samples(sent, &samples))
    }
}
