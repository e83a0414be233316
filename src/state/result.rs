use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

const NANOS_PER_SEC: f64 = 1e9;

/// One successful echo round trip
#[derive(Debug, Clone, Copy)]
pub struct PingSample {
    pub sequence: u16,
    pub sent_at: Instant,
    pub received_at: Instant,
}

impl PingSample {
    pub fn rtt(&self) -> Duration {
        self.received_at.saturating_duration_since(self.sent_at)
    }
}

/// Round-trip statistics in seconds (`sd` is in seconds squared)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RttStats {
    pub best: f64,
    pub worst: f64,
    pub mean: f64,
    pub sum: f64,
    pub range: f64,
    /// Sum of squared deviations from the mean
    pub sd: f64,
    /// Population standard deviation
    pub usd: f64,
    /// Sample standard deviation, absent for a single sample
    pub csd: Option<f64>,
}

impl RttStats {
    /// Reduce RTT samples; `None` when there are no samples
    pub fn from_rtts(rtts: &[Duration]) -> Option<Self> {
        if rtts.is_empty() {
            return None;
        }

        // Integer nanoseconds are exact in f64 up to ~104 days
        let nanos: Vec<f64> = rtts.iter().map(|d| d.as_nanos() as f64).collect();
        let n = nanos.len() as f64;

        let min = nanos.iter().copied().fold(f64::INFINITY, f64::min);
        let max = nanos.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let sum: f64 = nanos.iter().sum();
        let mean = sum / n;

        // Two-pass form of Σx² − n·mean², immune to cancellation
        let squared_dev: f64 = nanos.iter().map(|x| (x - mean) * (x - mean)).sum();

        let csd = if nanos.len() > 1 {
            Some((squared_dev / (n - 1.0)).sqrt() / NANOS_PER_SEC)
        } else {
            None
        };

        Some(Self {
            best: min / NANOS_PER_SEC,
            worst: max / NANOS_PER_SEC,
            mean: mean / NANOS_PER_SEC,
            sum: sum / NANOS_PER_SEC,
            range: (max - min) / NANOS_PER_SEC,
            sd: squared_dev / (NANOS_PER_SEC * NANOS_PER_SEC),
            usd: (squared_dev / n).sqrt() / NANOS_PER_SEC,
            csd,
        })
    }
}

/// Outcome of a probe that ran (possibly with total loss)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub sent: u64,
    pub received: u64,
    /// Round-trip times of received packets, in send order
    #[serde(with = "durations_serde")]
    pub rtts: Vec<Duration>,
    pub loss_ratio: f64,
    pub rtt: Option<RttStats>,
}

impl ProbeResult {
    pub fn new(sent: u64, rtts: Vec<Duration>) -> Self {
        let received = rtts.len() as u64;
        let loss_ratio = if received == 0 {
            1.0
        } else {
            sent.saturating_sub(received) as f64 / sent as f64
        };
        let rtt = RttStats::from_rtts(&rtts);

        Self {
            sent,
            received,
            rtts,
            loss_ratio,
            rtt,
        }
    }

    pub fn from_samples(sent: u64, samples: &[PingSample]) -> Self {
        Self::new(sent, samples.iter().map(PingSample::rtt).collect())
    }

    /// A probe succeeds when at least one reply came back
    pub fn success(&self) -> bool {
        self.received > 0
    }
}

/// Serde helper for RTT lists (fractional seconds)
mod durations_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(durations: &[Duration], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let secs: Vec<f64> = durations.iter().map(Duration::as_secs_f64).collect();
        secs.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = Vec::<f64>::deserialize(deserializer)?;
        secs.into_iter()
            .map(|s| Duration::try_from_secs_f64(s).map_err(serde::de::Error::custom))
            .collect()
    }
}
