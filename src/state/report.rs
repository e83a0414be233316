use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::duration_serde;
use crate::state::ProbeResult;

/// Everything exposition needs to know about one finished probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeReport {
    /// Target as requested
    pub target: String,
    /// Address the echoes went to, once resolution succeeded
    pub resolved: Option<String>,
    pub success: bool,
    /// Wall-clock time of the whole probe, resolution included
    #[serde(with = "duration_serde")]
    pub duration: Duration,
    /// Packet outcome; absent when the probe failed before sending
    pub result: Option<ProbeResult>,
    /// Why the probe failed before sending
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
}

impl ProbeReport {
    pub fn completed(
        target: impl Into<String>,
        resolved: impl Into<String>,
        result: ProbeResult,
        duration: Duration,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            target: target.into(),
            resolved: Some(resolved.into()),
            success: result.success(),
            duration,
            result: Some(result),
            error: None,
            started_at,
        }
    }

    /// Probe stopped by cancellation or its deadline before a target was known
    pub fn interrupted(
        target: impl Into<String>,
        result: ProbeResult,
        duration: Duration,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            target: target.into(),
            resolved: None,
            success: result.success(),
            duration,
            result: Some(result),
            error: None,
            started_at,
        }
    }

    pub fn failed(
        target: impl Into<String>,
        resolved: Option<String>,
        error: impl ToString,
        duration: Duration,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            target: target.into(),
            resolved,
            success: false,
            duration,
            result: None,
            error: Some(error.to_string()),
            started_at,
        }
    }
}
