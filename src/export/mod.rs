pub mod debug;
pub mod metrics;

pub use debug::*;
pub use metrics::*;

use crate::config::ProbeRequest;
use crate::state::ProbeReport;

/// Body and content type of a probe response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResponse {
    pub content_type: String,
    pub body: Vec<u8>,
}

impl ProbeResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Render what the probe endpoint returns for a finished probe: the metric
/// exposition, preceded by a plain-text trace for debug requests.
pub fn render_probe_response(
    request: &ProbeRequest,
    report: &ProbeReport,
) -> prometheus::Result<ProbeResponse> {
    let registry = probe_registry(report)?;
    let mut body = Vec::new();

    let content_type = if request.debug {
        write_debug_header(request, report, &mut body)?;
        "text/plain".to_string()
    } else {
        content_type()
    };
    write_metrics(&registry, &mut body)?;

    Ok(ProbeResponse { content_type, body })
}
