use std::io::Write;

use crate::config::ProbeRequest;
use crate::state::ProbeReport;

/// Write the human-readable preamble of a debug probe response.
///
/// The metrics that would otherwise have been returned follow it.
pub fn write_debug_header<W: Write>(
    request: &ProbeRequest,
    report: &ProbeReport,
    mut writer: W,
) -> std::io::Result<()> {
    writeln!(writer, "Logs for the probe:")?;
    writeln!(writer, "Target: {}", request.target)?;
    if let Some(resolved) = &report.resolved {
        writeln!(writer, "Resolved: {}", resolved)?;
    }
    writeln!(writer, "Count: {}", request.count)?;
    writeln!(writer, "Interval: {:?}", request.interval)?;
    writeln!(writer, "Packet Size: {}", request.packet_size)?;
    writeln!(writer, "IP Protocol: {}", request.family)?;
    if let Some(source) = request.source {
        writeln!(writer, "Source IP: {}", source)?;
    }
    if request.dont_fragment {
        writeln!(writer, "Don't Fragment: true")?;
    }
    if let Some(error) = &report.error {
        writeln!(writer, "Error: {}", error)?;
    }
    writeln!(writer, "Success: {}", report.success)?;
    writeln!(writer, "Duration: {:.3}s", report.duration.as_secs_f64())?;
    writeln!(writer)?;
    writeln!(writer)?;
    writeln!(writer, "Metrics that would have been returned:")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExporterConfig;
    use crate::state::ProbeResult;
    use chrono::Utc;
    use std::time::Duration;

    #[test]
    fn test_debug_header() {
        let request = ProbeRequest::new("example.com", &ExporterConfig::default());
        let result = ProbeResult::new(3, vec![Duration::from_millis(1)]);
        let report = ProbeReport::completed(
            "example.com",
            "192.0.2.7",
            result,
            Duration::from_millis(2042),
            Utc::now(),
        );

        let mut out = Vec::new();
        write_debug_header(&request, &report, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();

        assert!(text.starts_with("Logs for the probe:\nTarget: example.com\n"));
        assert!(text.contains("Resolved: 192.0.2.7\n"));
        assert!(text.contains("Count: 3\n"));
        assert!(text.contains("Interval: 1s\n"));
        assert!(text.contains("Packet Size: 64\n"));
        assert!(text.contains("IP Protocol: ip4\n"));
        assert!(text.contains("Success: true\n"));
        assert!(text.contains("Duration: 2.042s\n"));
        assert!(text.ends_with("\n\n\nMetrics that would have been returned:\n"));
        assert!(!text.contains("Error:"));
    }

    #[test]
    fn test_debug_header_failure() {
        let request = ProbeRequest::new("nope.invalid", &ExporterConfig::default());
        let report = ProbeReport::failed(
            "nope.invalid",
            None,
            "lookup failed",
            Duration::ZERO,
            Utc::now(),
        );

        let mut out = Vec::new();
        write_debug_header(&request, &report, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();

        assert!(text.contains("Error: lookup failed\n"));
        assert!(text.contains("Success: false\n"));
        assert!(!text.contains("Resolved:"));
    }
}
