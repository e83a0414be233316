use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use crate::error::ProbeError;
use crate::lookup::AddressFamily;
use crate::probe::IdentifierMatching;

/// Exporter-wide defaults and administrator limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExporterConfig {
    /// Packets per probe when the request names none
    pub default_count: u64,
    /// Pause between packets when the request names none
    #[serde(with = "duration_serde")]
    pub default_interval: Duration,
    /// Echo payload size when the request names none
    pub default_packet_size: usize,
    /// Overall probe budget when the request names none
    #[serde(with = "duration_serde")]
    pub default_timeout: Duration,
    /// Upper bound for a requested count
    pub max_count: u64,
    /// Upper bound for a requested packet size
    pub max_packet_size: usize,
    /// Cap on the wait for a single echo reply
    #[serde(with = "duration_serde")]
    pub echo_timeout: Duration,
    pub identifier_matching: IdentifierMatching,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            default_count: 3,
            default_interval: Duration::from_secs(1),
            default_packet_size: 64,
            default_timeout: Duration::from_secs(5),
            max_count: 100,
            max_packet_size: 65507,
            echo_timeout: Duration::from_secs(2),
            identifier_matching: IdentifierMatching::default(),
        }
    }
}

/// A validated probe, ready for the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeRequest {
    pub target: String,
    pub count: u64,
    #[serde(with = "duration_serde")]
    pub interval: Duration,
    pub packet_size: usize,
    pub family: AddressFamily,
    pub source: Option<IpAddr>,
    pub dont_fragment: bool,
    #[serde(with = "duration_serde")]
    pub timeout: Duration,
    /// Render the human-readable trace instead of bare metrics
    pub debug: bool,
}

impl ProbeRequest {
    /// Request with every optional field at its default
    pub fn new(target: impl Into<String>, config: &ExporterConfig) -> Self {
        Self {
            target: target.into(),
            count: config.default_count,
            interval: config.default_interval,
            packet_size: config.default_packet_size,
            family: AddressFamily::default(),
            source: None,
            dont_fragment: false,
            timeout: config.default_timeout,
            debug: false,
        }
    }
}

/// Raw, untrusted probe parameters (query-string shaped)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeParams {
    values: HashMap<String, String>,
}

impl ProbeParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut params = Self::new();
        for (key, value) in pairs {
            params.set(key, value);
        }
        params
    }

    /// Set a parameter; the first value of a repeated key wins
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.entry(key.into()).or_insert_with(|| value.into());
    }

    /// Parameter value, with empty strings treated as absent
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    fn flag(&self, key: &str) -> bool {
        self.get(key) == Some("true")
    }
}

impl ExporterConfig {
    /// Validate raw parameters into a request.
    ///
    /// Only a missing target or an unparsable source address is an error.
    /// Unusable numbers and durations fall back to the defaults, counts and
    /// sizes above the limits are clamped to them.
    pub fn build_request(&self, params: &ProbeParams) -> Result<ProbeRequest, ProbeError> {
        let target = params
            .get("target")
            .ok_or_else(|| ProbeError::InvalidRequest("Target parameter is missing".into()))?;

        let mut request = ProbeRequest::new(target, self);

        if let Some(count) = params.get("count").and_then(|v| v.trim().parse::<i64>().ok())
            && count > 0
        {
            request.count = (count as u64).min(self.max_count);
        }

        if let Some(size) = params
            .get("packet_size")
            .and_then(|v| v.trim().parse::<i64>().ok())
            && size > 0
        {
            request.packet_size = usize::try_from(size)
                .unwrap_or(usize::MAX)
                .min(self.max_packet_size);
        }

        if let Some(interval) = params.get("interval").and_then(|v| parse_duration(v).ok())
            && !interval.is_zero()
        {
            request.interval = interval;
        }

        if let Some(timeout) = params.get("timeout").and_then(|v| parse_duration(v).ok())
            && !timeout.is_zero()
        {
            request.timeout = timeout;
        }

        if let Some(family) = params.get("ip_protocol") {
            request.family = family.parse().unwrap_or_default();
        }

        if let Some(source) = params.get("source_ip") {
            let ip = source.trim().parse::<IpAddr>().map_err(|_| {
                ProbeError::InvalidRequest(format!("invalid source IP: {}", source))
            })?;
            request.source = Some(ip);
        }

        request.dont_fragment = params.flag("dont_fragment");
        request.debug = params.flag("debug");

        Ok(request)
    }
}

/// Parse a duration literal such as `1s`, `250ms`, `1.5s`, `1m30s` or `100us`.
///
/// A bare number is taken as seconds. Negative durations are rejected.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }
    if s.starts_with('-') {
        return Err(format!("negative duration: {}", s));
    }
    let literal = s.strip_prefix('+').unwrap_or(s);
    let invalid = || format!("invalid duration: {}", s);

    let mut total: u128 = 0;
    let mut rest = literal;
    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        let number = &rest[..num_len];
        rest = &rest[num_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];

        let unit_nanos: u128 = match unit {
            "" if number.len() == literal.len() => 1_000_000_000,
            "" => return Err(format!("missing unit in duration: {}", s)),
            "ns" => 1,
            "us" | "µs" | "μs" => 1_000,
            "ms" => 1_000_000,
            "s" => 1_000_000_000,
            "m" => 60_000_000_000,
            "h" => 3_600_000_000_000,
            other => return Err(format!("unknown unit {:?} in duration: {}", other, s)),
        };
        total = total
            .checked_add(scaled_nanos(number, unit_nanos).ok_or_else(invalid)?)
            .ok_or_else(invalid)?;
    }

    let secs = u64::try_from(total / 1_000_000_000).map_err(|_| invalid())?;
    Ok(Duration::new(secs, (total % 1_000_000_000) as u32))
}

/// `number` (decimal, optional fraction) times `unit_nanos`, truncated
fn scaled_nanos(number: &str, unit_nanos: u128) -> Option<u128> {
    let (whole, frac) = match number.split_once('.') {
        Some((whole, frac)) => (whole, frac),
        None => (number, ""),
    };
    if whole.is_empty() && frac.is_empty() {
        return None;
    }
    if !whole.bytes().chain(frac.bytes()).all(|b| b.is_ascii_digit()) {
        return None;
    }

    let whole: u128 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
    let mut nanos = whole.checked_mul(unit_nanos)?;

    // Digits beyond nanosecond resolution cannot contribute
    let frac = &frac[..frac.len().min(18)];
    if !frac.is_empty() {
        let digits: u128 = frac.parse().ok()?;
        let scale = 10u128.pow(frac.len() as u32);
        nanos = nanos.checked_add(digits * unit_nanos / scale)?;
    }
    Some(nanos)
}

/// Serde helper for Duration (fractional seconds)
pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> ProbeParams {
        ProbeParams::from_pairs(pairs.iter().copied())
    }

    #[test]
    fn test_defaults() {
        let config = ExporterConfig::default();
        let request = config.build_request(&params(&[("target", "example.com")])).unwrap();
        assert_eq!(request.target, "example.com");
        assert_eq!(request.count, 3);
        assert_eq!(request.interval, Duration::from_secs(1));
        assert_eq!(request.packet_size, 64);
        assert_eq!(request.timeout, Duration::from_secs(5));
        assert_eq!(request.family, AddressFamily::Ip4);
        assert_eq!(request.source, None);
        assert!(!request.dont_fragment);
        assert!(!request.debug);
    }

    #[test]
    fn test_missing_target() {
        let config = ExporterConfig::default();
        let err = config.build_request(&params(&[("count", "5")])).unwrap_err();
        assert!(matches!(err, ProbeError::InvalidRequest(_)));

        let err = config.build_request(&params(&[("target", "")])).unwrap_err();
        assert!(matches!(err, ProbeError::InvalidRequest(_)));
    }

    #[test]
    fn test_count_clamping() {
        let config = ExporterConfig::default();
        let count = |v: &str| {
            config
                .build_request(&params(&[("target", "t"), ("count", v)]))
                .unwrap()
                .count
        };
        assert_eq!(count("5"), 5);
        assert_eq!(count("100"), 100);
        assert_eq!(count("1000"), 100);
        assert_eq!(count("0"), 3);
        assert_eq!(count("-2"), 3);
        assert_eq!(count("three"), 3);
    }

    #[test]
    fn test_packet_size_clamping() {
        let config = ExporterConfig {
            max_packet_size: 1500,
            ..Default::default()
        };
        let size = |v: &str| {
            config
                .build_request(&params(&[("target", "t"), ("packet_size", v)]))
                .unwrap()
                .packet_size
        };
        assert_eq!(size("56"), 56);
        assert_eq!(size("9000"), 1500);
        assert_eq!(size("0"), 64);
        assert_eq!(size("big"), 64);
    }

    #[test]
    fn test_durations_and_flags() {
        let config = ExporterConfig::default();
        let request = config
            .build_request(&params(&[
                ("target", "t"),
                ("interval", "250ms"),
                ("timeout", "10"),
                ("ip_protocol", "ip6"),
                ("source_ip", "::1"),
                ("dont_fragment", "true"),
                ("debug", "yes"),
            ]))
            .unwrap();
        assert_eq!(request.interval, Duration::from_millis(250));
        assert_eq!(request.timeout, Duration::from_secs(10));
        assert_eq!(request.family, AddressFamily::Ip6);
        assert_eq!(request.source, Some("::1".parse().unwrap()));
        assert!(request.dont_fragment);
        assert!(!request.debug);
    }

    #[test]
    fn test_bad_values_fall_back() {
        let config = ExporterConfig::default();
        let request = config
            .build_request(&params(&[
                ("target", "t"),
                ("interval", "0s"),
                ("timeout", "-1s"),
                ("ip_protocol", "carrier-pigeon"),
            ]))
            .unwrap();
        assert_eq!(request.interval, Duration::from_secs(1));
        assert_eq!(request.timeout, Duration::from_secs(5));
        assert_eq!(request.family, AddressFamily::Ip4);
    }

    #[test]
    fn test_invalid_source_ip() {
        let config = ExporterConfig::default();
        let err = config
            .build_request(&params(&[("target", "t"), ("source_ip", "not-an-ip")]))
            .unwrap_err();
        assert!(matches!(err, ProbeError::InvalidRequest(_)));
    }

    #[test]
    fn test_first_value_wins() {
        let mut p = params(&[("target", "a")]);
        p.set("target", "b");
        assert_eq!(p.get("target"), Some("a"));
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("1s"), Ok(Duration::from_secs(1)));
        assert_eq!(parse_duration("250ms"), Ok(Duration::from_millis(250)));
        assert_eq!(parse_duration("1.5s"), Ok(Duration::from_millis(1500)));
        assert_eq!(parse_duration("2m"), Ok(Duration::from_secs(120)));
        assert_eq!(parse_duration("1m30s"), Ok(Duration::from_secs(90)));
        assert_eq!(parse_duration("100us"), Ok(Duration::from_micros(100)));
        assert_eq!(parse_duration("10ns"), Ok(Duration::from_nanos(10)));
        assert_eq!(parse_duration("2"), Ok(Duration::from_secs(2)));
        assert_eq!(parse_duration("0.5"), Ok(Duration::from_millis(500)));
    }

    #[test]
    fn test_parse_duration_errors() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("-1s").is_err());
        assert!(parse_duration("5 parsecs").is_err());
        assert!(parse_duration("ms").is_err());
        assert!(parse_duration("1.2.3s").is_err());
    }

    #[test]
    fn test_config_serde_roundtrip() {
        let config = ExporterConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"echo_timeout\":2.0"));
        let back: ExporterConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.echo_timeout, config.echo_timeout);
        assert_eq!(back.max_count, 100);
        assert_eq!(back.identifier_matching, IdentifierMatching::SequenceOnlyWhenUnprivileged);
    }
}
