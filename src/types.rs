use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use ::time::{format_description::well_known, OffsetDateTime};
use serde::{Deserialize, Serialize};

/// Kind of monitoring a session performs.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Probe,
    Scan,
}

impl Domain {
    pub fn as_str(self) -> &'static str {
        match self {
            Domain::Probe => "probe",
            Domain::Scan => "scan",
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque session id, used verbatim from creation to lookup.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Pooling key: domain tag plus session id, compared by value.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey {
    pub domain: Domain,
    pub id: SessionId,
}

impl SessionKey {
    pub fn new(domain: Domain, id: SessionId) -> Self {
        Self { domain, id }
    }

    pub fn probe(id: impl Into<SessionId>) -> Self {
        Self::new(Domain::Probe, id.into())
    }

    pub fn scan(id: impl Into<SessionId>) -> Self {
        Self::new(Domain::Scan, id.into())
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.domain, self.id)
    }
}

/// Time-based session ids that never repeat within one generator, even when two
/// sessions start in the same millisecond.
#[derive(Debug, Default)]
pub struct SessionIdGenerator {
    last: AtomicU64,
}

impl SessionIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> SessionId {
        let now = unix_millis();
        let prev = self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or(now);
        SessionId(now.max(prev + 1).to_string())
    }
}

/// Outcome of a single probe attempt.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProbeOutcome {
    Success,
    Timeout,
    Error,
}

impl ProbeOutcome {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "success" => Some(Self::Success),
            "timeout" => Some(Self::Timeout),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// One probe attempt, immutable once buffered.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ProbeResult {
    pub session_id: SessionId,
    pub target: String,
    pub sequence: u64,
    /// Round-trip time in milliseconds; absent on failure.
    pub response_time: Option<f64>,
    pub ttl: Option<u32>,
    pub packet_size: u32,
    pub timestamp: String,
    pub status: ProbeOutcome,
    pub error: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProbeStatus {
    #[default]
    Running,
    Completed,
    Stopped,
    Error,
}

/// Aggregate statistics over the buffered probe results.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct ProbeSummary {
    pub session_id: Option<SessionId>,
    pub target: String,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packet_loss: f64,
    pub min_time: Option<f64>,
    pub max_time: Option<f64>,
    pub avg_time: Option<f64>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub status: ProbeStatus,
}

/// Port state reported by the scanner.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PortState {
    Open,
    Closed,
    Filtered,
}

impl PortState {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "open" => Some(Self::Open),
            "closed" => Some(Self::Closed),
            "filtered" => Some(Self::Filtered),
            _ => None,
        }
    }
}

/// One discovered port for a scan target.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ScanResult {
    pub scan_id: SessionId,
    pub target: String,
    pub port: u16,
    pub state: PortState,
    pub service: String,
    pub timestamp: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScanState {
    #[default]
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ScanState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ScanState::Running)
    }
}

/// Progress and counters for one scan job.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct ScanStatus {
    pub scan_id: SessionId,
    pub status: ScanState,
    pub progress: f64,
    pub total_ports: u64,
    pub scanned_ports: u64,
    pub found_ports: u64,
    pub start_time: String,
    pub end_time: Option<String>,
    pub error: Option<String>,
    pub target_errors: Vec<String>,
}

/// What the caller should do with the session's connection after a frame
/// was ingested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Continue,
    /// The stream reached a natural end; the connection may age out.
    Release,
}

/// Scan job as returned by the job-start endpoint.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ScanJob {
    pub scan_id: String,
    #[serde(default)]
    pub total_ports: Option<u64>,
    #[serde(default)]
    pub start_time: Option<String>,
}

pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

pub(crate) fn now_rfc3339() -> String {
    format_rfc3339(OffsetDateTime::now_utc())
}

/// Convert server-side unix seconds (fractional) into an RFC 3339 string.
pub(crate) fn rfc3339_from_unix(secs: f64) -> Option<String> {
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    let nanos = (secs * 1_000_000_000.0) as i128;
    OffsetDateTime::from_unix_timestamp_nanos(nanos)
        .ok()
        .map(format_rfc3339)
}

fn format_rfc3339(t: OffsetDateTime) -> String {
    t.format(&well_known::Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_key_display_and_equality() {
        let a = SessionKey::probe("1700000000000");
        let b = SessionKey::new(Domain::Probe, SessionId::new("1700000000000"));
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "probe:1700000000000");
        assert_ne!(a, SessionKey::scan("1700000000000"));
    }

    #[test]
    fn generated_ids_are_strictly_increasing() {
        let gen = SessionIdGenerator::new();
        let ids: Vec<u64> = (0..50)
            .map(|_| gen.next_id().as_str().parse().unwrap())
            .collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn blank_scan_status_has_empty_id() {
        let status = ScanStatus::default();
        assert!(status.scan_id.is_empty());
        assert_eq!(status.status, ScanState::Running);
        assert_eq!(status.progress, 0.0);
    }

    #[test]
    fn unix_seconds_to_rfc3339() {
        let s = rfc3339_from_unix(0.5).unwrap();
        assert!(s.starts_with("1970-01-01T00:00:00.5"));
        assert!(rfc3339_from_unix(f64::NAN).is_none());
    }
}
