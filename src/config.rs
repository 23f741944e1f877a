use std::time::Duration;

use url::Url;

use crate::error::MonitorError;

/// Runtime settings for the pool, sockets and controllers.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Base of the streaming endpoints, e.g. `ws://127.0.0.1:8000`.
    pub ws_base: String,
    /// Base of the job API, e.g. `http://127.0.0.1:8000/api/v1`.
    pub api_base: String,
    pub heartbeat_interval: Duration,
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
    /// Time the server gets to flush final frames after a stop signal.
    pub stop_grace: Duration,
    /// Added to `count * interval` before a bounded probe is force-stopped.
    pub auto_stop_buffer: Duration,
    pub probe_capacity: usize,
    /// `None` keeps every scan result.
    pub scan_result_cap: Option<usize>,
    pub default_packet_size: u32,
    pub request_timeout: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            ws_base: "ws://127.0.0.1:8000".into(),
            api_base: "http://127.0.0.1:8000/api/v1".into(),
            heartbeat_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(5 * 60),
            sweep_interval: Duration::from_secs(60),
            stop_grace: Duration::from_millis(500),
            auto_stop_buffer: Duration::from_secs(5),
            probe_capacity: 100,
            scan_result_cap: None,
            default_packet_size: 64,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl MonitorConfig {
    pub fn validate(&self) -> Result<(), MonitorError> {
        let ws = Url::parse(&self.ws_base)
            .map_err(|e| MonitorError::InvalidConfig(format!("ws_base {:?}: {e}", self.ws_base)))?;
        if !matches!(ws.scheme(), "ws" | "wss") {
            return Err(MonitorError::InvalidConfig(format!(
                "ws_base must use ws:// or wss://, got {}",
                ws.scheme()
            )));
        }
        Url::parse(&self.api_base).map_err(|e| {
            MonitorError::InvalidConfig(format!("api_base {:?}: {e}", self.api_base))
        })?;
        for (name, d) in [
            ("heartbeat_interval", self.heartbeat_interval),
            ("idle_timeout", self.idle_timeout),
            ("sweep_interval", self.sweep_interval),
        ] {
            if d.is_zero() {
                return Err(MonitorError::InvalidConfig(format!("{name} must be non-zero")));
            }
        }
        if self.probe_capacity == 0 {
            return Err(MonitorError::InvalidConfig("probe_capacity must be at least 1".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanType {
    #[default]
    Tcp,
    Udp,
    Syn,
}

impl ScanType {
    pub fn as_str(self) -> &'static str {
        match self {
            ScanType::Tcp => "tcp",
            ScanType::Udp => "udp",
            ScanType::Syn => "syn",
        }
    }
}

impl std::str::FromStr for ScanType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(ScanType::Tcp),
            "udp" => Ok(ScanType::Udp),
            "syn" => Ok(ScanType::Syn),
            other => Err(format!("unknown scan type: {other}")),
        }
    }
}

/// One probe campaign.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeConfig {
    pub target: String,
    pub count: u32,
    /// Seconds between probes.
    pub interval: f64,
    /// Packet size recorded for results that do not carry one; 0 falls back
    /// to [`MonitorConfig::default_packet_size`].
    pub packet_size: u32,
    pub continuous: bool,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            target: String::new(),
            count: 10,
            interval: 1.0,
            packet_size: 64,
            continuous: false,
        }
    }
}

impl ProbeConfig {
    /// Deadline after which a bounded campaign is stopped even without a
    /// natural end from the server. `None` for continuous runs.
    pub fn auto_stop_after(&self, buffer: Duration) -> Option<Duration> {
        if self.continuous || self.count == 0 {
            return None;
        }
        let secs = f64::from(self.count) * self.interval.max(0.0);
        Some(Duration::from_secs_f64(secs) + buffer)
    }
}

/// One scan job. `targets` is comma separated; `ports` uses the
/// `22,80,8000-8010` syntax.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanConfig {
    pub targets: String,
    pub ports: String,
    pub scan_type: ScanType,
    pub timeout: f64,
    pub max_threads: u32,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            targets: String::new(),
            ports: "1-1000".into(),
            scan_type: ScanType::Tcp,
            timeout: 3.0,
            max_threads: 200,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(MonitorConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_http_stream_base_and_zero_periods() {
        let cfg = MonitorConfig { ws_base: "http://localhost".into(), ..Default::default() };
        assert!(cfg.validate().is_err());

        let cfg = MonitorConfig { sweep_interval: Duration::ZERO, ..Default::default() };
        assert!(matches!(cfg.validate(), Err(MonitorError::InvalidConfig(_))));
    }

    #[test]
    fn auto_stop_only_for_bounded_probes() {
        let buffer = Duration::from_secs(5);
        let bounded = ProbeConfig { count: 5, interval: 1.0, ..Default::default() };
        assert_eq!(bounded.auto_stop_after(buffer), Some(Duration::from_secs(10)));

        let continuous = ProbeConfig { continuous: true, ..bounded };
        assert_eq!(continuous.auto_stop_after(buffer), None);
    }
}
