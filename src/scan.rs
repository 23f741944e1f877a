//! Incremental aggregation of a scan stream.

use std::collections::VecDeque;

use tracing::{debug, info, warn};

use crate::error::MonitorError;
use crate::frames::{PortFoundFrame, ScanProgressFrame, ServerFrame};
use crate::types::{
    now_rfc3339, Disposition, PortState, ScanResult, ScanState, ScanStatus, SessionId,
};

const UNKNOWN_SERVICE: &str = "unknown";

#[derive(Debug, Clone)]
pub struct ScanAggregator {
    /// `None` keeps every result.
    cap: Option<usize>,
    status: ScanStatus,
    results: VecDeque<ScanResult>,
}

impl ScanAggregator {
    pub fn new(cap: Option<usize>) -> Self {
        Self {
            cap: cap.map(|c| c.max(1)),
            status: ScanStatus::default(),
            results: VecDeque::new(),
        }
    }

    /// Start tracking a new job. `total_ports` of `None` leaves the total to
    /// be filled from the stream.
    pub fn begin(&mut self, id: SessionId, total_ports: Option<u64>, start_time: Option<String>) {
        self.results.clear();
        self.status = ScanStatus {
            scan_id: id,
            status: ScanState::Running,
            total_ports: total_ports.unwrap_or(0),
            start_time: start_time.unwrap_or_else(now_rfc3339),
            ..Default::default()
        };
    }

    pub fn ingest(&mut self, frame: &ServerFrame) -> Disposition {
        if self.status.status.is_terminal() {
            debug!(scan_id = %self.status.scan_id, "ignoring frame after scan end");
            return Disposition::Continue;
        }
        match frame {
            ServerFrame::ScanProgress(p) => {
                self.apply_progress(p);
                Disposition::Continue
            }
            ServerFrame::ScanPortFound(f) => {
                self.push(f);
                Disposition::Continue
            }
            ServerFrame::ScanStarted(s) => {
                if self.status.total_ports == 0 {
                    if let Some(total) = s.total_ports {
                        self.status.total_ports = total;
                    }
                }
                debug!(host = ?s.target, total = ?s.total_ports, "scan started on target");
                Disposition::Continue
            }
            ServerFrame::ScanTargetError { target, error } => {
                let msg = format!(
                    "{}: {}",
                    target.as_deref().unwrap_or("?"),
                    error.as_deref().unwrap_or("scan failed")
                );
                warn!(scan_id = %self.status.scan_id, error = %msg, "scan target failed");
                self.status.target_errors.push(msg);
                Disposition::Continue
            }
            ServerFrame::ScanCompleted { .. } => {
                self.status.status = ScanState::Completed;
                self.status.progress = 100.0;
                if self.status.total_ports > 0 {
                    self.status.scanned_ports = self.status.total_ports;
                }
                self.status.end_time = Some(now_rfc3339());
                info!(scan_id = %self.status.scan_id, found = self.status.found_ports, "scan completed");
                Disposition::Release
            }
            ServerFrame::ScanError { error } => {
                let error = error.clone().unwrap_or_else(|| "scan failed on the server".into());
                warn!(scan_id = %self.status.scan_id, error = %error, "scan stream reported an error");
                self.status.status = ScanState::Failed;
                self.status.error = Some(MonitorError::Protocol(error).to_string());
                self.status.end_time = Some(now_rfc3339());
                Disposition::Release
            }
            ServerFrame::MonitorConnected { message } => {
                debug!(message = ?message, "scan monitor connected");
                Disposition::Continue
            }
            ServerFrame::Pong { .. } => Disposition::Continue,
            other => {
                debug!(frame = ?other, "ignoring frame on scan stream");
                Disposition::Continue
            }
        }
    }

    /// Mark a running scan as cancelled by the client.
    pub fn cancel(&mut self) {
        if self.status.status == ScanState::Running {
            self.status.status = ScanState::Cancelled;
            self.status.end_time = Some(now_rfc3339());
        }
    }

    /// Record a transport fault on a running scan.
    pub fn fail(&mut self, error: impl Into<String>) {
        if self.status.status == ScanState::Running {
            self.status.status = ScanState::Failed;
            self.status.error = Some(error.into());
            self.status.end_time = Some(now_rfc3339());
        }
    }

    pub fn reset(&mut self) {
        self.status = ScanStatus::default();
        self.results.clear();
    }

    pub fn status(&self) -> &ScanStatus {
        &self.status
    }

    /// Discovered ports in arrival order.
    pub fn results(&self) -> &VecDeque<ScanResult> {
        &self.results
    }

    pub fn open_ports(&self) -> impl Iterator<Item = &ScanResult> {
        self.results.iter().filter(|r| r.state == PortState::Open)
    }

    pub fn is_running(&self) -> bool {
        !self.status.scan_id.is_empty() && self.status.status == ScanState::Running
    }

    fn apply_progress(&mut self, p: &ScanProgressFrame) {
        let total = self.status.total_ports;
        let bound = |v: u64| if total > 0 { v.min(total) } else { v };

        if let Some(progress) = p.progress.filter(|v| v.is_finite()) {
            let progress = progress.clamp(0.0, 100.0);
            self.status.progress = self.status.progress.max(progress);
        }
        if let Some(scanned) = p.ports_scanned {
            self.status.scanned_ports = self.status.scanned_ports.max(bound(scanned));
        }
        if let Some(found) = p.open_ports_found {
            self.status.found_ports = self.status.found_ports.max(bound(found));
        }
    }

    fn push(&mut self, f: &PortFoundFrame) {
        let report = f.result.clone().unwrap_or_default();
        let state = report
            .status
            .as_deref()
            .and_then(PortState::parse)
            .unwrap_or(PortState::Open);
        let service = report
            .service
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| UNKNOWN_SERVICE.to_string());

        self.results.push_back(ScanResult {
            scan_id: self.status.scan_id.clone(),
            target: f.target.clone().unwrap_or_default(),
            port: f.port,
            state,
            service,
            timestamp: now_rfc3339(),
        });
        if let Some(cap) = self.cap {
            while self.results.len() > cap {
                self.results.pop_front();
            }
        }

        let open = self.open_ports().count() as u64;
        if open > self.status.found_ports {
            self.status.found_ports = open;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::{PortReport, ScanStartedFrame};

    fn started(total: Option<u64>) -> ScanAggregator {
        let mut agg = ScanAggregator::new(None);
        agg.begin(SessionId::new("job-1"), total, None);
        agg
    }

    fn progress(p: f64, scanned: u64, found: u64) -> ServerFrame {
        ServerFrame::ScanProgress(ScanProgressFrame {
            progress: Some(p),
            ports_scanned: Some(scanned),
            open_ports_found: Some(found),
        })
    }

    fn found(port: u16, service: Option<&str>) -> ServerFrame {
        ServerFrame::ScanPortFound(PortFoundFrame {
            task_id: None,
            target: Some("10.0.0.1".into()),
            port,
            result: Some(PortReport {
                status: None,
                service: service.map(String::from),
            }),
        })
    }

    #[test]
    fn progress_then_completed_reaches_hundred() {
        let mut agg = started(Some(1000));
        agg.ingest(&progress(42.0, 420, 2));
        assert_eq!(agg.status().progress, 42.0);
        let d = agg.ingest(&ServerFrame::ScanCompleted { task_id: None });
        assert_eq!(d, Disposition::Release);
        let s = agg.status();
        assert_eq!(s.status, ScanState::Completed);
        assert_eq!(s.progress, 100.0);
        assert!(s.end_time.is_some());
        assert!(!agg.is_running());
    }

    #[test]
    fn progress_is_clamped_and_monotonic() {
        let mut agg = started(Some(100));
        agg.ingest(&progress(150.0, 500, 7));
        assert_eq!(agg.status().progress, 100.0);
        assert_eq!(agg.status().scanned_ports, 100);

        let mut agg = started(Some(100));
        agg.ingest(&progress(60.0, 60, 3));
        agg.ingest(&progress(-5.0, 10, 1));
        let s = agg.status();
        assert_eq!((s.progress, s.scanned_ports, s.found_ports), (60.0, 60, 3));
    }

    #[test]
    fn port_found_defaults_and_cap() {
        let mut agg = ScanAggregator::new(Some(2));
        agg.begin(SessionId::new("job-2"), Some(10), None);
        agg.ingest(&found(22, Some("ssh")));
        agg.ingest(&found(80, None));
        agg.ingest(&found(443, Some("")));
        let ports: Vec<u16> = agg.results().iter().map(|r| r.port).collect();
        assert_eq!(ports, vec![80, 443]);
        assert!(agg.results().iter().all(|r| r.service == "unknown"));
        assert!(agg.results().iter().all(|r| r.state == PortState::Open));
        assert_eq!(agg.status().found_ports, 2);
    }

    #[test]
    fn started_fills_unknown_total_and_target_errors_are_kept() {
        let mut agg = started(None);
        agg.ingest(&ServerFrame::ScanStarted(ScanStartedFrame {
            target: Some("10.0.0.1".into()),
            total_ports: Some(1000),
        }));
        agg.ingest(&ServerFrame::ScanTargetError {
            target: Some("10.0.0.9".into()),
            error: Some("host unreachable".into()),
        });
        let s = agg.status();
        assert_eq!(s.total_ports, 1000);
        assert_eq!(s.target_errors, vec!["10.0.0.9: host unreachable".to_string()]);
        assert_eq!(s.status, ScanState::Running);
    }

    #[test]
    fn terminal_state_ignores_later_frames() {
        let mut agg = started(Some(10));
        let d = agg.ingest(&ServerFrame::ScanError { error: Some("denied".into()) });
        assert_eq!(d, Disposition::Release);
        agg.ingest(&found(22, None));
        agg.ingest(&ServerFrame::ScanCompleted { task_id: None });
        agg.cancel();
        let s = agg.status();
        assert_eq!(s.status, ScanState::Failed);
        assert_eq!(s.error.as_deref(), Some("server reported error: denied"));
        assert!(agg.results().is_empty());
    }

    #[test]
    fn cancel_only_affects_running_scans() {
        let mut agg = started(Some(10));
        agg.cancel();
        assert_eq!(agg.status().status, ScanState::Cancelled);
        agg.fail("late transport error");
        assert_eq!(agg.status().status, ScanState::Cancelled);
        assert!(agg.status().error.is_none());
    }
}
