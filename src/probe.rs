//! Incremental aggregation of a probe stream.

use std::collections::VecDeque;

use tracing::{debug, warn};

use crate::config::ProbeConfig;
use crate::error::MonitorError;
use crate::frames::{PingResultFrame, ServerFrame};
use crate::types::{
    now_rfc3339, rfc3339_from_unix, Disposition, ProbeOutcome, ProbeResult, ProbeStatus,
    ProbeSummary, SessionId,
};

/// Keeps the newest `capacity` probe results and a summary derived from them.
#[derive(Debug, Clone)]
pub struct ProbeAggregator {
    capacity: usize,
    default_packet_size: u32,
    /// Packet size of the current session, used when a result has none.
    packet_size: u32,
    /// Results the campaign asked for; `None` when continuous.
    expected: Option<u64>,
    /// Results buffered since `begin`, including evicted ones.
    seen: u64,
    session_id: Option<SessionId>,
    target: String,
    start_time: Option<String>,
    end_time: Option<String>,
    running: bool,
    error: Option<String>,
    final_status: Option<ProbeStatus>,
    /// Newest first.
    results: VecDeque<ProbeResult>,
    summary: ProbeSummary,
}

impl ProbeAggregator {
    pub fn new(capacity: usize, default_packet_size: u32) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            default_packet_size,
            packet_size: default_packet_size,
            expected: None,
            seen: 0,
            session_id: None,
            target: String::new(),
            start_time: None,
            end_time: None,
            running: false,
            error: None,
            final_status: None,
            results: VecDeque::with_capacity(capacity),
            summary: ProbeSummary::default(),
        }
    }

    /// Start a fresh session, dropping everything from the previous one.
    pub fn begin(&mut self, id: SessionId, config: &ProbeConfig) {
        self.reset();
        self.session_id = Some(id);
        self.target = config.target.trim().to_string();
        if config.packet_size > 0 {
            self.packet_size = config.packet_size;
        }
        self.expected = (!config.continuous).then_some(u64::from(config.count));
        self.start_time = Some(now_rfc3339());
        self.running = true;
        self.recompute();
    }

    pub fn ingest(&mut self, frame: &ServerFrame) -> Disposition {
        match frame {
            ServerFrame::PingResult(r) => {
                if self.running {
                    self.push(r);
                } else {
                    debug!(sequence = ?r.sequence, "ignoring probe result after session end");
                }
                Disposition::Continue
            }
            ServerFrame::PingError { error } => {
                let error = error.clone().unwrap_or_else(|| "probe failed on the server".into());
                warn!(error = %error, "probe stream reported an error");
                self.running = false;
                self.error = Some(MonitorError::Protocol(error).to_string());
                self.recompute();
                Disposition::Release
            }
            ServerFrame::PingMonitorConnected { message } => {
                debug!(message = ?message, "probe monitor connected");
                Disposition::Continue
            }
            ServerFrame::Pong { .. } => Disposition::Continue,
            other => {
                debug!(frame = ?other, "ignoring frame on probe stream");
                Disposition::Continue
            }
        }
    }

    /// Record a transport fault. Buffered results are kept.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.running = false;
        self.error = Some(error.into());
        self.end_time.get_or_insert_with(now_rfc3339);
        self.recompute();
    }

    /// Freeze the summary with a final status and an end time.
    pub fn finish(&mut self, status: ProbeStatus) {
        self.running = false;
        self.final_status = Some(status);
        self.end_time.get_or_insert_with(now_rfc3339);
        self.recompute();
    }

    pub fn reset(&mut self) {
        self.packet_size = self.default_packet_size;
        self.expected = None;
        self.seen = 0;
        self.session_id = None;
        self.target.clear();
        self.start_time = None;
        self.end_time = None;
        self.running = false;
        self.error = None;
        self.final_status = None;
        self.results.clear();
        self.summary = ProbeSummary::default();
    }

    pub fn summary(&self) -> &ProbeSummary {
        &self.summary
    }

    /// Buffered results, newest first.
    pub fn results(&self) -> &VecDeque<ProbeResult> {
        &self.results
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// True once a bounded campaign has received every result it asked for.
    pub fn is_complete(&self) -> bool {
        self.expected.is_some_and(|n| self.seen >= n)
    }

    fn push(&mut self, frame: &PingResultFrame) {
        let status = frame
            .status
            .as_deref()
            .and_then(ProbeOutcome::parse)
            .unwrap_or(match frame.success {
                Some(true) => ProbeOutcome::Success,
                _ => ProbeOutcome::Timeout,
            });
        let sequence = match frame.sequence {
            Some(seq) if seq > 0 => seq,
            _ => self.results.len() as u64 + 1,
        };
        let result = ProbeResult {
            session_id: self.session_id.clone().unwrap_or_else(|| SessionId::new("")),
            target: frame.target.clone().unwrap_or_else(|| self.target.clone()),
            sequence,
            response_time: frame.response_time,
            ttl: frame.ttl,
            packet_size: frame
                .packet_size
                .filter(|s| *s > 0)
                .unwrap_or(self.packet_size),
            timestamp: frame
                .timestamp
                .filter(|t| *t > 0.0)
                .and_then(rfc3339_from_unix)
                .unwrap_or_else(now_rfc3339),
            status,
            error: frame.error_message.clone().or_else(|| frame.error.clone()),
        };

        self.seen += 1;
        self.results.push_front(result);
        self.results.truncate(self.capacity);
        self.recompute();
    }

    fn status(&self) -> ProbeStatus {
        if self.running {
            ProbeStatus::Running
        } else if self.error.is_some() {
            ProbeStatus::Error
        } else {
            self.final_status.unwrap_or(ProbeStatus::Completed)
        }
    }

    fn recompute(&mut self) {
        let sent = self.results.len() as u64;
        let successes = || {
            self.results
                .iter()
                .filter(|r| r.status == ProbeOutcome::Success)
        };
        let received = successes().count() as u64;
        let times: Vec<f64> = successes().filter_map(|r| r.response_time).collect();

        let (min_time, max_time, avg_time) = if times.is_empty() {
            (None, None, None)
        } else {
            let min = times.iter().copied().fold(f64::INFINITY, f64::min);
            let max = times.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let avg = times.iter().sum::<f64>() / times.len() as f64;
            (Some(min), Some(max), Some(avg))
        };

        self.summary = ProbeSummary {
            session_id: self.session_id.clone(),
            target: self.target.clone(),
            packets_sent: sent,
            packets_received: received,
            packet_loss: if sent == 0 {
                0.0
            } else {
                (sent - received) as f64 * 100.0 / sent as f64
            },
            min_time,
            max_time,
            avg_time,
            start_time: self.start_time.clone(),
            end_time: self.end_time.clone(),
            status: self.status(),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(seq: u64, ok: bool, rtt: Option<f64>) -> ServerFrame {
        ServerFrame::PingResult(PingResultFrame {
            target: Some("10.0.0.1".into()),
            sequence: Some(seq),
            response_time: rtt,
            success: Some(ok),
            ..Default::default()
        })
    }

    fn config(count: u32, continuous: bool) -> ProbeConfig {
        ProbeConfig {
            target: " 10.0.0.1 ".into(),
            count,
            continuous,
            packet_size: 0,
            ..Default::default()
        }
    }

    fn started() -> ProbeAggregator {
        let mut agg = ProbeAggregator::new(100, 64);
        agg.begin(SessionId::new("1700000000000"), &config(10, true));
        agg
    }

    #[test]
    fn empty_summary_has_no_times() {
        let agg = started();
        let s = agg.summary();
        assert_eq!((s.packets_sent, s.packets_received), (0, 0));
        assert_eq!(s.packet_loss, 0.0);
        assert_eq!(s.min_time, None);
        assert_eq!(s.status, ProbeStatus::Running);
    }

    #[test]
    fn alternating_results_give_forty_percent_loss() {
        let mut agg = started();
        for seq in 1..=5 {
            let ok = seq % 2 == 1;
            agg.ingest(&result(seq, ok, ok.then_some(seq as f64 * 10.0)));
        }
        let s = agg.summary();
        assert_eq!(s.packets_sent, 5);
        assert_eq!(s.packets_received, 3);
        assert!((s.packet_loss - 40.0).abs() < 1e-9);
        assert_eq!(s.min_time, Some(10.0));
        assert_eq!(s.max_time, Some(50.0));
        assert_eq!(s.avg_time, Some(30.0));
        assert_eq!(agg.results().front().unwrap().sequence, 5);
    }

    #[test]
    fn buffer_evicts_oldest_beyond_capacity() {
        let mut agg = started();
        for seq in 1..=101 {
            agg.ingest(&result(seq, true, Some(1.0)));
        }
        assert_eq!(agg.results().len(), 100);
        assert_eq!(agg.results().front().unwrap().sequence, 101);
        assert_eq!(agg.results().back().unwrap().sequence, 2);
        assert_eq!(agg.summary().packets_sent, 100);
    }

    #[test]
    fn missing_fields_get_defaults() {
        let mut agg = started();
        agg.ingest(&result(0, true, Some(2.0)));
        agg.ingest(&ServerFrame::PingResult(PingResultFrame {
            status: Some("error".into()),
            error: Some("unreachable".into()),
            ..Default::default()
        }));
        let newest = agg.results().front().unwrap();
        assert_eq!(newest.sequence, 2);
        assert_eq!(newest.status, ProbeOutcome::Error);
        assert_eq!(newest.packet_size, 64);
        assert_eq!(newest.target, "10.0.0.1");
        assert_eq!(newest.error.as_deref(), Some("unreachable"));
        assert_eq!(newest.response_time, None);
        assert_eq!(agg.results().back().unwrap().sequence, 1);
    }

    #[test]
    fn server_error_stops_but_keeps_buffer() {
        let mut agg = started();
        agg.ingest(&result(1, true, Some(3.0)));
        let d = agg.ingest(&ServerFrame::PingError { error: Some("boom".into()) });
        assert_eq!(d, Disposition::Release);
        assert!(!agg.is_running());
        assert_eq!(agg.error(), Some("server reported error: boom"));
        assert_eq!(agg.results().len(), 1);
        assert_eq!(agg.summary().status, ProbeStatus::Error);

        // late results are not buffered
        agg.ingest(&result(2, true, Some(3.0)));
        assert_eq!(agg.results().len(), 1);
    }

    #[test]
    fn recompute_is_idempotent_and_finish_freezes() {
        let mut agg = started();
        agg.ingest(&result(1, true, Some(5.0)));
        agg.ingest(&ServerFrame::Pong { timestamp: None });
        agg.ingest(&ServerFrame::Unknown);
        let before = agg.summary().clone();
        agg.recompute();
        assert_eq!(&before, agg.summary());

        agg.finish(ProbeStatus::Stopped);
        let s = agg.summary();
        assert_eq!(s.status, ProbeStatus::Stopped);
        assert!(s.end_time.is_some());
        assert_eq!(s.packets_sent, 1);
    }

    #[test]
    fn session_packet_size_fills_missing_sizes() {
        let mut agg = ProbeAggregator::new(100, 64);
        let cfg = ProbeConfig {
            packet_size: 1200,
            ..config(3, false)
        };
        agg.begin(SessionId::new("1"), &cfg);
        agg.ingest(&result(1, true, Some(1.0)));
        assert_eq!(agg.results()[0].packet_size, 1200);
        assert_eq!(agg.summary().target, "10.0.0.1");

        // a fresh session without a size goes back to the default
        agg.begin(SessionId::new("2"), &config(3, false));
        agg.ingest(&result(1, true, Some(1.0)));
        assert_eq!(agg.results()[0].packet_size, 64);
    }

    #[test]
    fn bounded_campaign_completes_after_count_results() {
        let mut agg = ProbeAggregator::new(2, 64);
        agg.begin(SessionId::new("1"), &config(3, false));
        for seq in 1..=2 {
            agg.ingest(&result(seq, true, Some(1.0)));
        }
        assert!(!agg.is_complete());
        agg.ingest(&result(3, false, None));
        // eviction does not hide results already seen
        assert_eq!(agg.results().len(), 2);
        assert!(agg.is_complete());

        let mut continuous = started();
        continuous.ingest(&result(1, true, Some(1.0)));
        assert!(!continuous.is_complete());
    }

    #[test]
    fn malformed_frame_leaves_buffer_and_summary_alone() {
        let mut agg = started();
        agg.ingest(&result(1, true, Some(4.0)));
        agg.ingest(&result(2, false, None));
        let results_before = agg.results().clone();
        let summary_before = agg.summary().clone();

        for text in [
            r#"{"type": "ping_result", "sequence": 3"#,
            r#"{"type": "ping_result", "sequence": "three"}"#,
            r#"{"type": "ping_histogram", "buckets": []}"#,
        ] {
            // undecodable text never reaches the aggregator
            if let Ok(frame) = ServerFrame::decode(text) {
                assert_eq!(agg.ingest(&frame), Disposition::Continue);
            }
            assert_eq!(agg.results(), &results_before);
            assert_eq!(agg.summary(), &summary_before);
        }
    }
}
