//! JSON frames exchanged over the monitoring streams.
//!
//! Every frame is a JSON object tagged by `type`. Server frames are decoded
//! leniently: optional fields may be missing or `null`, unknown `type` values
//! decode to [`ServerFrame::Unknown`]. Anything that is not a typed JSON object
//! is a decode error.

use serde::{Deserialize, Serialize};

use crate::types::{Domain, SessionId};

/// Frames sent by this client.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Heartbeat; `timestamp` is unix milliseconds.
    Ping { timestamp: u64 },
    Subscribe { session_id: SessionId },
    Unsubscribe { session_id: SessionId },
    StopPing { timestamp: u64 },
    StopScan { timestamp: u64 },
}

impl ClientFrame {
    pub fn stop_for(domain: Domain, timestamp: u64) -> Self {
        match domain {
            Domain::Probe => ClientFrame::StopPing { timestamp },
            Domain::Scan => ClientFrame::StopScan { timestamp },
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Frames pushed by the monitoring backend.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    PingResult(PingResultFrame),
    PingMonitorConnected {
        #[serde(default)]
        message: Option<String>,
    },
    PingError {
        #[serde(default)]
        error: Option<String>,
    },
    MonitorConnected {
        #[serde(default)]
        message: Option<String>,
    },
    ScanStarted(ScanStartedFrame),
    ScanProgress(ScanProgressFrame),
    ScanPortFound(PortFoundFrame),
    ScanTargetError {
        #[serde(default)]
        target: Option<String>,
        #[serde(default)]
        error: Option<String>,
    },
    ScanCompleted {
        #[serde(default)]
        task_id: Option<String>,
    },
    ScanError {
        #[serde(default)]
        error: Option<String>,
    },
    Pong {
        #[serde(default)]
        timestamp: Option<f64>,
    },
    #[serde(other)]
    Unknown,
}

impl ServerFrame {
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Default)]
pub struct PingResultFrame {
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub sequence: Option<u64>,
    #[serde(default)]
    pub response_time: Option<f64>,
    #[serde(default)]
    pub ttl: Option<u32>,
    #[serde(default)]
    pub packet_size: Option<u32>,
    /// Unix seconds, fractional.
    #[serde(default)]
    pub timestamp: Option<f64>,
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Default)]
pub struct ScanStartedFrame {
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub total_ports: Option<u64>,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Default)]
pub struct ScanProgressFrame {
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub ports_scanned: Option<u64>,
    #[serde(default)]
    pub open_ports_found: Option<u64>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct PortFoundFrame {
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub target: Option<String>,
    pub port: u16,
    #[serde(default)]
    pub result: Option<PortReport>,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Default)]
pub struct PortReport {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub service: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn decode_ping_result_with_nulls() {
        let text = r#"{"type":"ping_result","target":"1.1.1.1","sequence":3,
            "success":false,"status":"timeout","response_time":null,"ttl":null,
            "packet_size":32,"timestamp":1700000000.25,"error":null,
            "error_message":"timed out","error_type":"timeout"}"#;
        let ServerFrame::PingResult(r) = ServerFrame::decode(text).unwrap() else {
            panic!("expected ping_result");
        };
        assert_eq!(r.sequence, Some(3));
        assert_eq!(r.response_time, None);
        assert_eq!(r.status.as_deref(), Some("timeout"));
        assert_eq!(r.error_message.as_deref(), Some("timed out"));
    }

    #[test]
    fn decode_scan_frames_ignoring_extra_fields() {
        let found = ServerFrame::decode(
            r#"{"type":"scan_port_found","task_id":"t","target":"10.0.0.1","port":22,
                "result":{"status":"open","service":"ssh","response_time":1.2},"timestamp":1.0}"#,
        )
        .unwrap();
        match found {
            ServerFrame::ScanPortFound(f) => {
                assert_eq!(f.port, 22);
                assert_eq!(f.result.unwrap().service.as_deref(), Some("ssh"));
            }
            other => panic!("unexpected frame: {other:?}"),
        }

        let done = ServerFrame::decode(r#"{"type":"scan_completed","task_id":"t","total_targets":1}"#)
            .unwrap();
        assert_eq!(done, ServerFrame::ScanCompleted { task_id: Some("t".into()) });
    }

    #[test]
    fn unknown_type_is_not_an_error() {
        let f = ServerFrame::decode(r#"{"type":"server_broadcast","message":"hi"}"#).unwrap();
        assert_eq!(f, ServerFrame::Unknown);
    }

    #[test]
    fn malformed_frames_fail_to_decode() {
        assert!(ServerFrame::decode("not json").is_err());
        assert!(ServerFrame::decode(r#"{"no_type":1}"#).is_err());
        assert!(ServerFrame::decode(r#"{"type":"scan_port_found"}"#).is_err());
    }

    #[test]
    fn client_frames_use_wire_names() {
        let hb: Value = serde_json::from_str(&ClientFrame::Ping { timestamp: 7 }.encode().unwrap())
            .unwrap();
        assert_eq!(hb, json!({"type": "ping", "timestamp": 7}));

        let sub = ClientFrame::Subscribe { session_id: SessionId::new("42") };
        let sub: Value = serde_json::from_str(&sub.encode().unwrap()).unwrap();
        assert_eq!(sub, json!({"type": "subscribe", "session_id": "42"}));

        let stop: Value =
            serde_json::from_str(&ClientFrame::stop_for(Domain::Scan, 9).encode().unwrap()).unwrap();
        assert_eq!(stop["type"], "stop_scan");
    }
}
