//! Error type shared by sockets, the pool and the session controllers.
//!
//! Transport and protocol faults end a session; decode faults are logged and
//! dropped by the socket and never reach callers; control faults (bad ids) are
//! returned synchronously without touching any state.

use thiserror::Error;

use crate::types::Domain;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MonitorError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("stream closed by the server")]
    Closed,

    #[error("malformed frame: {0}")]
    Decode(String),

    #[error("server reported error: {0}")]
    Protocol(String),

    #[error("invalid session id: {0:?}")]
    InvalidSessionId(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("socket is not connected")]
    NotConnected,

    #[error("connection attempt was superseded by a disconnect")]
    Aborted,

    #[error("{0} sockets do not support subscriptions")]
    Unsupported(Domain),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("job request failed: {0}")]
    Job(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for MonitorError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        MonitorError::Transport(e.to_string())
    }
}

impl From<reqwest::Error> for MonitorError {
    fn from(e: reqwest::Error) -> Self {
        MonitorError::Job(e.to_string())
    }
}

impl From<serde_json::Error> for MonitorError {
    fn from(e: serde_json::Error) -> Self {
        MonitorError::Decode(e.to_string())
    }
}
