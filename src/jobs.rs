//! Job bootstrap over the request/reply API.
//!
//! Scans are started and stopped by id through HTTP; progress then arrives
//! on the scan stream. [`ScanJobs`] is the seam the scan controller talks to.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::config::ScanConfig;
use crate::error::MonitorError;
use crate::types::{ScanJob, SessionId};

#[async_trait]
pub trait ScanJobs: Send + Sync {
    /// Start a scan job and return the id its stream is keyed by.
    async fn start_scan(&self, config: &ScanConfig) -> Result<ScanJob, MonitorError>;

    /// Ask the backend to cancel a job.
    async fn stop_scan(&self, id: &SessionId) -> Result<(), MonitorError>;
}

/// [`ScanJobs`] backed by `POST {api}/scan/start` and `POST {api}/scan/stop/{id}`.
#[derive(Debug, Clone)]
pub struct HttpScanJobs {
    client: reqwest::Client,
    api_base: String,
}

impl HttpScanJobs {
    pub fn new(api_base: impl Into<String>, timeout: Duration) -> Result<Self, MonitorError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
        })
    }

    async fn post(&self, path: &str, body: Option<&Value>) -> Result<Value, MonitorError> {
        let url = format!("{}/{}", self.api_base, path);
        let mut req = self.client.post(&url);
        if let Some(body) = body {
            req = req.json(body);
        }
        let response = req.send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(MonitorError::Job(format!("{url} returned {status}: {text}")));
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl ScanJobs for HttpScanJobs {
    async fn start_scan(&self, config: &ScanConfig) -> Result<ScanJob, MonitorError> {
        let body = json!({
            "target": config.targets,
            "ports": config.ports,
            "scan_type": config.scan_type.as_str(),
            "timeout": config.timeout,
            "max_threads": config.max_threads,
        });
        let reply = self.post("scan/start", Some(&body)).await?;
        let job = parse_job(reply)?;
        info!(scan_id = %job.scan_id, total_ports = ?job.total_ports, "scan job started");
        Ok(job)
    }

    async fn stop_scan(&self, id: &SessionId) -> Result<(), MonitorError> {
        self.post(&format!("scan/stop/{id}"), None).await?;
        debug!(scan_id = %id, "scan job stop requested");
        Ok(())
    }
}

/// Accept both the `{success, message, data: {...}}` envelope and a bare job object.
pub fn parse_job(reply: Value) -> Result<ScanJob, MonitorError> {
    if reply.get("success").and_then(Value::as_bool) == Some(false) {
        let message = reply
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("job was rejected");
        return Err(MonitorError::Job(message.to_string()));
    }
    let data = match reply {
        Value::Object(mut map) if map.contains_key("data") => map.remove("data").unwrap_or_default(),
        other => other,
    };
    serde_json::from_value(data).map_err(|e| MonitorError::Job(format!("unexpected job reply: {e}")))
}
