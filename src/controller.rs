//! Session controllers: start and stop probe and scan sessions.
//!
//! A controller drives one session at a time. It allocates (or obtains) the
//! session id, gets a socket from the shared pool, routes decoded frames into
//! its aggregator and runs the stop protocol: stop signal, grace period,
//! connection removal, frozen summary.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{MonitorConfig, ProbeConfig, ScanConfig};
use crate::error::MonitorError;
use crate::frames::ServerFrame;
use crate::jobs::ScanJobs;
use crate::pool::ConnectionPool;
use crate::ports::count_ports;
use crate::probe::ProbeAggregator;
use crate::scan::ScanAggregator;
use crate::socket::{probe_url, scan_url, ProbeParams, ScanParams, SessionSocket};
use crate::targets::count_hosts;
use crate::types::{
    Disposition, Domain, ProbeResult, ProbeStatus, ProbeSummary, ScanResult, ScanState,
    ScanStatus, SessionId, SessionIdGenerator, SessionKey,
};

struct ActiveSession {
    key: SessionKey,
    continuous: bool,
    stopping: bool,
    auto_stop: Option<CancellationToken>,
}

enum StopPlan {
    Nothing,
    /// The session already ended; only its connection is left to drop.
    Release(SessionKey),
    WindDown { key: SessionKey, continuous: bool },
}

/// Bookkeeping for the single session a controller owns.
#[derive(Default)]
struct SessionSlot {
    active: Mutex<Option<ActiveSession>>,
}

impl SessionSlot {
    fn install(&self, key: SessionKey, continuous: bool) {
        let previous = self.active.lock().replace(ActiveSession {
            key,
            continuous,
            stopping: false,
            auto_stop: None,
        });
        if let Some(auto_stop) = previous.and_then(|s| s.auto_stop) {
            auto_stop.cancel();
        }
    }

    fn is_current(&self, key: &SessionKey) -> bool {
        self.active.lock().as_ref().is_some_and(|s| s.key == *key)
    }

    /// Current and not being stopped; the stop path owns a winding-down
    /// session, including its connection going away.
    fn owns_fault(&self, key: &SessionKey) -> bool {
        self.active
            .lock()
            .as_ref()
            .is_some_and(|s| s.key == *key && !s.stopping)
    }

    fn key(&self) -> Option<SessionKey> {
        self.active.lock().as_ref().map(|s| s.key.clone())
    }

    fn set_auto_stop(&self, key: &SessionKey, token: CancellationToken) {
        match self.active.lock().as_mut() {
            Some(s) if s.key == *key && !s.stopping => s.auto_stop = Some(token),
            _ => token.cancel(),
        }
    }

    fn cancel_auto_stop(&self, key: &SessionKey) {
        if let Some(s) = self.active.lock().as_mut() {
            if s.key == *key {
                if let Some(t) = s.auto_stop.take() {
                    t.cancel();
                }
            }
        }
    }

    fn begin_stop(&self, id: &str, finished: bool) -> Result<StopPlan, MonitorError> {
        if id.trim().is_empty() {
            return Err(MonitorError::InvalidSessionId(id.to_string()));
        }
        let mut active = self.active.lock();
        let Some(session) = active.as_mut() else {
            return Ok(StopPlan::Nothing);
        };
        if session.key.id.as_str() != id {
            return Err(MonitorError::SessionNotFound(id.to_string()));
        }
        if session.stopping {
            return Ok(StopPlan::Nothing);
        }
        if let Some(t) = session.auto_stop.take() {
            t.cancel();
        }
        if finished {
            return Ok(StopPlan::Release(session.key.clone()));
        }
        session.stopping = true;
        Ok(StopPlan::WindDown {
            key: session.key.clone(),
            continuous: session.continuous,
        })
    }

    fn end_stop(&self, key: &SessionKey) {
        if let Some(s) = self.active.lock().as_mut() {
            if s.key == *key {
                s.stopping = false;
            }
        }
    }

    fn clear(&self) -> Option<SessionKey> {
        let session = self.active.lock().take()?;
        if let Some(t) = session.auto_stop {
            t.cancel();
        }
        Some(session.key)
    }
}

/// Send the stop signal and give the server `grace` to flush its last
/// frames. A missing connection is logged and otherwise ignored.
async fn signal_stop(pool: &ConnectionPool, key: &SessionKey, grace: Duration) {
    match pool.get(key) {
        Some(socket) => {
            socket.send_stop_signal();
            tokio::time::sleep(grace).await;
        }
        None => {
            let active: Vec<String> = pool.list_active().iter().map(ToString::to_string).collect();
            warn!(key = %key, active = ?active, "no pooled connection for session, closing anyway");
        }
    }
}

/// Act on an aggregator's end-of-stream verdict: a server-reported error
/// tears the connection down, a natural end only lets it age out.
fn release(pool: &ConnectionPool, key: &SessionKey, disposition: Disposition, failed: bool) {
    if disposition != Disposition::Release {
        return;
    }
    if failed {
        pool.remove(key);
    } else {
        pool.set_keep_alive(key, false);
    }
}

/// Runs probe campaigns over the probe stream.
#[derive(Clone)]
pub struct ProbeController {
    inner: Arc<ProbeInner>,
}

struct ProbeInner {
    pool: ConnectionPool,
    config: MonitorConfig,
    ids: SessionIdGenerator,
    aggregator: Mutex<ProbeAggregator>,
    slot: SessionSlot,
}

impl ProbeController {
    pub fn new(pool: ConnectionPool, config: MonitorConfig) -> Self {
        let aggregator = ProbeAggregator::new(config.probe_capacity, config.default_packet_size);
        Self {
            inner: Arc::new(ProbeInner {
                pool,
                config,
                ids: SessionIdGenerator::new(),
                aggregator: Mutex::new(aggregator),
                slot: SessionSlot::default(),
            }),
        }
    }

    /// Start a new campaign and return its session id.
    ///
    /// A session that is still active is stopped first. Bounded campaigns are
    /// stopped automatically once `count * interval` plus the configured
    /// buffer has elapsed.
    pub async fn start(&self, config: ProbeConfig) -> Result<SessionId, MonitorError> {
        let target = config.target.trim().to_string();
        if target.is_empty() {
            return Err(MonitorError::InvalidConfig("probe target is required".into()));
        }
        if !config.interval.is_finite() || config.interval <= 0.0 {
            return Err(MonitorError::InvalidConfig(format!(
                "probe interval must be positive, got {}",
                config.interval
            )));
        }
        if !config.continuous && config.count == 0 {
            return Err(MonitorError::InvalidConfig(
                "probe count must be at least 1 unless continuous".into(),
            ));
        }
        let url = probe_url(&self.inner.config.ws_base, &ProbeParams::from(&config))?;

        if let Some(previous) = self.inner.slot.key() {
            self.stop(previous.id.as_str()).await?;
        }

        let id = self.inner.ids.next_id();
        let key = SessionKey::new(Domain::Probe, id.clone());
        self.inner.aggregator.lock().begin(id.clone(), &config);
        self.inner.slot.install(key.clone(), config.continuous);

        let socket = self
            .inner
            .pool
            .acquire(key.clone(), || SessionSocket::new(Domain::Probe, url), true);

        let weak = Arc::downgrade(&self.inner);
        let on_message = {
            let weak = weak.clone();
            let key = key.clone();
            move |frame: ServerFrame| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_frame(&key, frame);
                }
            }
        };
        let on_error = {
            let key = key.clone();
            move |err: MonitorError| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_fault(&key, &err);
                }
            }
        };
        if let Err(e) = socket.connect(on_message, on_error).await {
            self.inner.on_fault(&key, &e);
            return Err(e);
        }

        if let Some(after) = config.auto_stop_after(self.inner.config.auto_stop_buffer) {
            self.schedule_auto_stop(&key, after);
        }
        info!(key = %key, host = %target, continuous = config.continuous, "probe session started");
        Ok(id)
    }

    /// Stop the session `id`.
    ///
    /// Stopping when nothing is active, or while a stop is already running,
    /// does nothing. An empty id or the id of another session is rejected
    /// without touching any state.
    pub async fn stop(&self, id: &str) -> Result<(), MonitorError> {
        let finished = !self.inner.aggregator.lock().is_running();
        let (key, continuous) = match self.inner.slot.begin_stop(id, finished)? {
            StopPlan::Nothing => return Ok(()),
            StopPlan::Release(key) => {
                self.inner.pool.remove(&key);
                return Ok(());
            }
            StopPlan::WindDown { key, continuous } => (key, continuous),
        };

        signal_stop(&self.inner.pool, &key, self.inner.config.stop_grace).await;

        let status = if continuous {
            ProbeStatus::Stopped
        } else {
            ProbeStatus::Completed
        };
        self.inner.aggregator.lock().finish(status);
        self.inner.pool.remove(&key);
        self.inner.slot.end_stop(&key);
        info!(key = %key, status = ?status, "probe session stopped");
        Ok(())
    }

    /// Drop the current session's connection and clear all results.
    pub fn reset(&self) {
        if let Some(key) = self.inner.slot.clear() {
            self.inner.pool.remove(&key);
        }
        self.inner.aggregator.lock().reset();
    }

    pub fn summary(&self) -> ProbeSummary {
        self.inner.aggregator.lock().summary().clone()
    }

    /// Buffered results, newest first.
    pub fn results(&self) -> Vec<ProbeResult> {
        self.inner.aggregator.lock().results().iter().cloned().collect()
    }

    pub fn error(&self) -> Option<String> {
        self.inner.aggregator.lock().error().map(String::from)
    }

    pub fn is_running(&self) -> bool {
        self.inner.aggregator.lock().is_running()
    }

    pub fn session_key(&self) -> Option<SessionKey> {
        self.inner.slot.key()
    }

    fn schedule_auto_stop(&self, key: &SessionKey, after: Duration) {
        let token = CancellationToken::new();
        let cancel = token.clone();
        let weak: Weak<ProbeInner> = Arc::downgrade(&self.inner);
        let id = key.id.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(after) => {
                    let Some(inner) = weak.upgrade() else { return };
                    let controller = ProbeController { inner };
                    if controller.is_running() {
                        info!(session_id = %id, "probe campaign window elapsed, stopping");
                        if let Err(e) = controller.stop(id.as_str()).await {
                            warn!(session_id = %id, error = %e, "automatic stop failed");
                        }
                    }
                }
            }
        });
        self.inner.slot.set_auto_stop(key, token);
    }
}

impl ProbeInner {
    fn on_frame(&self, key: &SessionKey, frame: ServerFrame) {
        if !self.slot.is_current(key) || !self.pool.contains(key) {
            debug!(key = %key, "dropping frame for a session that is no longer active");
            return;
        }
        self.pool.mark_active(key);
        let (disposition, failed) = {
            let mut aggregator = self.aggregator.lock();
            let disposition = aggregator.ingest(&frame);
            (disposition, aggregator.error().is_some())
        };
        release(&self.pool, key, disposition, failed);
    }

    /// The session's connection is gone. A bounded campaign whose stream
    /// closed after its last result completes; anything else still running
    /// ends in error.
    fn on_fault(&self, key: &SessionKey, err: &MonitorError) {
        if !self.slot.owns_fault(key) {
            return;
        }
        {
            let mut aggregator = self.aggregator.lock();
            if !aggregator.is_running() {
                debug!(key = %key, error = %err, "connection lost after the probe ended");
            } else if *err == MonitorError::Closed && aggregator.is_complete() {
                info!(key = %key, "probe stream closed after the last result");
                aggregator.finish(ProbeStatus::Completed);
            } else {
                warn!(key = %key, error = %err, "probe session failed");
                aggregator.fail(err.to_string());
            }
        }
        self.slot.cancel_auto_stop(key);
        self.pool.remove(key);
    }
}

/// Runs scan jobs: bootstraps them through [`ScanJobs`] and follows them on
/// the scan stream.
#[derive(Clone)]
pub struct ScanController {
    inner: Arc<ScanInner>,
}

struct ScanInner {
    pool: ConnectionPool,
    config: MonitorConfig,
    jobs: Arc<dyn ScanJobs>,
    aggregator: Mutex<ScanAggregator>,
    slot: SessionSlot,
}

impl ScanController {
    pub fn new(pool: ConnectionPool, config: MonitorConfig, jobs: Arc<dyn ScanJobs>) -> Self {
        let aggregator = ScanAggregator::new(config.scan_result_cap);
        Self {
            inner: Arc::new(ScanInner {
                pool,
                config,
                jobs,
                aggregator: Mutex::new(aggregator),
                slot: SessionSlot::default(),
            }),
        }
    }

    /// Start a scan job and follow it. Returns the job's id.
    pub async fn start(&self, config: ScanConfig) -> Result<SessionId, MonitorError> {
        let hosts = count_hosts(&config.targets)
            .map_err(|e| MonitorError::InvalidConfig(format!("{e:#}")))?;
        let ports = count_ports(&config.ports)
            .map_err(|e| MonitorError::InvalidConfig(format!("{e:#}")))?;
        let url = scan_url(&self.inner.config.ws_base, &ScanParams::from(&config))?;

        if let Some(previous) = self.inner.slot.key() {
            self.stop(previous.id.as_str()).await?;
        }

        let job = self.inner.jobs.start_scan(&config).await?;
        let id = SessionId::new(job.scan_id.trim());
        if id.is_empty() {
            return Err(MonitorError::Job("backend returned an empty scan id".into()));
        }
        let total = job
            .total_ports
            .filter(|t| *t > 0)
            .unwrap_or(hosts.saturating_mul(ports));
        let key = SessionKey::new(Domain::Scan, id.clone());
        self.inner
            .aggregator
            .lock()
            .begin(id.clone(), Some(total), job.start_time.clone());
        self.inner.slot.install(key.clone(), false);

        let socket = self
            .inner
            .pool
            .acquire(key.clone(), || SessionSocket::new(Domain::Scan, url), true);

        let weak = Arc::downgrade(&self.inner);
        let on_message = {
            let weak = weak.clone();
            let key = key.clone();
            move |frame: ServerFrame| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_frame(&key, frame);
                }
            }
        };
        let on_error = {
            let key = key.clone();
            move |err: MonitorError| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_fault(&key, &err);
                }
            }
        };
        if let Err(e) = socket.connect(on_message, on_error).await {
            self.inner.on_fault(&key, &e);
            return Err(e);
        }

        info!(key = %key, total_ports = total, "scan session started");
        Ok(id)
    }

    /// Stop the scan `id`; same rules as [`ProbeController::stop`]. The
    /// backend job is cancelled best-effort afterwards.
    pub async fn stop(&self, id: &str) -> Result<(), MonitorError> {
        let finished = !self.inner.aggregator.lock().is_running();
        let key = match self.inner.slot.begin_stop(id, finished)? {
            StopPlan::Nothing => return Ok(()),
            StopPlan::Release(key) => {
                self.inner.pool.remove(&key);
                return Ok(());
            }
            StopPlan::WindDown { key, .. } => key,
        };

        signal_stop(&self.inner.pool, &key, self.inner.config.stop_grace).await;

        self.inner.aggregator.lock().cancel();
        self.inner.pool.remove(&key);
        if let Err(e) = self.inner.jobs.stop_scan(&key.id).await {
            warn!(key = %key, error = %e, "backend did not acknowledge scan stop");
        }
        self.inner.slot.end_stop(&key);
        info!(key = %key, "scan session stopped");
        Ok(())
    }

    pub fn reset(&self) {
        if let Some(key) = self.inner.slot.clear() {
            self.inner.pool.remove(&key);
        }
        self.inner.aggregator.lock().reset();
    }

    pub fn status(&self) -> ScanStatus {
        self.inner.aggregator.lock().status().clone()
    }

    /// Discovered ports in arrival order.
    pub fn results(&self) -> Vec<ScanResult> {
        self.inner.aggregator.lock().results().iter().cloned().collect()
    }

    pub fn open_ports(&self) -> Vec<ScanResult> {
        self.inner.aggregator.lock().open_ports().cloned().collect()
    }

    pub fn error(&self) -> Option<String> {
        self.inner.aggregator.lock().status().error.clone()
    }

    pub fn is_running(&self) -> bool {
        self.inner.aggregator.lock().is_running()
    }

    pub fn session_key(&self) -> Option<SessionKey> {
        self.inner.slot.key()
    }
}

impl ScanInner {
    fn on_frame(&self, key: &SessionKey, frame: ServerFrame) {
        if !self.slot.is_current(key) || !self.pool.contains(key) {
            debug!(key = %key, "dropping frame for a session that is no longer active");
            return;
        }
        self.pool.mark_active(key);
        let (disposition, failed) = {
            let mut aggregator = self.aggregator.lock();
            let disposition = aggregator.ingest(&frame);
            (disposition, aggregator.status().status == ScanState::Failed)
        };
        release(&self.pool, key, disposition, failed);
    }

    fn on_fault(&self, key: &SessionKey, err: &MonitorError) {
        if !self.slot.owns_fault(key) {
            return;
        }
        {
            let mut aggregator = self.aggregator.lock();
            if aggregator.is_running() {
                warn!(key = %key, error = %err, "scan session failed");
                aggregator.fail(err.to_string());
            } else {
                debug!(key = %key, error = %err, "connection lost after the scan ended");
            }
        }
        self.pool.remove(key);
    }
}
