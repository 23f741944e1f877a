//! One streaming connection to a probe or scan endpoint.
//!
//! A [`SessionSocket`] owns at most one physical WebSocket at a time. Inbound
//! text frames are decoded by a reader task and handed to the caller's
//! handler; outbound frames go through an unbounded channel drained by a
//! writer task, so every `send_*` call is synchronous and never blocks.
//!
//! The socket never schedules heartbeats itself; the connection pool decides
//! when to call [`SessionSocket::send_heartbeat`].

use std::collections::BTreeSet;
use std::sync::{Arc, Weak};

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{ProbeConfig, ScanConfig};
use crate::error::MonitorError;
use crate::frames::{ClientFrame, ServerFrame};
use crate::types::{unix_millis, Domain, SessionId};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type FaultHandler = Arc<dyn Fn(MonitorError) + Send + Sync>;

pub const PROBE_PATH: &str = "api/v1/ws/ping";
pub const SCAN_PATH: &str = "api/v1/ws/scan";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SocketState {
    #[default]
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Query parameters of the probe stream. `None` fields are left out of the URL.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProbeParams {
    pub target: Option<String>,
    /// `-1` asks the server for a continuous run.
    pub count: Option<i64>,
    pub interval: Option<f64>,
}

impl From<&ProbeConfig> for ProbeParams {
    fn from(cfg: &ProbeConfig) -> Self {
        let target = cfg.target.trim();
        Self {
            target: (!target.is_empty()).then(|| target.to_string()),
            count: Some(if cfg.continuous { -1 } else { i64::from(cfg.count) }),
            interval: Some(cfg.interval),
        }
    }
}

/// Query parameters of the scan stream. `None` fields are left out of the URL.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ScanParams {
    pub targets: Option<String>,
    pub ports: Option<String>,
    pub scan_type: Option<String>,
    pub max_threads: Option<u32>,
}

impl From<&ScanConfig> for ScanParams {
    fn from(cfg: &ScanConfig) -> Self {
        let non_empty = |s: &str| {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        };
        Self {
            targets: non_empty(&cfg.targets),
            ports: non_empty(&cfg.ports),
            scan_type: Some(cfg.scan_type.as_str().to_string()),
            max_threads: Some(cfg.max_threads),
        }
    }
}

pub fn probe_url(ws_base: &str, params: &ProbeParams) -> Result<Url, MonitorError> {
    let mut query = Vec::new();
    if let Some(t) = &params.target {
        query.push(("target", t.clone()));
    }
    if let Some(c) = params.count {
        query.push(("count", c.to_string()));
    }
    if let Some(i) = params.interval {
        query.push(("interval", i.to_string()));
    }
    endpoint_url(ws_base, PROBE_PATH, &query)
}

pub fn scan_url(ws_base: &str, params: &ScanParams) -> Result<Url, MonitorError> {
    let mut query = Vec::new();
    if let Some(t) = &params.targets {
        query.push(("targets", t.clone()));
    }
    if let Some(p) = &params.ports {
        query.push(("ports", p.clone()));
    }
    if let Some(s) = &params.scan_type {
        query.push(("scan_type", s.clone()));
    }
    if let Some(m) = params.max_threads {
        query.push(("max_threads", m.to_string()));
    }
    endpoint_url(ws_base, SCAN_PATH, &query)
}

fn endpoint_url(ws_base: &str, path: &str, query: &[(&str, String)]) -> Result<Url, MonitorError> {
    let mut base = ws_base.trim().to_string();
    if !base.ends_with('/') {
        base.push('/');
    }
    let mut url = Url::parse(&base)
        .and_then(|b| b.join(path))
        .map_err(|e| MonitorError::InvalidConfig(format!("stream endpoint {ws_base:?}: {e}")))?;
    if !query.is_empty() {
        let mut pairs = url.query_pairs_mut();
        for (k, v) in query {
            pairs.append_pair(k, v);
        }
    }
    Ok(url)
}

pub struct SessionSocket {
    domain: Domain,
    url: Url,
    inner: Mutex<SocketInner>,
}

#[derive(Default)]
struct SocketInner {
    state: SocketState,
    connected: bool,
    /// Bumped on every connect and teardown; tasks of an older connection
    /// compare against it and stop touching state once superseded.
    generation: u64,
    outbound: Option<mpsc::UnboundedSender<Message>>,
    reader: Option<JoinHandle<()>>,
    /// Told once when the current connection is lost without a local
    /// disconnect.
    on_fault: Option<FaultHandler>,
    subscriptions: BTreeSet<SessionId>,
}

impl SocketInner {
    fn is_live(&self) -> bool {
        self.connected && self.outbound.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    /// Drop the physical connection. Subscriptions survive so the next
    /// connect can replay them.
    fn teardown(&mut self) {
        self.generation += 1;
        self.connected = false;
        self.on_fault = None;
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        // dropping the sender lets the writer flush what is queued, then close
        self.state = if self.outbound.take().is_some() {
            SocketState::Closing
        } else {
            SocketState::Closed
        };
    }

    fn mark_failed(&mut self) {
        self.connected = false;
        self.state = SocketState::Closed;
        self.outbound = None;
        self.reader = None;
    }

    fn send(&mut self, frame: &ClientFrame) -> Result<(), MonitorError> {
        if !self.connected {
            return Err(MonitorError::NotConnected);
        }
        let Some(tx) = self.outbound.as_ref() else {
            return Err(MonitorError::NotConnected);
        };
        let text = frame.encode()?;
        if tx.send(Message::Text(text.into())).is_err() {
            self.mark_failed();
            return Err(MonitorError::Transport("connection writer has stopped".into()));
        }
        Ok(())
    }
}

impl SessionSocket {
    pub fn new(domain: Domain, url: Url) -> Self {
        Self {
            domain,
            url,
            inner: Mutex::new(SocketInner::default()),
        }
    }

    pub fn probe(ws_base: &str, params: &ProbeParams) -> Result<Self, MonitorError> {
        Ok(Self::new(Domain::Probe, probe_url(ws_base, params)?))
    }

    pub fn scan(ws_base: &str, params: &ScanParams) -> Result<Self, MonitorError> {
        Ok(Self::new(Domain::Scan, scan_url(ws_base, params)?))
    }

    pub fn domain(&self) -> Domain {
        self.domain
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn state(&self) -> SocketState {
        self.inner.lock().state
    }

    /// True only while the logical flag is set and the writer side of the
    /// physical connection still accepts frames.
    pub fn is_live(&self) -> bool {
        self.inner.lock().is_live()
    }

    /// Open the stream and start delivering decoded frames to `on_message`.
    ///
    /// Any previous connection of this socket is torn down first. Frames that
    /// fail to decode are logged and dropped. `on_error` fires once if the
    /// stream is lost after it opened: a transport error, a failed write or
    /// the server closing it ([`MonitorError::Closed`]). A local
    /// [`disconnect`](Self::disconnect) never fires it. A failure to establish
    /// the stream is returned instead.
    pub async fn connect<M, E>(self: &Arc<Self>, on_message: M, on_error: E) -> Result<(), MonitorError>
    where
        M: Fn(ServerFrame) + Send + 'static,
        E: Fn(MonitorError) + Send + Sync + 'static,
    {
        let generation = {
            let mut inner = self.inner.lock();
            inner.teardown();
            inner.state = SocketState::Connecting;
            inner.generation
        };
        info!(url = %self.url, domain = %self.domain, "connecting session socket");

        let ws = match connect_async(self.url.as_str()).await {
            Ok((ws, _response)) => ws,
            Err(e) => {
                let mut inner = self.inner.lock();
                if inner.generation == generation {
                    inner.mark_failed();
                }
                warn!(url = %self.url, error = %e, "session socket failed to connect");
                return Err(e.into());
            }
        };

        let (sink, stream) = ws.split();
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut inner = self.inner.lock();
            if inner.generation != generation {
                debug!(url = %self.url, "connect superseded by disconnect");
                return Err(MonitorError::Aborted);
            }
            for id in &inner.subscriptions {
                let frame = ClientFrame::Subscribe { session_id: id.clone() };
                if let Ok(text) = frame.encode() {
                    let _ = tx.send(Message::Text(text.into()));
                }
            }
            inner.state = SocketState::Open;
            inner.connected = true;
            inner.outbound = Some(tx);
            inner.on_fault = Some(Arc::new(on_error));

            let weak = Arc::downgrade(self);
            tokio::spawn(pump_outbound(sink, rx, weak.clone(), generation));
            inner.reader = Some(tokio::spawn(pump_inbound(stream, weak, generation, on_message)));
        }
        info!(url = %self.url, domain = %self.domain, "session socket open");
        Ok(())
    }

    /// Send one heartbeat frame. Fails fast without retrying; a failed send
    /// leaves the socket disconnected.
    pub fn send_heartbeat(&self) -> Result<(), MonitorError> {
        let frame = ClientFrame::Ping { timestamp: unix_millis() };
        self.inner.lock().send(&frame)
    }

    /// Tell the server the client is ending the session. Fire-and-forget.
    pub fn send_stop_signal(&self) {
        let frame = ClientFrame::stop_for(self.domain, unix_millis());
        match self.inner.lock().send(&frame) {
            Ok(()) => debug!(url = %self.url, "stop signal queued"),
            Err(e) => warn!(url = %self.url, error = %e, "stop signal not sent"),
        }
    }

    /// Subscribe to a session on a multi-target probe stream.
    ///
    /// Sent right away when connected; otherwise kept and flushed by the next
    /// successful [`connect`](Self::connect).
    pub fn subscribe(&self, id: SessionId) -> Result<(), MonitorError> {
        self.ensure_subscribable()?;
        let mut inner = self.inner.lock();
        if !inner.subscriptions.insert(id.clone()) {
            return Ok(());
        }
        if inner.is_live() {
            inner.send(&ClientFrame::Subscribe { session_id: id })?;
        }
        Ok(())
    }

    pub fn unsubscribe(&self, id: &SessionId) -> Result<(), MonitorError> {
        self.ensure_subscribable()?;
        let mut inner = self.inner.lock();
        if !inner.subscriptions.remove(id) {
            return Ok(());
        }
        if inner.is_live() {
            inner.send(&ClientFrame::Unsubscribe { session_id: id.clone() })?;
        }
        Ok(())
    }

    pub fn subscriptions(&self) -> Vec<SessionId> {
        self.inner.lock().subscriptions.iter().cloned().collect()
    }

    /// Close the physical connection and forget subscriptions. Idempotent.
    pub fn disconnect(&self) {
        let mut inner = self.inner.lock();
        let was_live = inner.connected;
        inner.teardown();
        inner.subscriptions.clear();
        if was_live {
            info!(url = %self.url, "session socket disconnected");
        }
    }

    fn ensure_subscribable(&self) -> Result<(), MonitorError> {
        match self.domain {
            Domain::Probe => Ok(()),
            Domain::Scan => Err(MonitorError::Unsupported(self.domain)),
        }
    }

    /// Record the loss of connection `generation` and tell the fault handler,
    /// unless a newer connect or a disconnect already replaced it.
    fn connection_lost(&self, generation: u64, fault: MonitorError) {
        let handler = {
            let mut inner = self.inner.lock();
            if inner.generation != generation {
                return;
            }
            inner.mark_failed();
            inner.on_fault.take()
        };
        match &fault {
            MonitorError::Closed => info!(url = %self.url, "session stream closed by server"),
            other => warn!(url = %self.url, error = %other, "session stream failed"),
        }
        if let Some(handler) = handler {
            handler(fault);
        }
    }

    fn writer_finished(&self) {
        let mut inner = self.inner.lock();
        if inner.state == SocketState::Closing && inner.outbound.is_none() {
            inner.state = SocketState::Closed;
        }
    }
}

impl std::fmt::Debug for SessionSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionSocket")
            .field("domain", &self.domain)
            .field("url", &self.url.as_str())
            .field("state", &self.state())
            .finish()
    }
}

async fn pump_inbound<M>(
    mut stream: SplitStream<WsStream>,
    socket: Weak<SessionSocket>,
    generation: u64,
    on_message: M,
) where
    M: Fn(ServerFrame) + Send + 'static,
{
    let fault = loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => match ServerFrame::decode(text.as_str()) {
                Ok(frame) => on_message(frame),
                Err(e) => warn!(error = %e, "dropping malformed frame"),
            },
            Some(Ok(Message::Close(close))) => {
                debug!(?close, "server closed session stream");
                break MonitorError::Closed;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => break MonitorError::from(e),
            None => break MonitorError::Closed,
        }
    };
    if let Some(s) = socket.upgrade() {
        s.connection_lost(generation, fault);
    }
}

async fn pump_outbound(
    mut sink: SplitSink<WsStream, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
    socket: Weak<SessionSocket>,
    generation: u64,
) {
    while let Some(msg) = rx.recv().await {
        if let Err(e) = sink.send(msg).await {
            if let Some(s) = socket.upgrade() {
                s.connection_lost(generation, MonitorError::from(e));
            }
            return;
        }
    }
    let _ = sink.close().await;
    if let Some(s) = socket.upgrade() {
        s.writer_finished();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScanType;

    #[test]
    fn probe_url_carries_encoded_params() {
        let cfg = ProbeConfig {
            target: "example.org".into(),
            count: 5,
            interval: 0.5,
            ..Default::default()
        };
        let url = probe_url("ws://127.0.0.1:8000", &ProbeParams::from(&cfg)).unwrap();
        assert_eq!(
            url.as_str(),
            "ws://127.0.0.1:8000/api/v1/ws/ping?target=example.org&count=5&interval=0.5"
        );

        let continuous = ProbeConfig { continuous: true, ..cfg };
        let url = probe_url("wss://mon.local/", &ProbeParams::from(&continuous)).unwrap();
        assert!(url.as_str().contains("count=-1"));
        assert!(url.as_str().starts_with("wss://mon.local/api/v1/ws/ping?"));
    }

    #[test]
    fn absent_params_are_omitted() {
        let url = probe_url("ws://h:1", &ProbeParams::default()).unwrap();
        assert_eq!(url.as_str(), "ws://h:1/api/v1/ws/ping");

        let params = ScanParams { ports: Some("22".into()), ..Default::default() };
        let url = scan_url("ws://h:1", &params).unwrap();
        assert_eq!(url.as_str(), "ws://h:1/api/v1/ws/scan?ports=22");
    }

    #[test]
    fn scan_url_encodes_lists() {
        let cfg = ScanConfig {
            targets: "10.0.0.1,10.0.0.2".into(),
            ports: "22,80-90".into(),
            scan_type: ScanType::Udp,
            max_threads: 50,
            ..Default::default()
        };
        let url = scan_url("ws://h:1/monitor", &ScanParams::from(&cfg)).unwrap();
        assert_eq!(
            url.as_str(),
            "ws://h:1/monitor/api/v1/ws/scan?targets=10.0.0.1%2C10.0.0.2&ports=22%2C80-90&scan_type=udp&max_threads=50"
        );
    }

    #[test]
    fn fresh_socket_is_idle_and_not_live() {
        let s = SessionSocket::probe("ws://h:1", &ProbeParams::default()).unwrap();
        assert_eq!(s.state(), SocketState::Idle);
        assert!(!s.is_live());
        assert_eq!(s.send_heartbeat(), Err(MonitorError::NotConnected));
        // stop signal on a dead socket is silently dropped
        s.send_stop_signal();
    }

    #[test]
    fn subscriptions_are_probe_only_and_deferred_while_disconnected() {
        let scan = SessionSocket::scan("ws://h:1", &ScanParams::default()).unwrap();
        assert_eq!(
            scan.subscribe(SessionId::new("a")),
            Err(MonitorError::Unsupported(Domain::Scan))
        );

        let probe = SessionSocket::probe("ws://h:1", &ProbeParams::default()).unwrap();
        probe.subscribe(SessionId::new("b")).unwrap();
        probe.subscribe(SessionId::new("a")).unwrap();
        assert_eq!(probe.subscriptions(), vec![SessionId::new("a"), SessionId::new("b")]);
        probe.unsubscribe(&SessionId::new("b")).unwrap();
        assert_eq!(probe.subscriptions(), vec![SessionId::new("a")]);
    }

    #[test]
    fn disconnect_is_idempotent_and_clears_subscriptions() {
        let s = SessionSocket::probe("ws://h:1", &ProbeParams::default()).unwrap();
        s.subscribe(SessionId::new("x")).unwrap();
        s.disconnect();
        s.disconnect();
        assert_eq!(s.state(), SocketState::Closed);
        assert!(s.subscriptions().is_empty());
    }

    #[tokio::test]
    async fn connect_failure_is_reported_and_leaves_socket_closed() {
        // nothing listens on port 9 of the loopback in test environments
        let s = Arc::new(SessionSocket::probe("ws://127.0.0.1:9", &ProbeParams::default()).unwrap());
        let res = s.connect(|_| {}, |_| {}).await;
        assert!(matches!(res, Err(MonitorError::Transport(_))));
        assert_eq!(s.state(), SocketState::Closed);
        assert!(!s.is_live());
    }
}
