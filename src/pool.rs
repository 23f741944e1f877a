//! Keyed registry of session sockets.
//!
//! The pool is the single owner of sockets and of heartbeat scheduling. It is
//! cheap to clone; clones share the same registry. Keep-alive records get one
//! heartbeat task each; records without keep-alive are reclaimed by
//! [`ConnectionPool::sweep`] once idle for longer than the configured timeout.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::MonitorConfig;
use crate::socket::{SessionSocket, SocketState};
use crate::types::{Domain, SessionKey};

#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    records: Mutex<HashMap<SessionKey, ConnectionRecord>>,
    heartbeat_interval: Duration,
    idle_timeout: Duration,
    sweep_interval: Duration,
    shutdown: CancellationToken,
}

struct ConnectionRecord {
    socket: Arc<SessionSocket>,
    last_activity: Instant,
    keep_alive: bool,
    heartbeat: Option<CancellationToken>,
}

impl ConnectionRecord {
    fn retire(self, key: &SessionKey) {
        if let Some(hb) = self.heartbeat {
            hb.cancel();
        }
        self.socket.disconnect();
        debug!(key = %key, "pooled connection closed");
    }

    fn stop_heartbeat(&mut self) {
        if let Some(hb) = self.heartbeat.take() {
            hb.cancel();
        }
    }
}

/// Point-in-time view of one pooled connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionInfo {
    pub key: SessionKey,
    pub domain: Domain,
    pub keep_alive: bool,
    pub idle: Duration,
    pub live: bool,
    pub heartbeat: bool,
}

impl ConnectionPool {
    pub fn new(config: &MonitorConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                records: Mutex::new(HashMap::new()),
                heartbeat_interval: config.heartbeat_interval,
                idle_timeout: config.idle_timeout,
                sweep_interval: config.sweep_interval,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Return the socket registered under `key`, creating it with `factory`
    /// when there is none or the registered one is already torn down.
    ///
    /// `factory` runs at most once and must not have side effects beyond
    /// building the socket; connecting is the caller's job.
    pub fn acquire<F>(&self, key: SessionKey, factory: F, keep_alive: bool) -> Arc<SessionSocket>
    where
        F: FnOnce() -> SessionSocket,
    {
        let mut records = self.inner.records.lock();

        let reusable = records.get(&key).map(|rec| {
            !matches!(rec.socket.state(), SocketState::Closing | SocketState::Closed)
        });
        if reusable == Some(true) {
            if let Some(rec) = records.get_mut(&key) {
                rec.last_activity = Instant::now();
                if keep_alive != rec.keep_alive {
                    rec.keep_alive = keep_alive;
                    if keep_alive {
                        rec.heartbeat = Some(self.spawn_heartbeat(key.clone()));
                    } else {
                        rec.stop_heartbeat();
                    }
                }
                debug!(key = %key, "reusing pooled connection");
                return rec.socket.clone();
            }
        }
        let stale = records.remove(&key);

        let socket = Arc::new(factory());
        let heartbeat = keep_alive.then(|| self.spawn_heartbeat(key.clone()));
        records.insert(
            key.clone(),
            ConnectionRecord {
                socket: socket.clone(),
                last_activity: Instant::now(),
                keep_alive,
                heartbeat,
            },
        );
        drop(records);

        if let Some(old) = stale {
            old.retire(&key);
        }
        info!(key = %key, url = %socket.url(), keep_alive, "registered pooled connection");
        socket
    }

    /// Close and forget the connection under `key`. Idempotent.
    pub fn remove(&self, key: &SessionKey) -> bool {
        let removed = self.inner.records.lock().remove(key);
        match removed {
            Some(rec) => {
                rec.retire(key);
                info!(key = %key, "removed pooled connection");
                true
            }
            None => false,
        }
    }

    /// Refresh the activity timestamp of `key`.
    pub fn mark_active(&self, key: &SessionKey) {
        if let Some(rec) = self.inner.records.lock().get_mut(key) {
            rec.last_activity = Instant::now();
        }
    }

    /// Toggle idle-expiry eligibility. Without keep-alive the key also loses
    /// its heartbeat, so an idle record can actually age out.
    pub fn set_keep_alive(&self, key: &SessionKey, keep_alive: bool) {
        let mut records = self.inner.records.lock();
        let Some(rec) = records.get_mut(key) else {
            return;
        };
        if rec.keep_alive == keep_alive {
            return;
        }
        rec.keep_alive = keep_alive;
        if keep_alive {
            rec.heartbeat = Some(self.spawn_heartbeat(key.clone()));
        } else {
            rec.stop_heartbeat();
        }
        debug!(key = %key, keep_alive, "keep-alive changed");
    }

    pub fn contains(&self, key: &SessionKey) -> bool {
        self.inner.records.lock().contains_key(key)
    }

    pub fn get(&self, key: &SessionKey) -> Option<Arc<SessionSocket>> {
        self.inner.records.lock().get(key).map(|r| r.socket.clone())
    }

    pub fn info(&self, key: &SessionKey) -> Option<ConnectionInfo> {
        let records = self.inner.records.lock();
        let rec = records.get(key)?;
        Some(ConnectionInfo {
            key: key.clone(),
            domain: key.domain,
            keep_alive: rec.keep_alive,
            idle: rec.last_activity.elapsed(),
            live: rec.socket.is_live(),
            heartbeat: rec.heartbeat.is_some(),
        })
    }

    /// Keys of every registered connection, sorted.
    pub fn list_active(&self) -> Vec<SessionKey> {
        let mut keys: Vec<SessionKey> = self.inner.records.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.inner.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every record that is not kept alive and has been idle longer
    /// than the idle timeout. Returns the removed keys, sorted.
    pub fn sweep(&self) -> Vec<SessionKey> {
        let now = Instant::now();
        let idle_timeout = self.inner.idle_timeout;
        let expired: Vec<(SessionKey, ConnectionRecord)> = {
            let mut records = self.inner.records.lock();
            let keys: Vec<SessionKey> = records
                .iter()
                .filter(|(_, r)| !r.keep_alive && now.duration_since(r.last_activity) > idle_timeout)
                .map(|(k, _)| k.clone())
                .collect();
            keys.into_iter()
                .filter_map(|k| records.remove(&k).map(|r| (k, r)))
                .collect()
        };

        let mut removed = Vec::with_capacity(expired.len());
        for (key, rec) in expired {
            rec.retire(&key);
            info!(key = %key, "expired idle connection");
            removed.push(key);
        }
        removed.sort();
        removed
    }

    /// Run [`sweep`](Self::sweep) every sweep interval until [`shutdown`](Self::shutdown).
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.sweep_interval;
        let cancel = self.inner.shutdown.child_token();
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        let removed = ConnectionPool { inner }.sweep();
                        if !removed.is_empty() {
                            debug!(count = removed.len(), "sweep reclaimed connections");
                        }
                    }
                }
            }
        })
    }

    /// Stop the sweeper and every heartbeat, then close all sockets.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let drained: Vec<(SessionKey, ConnectionRecord)> =
            self.inner.records.lock().drain().collect();
        let count = drained.len();
        for (key, rec) in drained {
            rec.retire(&key);
        }
        info!(count, "connection pool shut down");
    }

    fn spawn_heartbeat(&self, key: SessionKey) -> CancellationToken {
        let cancel = self.inner.shutdown.child_token();
        let token = cancel.clone();
        let weak: Weak<PoolInner> = Arc::downgrade(&self.inner);
        let period = self.inner.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        if !(ConnectionPool { inner }).heartbeat_tick(&key) {
                            break;
                        }
                    }
                }
            }
            debug!(key = %key, "heartbeat stopped");
        });
        token
    }

    /// One heartbeat round for `key`. Returns false once the task should end.
    fn heartbeat_tick(&self, key: &SessionKey) -> bool {
        let Some(socket) = self.get(key) else {
            return false;
        };
        match socket.state() {
            SocketState::Idle | SocketState::Connecting => true,
            SocketState::Open => match socket.send_heartbeat() {
                Ok(()) => {
                    if let Some(rec) = self.inner.records.lock().get_mut(key) {
                        if Arc::ptr_eq(&rec.socket, &socket) {
                            rec.last_activity = Instant::now();
                        }
                    }
                    true
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "heartbeat failed, dropping connection");
                    self.remove_if_same(key, &socket);
                    false
                }
            },
            SocketState::Closing | SocketState::Closed => {
                warn!(key = %key, "heartbeat found a closed connection, dropping it");
                self.remove_if_same(key, &socket);
                false
            }
        }
    }

    fn remove_if_same(&self, key: &SessionKey, socket: &Arc<SessionSocket>) {
        let removed = {
            let mut records = self.inner.records.lock();
            match records.get(key) {
                Some(rec) if Arc::ptr_eq(&rec.socket, socket) => records.remove(key),
                _ => None,
            }
        };
        if let Some(rec) = removed {
            rec.retire(key);
        }
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("connections", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::ProbeParams;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pool() -> ConnectionPool {
        ConnectionPool::new(&MonitorConfig::default())
    }

    fn socket() -> SessionSocket {
        SessionSocket::probe("ws://127.0.0.1:9", &ProbeParams::default()).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_reuses_until_removed() {
        let pool = pool();
        let calls = AtomicUsize::new(0);
        let factory = || {
            calls.fetch_add(1, Ordering::SeqCst);
            socket()
        };
        let key = SessionKey::probe("1");

        let a = pool.acquire(key.clone(), factory, true);
        let b = pool.acquire(key.clone(), factory, true);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert!(pool.remove(&key));
        assert!(!pool.remove(&key));
        let c = pool.acquire(key.clone(), factory, true);
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(a.state(), SocketState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn torn_down_socket_is_replaced_on_acquire() {
        let pool = pool();
        let key = SessionKey::scan("s");
        let first = pool.acquire(key.clone(), socket, false);
        first.disconnect();
        let second = pool.acquire(key.clone(), socket, false);
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_respects_idle_timeout_and_keep_alive() {
        let pool = pool();
        let idle = SessionKey::probe("idle");
        let kept = SessionKey::probe("kept");
        pool.acquire(idle.clone(), socket, false);
        pool.acquire(kept.clone(), socket, true);

        tokio::time::advance(Duration::from_secs(4 * 60)).await;
        assert!(pool.sweep().is_empty());

        pool.mark_active(&idle);
        tokio::time::advance(Duration::from_secs(4 * 60)).await;
        assert!(pool.sweep().is_empty());

        tokio::time::advance(Duration::from_secs(2 * 60)).await;
        assert_eq!(pool.sweep(), vec![idle.clone()]);
        assert_eq!(pool.list_active(), vec![kept.clone()]);

        tokio::time::advance(Duration::from_secs(60 * 60)).await;
        assert!(pool.sweep().is_empty());
        assert!(pool.contains(&kept));
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_keep_alive_stops_heartbeat_and_allows_expiry() {
        let pool = pool();
        let key = SessionKey::probe("k");
        pool.acquire(key.clone(), socket, true);
        assert!(pool.info(&key).unwrap().heartbeat);

        pool.set_keep_alive(&key, false);
        let info = pool.info(&key).unwrap();
        assert!(!info.keep_alive);
        assert!(!info.heartbeat);

        tokio::time::advance(Duration::from_secs(6 * 60)).await;
        assert_eq!(pool.sweep(), vec![key]);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_skips_idle_and_drops_closed_sockets() {
        let pool = pool();
        let key = SessionKey::probe("hb");
        let sock = pool.acquire(key.clone(), socket, true);

        // never connected: the tick is skipped and the record stays
        tokio::time::sleep(Duration::from_secs(31)).await;
        tokio::task::yield_now().await;
        assert!(pool.contains(&key));

        sock.disconnect();
        tokio::time::sleep(Duration::from_secs(31)).await;
        tokio::task::yield_now().await;
        assert!(!pool.contains(&key));
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_task_runs_until_shutdown() {
        let pool = pool();
        let key = SessionKey::scan("old");
        pool.acquire(key.clone(), socket, false);
        let sweeper = pool.spawn_sweeper();

        tokio::time::sleep(Duration::from_secs(7 * 60)).await;
        tokio::task::yield_now().await;
        assert!(!pool.contains(&key));

        pool.acquire(SessionKey::scan("new"), socket, true);
        pool.shutdown();
        assert!(pool.is_empty());
        sweeper.await.unwrap();
    }
}
