//! The listening socket and the sessions it spawned.
//!
//! Accepting is gated by a semaphore of `MAX_SESSIONS` permits: at the
//! ceiling the listener stops accepting and the kernel backlog absorbs new
//! clients until a session ends. A maintenance task sweeps the connection
//! pool and aborts sessions that were told to stop but did not finish within
//! the watchdog grace period.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::connection_pool::{ConnectionManager, PoolConfig};
use crate::dns::DnsCache;
use crate::filter::FilterChain;
use crate::http_metrics::ACTIVE_SESSIONS;
use crate::logger::{AccessLog, SharedAccessLog};
use crate::session::{ProxySession, SessionContext, SessionHandle, SessionStatus};

struct SessionEntry {
    handle: Arc<SessionHandle>,
    task: JoinHandle<()>,
}

type SessionTable = Arc<Mutex<HashMap<u64, SessionEntry>>>;

fn lock(sessions: &Mutex<HashMap<u64, SessionEntry>>) -> std::sync::MutexGuard<'_, HashMap<u64, SessionEntry>> {
    sessions.lock().unwrap_or_else(|e| e.into_inner())
}

/// One-shot shutdown flag that can be awaited
#[derive(Default)]
struct Shutdown {
    triggered: AtomicBool,
    notify: Notify,
}

impl Shutdown {
    fn trigger(&self) {
        self.triggered.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_triggered() {
                return;
            }
            notified.await;
        }
    }
}

/// Released when a session task ends, however it ends
struct SessionGuard {
    _permit: OwnedSemaphorePermit,
}

impl SessionGuard {
    fn new(permit: OwnedSemaphorePermit) -> Self {
        ACTIVE_SESSIONS.inc();
        Self { _permit: permit }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        ACTIVE_SESSIONS.dec();
    }
}

pub struct ProxyListener {
    listener: TcpListener,
    ctx: Arc<SessionContext>,
    sessions: SessionTable,
    next_id: AtomicU64,
    limit: Arc<Semaphore>,
    shutdown: Arc<Shutdown>,
}

impl ProxyListener {
    /// Bind `HOST:PORT` and build the shared DNS cache, pool and filters
    pub async fn bind(config: Config) -> Result<Self> {
        config.validate()?;
        let filters = FilterChain::from_config(&config)?;
        let dns = DnsCache::from_config(&config);
        Self::bind_with(config, Arc::new(dns), Arc::new(filters)).await
    }

    /// Bind with a caller-supplied DNS cache and filter chain
    pub async fn bind_with(config: Config, dns: Arc<DnsCache>, filters: Arc<FilterChain>) -> Result<Self> {
        let address = config.bind_address();
        let listener = TcpListener::bind(&address)
            .await
            .with_context(|| format!("Failed to bind {}", address))?;
        let listen_addr = listener.local_addr()?;

        let pool = ConnectionManager::new(PoolConfig::from(&config));
        let limit = Arc::new(Semaphore::new(config.max_sessions.max(1)));
        let ctx = Arc::new(SessionContext {
            config: Arc::new(config),
            dns,
            pool,
            filters,
            access_log: Arc::new(AccessLog::default()),
            listen_addr,
        });

        info!(address = %listen_addr, "[LISTENER] Listening");
        Ok(Self {
            listener,
            ctx,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            limit,
            shutdown: Arc::new(Shutdown::default()),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.ctx.listen_addr
    }

    pub fn context(&self) -> &Arc<SessionContext> {
        &self.ctx
    }

    pub fn pool(&self) -> &ConnectionManager {
        &self.ctx.pool
    }

    pub fn access_log(&self) -> &SharedAccessLog {
        &self.ctx.access_log
    }

    /// Status of every session still running
    pub fn sessions(&self) -> Vec<SessionStatus> {
        let mut statuses: Vec<SessionStatus> = lock(&self.sessions)
            .values()
            .filter(|entry| !entry.task.is_finished())
            .map(|entry| entry.handle.status())
            .collect();
        statuses.sort_by_key(|status| status.id);
        statuses
    }

    /// Accept clients until [`stop`](Self::stop) is called
    pub async fn run(&self) -> Result<()> {
        let maintenance = tokio::spawn(maintain(
            self.sessions.clone(),
            self.ctx.pool.clone(),
            self.ctx.config.sweep_interval(),
            self.ctx.config.watchdog_grace(),
            self.shutdown.clone(),
        ));

        loop {
            let permit = tokio::select! {
                _ = self.shutdown.wait() => break,
                permit = self.limit.clone().acquire_owned() => {
                    permit.context("Session limit semaphore closed")?
                }
            };

            let accepted = tokio::select! {
                _ = self.shutdown.wait() => break,
                accepted = self.listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => self.start_session(stream, peer, permit),
                Err(e) => {
                    // Usually descriptor exhaustion; give sessions a moment to end
                    error!(error = %e, "[LISTENER] Failed to accept connection");
                    drop(permit);
                    sleep(Duration::from_millis(50)).await;
                }
            }
        }

        maintenance.abort();
        info!(address = %self.local_addr(), "[LISTENER] Stopped accepting");
        Ok(())
    }

    /// Run the accept loop on its own task
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<Result<()>> {
        let listener = self.clone();
        tokio::spawn(async move { listener.run().await })
    }

    fn start_session(&self, stream: TcpStream, peer: SocketAddr, permit: OwnedSemaphorePermit) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(session = id, peer = %peer, "[LISTENER] Accepted connection");

        let handle = Arc::new(SessionHandle::new(id, peer));
        let session = ProxySession::new(self.ctx.clone(), handle.clone(), stream);
        let guard = SessionGuard::new(permit);
        let task = tokio::spawn(async move {
            let _guard = guard;
            session.run().await;
        });
        lock(&self.sessions).insert(id, SessionEntry { handle: handle.clone(), task });
        // Accepted while stop() was running
        if self.shutdown.is_triggered() {
            handle.stop();
        }
    }

    /// Stop accepting and tell every session to close
    pub fn stop(&self) {
        self.shutdown.trigger();
        let sessions = lock(&self.sessions);
        info!(sessions = sessions.len(), "[LISTENER] Stopping");
        for entry in sessions.values() {
            entry.handle.stop();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_triggered()
    }

    /// Wait up to `grace` for sessions to end, then abort the rest.
    /// Returns the number aborted.
    pub async fn drain(&self, grace: Duration) -> usize {
        let deadline = Instant::now() + grace;
        loop {
            let remaining = {
                let mut sessions = lock(&self.sessions);
                sessions.retain(|_, entry| !entry.task.is_finished());
                sessions.len()
            };
            if remaining == 0 {
                return 0;
            }
            if Instant::now() >= deadline {
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }

        let mut sessions = lock(&self.sessions);
        let aborted = sessions.len();
        for (id, entry) in sessions.drain() {
            warn!(session = id, "[LISTENER] Session did not stop in time, aborting");
            entry.task.abort();
        }
        aborted
    }
}

async fn maintain(
    sessions: SessionTable,
    pool: ConnectionManager,
    interval: Duration,
    grace: Duration,
    shutdown: Arc<Shutdown>,
) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(100)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.wait() => return,
            _ = ticker.tick() => {}
        }
        let swept = pool.sweep();
        if swept > 0 {
            debug!(swept, "[POOL] Swept dead idle connections");
        }
        watchdog(&sessions, grace);
    }
}

/// Forget finished sessions and abort those closing for longer than
/// `grace`. Returns the number aborted.
fn watchdog(sessions: &Mutex<HashMap<u64, SessionEntry>>, grace: Duration) -> usize {
    let mut sessions = lock(sessions);
    sessions.retain(|_, entry| !entry.task.is_finished());

    let stuck: Vec<u64> = sessions
        .iter()
        .filter(|(_, entry)| entry.handle.closing_for().is_some_and(|elapsed| elapsed >= grace))
        .map(|(id, _)| *id)
        .collect();
    for id in &stuck {
        if let Some(entry) = sessions.remove(id) {
            warn!(
                session = id,
                peer = %entry.handle.peer(),
                state = %entry.handle.state(),
                "[LISTENER] Session stuck while closing, aborting"
            );
            entry.task.abort();
        }
    }
    stuck.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn peer() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 40000)
    }

    fn entry(id: u64, task: JoinHandle<()>) -> (u64, SessionEntry) {
        (
            id,
            SessionEntry {
                handle: Arc::new(SessionHandle::new(id, peer())),
                task,
            },
        )
    }

    #[tokio::test]
    async fn test_shutdown_wakes_waiters() {
        let shutdown = Arc::new(Shutdown::default());
        let waiter = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { shutdown.wait().await })
        };
        tokio::task::yield_now().await;
        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        shutdown.wait().await;
        assert!(shutdown.is_triggered());
    }

    #[tokio::test]
    async fn test_watchdog_aborts_stuck_sessions() {
        let finished = tokio::spawn(async {});
        let stuck = tokio::spawn(std::future::pending::<()>());
        let busy = tokio::spawn(std::future::pending::<()>());
        tokio::task::yield_now().await;
        while !finished.is_finished() {
            tokio::task::yield_now().await;
        }

        let table: HashMap<u64, SessionEntry> =
            [entry(1, finished), entry(2, stuck), entry(3, busy)].into_iter().collect();
        table[&2].handle.stop();
        let sessions = Mutex::new(table);

        assert_eq!(watchdog(&sessions, Duration::ZERO), 1);
        let remaining = lock(&sessions);
        assert_eq!(remaining.len(), 1);
        assert!(remaining.contains_key(&3));
    }

    #[tokio::test]
    async fn test_watchdog_respects_grace() {
        let stuck = tokio::spawn(std::future::pending::<()>());
        let table: HashMap<u64, SessionEntry> = [entry(1, stuck)].into_iter().collect();
        table[&1].handle.stop();
        let sessions = Mutex::new(table);

        assert_eq!(watchdog(&sessions, Duration::from_secs(60)), 0);
        assert_eq!(lock(&sessions).len(), 1);
    }

    #[tokio::test]
    async fn test_bind_reports_address() {
        let config = Config {
            port: 0,
            ..Config::default()
        };
        let listener = ProxyListener::bind(config).await.unwrap();
        assert_ne!(listener.local_addr().port(), 0);
        assert!(listener.sessions().is_empty());
        assert!(!listener.is_stopped());
    }

    #[tokio::test]
    async fn test_stop_ends_run() {
        let config = Config {
            port: 0,
            ..Config::default()
        };
        let listener = Arc::new(ProxyListener::bind(config).await.unwrap());
        let task = listener.spawn();
        tokio::task::yield_now().await;
        listener.stop();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(listener.drain(Duration::from_millis(100)).await, 0);
    }
}
