//! Connection Pool for Origin Connections
//!
//! Owns every outbound TCP connection. Connections are grouped by
//! destination (one resolved address and port); each destination keeps
//! idle connections for reuse and a count of busy ones.
//!
//! ## Accounting
//!
//! - Busy plus idle connections to one destination never exceed
//!   `max_per_server`. A slot is reserved before connecting, so
//!   connections still being opened count too.
//! - Unlimited acquisitions (CONNECT tunnels, SOCKS chaining) are counted
//!   separately, bypass the cap and are never returned to the idle set.
//! - A [`PooledConnection`] gives back its slot exactly once: through
//!   [`ConnectionManager::release`], [`ConnectionManager::dispose`], or by
//!   being dropped (which disposes).
//! - Every release or disposal wakes all callers waiting for a slot.
//!   Waiters also re-check on their own every `wait_interval`.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use http::StatusCode;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};

use crate::dns::DnsEntry;
use crate::http::{BufferedStream, SocketState};
use crate::http_metrics::HttpMetrics;

/// Connection pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum busy plus idle connections per destination
    pub max_per_server: usize,

    /// Timeout for establishing new connections
    pub connect_timeout: Duration,

    /// How long a blocked acquire waits before re-checking on its own
    pub wait_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_per_server: 4,
            connect_timeout: Duration::from_secs(10),
            wait_interval: Duration::from_secs(5),
        }
    }
}

impl From<&crate::Config> for PoolConfig {
    fn from(config: &crate::Config) -> Self {
        Self {
            max_per_server: config.max_connections_per_server,
            connect_timeout: config.connect_timeout(),
            wait_interval: config.pool_wait(),
        }
    }
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("All {cap} connections to {host} are busy")]
    NoCapacity { host: String, cap: usize },

    #[error("Connecting to {destination} timed out")]
    ConnectTimeout { destination: SocketAddr },

    #[error("Connecting to {destination} failed: {source}")]
    Connect {
        destination: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("No addresses to connect to for {0}")]
    NoAddresses(String),
}

impl PoolError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            PoolError::NoCapacity { .. } | PoolError::ConnectTimeout { .. } => {
                StatusCode::GATEWAY_TIMEOUT
            }
            PoolError::Connect { .. } | PoolError::NoAddresses(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

/// How a connection should be obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireMode {
    /// Prefer an idle connection, open a new one otherwise
    Reuse,
    /// Always open a new connection, within the cap
    Fresh,
    /// Always open a new connection, outside the cap; never pooled
    Unlimited,
}

/// What happened to a released connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Back in the idle set
    Idle,
    /// Closed: peer gone, unlimited connection, or explicit disposal
    Disposed,
    /// Closed because unexpected bytes were waiting on it
    DisposedTrailing(usize),
}

/// Pool counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub reused: u64,
    pub opened: u64,
    pub evicted: u64,
    pub no_capacity: u64,
}

/// State of one destination, for status output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSnapshot {
    pub destination: SocketAddr,
    pub idle: usize,
    pub busy: usize,
    pub unlimited: usize,
    pub served: u64,
}

struct IdleConnection {
    id: u64,
    stream: BufferedStream<TcpStream>,
    served: u64,
}

#[derive(Default)]
struct ServerState {
    idle: VecDeque<IdleConnection>,
    busy: usize,
    unlimited: usize,
    served: u64,
}

impl ServerState {
    /// Connections counted against the cap
    fn count(&self) -> usize {
        self.idle.len() + self.busy
    }

    /// Score for picking a destination for a new connection
    fn load(&self) -> usize {
        self.count() + self.unlimited
    }

    fn is_unused(&self) -> bool {
        self.idle.is_empty() && self.busy == 0 && self.unlimited == 0
    }
}

struct PoolInner {
    config: PoolConfig,
    servers: Mutex<HashMap<SocketAddr, Arc<Mutex<ServerState>>>>,
    released: Notify,
    next_id: AtomicU64,
    stats: Mutex<PoolStats>,
}

impl PoolInner {
    fn server(&self, destination: SocketAddr) -> Arc<Mutex<ServerState>> {
        let mut servers = lock(&self.servers);
        servers.entry(destination).or_default().clone()
    }

    fn existing(&self, destination: &SocketAddr) -> Option<Arc<Mutex<ServerState>>> {
        lock(&self.servers).get(destination).cloned()
    }

    fn count_stat(&self, update: impl FnOnce(&mut PoolStats)) {
        update(&mut lock(&self.stats));
    }

    /// Give a busy slot back without pooling the connection
    fn settle_disposed(&self, destination: SocketAddr, unlimited: bool, served: u64) {
        let server = self.server(destination);
        {
            let mut state = lock(&server);
            if unlimited {
                state.unlimited = state.unlimited.saturating_sub(1);
            } else {
                state.busy = state.busy.saturating_sub(1);
            }
            state.served += served;
        }
        self.released.notify_waiters();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Holds one slot of a destination until released or dropped.
///
/// Dropping a lease that was not settled counts as a disposal.
pub struct Lease {
    pool: Arc<PoolInner>,
    id: u64,
    destination: SocketAddr,
    unlimited: bool,
    served: u64,
    settled: bool,
}

impl Lease {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn destination(&self) -> SocketAddr {
        self.destination
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if !self.settled {
            self.settled = true;
            self.pool
                .settle_disposed(self.destination, self.unlimited, self.served);
            HttpMetrics::record_disposal(if self.unlimited { "unlimited" } else { "closed" });
            debug!(
                destination = %self.destination,
                id = self.id,
                "[POOL] Connection disposed"
            );
        }
    }
}

/// A connection checked out of the pool
pub struct PooledConnection {
    stream: BufferedStream<TcpStream>,
    lease: Lease,
    reused: bool,
}

impl PooledConnection {
    pub fn stream(&mut self) -> &mut BufferedStream<TcpStream> {
        &mut self.stream
    }

    pub fn destination(&self) -> SocketAddr {
        self.lease.destination
    }

    pub fn id(&self) -> u64 {
        self.lease.id
    }

    /// True if this connection came from the idle set
    pub fn is_reused(&self) -> bool {
        self.reused
    }

    pub fn is_unlimited(&self) -> bool {
        self.lease.unlimited
    }

    /// Requests served before this checkout
    pub fn served(&self) -> u64 {
        self.lease.served
    }

    /// Split off the stream; the lease disposes the slot when dropped
    pub fn into_parts(self) -> (BufferedStream<TcpStream>, Lease) {
        (self.stream, self.lease)
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.lease.id)
            .field("destination", &self.lease.destination)
            .field("reused", &self.reused)
            .field("unlimited", &self.lease.unlimited)
            .field("served", &self.lease.served)
            .finish()
    }
}

/// Connection manager shared by all sessions
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<PoolInner>,
}

impl ConnectionManager {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config,
                servers: Mutex::new(HashMap::new()),
                released: Notify::new(),
                next_id: AtomicU64::new(1),
                stats: Mutex::new(PoolStats::default()),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Get a connection to any address of `entry` on `port`.
    ///
    /// With `block` set, waits for a free slot when the least loaded
    /// destination is at its cap; otherwise fails with `NoCapacity`.
    pub async fn acquire(
        &self,
        entry: &DnsEntry,
        port: u16,
        mode: AcquireMode,
        block: bool,
    ) -> Result<PooledConnection, PoolError> {
        let destinations: Vec<SocketAddr> = entry
            .addresses
            .iter()
            .map(|ip| SocketAddr::new(*ip, port))
            .collect();
        if destinations.is_empty() {
            return Err(PoolError::NoAddresses(entry.hostname.clone()));
        }

        loop {
            // Registered before checking so a release in between is not lost
            let released = self.inner.released.notified();

            if mode == AcquireMode::Reuse {
                for destination in &destinations {
                    if let Some(conn) = self.take_idle(*destination) {
                        HttpMetrics::record_acquire("reused");
                        self.inner.count_stat(|s| s.reused += 1);
                        return Ok(conn);
                    }
                }
            }

            let destination = self.least_loaded(&destinations);

            if mode == AcquireMode::Unlimited {
                lock(&self.inner.server(destination)).unlimited += 1;
                HttpMetrics::record_acquire("unlimited");
                return self.open(destination, true).await;
            }

            if self.try_reserve(destination) {
                HttpMetrics::record_acquire("new");
                return self.open(destination, false).await;
            }

            if !block {
                HttpMetrics::record_acquire("no_capacity");
                self.inner.count_stat(|s| s.no_capacity += 1);
                return Err(PoolError::NoCapacity {
                    host: entry.hostname.clone(),
                    cap: self.inner.config.max_per_server,
                });
            }

            debug!(
                destination = %destination,
                cap = self.inner.config.max_per_server,
                "[POOL] Destination at capacity, waiting for a release"
            );
            let _ = timeout(self.inner.config.wait_interval, released).await;
        }
    }

    /// Return a connection after its exchange completed.
    ///
    /// Unlimited connections, dead sockets and sockets with unexpected
    /// pending bytes are disposed instead of idled.
    pub fn release(&self, conn: PooledConnection) -> ReleaseOutcome {
        let PooledConnection {
            mut stream,
            mut lease,
            ..
        } = conn;
        lease.served += 1;

        if lease.unlimited {
            drop(stream);
            return self.settle_lease(lease, "unlimited", ReleaseOutcome::Disposed);
        }

        match stream.probe() {
            SocketState::Alive => {
                lease.settled = true;
                let server = self.inner.server(lease.destination);
                {
                    let mut state = lock(&server);
                    state.busy = state.busy.saturating_sub(1);
                    state.idle.push_back(IdleConnection {
                        id: lease.id,
                        stream,
                        served: lease.served,
                    });
                }
                self.inner.released.notify_waiters();
                debug!(
                    destination = %lease.destination,
                    id = lease.id,
                    served = lease.served,
                    "[POOL] Connection idle"
                );
                ReleaseOutcome::Idle
            }
            SocketState::Closed => {
                drop(stream);
                self.settle_lease(lease, "closed", ReleaseOutcome::Disposed)
            }
            SocketState::Trailing(bytes) => {
                warn!(
                    destination = %lease.destination,
                    bytes,
                    "[POOL] Unexpected bytes after response, discarding connection"
                );
                drop(stream);
                self.settle_lease(lease, "trailing", ReleaseOutcome::DisposedTrailing(bytes))
            }
        }
    }

    /// Close a connection and free its slot
    pub fn dispose(&self, conn: PooledConnection) {
        let PooledConnection { stream, lease, .. } = conn;
        drop(stream);
        drop(lease);
    }

    /// Drop idle connections whose sockets died and forget destinations
    /// with no connections left. Returns the number of connections closed.
    pub fn sweep(&self) -> usize {
        let servers: Vec<(SocketAddr, Arc<Mutex<ServerState>>)> = lock(&self.inner.servers)
            .iter()
            .map(|(dest, server)| (*dest, server.clone()))
            .collect();

        let mut closed = 0;
        for (destination, server) in servers {
            let mut state = lock(&server);
            let before = state.idle.len();
            state
                .idle
                .retain_mut(|idle| idle.stream.probe() == SocketState::Alive);
            let evicted = before - state.idle.len();
            if evicted > 0 {
                debug!(destination = %destination, evicted, "[POOL] Swept dead idle connections");
                for _ in 0..evicted {
                    HttpMetrics::record_disposal("dead_idle");
                }
            }
            closed += evicted;
        }

        // A destination someone still holds a handle to is about to be used
        lock(&self.inner.servers)
            .retain(|_, server| Arc::strong_count(server) > 1 || !lock(server).is_unused());

        if closed > 0 {
            self.inner.count_stat(|s| s.evicted += closed as u64);
            self.inner.released.notify_waiters();
        }
        closed
    }

    pub fn stats(&self) -> PoolStats {
        *lock(&self.inner.stats)
    }

    /// Per-destination state
    pub fn snapshot(&self) -> Vec<ServerSnapshot> {
        let servers = lock(&self.inner.servers);
        let mut snapshot: Vec<ServerSnapshot> = servers
            .iter()
            .map(|(destination, server)| {
                let state = lock(server);
                ServerSnapshot {
                    destination: *destination,
                    idle: state.idle.len(),
                    busy: state.busy,
                    unlimited: state.unlimited,
                    served: state.served + state.idle.iter().map(|c| c.served).sum::<u64>(),
                }
            })
            .collect();
        snapshot.sort_by_key(|s| s.destination);
        snapshot
    }

    pub fn idle_count(&self, destination: SocketAddr) -> usize {
        self.inner
            .existing(&destination)
            .map_or(0, |server| lock(&server).idle.len())
    }

    /// Busy connections counted against the cap
    pub fn busy_count(&self, destination: SocketAddr) -> usize {
        self.inner
            .existing(&destination)
            .map_or(0, |server| lock(&server).busy)
    }

    pub fn unlimited_count(&self, destination: SocketAddr) -> usize {
        self.inner
            .existing(&destination)
            .map_or(0, |server| lock(&server).unlimited)
    }

    /// Idle connections across all destinations
    pub fn total_idle(&self) -> usize {
        lock(&self.inner.servers)
            .values()
            .map(|server| lock(server).idle.len())
            .sum()
    }

    /// Connections currently checked out, including unlimited ones
    pub fn total_busy(&self) -> usize {
        lock(&self.inner.servers)
            .values()
            .map(|server| {
                let state = lock(server);
                state.busy + state.unlimited
            })
            .sum()
    }

    fn settle_lease(
        &self,
        mut lease: Lease,
        reason: &str,
        outcome: ReleaseOutcome,
    ) -> ReleaseOutcome {
        lease.settled = true;
        self.inner
            .settle_disposed(lease.destination, lease.unlimited, lease.served);
        HttpMetrics::record_disposal(reason);
        debug!(
            destination = %lease.destination,
            id = lease.id,
            reason,
            "[POOL] Connection disposed on release"
        );
        outcome
    }

    /// First live idle connection, evicting dead ones on the way
    fn take_idle(&self, destination: SocketAddr) -> Option<PooledConnection> {
        let server = self.inner.existing(&destination)?;
        let mut evicted = 0;
        let found = {
            let mut state = lock(&server);
            let mut found = None;
            while let Some(mut idle) = state.idle.pop_front() {
                if idle.stream.probe() == SocketState::Alive {
                    state.busy += 1;
                    found = Some(idle);
                    break;
                }
                state.served += idle.served;
                evicted += 1;
            }
            found
        };

        if evicted > 0 {
            debug!(destination = %destination, evicted, "[POOL] Evicted dead idle connections");
            self.inner.count_stat(|s| s.evicted += evicted);
            for _ in 0..evicted {
                HttpMetrics::record_disposal("dead_idle");
            }
            self.inner.released.notify_waiters();
        }

        let idle = found?;
        debug!(destination = %destination, id = idle.id, "[POOL] Reusing idle connection");
        Some(PooledConnection {
            stream: idle.stream,
            lease: Lease {
                pool: self.inner.clone(),
                id: idle.id,
                destination,
                unlimited: false,
                served: idle.served,
                settled: false,
            },
            reused: true,
        })
    }

    fn least_loaded(&self, destinations: &[SocketAddr]) -> SocketAddr {
        let mut best = destinations[0];
        let mut best_load = usize::MAX;
        for destination in destinations {
            let load = self
                .inner
                .existing(destination)
                .map_or(0, |server| lock(&server).load());
            if load < best_load {
                best = *destination;
                best_load = load;
            }
        }
        best
    }

    /// Take a capped slot, evicting the oldest idle connection if that is
    /// the only way to stay under the cap
    fn try_reserve(&self, destination: SocketAddr) -> bool {
        let server = self.inner.server(destination);
        let mut state = lock(&server);
        if state.count() < self.inner.config.max_per_server {
            state.busy += 1;
            return true;
        }
        if let Some(oldest) = state.idle.pop_front() {
            state.served += oldest.served;
            state.busy += 1;
            drop(state);
            HttpMetrics::record_disposal("evicted");
            self.inner.count_stat(|s| s.evicted += 1);
            debug!(destination = %destination, id = oldest.id, "[POOL] Evicted idle connection for a new one");
            return true;
        }
        false
    }

    /// Connect on an already reserved slot
    async fn open(
        &self,
        destination: SocketAddr,
        unlimited: bool,
    ) -> Result<PooledConnection, PoolError> {
        let lease = Lease {
            pool: self.inner.clone(),
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            destination,
            unlimited,
            served: 0,
            settled: false,
        };

        let started = Instant::now();
        // The lease frees the slot if connecting fails
        let stream = match timeout(
            self.inner.config.connect_timeout,
            TcpStream::connect(destination),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                debug!(destination = %destination, error = %source, "[POOL] Connect failed");
                return Err(PoolError::Connect {
                    destination,
                    source,
                });
            }
            Err(_) => return Err(PoolError::ConnectTimeout { destination }),
        };
        let _ = stream.set_nodelay(true);

        self.inner.count_stat(|s| s.opened += 1);
        debug!(
            destination = %destination,
            id = lease.id,
            unlimited,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "[POOL] Opened connection"
        );

        Ok(PooledConnection {
            stream: BufferedStream::new(stream),
            lease,
            reused: false,
        })
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}
