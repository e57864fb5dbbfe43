//! Connection pooling for outbound transports.
//!
//! One pool per remote address. Acquisition is bounded by `max_size` with
//! FIFO fairness among waiters (semaphore order); released connections are
//! kept idle up to `max_idle` and reaped by a cleanup task once they sit
//! past `idle_timeout`. Connections that fail the release health check are
//! closed, never re-pooled.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::transport::{DialOptions, Socket, Transport};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_size: usize,
    pub max_idle: usize,
    pub idle_timeout: Duration,
    pub cleanup_interval: Duration,
    pub dial_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 10,
            max_idle: 5,
            idle_timeout: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(60),
            dial_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Default)]
#[derive(Debug)]
pub struct PoolStats {
    total_acquired: AtomicU64,
    total_timeouts: AtomicU64,
    health_checks_total: AtomicU64,
    health_checks_failed: AtomicU64,
    active: AtomicUsize,
    idle: AtomicUsize,
}

impl PoolStats {
    pub fn total_acquired(&self) -> u64 {
        self.total_acquired.load(Ordering::Relaxed)
    }

    pub fn total_timeouts(&self) -> u64 {
        self.total_timeouts.load(Ordering::Relaxed)
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub fn idle(&self) -> usize {
        self.idle.load(Ordering::Relaxed)
    }

    /// active + idle connections as a share of capacity, in percent.
    pub fn utilization(&self, max_size: usize) -> f64 {
        if max_size == 0 {
            return 0.0;
        }
        let total = (self.active() + self.idle()) as f64;
        total / max_size as f64 * 100.0
    }

    /// Acquire timeouts as a share of acquire attempts, in percent.
    pub fn pressure(&self) -> f64 {
        let acquired = self.total_acquired();
        if acquired == 0 {
            return 0.0;
        }
        self.total_timeouts() as f64 / acquired as f64 * 100.0
    }

    /// Health check pass rate, in percent. 100 when no checks have run.
    pub fn health_success(&self) -> f64 {
        let total = self.health_checks_total.load(Ordering::Relaxed);
        if total == 0 {
            return 100.0;
        }
        let failed = self.health_checks_failed.load(Ordering::Relaxed);
        (total - failed) as f64 / total as f64 * 100.0
    }
}

struct IdleEntry {
    socket: Box<dyn Socket>,
    last_used: Instant,
}

/// A checked-out connection. Return it with [`ConnectionPool::release`];
/// if dropped instead, the socket is closed and the slot freed.
#[derive(Debug)]
pub struct PooledConn {
    socket: Option<Box<dyn Socket>>,
    permit: Option<OwnedSemaphorePermit>,
    stats: Arc<PoolStats>,
}

impl PooledConn {
    pub fn socket(&self) -> &dyn Socket {
        self.socket.as_deref().expect("connection already released")
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        if let Some(socket) = self.socket.take() {
            self.stats.active.fetch_sub(1, Ordering::Relaxed);
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    let _ = socket.close().await;
                });
            }
        }
    }
}

pub struct ConnectionPool {
    transport: Arc<dyn Transport>,
    addr: String,
    config: PoolConfig,
    semaphore: Arc<Semaphore>,
    idle_entries: Mutex<VecDeque<IdleEntry>>,
    stats: Arc<PoolStats>,
    closed: AtomicBool,
}

impl ConnectionPool {
    pub fn new(transport: Arc<dyn Transport>, addr: impl Into<String>, config: PoolConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_size));
        Self {
            transport,
            addr: addr.into(),
            config,
            semaphore,
            idle_entries: Mutex::new(VecDeque::new()),
            stats: Arc::new(PoolStats::default()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Acquire a connection within `deadline`, reusing an idle one when
    /// possible and dialing otherwise.
    pub async fn acquire(&self, deadline: Duration) -> Result<PooledConn> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ServiceUnavailable("pool closed".into()));
        }

        let permit = match tokio::time::timeout(
            deadline,
            self.semaphore.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(Error::ServiceUnavailable("pool closed".into())),
            Err(_) => {
                self.stats.total_timeouts.fetch_add(1, Ordering::Relaxed);
                return Err(Error::Timeout(format!(
                    "no pooled connection to {} within {:?}",
                    self.addr, deadline
                )));
            }
        };

        // Reuse the oldest idle entry still alive.
        let mut stale = Vec::new();
        let reused = {
            let mut idle = self.idle_entries.lock().expect("pool poisoned");
            loop {
                match idle.pop_front() {
                    Some(entry) if entry.socket.is_closed() => {
                        self.stats.idle.fetch_sub(1, Ordering::Relaxed);
                        stale.push(entry.socket);
                    }
                    Some(entry) => {
                        self.stats.idle.fetch_sub(1, Ordering::Relaxed);
                        break Some(entry.socket);
                    }
                    None => break None,
                }
            }
        };
        for socket in stale {
            let _ = socket.close().await;
        }

        let socket = match reused {
            Some(socket) => socket,
            None => {
                let opts = DialOptions {
                    timeout: self.config.dial_timeout,
                };
                match self.transport.dial(&self.addr, opts).await {
                    Ok(socket) => socket,
                    Err(e) => {
                        drop(permit);
                        return Err(e);
                    }
                }
            }
        };

        self.stats.total_acquired.fetch_add(1, Ordering::Relaxed);
        self.stats.active.fetch_add(1, Ordering::Relaxed);
        Ok(PooledConn {
            socket: Some(socket),
            permit: Some(permit),
            stats: self.stats.clone(),
        })
    }

    /// Return a connection. Healthy connections go back to the idle set when
    /// there is room; everything else is closed.
    pub async fn release(&self, mut conn: PooledConn, healthy: bool) {
        let Some(socket) = conn.socket.take() else {
            return;
        };
        self.stats.active.fetch_sub(1, Ordering::Relaxed);
        drop(conn.permit.take());

        self.stats.health_checks_total.fetch_add(1, Ordering::Relaxed);
        let ok = healthy && !socket.is_closed();
        if !ok {
            self.stats.health_checks_failed.fetch_add(1, Ordering::Relaxed);
            let _ = socket.close().await;
            return;
        }

        let overflow = {
            let mut idle = self.idle_entries.lock().expect("pool poisoned");
            if self.closed.load(Ordering::SeqCst) || idle.len() >= self.config.max_idle {
                Some(socket)
            } else {
                idle.push_back(IdleEntry {
                    socket,
                    last_used: Instant::now(),
                });
                self.stats.idle.fetch_add(1, Ordering::Relaxed);
                None
            }
        };
        if let Some(socket) = overflow {
            let _ = socket.close().await;
        }
    }

    /// Drop idle connections that have been unused past the idle timeout or
    /// are already closed.
    pub async fn sweep_idle(&self) {
        let mut reaped = Vec::new();
        {
            let mut idle = self.idle_entries.lock().expect("pool poisoned");
            let mut keep = VecDeque::with_capacity(idle.len());
            while let Some(entry) = idle.pop_front() {
                if entry.last_used.elapsed() > self.config.idle_timeout {
                    self.stats.idle.fetch_sub(1, Ordering::Relaxed);
                    reaped.push(entry.socket);
                    continue;
                }
                self.stats.health_checks_total.fetch_add(1, Ordering::Relaxed);
                if entry.socket.is_closed() {
                    self.stats.health_checks_failed.fetch_add(1, Ordering::Relaxed);
                    self.stats.idle.fetch_sub(1, Ordering::Relaxed);
                    reaped.push(entry.socket);
                } else {
                    keep.push_back(entry);
                }
            }
            *idle = keep;
        }
        for socket in reaped {
            let _ = socket.close().await;
        }
    }

    /// Spawn the periodic cleanup task.
    pub fn spawn_cleanup(self: Arc<Self>, token: CancellationToken) -> tokio::task::JoinHandle<()> {
        let pool = self;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(pool.config.cleanup_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tick.tick() => pool.sweep_idle().await,
                }
            }
        })
    }

    /// Close the pool: no further acquires, all idle connections closed.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.semaphore.close();
        let drained: Vec<Box<dyn Socket>> = {
            let mut idle = self.idle_entries.lock().expect("pool poisoned");
            let count = idle.len();
            self.stats.idle.fetch_sub(count, Ordering::Relaxed);
            idle.drain(..).map(|e| e.socket).collect()
        };
        for socket in drained {
            let _ = socket.close().await;
        }
    }
}
