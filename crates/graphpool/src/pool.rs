//! Bounded pool of physical graph store connections.
//!
//! The pool keeps between `min` and `max` physical connections for one
//! endpoint. Checked-out connections stay in the pool's table and are
//! addressed by an opaque `u64` lease, so the pool can still reach (and
//! force-close) them on shutdown.
//!
//! ```text
//! acquire()
//!   → wait for a slot permit (bounded by acquire_timeout) → PoolExhausted
//!   → idle connection alive? → lease it
//!   → idle empty → open a new physical connection → lease it
//! release(lease)
//!   → dead? → close + discard (a later acquire replaces it)
//!   → alive → back to the idle queue
//! ```
//!
//! A semaphore with `max` permits bounds checked-out connections. A permit is
//! forgotten while a lease is out and added back on release, so idle plus
//! checked-out never exceeds `max`.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Semaphore};

use crate::error::{PoolError, PoolResult};
use crate::store::{Endpoint, PhysicalConnection, StoreClient};

/// Validated `[min, max]` pool sizing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolBounds {
    min: usize,
    max: usize,
}

impl PoolBounds {
    /// Check raw bounds: both non-negative and `min <= max`.
    pub fn new(min: i64, max: i64) -> PoolResult<Self> {
        if min < 0 || max < 0 || min > max {
            return Err(PoolError::InvalidBounds { min, max });
        }
        let convert = |v: i64| usize::try_from(v).map_err(|_| PoolError::InvalidBounds { min, max });
        Ok(Self {
            min: convert(min)?,
            max: convert(max)?,
        })
    }

    pub fn min(&self) -> usize {
        self.min
    }

    pub fn max(&self) -> usize {
        self.max
    }
}

/// Tunables that do not affect sizing.
#[derive(Clone, Debug)]
pub struct PoolOptions {
    /// Maximum time `acquire()` waits for a free slot (default: 5s).
    pub acquire_timeout: Duration,
    /// Record acquisition counts and wait time (default: false).
    pub profiler: bool,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            acquire_timeout: Duration::from_secs(5),
            profiler: false,
        }
    }
}

/// A physical connection with tracking metadata.
#[derive(Debug)]
struct PooledConnection {
    created_at: Instant,
    last_used: Instant,
    connection: Box<dyn PhysicalConnection>,
}

impl PooledConnection {
    fn new(connection: Box<dyn PhysicalConnection>) -> Self {
        let now = Instant::now();
        Self {
            created_at: now,
            last_used: now,
            connection,
        }
    }
}

#[derive(Debug, Default)]
struct PoolState {
    /// Idle connections, oldest first.
    idle: VecDeque<PooledConnection>,
    /// Checked-out connections keyed by lease.
    checked_out: HashMap<u64, PooledConnection>,
    /// Idle + checked out + slots reserved by in-flight opens.
    total: usize,
    wait_count: u64,
    acquisitions: u64,
    wait_time: Duration,
    closed: bool,
}

/// Point-in-time pool statistics.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections currently leased out.
    pub active: usize,
    /// Connections sitting idle in the pool.
    pub idle: usize,
    /// Total connections (active + idle + being opened).
    pub total: usize,
    pub min: usize,
    pub max: usize,
    /// Number of acquisitions that timed out waiting for a slot.
    pub wait_count: u64,
    /// Successful acquisitions (only counted with the profiler enabled).
    pub acquisitions: u64,
    /// Cumulative time spent in successful acquisitions (profiler only).
    pub wait_time: Duration,
}

/// Bounded pool of physical connections to one graph store endpoint.
pub struct Pool {
    endpoint: Endpoint,
    client: Arc<dyn StoreClient>,
    bounds: PoolBounds,
    options: PoolOptions,
    state: Mutex<PoolState>,
    /// Bounds checked-out connections to `max`.
    semaphore: Arc<Semaphore>,
    next_lease: AtomicU64,
}

impl Pool {
    /// Create a pool and eagerly open `bounds.min()` idle connections.
    ///
    /// If any open fails, connections opened so far are closed and the error
    /// (typically `TargetAbsent` or `Store`) is returned.
    pub async fn setup(
        endpoint: Endpoint,
        client: Arc<dyn StoreClient>,
        bounds: PoolBounds,
        options: PoolOptions,
    ) -> PoolResult<Self> {
        let pool = Self {
            endpoint,
            client,
            bounds,
            options,
            state: Mutex::new(PoolState::default()),
            semaphore: Arc::new(Semaphore::new(bounds.max)),
            next_lease: AtomicU64::new(1),
        };

        for _ in 0..bounds.min {
            let connection = match pool.client.open(&pool.endpoint) {
                Ok(connection) => connection,
                Err(err) => {
                    pool.close().await;
                    return Err(err);
                }
            };
            let mut state = pool.state.lock().await;
            state.idle.push_back(PooledConnection::new(connection));
            state.total += 1;
        }

        tracing::debug!(
            address = %pool.endpoint.address,
            min = bounds.min,
            max = bounds.max,
            "connection pool warmed"
        );
        Ok(pool)
    }

    pub fn bounds(&self) -> PoolBounds {
        self.bounds
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    /// Lease a physical connection.
    ///
    /// Reuses the oldest live idle connection, opens a new one while under
    /// `max`, and otherwise waits up to `acquire_timeout` for a release.
    pub async fn acquire(&self) -> PoolResult<u64> {
        if self.state.lock().await.closed {
            return Err(PoolError::Closed);
        }
        let started = Instant::now();

        let permit = match tokio::time::timeout(
            self.options.acquire_timeout,
            Arc::clone(&self.semaphore).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(PoolError::Closed),
            Err(_) => {
                self.state.lock().await.wait_count += 1;
                tracing::debug!(
                    address = %self.endpoint.address,
                    max = self.bounds.max,
                    timeout = ?self.options.acquire_timeout,
                    "connection pool exhausted"
                );
                return Err(PoolError::PoolExhausted {
                    max: self.bounds.max,
                    timeout: self.options.acquire_timeout,
                });
            }
        };

        let lease = self.next_lease.fetch_add(1, Ordering::Relaxed);

        {
            let mut state = self.state.lock().await;
            if state.closed {
                return Err(PoolError::Closed);
            }
            while let Some(mut conn) = state.idle.pop_front() {
                if conn.connection.is_alive() {
                    conn.last_used = Instant::now();
                    state.checked_out.insert(lease, conn);
                    self.record_acquisition(&mut state, started);
                    permit.forget();
                    tracing::debug!(lease, idle = state.idle.len(), "reused idle connection");
                    return Ok(lease);
                }
                conn.connection.close();
                state.total = state.total.saturating_sub(1);
                tracing::debug!(lease, "discarded dead idle connection");
            }
            // Reserve the slot before opening outside the lock.
            state.total += 1;
        }

        let opened = self.client.open(&self.endpoint);
        let mut state = self.state.lock().await;
        match opened {
            Ok(mut connection) => {
                if state.closed {
                    connection.close();
                    state.total = state.total.saturating_sub(1);
                    return Err(PoolError::Closed);
                }
                state.checked_out.insert(lease, PooledConnection::new(connection));
                self.record_acquisition(&mut state, started);
                permit.forget();
                tracing::debug!(lease, total = state.total, "opened new connection");
                Ok(lease)
            }
            Err(err) => {
                state.total = state.total.saturating_sub(1);
                tracing::debug!(lease, error = %err, "failed to open connection");
                Err(err)
            }
        }
    }

    fn record_acquisition(&self, state: &mut PoolState, started: Instant) {
        if self.options.profiler {
            state.acquisitions += 1;
            state.wait_time += started.elapsed();
        }
    }

    /// Return a leased connection.
    ///
    /// Dead connections are closed and discarded instead of going back to
    /// the idle queue. Releasing after `close()` reports `Closed`.
    pub async fn release(&self, lease: u64) -> PoolResult<()> {
        let mut state = self.state.lock().await;
        self.release_locked(&mut state, lease)
    }

    /// Return a lease without awaiting, for use from `Drop`.
    ///
    /// Inside a runtime the release is spawned onto it. Outside one the state
    /// lock is tried once; if it is contended the lease stays checked out
    /// until `close()`.
    pub(crate) fn release_detached(self: &Arc<Self>, lease: u64) {
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let pool = Arc::clone(self);
                runtime.spawn(async move {
                    if let Err(err) = pool.release(lease).await {
                        tracing::debug!(lease, error = %err, "detached release failed");
                    }
                });
            }
            Err(_) => match self.state.try_lock() {
                Ok(mut state) => {
                    if let Err(err) = self.release_locked(&mut state, lease) {
                        tracing::debug!(lease, error = %err, "detached release failed");
                    }
                }
                Err(_) => {
                    tracing::warn!(lease, "pool busy outside a runtime, lease left checked out");
                }
            },
        }
    }

    fn release_locked(&self, state: &mut PoolState, lease: u64) -> PoolResult<()> {
        let Some(mut conn) = state.checked_out.remove(&lease) else {
            if state.closed {
                return Err(PoolError::Closed);
            }
            return Err(PoolError::UnknownLease(lease));
        };

        if !conn.connection.is_alive() {
            conn.connection.close();
            state.total = state.total.saturating_sub(1);
            self.semaphore.add_permits(1);
            tracing::debug!(
                lease,
                age = ?conn.created_at.elapsed(),
                "discarded dead connection on release"
            );
            return Ok(());
        }

        conn.last_used = Instant::now();
        state.idle.push_back(conn);
        self.semaphore.add_permits(1);
        tracing::debug!(lease, idle = state.idle.len(), "returned connection to pool");
        Ok(())
    }

    /// Probe the liveness of a leased connection.
    pub async fn is_alive(&self, lease: u64) -> PoolResult<bool> {
        let mut state = self.state.lock().await;
        let conn = state
            .checked_out
            .get_mut(&lease)
            .ok_or(PoolError::UnknownLease(lease))?;
        Ok(conn.connection.is_alive())
    }

    /// Run `f` against a leased physical connection.
    pub async fn with_connection<R>(
        &self,
        lease: u64,
        f: impl FnOnce(&mut dyn PhysicalConnection) -> R,
    ) -> PoolResult<R> {
        let mut state = self.state.lock().await;
        let conn = state
            .checked_out
            .get_mut(&lease)
            .ok_or(PoolError::UnknownLease(lease))?;
        conn.last_used = Instant::now();
        Ok(f(conn.connection.as_mut()))
    }

    /// Probe idle connections and drop the dead ones. Returns how many were dropped.
    pub async fn evict_dead(&self) -> usize {
        let mut state = self.state.lock().await;
        let before = state.idle.len();
        state.idle.retain_mut(|conn| {
            let alive = conn.connection.is_alive();
            if !alive {
                conn.connection.close();
            }
            alive
        });
        let removed = before - state.idle.len();
        state.total = state.total.saturating_sub(removed);
        if removed > 0 {
            tracing::info!(
                address = %self.endpoint.address,
                removed,
                remaining_idle = state.idle.len(),
                "evicted dead idle connections"
            );
        }
        removed
    }

    pub async fn stats(&self) -> PoolStats {
        let state = self.state.lock().await;
        PoolStats {
            active: state.checked_out.len(),
            idle: state.idle.len(),
            total: state.total,
            min: self.bounds.min,
            max: self.bounds.max,
            wait_count: state.wait_count,
            acquisitions: state.acquisitions,
            wait_time: state.wait_time,
        }
    }

    /// Close every physical connection, idle and leased, and reject further acquires.
    ///
    /// Waiters blocked in `acquire()` are woken with `Closed`. Returns the
    /// number of leased connections that were force-closed; a second call
    /// is a no-op returning 0.
    pub async fn close(&self) -> usize {
        let mut state = self.state.lock().await;
        if state.closed {
            tracing::debug!(address = %self.endpoint.address, "connection pool already closed");
            return 0;
        }
        state.closed = true;
        self.semaphore.close();

        let idle = state.idle.len();
        for mut conn in state.idle.drain(..) {
            conn.connection.close();
        }
        let force_closed = state.checked_out.len();
        for (lease, mut conn) in state.checked_out.drain() {
            conn.connection.close();
            tracing::debug!(lease, "force-closed leased connection");
        }
        state.total = 0;

        tracing::info!(
            address = %self.endpoint.address,
            idle,
            force_closed,
            "connection pool closed"
        );
        force_closed
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("endpoint", &self.endpoint)
            .field("bounds", &self.bounds)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}
