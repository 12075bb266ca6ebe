//! Managed connection factory: the configuration-bound entry point.
//!
//! # Lifecycle
//!
//! ```text
//! start()
//!   → Pool::setup(min, max) + one probe acquire/release
//!     → TargetAbsent → create the store once → setup again
//! create_managed_connection()  → lease from pool, live counter + 1
//! match_managed_connections()  → first candidate of our own kind
//! destroy_managed_connection() → lease back to pool, live counter - 1
//! stop()
//!   → close pool (policy decides what happens to live connections)
//! ```
//!
//! Creates wait for a pool slot outside the lifecycle lock, so `stop()`
//! wakes them with `Closed`. The live counter is then incremented under the
//! read lock, after checking the pool is still the running one, and `stop()`
//! reads it under the write lock.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::RwLock as SyncRwLock;
use tokio::sync::{RwLock, broadcast};

use crate::config::{EndpointConfig, StopPolicy};
use crate::container::{ConnectionFactory, ConnectionManager};
use crate::diagnostics::LogWriter;
use crate::error::{PoolError, PoolResult};
use crate::handle::{ConnectionHandle, HandleTable};
use crate::managed::{ConnectionEvent, ManagedConnection};
use crate::pool::{Pool, PoolOptions, PoolStats};
use crate::store::StoreClient;
use crate::transaction::TransactionSupportLevel;

const EVENT_CAPACITY: usize = 256;

/// Per-request information passed by the container.
///
/// Matching is capability-based, so the subject is only recorded in logs.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestInfo {
    pub subject: Option<String>,
}

impl RequestInfo {
    pub fn for_subject(subject: &str) -> Self {
        Self {
            subject: Some(subject.to_string()),
        }
    }
}

/// A managed connection the container offers for matching.
///
/// Containers pool connections from several adapters together; only the
/// `Graph` variant is one this factory can reuse.
#[derive(Clone, Debug)]
pub enum Candidate {
    Graph(Arc<ManagedConnection>),
    Foreign { adapter: String, id: u64 },
}

/// Creates, matches, and destroys managed graph connections over one pool.
pub struct ManagedConnectionFactory {
    config: EndpointConfig,
    client: Arc<dyn StoreClient>,
    transaction_support: TransactionSupportLevel,
    lifecycle: RwLock<Option<Arc<Pool>>>,
    /// Managed connections created and not yet destroyed.
    live: Arc<AtomicUsize>,
    next_connection: AtomicU64,
    handles: Arc<HandleTable>,
    events: broadcast::Sender<ConnectionEvent>,
    log_writer: SyncRwLock<LogWriter>,
}

impl ManagedConnectionFactory {
    pub fn new(config: EndpointConfig, client: Arc<dyn StoreClient>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            transaction_support: TransactionSupportLevel::negotiate(config.xa),
            config,
            client,
            lifecycle: RwLock::new(None),
            live: Arc::new(AtomicUsize::new(0)),
            next_connection: AtomicU64::new(1),
            handles: Arc::new(HandleTable::new()),
            events,
            log_writer: SyncRwLock::new(LogWriter::stdout()),
        }
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    pub async fn is_started(&self) -> bool {
        self.lifecycle.read().await.is_some()
    }

    /// Build the pool, warm it, and validate connectivity.
    ///
    /// If the store does not exist yet it is created once and the pool is
    /// built again; a second failure is returned as-is. Starting a running
    /// factory is a no-op.
    pub async fn start(&self) -> PoolResult<()> {
        let mut lifecycle = self.lifecycle.write().await;
        if lifecycle.is_some() {
            tracing::debug!(address = %self.config.connection_url, "factory already started");
            return Ok(());
        }

        self.config.validate()?;
        if self.config.dump_config {
            tracing::info!(config = %self.config.dump(), "endpoint configuration");
        }

        let pool = match self.open_pool().await {
            Err(PoolError::TargetAbsent { address }) => {
                tracing::warn!(%address, "graph store does not exist, creating it");
                self.diagnostic(format_args!("store {address} not found; creating it"));
                self.client.create(&self.config.endpoint())?;
                self.open_pool().await?
            }
            other => other?,
        };

        let bounds = pool.bounds();
        *lifecycle = Some(Arc::new(pool));
        tracing::info!(
            address = %self.config.connection_url,
            min = bounds.min(),
            max = bounds.max(),
            "database pool acquired"
        );
        self.diagnostic("Database pool acquired");
        Ok(())
    }

    async fn open_pool(&self) -> PoolResult<Pool> {
        let options = PoolOptions {
            acquire_timeout: self.config.acquire_timeout()?,
            profiler: self.config.profiler,
        };
        let pool = Pool::setup(
            self.config.endpoint(),
            Arc::clone(&self.client),
            self.config.bounds()?,
            options,
        )
        .await?;

        let probe = match pool.acquire().await {
            Ok(lease) => pool.release(lease).await,
            Err(err) => Err(err),
        };
        if let Err(err) = probe {
            pool.close().await;
            return Err(err);
        }
        Ok(pool)
    }

    /// Close the pool.
    ///
    /// With `StopPolicy::Force`, leased physical connections are closed too
    /// and their count is returned. With `StopPolicy::Refuse`, stopping while
    /// managed connections are live fails with `StopRefused`. Stopping a
    /// stopped factory is a no-op returning 0.
    pub async fn stop(&self) -> PoolResult<usize> {
        let mut lifecycle = self.lifecycle.write().await;
        let live = self.live.load(Ordering::Acquire);
        if lifecycle.is_none() {
            tracing::debug!(address = %self.config.connection_url, "factory already stopped");
            self.diagnostic("Database pool already closed");
            return Ok(0);
        }
        if live > 0 && self.config.stop_policy == StopPolicy::Refuse {
            tracing::warn!(live, "refusing to stop with live managed connections");
            return Err(PoolError::StopRefused { live });
        }

        let force_closed = match lifecycle.take() {
            Some(pool) => pool.close().await,
            None => 0,
        };
        if live > 0 {
            tracing::warn!(live, force_closed, "stopped with live managed connections");
        }
        tracing::info!(address = %self.config.connection_url, "database pool closed");
        self.diagnostic("Database pool closed");
        Ok(force_closed)
    }

    /// Lease a physical connection and wrap it in a new managed connection.
    ///
    /// Waits per the pool's acquire timeout; failures surface as
    /// `ResourceUnavailable`.
    pub async fn create_managed_connection(
        &self,
        request: &RequestInfo,
    ) -> PoolResult<Arc<ManagedConnection>> {
        let pool = {
            let lifecycle = self.lifecycle.read().await;
            Arc::clone(lifecycle.as_ref().ok_or(PoolError::NotStarted)?)
        };
        // Wait outside the lock so stop() can close the pool and wake us.
        let lease = pool.acquire().await.map_err(PoolError::unavailable)?;

        let lifecycle = self.lifecycle.read().await;
        let current = lifecycle
            .as_ref()
            .is_some_and(|running| Arc::ptr_eq(running, &pool));
        if !current {
            drop(lifecycle);
            if let Err(err) = pool.release(lease).await {
                tracing::debug!(lease, error = %err, "lease from a stopped pool not returned");
            }
            return Err(PoolError::Closed);
        }

        let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let live = self.live.fetch_add(1, Ordering::AcqRel) + 1;
        let connection = Arc::new(ManagedConnection::new(
            id,
            lease,
            pool,
            self.transaction_support,
            self.events.clone(),
            Arc::clone(&self.live),
        ));
        tracing::debug!(
            connection = id,
            lease,
            live,
            subject = request.subject.as_deref().unwrap_or("-"),
            "created managed connection"
        );
        Ok(connection)
    }

    /// Pick the first candidate produced by a graph factory.
    pub fn match_managed_connections(
        &self,
        candidates: &[Candidate],
        request: &RequestInfo,
    ) -> Option<Arc<ManagedConnection>> {
        let matched = candidates.iter().find_map(|candidate| match candidate {
            Candidate::Graph(connection) => Some(Arc::clone(connection)),
            Candidate::Foreign { .. } => None,
        });
        tracing::info!(
            candidates = candidates.len(),
            matched = matched.as_ref().map(|c| c.id()),
            subject = request.subject.as_deref().unwrap_or("-"),
            "matchManagedConnections"
        );
        self.diagnostic(format_args!(
            "match attempt over {} candidates: {}",
            candidates.len(),
            if matched.is_some() { "matched" } else { "no match" }
        ));
        matched
    }

    /// Return a managed connection's lease to the pool and decrement the
    /// live counter.
    ///
    /// Never fails: release problems are logged. Reaching zero live
    /// connections is reported, but the pool stays open until `stop()`.
    pub async fn destroy_managed_connection(&self, connection: &ManagedConnection) {
        match connection.release().await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(connection = connection.id(), "managed connection already destroyed");
                return;
            }
            Err(err) => {
                tracing::warn!(
                    connection = connection.id(),
                    error = %err,
                    "failed to release managed connection"
                );
                self.diagnostic(format_args!(
                    "release of connection {} failed: {err}",
                    connection.id()
                ));
            }
        }

        let previous = self
            .live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        let live = previous.saturating_sub(1);
        tracing::debug!(connection = connection.id(), live, "destroyed managed connection");
        if live == 0 {
            tracing::info!(address = %self.config.connection_url, "no live connections; store can be shut down");
            self.diagnostic("Shutdown database!");
        }
    }

    /// Managed connections created and not yet destroyed.
    pub fn live_connections(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Transaction level advertised to the transaction manager.
    pub fn transaction_support(&self) -> TransactionSupportLevel {
        tracing::info!(
            xa = self.transaction_support.is_distributed(),
            "transaction support level: {}",
            self.transaction_support
        );
        self.transaction_support
    }

    /// Issue a new client handle bound to `connection`.
    pub fn connection_handle(&self, connection: &Arc<ManagedConnection>) -> PoolResult<ConnectionHandle> {
        if connection.is_broken() || connection.is_destroyed() {
            return Err(PoolError::Invalidated {
                connection: connection.id(),
            });
        }
        let id = self.handles.open(connection)?;
        Ok(ConnectionHandle::new(id, Arc::clone(&self.handles)))
    }

    /// Rebind an existing handle to another managed connection.
    pub fn associate_handle(
        &self,
        handle: &ConnectionHandle,
        connection: &Arc<ManagedConnection>,
    ) -> PoolResult<()> {
        if handle.is_closed() {
            return Err(PoolError::UnknownHandle(handle.id()));
        }
        self.handles.rebind(handle.id(), connection)
    }

    /// Open client handles.
    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    /// Listen for `Closed`/`Error` events from this factory's connections.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    pub async fn pool_stats(&self) -> Option<PoolStats> {
        let lifecycle = self.lifecycle.read().await;
        match lifecycle.as_ref() {
            Some(pool) => Some(pool.stats().await),
            None => None,
        }
    }

    /// Client-facing factory bound to a container's connection manager.
    ///
    /// Without a manager (non-managed usage) this always fails.
    pub fn create_connection_factory(
        self: &Arc<Self>,
        manager: Option<Arc<dyn ConnectionManager>>,
    ) -> PoolResult<ConnectionFactory> {
        match manager {
            Some(manager) => Ok(ConnectionFactory::new(Arc::clone(self), manager)),
            None => Err(PoolError::UnsupportedOperation(
                "graph connections require a managed environment".to_string(),
            )),
        }
    }

    pub fn log_writer(&self) -> LogWriter {
        tracing::debug!("log writer requested");
        self.log_writer.read().clone()
    }

    pub fn set_log_writer(&self, writer: LogWriter) {
        tracing::debug!("log writer replaced");
        *self.log_writer.write() = writer;
    }

    fn diagnostic(&self, message: impl std::fmt::Display) {
        self.log_writer.read().line(message);
    }
}

impl PartialEq for ManagedConnectionFactory {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self, other)
    }
}

impl Eq for ManagedConnectionFactory {}

impl std::fmt::Debug for ManagedConnectionFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedConnectionFactory")
            .field("address", &self.config.connection_url)
            .field("transaction_support", &self.transaction_support)
            .field("live", &self.live_connections())
            .finish_non_exhaustive()
    }
}
