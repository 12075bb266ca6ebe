//! Managed connections: one leased physical connection plus container bookkeeping.
//!
//! A managed connection never swaps its physical connection. It can be
//! associated with at most one logical handle at a time, and reports
//! lifecycle events (handle closed, connection failed) on the factory's
//! broadcast channel so the container can recycle or destroy it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::error::{PoolError, PoolResult};
use crate::pool::Pool;
use crate::store::PhysicalConnection;
use crate::transaction::TransactionSupportLevel;

/// Lifecycle notification from a managed connection to its listeners.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A client closed its handle; the connection may be handed out again.
    Closed { connection: u64, handle: u64 },
    /// The physical connection failed; the connection must be destroyed.
    Error { connection: u64, reason: String },
}

impl ConnectionEvent {
    pub fn connection(&self) -> u64 {
        match self {
            ConnectionEvent::Closed { connection, .. } | ConnectionEvent::Error { connection, .. } => {
                *connection
            }
        }
    }
}

/// Pool-backed wrapper around exactly one physical connection.
pub struct ManagedConnection {
    id: u64,
    lease: u64,
    pool: Arc<Pool>,
    transaction_support: TransactionSupportLevel,
    handle: Mutex<Option<u64>>,
    broken: AtomicBool,
    destroyed: AtomicBool,
    events: broadcast::Sender<ConnectionEvent>,
    /// The owning factory's live counter; only touched when dropped undestroyed.
    live: Arc<AtomicUsize>,
}

impl ManagedConnection {
    pub(crate) fn new(
        id: u64,
        lease: u64,
        pool: Arc<Pool>,
        transaction_support: TransactionSupportLevel,
        events: broadcast::Sender<ConnectionEvent>,
        live: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            id,
            lease,
            pool,
            transaction_support,
            handle: Mutex::new(None),
            broken: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            events,
            live,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Pool lease of the physical connection this wraps.
    pub fn lease(&self) -> u64 {
        self.lease
    }

    pub fn transaction_support(&self) -> TransactionSupportLevel {
        self.transaction_support
    }

    /// Set once a physical-level error was reported.
    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Bind a logical handle. Fails if any handle is already bound.
    pub fn associate(&self, handle: u64) -> PoolResult<()> {
        let mut current = self.handle.lock();
        if let Some(existing) = *current {
            return Err(PoolError::AlreadyAssociated {
                connection: self.id,
                handle: existing,
            });
        }
        *current = Some(handle);
        tracing::trace!(connection = self.id, handle, "associated handle");
        Ok(())
    }

    /// Unbind the current handle, returning it.
    pub fn dissociate(&self) -> Option<u64> {
        let previous = self.handle.lock().take();
        if let Some(handle) = previous {
            tracing::trace!(connection = self.id, handle, "dissociated handle");
        }
        previous
    }

    pub fn associated_handle(&self) -> Option<u64> {
        *self.handle.lock()
    }

    /// Reset container-visible state so the connection can be reused.
    pub fn cleanup(&self) {
        self.dissociate();
    }

    /// Check the physical connection. A failed probe reports an `Error` event.
    pub async fn probe(&self) -> PoolResult<bool> {
        if self.is_broken() {
            return Ok(false);
        }
        let alive = match self.pool.is_alive(self.lease).await {
            Ok(alive) => alive,
            Err(err) => {
                self.fail(format!("physical connection unavailable: {err}"));
                return Err(err);
            }
        };
        if !alive {
            self.fail("liveness probe failed".to_string());
        }
        Ok(alive)
    }

    /// Run `f` against the physical connection.
    pub async fn with_connection<R>(
        &self,
        f: impl FnOnce(&mut dyn PhysicalConnection) -> R,
    ) -> PoolResult<R> {
        if self.is_broken() || self.is_destroyed() {
            return Err(PoolError::Invalidated { connection: self.id });
        }
        match self.pool.with_connection(self.lease, f).await {
            Ok(result) => Ok(result),
            Err(err) => {
                self.fail(format!("physical connection unavailable: {err}"));
                Err(PoolError::Invalidated { connection: self.id })
            }
        }
    }

    /// Mark the connection broken and notify listeners. Reported once.
    pub fn fail(&self, reason: String) {
        if self.broken.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::warn!(connection = self.id, lease = self.lease, %reason, "managed connection failed");
        self.emit(ConnectionEvent::Error {
            connection: self.id,
            reason,
        });
    }

    pub(crate) fn notify_closed(&self, handle: u64) {
        self.emit(ConnectionEvent::Closed {
            connection: self.id,
            handle,
        });
    }

    fn emit(&self, event: ConnectionEvent) {
        if self.events.send(event).is_err() {
            tracing::trace!(connection = self.id, "no connection event listeners");
        }
    }

    /// Hand the physical connection back to the pool. Only the first call
    /// releases; returns `false` if already destroyed.
    pub(crate) async fn release(&self) -> PoolResult<bool> {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return Ok(false);
        }
        self.dissociate();
        self.pool.release(self.lease).await?;
        Ok(true)
    }
}

impl Drop for ManagedConnection {
    fn drop(&mut self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self
            .live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)));
        tracing::warn!(
            connection = self.id,
            lease = self.lease,
            "managed connection dropped without destroy, returning lease"
        );
        self.pool.release_detached(self.lease);
    }
}

impl std::fmt::Debug for ManagedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedConnection")
            .field("id", &self.id)
            .field("lease", &self.lease)
            .field("transaction_support", &self.transaction_support)
            .field("handle", &self.associated_handle())
            .field("broken", &self.is_broken())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::pool::{PoolBounds, PoolOptions};
    use crate::store::Endpoint;

    const ADDRESS: &str = "local:/tmp/managed";

    fn endpoint() -> Endpoint {
        Endpoint {
            address: ADDRESS.to_string(),
            username: "admin".to_string(),
            password: "admin".to_string(),
            encoding: "utf8".to_string(),
        }
    }

    async fn make_connection() -> (
        ManagedConnection,
        Arc<MemoryStore>,
        broadcast::Receiver<ConnectionEvent>,
    ) {
        let store = Arc::new(MemoryStore::with_store(ADDRESS));
        let pool = Arc::new(
            Pool::setup(endpoint(), store.clone(), PoolBounds::new(0, 2).unwrap(), PoolOptions::default())
                .await
                .unwrap(),
        );
        let lease = pool.acquire().await.unwrap();
        let (tx, rx) = broadcast::channel(16);
        let mc = ManagedConnection::new(
            1,
            lease,
            pool,
            TransactionSupportLevel::LocalTransaction,
            tx,
            Arc::new(AtomicUsize::new(1)),
        );
        (mc, store, rx)
    }

    #[tokio::test]
    async fn associate_once() {
        let (mc, _, _) = make_connection().await;
        mc.associate(10).unwrap();
        assert_eq!(mc.associated_handle(), Some(10));

        let err = mc.associate(11).unwrap_err();
        assert!(matches!(
            err,
            PoolError::AlreadyAssociated {
                connection: 1,
                handle: 10
            }
        ));
    }

    #[tokio::test]
    async fn dissociate_allows_reassociation() {
        let (mc, _, _) = make_connection().await;
        mc.associate(10).unwrap();
        assert_eq!(mc.dissociate(), Some(10));
        assert_eq!(mc.dissociate(), None);
        mc.associate(11).unwrap();
        assert_eq!(mc.associated_handle(), Some(11));
    }

    #[tokio::test]
    async fn probe_healthy_connection() {
        let (mc, _, mut rx) = make_connection().await;
        assert!(mc.probe().await.unwrap());
        assert!(!mc.is_broken());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn failed_probe_emits_single_error_event() {
        let (mc, store, mut rx) = make_connection().await;
        store.kill_sessions();

        assert!(!mc.probe().await.unwrap());
        assert!(!mc.probe().await.unwrap());
        assert!(mc.is_broken());

        let event = rx.try_recv().unwrap();
        assert!(matches!(event, ConnectionEvent::Error { connection: 1, .. }));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn broken_connection_rejects_use() {
        let (mc, _, _) = make_connection().await;
        mc.fail("test".to_string());
        let result = mc.with_connection(|conn| conn.is_alive()).await;
        assert!(matches!(result, Err(PoolError::Invalidated { connection: 1 })));
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let (mc, _, _) = make_connection().await;
        mc.associate(5).unwrap();
        assert!(mc.release().await.unwrap());
        assert!(!mc.release().await.unwrap());
        assert!(mc.is_destroyed());
        assert_eq!(mc.associated_handle(), None);
    }

    #[tokio::test]
    async fn drop_without_destroy_returns_lease() {
        let store = Arc::new(MemoryStore::with_store(ADDRESS));
        let pool = Arc::new(
            Pool::setup(endpoint(), store, PoolBounds::new(0, 1).unwrap(), PoolOptions::default())
                .await
                .unwrap(),
        );
        let live = Arc::new(AtomicUsize::new(1));
        let lease = pool.acquire().await.unwrap();
        let (tx, _) = broadcast::channel(16);
        let mc = ManagedConnection::new(
            1,
            lease,
            Arc::clone(&pool),
            TransactionSupportLevel::LocalTransaction,
            tx,
            Arc::clone(&live),
        );

        drop(mc);
        assert_eq!(live.load(Ordering::Acquire), 0);
        // Only slot; served once the spawned release lands.
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn drop_after_release_leaves_counter_alone() {
        let (mc, _, _) = make_connection().await;
        let live = Arc::clone(&mc.live);
        assert!(mc.release().await.unwrap());
        drop(mc);
        assert_eq!(live.load(Ordering::Acquire), 1);
    }

    #[tokio::test]
    async fn closed_event_carries_handle() {
        let (mc, _, mut rx) = make_connection().await;
        mc.notify_closed(7);
        assert_eq!(
            rx.try_recv().unwrap(),
            ConnectionEvent::Closed {
                connection: 1,
                handle: 7
            }
        );
    }
}
