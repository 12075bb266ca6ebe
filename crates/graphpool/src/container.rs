//! Container side of the managed-connection contract.
//!
//! Applications ask a [`ConnectionFactory`] for connections; the factory
//! defers to the container's [`ConnectionManager`], which decides whether a
//! pooled managed connection can be reused or a new one must be created.
//! [`LocalConnectionManager`] is a small in-process container that does
//! exactly that, driven by the factory's lifecycle events.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::TryRecvError};

use crate::error::{PoolError, PoolResult};
use crate::factory::{Candidate, ManagedConnectionFactory, RequestInfo};
use crate::handle::ConnectionHandle;
use crate::managed::{ConnectionEvent, ManagedConnection};
use crate::transaction::TransactionSupportLevel;

/// Hook the container provides for allocating connection handles.
#[async_trait]
pub trait ConnectionManager: Send + Sync {
    async fn allocate_connection(
        &self,
        factory: &Arc<ManagedConnectionFactory>,
        request: &RequestInfo,
    ) -> PoolResult<ConnectionHandle>;
}

/// What application code uses to obtain graph connections.
#[derive(Clone)]
pub struct ConnectionFactory {
    managed: Arc<ManagedConnectionFactory>,
    manager: Arc<dyn ConnectionManager>,
}

impl ConnectionFactory {
    pub(crate) fn new(managed: Arc<ManagedConnectionFactory>, manager: Arc<dyn ConnectionManager>) -> Self {
        Self { managed, manager }
    }

    pub async fn get_connection(&self) -> PoolResult<ConnectionHandle> {
        self.get_connection_with(&RequestInfo::default()).await
    }

    pub async fn get_connection_with(&self, request: &RequestInfo) -> PoolResult<ConnectionHandle> {
        self.manager.allocate_connection(&self.managed, request).await
    }

    pub fn transaction_support(&self) -> TransactionSupportLevel {
        self.managed.transaction_support()
    }
}

impl std::fmt::Debug for ConnectionFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionFactory")
            .field("managed", &self.managed)
            .finish_non_exhaustive()
    }
}

/// In-process container for a single managed connection factory.
///
/// Free managed connections are offered to `match_managed_connections`
/// before new ones are created. Events are drained on every allocation:
/// `Closed` returns a connection to the free set, `Error` destroys it.
pub struct LocalConnectionManager {
    factory: Arc<ManagedConnectionFactory>,
    events: Mutex<broadcast::Receiver<ConnectionEvent>>,
    free: Mutex<Vec<Arc<ManagedConnection>>>,
    in_use: Mutex<HashMap<u64, Arc<ManagedConnection>>>,
}

impl LocalConnectionManager {
    pub fn new(factory: Arc<ManagedConnectionFactory>) -> Arc<Self> {
        let events = factory.subscribe();
        Arc::new(Self {
            factory,
            events: Mutex::new(events),
            free: Mutex::new(Vec::new()),
            in_use: Mutex::new(HashMap::new()),
        })
    }

    /// Client-facing factory routed through this manager.
    pub fn connection_factory(self: &Arc<Self>) -> PoolResult<ConnectionFactory> {
        let manager: Arc<dyn ConnectionManager> = Arc::clone(self) as Arc<dyn ConnectionManager>;
        self.factory.create_connection_factory(Some(manager))
    }

    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }

    pub fn in_use_count(&self) -> usize {
        self.in_use.lock().len()
    }

    /// Apply pending lifecycle events. Returns how many were handled.
    pub async fn process_events(&self) -> usize {
        let mut pending = Vec::new();
        let mut lagged = false;
        {
            let mut events = self.events.lock();
            loop {
                match events.try_recv() {
                    Ok(event) => pending.push(event),
                    Err(TryRecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "connection events lagged, reconciling");
                        lagged = true;
                    }
                    Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
                }
            }
        }

        let handled = pending.len();
        for event in pending {
            match event {
                ConnectionEvent::Closed { connection, handle } => {
                    tracing::debug!(connection, handle, "handle closed, recycling connection");
                    self.recycle(connection);
                }
                ConnectionEvent::Error { connection, reason } => {
                    tracing::debug!(connection, %reason, "connection error, destroying");
                    self.discard(connection).await;
                }
            }
        }
        if lagged {
            self.reconcile().await;
        }
        handled
    }

    fn recycle(&self, connection: u64) {
        let Some(mc) = self.in_use.lock().remove(&connection) else {
            return;
        };
        if mc.is_broken() || mc.is_destroyed() {
            return;
        }
        if mc.associated_handle().is_some() {
            // Rebound to another handle since the close; still in use.
            self.in_use.lock().insert(connection, mc);
            return;
        }
        mc.cleanup();
        self.free.lock().push(mc);
    }

    async fn discard(&self, connection: u64) {
        let removed = self.in_use.lock().remove(&connection).or_else(|| {
            let mut free = self.free.lock();
            let index = free.iter().position(|mc| mc.id() == connection)?;
            Some(free.swap_remove(index))
        });
        if let Some(mc) = removed {
            self.factory.destroy_managed_connection(&mc).await;
        }
    }

    /// Rebuild free/in-use sets from connection state after lost events.
    async fn reconcile(&self) {
        let in_use: Vec<_> = self.in_use.lock().drain().collect();
        let mut broken = Vec::new();
        for (id, mc) in in_use {
            if mc.is_broken() {
                broken.push(mc);
            } else if mc.associated_handle().is_some() {
                self.in_use.lock().insert(id, mc);
            } else {
                self.free.lock().push(mc);
            }
        }
        for mc in broken {
            self.factory.destroy_managed_connection(&mc).await;
        }
    }

    async fn checkout(&self, request: &RequestInfo) -> PoolResult<Arc<ManagedConnection>> {
        self.process_events().await;

        let candidates: Vec<Candidate> = self
            .free
            .lock()
            .iter()
            .map(|mc| Candidate::Graph(Arc::clone(mc)))
            .collect();

        if let Some(mc) = self.factory.match_managed_connections(&candidates, request) {
            self.free.lock().retain(|free| !Arc::ptr_eq(free, &mc));
            return Ok(mc);
        }
        self.factory.create_managed_connection(request).await
    }

    /// Point a handle at a fresh managed connection.
    ///
    /// The connection it leaves goes back to the free set, or is destroyed
    /// if it failed.
    pub async fn reconnect(&self, handle: &ConnectionHandle) -> PoolResult<()> {
        let previous = handle.managed().ok();
        let mc = self.checkout(&RequestInfo::default()).await?;
        if let Err(err) = self.factory.associate_handle(handle, &mc) {
            self.free.lock().push(mc);
            return Err(err);
        }
        tracing::debug!(handle = handle.id(), connection = mc.id(), "handle reconnected");
        self.in_use.lock().insert(mc.id(), Arc::clone(&mc));

        if let Some(previous) = previous.filter(|previous| !Arc::ptr_eq(previous, &mc)) {
            self.in_use.lock().remove(&previous.id());
            if previous.is_broken() || previous.is_destroyed() {
                self.factory.destroy_managed_connection(&previous).await;
            } else {
                previous.cleanup();
                self.free.lock().push(previous);
            }
        }
        Ok(())
    }

    /// Destroy every free managed connection. Returns how many were destroyed.
    pub async fn shutdown(&self) -> usize {
        self.process_events().await;
        let free: Vec<_> = self.free.lock().drain(..).collect();
        for mc in &free {
            self.factory.destroy_managed_connection(mc).await;
        }
        free.len()
    }
}

#[async_trait]
impl ConnectionManager for LocalConnectionManager {
    async fn allocate_connection(
        &self,
        factory: &Arc<ManagedConnectionFactory>,
        request: &RequestInfo,
    ) -> PoolResult<ConnectionHandle> {
        if **factory != *self.factory {
            return Err(PoolError::UnsupportedOperation(
                "connection manager is bound to a different factory".to_string(),
            ));
        }

        let mc = self.checkout(request).await?;
        let handle = match self.factory.connection_handle(&mc) {
            Ok(handle) => handle,
            Err(err) => {
                self.free.lock().push(mc);
                return Err(err);
            }
        };
        self.in_use.lock().insert(mc.id(), mc);
        Ok(handle)
    }
}

impl std::fmt::Debug for LocalConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalConnectionManager")
            .field("factory", &self.factory)
            .field("free", &self.free_count())
            .field("in_use", &self.in_use_count())
            .finish()
    }
}
