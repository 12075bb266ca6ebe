//! Client-facing connection handles.
//!
//! A handle never owns its managed connection. It holds an id into the
//! factory's [`HandleTable`], which maps to a weak reference; rebinding a
//! handle to another managed connection is a table update under the lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::{PoolError, PoolResult};
use crate::managed::ManagedConnection;
use crate::store::PhysicalConnection;
use crate::transaction::TransactionSupportLevel;

/// Handle id → managed connection currently backing it.
#[derive(Debug)]
pub struct HandleTable {
    next_id: AtomicU64,
    entries: Mutex<HashMap<u64, Weak<ManagedConnection>>>,
}

impl Default for HandleTable {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl HandleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a handle id bound to `connection`.
    pub(crate) fn open(&self, connection: &Arc<ManagedConnection>) -> PoolResult<u64> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries.lock();
        connection.associate(id)?;
        entries.insert(id, Arc::downgrade(connection));
        Ok(id)
    }

    /// Point an open handle at a different managed connection.
    ///
    /// The new connection must be free; the previous one (if still alive)
    /// is dissociated.
    pub(crate) fn rebind(&self, handle: u64, connection: &Arc<ManagedConnection>) -> PoolResult<()> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(&handle).ok_or(PoolError::UnknownHandle(handle))?;
        let previous = entry.upgrade();
        if let Some(previous) = &previous {
            if Arc::ptr_eq(previous, connection) {
                return Ok(());
            }
        }
        connection.associate(handle)?;
        *entry = Arc::downgrade(connection);
        if let Some(previous) = previous {
            if previous.associated_handle() == Some(handle) {
                previous.dissociate();
            }
        }
        tracing::debug!(handle, connection = connection.id(), "rebound handle");
        Ok(())
    }

    /// The managed connection behind `handle`, if both are still alive.
    pub fn resolve(&self, handle: u64) -> Option<Arc<ManagedConnection>> {
        self.entries.lock().get(&handle).and_then(Weak::upgrade)
    }

    pub(crate) fn remove(&self, handle: u64) -> Option<Arc<ManagedConnection>> {
        self.entries.lock().remove(&handle).and_then(|weak| weak.upgrade())
    }

    /// Number of open handles.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What an application holds while it uses a graph connection.
///
/// Closing the handle (explicitly or by dropping it) detaches it from its
/// managed connection and emits a `Closed` event so the container can
/// recycle that connection.
#[derive(Debug)]
pub struct ConnectionHandle {
    id: u64,
    table: Arc<HandleTable>,
    closed: AtomicBool,
}

impl ConnectionHandle {
    pub(crate) fn new(id: u64, table: Arc<HandleTable>) -> Self {
        Self {
            id,
            table,
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// The managed connection currently backing this handle.
    pub fn managed(&self) -> PoolResult<Arc<ManagedConnection>> {
        if self.is_closed() {
            return Err(PoolError::UnknownHandle(self.id));
        }
        self.table
            .resolve(self.id)
            .ok_or(PoolError::UnknownHandle(self.id))
    }

    pub fn transaction_support(&self) -> PoolResult<TransactionSupportLevel> {
        Ok(self.managed()?.transaction_support())
    }

    /// Run `f` against the physical connection behind this handle.
    pub async fn with_connection<R>(
        &self,
        f: impl FnOnce(&mut dyn PhysicalConnection) -> R,
    ) -> PoolResult<R> {
        self.managed()?.with_connection(f).await
    }

    /// Detach from the managed connection. Subsequent calls do nothing.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(connection) = self.table.remove(self.id) {
            if connection.associated_handle() == Some(self.id) {
                connection.dissociate();
            }
            connection.notify_closed(self.id);
        }
        tracing::debug!(handle = self.id, "closed connection handle");
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.close();
    }
}
