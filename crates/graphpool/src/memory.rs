//! In-process graph store client.
//!
//! `MemoryStore` implements [`StoreClient`] without any I/O. Stores are just
//! registered addresses; sessions carry a shared liveness flag so callers can
//! simulate a store going away underneath pooled connections.

use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::{PoolError, PoolResult};
use crate::store::{Endpoint, PhysicalConnection, StoreClient};

#[derive(Debug, Default)]
struct Counters {
    opened: AtomicU64,
    closed: AtomicU64,
    created: AtomicU64,
}

/// A session handed out by [`MemoryStore`].
#[derive(Debug)]
pub struct MemorySession {
    id: u64,
    address: String,
    alive: Arc<AtomicBool>,
    closed: bool,
    counters: Arc<Counters>,
}

impl MemorySession {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

impl PhysicalConnection for MemorySession {
    fn is_alive(&mut self) -> bool {
        !self.closed && self.alive.load(Ordering::Acquire)
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.counters.closed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// In-memory stand-in for a graph store server.
#[derive(Debug, Default)]
pub struct MemoryStore {
    databases: Mutex<HashSet<String>>,
    /// Liveness flags of sessions not yet dropped.
    sessions: Mutex<Vec<Weak<AtomicBool>>>,
    counters: Arc<Counters>,
    refusing: AtomicBool,
    create_failing: AtomicBool,
}

impl MemoryStore {
    /// A server with no stores; the first open of any address is `TargetAbsent`.
    pub fn new() -> Self {
        Self::default()
    }

    /// A server that already hosts a store at `address`.
    pub fn with_store(address: &str) -> Self {
        let store = Self::default();
        store.databases.lock().insert(address.to_string());
        store
    }

    pub fn contains(&self, address: &str) -> bool {
        self.databases.lock().contains(address)
    }

    /// Sessions opened over the store's lifetime.
    pub fn opened(&self) -> u64 {
        self.counters.opened.load(Ordering::Relaxed)
    }

    /// Sessions closed over the store's lifetime.
    pub fn closed(&self) -> u64 {
        self.counters.closed.load(Ordering::Relaxed)
    }

    /// Stores created through [`StoreClient::create`].
    pub fn created(&self) -> u64 {
        self.counters.created.load(Ordering::Relaxed)
    }

    /// Sessions opened and not yet closed.
    pub fn open_sessions(&self) -> u64 {
        self.opened().saturating_sub(self.closed())
    }

    /// Mark every session handed out so far as dead.
    pub fn kill_sessions(&self) {
        let mut sessions = self.sessions.lock();
        for alive in sessions.drain(..).filter_map(|weak| weak.upgrade()) {
            alive.store(false, Ordering::Release);
        }
    }

    /// Refuse new sessions with a store error.
    pub fn set_refusing(&self, refusing: bool) {
        self.refusing.store(refusing, Ordering::Relaxed);
    }

    /// Make `create` fail.
    pub fn set_create_failing(&self, failing: bool) {
        self.create_failing.store(failing, Ordering::Relaxed);
    }
}

impl StoreClient for MemoryStore {
    fn open(&self, endpoint: &Endpoint) -> PoolResult<Box<dyn PhysicalConnection>> {
        if self.refusing.load(Ordering::Relaxed) {
            return Err(PoolError::Store(format!(
                "connection refused by {}",
                endpoint.address
            )));
        }
        if !self.contains(&endpoint.address) {
            return Err(PoolError::TargetAbsent {
                address: endpoint.address.clone(),
            });
        }

        let alive = Arc::new(AtomicBool::new(true));
        {
            let mut sessions = self.sessions.lock();
            sessions.retain(|weak| weak.strong_count() > 0);
            sessions.push(Arc::downgrade(&alive));
        }
        let id = self.counters.opened.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(Box::new(MemorySession {
            id,
            address: endpoint.address.clone(),
            alive,
            closed: false,
            counters: Arc::clone(&self.counters),
        }))
    }

    fn create(&self, endpoint: &Endpoint) -> PoolResult<()> {
        if self.create_failing.load(Ordering::Relaxed) {
            return Err(PoolError::Store(format!(
                "cannot create store at {}",
                endpoint.address
            )));
        }
        self.databases.lock().insert(endpoint.address.clone());
        self.counters.created.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
