//! Boundary to the graph store's own client library.
//!
//! The pool never looks at queries or the graph model. It only needs to
//! open sessions, ask whether they are still alive, close them, and (once,
//! during bootstrap) create a store that does not exist yet.

use std::fmt;

use crate::error::PoolResult;

/// Connection parameters handed to the store client.
#[derive(Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub address: String,
    pub username: String,
    pub password: String,
    pub encoding: String,
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("address", &self.address)
            .field("username", &self.username)
            .field("encoding", &self.encoding)
            .finish_non_exhaustive()
    }
}

/// A live session with the graph store.
pub trait PhysicalConnection: Send + fmt::Debug {
    /// Liveness probe. Returns `false` once the session is unusable.
    fn is_alive(&mut self) -> bool;
    /// Close the session. Must tolerate being called on a dead session.
    fn close(&mut self);
}

/// Opens physical connections; injected so the pool can be tested without a store.
pub trait StoreClient: Send + Sync {
    /// Open a new session.
    ///
    /// Fails with `PoolError::TargetAbsent` when no store exists at the
    /// endpoint address.
    fn open(&self, endpoint: &Endpoint) -> PoolResult<Box<dyn PhysicalConnection>>;

    /// Create an empty store at the endpoint address.
    fn create(&self, endpoint: &Endpoint) -> PoolResult<()>;
}
