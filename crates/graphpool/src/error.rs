//! Error types for the graph connection pool.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for pool and factory operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// Errors that can occur while managing pooled graph connections.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("invalid pool bounds: min={min}, max={max}")]
    InvalidBounds { min: i64, max: i64 },

    #[error("graph store does not exist at {address}")]
    TargetAbsent { address: String },

    #[error("connection pool exhausted (max: {max}, timeout: {timeout:?})")]
    PoolExhausted { max: usize, timeout: Duration },

    #[error("resource unavailable: {0}")]
    ResourceUnavailable(#[source] Box<PoolError>),

    #[error("managed connection {connection} already associated with handle {handle}")]
    AlreadyAssociated { connection: u64, handle: u64 },

    #[error("managed connection {connection} was invalidated")]
    Invalidated { connection: u64 },

    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("connection pool is closed")]
    Closed,

    #[error("connection factory has not been started")]
    NotStarted,

    #[error("refusing to stop with {live} live managed connections")]
    StopRefused { live: usize },

    #[error("unknown lease: {0}")]
    UnknownLease(u64),

    #[error("unknown handle: {0}")]
    UnknownHandle(u64),

    #[error("store error: {0}")]
    Store(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl PoolError {
    /// Wrap an acquisition failure as seen by a connection requester.
    ///
    /// Errors that already describe the requester's situation (a closed or
    /// unstarted factory) pass through unchanged.
    pub fn unavailable(self) -> Self {
        match self {
            PoolError::Closed | PoolError::NotStarted | PoolError::ResourceUnavailable(_) => self,
            other => PoolError::ResourceUnavailable(Box::new(other)),
        }
    }

    /// Whether this error means the requester could not get a connection in time.
    pub fn is_exhausted(&self) -> bool {
        match self {
            PoolError::PoolExhausted { .. } => true,
            PoolError::ResourceUnavailable(inner) => inner.is_exhausted(),
            _ => false,
        }
    }
}

impl From<toml::de::Error> for PoolError {
    fn from(err: toml::de::Error) -> Self {
        PoolError::Config(err.to_string())
    }
}

impl From<std::io::Error> for PoolError {
    fn from(err: std::io::Error) -> Self {
        PoolError::Config(err.to_string())
    }
}
