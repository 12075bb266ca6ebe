//! graphpool: managed connection pooling for graph database adapters.
//!
//! Brokers a bounded pool of physical store connections to many concurrent
//! requests inside a container that owns connection creation, transaction
//! enlistment, and teardown timing:
//! - **pool**: min/max sized pool of physical connections with bounded, timed acquire
//! - **managed**: managed connections wrapping one leased physical connection each
//! - **handle**: client handles, rebindable through an indirection table
//! - **factory**: start/stop, create/match/destroy, live-connection counting
//! - **container**: connection manager contract and an in-process implementation
//! - **adapter**: registry of factories started and stopped together
//! - **store** / **memory**: the store-client boundary and an in-process store
//! - **config** / **logging** / **diagnostics**: configuration, tracing setup, status lines
//!
//! # Architecture
//!
//! ```text
//! ConnectionFactory::get_connection()
//!   → ConnectionManager::allocate_connection()
//!     → ManagedConnectionFactory::match_managed_connections(free set)
//!     → or ManagedConnectionFactory::create_managed_connection()
//!       → Pool::acquire() → StoreClient::open()
//!   → ConnectionHandle (weakly bound via HandleTable)
//! ConnectionHandle::close() → ConnectionEvent::Closed → connection back to free set
//! ```

pub mod adapter;
pub mod config;
pub mod container;
pub mod diagnostics;
pub mod error;
pub mod factory;
pub mod handle;
pub mod logging;
pub mod managed;
pub mod memory;
pub mod pool;
pub mod store;
pub mod transaction;

pub use adapter::ResourceAdapter;
pub use config::{EndpointConfig, LogLevel, StopPolicy};
pub use container::{ConnectionFactory, ConnectionManager, LocalConnectionManager};
pub use diagnostics::LogWriter;
pub use error::{PoolError, PoolResult};
pub use factory::{Candidate, ManagedConnectionFactory, RequestInfo};
pub use handle::ConnectionHandle;
pub use managed::{ConnectionEvent, ManagedConnection};
pub use memory::MemoryStore;
pub use pool::{Pool, PoolBounds, PoolOptions, PoolStats};
pub use store::{Endpoint, PhysicalConnection, StoreClient};
pub use transaction::TransactionSupportLevel;
