//! Resource adapter: the set of connection factories a deployment registers.
//!
//! Factories are deduplicated by identity, and started or stopped together
//! when the adapter itself is.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::PoolResult;
use crate::factory::ManagedConnectionFactory;

#[derive(Debug, Default)]
pub struct ResourceAdapter {
    factories: Mutex<Vec<Arc<ManagedConnectionFactory>>>,
}

impl ResourceAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory. Returns `false` if this exact factory is already registered.
    pub fn add_factory(&self, factory: Arc<ManagedConnectionFactory>) -> bool {
        let mut factories = self.factories.lock();
        if factories.iter().any(|existing| **existing == *factory) {
            return false;
        }
        factories.push(factory);
        true
    }

    pub fn remove_factory(&self, factory: &ManagedConnectionFactory) -> bool {
        let mut factories = self.factories.lock();
        let before = factories.len();
        factories.retain(|existing| **existing != *factory);
        factories.len() != before
    }

    pub fn factories(&self) -> Vec<Arc<ManagedConnectionFactory>> {
        self.factories.lock().clone()
    }

    /// Start every registered factory, stopping at the first failure.
    pub async fn start(&self) -> PoolResult<()> {
        for factory in self.factories() {
            factory.start().await?;
        }
        tracing::info!(factories = self.factories.lock().len(), "resource adapter started");
        Ok(())
    }

    /// Stop every registered factory. All are attempted; the first error is returned.
    pub async fn stop(&self) -> PoolResult<()> {
        let mut first_error = None;
        for factory in self.factories() {
            if let Err(err) = factory.stop().await {
                tracing::warn!(
                    address = %factory.config().connection_url,
                    error = %err,
                    "failed to stop connection factory"
                );
                first_error.get_or_insert(err);
            }
        }
        tracing::info!("resource adapter stopped");
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EndpointConfig, StopPolicy};
    use crate::diagnostics::{CaptureBuffer, LogWriter};
    use crate::error::PoolError;
    use crate::factory::RequestInfo;
    use crate::memory::MemoryStore;

    fn factory(address: &str, store: &Arc<MemoryStore>) -> Arc<ManagedConnectionFactory> {
        let config = EndpointConfig {
            connection_url: address.to_string(),
            pool_min_size: 0,
            pool_max_size: 2,
            stop_policy: StopPolicy::Refuse,
            ..EndpointConfig::default()
        };
        let factory = Arc::new(ManagedConnectionFactory::new(config, store.clone()));
        factory.set_log_writer(LogWriter::new(CaptureBuffer::new()));
        factory
    }

    #[test]
    fn add_factory_dedupes_by_identity() {
        let store = Arc::new(MemoryStore::new());
        let adapter = ResourceAdapter::new();
        let a = factory("local:/a", &store);
        let twin = factory("local:/a", &store);

        assert!(adapter.add_factory(a.clone()));
        assert!(!adapter.add_factory(a.clone()));
        assert!(adapter.add_factory(twin));
        assert_eq!(adapter.factories().len(), 2);

        assert!(adapter.remove_factory(&a));
        assert!(!adapter.remove_factory(&a));
        assert_eq!(adapter.factories().len(), 1);
    }

    #[tokio::test]
    async fn start_and_stop_all() {
        let store = Arc::new(MemoryStore::new());
        let adapter = ResourceAdapter::new();
        let a = factory("local:/a", &store);
        let b = factory("local:/b", &store);
        adapter.add_factory(a.clone());
        adapter.add_factory(b.clone());

        adapter.start().await.unwrap();
        assert!(a.is_started().await);
        assert!(b.is_started().await);
        assert_eq!(store.created(), 2);

        adapter.stop().await.unwrap();
        assert!(!a.is_started().await);
        assert!(!b.is_started().await);
    }

    #[tokio::test]
    async fn stop_attempts_every_factory() {
        let store = Arc::new(MemoryStore::new());
        let adapter = ResourceAdapter::new();
        let busy = factory("local:/busy", &store);
        let idle = factory("local:/idle", &store);
        adapter.add_factory(busy.clone());
        adapter.add_factory(idle.clone());
        adapter.start().await.unwrap();

        let _mc = busy.create_managed_connection(&RequestInfo::default()).await.unwrap();
        let result = adapter.stop().await;

        assert!(matches!(result, Err(PoolError::StopRefused { live: 1 })));
        assert!(busy.is_started().await);
        assert!(!idle.is_started().await);
    }
}
