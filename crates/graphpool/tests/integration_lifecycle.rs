//! End-to-end lifecycle tests: factory start/stop, pool sizing, exhaustion,
//! store bootstrap, and handle recycling through the local container.
//!
//! The test stack: `ConnectionFactory` → `LocalConnectionManager` →
//! `ManagedConnectionFactory` → `Pool` → `MemoryStore`

use std::sync::{Arc, Once};
use std::time::Duration;

use graphpool::diagnostics::CaptureBuffer;
use graphpool::{
    EndpointConfig, LocalConnectionManager, LogWriter, ManagedConnectionFactory, MemoryStore, Pool,
    PoolBounds, PoolError, PoolOptions, RequestInfo, StopPolicy, StoreClient,
};

const ADDRESS: &str = "local:../databases/it-graph";

static TRACING_INIT: Once = Once::new();

/// Controlled by `RUST_LOG` (e.g. `RUST_LOG=graphpool=debug`).
fn init_tracing() {
    TRACING_INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init()
            .ok();
    });
}

fn config(min: i32, max: i32) -> EndpointConfig {
    EndpointConfig {
        connection_url: ADDRESS.to_string(),
        pool_min_size: min,
        pool_max_size: max,
        acquire_timeout: "100ms".to_string(),
        ..EndpointConfig::default()
    }
}

fn factory(config: EndpointConfig, store: &Arc<MemoryStore>) -> (Arc<ManagedConnectionFactory>, CaptureBuffer) {
    init_tracing();
    let factory = Arc::new(ManagedConnectionFactory::new(config, store.clone()));
    let buffer = CaptureBuffer::new();
    factory.set_log_writer(LogWriter::new(buffer.clone()));
    (factory, buffer)
}

async fn pool(store: Arc<MemoryStore>, min: i64, max: i64, timeout: Duration) -> Pool {
    let endpoint = config(0, 0).endpoint();
    Pool::setup(
        endpoint,
        store,
        PoolBounds::new(min, max).unwrap(),
        PoolOptions {
            acquire_timeout: timeout,
            profiler: false,
        },
    )
    .await
    .unwrap()
}

// ── Pool scenarios ──────────────────────────────────────────────────

#[tokio::test]
async fn setup_3_20_grows_on_fourth_acquire() {
    init_tracing();
    let store = Arc::new(MemoryStore::with_store(ADDRESS));
    let pool = pool(store.clone(), 3, 20, Duration::from_millis(100)).await;

    let stats = pool.stats().await;
    assert_eq!((stats.idle, stats.active, stats.total), (3, 0, 3));

    for _ in 0..3 {
        pool.acquire().await.unwrap();
    }
    assert_eq!(store.opened(), 3);

    pool.acquire().await.unwrap();
    assert_eq!(store.opened(), 4);
    assert_eq!(pool.stats().await.total, 4);
}

#[tokio::test]
async fn setup_2_2_third_concurrent_acquire_times_out() {
    init_tracing();
    let store = Arc::new(MemoryStore::with_store(ADDRESS));
    let pool = Arc::new(pool(store, 2, 2, Duration::from_millis(100)).await);

    let mut tasks = Vec::new();
    for _ in 0..3 {
        let pool = Arc::clone(&pool);
        tasks.push(tokio::spawn(async move { pool.acquire().await }));
    }

    let mut ok = 0;
    let mut exhausted = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => ok += 1,
            Err(PoolError::PoolExhausted { max: 2, .. }) => exhausted += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!((ok, exhausted), (2, 1));
    assert!(pool.stats().await.total <= 2);
}

#[tokio::test]
async fn acquire_release_sequence_restores_idle() {
    let store = Arc::new(MemoryStore::with_store(ADDRESS));
    let pool = pool(store, 2, 6, Duration::from_millis(100)).await;
    let before = pool.stats().await.idle;

    let mut leases = Vec::new();
    for _ in 0..5 {
        leases.push(pool.acquire().await.unwrap());
    }
    for lease in leases {
        pool.release(lease).await.unwrap();
    }

    // The pool grew to 5 to serve the burst; all of it is idle again.
    let stats = pool.stats().await;
    assert_eq!(stats.active, 0);
    assert_eq!(stats.idle, 5);
    assert!(stats.idle >= before);
}

// ── Factory scenarios ───────────────────────────────────────────────

#[tokio::test]
async fn start_against_missing_store_bootstraps_once() {
    let store = Arc::new(MemoryStore::new());
    let (factory, buffer) = factory(config(3, 20), &store);

    factory.start().await.unwrap();
    assert_eq!(store.created(), 1);
    assert!(buffer.contents().contains("Database pool acquired"));

    let mc = factory
        .create_managed_connection(&RequestInfo::default())
        .await
        .unwrap();
    assert!(mc.probe().await.unwrap());
    assert_eq!(store.created(), 1);
}

#[tokio::test]
async fn stop_twice_is_quiet() {
    let store = Arc::new(MemoryStore::with_store(ADDRESS));
    let (factory, _) = factory(config(3, 20), &store);
    factory.start().await.unwrap();

    factory.stop().await.unwrap();
    assert!(factory.stop().await.is_ok());
    assert_eq!(store.open_sessions(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_create_destroy_balances_counter() {
    let store = Arc::new(MemoryStore::with_store(ADDRESS));
    let (factory, buffer) = factory(
        EndpointConfig {
            acquire_timeout: "5s".to_string(),
            ..config(1, 4)
        },
        &store,
    );
    factory.start().await.unwrap();

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let factory = Arc::clone(&factory);
        tasks.push(tokio::spawn(async move {
            for _ in 0..10 {
                let mc = factory
                    .create_managed_connection(&RequestInfo::default())
                    .await
                    .unwrap();
                tokio::task::yield_now().await;
                factory.destroy_managed_connection(&mc).await;
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(factory.live_connections(), 0);
    let stats = factory.pool_stats().await.unwrap();
    assert!(stats.total <= 4);
    assert_eq!(stats.active, 0);
    assert!(buffer.contents().contains("Shutdown database!"));
}

#[tokio::test]
async fn refuse_policy_blocks_stop_until_drained() {
    let store = Arc::new(MemoryStore::with_store(ADDRESS));
    let (factory, _) = factory(
        EndpointConfig {
            stop_policy: StopPolicy::Refuse,
            ..config(1, 3)
        },
        &store,
    );
    factory.start().await.unwrap();
    let manager = LocalConnectionManager::new(Arc::clone(&factory));
    let cf = manager.connection_factory().unwrap();

    let handle = cf.get_connection().await.unwrap();
    assert!(matches!(factory.stop().await, Err(PoolError::StopRefused { .. })));

    handle.close();
    manager.shutdown().await;
    assert_eq!(factory.live_connections(), 0);
    assert_eq!(factory.stop().await.unwrap(), 0);
    assert_eq!(store.open_sessions(), 0);
}

// ── Container scenarios ─────────────────────────────────────────────

#[tokio::test]
async fn handles_share_pooled_connections() {
    let store = Arc::new(MemoryStore::with_store(ADDRESS));
    let (factory, _) = factory(config(1, 2), &store);
    factory.start().await.unwrap();
    let manager = LocalConnectionManager::new(Arc::clone(&factory));
    let cf = manager.connection_factory().unwrap();

    for _ in 0..20 {
        let handle = cf.get_connection().await.unwrap();
        assert!(handle.with_connection(|c| c.is_alive()).await.unwrap());
    }

    // Every request reused the same managed and physical connection.
    assert_eq!(factory.live_connections(), 1);
    assert_eq!(store.opened(), 1);
}

#[tokio::test]
async fn store_outage_is_transparent_after_reconnect() {
    let store = Arc::new(MemoryStore::with_store(ADDRESS));
    let (factory, _) = factory(config(1, 2), &store);
    factory.start().await.unwrap();
    let manager = LocalConnectionManager::new(Arc::clone(&factory));
    let cf = manager.connection_factory().unwrap();

    let handle = cf.get_connection().await.unwrap();
    store.kill_sessions();
    assert!(!handle.managed().unwrap().probe().await.unwrap());

    manager.reconnect(&handle).await.unwrap();
    assert!(handle.with_connection(|c| c.is_alive()).await.unwrap());
    assert_eq!(factory.live_connections(), 1);
}

#[test]
fn memory_store_is_a_store_client() {
    fn assert_client<C: StoreClient>() {}
    assert_client::<MemoryStore>();
}
