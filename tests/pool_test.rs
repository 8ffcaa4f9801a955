//! Connection pool behavior against an in-memory adapter.
//!
//! The mock adapter counts opened/closed handles and lets a test hold a
//! statement open, so capacity and shutdown can be observed without a server.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use multidb_mcp_server::db::normalize::RawResultSet;
use multidb_mcp_server::db::{
    Backend, BackendPool, BackendRegistry, DialectAdapter, Operation, PlaceholderStyle,
    QueryExecutor,
};
use multidb_mcp_server::error::{DbError, DbResult, ErrorKind};
use multidb_mcp_server::models::{
    BackendType, ColumnInfo, ConnectionDescriptor, ConnectionTarget, QueryParam, QueryRequest,
    ScalarValue, TableSchema,
};
use tokio::sync::Semaphore;

#[derive(Default)]
struct Counters {
    opened: AtomicUsize,
    closed: AtomicUsize,
    executing: AtomicUsize,
    peak: AtomicUsize,
    fail_ping: AtomicBool,
    hang_ping: AtomicBool,
}

struct MockConn {
    id: usize,
}

#[derive(Clone)]
struct MockAdapter {
    counters: Arc<Counters>,
    /// Each held statement consumes one permit before returning.
    gate: Arc<Semaphore>,
}

impl MockAdapter {
    fn new() -> Self {
        Self {
            counters: Arc::new(Counters::default()),
            gate: Arc::new(Semaphore::new(0)),
        }
    }
}

#[async_trait]
impl DialectAdapter for MockAdapter {
    type Connection = MockConn;

    fn backend_type(&self) -> BackendType {
        BackendType::Postgres
    }

    fn placeholder_style(&self) -> PlaceholderStyle {
        PlaceholderStyle::DollarNumbered
    }

    async fn open(&self, _descriptor: &ConnectionDescriptor) -> DbResult<MockConn> {
        let id = self.counters.opened.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(MockConn { id })
    }

    async fn ping(&self, _conn: &mut MockConn) -> bool {
        if self.counters.hang_ping.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        !self.counters.fail_ping.load(Ordering::SeqCst)
    }

    async fn server_version(&self, conn: &mut MockConn) -> DbResult<String> {
        Ok(format!("mock-{}", conn.id))
    }

    async fn list_schemas(&self, _conn: &mut MockConn) -> DbResult<Vec<String>> {
        Ok(vec!["public".into()])
    }

    async fn list_tables(
        &self,
        _conn: &mut MockConn,
        _schema: Option<&str>,
    ) -> DbResult<Vec<String>> {
        Ok(vec![])
    }

    async fn describe_table(
        &self,
        _conn: &mut MockConn,
        table: &str,
        _schema: Option<&str>,
    ) -> DbResult<TableSchema> {
        Err(DbError::table_not_found(table))
    }

    async fn execute(
        &self,
        conn: &mut MockConn,
        sql: &str,
        _params: &[QueryParam],
        fetch_limit: usize,
    ) -> DbResult<RawResultSet> {
        let now = self.counters.executing.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak.fetch_max(now, Ordering::SeqCst);

        if sql.contains("pg_sleep") {
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
        }
        self.counters.executing.fetch_sub(1, Ordering::SeqCst);

        if sql.contains("broken") {
            return Err(DbError::connection("server closed the connection", "retry"));
        }

        let rows = (0..fetch_limit.min(5) as i64)
            .map(|i| vec![ScalarValue::Int(i), ScalarValue::Int(conn.id as i64)])
            .collect();
        Ok(RawResultSet::new(
            vec![ColumnInfo::new("n", "INT8"), ColumnInfo::new("conn", "INT8")],
            rows,
        ))
    }

    fn sample_query(&self, table: &str, _schema: Option<&str>, limit: u32) -> DbResult<String> {
        Ok(format!("SELECT * FROM {table} LIMIT {limit}"))
    }

    async fn close(&self, _conn: MockConn) {
        self.counters.closed.fetch_add(1, Ordering::SeqCst);
    }
}

fn pool(pool_size: u32, timeout: Duration) -> (BackendPool<MockAdapter>, MockAdapter) {
    let adapter = MockAdapter::new();
    let descriptor = ConnectionDescriptor::new(
        "mock",
        BackendType::Postgres,
        ConnectionTarget::Network {
            host: "localhost".into(),
            port: None,
            database: "app".into(),
        },
    )
    .with_pool_size(pool_size)
    .with_acquire_timeout(timeout);
    (BackendPool::new(adapter.clone(), Arc::new(descriptor)), adapter)
}

fn select(sql: &str) -> Operation {
    Operation::Execute {
        sql: sql.into(),
        params: vec![],
        fetch_limit: 3,
    }
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn test_connections_opened_lazily_and_reused() {
    let (pool, adapter) = pool(3, Duration::from_secs(1));
    assert_eq!(pool.status().live, 0);

    for _ in 0..5 {
        pool.run(select("SELECT 1")).await.unwrap();
    }
    assert_eq!(adapter.counters.opened.load(Ordering::SeqCst), 1);

    let status = pool.status();
    assert_eq!(status.live, 1);
    assert_eq!(status.idle, 1);
    assert_eq!(status.in_flight, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrency_never_exceeds_capacity() {
    let (pool, adapter) = pool(2, Duration::from_secs(5));

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let pool = pool.clone();
        tasks.push(tokio::spawn(async move { pool.run(select("SELECT pg_sleep(1)")).await }));
    }

    wait_until(|| adapter.counters.executing.load(Ordering::SeqCst) == 2).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(adapter.counters.executing.load(Ordering::SeqCst), 2);
    assert_eq!(pool.status().in_flight, 2);

    adapter.gate.add_permits(8);
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(adapter.counters.peak.load(Ordering::SeqCst), 2);
    assert!(adapter.counters.opened.load(Ordering::SeqCst) <= 2);
    assert!(pool.status().live <= 2);
}

#[tokio::test]
async fn test_exhausted_pool_times_out() {
    let (pool, adapter) = pool(1, Duration::from_millis(100));

    let holder = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.run(select("SELECT pg_sleep(10)")).await })
    };
    wait_until(|| adapter.counters.executing.load(Ordering::SeqCst) == 1).await;

    let err = pool.run(select("SELECT 1")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PoolExhausted);
    assert!(err.is_retryable());

    adapter.gate.add_permits(1);
    holder.await.unwrap().unwrap();

    // Capacity is back once the holder finishes.
    pool.run(select("SELECT 1")).await.unwrap();
}

#[tokio::test]
async fn test_broken_connection_is_discarded() {
    let (pool, adapter) = pool(2, Duration::from_secs(1));

    let err = pool.run(select("SELECT broken")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionError);
    assert_eq!(adapter.counters.closed.load(Ordering::SeqCst), 1);
    assert_eq!(pool.status().live, 0);

    let version = pool
        .run(Operation::ServerVersion)
        .await
        .unwrap()
        .into_version()
        .unwrap();
    assert_eq!(version, "mock-2");
}

#[tokio::test]
async fn test_stale_idle_connection_replaced() {
    let (pool, adapter) = pool(2, Duration::from_secs(1));
    pool.run(select("SELECT 1")).await.unwrap();
    assert_eq!(pool.status().idle, 1);

    // The idle handle fails its health check; so would the replacement.
    adapter.counters.fail_ping.store(true, Ordering::SeqCst);
    let err = pool.run(select("SELECT 1")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionError);
    assert_eq!(adapter.counters.closed.load(Ordering::SeqCst), 2);

    adapter.counters.fail_ping.store(false, Ordering::SeqCst);
    pool.run(select("SELECT 1")).await.unwrap();
    assert_eq!(pool.status().live, 1);
}

#[tokio::test]
async fn test_cancelled_caller_still_releases_handle() {
    let (pool, adapter) = pool(1, Duration::from_secs(1));

    let waiting = tokio::time::timeout(
        Duration::from_millis(50),
        pool.run(select("SELECT pg_sleep(10)")),
    )
    .await;
    assert!(waiting.is_err());

    adapter.gate.add_permits(1);
    wait_until(|| pool.status().in_flight == 0).await;
    assert_eq!(pool.status().idle, 1);
    pool.run(select("SELECT 1")).await.unwrap();
}

#[tokio::test]
async fn test_acquire_cancelled_during_health_check_keeps_counts() {
    let (pool, adapter) = pool(1, Duration::from_secs(1));
    pool.run(select("SELECT 1")).await.unwrap();
    assert_eq!(pool.status().live, 1);

    adapter.counters.hang_ping.store(true, Ordering::SeqCst);
    let waiting = tokio::time::timeout(Duration::from_millis(50), pool.acquire()).await;
    assert!(waiting.is_err());

    let status = pool.status();
    assert_eq!(status.live, 0);
    assert_eq!(status.idle, 0);
    assert_eq!(status.in_flight, 0);

    adapter.counters.hang_ping.store(false, Ordering::SeqCst);
    pool.run(select("SELECT 1")).await.unwrap();
    assert_eq!(pool.status().live, 1);
    assert_eq!(adapter.counters.opened.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_shutdown_waits_for_in_flight_work() {
    let (pool, adapter) = pool(2, Duration::from_secs(5));
    let running = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.run(select("SELECT pg_sleep(1)")).await })
    };
    wait_until(|| adapter.counters.executing.load(Ordering::SeqCst) == 1).await;

    let shutdown = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.shutdown().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!shutdown.is_finished());

    adapter.gate.add_permits(1);
    running.await.unwrap().unwrap();
    shutdown.await.unwrap();

    let status = pool.status();
    assert!(status.closed);
    assert_eq!(status.live, 0);
    assert_eq!(adapter.counters.closed.load(Ordering::SeqCst), 1);

    let err = pool.run(select("SELECT 1")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionError);

    // Second shutdown is a no-op.
    pool.shutdown().await;
}

#[tokio::test]
async fn test_executor_over_mock_backend() {
    let (pool, _adapter) = pool(2, Duration::from_secs(1));
    let mut registry = BackendRegistry::new();
    registry.register_backend(Arc::new(pool)).unwrap();
    let backend = registry.get("mock").unwrap();

    let result = QueryExecutor::default()
        .execute(
            backend.as_ref(),
            &QueryRequest::new("mock", "SELECT n FROM numbers").with_limit(2),
        )
        .await
        .unwrap();
    assert_eq!(result.row_count, 2);
    assert!(result.truncated);
    assert_eq!(backend.status().live, 1);

    let summary = backend.summary();
    assert_eq!(summary.pool.capacity, 2);
    assert_eq!(summary.target, "localhost:5432/app");
}
