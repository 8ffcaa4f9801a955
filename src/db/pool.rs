//! Bounded connection pool over a [`DialectAdapter`].
//!
//! One pool per configured backend. A semaphore with `capacity` permits bounds
//! the number of borrowed handles; idle handles sit in a FIFO queue and are
//! health-checked before they are lent again. A borrowed handle goes back to
//! the idle queue before its permit is released, so `live` never exceeds
//! `capacity`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::db::adapter::{DialectAdapter, Operation, OperationOutput, perform};
use crate::error::{DbError, DbResult};
use crate::models::{ConnectionDescriptor, PoolStatus};

/// Lifecycle of a pooled handle.
///
/// `Connecting -> Ready <-> Busy`. A handle that fails its health check or
/// hits a driver-fatal error becomes `Disconnected` and is dropped; shutdown
/// moves idle handles to `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Ready,
    Busy,
    Closed,
}

struct Handle<C> {
    id: u64,
    conn: C,
    state: ConnectionState,
    created_at: Instant,
}

struct PoolInner<A: DialectAdapter> {
    adapter: A,
    descriptor: Arc<ConnectionDescriptor>,
    capacity: u32,
    permits: Arc<Semaphore>,
    idle: Mutex<VecDeque<Handle<A::Connection>>>,
    live: AtomicUsize,
    in_flight: AtomicUsize,
    closed: AtomicBool,
    next_id: AtomicU64,
}

impl<A: DialectAdapter> PoolInner<A> {
    fn idle(&self) -> MutexGuard<'_, VecDeque<Handle<A::Connection>>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn name(&self) -> &str {
        &self.descriptor.name
    }
}

/// Connection pool for one backend. Cheap to clone.
pub struct BackendPool<A: DialectAdapter> {
    inner: Arc<PoolInner<A>>,
}

impl<A: DialectAdapter> Clone for BackendPool<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A: DialectAdapter> BackendPool<A> {
    /// Create an empty pool. Connections are opened on first use.
    pub fn new(adapter: A, descriptor: Arc<ConnectionDescriptor>) -> Self {
        let capacity = descriptor.effective_pool_size();
        Self {
            inner: Arc::new(PoolInner {
                adapter,
                capacity,
                permits: Arc::new(Semaphore::new(capacity as usize)),
                idle: Mutex::new(VecDeque::with_capacity(capacity as usize)),
                live: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
                descriptor,
            }),
        }
    }

    pub fn adapter(&self) -> &A {
        &self.inner.adapter
    }

    pub fn descriptor(&self) -> &ConnectionDescriptor {
        &self.inner.descriptor
    }

    /// Borrow a handle, waiting at most the descriptor's acquire timeout.
    pub async fn acquire(&self) -> DbResult<PooledConnection<A>> {
        self.acquire_with_timeout(self.inner.descriptor.acquire_timeout)
            .await
    }

    pub async fn acquire_with_timeout(&self, wait: Duration) -> DbResult<PooledConnection<A>> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(shut_down(inner.name()));
        }

        let permit = match timeout(wait, Arc::clone(&inner.permits).acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(shut_down(inner.name())),
            Err(_) => {
                warn!(
                    backend = %inner.name(),
                    capacity = inner.capacity,
                    waited_ms = wait.as_millis() as u64,
                    "Connection pool exhausted"
                );
                return Err(DbError::pool_exhausted(inner.name(), wait));
            }
        };

        // Shutdown may have started while we were queued.
        if inner.closed.load(Ordering::Acquire) {
            return Err(shut_down(inner.name()));
        }

        let mut handle = loop {
            let idle = inner.idle().pop_front();
            match idle {
                Some(handle) => {
                    let mut checkout = Checkout {
                        inner: inner.as_ref(),
                        handle: Some(handle),
                    };
                    let healthy = checkout.ping().await;
                    match checkout.into_handle() {
                        Some(handle) if healthy => break handle,
                        Some(handle) => {
                            debug!(backend = %inner.name(), id = handle.id, "Discarding stale idle connection");
                            self.close_handle(handle, ConnectionState::Disconnected).await;
                        }
                        None => {}
                    }
                }
                None => break self.open_handle().await?,
            }
        };

        handle.state = ConnectionState::Busy;
        inner.in_flight.fetch_add(1, Ordering::AcqRel);
        Ok(PooledConnection {
            pool: self.clone(),
            handle: Some(handle),
            permit: Some(permit),
            broken: false,
        })
    }

    async fn open_handle(&self) -> DbResult<Handle<A::Connection>> {
        let inner = &self.inner;
        let started = Instant::now();
        debug!(backend = %inner.name(), state = ?ConnectionState::Connecting, "Opening connection");
        let mut conn = inner
            .adapter
            .open(&inner.descriptor)
            .await
            .map_err(|e| e.with_backend(inner.name()))?;

        if !inner.adapter.ping(&mut conn).await {
            inner.adapter.close(conn).await;
            return Err(DbError::connection(
                "New connection failed its health check",
                "Check database server status",
            )
            .with_backend(inner.name()));
        }

        let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
        let live = inner.live.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(
            backend = %inner.name(),
            id,
            live,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Opened connection"
        );
        Ok(Handle {
            id,
            conn,
            state: ConnectionState::Ready,
            created_at: Instant::now(),
        })
    }

    async fn close_handle(&self, mut handle: Handle<A::Connection>, state: ConnectionState) {
        handle.state = state;
        self.inner.live.fetch_sub(1, Ordering::AcqRel);
        debug!(
            backend = %self.inner.name(),
            id = handle.id,
            state = ?handle.state,
            age_ms = handle.created_at.elapsed().as_millis() as u64,
            "Closing connection"
        );
        self.inner.adapter.close(handle.conn).await;
    }

    /// Put a borrowed handle back. Runs before the permit is released.
    fn return_handle(&self, mut handle: Handle<A::Connection>) {
        self.inner.in_flight.fetch_sub(1, Ordering::AcqRel);
        if self.inner.closed.load(Ordering::Acquire) {
            // Shutdown closes what is idle; this one is dropped here.
            self.inner.live.fetch_sub(1, Ordering::AcqRel);
            return;
        }
        handle.state = ConnectionState::Ready;
        self.inner.idle().push_back(handle);
    }

    /// Acquire a handle, run `operation` on it and release it.
    ///
    /// Acquisition and the work run on their own task, so a caller that stops
    /// waiting still leaves the handle to be released when the operation finishes.
    pub async fn run(&self, operation: Operation) -> DbResult<OperationOutput> {
        let name = operation.name();
        let pool = self.clone();
        let started = Instant::now();

        let task = tokio::spawn(async move {
            let mut conn = pool.acquire().await?;
            let result = match conn.connection_mut() {
                Ok(c) => perform(&pool.inner.adapter, c, operation).await,
                Err(e) => Err(e),
            };
            if let Err(e) = &result {
                if e.is_connection_fatal() {
                    conn.mark_broken();
                }
            }
            conn.release().await;
            result
        });

        let result = task
            .await
            .map_err(|e| DbError::internal(format!("{name} task failed: {e}")))?
            .map_err(|e| e.with_backend(self.inner.name()));

        debug!(
            backend = %self.inner.name(),
            operation = name,
            ok = result.is_ok(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Operation finished"
        );
        result
    }

    pub fn status(&self) -> PoolStatus {
        let inner = &self.inner;
        PoolStatus {
            capacity: inner.capacity,
            live: inner.live.load(Ordering::Acquire),
            idle: inner.idle().len(),
            in_flight: inner.in_flight.load(Ordering::Acquire),
            closed: inner.closed.load(Ordering::Acquire),
        }
    }

    /// Stop lending handles, wait for borrowed ones to come back, close all.
    ///
    /// Waits at most the acquire timeout for in-flight work. Idempotent.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(backend = %inner.name(), "Shutting down connection pool");

        let wait = inner.descriptor.acquire_timeout;
        let drained = match timeout(wait, inner.permits.acquire_many(inner.capacity)).await {
            Ok(Ok(permits)) => Some(permits),
            Ok(Err(_)) => None,
            Err(_) => {
                warn!(
                    backend = %inner.name(),
                    in_flight = inner.in_flight.load(Ordering::Acquire),
                    "Timed out waiting for in-flight operations"
                );
                None
            }
        };

        let idle: Vec<_> = inner.idle().drain(..).collect();
        for handle in idle {
            self.close_handle(handle, ConnectionState::Closed).await;
        }
        drop(drained);
        inner.permits.close();
    }
}

/// An idle handle taken out for its health check.
///
/// If the acquiring future is dropped mid-check, the handle is dropped with
/// the guard and no longer counted as live.
struct Checkout<'a, A: DialectAdapter> {
    inner: &'a PoolInner<A>,
    handle: Option<Handle<A::Connection>>,
}

impl<A: DialectAdapter> Checkout<'_, A> {
    async fn ping(&mut self) -> bool {
        match self.handle.as_mut() {
            Some(handle) => self.inner.adapter.ping(&mut handle.conn).await,
            None => false,
        }
    }

    fn into_handle(mut self) -> Option<Handle<A::Connection>> {
        self.handle.take()
    }
}

impl<A: DialectAdapter> Drop for Checkout<'_, A> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.inner.live.fetch_sub(1, Ordering::AcqRel);
            debug!(backend = %self.inner.name(), id = handle.id, "Acquire cancelled during health check; dropping connection");
        }
    }
}

fn shut_down(backend: &str) -> DbError {
    DbError::connection("Connection pool is shut down", "The server is stopping")
        .with_backend(backend)
}

/// A handle borrowed from a [`BackendPool`].
///
/// Dropping it returns the handle to the pool. Use [`release`](Self::release)
/// to close a broken handle cleanly.
pub struct PooledConnection<A: DialectAdapter> {
    pool: BackendPool<A>,
    handle: Option<Handle<A::Connection>>,
    permit: Option<OwnedSemaphorePermit>,
    broken: bool,
}

impl<A: DialectAdapter> PooledConnection<A> {
    pub fn connection_mut(&mut self) -> DbResult<&mut A::Connection> {
        self.handle
            .as_mut()
            .map(|h| &mut h.conn)
            .ok_or_else(|| DbError::internal("connection already released"))
    }

    pub fn id(&self) -> Option<u64> {
        self.handle.as_ref().map(|h| h.id)
    }

    pub fn state(&self) -> Option<ConnectionState> {
        self.handle.as_ref().map(|h| h.state)
    }

    /// Discard the handle on release instead of reusing it.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    pub async fn release(mut self) {
        if let Some(handle) = self.handle.take() {
            let closing = self.pool.inner.closed.load(Ordering::Acquire);
            if self.broken || closing {
                let state = if self.broken {
                    ConnectionState::Disconnected
                } else {
                    ConnectionState::Closed
                };
                self.pool.inner.in_flight.fetch_sub(1, Ordering::AcqRel);
                self.pool.close_handle(handle, state).await;
            } else {
                self.pool.return_handle(handle);
            }
        }
        // Drop releases the permit.
    }
}

impl<A: DialectAdapter> Drop for PooledConnection<A> {
    fn drop(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            if self.broken {
                handle.state = ConnectionState::Disconnected;
                self.pool.inner.in_flight.fetch_sub(1, Ordering::AcqRel);
                self.pool.inner.live.fetch_sub(1, Ordering::AcqRel);
                debug!(backend = %self.pool.inner.name(), id = handle.id, "Dropping broken connection");
            } else {
                self.pool.return_handle(handle);
            }
        }
        drop(self.permit.take());
    }
}
