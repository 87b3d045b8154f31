//! Connection pool for one server.
//!
//! The pool keeps at least `buffer` connections warm and never holds more
//! than `max`. Each connection is supervised by its own task: it is
//! reconnected with exponential backoff while owned by the pool, and idle
//! connections above the buffer are closed after `timeout_gb`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::{join_all, BoxFuture, FutureExt};
use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument};

use super::health::HealthLatch;
use crate::config::{ConnectionOptions, PoolOptions, PoolOptionsUpdate, ServerAddress};
use crate::cursor::Cursor;
use crate::error::{Error, ErrorKind, Result};
use crate::metrics;
use crate::network::connection::{Connection, ConnectionEvent};
use crate::reql::{RunOptions, Term};
use crate::runner::QueryRunner;

const EVENT_CAPACITY: usize = 256;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Notifications emitted by both pool kinds.
#[derive(Debug, Clone)]
pub enum PoolEvent {
    Draining,
    Queueing,
    /// Number of open connections.
    Size(usize),
    /// Number of open connections without running queries.
    AvailableSize(usize),
    /// Health flipped.
    Healthy { healthy: bool, error: Option<Error> },
    Error(Error),
}

/// Delay before reconnect attempt `attempt`: `base * 2^min(attempt, max_exponent)`.
pub fn backoff_delay(attempt: u32, max_exponent: u32, base: Duration) -> Duration {
    let exponent = attempt.min(max_exponent).min(31);
    base.saturating_mul(1u32 << exponent)
}

struct IdleTimer {
    generation: u64,
    handle: JoinHandle<()>,
}

struct PoolState {
    draining: bool,
    health: HealthLatch,
    buffer: usize,
    max: usize,
    timeout_error: Duration,
    timeout_gb: Duration,
    max_exponent: u32,
    connections: Vec<Connection>,
    idle_timers: HashMap<u64, IdleTimer>,
    watchers: HashMap<u64, JoinHandle<()>>,
    next_generation: u64,
}

impl PoolState {
    fn open_connections(&self) -> impl Iterator<Item = &Connection> {
        self.connections.iter().filter(|c| c.is_open())
    }

    fn idle_count(&self) -> usize {
        self.open_connections().filter(|c| c.num_of_queries() == 0).count()
    }

    fn owns(&self, connection: &Connection) -> bool {
        self.connections.iter().any(|c| c.id() == connection.id())
    }
}

struct PoolInner {
    id: u64,
    server: ServerAddress,
    connection_options: Mutex<ConnectionOptions>,
    state: Mutex<PoolState>,
    events: broadcast::Sender<PoolEvent>,
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for timer in state.idle_timers.drain().map(|(_, timer)| timer) {
            timer.handle.abort();
        }
        for watcher in state.watchers.drain().map(|(_, watcher)| watcher) {
            watcher.abort();
        }
    }
}

/// Pool of connections to one server. Clones share the same pool.
#[derive(Clone)]
pub struct ServerConnectionPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for ServerConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConnectionPool")
            .field("server", &self.inner.server)
            .field("length", &self.get_length())
            .finish()
    }
}

impl ServerConnectionPool {
    pub fn new(server: ServerAddress, connection_options: ConnectionOptions, options: PoolOptions) -> Self {
        let buffer = options.buffer.max(1);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(PoolInner {
                id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
                server,
                connection_options: Mutex::new(connection_options),
                state: Mutex::new(PoolState {
                    draining: false,
                    health: HealthLatch::default(),
                    buffer,
                    max: options.max.max(buffer),
                    timeout_error: options.timeout_error,
                    timeout_gb: options.timeout_gb,
                    max_exponent: options.max_exponent,
                    connections: Vec::new(),
                    idle_timers: HashMap::new(),
                    watchers: HashMap::new(),
                    next_generation: 0,
                }),
                events,
            }),
        }
    }

    fn from_weak(weak: &Weak<PoolInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn server(&self) -> &ServerAddress {
        &self.inner.server
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.inner.events.subscribe()
    }

    fn emit(&self, event: PoolEvent) {
        let _ = self.inner.events.send(event);
    }

    pub fn buffer(&self) -> usize {
        self.inner.state.lock().buffer
    }

    pub fn max(&self) -> usize {
        self.inner.state.lock().max
    }

    pub fn is_draining(&self) -> bool {
        self.inner.state.lock().draining
    }

    /// True when at least one connection is open.
    pub fn is_healthy(&self) -> bool {
        self.inner.state.lock().open_connections().next().is_some()
    }

    pub fn get_connections(&self) -> Vec<Connection> {
        self.inner.state.lock().connections.clone()
    }

    /// Open connections.
    pub fn get_length(&self) -> usize {
        self.inner.state.lock().open_connections().count()
    }

    /// Open connections with no running queries.
    pub fn get_available_length(&self) -> usize {
        self.inner.state.lock().idle_count()
    }

    pub fn get_num_of_running_queries(&self) -> usize {
        self.inner
            .state
            .lock()
            .open_connections()
            .map(Connection::num_of_queries)
            .sum()
    }

    fn set_healthy(&self, healthy: bool, error: Option<Error>) {
        let flipped = self.inner.state.lock().health.set(healthy, error.as_ref());
        if flipped {
            info!(server = %self.inner.server, healthy, "Pool health changed");
            self.emit(PoolEvent::Healthy { healthy, error });
        }
    }

    fn report_size(&self) {
        let size = self.get_length();
        metrics::OPEN_CONNECTIONS
            .with_label_values(&[self.inner.server.to_string().as_str()])
            .set(size as i64);
        self.emit(PoolEvent::Size(size));
    }

    /// Resolve once the pool is healthy; fails with `PoolFail` if it is
    /// reported unhealthy first.
    ///
    /// The subscription is taken when this is called, so no transition
    /// between the call and the first poll is missed.
    pub fn wait_for_healthy(&self) -> impl Future<Output = Result<ServerConnectionPool>> + Send + 'static {
        let mut events = self.subscribe();
        let pool = self.clone();
        async move {
            loop {
                if pool.is_healthy() {
                    return Ok(pool);
                }
                if let Some(error) = pool.unhealthy_error() {
                    return Err(error);
                }
                match events.recv().await {
                    Ok(PoolEvent::Healthy { healthy: true, .. }) => return Ok(pool),
                    Ok(PoolEvent::Healthy { healthy: false, error }) => return Err(pool_init_error(error)),
                    Ok(PoolEvent::Draining) => return Err(pool_init_error(None)),
                    Ok(_) | Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => return Err(pool_init_error(None)),
                }
            }
        }
    }

    fn unhealthy_error(&self) -> Option<Error> {
        let state = self.inner.state.lock();
        match state.health.get() {
            Some(false) => Some(pool_init_error(state.health.last_error().cloned())),
            _ => None,
        }
    }

    /// Create connections until `buffer` of them exist.
    ///
    /// Each new connection is awaited until it is open, so this only returns
    /// once the buffer is filled or the pool starts draining.
    #[instrument(skip(self), fields(server = %self.inner.server))]
    pub async fn init_connections(&self) {
        loop {
            let connection = {
                let mut state = self.inner.state.lock();
                if state.draining || state.connections.len() >= state.buffer {
                    return;
                }
                self.push_connection(&mut state)
            };
            self.persist_connection(connection).await;
        }
    }

    fn push_connection(&self, state: &mut PoolState) -> Connection {
        let options = self.inner.connection_options.lock().clone();
        let connection = Connection::new(self.inner.server.clone(), options);
        state.connections.push(connection.clone());
        connection
    }

    /// Reconnect `connection` until it is open, then supervise it.
    ///
    /// Gives up on the connection when the pool is above its buffer, so
    /// growth attempts against an unreachable server do not pile up.
    fn persist_connection(&self, connection: Connection) -> BoxFuture<'static, ()> {
        let pool = self.clone();
        async move {
            let mut attempt = 0u32;
            loop {
                let (owned, draining) = {
                    let state = pool.inner.state.lock();
                    (state.owns(&connection), state.draining)
                };
                if !owned || draining || connection.is_open() {
                    break;
                }
                let error = match connection.reconnect(false).await {
                    Ok(()) => continue,
                    Err(error) => error,
                };
                pool.report_error(&error, false);

                let (above_buffer, first_report, delay) = {
                    let mut state = pool.inner.state.lock();
                    // Detach under the same lock so concurrent failures
                    // cannot evict below the buffer.
                    let above_buffer = state.connections.len() > state.buffer;
                    if above_buffer {
                        state.connections.retain(|c| c.id() != connection.id());
                    }
                    (
                        above_buffer,
                        state.health.get().is_none(),
                        backoff_delay(attempt, state.max_exponent, state.timeout_error),
                    )
                };
                if above_buffer {
                    pool.close_connection(&connection).await;
                    return;
                }
                if first_report {
                    pool.set_healthy(false, Some(error));
                }
                debug!(server = %pool.inner.server, ?delay, attempt, "Retrying connection");
                tokio::time::sleep(delay).await;
                attempt = (attempt + 1).min(pool.inner.state.lock().max_exponent);
            }

            let keep = {
                let state = pool.inner.state.lock();
                state.owns(&connection) && !state.draining
            };
            if !keep {
                pool.close_connection(&connection).await;
                return;
            }
            pool.subscribe_to_connection(connection);
        }
        .boxed()
    }

    fn subscribe_to_connection(&self, connection: Connection) {
        // Subscribe before checking, so a close racing with this is seen.
        let mut events = connection.subscribe();
        if self.is_draining() {
            return;
        }
        if !connection.is_open() {
            tokio::spawn(self.persist_connection(connection));
            return;
        }

        self.report_size();
        self.set_healthy(true, None);
        self.check_idle(&connection);

        let weak = Arc::downgrade(&self.inner);
        let id = connection.id();
        let watcher = tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => return,
                };
                let Some(pool) = ServerConnectionPool::from_weak(&weak) else {
                    return;
                };
                match event {
                    ConnectionEvent::Query(_) | ConnectionEvent::Release => pool.check_idle(&connection),
                    ConnectionEvent::Close(error) => {
                        pool.report_size();
                        if pool.get_length() == 0 {
                            pool.set_healthy(false, error);
                        }
                        pool.inner.state.lock().watchers.remove(&connection.id());
                        tokio::spawn(pool.persist_connection(connection));
                        return;
                    }
                    _ => {}
                }
            }
        });
        if let Some(previous) = self.inner.state.lock().watchers.insert(id, watcher) {
            previous.abort();
        }
    }

    /// Arm the idle timer for `connection` if it has no running queries.
    fn check_idle(&self, connection: &Connection) {
        let mut state = self.inner.state.lock();
        if let Some(timer) = state.idle_timers.remove(&connection.id()) {
            timer.handle.abort();
        }
        if connection.num_of_queries() != 0 || !state.owns(connection) {
            return;
        }

        state.next_generation += 1;
        let generation = state.next_generation;
        let timeout_gb = state.timeout_gb;
        let id = connection.id();
        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout_gb).await;
            if let Some(pool) = ServerConnectionPool::from_weak(&weak) {
                pool.expire_idle(id, generation).await;
            }
        });
        state.idle_timers.insert(id, IdleTimer { generation, handle });
        let available = state.idle_count();
        drop(state);
        self.emit(PoolEvent::AvailableSize(available));
    }

    async fn expire_idle(&self, id: u64, generation: u64) {
        let connection = {
            let mut state = self.inner.state.lock();
            match state.idle_timers.get(&id) {
                Some(timer) if timer.generation == generation => {
                    state.idle_timers.remove(&id);
                }
                _ => return,
            }
            if state.connections.len() <= state.buffer {
                return;
            }
            state.connections.iter().find(|c| c.id() == id).cloned()
        };
        if let Some(connection) = connection {
            debug!(server = %self.inner.server, id, "Closing idle connection");
            self.close_connection(&connection).await;
            self.emit(PoolEvent::AvailableSize(self.get_available_length()));
        }
    }

    async fn close_connection(&self, connection: &Connection) {
        {
            let mut state = self.inner.state.lock();
            if let Some(timer) = state.idle_timers.remove(&connection.id()) {
                timer.handle.abort();
            }
            if let Some(watcher) = state.watchers.remove(&connection.id()) {
                watcher.abort();
            }
            state.connections.retain(|c| c.id() != connection.id());
        }
        if let Err(error) = connection.close(false).await {
            debug!(server = %self.inner.server, error = %error, "Error while closing connection");
        }
        self.report_size();
    }

    /// Send a query on the least busy open connection.
    ///
    /// Grows the pool by one connection when below `max`.
    pub async fn queue(&self, term: Term, options: RunOptions) -> Result<Option<Cursor>> {
        self.emit(PoolEvent::Queueing);
        let (connection, grown) = {
            let mut state = self.inner.state.lock();
            let mut least: Option<(&Connection, usize)> = None;
            for candidate in state.open_connections() {
                let running = candidate.num_of_queries();
                if least.map_or(true, |(_, fewest)| running < fewest) {
                    least = Some((candidate, running));
                }
            }
            let connection = least.map(|(c, _)| c.clone());
            let grown = match &connection {
                Some(_) if state.connections.len() < state.max && !state.draining => {
                    Some(self.push_connection(&mut state))
                }
                _ => None,
            };
            (connection, grown)
        };

        let Some(connection) = connection else {
            let error = Error::new(ErrorKind::PoolFail, "No connections available");
            self.report_error(&error, true);
            return Err(error);
        };
        if let Some(grown) = grown {
            tokio::spawn(self.persist_connection(grown));
        }
        connection.query(term, options).await
    }

    /// Apply new tunables.
    ///
    /// A larger buffer creates connections; a smaller max closes idle
    /// connections down to it.
    pub async fn set_options(&self, update: PoolOptionsUpdate) {
        if let Some(silent) = update.silent {
            self.inner.connection_options.lock().silent = silent;
            for connection in self.get_connections() {
                connection.set_silent(silent);
            }
        }
        let grow = {
            let mut state = self.inner.state.lock();
            if let Some(timeout_error) = update.timeout_error {
                state.timeout_error = timeout_error;
            }
            if let Some(timeout_gb) = update.timeout_gb {
                state.timeout_gb = timeout_gb;
            }
            if let Some(max_exponent) = update.max_exponent {
                state.max_exponent = max_exponent;
            }
            match update.buffer {
                Some(buffer) => {
                    let buffer = buffer.max(1);
                    let grow = buffer > state.buffer && state.connections.len() < buffer;
                    state.buffer = buffer;
                    grow
                }
                None => false,
            }
        };

        if grow {
            self.init_connections().await;
        } else {
            for connection in self.get_connections() {
                if connection.is_open() {
                    self.check_idle(&connection);
                }
            }
        }

        if let Some(max) = update.max {
            let (excess, idle) = {
                let state = self.inner.state.lock();
                let idle: Vec<Connection> = state
                    .open_connections()
                    .filter(|c| c.num_of_queries() == 0)
                    .cloned()
                    .collect();
                (state.connections.len().saturating_sub(max.max(state.buffer)), idle)
            };
            for connection in idle.iter().rev().take(excess) {
                self.close_connection(connection).await;
            }
            let mut state = self.inner.state.lock();
            state.max = max.max(state.buffer);
        }
    }

    /// Close every connection and stop supervising.
    pub async fn drain(&self) {
        self.emit(PoolEvent::Draining);
        let connections = {
            let mut state = self.inner.state.lock();
            state.draining = true;
            state.health.reset();
            state.connections.clone()
        };
        join_all(connections.iter().map(|c| self.close_connection(c))).await;
        info!(server = %self.inner.server, "Pool drained");
    }

    fn report_error(&self, err: &Error, log: bool) {
        self.emit(PoolEvent::Error(err.clone()));
        if !log || err.kind() == ErrorKind::Cancel {
            return;
        }
        let options = self.inner.connection_options.lock().clone();
        if let Some(hook) = &options.log {
            hook.call(&err.to_string());
        }
        if options.silent {
            debug!(server = %self.inner.server, error = %err, "Pool error");
        } else {
            error!(server = %self.inner.server, error = %err, "Pool error");
        }
    }
}

fn pool_init_error(cause: Option<Error>) -> Error {
    let error = Error::new(ErrorKind::PoolFail, "Error initializing pool");
    match cause {
        Some(cause) => error.with_cause(cause),
        None => error,
    }
}

#[async_trait]
impl QueryRunner for ServerConnectionPool {
    async fn queue(&self, term: Term, options: RunOptions) -> Result<Option<Cursor>> {
        ServerConnectionPool::queue(self, term, options).await
    }
}
