//! Pool of server pools.
//!
//! A [`MasterConnectionPool`] owns one [`ServerConnectionPool`] per server.
//! Sub-pools start with a single connection each; the master's `buffer` and
//! `max` are then spread across the healthy sub-pools. When a sub-pool turns
//! unhealthy it is dropped and recreated after `timeout_error`.
//!
//! With discovery enabled, a changefeed on `rethinkdb.server_status` adds and
//! removes servers as the cluster changes.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::discovery::{self, DiscoveryChange, DiscoveryTracker, DISCOVERY_RETRY_DELAY_SECS};
use super::health::HealthLatch;
use super::server_pool::{PoolEvent, ServerConnectionPool};
use crate::config::{ConnectionOptions, PoolOptions, PoolOptionsUpdate, ServerAddress};
use crate::cursor::Cursor;
use crate::error::{Error, ErrorKind, Result};
use crate::network::connection::Connection;
use crate::reql::{RunOptions, Term};
use crate::runner::{QueryRunner, RunResult};

const EVENT_CAPACITY: usize = 256;

/// Share of `total` for the healthy pool at `index` out of `healthy`.
///
/// The remainder goes one each to the first pools.
pub fn distribute(total: usize, healthy: usize, index: usize) -> usize {
    if healthy == 0 {
        return 0;
    }
    total / healthy + usize::from(index < total % healthy)
}

struct MasterState {
    draining: bool,
    discovery: bool,
    health: HealthLatch,
    options: PoolOptions,
    servers: Vec<ServerAddress>,
    pools: Vec<ServerConnectionPool>,
    watchers: HashMap<u64, JoinHandle<()>>,
    discovery_cursor: Option<Cursor>,
    discovery_task: Option<JoinHandle<()>>,
}

struct MasterInner {
    connection_options: ConnectionOptions,
    state: Mutex<MasterState>,
    events: broadcast::Sender<PoolEvent>,
}

impl Drop for MasterInner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for watcher in state.watchers.drain().map(|(_, watcher)| watcher) {
            watcher.abort();
        }
        if let Some(task) = state.discovery_task.take() {
            task.abort();
        }
        if let Some(cursor) = state.discovery_cursor.take() {
            cursor.close();
        }
    }
}

/// Load-balancing pool across servers. Clones share the same pool.
#[derive(Clone)]
pub struct MasterConnectionPool {
    inner: Arc<MasterInner>,
}

impl std::fmt::Debug for MasterConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("MasterConnectionPool")
            .field("servers", &state.servers)
            .field("pools", &state.pools.len())
            .field("draining", &state.draining)
            .finish()
    }
}

impl MasterConnectionPool {
    pub fn new(servers: Vec<ServerAddress>, connection_options: ConnectionOptions, options: PoolOptions) -> Self {
        let buffer = options.buffer.max(1);
        let options = PoolOptions {
            buffer,
            max: options.max.max(buffer),
            ..options
        };
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let mut unique: Vec<ServerAddress> = Vec::with_capacity(servers.len());
        for server in servers {
            if !unique.contains(&server) {
                unique.push(server);
            }
        }
        Self {
            inner: Arc::new(MasterInner {
                connection_options,
                state: Mutex::new(MasterState {
                    draining: false,
                    discovery: options.discovery,
                    health: HealthLatch::default(),
                    options,
                    servers: unique,
                    pools: Vec::new(),
                    watchers: HashMap::new(),
                    discovery_cursor: None,
                    discovery_task: None,
                }),
                events,
            }),
        }
    }

    fn from_weak(weak: &Weak<MasterInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.inner.events.subscribe()
    }

    fn emit(&self, event: PoolEvent) {
        let _ = self.inner.events.send(event);
    }

    pub fn is_draining(&self) -> bool {
        self.inner.state.lock().draining
    }

    pub fn servers(&self) -> Vec<ServerAddress> {
        self.inner.state.lock().servers.clone()
    }

    pub fn options(&self) -> PoolOptions {
        self.inner.state.lock().options.clone()
    }

    pub fn get_pools(&self) -> Vec<ServerConnectionPool> {
        self.inner.state.lock().pools.clone()
    }

    /// True when any sub-pool is healthy.
    pub fn is_healthy(&self) -> bool {
        self.get_pools().iter().any(ServerConnectionPool::is_healthy)
    }

    pub fn get_connections(&self) -> Vec<Connection> {
        self.get_pools()
            .iter()
            .flat_map(ServerConnectionPool::get_connections)
            .collect()
    }

    /// Open connections across all sub-pools.
    pub fn get_length(&self) -> usize {
        self.get_pools().iter().map(ServerConnectionPool::get_length).sum()
    }

    /// Open connections with no running queries.
    pub fn get_available_length(&self) -> usize {
        self.get_pools()
            .iter()
            .map(ServerConnectionPool::get_available_length)
            .sum()
    }

    fn set_healthy(&self, healthy: bool, error: Option<Error>) {
        let flipped = self.inner.state.lock().health.set(healthy, error.as_ref());
        if flipped {
            info!(healthy, "Master pool health changed");
            self.emit(PoolEvent::Healthy { healthy, error });
        }
    }

    /// Resolve once any sub-pool is healthy; fails with `MasterPoolFail`
    /// when the master is reported unhealthy first.
    pub fn wait_for_healthy(&self) -> impl Future<Output = Result<MasterConnectionPool>> + Send + 'static {
        let mut events = self.subscribe();
        let master = self.clone();
        async move {
            loop {
                if master.is_healthy() {
                    return Ok(master);
                }
                if let Some(error) = master.unhealthy_error() {
                    return Err(error);
                }
                match events.recv().await {
                    Ok(PoolEvent::Healthy { healthy: true, .. }) => return Ok(master),
                    Ok(PoolEvent::Healthy { healthy: false, error }) => return Err(master_init_error(error)),
                    Ok(PoolEvent::Draining) => return Err(master_init_error(None)),
                    Ok(_) | Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => return Err(master_init_error(None)),
                }
            }
        }
    }

    fn unhealthy_error(&self) -> Option<Error> {
        let state = self.inner.state.lock();
        match state.health.get() {
            Some(false) => Some(master_init_error(state.health.last_error().cloned())),
            _ => None,
        }
    }

    /// Create a sub-pool per configured server, one at a time, then spread
    /// the configured sizes. Starts discovery when enabled.
    #[instrument(skip(self))]
    pub async fn init_servers(&self) {
        for server in self.servers() {
            let Some(pool) = self.create_server_pool(server.clone()) else {
                return;
            };
            if let Err(error) = pool.wait_for_healthy().await {
                warn!(server = %server, error = %error, "Server pool failed to start");
            }
            if self.is_draining() {
                pool.drain().await;
                return;
            }
        }
        self.set_server_pools_options();

        let discovery = self.inner.state.lock().discovery;
        if discovery {
            self.start_discovery();
        }
    }

    /// Register a sub-pool for `server` and start filling it.
    ///
    /// `None` once draining.
    fn create_server_pool(&self, server: ServerAddress) -> Option<ServerConnectionPool> {
        let pool = {
            let mut state = self.inner.state.lock();
            if state.draining {
                return None;
            }
            let pool = ServerConnectionPool::new(
                server,
                self.inner.connection_options.clone(),
                PoolOptions {
                    buffer: 1,
                    max: 1,
                    ..state.options.clone()
                },
            );
            state.pools.push(pool.clone());
            pool
        };
        self.subscribe_to_pool(&pool);

        let init = pool.clone();
        tokio::spawn(async move { init.init_connections().await });
        Some(pool)
    }

    fn subscribe_to_pool(&self, pool: &ServerConnectionPool) {
        let mut events = pool.subscribe();
        let size = self.get_length();
        self.emit(PoolEvent::Size(size));
        if size > 0 {
            self.set_healthy(true, None);
        }

        let weak = Arc::downgrade(&self.inner);
        let watched = pool.clone();
        let watcher = tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => return,
                };
                let Some(master) = MasterConnectionPool::from_weak(&weak) else {
                    return;
                };
                match event {
                    PoolEvent::Size(_) => master.emit(PoolEvent::Size(master.get_length())),
                    PoolEvent::AvailableSize(_) => {
                        master.emit(PoolEvent::AvailableSize(master.get_available_length()))
                    }
                    PoolEvent::Error(error) => master.emit(PoolEvent::Error(error)),
                    PoolEvent::Healthy { healthy, error } => {
                        if !healthy {
                            let recovering = master.clone();
                            let failed = watched.clone();
                            tokio::spawn(async move { recovering.recover_server_pool(failed).await });
                        }
                        let any_healthy = master.is_healthy();
                        master.set_healthy(any_healthy, error);
                    }
                    PoolEvent::Draining => return,
                    PoolEvent::Queueing => {}
                }
            }
        });
        if let Some(previous) = self.inner.state.lock().watchers.insert(pool.id(), watcher) {
            previous.abort();
        }
    }

    /// Replace an unhealthy sub-pool with a fresh one after `timeout_error`.
    async fn recover_server_pool(&self, pool: ServerConnectionPool) {
        let server = pool.server().clone();
        self.close_server_pool(&pool).await;

        let delay = self.inner.state.lock().options.timeout_error;
        tokio::time::sleep(delay).await;

        let listed = {
            let state = self.inner.state.lock();
            !state.draining && state.servers.contains(&server)
        };
        if !listed {
            return;
        }
        debug!(server = %server, "Recreating server pool");
        if let Some(pool) = self.create_server_pool(server) {
            let master = self.clone();
            tokio::spawn(async move {
                if pool.wait_for_healthy().await.is_ok() {
                    master.set_server_pools_options();
                }
            });
        }
    }

    async fn close_server_pool(&self, pool: &ServerConnectionPool) {
        {
            let mut state = self.inner.state.lock();
            if let Some(watcher) = state.watchers.remove(&pool.id()) {
                watcher.abort();
            }
            state.pools.retain(|p| p.id() != pool.id());
        }
        pool.drain().await;
    }

    /// Spread the master's `buffer` and `max` over the healthy sub-pools.
    ///
    /// Unhealthy sub-pools only receive the tunables.
    fn set_server_pools_options(&self) {
        let (pools, options, draining, silent) = {
            let state = self.inner.state.lock();
            (
                state.pools.clone(),
                state.options.clone(),
                state.draining,
                self.inner.connection_options.silent,
            )
        };
        let healthy: Vec<bool> = pools.iter().map(ServerConnectionPool::is_healthy).collect();
        let healthy_len = healthy.iter().filter(|h| **h).count();

        let mut healthy_index = 0;
        for (pool, is_healthy) in pools.into_iter().zip(healthy) {
            let mut update = PoolOptionsUpdate {
                timeout_error: Some(options.timeout_error),
                timeout_gb: Some(options.timeout_gb),
                max_exponent: Some(options.max_exponent),
                silent: Some(silent),
                ..PoolOptionsUpdate::default()
            };
            if is_healthy {
                update.buffer = Some(distribute(options.buffer, healthy_len, healthy_index));
                update.max = Some(distribute(options.max, healthy_len, healthy_index));
                healthy_index += 1;
            }
            tokio::spawn(async move {
                pool.set_options(update).await;
                if draining {
                    pool.drain().await;
                }
            });
        }
    }

    /// Apply new master options and redistribute them.
    pub fn set_options(&self, update: PoolOptionsUpdate) {
        let discovery_change = {
            let mut state = self.inner.state.lock();
            let options = &mut state.options;
            if let Some(buffer) = update.buffer {
                options.buffer = buffer.max(1);
            }
            if let Some(max) = update.max {
                options.max = max;
            }
            options.max = options.max.max(options.buffer);
            if let Some(timeout_error) = update.timeout_error {
                options.timeout_error = timeout_error;
            }
            if let Some(timeout_gb) = update.timeout_gb {
                options.timeout_gb = timeout_gb;
            }
            if let Some(max_exponent) = update.max_exponent {
                options.max_exponent = max_exponent;
            }
            match update.discovery {
                Some(discovery) if discovery != state.discovery => {
                    state.discovery = discovery;
                    state.options.discovery = discovery;
                    Some(discovery)
                }
                _ => None,
            }
        };

        match discovery_change {
            Some(true) => self.start_discovery(),
            Some(false) => self.stop_discovery(),
            None => {}
        }
        self.set_server_pools_options();
    }

    /// Send a query through the healthy sub-pool with the fewest running
    /// queries.
    pub async fn queue(&self, term: Term, options: RunOptions) -> Result<Option<Cursor>> {
        let mut least: Option<(ServerConnectionPool, usize)> = None;
        for pool in self.get_pools() {
            if !pool.is_healthy() {
                continue;
            }
            let running = pool.get_num_of_running_queries();
            if least.as_ref().map_or(true, |(_, fewest)| running < *fewest) {
                least = Some((pool, running));
            }
        }
        let Some((pool, _)) = least else {
            return Err(Error::new(
                ErrorKind::PoolFail,
                "None of the pools have an opened connection and failed to open a new one.",
            ));
        };
        self.emit(PoolEvent::Queueing);
        pool.queue(term, options).await
    }

    fn ensure_not_draining(&self, term: &Term) -> Result<()> {
        if self.is_draining() {
            return Err(Error::api(
                "`run` was called without a connection and no pool has been created after.",
            )
            .with_query(term.to_json()));
        }
        Ok(())
    }

    /// Stop discovery, mark unhealthy and drain every sub-pool.
    pub async fn drain(&self) {
        self.emit(PoolEvent::Draining);
        {
            let mut state = self.inner.state.lock();
            state.draining = true;
            state.discovery = false;
        }
        self.stop_discovery();
        self.set_healthy(false, None);

        let pools = self.get_pools();
        join_all(pools.iter().map(|pool| self.close_server_pool(pool))).await;
        info!("Master pool drained");
    }

    fn start_discovery(&self) {
        let weak = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            loop {
                let active = MasterConnectionPool::from_weak(&weak)
                    .map(|master| {
                        let state = master.inner.state.lock();
                        state.discovery && !state.draining
                    })
                    .unwrap_or(false);
                if !active {
                    return;
                }
                match discover(&weak).await {
                    Ok(()) => debug!("Discovery feed ended"),
                    Err(error) => debug!(error = %error, "Discovery feed failed"),
                }
                tokio::time::sleep(Duration::from_secs(DISCOVERY_RETRY_DELAY_SECS)).await;
            }
        });
        if let Some(previous) = self.inner.state.lock().discovery_task.replace(task) {
            previous.abort();
        }
    }

    fn stop_discovery(&self) {
        let (task, cursor) = {
            let mut state = self.inner.state.lock();
            (state.discovery_task.take(), state.discovery_cursor.take())
        };
        if let Some(task) = task {
            task.abort();
        }
        if let Some(cursor) = cursor {
            cursor.close();
        }
    }

    async fn apply_discovery_change(&self, change: DiscoveryChange) {
        match change {
            DiscoveryChange::Add(server) => {
                {
                    let mut state = self.inner.state.lock();
                    if state.servers.contains(&server) {
                        return;
                    }
                    state.servers.push(server.clone());
                }
                info!(server = %server, "Discovered server");
                if let Some(pool) = self.create_server_pool(server) {
                    let master = self.clone();
                    tokio::spawn(async move {
                        let _ = pool.wait_for_healthy().await;
                        master.set_server_pools_options();
                    });
                }
            }
            DiscoveryChange::Remove(server) => self.remove_server(&server).await,
        }
    }

    async fn remove_server(&self, server: &ServerAddress) {
        let pool = {
            let mut state = self.inner.state.lock();
            state.servers.retain(|s| s != server);
            state.pools.iter().find(|p| p.server() == server).cloned()
        };
        if let Some(pool) = pool {
            info!(server = %server, "Removing server");
            self.close_server_pool(&pool).await;
            self.set_server_pools_options();
        }
    }
}

/// Follow the server status feed until it ends or fails.
async fn discover(weak: &Weak<MasterInner>) -> Result<()> {
    let cursor = {
        let master = MasterConnectionPool::from_weak(weak).ok_or_else(Error::closed)?;
        let cursor = master
            .get_cursor(discovery::discovery_query(), RunOptions::default())
            .await?;
        let mut state = master.inner.state.lock();
        if !state.discovery || state.draining {
            cursor.close();
            return Ok(());
        }
        if let Some(previous) = state.discovery_cursor.replace(cursor.clone()) {
            previous.close();
        }
        cursor
    };

    let mut tracker = DiscoveryTracker::new();
    loop {
        let row = match cursor.next().await {
            Ok(row) => row,
            Err(error) if error.is_termination() => return Ok(()),
            Err(error) => return Err(error),
        };
        let Some(master) = MasterConnectionPool::from_weak(weak) else {
            cursor.close();
            return Ok(());
        };
        let changes = tracker.observe(&row, &master.servers())?;
        for change in changes {
            master.apply_discovery_change(change).await;
        }
    }
}

fn master_init_error(cause: Option<Error>) -> Error {
    let error = Error::new(ErrorKind::MasterPoolFail, "Error initializing master pool");
    match cause {
        Some(cause) => error.with_cause(cause),
        None => error,
    }
}

#[async_trait]
impl QueryRunner for MasterConnectionPool {
    async fn queue(&self, term: Term, options: RunOptions) -> Result<Option<Cursor>> {
        MasterConnectionPool::queue(self, term, options).await
    }

    async fn run(&self, term: Term, options: RunOptions) -> Result<RunResult> {
        self.ensure_not_draining(&term)?;
        match MasterConnectionPool::queue(self, term, options).await? {
            Some(cursor) => RunResult::from_cursor(cursor).await,
            None => Ok(RunResult::NoReply),
        }
    }

    async fn get_cursor(&self, term: Term, options: RunOptions) -> Result<Cursor> {
        self.ensure_not_draining(&term)?;
        if options.noreply {
            return Err(Error::api("`get_cursor` cannot be used with `noreply`."));
        }
        let cursor = MasterConnectionPool::queue(self, term, options)
            .await?
            .ok_or_else(|| Error::api("The query did not return a cursor."))?;
        cursor.init().await?;
        Ok(cursor)
    }
}
