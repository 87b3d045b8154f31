//! Client connection to one server.
//!
//! A [`Connection`] wraps the current [`Socket`] and adds:
//!
//! 1. **Lifecycle**: connect with a timeout, reconnect with a fresh socket, close
//! 2. **Keep-alive**: an optional ping task (`r.error("ping")` every interval)
//! 3. **Query entry**: default-database binding and cursor creation
//!
//! Socket events are forwarded as [`ConnectionEvent`]s so pools can supervise
//! connections without holding references back into them.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument};

use super::protocol::QueryEnvelope;
use super::socket::{Socket, SocketEvent, SocketStatus};
use crate::config::{ConnectionOptions, ServerAddress};
use crate::cursor::Cursor;
use crate::error::{Error, ErrorKind, Result};
use crate::metrics;
use crate::reql::{ErrorType, QueryType, ResponseType, RunOptions, ServerInfo, Term};

const EVENT_CAPACITY: usize = 256;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Notifications emitted by a connection.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Connect,
    Query(u64),
    /// The last running query finished.
    Release,
    Timeout,
    Close(Option<Error>),
    Error(Error),
}

struct ConnectionInner {
    id: u64,
    server: ServerAddress,
    options: ConnectionOptions,
    silent: AtomicBool,
    db: Mutex<String>,
    socket: Mutex<Socket>,
    ping_task: Mutex<Option<JoinHandle<()>>>,
    forward_task: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        if let Some(task) = self.ping_task.get_mut().take() {
            task.abort();
        }
        if let Some(task) = self.forward_task.get_mut().take() {
            task.abort();
        }
        self.socket.get_mut().close(None);
    }
}

/// Handle to a connection. Clones share the same connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("server", &self.inner.server)
            .field("open", &self.is_open())
            .finish()
    }
}

impl Connection {
    /// Create a closed connection; call [`Connection::reconnect`] to open it.
    pub fn new(server: ServerAddress, options: ConnectionOptions) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let socket = Self::new_socket(&server, &options);
        Self {
            inner: Arc::new(ConnectionInner {
                id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
                db: Mutex::new(options.db.clone()),
                silent: AtomicBool::new(options.silent),
                server,
                options,
                socket: Mutex::new(socket),
                ping_task: Mutex::new(None),
                forward_task: Mutex::new(None),
                events,
            }),
        }
    }

    /// Create and open a connection.
    pub async fn connect(server: ServerAddress, options: ConnectionOptions) -> Result<Self> {
        let connection = Self::new(server, options);
        connection.reconnect(false).await?;
        Ok(connection)
    }

    fn new_socket(server: &ServerAddress, options: &ConnectionOptions) -> Socket {
        Socket::new(
            server.clone(),
            options.tls.clone(),
            options.user.clone(),
            options.password.clone(),
            options.key_cache.clone(),
        )
    }

    /// Stable identity within the process.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn server(&self) -> &ServerAddress {
        &self.inner.server
    }

    pub fn socket(&self) -> Socket {
        self.inner.socket.lock().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_open(&self) -> bool {
        self.socket().status() == SocketStatus::Open
    }

    pub fn status(&self) -> SocketStatus {
        self.socket().status()
    }

    pub fn num_of_queries(&self) -> usize {
        self.socket().running_queries()
    }

    pub fn db(&self) -> String {
        self.inner.db.lock().clone()
    }

    /// Change the default database for subsequent queries.
    pub fn use_db(&self, db: impl Into<String>) {
        *self.inner.db.lock() = db.into();
    }

    pub fn is_silent(&self) -> bool {
        self.inner.silent.load(Ordering::Relaxed)
    }

    /// Toggle error logging at `error` level for this connection.
    pub fn set_silent(&self, silent: bool) {
        self.inner.silent.store(silent, Ordering::Relaxed);
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.inner.events.send(event);
    }

    /// Replace the socket with a fresh one and connect it.
    ///
    /// An open socket is closed first, so at most one transport is live.
    #[instrument(skip(self), fields(server = %self.inner.server))]
    pub async fn reconnect(&self, noreply_wait: bool) -> Result<()> {
        if matches!(self.status(), SocketStatus::Open | SocketStatus::Handshake) {
            self.close(noreply_wait).await?;
        }

        let socket = Self::new_socket(&self.inner.server, &self.inner.options);
        let previous = std::mem::replace(&mut *self.inner.socket.lock(), socket.clone());
        self.forward_events(&socket);
        previous.close(None);

        let timeout = self.inner.options.timeout;
        let server = self.inner.server.to_string();
        match tokio::time::timeout(timeout, socket.connect()).await {
            Ok(Ok(())) => {}
            Ok(Err(cause)) => {
                metrics::RECONNECT_ATTEMPTS
                    .with_label_values(&[server.as_str(), "error"])
                    .inc();
                // Auth failures keep their kind and server error code.
                let error = if cause.kind() == ErrorKind::Auth {
                    cause
                } else {
                    Error::connection("Unable to establish connection, see cause for more info.")
                        .with_cause(cause)
                };
                self.report_error(&error);
                return Err(error);
            }
            Err(_) => {
                let error = Error::new(
                    ErrorKind::Timeout,
                    format!(
                        "Failed to connect to {} in less than {}s.",
                        self.inner.server,
                        timeout.as_secs()
                    ),
                );
                metrics::RECONNECT_ATTEMPTS
                    .with_label_values(&[server.as_str(), "timeout"])
                    .inc();
                self.emit(ConnectionEvent::Timeout);
                socket.close(Some(error.clone()));
                self.report_error(&error);
                return Err(error);
            }
        }

        metrics::RECONNECT_ATTEMPTS
            .with_label_values(&[server.as_str(), "ok"])
            .inc();
        info!(id = self.inner.id, "Connection established");
        self.start_pinging();
        Ok(())
    }

    fn forward_events(&self, socket: &Socket) {
        let mut events = socket.subscribe();
        let weak = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Socket events lagged");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let connection = Connection { inner };
                match event {
                    SocketEvent::Connect => connection.emit(ConnectionEvent::Connect),
                    SocketEvent::Query(token) => connection.emit(ConnectionEvent::Query(token)),
                    SocketEvent::Release(0) => connection.emit(ConnectionEvent::Release),
                    SocketEvent::Release(_) => {}
                    SocketEvent::Error(error) => connection.report_error(&error),
                    SocketEvent::Close(error) => {
                        connection.stop_pinging();
                        connection.emit(ConnectionEvent::Close(error));
                        break;
                    }
                }
            }
        });
        if let Some(previous) = self.inner.forward_task.lock().replace(task) {
            previous.abort();
        }
    }

    fn start_pinging(&self) {
        let Some(interval) = self.inner.options.ping_interval else {
            return;
        };
        let weak: Weak<ConnectionInner> = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let connection = Connection { inner };
                if let Err(error) = connection.ping().await {
                    connection.report_error(&error);
                }
            }
        });
        if let Some(previous) = self.inner.ping_task.lock().replace(task) {
            previous.abort();
        }
    }

    fn stop_pinging(&self) {
        if let Some(task) = self.inner.ping_task.lock().take() {
            task.abort();
        }
    }

    /// One keep-alive round trip. Expects the `ping` user error back.
    pub async fn ping(&self) -> Result<()> {
        let socket = self.socket();
        if socket.status() != SocketStatus::Open {
            return Ok(());
        }
        let token = socket.send_query(&QueryEnvelope::start(Term::error("ping"), Map::new()), None)?;
        let response = socket.read_next(token).await?;

        let is_pong = response.response_type == ResponseType::RuntimeError
            && response.error_type == Some(ErrorType::User)
            && response.results.first().and_then(Value::as_str) == Some("ping");
        if is_pong {
            Ok(())
        } else {
            Err(Error::new(ErrorKind::UnexpectedResponse, "Ping error")
                .with_response_type(response.response_type))
        }
    }

    /// Send a START query. Returns `None` for `noreply` queries.
    ///
    /// The database (`options.db` or the connection default) is bound to
    /// unqualified table references and sent as the global `db` optarg.
    pub async fn query(&self, mut term: Term, mut options: RunOptions) -> Result<Option<Cursor>> {
        let db = options.db.clone().unwrap_or_else(|| self.db());
        term.qualify_tables(&db);
        options.db = Some(db);

        let envelope = QueryEnvelope::start(term, options.to_optargs());
        let socket = self.socket();
        let token = socket.send_query(&envelope, None)?;
        if options.noreply {
            return Ok(None);
        }
        let query = envelope.term.as_ref().map(Term::to_json);
        Ok(Some(Cursor::new(socket, token, query)))
    }

    /// Ask the server to identify itself.
    pub async fn server_info(&self) -> Result<ServerInfo> {
        let socket = self.socket();
        let token = socket.send_query(&QueryEnvelope::control(QueryType::ServerInfo), None)?;
        let response = socket.read_next(token).await?;
        if response.response_type != ResponseType::ServerInfo {
            return Err(self.unexpected_response(&socket, response.response_type));
        }
        let info = response
            .results
            .into_iter()
            .next()
            .ok_or_else(|| Error::new(ErrorKind::UnexpectedResponse, "Empty server info"))?;
        Ok(serde_json::from_value(info)?)
    }

    /// Wait until every previously sent `noreply` query has been processed.
    pub async fn noreply_wait(&self) -> Result<()> {
        let socket = self.socket();
        let token = socket.send_query(&QueryEnvelope::control(QueryType::NoreplyWait), None)?;
        let response = socket.read_next(token).await?;
        if response.response_type != ResponseType::WaitComplete {
            return Err(self.unexpected_response(&socket, response.response_type));
        }
        Ok(())
    }

    fn unexpected_response(&self, socket: &Socket, response_type: ResponseType) -> Error {
        if let Some(error) = socket.last_error() {
            return error;
        }
        let error = Error::new(ErrorKind::UnexpectedResponse, "Unexpected response")
            .with_response_type(response_type);
        self.report_error(&error);
        error
    }

    /// Close the connection, optionally after a `noreply_wait`.
    ///
    /// The socket is closed even when the wait fails; the wait error is
    /// returned afterwards.
    pub async fn close(&self, noreply_wait: bool) -> Result<()> {
        self.stop_pinging();
        let waited = if noreply_wait && self.is_open() {
            self.noreply_wait().await
        } else {
            Ok(())
        };
        self.socket().close(None);
        waited
    }

    /// Emit an error and log it unless it is a cancellation.
    pub(crate) fn report_error(&self, err: &Error) {
        self.emit(ConnectionEvent::Error(err.clone()));
        if err.kind() == ErrorKind::Cancel {
            return;
        }
        if let Some(log) = &self.inner.options.log {
            log.call(&err.to_string());
        }
        if self.is_silent() {
            debug!(server = %self.inner.server, error = %err, "Connection error");
        } else {
            error!(server = %self.inner.server, error = %err, "Connection error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogHook;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_ids_are_unique() {
        let a = Connection::new(ServerAddress::default(), ConnectionOptions::default());
        let b = Connection::new(ServerAddress::default(), ConnectionOptions::default());
        assert_ne!(a.id(), b.id());
        assert!(!a.is_open());
        assert_eq!(a.db(), "test");
    }

    #[test]
    fn test_use_db() {
        let connection = Connection::new(ServerAddress::default(), ConnectionOptions::default());
        connection.use_db("analytics");
        assert_eq!(connection.db(), "analytics");
    }

    #[tokio::test]
    async fn test_query_on_closed_connection() {
        let connection = Connection::new(ServerAddress::default(), ConnectionOptions::default());
        let err = connection
            .query(Term::table("users"), RunOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connection);
        assert!(err.to_string().contains("[14,[\"test\"]]"));
    }

    #[tokio::test]
    async fn test_connect_timeout() {
        // Accepts but never answers the handshake.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _server = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let logged = Arc::new(AtomicUsize::new(0));
        let counter = logged.clone();
        let options = ConnectionOptions {
            timeout: Duration::from_millis(200),
            silent: true,
            log: Some(LogHook::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
            ..ConnectionOptions::default()
        };
        let err = Connection::connect(ServerAddress::new("127.0.0.1", port), options)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(logged.load(Ordering::SeqCst) >= 1);
    }
}
