//! One transport connection and its token table.
//!
//! A [`Socket`] owns the stream to one server. Outgoing frames go through an
//! unbounded channel to a writer task; a reader task decodes incoming frames
//! and routes each to the queue of the request that owns its token.
//!
//! ```text
//! send_query ─► token table ─► writer task ─► server
//!                    ▲
//! read_next  ◄─ queue ◄── reader task ◄─────── server
//! ```
//!
//! During the handshake the reader splits NUL-terminated JSON messages and
//! hands them to tokens 0, 1, 2 in arrival order; afterwards it decodes
//! token-tagged response frames.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, instrument, trace, warn};

use super::auth::{self, KeyDerivationCache};
use super::protocol::{self, QueryEnvelope};
use super::transport::{self, BoxedTransport};
use crate::config::{ServerAddress, TlsOptions};
use crate::error::{Error, Result};
use crate::metrics;
use crate::reql::{QueryType, Response, ResponseType};

const EVENT_CAPACITY: usize = 256;
const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Observable socket state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketStatus {
    Closed,
    Handshake,
    Open,
    Errored,
}

/// Notifications emitted by a socket.
#[derive(Debug, Clone)]
pub enum SocketEvent {
    Connect,
    /// A query was written for this token.
    Query(u64),
    /// A request finished; carries the number still running.
    Release(usize),
    Close(Option<Error>),
    Error(Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Handshake,
    Response,
}

#[derive(Debug)]
enum Frame {
    Handshake(Value),
    Response(Response),
}

type FrameResult = Result<Frame>;
type SharedReceiver = Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<FrameResult>>>;

/// Per-token bookkeeping: the query for error context and its data queue.
struct RunningQuery {
    query: Option<Value>,
    tx: mpsc::UnboundedSender<FrameResult>,
    rx: SharedReceiver,
}

impl RunningQuery {
    fn new(query: Option<Value>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            query,
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
        }
    }

    fn enqueue(&self, frame: Frame) {
        let _ = self.tx.send(Ok(frame));
    }

    /// Resolve any pending reader with `error`.
    fn destroy(&self, error: Error) {
        let _ = self.tx.send(Err(error));
    }
}

struct SocketState {
    is_open: bool,
    mode: Mode,
    last_error: Option<Error>,
    next_token: u64,
    running: HashMap<u64, RunningQuery>,
    writer: Option<mpsc::UnboundedSender<Bytes>>,
    reader_task: Option<JoinHandle<()>>,
    writer_task: Option<JoinHandle<()>>,
}

struct SocketShared {
    server: ServerAddress,
    tls: Option<TlsOptions>,
    user: String,
    password: String,
    key_cache: Arc<KeyDerivationCache>,
    state: Mutex<SocketState>,
    events: broadcast::Sender<SocketEvent>,
}

impl Drop for SocketShared {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for task in [state.reader_task.take(), state.writer_task.take()].into_iter().flatten() {
            task.abort();
        }
    }
}

/// Handle to one transport connection. Clones share the same socket.
#[derive(Clone)]
pub struct Socket {
    shared: Arc<SocketShared>,
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("server", &self.shared.server)
            .field("status", &self.status())
            .finish()
    }
}

impl Socket {
    pub fn new(
        server: ServerAddress,
        tls: Option<TlsOptions>,
        user: impl Into<String>,
        password: impl Into<String>,
        key_cache: Arc<KeyDerivationCache>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(SocketShared {
                server,
                tls,
                user: user.into(),
                password: password.into(),
                key_cache,
                state: Mutex::new(SocketState {
                    is_open: false,
                    mode: Mode::Handshake,
                    last_error: None,
                    next_token: 0,
                    running: HashMap::new(),
                    writer: None,
                    reader_task: None,
                    writer_task: None,
                }),
                events,
            }),
        }
    }

    pub fn server(&self) -> &ServerAddress {
        &self.shared.server
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SocketEvent> {
        self.shared.events.subscribe()
    }

    pub fn status(&self) -> SocketStatus {
        let state = self.shared.state.lock();
        if state.last_error.is_some() {
            SocketStatus::Errored
        } else if !state.is_open {
            SocketStatus::Closed
        } else if state.mode == Mode::Handshake {
            SocketStatus::Handshake
        } else {
            SocketStatus::Open
        }
    }

    pub fn last_error(&self) -> Option<Error> {
        self.shared.state.lock().last_error.clone()
    }

    /// Number of requests awaiting responses.
    pub fn running_queries(&self) -> usize {
        self.shared.state.lock().running.len()
    }

    fn emit(&self, event: SocketEvent) {
        let _ = self.shared.events.send(event);
    }

    /// Open the transport and run the handshake.
    ///
    /// On failure the socket is closed and the error latched.
    #[instrument(skip(self), fields(server = %self.shared.server))]
    pub async fn connect(&self) -> Result<()> {
        if self.shared.state.lock().writer.is_some() {
            return Err(Error::connection("Socket is already connected"));
        }

        let started = Instant::now();
        let result = self.establish().await;
        match &result {
            Ok(()) => {
                metrics::HANDSHAKE_DURATION.observe(started.elapsed().as_secs_f64());
                debug!("Socket open");
                self.emit(SocketEvent::Connect);
            }
            Err(error) => self.handle_error(error.clone()),
        }
        result
    }

    async fn establish(&self) -> Result<()> {
        let stream = transport::open(&self.shared.server, self.shared.tls.as_ref()).await?;
        let (reader, writer) = tokio::io::split(stream);
        let (tx, rx) = mpsc::unbounded_channel();

        let weak = Arc::downgrade(&self.shared);
        {
            let mut state = self.shared.state.lock();
            state.is_open = true;
            state.mode = Mode::Handshake;
            state.last_error = None;
            state.next_token = 0;
            state.writer = Some(tx);
            state.reader_task = Some(tokio::spawn(read_loop(reader, weak.clone())));
            state.writer_task = Some(tokio::spawn(write_loop(writer, rx, weak)));
        }

        self.perform_handshake().await
    }

    async fn perform_handshake(&self) -> Result<()> {
        let (auth_buffer, nonce) = protocol::build_auth_buffer(&self.shared.user);
        {
            let mut state = self.shared.state.lock();
            state.running.insert(0, RunningQuery::new(None));
            state.running.insert(1, RunningQuery::new(None));
        }
        self.write_raw(auth_buffer)?;

        let hello = self.read_handshake(0).await?;
        protocol::validate_version(&hello)?;

        let first = self.read_handshake(1).await?;
        let server_first = first
            .get("authentication")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::auth(format!("Missing server-first message: {}", first)))?;
        let proof = auth::compute_proof(
            server_first,
            &nonce,
            &self.shared.user,
            self.shared.password.as_bytes(),
            &self.shared.key_cache,
        )
        .await?;

        self.shared
            .state
            .lock()
            .running
            .insert(2, RunningQuery::new(None));
        self.write_raw(protocol::client_final_buffer(&proof.client_final))?;

        let last = self.read_handshake(2).await?;
        let returned = last
            .get("authentication")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::auth(format!("Missing server signature: {}", last)))?;
        auth::compare_digest(returned, &proof.server_signature)?;

        self.shared.state.lock().mode = Mode::Response;
        Ok(())
    }

    fn write_raw(&self, bytes: Bytes) -> Result<()> {
        let state = self.shared.state.lock();
        let writer = state.writer.as_ref().ok_or_else(Error::closed)?;
        writer.send(bytes).map_err(|_| Error::closed())
    }

    /// Write a query envelope. Allocates a token unless one is given.
    ///
    /// - noreply START: written, never registered
    /// - STOP: written; the token's pending reader is resolved with `Cancel`
    /// - otherwise: the token is registered before the write
    pub fn send_query(&self, envelope: &QueryEnvelope, token: Option<u64>) -> Result<u64> {
        let mut state = self.shared.state.lock();
        if !state.is_open || state.mode != Mode::Response || state.last_error.is_some() {
            let mut error = Error::connection("`run` was called with a closed connection.");
            if let Some(term) = &envelope.term {
                error = error.with_query(term.to_json());
            }
            return Err(error);
        }

        let token = match token {
            Some(token) => token,
            None => {
                let token = state.next_token;
                state.next_token += 1;
                token
            }
        };
        let frame = protocol::encode_query(token, envelope)?;
        let writer = state.writer.clone().ok_or_else(Error::closed)?;
        metrics::QUERIES_TOTAL
            .with_label_values(&[envelope.kind.name()])
            .inc();
        trace!(token, kind = envelope.kind.name(), "Sending query");

        if envelope.kind == QueryType::Start && envelope.is_noreply() {
            writer.send(frame).map_err(|_| Error::closed())?;
            drop(state);
            self.emit(SocketEvent::Query(token));
            return Ok(token);
        }

        if envelope.kind == QueryType::Stop {
            writer.send(frame).map_err(|_| Error::closed())?;
            let removed = state.running.remove(&token);
            let released = removed.is_some();
            if let Some(query) = removed {
                let mut error = Error::cancelled();
                if let Some(term) = query.query.clone() {
                    error = error.with_query(term);
                }
                query.destroy(error);
            }
            let remaining = state.running.len();
            drop(state);
            if released {
                self.emit(SocketEvent::Release(remaining));
            }
            return Ok(token);
        }

        if !state.running.contains_key(&token) {
            let query = envelope.term.as_ref().map(|term| term.to_json());
            state.running.insert(token, RunningQuery::new(query));
        }
        writer.send(frame).map_err(|_| Error::closed())?;
        drop(state);
        self.emit(SocketEvent::Query(token));
        Ok(token)
    }

    pub fn continue_query(&self, token: u64) -> Result<()> {
        if self.shared.state.lock().running.contains_key(&token) {
            self.send_query(&QueryEnvelope::control(QueryType::Continue), Some(token))?;
        }
        Ok(())
    }

    pub fn stop_query(&self, token: u64) -> Result<()> {
        if self.shared.state.lock().running.contains_key(&token) {
            self.send_query(&QueryEnvelope::control(QueryType::Stop), Some(token))?;
        }
        Ok(())
    }

    fn receiver(&self, token: u64) -> Result<SharedReceiver> {
        let state = self.shared.state.lock();
        if !state.is_open {
            return Err(state.last_error.clone().unwrap_or_else(Error::closed));
        }
        state
            .running
            .get(&token)
            .map(|query| query.rx.clone())
            .ok_or_else(Error::cursor_end)
    }

    async fn dequeue(&self, token: u64) -> Result<Frame> {
        let rx = self.receiver(token)?;
        let item = rx.lock().await.recv().await;
        match item {
            Some(Ok(frame)) => Ok(frame),
            Some(Err(error)) => {
                self.shared.state.lock().running.remove(&token);
                Err(error)
            }
            None => Err(self.last_error().unwrap_or_else(Error::closed)),
        }
    }

    async fn read_handshake(&self, token: u64) -> Result<Value> {
        let frame = self.dequeue(token).await;
        self.shared.state.lock().running.remove(&token);
        match frame? {
            Frame::Handshake(message) => Ok(message),
            Frame::Response(_) => Err(Error::auth("Unexpected response during handshake")),
        }
    }

    /// Await the next response for `token`.
    ///
    /// Fails with `CursorEnd` when the token is not running. The token is
    /// released once a non-partial response arrives.
    pub async fn read_next(&self, token: u64) -> Result<Response> {
        match self.dequeue(token).await? {
            Frame::Response(response) => {
                if response.response_type != ResponseType::SuccessPartial {
                    let remaining = {
                        let mut state = self.shared.state.lock();
                        state.running.remove(&token);
                        state.running.len()
                    };
                    self.emit(SocketEvent::Release(remaining));
                }
                Ok(response)
            }
            Frame::Handshake(_) => Err(Error::connection("Unexpected handshake message")),
        }
    }

    fn handle_data(&self, buf: &mut BytesMut) -> Result<()> {
        loop {
            let mode = self.shared.state.lock().mode;
            match mode {
                Mode::Handshake => {
                    let Some(message) = protocol::split_handshake_message(buf) else {
                        return Ok(());
                    };
                    self.route_handshake(&message)?;
                }
                Mode::Response => {
                    let Some((token, response)) = protocol::decode_frame(buf)? else {
                        return Ok(());
                    };
                    let state = self.shared.state.lock();
                    match state.running.get(&token) {
                        Some(query) => query.enqueue(Frame::Response(response)),
                        None => trace!(token, "Dropping response for unknown token"),
                    }
                }
            }
        }
    }

    fn route_handshake(&self, message: &[u8]) -> Result<()> {
        let mut state = self.shared.state.lock();
        let token = state.next_token;
        state.next_token += 1;

        let error = match serde_json::from_slice::<Value>(message) {
            Ok(json) if json.get("success").and_then(Value::as_bool) == Some(true) => {
                if let Some(query) = state.running.get(&token) {
                    query.enqueue(Frame::Handshake(json));
                }
                return Ok(());
            }
            Ok(json) => {
                let text = json
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("Authentication failed")
                    .to_string();
                let mut error = Error::auth(text);
                if let Some(code) = json.get("error_code").and_then(Value::as_i64) {
                    error = error.with_error_code(code);
                }
                error
            }
            Err(e) => Error::auth(String::from_utf8_lossy(message).into_owned()).with_cause(e),
        };
        if let Some(query) = state.running.remove(&token) {
            query.destroy(error.clone());
        }
        Err(error)
    }

    /// Close the transport and fail every outstanding request.
    ///
    /// Idempotent. Outstanding requests receive `error` when given, otherwise
    /// a connection-closed error.
    pub fn close(&self, error: Option<Error>) {
        let (running, was_attached) = {
            let mut state = self.shared.state.lock();
            let running: Vec<RunningQuery> = state.running.drain().map(|(_, query)| query).collect();
            // The writer drains queued frames and shuts the stream down once
            // its sender is dropped.
            let was_attached = state.writer.take().is_some() || state.is_open;
            state.writer_task = None;
            if let Some(task) = state.reader_task.take() {
                task.abort();
            }
            state.is_open = false;
            state.mode = Mode::Handshake;
            state.next_token = 0;
            (running, was_attached)
        };

        let failure = error.clone().unwrap_or_else(Error::closed);
        for query in running {
            query.destroy(failure.clone());
        }

        if was_attached {
            debug!(server = %self.shared.server, "Socket closed");
            self.emit(SocketEvent::Close(error));
        }
    }

    /// Latch `error`, announce it, then close.
    ///
    /// Handshake failures are not announced; they surface from
    /// [`Socket::connect`] instead.
    fn handle_error(&self, error: Error) {
        // Latch first so readers woken by the close see the cause.
        let established = {
            let mut state = self.shared.state.lock();
            state.last_error = Some(error.clone());
            state.is_open && state.mode == Mode::Response
        };
        // Error precedes Close: subscribers stop listening after Close.
        if established {
            self.emit(SocketEvent::Error(error.clone()));
        }
        self.close(Some(error));
    }
}

async fn read_loop(mut reader: ReadHalf<BoxedTransport>, socket: Weak<SocketShared>) {
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
    loop {
        let read = reader.read_buf(&mut buf).await;
        let Some(shared) = socket.upgrade() else {
            return;
        };
        let socket = Socket { shared };
        match read {
            Ok(0) => {
                socket.close(None);
                return;
            }
            Ok(_) => {
                if let Err(error) = socket.handle_data(&mut buf) {
                    warn!(server = %socket.server(), error = %error, "Protocol error");
                    socket.handle_error(error);
                    return;
                }
            }
            Err(e) => {
                socket.handle_error(Error::from(e));
                return;
            }
        }
    }
}

async fn write_loop(
    mut writer: WriteHalf<BoxedTransport>,
    mut frames: mpsc::UnboundedReceiver<Bytes>,
    socket: Weak<SocketShared>,
) {
    while let Some(frame) = frames.recv().await {
        let written = match writer.write_all(&frame).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            if let Some(shared) = socket.upgrade() {
                Socket { shared }.handle_error(Error::from(e));
            }
            return;
        }
    }
    let _ = writer.shutdown().await;
}
