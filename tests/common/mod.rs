//! In-process mock server speaking the V1_0 handshake and JSON query protocol.
//!
//! Recognised queries (after database binding):
//! - scalar datum: echoed back as an atom
//! - `"sleep:<ms>"`: answered with `"slept"` after the delay
//! - `"array:<n>"`: an atom whose value is `[0, .., n)`
//! - `"garbage"`: a response frame whose payload is not JSON
//! - `MAKE_ARRAY`: a sequence delivered two rows per batch
//! - `ERROR`: a runtime user error carrying the message
//! - `TABLE`: an atom echoing the table term
//! - `INSERT` / `COUNT`: a shared insert counter
//! - `CHANGES` on `server_status`: initial cluster snapshot, then silence
//! - `CHANGES` on anything else: one change per `CONTINUE`

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bytes::{Buf, BufMut, BytesMut};
use parking_lot::Mutex;
use photondb_driver::config::{ConnectionOptions, ServerAddress};
use photondb_driver::network::auth::{compute_proof, KeyDerivationCache};
use photondb_driver::network::protocol::VERSION_V1_0;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

pub const USER: &str = "admin";
pub const PASSWORD: &str = "secret";
const SERVER_NONCE_SUFFIX: &str = "mockservernonce";
const ITERATIONS: u32 = 64;
const BATCH_SIZE: usize = 2;

type Writer = Arc<tokio::sync::Mutex<OwnedWriteHalf>>;

pub struct MockState {
    port: u16,
    inserted: AtomicU64,
    accepted: AtomicUsize,
    peers: Mutex<Vec<u16>>,
    connections: Mutex<Vec<JoinHandle<()>>>,
}

impl MockState {
    /// Tasks holding a connection's write half; aborted with the connection.
    fn track(&self, handle: JoinHandle<()>) {
        self.connections.lock().push(handle);
    }
}

pub struct MockServer {
    state: Arc<MockState>,
    accept_task: JoinHandle<()>,
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.accept_task.abort();
        self.kill_connections();
    }
}

impl MockServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let state = Arc::new(MockState {
            port,
            inserted: AtomicU64::new(0),
            accepted: AtomicUsize::new(0),
            peers: Mutex::new(Vec::new()),
            connections: Mutex::new(Vec::new()),
        });

        let accept_state = state.clone();
        let accept_task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                accept_state.accepted.fetch_add(1, Ordering::SeqCst);
                let conn_state = accept_state.clone();
                let handle = tokio::spawn(async move {
                    let _ = serve_connection(stream, conn_state).await;
                });
                accept_state.track(handle);
            }
        });

        Self { state, accept_task }
    }

    pub fn port(&self) -> u16 {
        self.state.port
    }

    pub fn address(&self) -> ServerAddress {
        ServerAddress::new("127.0.0.1", self.state.port)
    }

    pub fn accepted(&self) -> usize {
        self.state.accepted.load(Ordering::SeqCst)
    }

    pub fn inserted(&self) -> u64 {
        self.state.inserted.load(Ordering::SeqCst)
    }

    /// Additional servers reported by the `server_status` feed.
    pub fn set_peers(&self, ports: Vec<u16>) {
        *self.state.peers.lock() = ports;
    }

    /// Drop every client connection; the listener keeps accepting.
    pub fn kill_connections(&self) {
        for handle in self.state.connections.lock().drain(..) {
            handle.abort();
        }
    }
}

pub fn options() -> ConnectionOptions {
    ConnectionOptions {
        password: PASSWORD.to_string(),
        timeout: Duration::from_secs(5),
        silent: true,
        ..ConnectionOptions::default()
    }
}

/// Poll `condition` every 10ms until it holds or `within` elapses.
pub async fn eventually<F: FnMut() -> bool>(mut condition: F, within: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn read_message(reader: &mut OwnedReadHalf, buf: &mut BytesMut) -> std::io::Result<Value> {
    loop {
        if let Some(end) = buf.iter().position(|b| *b == 0) {
            let message = buf.split_to(end);
            buf.advance(1);
            return serde_json::from_slice(&message)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e));
        }
        if reader.read_buf(buf).await? == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
    }
}

async fn write_message(writer: &Writer, message: Value) -> std::io::Result<()> {
    let mut bytes = message.to_string().into_bytes();
    bytes.push(0);
    writer.lock().await.write_all(&bytes).await
}

async fn read_frame(reader: &mut OwnedReadHalf, buf: &mut BytesMut) -> std::io::Result<(u64, Value)> {
    loop {
        if buf.len() >= 12 {
            let mut header = &buf[..12];
            let low = u64::from(header.get_u32_le());
            let high = u64::from(header.get_u32_le());
            let len = header.get_u32_le() as usize;
            if buf.len() >= 12 + len {
                buf.advance(12);
                let payload = buf.split_to(len);
                let query = serde_json::from_slice(&payload)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
                return Ok(((high << 32) | low, query));
            }
        }
        if reader.read_buf(buf).await? == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
    }
}

async fn respond(writer: &Writer, token: u64, response: Value) -> std::io::Result<()> {
    let payload = response.to_string();
    let mut frame = BytesMut::with_capacity(12 + payload.len());
    frame.put_u32_le((token & 0xffff_ffff) as u32);
    frame.put_u32_le((token >> 32) as u32);
    frame.put_u32_le(payload.len() as u32);
    frame.put_slice(payload.as_bytes());
    writer.lock().await.write_all(&frame).await
}

async fn handshake(reader: &mut OwnedReadHalf, writer: &Writer, buf: &mut BytesMut) -> std::io::Result<bool> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic).await?;
    if u32::from_le_bytes(magic) != VERSION_V1_0 {
        return Ok(false);
    }
    write_message(
        writer,
        json!({"success": true, "min_protocol_version": 0, "max_protocol_version": 0, "server_version": "mock"}),
    )
    .await?;

    let first = read_message(reader, buf).await?;
    let client_first = first["authentication"].as_str().unwrap_or_default().to_string();
    let mut user = "";
    let mut client_nonce = "";
    for part in client_first.trim_start_matches("n,,").split(',') {
        if let Some(value) = part.strip_prefix("n=") {
            user = value;
        } else if let Some(value) = part.strip_prefix("r=") {
            client_nonce = value;
        }
    }
    let server_first = format!(
        "r={}{},s={},i={}",
        client_nonce,
        SERVER_NONCE_SUFFIX,
        BASE64.encode(b"mock-salt"),
        ITERATIONS
    );
    write_message(writer, json!({"success": true, "authentication": server_first})).await?;

    let last = read_message(reader, buf).await?;
    let cache = KeyDerivationCache::default();
    let expected = compute_proof(&server_first, client_nonce, user, PASSWORD.as_bytes(), &cache)
        .await
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
    if user != USER || last["authentication"].as_str() != Some(expected.client_final.as_str()) {
        write_message(
            writer,
            json!({"success": false, "error": "Wrong password", "error_code": 12}),
        )
        .await?;
        return Ok(false);
    }
    write_message(
        writer,
        json!({"success": true, "authentication": format!("v={}", expected.server_signature)}),
    )
    .await?;
    Ok(true)
}

enum Pending {
    Rows(VecDeque<Value>),
    Feed(u64),
    Hold,
}

async fn serve_connection(stream: TcpStream, state: Arc<MockState>) -> std::io::Result<()> {
    let (mut reader, writer) = stream.into_split();
    let writer: Writer = Arc::new(tokio::sync::Mutex::new(writer));
    let mut buf = BytesMut::with_capacity(8 * 1024);

    if !handshake(&mut reader, &writer, &mut buf).await? {
        return Ok(());
    }

    let mut pending: HashMap<u64, Pending> = HashMap::new();
    loop {
        let (token, query) = read_frame(&mut reader, &mut buf).await?;
        match query[0].as_u64() {
            Some(1) => {
                let noreply = query[2]["noreply"].as_bool() == Some(true);
                start(&state, &writer, &mut pending, token, &query[1], noreply).await?;
            }
            Some(2) => match pending.get_mut(&token) {
                Some(Pending::Rows(rows)) => {
                    let response = next_batch(rows);
                    if response["t"] == 2 {
                        pending.remove(&token);
                    }
                    respond(&writer, token, response).await?;
                }
                Some(Pending::Feed(counter)) => {
                    *counter += 1;
                    let n = *counter;
                    let writer = writer.clone();
                    state.track(tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        let _ = respond(&writer, token, json!({"t": 3, "r": [{"new_val": {"n": n}}], "n": [1]})).await;
                    }));
                }
                Some(Pending::Hold) | None => {}
            },
            Some(3) => {
                pending.remove(&token);
                respond(&writer, token, json!({"t": 2, "r": []})).await?;
            }
            Some(4) => respond(&writer, token, json!({"t": 4, "r": []})).await?,
            Some(5) => {
                respond(
                    &writer,
                    token,
                    json!({"t": 5, "r": [{"id": format!("mock-{}", state.port), "name": "mock", "proxy": false}]}),
                )
                .await?
            }
            _ => respond(&writer, token, json!({"t": 16, "r": ["Unknown query type"]})).await?,
        }
    }
}

fn next_batch(rows: &mut VecDeque<Value>) -> Value {
    let batch: Vec<Value> = (0..BATCH_SIZE).filter_map(|_| rows.pop_front()).collect();
    let kind = if rows.is_empty() { 2 } else { 3 };
    json!({"t": kind, "r": batch})
}

fn server_status(port: u16) -> Value {
    json!({
        "id": format!("server-{}", port),
        "name": format!("mock_{}", port),
        "network": {
            "hostname": "mockhost",
            "reql_port": port,
            "canonical_addresses": [
                {"host": "203.0.113.9", "port": 29015},
                {"host": "127.0.0.1", "port": 29015}
            ]
        }
    })
}

async fn start(
    state: &Arc<MockState>,
    writer: &Writer,
    pending: &mut HashMap<u64, Pending>,
    token: u64,
    term: &Value,
    noreply: bool,
) -> std::io::Result<()> {
    let args = term.get(1).cloned().unwrap_or(Value::Null);
    let response = match term {
        Value::String(text) if text.starts_with("sleep:") => {
            let millis = text["sleep:".len()..].parse().unwrap_or(0);
            let writer = writer.clone();
            state.track(tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(millis)).await;
                let _ = respond(&writer, token, json!({"t": 1, "r": ["slept"]})).await;
            }));
            return Ok(());
        }
        Value::String(text) if text == "garbage" => {
            let mut frame = BytesMut::with_capacity(16);
            frame.put_u32_le((token & 0xffff_ffff) as u32);
            frame.put_u32_le((token >> 32) as u32);
            frame.put_u32_le(4);
            frame.put_slice(b"{{{{");
            writer.lock().await.write_all(&frame).await?;
            return Ok(());
        }
        Value::String(text) if text.starts_with("array:") => {
            let n: u64 = text["array:".len()..].parse().unwrap_or(0);
            json!({"t": 1, "r": [(0..n).collect::<Vec<_>>()]})
        }
        Value::Array(_) => match term[0].as_u64() {
            // MAKE_ARRAY
            Some(2) => {
                let mut rows: VecDeque<Value> = args.as_array().cloned().unwrap_or_default().into();
                let response = next_batch(&mut rows);
                if response["t"] == 3 {
                    pending.insert(token, Pending::Rows(rows));
                }
                response
            }
            // ERROR
            Some(12) => json!({"t": 18, "e": 5000000, "r": [args[0].clone()], "b": []}),
            // TABLE
            Some(15) => json!({"t": 1, "r": [term.clone()]}),
            // COUNT
            Some(43) => json!({"t": 1, "r": [state.inserted.load(Ordering::SeqCst)]}),
            // INSERT
            Some(56) => {
                state.inserted.fetch_add(1, Ordering::SeqCst);
                json!({"t": 1, "r": [{"inserted": 1}]})
            }
            // CHANGES
            Some(152) => {
                if args[0].to_string().contains("server_status") {
                    let mut rows = vec![json!({"state": "initializing"})];
                    rows.push(json!({"new_val": server_status(state.port)}));
                    for peer in state.peers.lock().iter() {
                        rows.push(json!({"new_val": server_status(*peer)}));
                    }
                    rows.push(json!({"state": "ready"}));
                    pending.insert(token, Pending::Hold);
                    json!({"t": 3, "r": rows, "n": [1, 5]})
                } else {
                    pending.insert(token, Pending::Feed(0));
                    json!({"t": 3, "r": [], "n": [1]})
                }
            }
            _ => json!({"t": 17, "r": ["Unsupported term"], "b": []}),
        },
        scalar => json!({"t": 1, "r": [scalar.clone()]}),
    };
    if noreply {
        pending.remove(&token);
        return Ok(());
    }
    respond(writer, token, response).await
}
