//! Result cursors.
//!
//! A [`Cursor`] is bound to one `(socket, token)` pair. Rows are pulled one at
//! a time; when the buffered batch runs out and the server said more is
//! coming, the cursor sends `CONTINUE` and waits for the next batch.
//!
//! Consumption is either pull-based ([`Cursor::next`], [`Cursor::to_array`],
//! [`Cursor::each`], [`Cursor::into_stream`]) or push-based
//! ([`Cursor::listen`]), never both.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::stream::{self, Stream};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::trace;

use crate::error::{Error, ErrorKind, Result};
use crate::network::socket::{Socket, SocketStatus};
use crate::reql::{Response, ResponseNote, ResponseType};

const LISTEN_CAPACITY: usize = 64;

/// Shape of a result, known once the first batch arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorType {
    Atom,
    Cursor,
    Feed,
    AtomFeed,
    OrderByLimitFeed,
    UnionedFeed,
}

impl CursorType {
    pub fn is_feed(self) -> bool {
        !matches!(self, CursorType::Atom | CursorType::Cursor)
    }

    fn from_response(response: &Response) -> Self {
        if response.response_type == ResponseType::SuccessAtom {
            return CursorType::Atom;
        }
        for note in &response.notes {
            match note {
                ResponseNote::SequenceFeed => return CursorType::Feed,
                ResponseNote::AtomFeed => return CursorType::AtomFeed,
                ResponseNote::OrderByLimitFeed => return CursorType::OrderByLimitFeed,
                ResponseNote::UnionedFeed => return CursorType::UnionedFeed,
                _ => {}
            }
        }
        CursorType::Cursor
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorStatus {
    Fetching,
    HasBufferedRows,
    Exhausted,
    Closed,
    Errored,
}

#[derive(Debug, Default)]
struct CursorMeta {
    cursor_type: Option<CursorType>,
    profile: Option<Value>,
    includes_states: bool,
    unwrapped_atom: bool,
}

#[derive(Debug, Default)]
struct CursorState {
    started: bool,
    results: Vec<Value>,
    position: usize,
    has_more: bool,
    last_error: Option<Error>,
}

impl CursorState {
    fn take_row(&mut self) -> Option<Value> {
        let row = self.results.get_mut(self.position).map(std::mem::take)?;
        self.position += 1;
        Some(row)
    }
}

struct CursorShared {
    socket: Socket,
    token: u64,
    query: Option<Value>,
    emitting: AtomicBool,
    closed: AtomicBool,
    meta: parking_lot::Mutex<CursorMeta>,
    state: tokio::sync::Mutex<CursorState>,
}

impl Drop for CursorShared {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) && self.socket.status() == SocketStatus::Open {
            let _ = self.socket.stop_query(self.token);
        }
    }
}

/// Handle to a query result. Clones share position and buffer.
#[derive(Clone)]
pub struct Cursor {
    shared: Arc<CursorShared>,
}

impl std::fmt::Debug for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("token", &self.shared.token)
            .field("type", &self.cursor_type())
            .field("status", &self.status())
            .finish()
    }
}

impl Cursor {
    pub(crate) fn new(socket: Socket, token: u64, query: Option<Value>) -> Self {
        Self {
            shared: Arc::new(CursorShared {
                socket,
                token,
                query,
                emitting: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                meta: parking_lot::Mutex::new(CursorMeta::default()),
                state: tokio::sync::Mutex::new(CursorState::default()),
            }),
        }
    }

    pub fn token(&self) -> u64 {
        self.shared.token
    }

    /// Fetch the first batch so the cursor type and profile are known.
    pub async fn init(&self) -> Result<()> {
        let mut state = self.shared.state.lock().await;
        if state.started {
            return Ok(());
        }
        if let Some(error) = &state.last_error {
            return Err(error.clone());
        }
        self.resolve(&mut state).await
    }

    /// `None` until the first batch has arrived.
    pub fn cursor_type(&self) -> Option<CursorType> {
        self.shared.meta.lock().cursor_type
    }

    pub fn profile(&self) -> Option<Value> {
        self.shared.meta.lock().profile.clone()
    }

    /// Whether the feed interleaves `{"state": ...}` rows.
    pub fn includes_states(&self) -> bool {
        self.shared.meta.lock().includes_states
    }

    /// Whether an atom's value was a sequence iterated row by row.
    pub(crate) fn is_unwrapped_atom(&self) -> bool {
        self.shared.meta.lock().unwrapped_atom
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub fn status(&self) -> CursorStatus {
        if self.is_closed() {
            return CursorStatus::Closed;
        }
        let Ok(state) = self.shared.state.try_lock() else {
            return CursorStatus::Fetching;
        };
        if state.last_error.is_some() {
            CursorStatus::Errored
        } else if state.position < state.results.len() {
            CursorStatus::HasBufferedRows
        } else if state.started && !state.has_more {
            CursorStatus::Exhausted
        } else {
            CursorStatus::Fetching
        }
    }

    async fn resolve(&self, state: &mut CursorState) -> Result<()> {
        let response = match self.shared.socket.read_next(self.shared.token).await {
            Ok(response) => response,
            Err(error) => {
                if error.kind() != ErrorKind::CursorEnd {
                    state.last_error = Some(error.clone());
                }
                return Err(error);
            }
        };
        trace!(token = self.shared.token, kind = ?response.response_type, rows = response.results.len(), "Batch received");

        {
            let mut meta = self.shared.meta.lock();
            if response.profile.is_some() {
                meta.profile = response.profile.clone();
            }
            if meta.cursor_type.is_none() {
                meta.cursor_type = Some(CursorType::from_response(&response));
            }
            if response.has_note(ResponseNote::IncludesStates) {
                meta.includes_states = true;
            }
        }
        state.started = true;

        match response.response_type {
            ResponseType::SuccessAtom => {
                // An atom holding a sequence is iterated like a sequence.
                let mut results = response.results;
                if let [Value::Array(_)] = results.as_slice() {
                    if let Some(Value::Array(rows)) = results.pop() {
                        results = rows;
                        self.shared.meta.lock().unwrapped_atom = true;
                    }
                }
                state.results = results;
                state.position = 0;
                state.has_more = false;
                Ok(())
            }
            ResponseType::SuccessSequence | ResponseType::SuccessPartial => {
                state.has_more = response.response_type == ResponseType::SuccessPartial;
                state.results = response.results;
                state.position = 0;
                Ok(())
            }
            ResponseType::ClientError | ResponseType::CompileError | ResponseType::RuntimeError => {
                let error = self.server_error(response);
                state.has_more = false;
                state.last_error = Some(error.clone());
                Err(error)
            }
            other => {
                let error = Error::new(ErrorKind::UnexpectedResponse, "Unexpected return value")
                    .with_response_type(other);
                state.has_more = false;
                state.last_error = Some(error.clone());
                Err(error)
            }
        }
    }

    fn server_error(&self, response: Response) -> Error {
        let message = response
            .results
            .first()
            .and_then(Value::as_str)
            .unwrap_or("Unknown server error")
            .to_string();
        let kind = response.error_type.map(ErrorKind::from).unwrap_or(ErrorKind::Unknown);
        let mut error = Error::new(kind, message).with_response_type(response.response_type);
        if let Some(backtrace) = response.backtrace {
            error = error.with_backtrace(backtrace);
        }
        if let Some(query) = &self.shared.query {
            error = error.with_query(query.clone());
        }
        error
    }

    async fn pull(&self) -> Result<Value> {
        let mut state = self.shared.state.lock().await;
        loop {
            if self.is_closed() {
                return Err(Error::new(
                    ErrorKind::Cursor,
                    "You cannot call `next` on a closed Cursor.",
                ));
            }
            if let Some(error) = &state.last_error {
                return Err(error.clone());
            }
            if !state.started {
                self.resolve(&mut state).await?;
                continue;
            }
            if let Some(row) = state.take_row() {
                return Ok(row);
            }
            if !state.has_more {
                return Err(Error::cursor_end());
            }
            self.shared.socket.continue_query(self.shared.token)?;
            self.resolve(&mut state).await?;
        }
    }

    fn ensure_not_listening(&self, operation: &str) -> Result<()> {
        if self.shared.emitting.load(Ordering::Acquire) {
            return Err(Error::new(
                ErrorKind::Cursor,
                format!("You cannot call `{}` once you have bound listeners on the Feed.", operation),
            ));
        }
        Ok(())
    }

    /// Next row. Fails with `CursorEnd` once the result is exhausted.
    pub async fn next(&self) -> Result<Value> {
        self.ensure_not_listening("next")?;
        self.pull().await
    }

    /// Like [`Cursor::next`], with exhaustion reported as `None`.
    pub async fn try_next(&self) -> Result<Option<Value>> {
        match self.next().await {
            Ok(row) => Ok(Some(row)),
            Err(error) if error.kind() == ErrorKind::CursorEnd => Ok(None),
            Err(error) => Err(error),
        }
    }

    /// Collect every remaining row. Not available on feeds.
    pub async fn to_array(&self) -> Result<Vec<Value>> {
        self.ensure_not_listening("toArray")?;
        self.init().await?;
        if self.cursor_type().is_some_and(CursorType::is_feed) {
            return Err(Error::new(
                ErrorKind::Cursor,
                "`toArray` is not available for feeds.",
            ));
        }
        let mut rows = Vec::new();
        loop {
            match self.pull().await {
                Ok(row) => rows.push(row),
                Err(error) if error.kind() == ErrorKind::CursorEnd => return Ok(rows),
                Err(error) => return Err(error),
            }
        }
    }

    /// Call `callback` per row until it returns `false` or rows run out.
    ///
    /// `CursorEnd` and `Cancel` end the loop without an error.
    pub async fn each<F>(&self, mut callback: F) -> Result<()>
    where
        F: FnMut(Value) -> bool,
    {
        self.ensure_not_listening("each")?;
        loop {
            match self.pull().await {
                Ok(row) => {
                    if !callback(row) {
                        return Ok(());
                    }
                }
                Err(error) if error.is_termination() => return Ok(()),
                Err(error) => return Err(error),
            }
        }
    }

    /// Await `callback` per row; the first callback error stops iteration.
    pub async fn each_async<F, Fut>(&self, mut callback: F) -> Result<()>
    where
        F: FnMut(Value) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        self.ensure_not_listening("eachAsync")?;
        loop {
            match self.pull().await {
                Ok(row) => callback(row).await?,
                Err(error) if error.is_termination() => return Ok(()),
                Err(error) => return Err(error),
            }
        }
    }

    /// Rows as a stream. Ends on exhaustion; yields at most one error.
    pub fn into_stream(self) -> impl Stream<Item = Result<Value>> + Send + 'static {
        stream::unfold(Some(self), |cursor| async move {
            let cursor = cursor?;
            match cursor.next().await {
                Ok(row) => Some((Ok(row), Some(cursor))),
                Err(error) if error.is_termination() => None,
                Err(error) => Some((Err(error), None)),
            }
        })
    }

    /// Switch to push mode: rows are delivered on the returned channel.
    ///
    /// Pull methods fail afterwards. Dropping the receiver closes the cursor.
    pub fn listen(&self) -> Result<mpsc::Receiver<Result<Value>>> {
        if self.is_closed() {
            return Err(Error::new(ErrorKind::Cursor, "You cannot listen on a closed Cursor."));
        }
        if self.shared.emitting.swap(true, Ordering::AcqRel) {
            return Err(Error::new(
                ErrorKind::Cursor,
                "A listener is already bound to this Cursor.",
            ));
        }

        let (tx, rx) = mpsc::channel(LISTEN_CAPACITY);
        let cursor = self.clone();
        tokio::spawn(async move {
            loop {
                let row = tokio::select! {
                    _ = tx.closed() => {
                        cursor.close();
                        return;
                    }
                    row = cursor.pull() => row,
                };
                match row {
                    Ok(row) => {
                        if tx.send(Ok(row)).await.is_err() {
                            cursor.close();
                            return;
                        }
                    }
                    Err(error) if error.is_termination() => return,
                    Err(error) => {
                        let _ = tx.send(Err(error)).await;
                        return;
                    }
                }
            }
        });
        Ok(rx)
    }

    /// Stop the query if it is still running and mark the cursor closed.
    ///
    /// Idempotent. A fetch already in flight is resolved by the socket and
    /// its result discarded.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.shared.socket.status() == SocketStatus::Open {
            let _ = self.shared.socket.stop_query(self.shared.token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::auth::KeyDerivationCache;
    use crate::config::ServerAddress;
    use serde_json::json;

    fn detached_cursor() -> Cursor {
        let socket = Socket::new(
            ServerAddress::new("127.0.0.1", 1),
            None,
            "admin",
            "",
            Arc::new(KeyDerivationCache::default()),
        );
        Cursor::new(socket, 3, Some(json!([15, ["t"]])))
    }

    #[test]
    fn test_cursor_type_from_notes() {
        let response: Response = serde_json::from_value(json!({"t": 3, "r": [], "n": [1, 5]})).unwrap();
        assert_eq!(CursorType::from_response(&response), CursorType::Feed);
        let response: Response = serde_json::from_value(json!({"t": 1, "r": [[1, 2]]})).unwrap();
        assert_eq!(CursorType::from_response(&response), CursorType::Atom);
        let response: Response = serde_json::from_value(json!({"t": 2, "r": [1]})).unwrap();
        assert_eq!(CursorType::from_response(&response), CursorType::Cursor);
        assert!(CursorType::UnionedFeed.is_feed());
        assert!(!CursorType::Cursor.is_feed());
    }

    #[test]
    fn test_take_row_never_redelivers() {
        let mut state = CursorState {
            started: true,
            results: vec![json!(1), json!(2)],
            ..CursorState::default()
        };
        assert_eq!(state.take_row(), Some(json!(1)));
        assert_eq!(state.take_row(), Some(json!(2)));
        assert_eq!(state.take_row(), None);
    }

    #[tokio::test]
    async fn test_closed_cursor_rejects_next() {
        let cursor = detached_cursor();
        cursor.close();
        cursor.close();
        assert_eq!(cursor.status(), CursorStatus::Closed);
        assert_eq!(cursor.next().await.unwrap_err().kind(), ErrorKind::Cursor);
    }

    #[tokio::test]
    async fn test_socket_error_is_latched() {
        let cursor = detached_cursor();
        let first = cursor.next().await.unwrap_err();
        assert_eq!(first.kind(), ErrorKind::Connection);
        let second = cursor.next().await.unwrap_err();
        assert_eq!(second.kind(), ErrorKind::Connection);
        assert_eq!(cursor.status(), CursorStatus::Errored);
    }

    #[tokio::test]
    async fn test_listen_excludes_pull() {
        let cursor = detached_cursor();
        let _rx = cursor.listen().unwrap();
        assert_eq!(cursor.listen().unwrap_err().kind(), ErrorKind::Cursor);
        assert_eq!(cursor.next().await.unwrap_err().kind(), ErrorKind::Cursor);
        assert_eq!(cursor.to_array().await.unwrap_err().kind(), ErrorKind::Cursor);
    }
}
