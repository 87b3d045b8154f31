//! Common query entry point for connections and pools.

use async_trait::async_trait;
use serde_json::Value;

use crate::cursor::{Cursor, CursorType};
use crate::error::{Error, ErrorKind, Result};
use crate::network::connection::Connection;
use crate::reql::{RunOptions, Term};

/// Outcome of [`QueryRunner::run`].
#[derive(Debug)]
pub enum RunResult {
    /// A single value.
    Atom { value: Value, profile: Option<Value> },
    /// A finite sequence, fully collected.
    Sequence { rows: Vec<Value>, profile: Option<Value> },
    /// A changefeed; iterate the cursor.
    Feed(Cursor),
    /// The query was sent with `noreply`.
    NoReply,
}

impl RunResult {
    /// Drain `cursor` unless it is a feed.
    pub async fn from_cursor(cursor: Cursor) -> Result<Self> {
        cursor.init().await?;
        match cursor.cursor_type() {
            Some(kind) if kind.is_feed() => Ok(RunResult::Feed(cursor)),
            Some(CursorType::Atom) => {
                let profile = cursor.profile();
                let mut rows = cursor.to_array().await?;
                let value = if cursor.is_unwrapped_atom() {
                    Value::Array(rows)
                } else {
                    rows.pop().unwrap_or(Value::Null)
                };
                Ok(RunResult::Atom { value, profile })
            }
            _ => {
                let rows = cursor.to_array().await?;
                Ok(RunResult::Sequence {
                    rows,
                    profile: cursor.profile(),
                })
            }
        }
    }

    /// The collected value; feeds and `noreply` yield `None`.
    pub fn into_value(self) -> Option<Value> {
        match self {
            RunResult::Atom { value, .. } => Some(value),
            RunResult::Sequence { rows, .. } => Some(Value::Array(rows)),
            RunResult::Feed(_) | RunResult::NoReply => None,
        }
    }
}

/// Anything that can start a query: a connection or a pool.
#[async_trait]
pub trait QueryRunner: Send + Sync {
    /// Send a START query. `None` when `options.noreply` is set.
    async fn queue(&self, term: Term, options: RunOptions) -> Result<Option<Cursor>>;

    /// Run a query and collect its result.
    async fn run(&self, term: Term, options: RunOptions) -> Result<RunResult> {
        match self.queue(term, options).await? {
            Some(cursor) => RunResult::from_cursor(cursor).await,
            None => Ok(RunResult::NoReply),
        }
    }

    /// Run a query and return its cursor with the first batch fetched.
    async fn get_cursor(&self, term: Term, options: RunOptions) -> Result<Cursor> {
        if options.noreply {
            return Err(Error::new(
                ErrorKind::ApiFail,
                "`get_cursor` cannot be used with `noreply`.",
            ));
        }
        let cursor = self
            .queue(term, options)
            .await?
            .ok_or_else(|| Error::api("The query did not return a cursor."))?;
        cursor.init().await?;
        Ok(cursor)
    }
}

#[async_trait]
impl QueryRunner for Connection {
    async fn queue(&self, term: Term, options: RunOptions) -> Result<Option<Cursor>> {
        self.query(term, options).await
    }
}
