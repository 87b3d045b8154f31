//! Driver error types.
//!
//! Every failure surfaced by the driver is an [`Error`]: a rendered message
//! plus a stable [`ErrorKind`] tag. Errors are `Clone` because one transport
//! failure fans out to every pending reader of a socket and is also latched
//! as the socket's last error.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use crate::reql::{ErrorType, ResponseType};

/// Stable classification of driver errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Connection,
    Timeout,
    Auth,
    UnsupportedProtocol,
    Cancel,
    CursorEnd,
    Cursor,
    PoolFail,
    MasterPoolFail,
    ApiFail,
    UnexpectedResponse,
    Parse,
    Config,
    // Server-reported runtime errors
    Internal,
    NonExistence,
    OpFailed,
    OpIndeterminate,
    PermissionError,
    QueryLogic,
    ResourceLimit,
    User,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Connection => "CONNECTION",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Auth => "AUTH",
            ErrorKind::UnsupportedProtocol => "UNSUPPORTED_PROTOCOL",
            ErrorKind::Cancel => "CANCEL",
            ErrorKind::CursorEnd => "CURSOR_END",
            ErrorKind::Cursor => "CURSOR",
            ErrorKind::PoolFail => "POOL_FAIL",
            ErrorKind::MasterPoolFail => "MASTER_POOL_FAIL",
            ErrorKind::ApiFail => "API_FAIL",
            ErrorKind::UnexpectedResponse => "UNEXPECTED_RESPONSE",
            ErrorKind::Parse => "PARSE",
            ErrorKind::Config => "CONFIG",
            ErrorKind::Internal => "INTERNAL",
            ErrorKind::NonExistence => "NON_EXISTENCE",
            ErrorKind::OpFailed => "OP_FAILED",
            ErrorKind::OpIndeterminate => "OP_INDETERMINATE",
            ErrorKind::PermissionError => "PERMISSION_ERROR",
            ErrorKind::QueryLogic => "QUERY_LOGIC",
            ErrorKind::ResourceLimit => "RESOURCE_LIMIT",
            ErrorKind::User => "USER",
            ErrorKind::Unknown => "UNKNOWN",
        }
    }

    /// Conventional error class name, as other drivers report it.
    pub fn class_name(self) -> &'static str {
        match self {
            ErrorKind::Auth => "ReqlAuthError",
            ErrorKind::Timeout => "ReqlTimeoutError",
            ErrorKind::Connection | ErrorKind::UnsupportedProtocol => "ReqlServerError",
            ErrorKind::Internal => "ReqlInternalError",
            ErrorKind::ResourceLimit => "ReqlResourceLimitError",
            ErrorKind::QueryLogic => "ReqlQueryLogicError",
            ErrorKind::NonExistence => "ReqlNonExistenceError",
            ErrorKind::OpFailed => "ReqlOpFailedError",
            ErrorKind::OpIndeterminate => "ReqlOpIndeterminateError",
            ErrorKind::User => "ReqlUserError",
            ErrorKind::PermissionError => "ReqlPermissionError",
            ErrorKind::Unknown => "ReqlUnknownError",
            _ => "ReqlDriverError",
        }
    }
}

impl From<ErrorType> for ErrorKind {
    fn from(error_type: ErrorType) -> Self {
        match error_type {
            ErrorType::Internal => ErrorKind::Internal,
            ErrorType::ResourceLimit => ErrorKind::ResourceLimit,
            ErrorType::QueryLogic => ErrorKind::QueryLogic,
            ErrorType::NonExistence => ErrorKind::NonExistence,
            ErrorType::OpFailed => ErrorKind::OpFailed,
            ErrorType::OpIndeterminate => ErrorKind::OpIndeterminate,
            ErrorType::User => ErrorKind::User,
            ErrorType::PermissionError => ErrorKind::PermissionError,
            ErrorType::Other(_) => ErrorKind::Unknown,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type Cause = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// A driver error.
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct Error {
    kind: ErrorKind,
    message: String,
    query: Option<Value>,
    backtrace: Option<Vec<Value>>,
    response_type: Option<ResponseType>,
    error_code: Option<i64>,
    #[source]
    cause: Option<Cause>,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            query: None,
            backtrace: None,
            response_type: None,
            error_code: None,
            cause: None,
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Connection, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Auth, message)
    }

    pub fn api(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ApiFail, message)
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config, message)
    }

    /// The socket went away while the request was outstanding.
    pub fn closed() -> Self {
        Self::connection("The connection was closed before the query could be completed.")
    }

    pub fn cursor_end() -> Self {
        Self::new(ErrorKind::CursorEnd, "No more rows in the cursor.")
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancel, "Query cancelled.")
    }

    /// Attach the offending query; the message gains an ` in:` suffix.
    pub fn with_query(mut self, query: Value) -> Self {
        let rendered = serde_json::to_string(&query).unwrap_or_default();
        let base = self.message.strip_suffix('.').unwrap_or(&self.message);
        self.message = format!("{} in:\n{}", base, rendered);
        self.query = Some(query);
        self
    }

    pub fn with_backtrace(mut self, backtrace: Vec<Value>) -> Self {
        self.backtrace = Some(backtrace);
        self
    }

    pub fn with_response_type(mut self, response_type: ResponseType) -> Self {
        self.response_type = Some(response_type);
        self
    }

    pub fn with_error_code(mut self, code: i64) -> Self {
        self.error_code = Some(code);
        self
    }

    pub fn with_cause<E>(mut self, cause: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.cause = Some(Arc::new(cause));
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn query(&self) -> Option<&Value> {
        self.query.as_ref()
    }

    pub fn backtrace(&self) -> Option<&[Value]> {
        self.backtrace.as_deref()
    }

    pub fn response_type(&self) -> Option<ResponseType> {
        self.response_type
    }

    pub fn error_code(&self) -> Option<i64> {
        self.error_code
    }

    pub fn class_name(&self) -> &'static str {
        self.kind.class_name()
    }

    /// `CursorEnd` and `Cancel` end iteration normally.
    pub fn is_termination(&self) -> bool {
        matches!(self.kind, ErrorKind::CursorEnd | ErrorKind::Cancel)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::connection(err.to_string()).with_cause(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::new(ErrorKind::Parse, err.to_string()).with_cause(err)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
