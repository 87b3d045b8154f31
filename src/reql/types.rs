//! ReQL wire enumerations and the response envelope.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Query envelope kind (first element of `[kind, term?, optargs?]`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryType {
    Start = 1,
    Continue = 2,
    Stop = 3,
    NoreplyWait = 4,
    ServerInfo = 5,
}

impl QueryType {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn name(self) -> &'static str {
        match self {
            QueryType::Start => "START",
            QueryType::Continue => "CONTINUE",
            QueryType::Stop => "STOP",
            QueryType::NoreplyWait => "NOREPLY_WAIT",
            QueryType::ServerInfo => "SERVER_INFO",
        }
    }
}

/// Response `t` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u32", into = "u32")]
pub enum ResponseType {
    SuccessAtom,
    SuccessSequence,
    SuccessPartial,
    WaitComplete,
    ServerInfo,
    ClientError,
    CompileError,
    RuntimeError,
    Other(u32),
}

impl ResponseType {
    pub fn is_error(self) -> bool {
        matches!(
            self,
            ResponseType::ClientError | ResponseType::CompileError | ResponseType::RuntimeError
        )
    }
}

impl From<u32> for ResponseType {
    fn from(code: u32) -> Self {
        match code {
            1 => ResponseType::SuccessAtom,
            2 => ResponseType::SuccessSequence,
            3 => ResponseType::SuccessPartial,
            4 => ResponseType::WaitComplete,
            5 => ResponseType::ServerInfo,
            16 => ResponseType::ClientError,
            17 => ResponseType::CompileError,
            18 => ResponseType::RuntimeError,
            other => ResponseType::Other(other),
        }
    }
}

impl From<ResponseType> for u32 {
    fn from(t: ResponseType) -> Self {
        match t {
            ResponseType::SuccessAtom => 1,
            ResponseType::SuccessSequence => 2,
            ResponseType::SuccessPartial => 3,
            ResponseType::WaitComplete => 4,
            ResponseType::ServerInfo => 5,
            ResponseType::ClientError => 16,
            ResponseType::CompileError => 17,
            ResponseType::RuntimeError => 18,
            ResponseType::Other(code) => code,
        }
    }
}

/// Response `n` notes describing feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u32", into = "u32")]
pub enum ResponseNote {
    SequenceFeed,
    AtomFeed,
    OrderByLimitFeed,
    UnionedFeed,
    IncludesStates,
    Other(u32),
}

impl From<u32> for ResponseNote {
    fn from(code: u32) -> Self {
        match code {
            1 => ResponseNote::SequenceFeed,
            2 => ResponseNote::AtomFeed,
            3 => ResponseNote::OrderByLimitFeed,
            4 => ResponseNote::UnionedFeed,
            5 => ResponseNote::IncludesStates,
            other => ResponseNote::Other(other),
        }
    }
}

impl From<ResponseNote> for u32 {
    fn from(note: ResponseNote) -> Self {
        match note {
            ResponseNote::SequenceFeed => 1,
            ResponseNote::AtomFeed => 2,
            ResponseNote::OrderByLimitFeed => 3,
            ResponseNote::UnionedFeed => 4,
            ResponseNote::IncludesStates => 5,
            ResponseNote::Other(code) => code,
        }
    }
}

/// Response `e` field of runtime errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u64", into = "u64")]
pub enum ErrorType {
    Internal,
    ResourceLimit,
    QueryLogic,
    NonExistence,
    OpFailed,
    OpIndeterminate,
    User,
    PermissionError,
    Other(u64),
}

impl From<u64> for ErrorType {
    fn from(code: u64) -> Self {
        match code {
            1_000_000 => ErrorType::Internal,
            2_000_000 => ErrorType::ResourceLimit,
            3_000_000 => ErrorType::QueryLogic,
            3_100_000 => ErrorType::NonExistence,
            4_100_000 => ErrorType::OpFailed,
            4_200_000 => ErrorType::OpIndeterminate,
            5_000_000 => ErrorType::User,
            6_000_000 => ErrorType::PermissionError,
            other => ErrorType::Other(other),
        }
    }
}

impl From<ErrorType> for u64 {
    fn from(e: ErrorType) -> Self {
        match e {
            ErrorType::Internal => 1_000_000,
            ErrorType::ResourceLimit => 2_000_000,
            ErrorType::QueryLogic => 3_000_000,
            ErrorType::NonExistence => 3_100_000,
            ErrorType::OpFailed => 4_100_000,
            ErrorType::OpIndeterminate => 4_200_000,
            ErrorType::User => 5_000_000,
            ErrorType::PermissionError => 6_000_000,
            ErrorType::Other(code) => code,
        }
    }
}

/// A decoded server response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(rename = "t")]
    pub response_type: ResponseType,
    #[serde(rename = "r", default)]
    pub results: Vec<Value>,
    #[serde(rename = "n", default)]
    pub notes: Vec<ResponseNote>,
    #[serde(rename = "e", default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<ErrorType>,
    #[serde(rename = "p", default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<Value>,
    #[serde(rename = "b", default, skip_serializing_if = "Option::is_none")]
    pub backtrace: Option<Vec<Value>>,
}

impl Response {
    pub fn has_note(&self, note: ResponseNote) -> bool {
        self.notes.contains(&note)
    }
}

/// Payload of a `SERVER_INFO` reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub id: String,
    pub name: Option<String>,
    #[serde(default)]
    pub proxy: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_response_decoding() {
        let response: Response = serde_json::from_value(json!({
            "t": 18,
            "e": 5_000_000,
            "r": ["ping"],
            "b": []
        }))
        .unwrap();

        assert_eq!(response.response_type, ResponseType::RuntimeError);
        assert_eq!(response.error_type, Some(ErrorType::User));
        assert_eq!(response.results, vec![json!("ping")]);
        assert!(response.notes.is_empty());
    }

    #[test]
    fn test_unknown_codes_are_preserved() {
        let response: Response = serde_json::from_value(json!({"t": 99, "n": [1, 7]})).unwrap();
        assert_eq!(response.response_type, ResponseType::Other(99));
        assert!(response.has_note(ResponseNote::SequenceFeed));
        assert_eq!(response.notes[1], ResponseNote::Other(7));
    }

    #[test]
    fn test_query_type_codes() {
        assert_eq!(QueryType::Start.code(), 1);
        assert_eq!(QueryType::ServerInfo.code(), 5);
        assert_eq!(QueryType::NoreplyWait.name(), "NOREPLY_WAIT");
    }
}
