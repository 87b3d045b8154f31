//! Client side of the wire protocol.
//!
//! Two framings share one stream:
//!
//! - **Handshake**: NUL-terminated JSON messages, starting with the 4-byte
//!   little-endian `V1_0` magic in front of the first client message.
//! - **Queries**: `token (u64 as two LE u32 halves, low first) | length (LE u32) | JSON`
//!   in both directions.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde_json::{json, Map, Value};

use super::auth;
use crate::error::{Error, ErrorKind, Result};
use crate::reql::{QueryType, Response, Term};

/// V1_0 protocol magic, sent first on every connection
pub const VERSION_V1_0: u32 = 0x34c2_bdc3;

/// Sub-protocol version sent in the client hello.
pub const PROTOCOL_VERSION: i64 = 0;

pub const AUTHENTICATION_METHOD: &str = "SCRAM-SHA-256";

/// Frame header: token (8 bytes) + payload length (4 bytes).
pub const HEADER_SIZE: usize = 12;

/// Size limit for a single response payload
pub const MAX_MESSAGE_SIZE: u32 = 256 * 1024 * 1024; // 256 MB

/// First handshake buffer and the client nonce it carries.
pub fn build_auth_buffer(user: &str) -> (Bytes, String) {
    let nonce = auth::generate_nonce();
    let hello = json!({
        "protocol_version": PROTOCOL_VERSION,
        "authentication_method": AUTHENTICATION_METHOD,
        "authentication": auth::client_first_message(user, &nonce),
    });
    let body = hello.to_string();

    let mut buf = BytesMut::with_capacity(4 + body.len() + 1);
    buf.put_u32_le(VERSION_V1_0);
    buf.put_slice(body.as_bytes());
    buf.put_u8(0);
    (buf.freeze(), nonce)
}

/// `{"authentication": "<client final>"}` followed by NUL.
pub fn client_final_buffer(client_final: &str) -> Bytes {
    let body = json!({ "authentication": client_final }).to_string();
    let mut buf = BytesMut::with_capacity(body.len() + 1);
    buf.put_slice(body.as_bytes());
    buf.put_u8(0);
    buf.freeze()
}

/// Check the server hello's supported protocol range includes ours.
pub fn validate_version(hello: &Value) -> Result<()> {
    let min = hello.get("min_protocol_version").and_then(Value::as_i64);
    let max = hello.get("max_protocol_version").and_then(Value::as_i64);
    let (Some(min), Some(max)) = (min, max) else {
        return Err(Error::new(
            ErrorKind::UnsupportedProtocol,
            format!("Server hello is missing its protocol range: {}", hello),
        ));
    };
    if min > PROTOCOL_VERSION || max < PROTOCOL_VERSION {
        return Err(Error::new(
            ErrorKind::UnsupportedProtocol,
            format!(
                "Unsupported protocol version {}, expected between {} and {}",
                PROTOCOL_VERSION, min, max
            ),
        ));
    }
    Ok(())
}

/// Pop one NUL-terminated handshake message, without the terminator.
pub fn split_handshake_message(buf: &mut BytesMut) -> Option<Bytes> {
    let end = buf.iter().position(|b| *b == 0)?;
    let message = buf.split_to(end).freeze();
    buf.advance(1);
    Some(message)
}

/// `[kind, term?, optargs?]`
#[derive(Debug, Clone, PartialEq)]
pub struct QueryEnvelope {
    pub kind: QueryType,
    pub term: Option<Term>,
    pub optargs: Map<String, Value>,
}

impl QueryEnvelope {
    pub fn start(term: Term, optargs: Map<String, Value>) -> Self {
        Self {
            kind: QueryType::Start,
            term: Some(term),
            optargs,
        }
    }

    pub fn control(kind: QueryType) -> Self {
        Self {
            kind,
            term: None,
            optargs: Map::new(),
        }
    }

    pub fn is_noreply(&self) -> bool {
        self.optargs.get("noreply").and_then(Value::as_bool) == Some(true)
    }

    pub fn to_json(&self) -> Value {
        let mut encoded = vec![Value::from(self.kind.code())];
        if let Some(term) = &self.term {
            encoded.push(term.to_json());
            if !self.optargs.is_empty() {
                encoded.push(Value::Object(self.optargs.clone()));
            }
        }
        Value::Array(encoded)
    }
}

/// Encode a query frame.
pub fn encode_query(token: u64, envelope: &QueryEnvelope) -> Result<Bytes> {
    let payload = serde_json::to_vec(&envelope.to_json())?;
    let len = u32::try_from(payload.len())
        .map_err(|_| Error::connection(format!("Query too large: {} bytes", payload.len())))?;

    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    buf.put_u32_le((token & 0xffff_ffff) as u32);
    buf.put_u32_le((token >> 32) as u32);
    buf.put_u32_le(len);
    buf.put_slice(&payload);
    Ok(buf.freeze())
}

/// Decode one response frame if a complete one is buffered.
///
/// Leaves `buf` untouched when the frame is incomplete.
pub fn decode_frame(buf: &mut BytesMut) -> Result<Option<(u64, Response)>> {
    if buf.len() < HEADER_SIZE {
        return Ok(None);
    }
    let mut header = &buf[..HEADER_SIZE];
    let low = u64::from(header.get_u32_le());
    let high = u64::from(header.get_u32_le());
    let len = header.get_u32_le();

    if len > MAX_MESSAGE_SIZE {
        return Err(Error::connection(format!(
            "Response too large: {} bytes (max: {})",
            len, MAX_MESSAGE_SIZE
        )));
    }
    let len = len as usize;
    if buf.len() < HEADER_SIZE + len {
        return Ok(None);
    }

    buf.advance(HEADER_SIZE);
    let payload = buf.split_to(len);
    let response: Response = serde_json::from_slice(&payload)
        .map_err(|e| Error::new(ErrorKind::Parse, format!("Malformed response frame: {}", e)).with_cause(e))?;
    Ok(Some(((high << 32) | low, response)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reql::ResponseType;

    fn response_frame(token: u64, body: &Value) -> BytesMut {
        let payload = serde_json::to_vec(body).unwrap();
        let mut buf = BytesMut::new();
        buf.put_u32_le((token & 0xffff_ffff) as u32);
        buf.put_u32_le((token >> 32) as u32);
        buf.put_u32_le(payload.len() as u32);
        buf.put_slice(&payload);
        buf
    }

    #[test]
    fn test_auth_buffer_layout() {
        let (buf, nonce) = build_auth_buffer("admin");
        assert_eq!(&buf[..4], &VERSION_V1_0.to_le_bytes());
        assert_eq!(buf[buf.len() - 1], 0);

        let hello: Value = serde_json::from_slice(&buf[4..buf.len() - 1]).unwrap();
        assert_eq!(hello["protocol_version"], 0);
        assert_eq!(hello["authentication_method"], "SCRAM-SHA-256");
        assert_eq!(hello["authentication"], format!("n,,n=admin,r={}", nonce));
    }

    #[test]
    fn test_validate_version() {
        assert!(validate_version(&json!({"min_protocol_version": 0, "max_protocol_version": 0})).is_ok());
        let err = validate_version(&json!({"min_protocol_version": 1, "max_protocol_version": 2})).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedProtocol);
        let err = validate_version(&json!({"success": true})).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedProtocol);
    }

    #[test]
    fn test_query_frame_layout() {
        let token = (7u64 << 32) | 5;
        let envelope = QueryEnvelope::start(Term::datum(1), Map::new());
        let frame = encode_query(token, &envelope).unwrap();

        let mut header = &frame[..HEADER_SIZE];
        assert_eq!(header.get_u32_le(), 5);
        assert_eq!(header.get_u32_le(), 7);
        let len = header.get_u32_le() as usize;
        assert_eq!(len, frame.len() - HEADER_SIZE);
        assert_eq!(&frame[HEADER_SIZE..], b"[1,1]");
    }

    #[test]
    fn test_control_envelopes_carry_no_term() {
        assert_eq!(QueryEnvelope::control(QueryType::Continue).to_json(), json!([2]));
        let mut optargs = Map::new();
        optargs.insert("noreply".into(), Value::Bool(true));
        let envelope = QueryEnvelope::start(Term::table("t"), optargs);
        assert!(envelope.is_noreply());
        assert_eq!(envelope.to_json(), json!([1, [15, ["t"]], {"noreply": true}]));
    }

    #[test]
    fn test_decode_waits_for_complete_frame() {
        let full = response_frame(3, &json!({"t": 1, "r": [42]}));
        let mut partial = BytesMut::from(&full[..full.len() - 2]);
        assert!(decode_frame(&mut partial).unwrap().is_none());
        assert_eq!(partial.len(), full.len() - 2);

        let mut buf = full.clone();
        buf.extend_from_slice(&response_frame(1 << 33, &json!({"t": 2, "r": []})));

        let (token, response) = decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(token, 3);
        assert_eq!(response.response_type, ResponseType::SuccessAtom);
        let (token, response) = decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(token, 1 << 33);
        assert_eq!(response.response_type, ResponseType::SuccessSequence);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let mut buf = response_frame(1, &json!("not a response"));
        assert_eq!(decode_frame(&mut buf).unwrap_err().kind(), ErrorKind::Parse);
    }

    #[test]
    fn test_split_handshake_messages() {
        let mut buf = BytesMut::from(&b"{\"a\":1}\0{\"b\""[..]);
        assert_eq!(split_handshake_message(&mut buf).unwrap(), Bytes::from_static(b"{\"a\":1}"));
        assert!(split_handshake_message(&mut buf).is_none());
        buf.extend_from_slice(b":2}\0");
        assert_eq!(split_handshake_message(&mut buf).unwrap(), Bytes::from_static(b"{\"b\":2}"));
        assert!(buf.is_empty());
    }
}
