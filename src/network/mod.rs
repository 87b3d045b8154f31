//! Client side of the wire protocol.
//!
//! ## Protocol Flow
//!
//! 1. **Handshake**: V1_0 magic plus a JSON hello, then a SCRAM-SHA-256
//!    exchange in NUL-terminated JSON messages
//! 2. **Query/Response Loop**: token-tagged, length-prefixed JSON frames,
//!    multiplexed over one stream
//!
//! ## Layers
//!
//! - [`transport`]: TCP or TLS byte stream
//! - [`protocol`]: handshake buffers and query framing
//! - [`auth`]: SCRAM computations and the key-derivation cache
//! - [`socket`]: token table, reader and writer tasks
//! - [`connection`]: reconnect, keep-alive and query entry point

pub mod auth;
pub mod connection;
pub mod protocol;
pub mod socket;
pub mod transport;

pub use auth::KeyDerivationCache;
pub use connection::{Connection, ConnectionEvent};
pub use protocol::{QueryEnvelope, VERSION_V1_0};
pub use socket::{Socket, SocketEvent, SocketStatus};
