//! Connection pooling.
//!
//! - [`ServerConnectionPool`]: connections to one server, sized between
//!   `buffer` and `max`, reconnected with exponential backoff
//! - [`MasterConnectionPool`]: one server pool per server, load-balanced,
//!   with optional changefeed-driven topology discovery

pub mod discovery;
pub mod health;
pub mod master_pool;
pub mod server_pool;

pub use master_pool::MasterConnectionPool;
pub use server_pool::{backoff_delay, PoolEvent, ServerConnectionPool};
