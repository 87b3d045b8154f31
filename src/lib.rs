// PhotonDB - Rust client driver
// Connections, cursors and pools for the RethinkDB wire protocol

#![warn(rust_2018_idioms)]

pub mod client;
pub mod config;
pub mod cursor;
pub mod error;
pub mod metrics;
pub mod network;
pub mod pool;
pub mod reql;
pub mod runner;

// Re-exports for convenience
pub use client::{connect, create_master_pool};
pub use config::{ConnectionOptions, DriverConfig, PoolOptions, PoolOptionsUpdate, ServerAddress};
pub use cursor::{Cursor, CursorStatus, CursorType};
pub use error::{Error, ErrorKind, Result};
pub use network::{Connection, ConnectionEvent};
pub use pool::{MasterConnectionPool, PoolEvent, ServerConnectionPool};
pub use reql::{RunOptions, Term};
pub use runner::{QueryRunner, RunResult};

/// Driver version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
