//! Driver configuration.
//!
//! Runtime option structs ([`ConnectionOptions`], [`PoolOptions`]) carry typed
//! values and are what the connection and pool constructors take.
//! [`DriverConfig`] is the loadable surface: the recognised camelCase keys,
//! read from a file and `PHOTONDB_*` environment variables.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::network::auth::KeyDerivationCache;

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 28015;
pub const DEFAULT_DB: &str = "test";
pub const DEFAULT_USER: &str = "admin";
pub const DEFAULT_TIMEOUT_SECS: u64 = 20;
pub const DEFAULT_TIMEOUT_ERROR_MS: u64 = 1000;
pub const DEFAULT_TIMEOUT_GB_MS: u64 = 60 * 60 * 1000;
pub const DEFAULT_MAX_EXPONENT: u32 = 6;

/// Host and port of one server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerAddress {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

impl ServerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl Default for ServerAddress {
    fn default() -> Self {
        Self::new(DEFAULT_HOST, DEFAULT_PORT)
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// TLS settings for the transport.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsOptions {
    /// Extra PEM trust anchors on top of the bundled web roots.
    pub ca_file: Option<PathBuf>,
    /// SNI / verification name; defaults to the server host.
    pub server_name: Option<String>,
}

/// Callback receiving every error the driver reports.
#[derive(Clone)]
pub struct LogHook(Arc<dyn Fn(&str) + Send + Sync>);

impl LogHook {
    pub fn new(hook: impl Fn(&str) + Send + Sync + 'static) -> Self {
        Self(Arc::new(hook))
    }

    pub fn call(&self, message: &str) {
        (self.0)(message)
    }
}

impl fmt::Debug for LogHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LogHook")
    }
}

/// Options shared by every connection to one server.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub tls: Option<TlsOptions>,
    pub db: String,
    pub user: String,
    pub password: String,
    /// Connect timeout.
    pub timeout: Duration,
    /// Keep-alive ping period; `None` disables pinging.
    pub ping_interval: Option<Duration>,
    pub silent: bool,
    pub log: Option<LogHook>,
    pub key_cache: Arc<KeyDerivationCache>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            tls: None,
            db: DEFAULT_DB.to_string(),
            user: DEFAULT_USER.to_string(),
            password: String::new(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            ping_interval: None,
            silent: false,
            log: None,
            key_cache: Arc::new(KeyDerivationCache::default()),
        }
    }
}

/// Sizing and retry behaviour of a pool.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolOptions {
    /// Connections kept open even when idle.
    pub buffer: usize,
    /// Hard cap on connections.
    pub max: usize,
    /// Base delay between reconnect attempts.
    pub timeout_error: Duration,
    /// Idle time before a surplus connection is closed.
    pub timeout_gb: Duration,
    pub max_exponent: u32,
    pub discovery: bool,
    pub wait_for_healthy: bool,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            buffer: 1,
            max: 1,
            timeout_error: Duration::from_millis(DEFAULT_TIMEOUT_ERROR_MS),
            timeout_gb: Duration::from_millis(DEFAULT_TIMEOUT_GB_MS),
            max_exponent: DEFAULT_MAX_EXPONENT,
            discovery: false,
            wait_for_healthy: true,
        }
    }
}

/// Partial update for [`PoolOptions`]; `None` keeps the current value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoolOptionsUpdate {
    pub buffer: Option<usize>,
    pub max: Option<usize>,
    pub timeout_error: Option<Duration>,
    pub timeout_gb: Option<Duration>,
    pub max_exponent: Option<u32>,
    pub silent: Option<bool>,
    pub discovery: Option<bool>,
}

/// Loadable driver configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DriverConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub servers: Option<Vec<ServerAddress>>,
    pub tls: bool,
    #[serde(alias = "cafile")]
    pub ca_file: Option<PathBuf>,
    pub db: String,
    pub user: String,
    pub password: String,
    /// Seconds.
    pub timeout: u64,
    /// Milliseconds; zero or negative disables pinging.
    #[serde(alias = "pinginterval")]
    pub ping_interval: i64,
    pub silent: bool,
    /// Run shell queries through a master pool rather than a single connection.
    pub pool: bool,
    pub buffer: Option<usize>,
    pub max: Option<usize>,
    /// Milliseconds.
    #[serde(alias = "timeouterror")]
    pub timeout_error: u64,
    /// Milliseconds.
    #[serde(alias = "timeoutgb")]
    pub timeout_gb: u64,
    #[serde(alias = "maxexponent")]
    pub max_exponent: u32,
    pub discovery: bool,
    #[serde(alias = "waitforhealthy")]
    pub wait_for_healthy: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: None,
            servers: None,
            tls: false,
            ca_file: None,
            db: DEFAULT_DB.to_string(),
            user: DEFAULT_USER.to_string(),
            password: String::new(),
            timeout: DEFAULT_TIMEOUT_SECS,
            ping_interval: -1,
            silent: false,
            pool: true,
            buffer: None,
            max: None,
            timeout_error: DEFAULT_TIMEOUT_ERROR_MS,
            timeout_gb: DEFAULT_TIMEOUT_GB_MS,
            max_exponent: DEFAULT_MAX_EXPONENT,
            discovery: false,
            wait_for_healthy: true,
        }
    }
}

impl DriverConfig {
    /// Load from an optional file plus `PHOTONDB_*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(config::Environment::with_prefix("PHOTONDB").try_parsing(true));

        let settings = builder
            .build()
            .map_err(|e| Error::config(format!("Failed to load configuration: {}", e)).with_cause(e))?;
        settings
            .try_deserialize()
            .map_err(|e| Error::config(format!("Invalid configuration: {}", e)).with_cause(e))
    }

    pub fn from_toml_str(input: &str) -> Result<Self> {
        toml::from_str(input)
            .map_err(|e| Error::config(format!("Invalid configuration: {}", e)).with_cause(e))
    }

    /// Resolve the server list.
    ///
    /// `host`/`port` and `servers` are mutually exclusive, and an explicit
    /// `servers` list must not be empty.
    pub fn servers(&self) -> Result<Vec<ServerAddress>> {
        match &self.servers {
            Some(_) if self.host.is_some() || self.port.is_some() => Err(Error::api(
                "If `host` or `port` are defined `server` must not be.",
            )),
            Some(servers) if servers.is_empty() => {
                Err(Error::api("If `servers` is an array, it must contain at least one server."))
            }
            Some(servers) => Ok(servers.clone()),
            None => Ok(vec![ServerAddress::new(
                self.host.clone().unwrap_or_else(|| DEFAULT_HOST.to_string()),
                self.port.unwrap_or(DEFAULT_PORT),
            )]),
        }
    }

    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            tls: self.tls.then(|| TlsOptions {
                ca_file: self.ca_file.clone(),
                server_name: None,
            }),
            db: self.db.clone(),
            user: self.user.clone(),
            password: self.password.clone(),
            timeout: Duration::from_secs(self.timeout),
            ping_interval: u64::try_from(self.ping_interval)
                .ok()
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis),
            silent: self.silent,
            ..ConnectionOptions::default()
        }
    }

    /// Pool options; `buffer` and `max` default to the number of servers.
    pub fn pool_options(&self, server_count: usize) -> PoolOptions {
        PoolOptions {
            buffer: self.buffer.unwrap_or(server_count),
            max: self.max.unwrap_or(server_count),
            timeout_error: Duration::from_millis(self.timeout_error),
            timeout_gb: Duration::from_millis(self.timeout_gb),
            max_exponent: self.max_exponent,
            discovery: self.discovery,
            wait_for_healthy: self.wait_for_healthy,
        }
    }
}
