//! Entry points building a connection or a pool from [`DriverConfig`].

use tracing::error;

use crate::config::DriverConfig;
use crate::error::Result;
use crate::network::connection::Connection;
use crate::pool::MasterConnectionPool;

/// Open a single connection to the configured server.
///
/// With a `servers` list, the first entry is used.
pub async fn connect(config: &DriverConfig) -> Result<Connection> {
    let servers = config.servers()?;
    let server = servers.into_iter().next().unwrap_or_default();
    Connection::connect(server, config.connection_options()).await
}

/// Build a master pool over the configured servers and start filling it.
///
/// Waits for the first healthy server unless `waitForHealthy` is off.
pub async fn create_master_pool(config: &DriverConfig) -> Result<MasterConnectionPool> {
    let servers = config.servers()?;
    let options = config.pool_options(servers.len());
    let wait_for_healthy = options.wait_for_healthy;
    let pool = MasterConnectionPool::new(servers, config.connection_options(), options);

    let health = pool.wait_for_healthy();
    let init = pool.clone();
    tokio::spawn(async move {
        init.init_servers().await;
    });
    if wait_for_healthy {
        if let Err(e) = health.await {
            error!(error = %e, "Master pool did not become healthy");
            return Err(e);
        }
    }
    Ok(pool)
}
