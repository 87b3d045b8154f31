//! PhotonDB driver shell
//!
//! Small command-line client over the driver:
//! - Run a raw ReQL term (wire JSON) and print the result, through a pool
//!   unless the config sets `pool = false`
//! - Show the identity of the connected server
//! - Follow a table changefeed
//! - Start a pool and report its size and health
//!
//! # Examples
//!
//! ```bash
//! # Count the rows of a table
//! photondb-shell query '[43,[[15,["users"]]]]'
//!
//! # Follow changes on a table
//! photondb-shell --db app watch users
//!
//! # Connect through a config file
//! photondb-shell --config driver.toml pool-status
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use photondb_driver::config::DriverConfig;
use photondb_driver::pool::PoolEvent;
use photondb_driver::{metrics, QueryRunner, RunOptions, RunResult, Term};
use tracing::{info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// PhotonDB driver shell
#[derive(Parser, Debug)]
#[command(name = "photondb-shell")]
#[command(version = photondb_driver::VERSION)]
#[command(about = "Command-line client for PhotonDB / RethinkDB servers", long_about = None)]
#[command(author = "Anton Feldmann <afeldman@lynqtech.com>")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Driver configuration file (TOML, YAML or JSON)
    #[arg(long, global = true, env = "PHOTONDB_CONFIG")]
    config: Option<PathBuf>,

    /// Server host
    #[arg(long, global = true)]
    host: Option<String>,

    /// Server port
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Default database
    #[arg(long, global = true)]
    db: Option<String>,

    /// User name
    #[arg(long, global = true)]
    user: Option<String>,

    /// Password
    #[arg(long, global = true, env = "PHOTONDB_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Log directory; logs only go to stderr when unset
    #[arg(long, global = true, env = "PHOTONDB_LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a term given as wire JSON
    Query(QueryArgs),

    /// Show the server's id and name
    ServerInfo,

    /// Follow a table's changefeed
    Watch(WatchArgs),

    /// Start a pool and report its state
    PoolStatus(PoolStatusArgs),
}

#[derive(Args, Debug)]
struct QueryArgs {
    /// Term as wire JSON, e.g. '[59,[]]'
    term: String,

    /// Do not wait for a reply
    #[arg(long)]
    noreply: bool,

    /// Print the server's profile alongside the result
    #[arg(long)]
    profile: bool,
}

#[derive(Args, Debug)]
struct WatchArgs {
    /// Table name
    table: String,

    /// Stop after this many changes
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Args, Debug)]
struct PoolStatusArgs {
    /// Seconds to observe pool events
    #[arg(long, default_value = "5")]
    seconds: u64,

    /// Print driver metrics at the end
    #[arg(long)]
    metrics: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _guard = setup_logging(&cli)?;
    metrics::init_metrics();

    let config = load_config(&cli)?;
    match cli.command {
        Commands::Query(args) => query_command(&config, args).await,
        Commands::ServerInfo => server_info_command(&config).await,
        Commands::Watch(args) => watch_command(&config, args).await,
        Commands::PoolStatus(args) => pool_status_command(&config, args).await,
    }
}

/// Stderr logging, plus a daily rolling file when a log directory is given
fn setup_logging(cli: &Cli) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let log_level = cli
        .log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::WARN);
    let filter = EnvFilter::from_default_env().add_directive(log_level.into());

    let (file_layer, guard) = match &cli.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = RollingFileAppender::new(Rotation::DAILY, dir, "photondb-shell.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    let registry = tracing_subscriber::registry().with(filter).with(file_layer);
    if cli.json_logs {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
    Ok(guard)
}

fn load_config(cli: &Cli) -> anyhow::Result<DriverConfig> {
    let mut config = DriverConfig::load(cli.config.as_deref())?;
    if cli.host.is_some() || cli.port.is_some() {
        config.host = cli.host.clone().or(config.host);
        config.port = cli.port.or(config.port);
    }
    if let Some(db) = &cli.db {
        config.db = db.clone();
    }
    if let Some(user) = &cli.user {
        config.user = user.clone();
    }
    if let Some(password) = &cli.password {
        config.password = password.clone();
    }
    Ok(config)
}

async fn query_command(config: &DriverConfig, args: QueryArgs) -> anyhow::Result<()> {
    let json: serde_json::Value = serde_json::from_str(&args.term).context("term is not valid JSON")?;
    let term = Term::from_json(json)?;
    let options = RunOptions {
        noreply: args.noreply,
        profile: args.profile,
        ..RunOptions::default()
    };

    // `pool = false` in the config runs the term over a single connection.
    if config.pool {
        let pool = photondb_driver::create_master_pool(config).await?;
        let result = match pool.run(term, options).await {
            Ok(result) => print_run_result(result).await,
            Err(error) => Err(error.into()),
        };
        pool.drain().await;
        return result;
    }

    let connection = photondb_driver::connect(config).await?;
    let result = connection.run(term, options).await?;
    let noreply = matches!(result, RunResult::NoReply);
    print_run_result(result).await?;
    if noreply {
        connection.noreply_wait().await?;
        info!("noreply query processed");
    }
    connection.close(false).await?;
    Ok(())
}

async fn print_run_result(result: RunResult) -> anyhow::Result<()> {
    match result {
        RunResult::Atom { value, profile } => print_result(value, profile)?,
        RunResult::Sequence { rows, profile } => print_result(serde_json::Value::Array(rows), profile)?,
        RunResult::Feed(cursor) => {
            while let Some(row) = cursor.try_next().await? {
                println!("{}", row);
            }
        }
        RunResult::NoReply => info!("noreply query sent"),
    }
    Ok(())
}

fn print_result(value: serde_json::Value, profile: Option<serde_json::Value>) -> anyhow::Result<()> {
    let output = match profile {
        Some(profile) => serde_json::json!({ "result": value, "profile": profile }),
        None => value,
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn server_info_command(config: &DriverConfig) -> anyhow::Result<()> {
    let connection = photondb_driver::connect(config).await?;
    let info = connection.server_info().await?;
    println!("id:    {}", info.id);
    println!("name:  {}", info.name.as_deref().unwrap_or("-"));
    println!("proxy: {}", info.proxy);
    connection.close(false).await?;
    Ok(())
}

async fn watch_command(config: &DriverConfig, args: WatchArgs) -> anyhow::Result<()> {
    let connection = photondb_driver::connect(config).await?;
    let cursor = connection
        .get_cursor(Term::changes(Term::table(&args.table)), RunOptions::default())
        .await?;
    info!(table = %args.table, "Watching changes");

    let mut seen = 0;
    while let Some(change) = cursor.try_next().await? {
        println!("{}", change);
        seen += 1;
        if args.limit.is_some_and(|limit| seen >= limit) {
            break;
        }
    }
    cursor.close();
    connection.close(false).await?;
    Ok(())
}

async fn pool_status_command(config: &DriverConfig, args: PoolStatusArgs) -> anyhow::Result<()> {
    let pool = photondb_driver::create_master_pool(config).await?;
    let mut events = pool.subscribe();

    let deadline = tokio::time::sleep(Duration::from_secs(args.seconds));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            event = events.recv() => match event {
                Ok(PoolEvent::Size(size)) => println!("size: {}", size),
                Ok(PoolEvent::AvailableSize(size)) => println!("available: {}", size),
                Ok(PoolEvent::Healthy { healthy, error }) => match error {
                    Some(error) => println!("healthy: {} ({})", healthy, error),
                    None => println!("healthy: {}", healthy),
                },
                Ok(PoolEvent::Error(error)) => warn!(error = %error, "Pool error"),
                Ok(_) => {}
                Err(_) => break,
            },
        }
    }

    println!("servers:     {}", pool.get_pools().len());
    println!("connections: {}", pool.get_length());
    println!("available:   {}", pool.get_available_length());
    println!("healthy:     {}", pool.is_healthy());
    if args.metrics {
        print!("{}", metrics::export_metrics());
    }
    pool.drain().await;
    Ok(())
}
