//! pg-dts server - online PostgreSQL data transfer service.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use pg_dts::{Config, DtsError, DtsService, PgTaskStore};
use tokio_postgres::NoTls;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// How often terminal tasks are swept out of the live-task map.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Parser)]
#[command(name = "pg-dts-server")]
#[command(about = "Online PostgreSQL data transfer service")]
#[command(version)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, env = "DTS_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address (overrides config file)
    #[arg(long, env = "DTS_HOST")]
    host: Option<String>,

    /// Listen port (overrides config file)
    #[arg(long, env = "DTS_PORT")]
    port: Option<u16>,

    /// Log level: debug, info, warn, error (overrides config file)
    #[arg(long, env = "DTS_LOG_LEVEL")]
    log_level: Option<String>,

    /// Log format: json or text (overrides config file)
    #[arg(long, env = "DTS_LOG_FORMAT")]
    log_format: Option<String>,

    /// Log output: stdout or stderr (overrides config file)
    #[arg(long, env = "DTS_LOG_OUTPUT")]
    log_output: Option<String>,

    /// Metadata database host (overrides config file)
    #[arg(long)]
    db_host: Option<String>,

    /// Metadata database port (overrides config file)
    #[arg(long)]
    db_port: Option<u16>,

    /// Metadata database user (overrides config file)
    #[arg(long)]
    db_user: Option<String>,

    /// Metadata database password (overrides config file)
    #[arg(long)]
    db_password: Option<String>,

    /// Metadata database name (overrides config file)
    #[arg(long)]
    db_name: Option<String>,
}

impl Cli {
    /// Flags and environment beat the file, which beats the defaults.
    fn apply(&self, config: &mut Config) {
        if let Some(ref host) = self.host {
            config.server.host = host.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(ref level) = self.log_level {
            config.log.level = level.to_lowercase();
        }
        if let Some(ref format) = self.log_format {
            config.log.format = format.to_lowercase();
        }
        if let Some(ref output) = self.log_output {
            config.log.output = output.clone();
        }
        if let Some(ref host) = self.db_host {
            config.metadata.host = host.clone();
        }
        if let Some(port) = self.db_port {
            config.metadata.port = port;
        }
        if let Some(ref user) = self.db_user {
            config.metadata.user = user.clone();
        }
        if let Some(ref password) = self.db_password {
            config.metadata.password = password.clone();
        }
        if let Some(ref name) = self.db_name {
            config.metadata.dbname = name.clone();
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), DtsError> {
    let cli = Cli::parse();

    let mut config = match cli.config {
        Some(ref path) => Config::load(path)?,
        None => Config::load_or_default("config.yaml")?,
    };
    cli.apply(&mut config);

    setup_logging(&config)?;
    info!(
        host = %config.server.host,
        port = config.server.port,
        "starting pg-dts server"
    );

    // Metadata store
    info!(
        host = %config.metadata.host,
        port = config.metadata.port,
        dbname = %config.metadata.dbname,
        "connecting to metadata database"
    );
    let pool = metadata_pool(&config)?;
    let store = PgTaskStore::new(pool);
    store.init_schema().await?;
    info!("metadata schema initialized");

    let service = Arc::new(DtsService::new(Arc::new(store)));

    // Periodic sweep of terminal tasks out of the live map.
    let sweeper = Arc::clone(&service);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            sweeper
                .manager()
                .cleanup_completed(sweeper.store().as_ref())
                .await;
        }
    });

    let app = pg_dts::http::router(service);
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("server stopped");
    Ok(())
}

fn metadata_pool(config: &Config) -> Result<Pool, DtsError> {
    let meta = &config.metadata;
    let mut pg_config = tokio_postgres::Config::new();
    pg_config
        .host(&meta.host)
        .port(meta.port)
        .user(&meta.user)
        .password(&meta.password)
        .dbname(&meta.dbname);

    let mgr = Manager::from_config(
        pg_config,
        NoTls,
        ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        },
    );
    Pool::builder(mgr)
        .max_size(10)
        .build()
        .map_err(|e| DtsError::pool(e, "building metadata pool"))
}

fn setup_logging(config: &Config) -> Result<(), DtsError> {
    let filter = EnvFilter::try_new(&config.log.level)
        .map_err(|e| DtsError::Config(format!("invalid log level '{}': {e}", config.log.level)))?;

    let to_stderr = match config.log.output.as_str() {
        "stderr" => true,
        "stdout" => false,
        other => {
            eprintln!("unsupported log output '{other}', using stdout");
            false
        }
    };

    match config.log.format.as_str() {
        "text" => {
            let builder = tracing_subscriber::fmt().with_env_filter(filter);
            if to_stderr {
                builder.with_writer(std::io::stderr).init();
            } else {
                builder.init();
            }
        }
        _ => {
            let builder = tracing_subscriber::fmt().with_env_filter(filter).json();
            if to_stderr {
                builder.with_writer(std::io::stderr).init();
            } else {
                builder.init();
            }
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                warn!(error = %e, "could not install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
            _ = sigterm.recv() => info!("received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "could not listen for shutdown signal");
        }
    }
}
