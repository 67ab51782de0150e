//! Archive Gate Server Binary
//!
//! NIST 800-53: AU-2 (Audit Events), AU-9 (Protection of Audit Information),
//! AU-12 (Audit Generation)
//! STIG: V-222648 (Audit Records)
//! Implementation: HTTP(S) gateway with JSON logging for SIEM integration
//!
//! Run with: cargo run --bin archive-gate-server -- --config gate.toml

use anyhow::Context;
use archive_gate::config::LogFormat;
use archive_gate::{ArchiveGateway, Config};
use archive_gate_http::HttpServer;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,

    /// Bind address (overrides the file)
    #[arg(short, long)]
    bind: Option<String>,

    /// Port to listen on (overrides the file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Allowed root, repeatable (overrides the file)
    #[arg(short = 'r', long = "allow")]
    allowed_paths: Vec<PathBuf>,

    /// Seconds between maintenance passes
    #[arg(long, default_value = "60")]
    maintenance_interval: u64,

    /// Verbose logging (debug level)
    #[arg(short, long)]
    verbose: bool,

    /// Log format (json or text)
    #[arg(long)]
    log_format: Option<LogFormat>,

    /// Log file path
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path).with_context(|| format!("loading {path}"))?,
        None => Config::default(),
    };

    if let Some(bind) = &args.bind {
        config.server.bind_address.clone_from(bind);
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if !args.allowed_paths.is_empty() {
        config.sandbox.allowed_paths.clone_from(&args.allowed_paths);
    }
    if let Some(log_format) = args.log_format {
        config.logging.format = log_format;
    }
    if let Some(log_file) = &args.log_file {
        config.logging.file = Some(log_file.clone());
    }
    if args.verbose {
        config.logging.level = "debug".to_string();
    }

    Ok(config)
}

/// Initialize logging with JSON support for SIEM integration
///
/// NIST 800-53 AU-9: Protection of Audit Information
/// NIST 800-53 AU-12: Audit Generation
fn init_logging(config: &Config) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_new(&config.logging.level)
        .with_context(|| format!("invalid log level {}", config.logging.level))?;

    let Some(log_file) = &config.logging.file else {
        match config.logging.format {
            LogFormat::Json => tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .with_current_span(true)
                .with_span_list(true)
                .init(),
            LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        }
        return Ok(None);
    };

    let directory = log_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), PathBuf::from);
    let file_name = log_file
        .file_name()
        .context("log file must have a file name")?
        .to_string_lossy()
        .into_owned();
    std::fs::create_dir_all(&directory)
        .with_context(|| format!("creating log directory {}", directory.display()))?;

    let file_appender = tracing_appender::rolling::daily(directory, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    match config.logging.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(non_blocking)
            .with_current_span(true)
            .with_span_list(true)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(non_blocking)
            .init(),
    }

    Ok(Some(guard))
}

/// Periodic purge of expired lockouts, cached principals and revocations
fn spawn_maintenance(gateway: Arc<ArchiveGateway>, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let report = gateway.maintenance();
            debug!(
                event = "maintenance_pass",
                rate_limit_records = report.rate_limit_records,
                cached_principals = report.cached_principals,
                revocations = report.revocations,
                "Maintenance pass completed"
            );
        }
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    let _log_guard = init_logging(&config)?;

    info!(
        event = "server_starting",
        version = env!("CARGO_PKG_VERSION"),
        "Starting Archive Gate Server"
    );

    info!(
        event = "server_configuration",
        bind_address = %config.server.bind_address,
        port = config.server.port,
        tls = config.server.tls.is_some(),
        allowed_paths = ?config.sandbox.allowed_paths,
        excluded_paths = ?config.sandbox.excluded_paths,
        directory = ?config.directory.kind,
        upload_enabled = config.upload.enabled,
        log_format = ?config.logging.format,
        log_file = ?config.logging.file,
        "Archive Gate Configuration"
    );

    info!(
        event = "security_configuration",
        max_login_attempts = config.rate_limit.max_login_attempts,
        lockout_duration_minutes = config.rate_limit.lockout_duration_minutes,
        session_timeout_minutes = config.session.session_timeout_minutes,
        revocation_enabled = config.session.revocation_enabled,
        "Security Configuration Active"
    );

    let gateway = Arc::new(ArchiveGateway::from_config(&config).context("building gateway")?);
    let maintenance = spawn_maintenance(
        Arc::clone(&gateway),
        Duration::from_secs(args.maintenance_interval.max(1)),
    );

    let server = HttpServer::new(gateway, &config);
    info!(event = "server_running", "Archive gate is accepting requests");

    let result = server.run().await.context("server error");
    maintenance.abort();

    info!(event = "server_shutdown", "Archive gate shutdown complete");
    result
}
