//! SFTP Server Binary
//!
//! NIST 800-53: AU-2 (Audit Events), AU-9 (Protection of Audit Information), AU-12 (Audit Generation)
//! Implementation: drop server with JSON logging for log aggregation
//!
//! Run with: cargo run --bin bankdrop-sftp-server

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use bankdrop_sftp::{Config, LogFormat, LoggingConfig, Server, UploadStats};
use clap::Parser;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::MakeWriterExt;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address
    #[arg(short, long)]
    bind: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Upload directory
    #[arg(short, long)]
    root: Option<PathBuf>,

    /// Host key path
    #[arg(long)]
    host_key: Option<PathBuf>,

    /// Authorized public keys file
    #[arg(long)]
    authorized_keys: Option<PathBuf>,

    /// Verbose logging (debug level)
    #[arg(short, long)]
    verbose: bool,

    /// Log format (json or text)
    #[arg(long)]
    log_format: Option<LogFormat>,

    /// Log file path
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Print upload directory statistics as JSON and exit
    #[arg(long)]
    stats: bool,
}

impl Args {
    /// Configuration file (or defaults) with command-line overrides applied
    fn into_config(self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None => Config::default(),
        };

        if let Some(bind) = self.bind {
            config.bind_address = bind;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(root) = self.root {
            config.root_dir = root;
        }
        if let Some(host_key) = self.host_key {
            config.host_key_path = Some(host_key);
        }
        if let Some(authorized_keys) = self.authorized_keys {
            config.authorized_keys_path = authorized_keys;
        }
        if let Some(log_format) = self.log_format {
            config.logging.format = log_format;
        }
        if let Some(log_file) = self.log_file {
            config.logging.file = Some(log_file);
        }
        if self.verbose {
            config.logging.level = "debug".to_string();
        }

        Ok(config)
    }
}

/// Install the global subscriber, writing to stderr and, when configured, a
/// daily-rolling file. The returned guard must live until exit
/// so buffered file output is flushed.
///
/// NIST 800-53: AU-9 (Protection of Audit Information)
fn init_logging(logging: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = || EnvFilter::new(&logging.level);

    let Some(log_file) = &logging.file else {
        match logging.format {
            LogFormat::Json => tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter())
                .with_current_span(true)
                .with_span_list(true)
                .init(),
            LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter()).init(),
        }
        return Ok(None);
    };

    let directory = log_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = log_file
        .file_name()
        .with_context(|| format!("Log file {} has no file name", log_file.display()))?;
    std::fs::create_dir_all(directory)
        .with_context(|| format!("Failed to create log directory {}", directory.display()))?;

    let (file_writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(directory, file_name));
    // The log file gets a copy of everything on stderr.
    let writer = file_writer.and(std::io::stderr);

    match logging.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter())
            .with_writer(writer)
            .with_current_span(true)
            .with_span_list(true)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter())
            .with_writer(writer)
            .with_ansi(false)
            .init(),
    }

    Ok(Some(guard))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let show_stats = args.stats;
    let config = args.into_config()?;

    if show_stats {
        println!("{}", UploadStats::collect(&config.root_dir).to_json_pretty()?);
        return Ok(());
    }

    let _log_guard = init_logging(&config.logging)?;

    info!(
        event = "server_starting",
        version = env!("CARGO_PKG_VERSION"),
        "Starting Bankdrop SFTP Server"
    );
    info!(
        event = "server_configuration",
        bind_address = %config.bind_address,
        port = config.port,
        root_dir = ?config.root_dir,
        authorized_keys = ?config.authorized_keys_path,
        channel_open_timeout_secs = config.channel_open_timeout_secs,
        max_auth_attempts = config.max_auth_attempts,
        atomic_uploads = config.atomic_uploads,
        log_format = ?config.logging.format,
        log_file = ?config.logging.file,
        "SFTP Server Configuration"
    );

    let server = match Server::bind(config).await {
        Ok(server) => server,
        Err(e) => {
            error!(event = "server_creation_failed", error = %e, "Failed to create server");
            return Err(e.into());
        }
    };

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
    };
    server.run_until(shutdown).await?;

    info!(event = "server_shutdown", "SFTP server shutdown complete");
    Ok(())
}
