use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use turnstile::config::{LogFormat, LoggingConfig, RateLimitConfig, StoreBackend, TurnstileConfig};
use turnstile::protocol;
use turnstile::ratelimit::{LimiterStore, MemoryStore, RateLimiter, ShardedStore, SystemClock};

/// Admission control over a line protocol on stdin/stdout.
#[derive(Parser, Debug)]
#[command(name = "turnstile", version, about)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log filter, overriding the configured level
    #[arg(long)]
    log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = TurnstileConfig::load(cli.config.as_deref())?;
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    if cli.json_logs {
        config.logging.format = LogFormat::Json;
    }

    init_tracing(&config.logging);

    info!("Starting Turnstile admission control");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    match &cli.config {
        Some(path) => info!(path = %path.display(), "Configuration loaded"),
        None => info!("Configuration loaded from defaults and environment"),
    }

    match config.registry.backend {
        StoreBackend::Memory => {
            let store = MemoryStore::with_max_keys(config.registry.max_keys);
            info!(max_keys = ?store.max_keys(), "Using in-memory registry");
            run(config.rate_limit, store).await
        }
        StoreBackend::Sharded => {
            if config.registry.max_keys.is_some() {
                warn!("registry.max_keys is ignored by the sharded registry");
            }
            info!("Using sharded registry");
            run(config.rate_limit, ShardedStore::new()).await
        }
    }
}

/// Initialize tracing. Logs go to stderr; stdout carries protocol replies.
fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

/// Serve the line protocol until input ends or a shutdown signal arrives.
async fn run<S: LimiterStore + 'static>(config: RateLimitConfig, store: S) -> anyhow::Result<()> {
    let rate_limiter = Arc::new(RateLimiter::with_store(config, store, SystemClock)?);
    let maintenance = rate_limiter.spawn_maintenance();

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();

    tokio::select! {
        result = protocol::serve(rate_limiter.as_ref(), stdin, stdout) => {
            let answered = result?;
            info!(answered = answered, "Input closed");
        }
        _ = shutdown_signal() => {}
    }

    maintenance.abort();
    info!("Turnstile stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
