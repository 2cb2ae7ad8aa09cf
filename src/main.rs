use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use turnstile::config::{BackendKind, TurnstileConfig};
use turnstile::http::{router, AppState, HttpServer};
use turnstile::ratelimit::{
    RateLimitTable, RateLimiter, RateLimiterBackend, RedisRateLimiter, Sweeper, SweeperHandle,
    SystemClock,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Fixed-window rate limiting service
#[derive(Debug, Parser)]
#[command(name = "turnstile", version, about)]
struct Args {
    /// Path to a configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Path to a YAML file overriding the category limits
    #[arg(long)]
    rules: Option<String>,

    /// Address for the HTTP listener
    #[arg(long)]
    http_addr: Option<SocketAddr>,

    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);
    match args.log_format {
        LogFormat::Json => subscriber.json().init(),
        LogFormat::Text => subscriber.init(),
    }

    info!("Starting Turnstile Rate Limiting Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = TurnstileConfig::load(args.config.as_deref())?;
    if let Some(rules) = args.rules {
        config.rate_limiting.rules_path = Some(rules);
    }
    if let Some(addr) = args.http_addr {
        config.server.http_addr = addr;
    }
    config.validate()?;
    info!(
        http_addr = %config.server.http_addr,
        backend = ?config.rate_limiting.backend,
        "Configuration loaded"
    );

    let table = match &config.rate_limiting.rules_path {
        Some(path) => RateLimitTable::from_file(path)?,
        None => RateLimitTable::builtin(),
    };

    let (backend, sweeper) = build_backend(&config).await?;
    info!(backend = backend.name(), "Rate limiter initialized");

    let state = AppState::new(backend, Arc::new(table), Arc::new(SystemClock))
        .with_role_adjustment(config.rate_limiting.role_adjustment);
    let server = HttpServer::new(config.server.http_addr, router(state));

    // Run the server with graceful shutdown on Ctrl+C
    server.serve_with_shutdown(shutdown_signal()).await?;

    if let Some(sweeper) = sweeper {
        sweeper.shutdown().await;
    }

    info!("Turnstile Rate Limiting Service stopped");
    Ok(())
}

/// Create the configured counter store. The in-memory store gets a sweeper.
async fn build_backend(
    config: &TurnstileConfig,
) -> anyhow::Result<(Arc<dyn RateLimiterBackend>, Option<SweeperHandle>)> {
    let settings = &config.rate_limiting;
    match settings.backend {
        BackendKind::Memory => {
            let limiter = Arc::new(RateLimiter::new());
            let sweeper = Sweeper::spawn(limiter.clone(), settings.sweep_interval());
            Ok((limiter, Some(sweeper)))
        }
        BackendKind::Redis => {
            let redis = RedisRateLimiter::new(
                &settings.redis.url,
                settings.redis.key_prefix.clone(),
                settings.redis.timeout(),
            )?;
            // Checks fail open until redis is reachable.
            if let Err(e) = redis.connect().await {
                warn!(url = %settings.redis.url, error = %e, "Redis unavailable at startup");
            }
            Ok((Arc::new(redis), None))
        }
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
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
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
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
