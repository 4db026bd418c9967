#![forbid(unsafe_code)]

//! `backend-warden`: hosts the session registry behind a local IPC socket.
//!
//! Loads configuration, starts the IPC control surface, logs advisories
//! raised by backends, and disposes every session on shutdown.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use backend_warden::advisory::{Advisory, AdvisorySink};
use backend_warden::ipc::server::spawn_ipc_server;
use backend_warden::{AppError, GlobalConfig, Result, SessionRegistry};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "backend-warden", about = "Notebook backend supervisor", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override the IPC socket name from the config file.
    #[arg(long)]
    ipc_name: Option<String>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("backend-warden bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = GlobalConfig::load_from_path(&args.config)?;
    config.apply_env_overrides();
    if let Some(name) = args.ipc_name {
        config.ipc_name = name;
    }
    let config = Arc::new(config);
    info!(backend = %config.backend.command, "configuration loaded");

    // ── Registry and advisories ─────────────────────────
    let (sink, advisories) = AdvisorySink::channel();
    let registry = Arc::new(SessionRegistry::new(Arc::clone(&config), sink));
    let ct = CancellationToken::new();
    let advisory_handle = tokio::spawn(drain_advisories(advisories, ct.clone()));

    // ── Control surface ─────────────────────────────────
    let ipc_handle = spawn_ipc_server(Arc::clone(&registry), &config.ipc_name, ct.clone())?;
    info!("backend-warden ready");

    // ── Wait for shutdown signal ────────────────────────
    shutdown_signal().await;
    info!("shutdown signal received");
    ct.cancel();

    let disposed = registry.shutdown().await;
    info!(disposed, "sessions disposed");

    let (ipc_result, advisory_result) = tokio::join!(ipc_handle, advisory_handle);
    if let Err(err) = ipc_result {
        error!(%err, "ipc server task failed");
    }
    if let Err(err) = advisory_result {
        error!(%err, "advisory task failed");
    }
    info!("backend-warden shut down");

    Ok(())
}

/// Consume advisories until shutdown. The sink already mirrors each one to
/// the log; this keeps the channel drained and records delivery.
async fn drain_advisories(
    mut advisories: tokio::sync::mpsc::UnboundedReceiver<Advisory>,
    ct: CancellationToken,
) {
    loop {
        tokio::select! {
            () = ct.cancelled() => break,
            advisory = advisories.recv() => match advisory {
                Some(advisory) => tracing::debug!(
                    session = %advisory.key,
                    level = ?advisory.level,
                    at = %advisory.at.to_rfc3339(),
                    "advisory delivered"
                ),
                None => break,
            },
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
