#![forbid(unsafe_code)]

//! `warden-reference-backend`: a minimal interpreter backend that speaks
//! the supervisor's spawn contract.
//!
//! It reports START over the readiness channel, serves the reload and stop
//! endpoints, and records what it saw in the source directory on every
//! reload (`GET /history`). `--behavior` selects a failure mode so the
//! supervisor's error paths can be exercised without a real interpreter.
//!
//! Logs go to stdout: the supervisor treats stderr output as a failure.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::{Parser, ValueEnum};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use backend_warden::models::signal::{SignalKind, SignalRecord};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Source contents keyed by file name, as seen by one reload.
type Snapshot = BTreeMap<String, String>;

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
enum Behavior {
    /// Report START and serve normally.
    Ready,
    /// Connect but never report START.
    NeverReady,
    /// Report a FATAL error instead of START, then idle.
    ErrorBeforeStart,
    /// Exit with code 3 before connecting.
    ExitBeforeStart,
    /// Write to stderr, then report START as usual.
    StderrBeforeStart,
    /// Serve normally but write to stderr on every reload.
    StderrOnReload,
    /// Serve normally but answer every reload with 500.
    ReloadFails,
    /// Report START with a port other than the one assigned.
    WrongPort,
}

#[derive(Debug, Parser)]
#[command(
    name = "warden-reference-backend",
    about = "Reference backend for backend-warden",
    version,
    long_about = None
)]
struct Cli {
    /// Port to serve the control endpoints on.
    #[arg(short = 'p', long)]
    port: u16,

    /// Dialect to interpret.
    #[arg(short = 't', long = "type")]
    dialect: String,

    /// Directory holding unit sources.
    #[arg(long = "sourcePath")]
    source_path: PathBuf,

    /// Readiness channel address (`host:port`).
    #[arg(long = "ipcAddress")]
    ipc_address: SocketAddr,

    /// Scripted behavior.
    #[arg(long, value_enum, default_value_t = Behavior::Ready)]
    behavior: Behavior,

    /// Write the process id to this file on startup.
    #[arg(long)]
    pid_file: Option<PathBuf>,

    /// Write the readiness channel address to this file on startup.
    #[arg(long)]
    address_file: Option<PathBuf>,
}

struct Backend {
    source_path: PathBuf,
    behavior: Behavior,
    signals: Mutex<TcpStream>,
    history: Mutex<Vec<Snapshot>>,
    shutdown: CancellationToken,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stdout)
        .init();

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            error!(%err, "reference backend failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode, BoxError> {
    if let Some(address_file) = &cli.address_file {
        tokio::fs::write(address_file, cli.ipc_address.to_string()).await?;
    }
    if let Some(pid_file) = &cli.pid_file {
        tokio::fs::write(pid_file, std::process::id().to_string()).await?;
    }

    if cli.behavior == Behavior::ExitBeforeStart {
        warn!("exiting before start");
        return Ok(ExitCode::from(3));
    }

    let mut signals = TcpStream::connect(cli.ipc_address).await?;
    info!(ipc_address = %cli.ipc_address, dialect = %cli.dialect, "readiness channel connected");

    match cli.behavior {
        Behavior::NeverReady => {
            info!("withholding START");
            return Ok(idle().await);
        }
        Behavior::ErrorBeforeStart => {
            let record = signal(
                SignalKind::Error,
                "could not load specification",
                Some("FATAL"),
                None,
            );
            send(&mut signals, &record).await?;
            return Ok(idle().await);
        }
        Behavior::StderrBeforeStart => {
            eprintln!("cannot load specification");
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
        _ => {}
    }

    let listener = TcpListener::bind((cli.ipc_address.ip(), cli.port)).await?;
    let reported = if cli.behavior == Behavior::WrongPort {
        cli.port.wrapping_add(1)
    } else {
        cli.port
    };
    let properties = HashMap::from([("port".to_owned(), reported.to_string())]);
    let start = signal(
        SignalKind::Start,
        &format!("{} interpreter listening", cli.dialect),
        None,
        Some(properties),
    );
    send(&mut signals, &start).await?;
    info!(port = cli.port, "START sent");

    let shutdown = CancellationToken::new();
    let state = Arc::new(Backend {
        source_path: cli.source_path,
        behavior: cli.behavior,
        signals: Mutex::new(signals),
        history: Mutex::new(Vec::new()),
        shutdown: shutdown.clone(),
    });

    let app = Router::new()
        .route("/reload", post(reload))
        .route("/stopMain", post(stop_main))
        .route("/history", get(history))
        .with_state(state);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("reference backend stopped");
    Ok(ExitCode::SUCCESS)
}

async fn idle() -> ExitCode {
    std::future::pending().await
}

fn signal(
    kind: SignalKind,
    message: &str,
    error_level: Option<&str>,
    properties: Option<HashMap<String, String>>,
) -> SignalRecord {
    SignalRecord {
        kind,
        message: message.to_owned(),
        error_level: error_level.map(str::to_owned),
        properties,
    }
}

async fn send(stream: &mut TcpStream, record: &SignalRecord) -> Result<(), BoxError> {
    let mut line = serde_json::to_string(record)?;
    line.push('\n');
    stream.write_all(line.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

async fn reload(State(state): State<Arc<Backend>>) -> StatusCode {
    if state.behavior == Behavior::ReloadFails {
        warn!("reload rejected");
        return StatusCode::INTERNAL_SERVER_ERROR;
    }

    match snapshot(&state.source_path).await {
        Ok(files) => {
            if state.behavior == Behavior::StderrOnReload {
                eprintln!("runtime error: division by zero");
            }
            info!(files = files.len(), "sources reloaded");
            state.history.lock().await.push(files);
            StatusCode::OK
        }
        Err(err) => {
            warn!(%err, "failed to read sources");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

async fn stop_main(State(state): State<Arc<Backend>>) -> StatusCode {
    let record = signal(SignalKind::Stop, "stop requested", None, None);
    if let Err(err) = send(&mut *state.signals.lock().await, &record).await {
        warn!(%err, "failed to send STOP");
    }
    state.shutdown.cancel();
    StatusCode::OK
}

async fn history(State(state): State<Arc<Backend>>) -> Json<Vec<Snapshot>> {
    Json(state.history.lock().await.clone())
}

/// Read every visible file in `dir`; in-flight temporary files are hidden.
async fn snapshot(dir: &Path) -> std::io::Result<Snapshot> {
    let mut files = Snapshot::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        let contents = tokio::fs::read_to_string(entry.path()).await?;
        files.insert(name, contents);
    }
    Ok(files)
}
