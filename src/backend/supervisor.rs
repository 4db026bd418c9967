//! Backend process spawning and monitoring.
//!
//! [`spawn`] launches the interpreter with:
//! - `kill_on_drop(true)` so an abandoned child is reaped with its handle;
//! - `env_clear()` plus an allowlist, so the supervisor's own environment
//!   does not leak into user code;
//! - the spawn contract `-p <port> -t <dialect> --sourcePath <dir>
//!   --ipcAddress <host:port>` after the configured leading arguments.
//!
//! Ownership of the [`Child`] moves into a monitor task. The monitor is the
//! single place that observes the readiness channel, the child's output
//! pipes, and its exit, and it resolves the pending [`ReadinessWait`]
//! exactly once. The session keeps a [`ProcessHandle`] that can only ask
//! the monitor to kill the child and wait for it.

use std::ffi::OsString;
use std::net::SocketAddr;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::advisory::{AdvisoryLevel, AdvisorySink};
use crate::backend::health::HealthState;
use crate::backend::readiness::{ChannelEvent, ReadinessChannel};
use crate::config::BackendCommand;
use crate::models::session::{Dialect, Health, SessionKey};
use crate::models::signal::{ReadinessSignal, SignalKind};
use crate::{AppError, Result};

/// Environment variables inherited by the backend process.
pub const ALLOWED_ENV_VARS: &[&str] = &[
    "PATH",
    "HOME",
    "JAVA_HOME",
    "LANG",
    "LC_ALL",
    "TMPDIR",
    "RUST_LOG",
    // Windows-specific variables.
    "USERPROFILE",
    "SystemRoot",
    "TEMP",
    "TMP",
    "USERNAME",
    "APPDATA",
    "LOCALAPPDATA",
    "COMSPEC",
];

/// Buffered output lines per pipe.
const PIPE_BUFFER: usize = 256;

/// Everything needed to launch one backend.
#[derive(Debug, Clone, Copy)]
pub struct LaunchSpec<'a> {
    /// Session the backend serves.
    pub key: &'a SessionKey,
    /// Executable and leading arguments.
    pub backend: &'a BackendCommand,
    /// Port the backend must serve on.
    pub port: u16,
    /// Directory holding the unit sources.
    pub source_dir: &'a Path,
}

/// Arguments the supervisor appends to the configured command line.
#[must_use]
pub fn backend_args(
    port: u16,
    dialect: &Dialect,
    source_dir: &Path,
    ipc_address: SocketAddr,
) -> Vec<OsString> {
    vec![
        "-p".into(),
        port.to_string().into(),
        "-t".into(),
        dialect.as_str().into(),
        "--sourcePath".into(),
        source_dir.as_os_str().to_owned(),
        "--ipcAddress".into(),
        ipc_address.to_string().into(),
    ]
}

/// How a backend process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitReport {
    /// Exit code, when the process exited normally.
    pub code: Option<i32>,
    /// Human-readable description.
    pub reason: String,
}

impl ExitReport {
    fn from_status(status: std::io::Result<ExitStatus>) -> Self {
        match status {
            Ok(status) => {
                let code = status.code();
                let reason = code.map_or_else(
                    || "process terminated by signal".to_owned(),
                    |c| format!("process exited with code {c}"),
                );
                Self { code, reason }
            }
            Err(err) => Self {
                code: None,
                reason: format!("wait error: {err}"),
            },
        }
    }
}

/// Pending "become ready" result for a freshly spawned backend.
#[derive(Debug)]
pub struct ReadinessWait(oneshot::Receiver<Result<()>>);

impl ReadinessWait {
    /// Wait up to `timeout` for a START signal.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Readiness` on timeout, on STOP/ERROR or stderr
    /// output before START, on exit before START, or if the monitor went
    /// away.
    pub async fn wait(self, timeout: Duration) -> Result<()> {
        match tokio::time::timeout(timeout, self.0).await {
            Ok(Ok(result)) => result,
            Ok(Err(_closed)) => Err(AppError::Readiness(
                "backend monitor ended before readiness was decided".into(),
            )),
            Err(_elapsed) => Err(AppError::Readiness(format!(
                "startup timeout: backend did not send START within {timeout:?}"
            ))),
        }
    }
}

/// Session-side handle on a spawned backend.
///
/// Dropping the handle cancels the monitor, which kills the child.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: Option<u32>,
    cancel: CancellationToken,
    monitor: Option<JoinHandle<ExitReport>>,
}

impl ProcessHandle {
    /// OS process id at spawn time.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Whether the monitor (and thus the child) is still alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.monitor.as_ref().is_some_and(|m| !m.is_finished())
    }

    /// Kill the child if it is still running and wait for it to be reaped.
    ///
    /// Returns `None` if the handle was already terminated.
    pub async fn terminate(&mut self) -> Option<ExitReport> {
        self.cancel.cancel();
        let monitor = self.monitor.take()?;
        match monitor.await {
            Ok(report) => Some(report),
            Err(err) => {
                warn!(pid = ?self.pid, %err, "backend monitor task failed");
                None
            }
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Launch a backend and start monitoring it.
///
/// The readiness listener must already be bound; its address is passed to
/// the child. Must be called from within a tokio runtime.
///
/// # Errors
///
/// Returns `AppError::Spawn` if the executable cannot be launched or its
/// pipes cannot be captured. The readiness listener is closed on error.
pub fn spawn(
    spec: &LaunchSpec<'_>,
    channel: ReadinessChannel,
    health: HealthState,
    sink: AdvisorySink,
) -> Result<(ProcessHandle, ReadinessWait)> {
    let ipc_address = channel.address();
    let mut cmd = Command::new(&spec.backend.command);
    cmd.args(&spec.backend.args).args(backend_args(
        spec.port,
        &spec.key.dialect,
        spec.source_dir,
        ipc_address,
    ));

    cmd.env_clear();
    for &key in ALLOWED_ENV_VARS {
        if let Ok(val) = std::env::var(key) {
            cmd.env(key, val);
        }
    }
    cmd.envs(&spec.backend.env);

    if let Some(dir) = &spec.backend.working_dir {
        cmd.current_dir(dir);
    }

    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|err| {
        AppError::Spawn(format!(
            "failed to spawn '{}': {err}",
            spec.backend.command
        ))
    })?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::Spawn("failed to capture backend stdout".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| AppError::Spawn("failed to capture backend stderr".into()))?;

    let pid = child.id();
    info!(
        session = %spec.key,
        pid = ?pid,
        port = spec.port,
        %ipc_address,
        command = spec.backend.command,
        "backend process spawned"
    );

    let cancel = CancellationToken::new();
    let (ready_tx, ready_rx) = oneshot::channel();
    let (signals, accept) = channel.listen(cancel.child_token());
    let monitor = Monitor {
        key: spec.key.clone(),
        label: format!("{}-backend", spec.key.dialect.as_str().to_uppercase()),
        port: spec.port,
        child,
        signals,
        accept: Some(accept),
        stdout: pipe_lines(stdout),
        stderr: pipe_lines(stderr),
        ready: Some(ready_tx),
        health,
        sink,
        cancel: cancel.clone(),
    };

    let span = info_span!("backend_monitor", session = %spec.key, pid = ?pid);
    let handle = tokio::spawn(monitor.run().instrument(span));

    Ok((
        ProcessHandle {
            pid,
            cancel,
            monitor: Some(handle),
        },
        ReadinessWait(ready_rx),
    ))
}

/// Forward lines from a child pipe, tolerating invalid UTF-8.
fn pipe_lines<R>(pipe: R) -> mpsc::Receiver<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(PIPE_BUFFER);
    tokio::spawn(async move {
        let mut reader = BufReader::new(pipe);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf).trim_end().to_owned();
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    debug!(%err, "backend pipe read failed");
                    break;
                }
            }
        }
    });
    rx
}

struct Monitor {
    key: SessionKey,
    label: String,
    port: u16,
    child: Child,
    signals: mpsc::Receiver<ChannelEvent>,
    accept: Option<JoinHandle<()>>,
    stdout: mpsc::Receiver<String>,
    stderr: mpsc::Receiver<String>,
    ready: Option<oneshot::Sender<Result<()>>>,
    health: HealthState,
    sink: AdvisorySink,
    cancel: CancellationToken,
}

impl Monitor {
    async fn run(mut self) -> ExitReport {
        let mut signals_open = true;
        let mut stdout_open = true;
        let mut stderr_open = true;

        // Output and signals are drained before the exit branch so that an
        // ERROR written just before exiting is still reported.
        let report = loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break self.kill().await,
                event = self.signals.recv(), if signals_open => match event {
                    Some(event) => self.on_event(event),
                    None => signals_open = false,
                },
                line = self.stderr.recv(), if stderr_open => match line {
                    Some(line) => self.on_stderr(&line),
                    None => stderr_open = false,
                },
                line = self.stdout.recv(), if stdout_open => match line {
                    Some(line) => debug!(backend = %self.label, "{line}"),
                    None => stdout_open = false,
                },
                status = self.child.wait() => break self.on_exit(status),
            }
        };

        // The listener must be closed by the time the handle sees the exit.
        self.cancel.cancel();
        if let Some(accept) = self.accept.take() {
            if let Err(err) = accept.await {
                debug!(%err, "readiness accept task failed");
            }
        }
        report
    }

    fn resolve(&mut self, result: Result<()>) -> bool {
        match self.ready.take() {
            Some(tx) => {
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    fn on_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Signal(signal) => self.on_signal(signal),
            ChannelEvent::Malformed(reason) => {
                if !self.health.is_terminated() {
                    self.sink.emit(
                        &self.key,
                        AdvisoryLevel::Warning,
                        format!("{} sent a malformed signal: {reason}", self.label),
                    );
                }
            }
        }
    }

    fn on_signal(&mut self, signal: ReadinessSignal) {
        let description = signal.describe();
        match signal.kind {
            SignalKind::Start if self.ready.is_some() => {
                if let Some(reported) = signal.reported_port().filter(|p| *p != self.port) {
                    self.health.transition(Health::Unhealthy);
                    self.resolve(Err(AppError::Readiness(format!(
                        "backend reported port {reported}, expected {}",
                        self.port
                    ))));
                    return;
                }
                self.health.transition(Health::Healthy);
                self.sink.emit(&self.key, AdvisoryLevel::Info, description);
                self.resolve(Ok(()));
            }
            SignalKind::Start => debug!("repeated START ignored"),
            SignalKind::Stop | SignalKind::Error => {
                if self.ready.is_some() {
                    self.health.transition(Health::Unhealthy);
                    self.resolve(Err(AppError::Readiness(description)));
                } else if self.health.is_terminated() {
                    debug!(%description, "signal after dispose");
                } else {
                    self.health.transition(Health::Unhealthy);
                    self.sink.emit(&self.key, AdvisoryLevel::Error, description);
                }
            }
        }
    }

    fn on_stderr(&mut self, line: &str) {
        if self.health.is_terminated() {
            debug!(backend = %self.label, "stderr after dispose: {line}");
            return;
        }
        let message = format!("{} gave error message: {line}", self.label);
        self.health.transition(Health::Unhealthy);
        self.resolve(Err(AppError::Readiness(message.clone())));
        self.sink.emit(&self.key, AdvisoryLevel::Error, message);
    }

    fn on_exit(&mut self, status: std::io::Result<ExitStatus>) -> ExitReport {
        let report = ExitReport::from_status(status);
        if self.resolve(Err(AppError::Readiness(format!(
            "backend exited before ready: {}",
            report.reason
        )))) {
            self.health.transition(Health::Unhealthy);
        } else if self.health.is_terminated() {
            info!(reason = %report.reason, "backend process exited");
        } else {
            self.health.transition(Health::Unhealthy);
            self.sink.emit(
                &self.key,
                AdvisoryLevel::Error,
                format!("{} process exited unexpectedly: {}", self.label, report.reason),
            );
        }
        report
    }

    async fn kill(&mut self) -> ExitReport {
        self.resolve(Err(AppError::Readiness(
            "backend terminated before it became ready".into(),
        )));
        if let Err(err) = self.child.start_kill() {
            debug!(%err, "kill failed; process may already be gone");
        }
        let report = ExitReport::from_status(self.child.wait().await);
        info!(reason = %report.reason, "backend process killed");
        report
    }
}
