//! One supervised backend: process, source mirror, address, and health.
//!
//! Resource acquisition in [`Session::launch`] is scoped: the source
//! directory, readiness listener, and child each release themselves when
//! dropped, so an early return leaves nothing behind. Once a session
//! object exists, every failure path funnels through
//! [`Session::dispose`], which is safe to call from any state and more than
//! once.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::advisory::AdvisorySink;
use crate::backend::control::BackendControl;
use crate::backend::health::HealthState;
use crate::backend::readiness::ReadinessChannel;
use crate::backend::supervisor::{self, LaunchSpec, ProcessHandle, ReadinessWait};
use crate::backend::sync::SourceSynchronizer;
use crate::config::GlobalConfig;
use crate::models::session::{Health, SessionKey, SessionSummary};
use crate::models::unit::{StableId, UnitRequest};
use crate::{AppError, Result};

/// A running (or starting) backend and everything it owns.
#[derive(Debug)]
pub struct Session {
    key: SessionKey,
    port: u16,
    address: String,
    default_suffix: String,
    sync: SourceSynchronizer,
    process: ProcessHandle,
    ready: Option<ReadinessWait>,
    health: HealthState,
    control: BackendControl,
    readiness_timeout: Duration,
}

impl Session {
    /// Materialize `unit` and spawn a backend on `port`, without waiting
    /// for it to become ready.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Sync`/`PathViolation` if the unit cannot be
    /// written, `AppError::Readiness` if the listener cannot be bound, and
    /// `AppError::Spawn` if the child cannot be launched. Nothing is left
    /// on disk or running on error.
    pub async fn launch(
        unit: &UnitRequest,
        port: u16,
        config: &GlobalConfig,
        sink: AdvisorySink,
    ) -> Result<Self> {
        let key = unit.key();
        let span = info_span!("session_launch", session = %key, port);

        async move {
            let default_suffix = config.suffix_for(&key.dialect);
            let suffix = unit.suffix.as_deref().unwrap_or(&default_suffix);

            let mut sync = SourceSynchronizer::create(config.temp_root.as_deref())?;
            sync.store(unit.position, &unit.stable_id, &unit.text, suffix)?;

            let channel = ReadinessChannel::bind(&config.host).await?;
            let address = format!("http://{}:{port}", config.host);
            let control = BackendControl::new(
                address.clone(),
                config.endpoints.clone(),
                config.reload_timeout(),
                config.stop_timeout(),
            )?;

            let health = HealthState::new();
            let spec = LaunchSpec {
                key: &key,
                backend: config.backend_for(&key.dialect),
                port,
                source_dir: sync.root(),
            };
            let (process, ready) = supervisor::spawn(&spec, channel, health.clone(), sink)?;

            Ok(Self {
                key,
                port,
                address,
                default_suffix,
                sync,
                process,
                ready: Some(ready),
                health,
                control,
                readiness_timeout: config.readiness_timeout(),
            })
        }
        .instrument(span)
        .await
    }

    /// Launch and block until the backend is ready.
    ///
    /// On any readiness failure the session is disposed before the error is
    /// returned.
    ///
    /// # Errors
    ///
    /// Everything [`launch`](Self::launch) and
    /// [`wait_ready`](Self::wait_ready) return.
    pub async fn start(
        unit: &UnitRequest,
        port: u16,
        config: &GlobalConfig,
        sink: AdvisorySink,
    ) -> Result<Self> {
        Self::start_cancellable(unit, port, config, sink, &CancellationToken::new()).await
    }

    /// Like [`start`](Self::start), but gives up as soon as `cancel` fires.
    ///
    /// # Errors
    ///
    /// Everything [`start`](Self::start) returns, plus `AppError::Readiness`
    /// when cancelled before the backend became ready. The backend is
    /// killed and its directory removed before the error is returned.
    pub async fn start_cancellable(
        unit: &UnitRequest,
        port: u16,
        config: &GlobalConfig,
        sink: AdvisorySink,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let mut session = Self::launch(unit, port, config, sink).await?;
        let ready = tokio::select! {
            result = session.wait_ready() => result,
            () = cancel.cancelled() => Err(AppError::Readiness(
                "session disposed while starting".into(),
            )),
        };
        if let Err(err) = ready {
            warn!(session = %session.key, %err, "backend failed to become ready");
            if let Err(dispose_err) = session.dispose().await {
                warn!(session = %session.key, %dispose_err, "cleanup after failed start");
            }
            return Err(err);
        }
        Ok(session)
    }

    /// Wait for the START signal, bounded by the configured timeout.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Readiness` if the backend fails, times out, or was
    /// already found not ready.
    pub async fn wait_ready(&mut self) -> Result<()> {
        let Some(ready) = self.ready.take() else {
            return match self.health.current() {
                Health::Healthy => Ok(()),
                other => Err(AppError::Readiness(format!("session is {other:?}"))),
            };
        };
        ready.wait(self.readiness_timeout).await?;
        info!(session = %self.key, address = %self.address, "backend ready");
        Ok(())
    }

    /// Write `unit` into the running backend's source directory and ask it
    /// to reload. Returns the session address.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Control` if the session is disposed or the reload
    /// fails, and `AppError::Sync`/`PathViolation` if the write fails.
    pub async fn execute(&mut self, unit: &UnitRequest) -> Result<String> {
        if self.health.is_terminated() {
            return Err(AppError::Control(format!(
                "session {} already disposed",
                self.key
            )));
        }
        let suffix = unit.suffix.as_deref().unwrap_or(&self.default_suffix);
        self.sync
            .store(unit.position, &unit.stable_id, &unit.text, suffix)?;
        self.control.reload().await?;
        debug!(session = %self.key, stable_id = %unit.stable_id, "unit reloaded");
        Ok(self.address.clone())
    }

    /// Stop the backend and delete the source directory.
    ///
    /// Sends the graceful stop request (failure tolerated), then always
    /// kills and reaps the child, then removes the directory.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Sync` if the source directory could not be
    /// removed. The process is terminated regardless.
    pub async fn dispose(&mut self) -> Result<()> {
        let span = info_span!("session_dispose", session = %self.key, pid = ?self.process.pid());
        async move {
            let was_running = self.process.is_running();
            self.health.transition(Health::Terminated);

            if was_running {
                if let Err(err) = self.control.stop().await {
                    debug!(%err, "graceful stop failed; forcing termination");
                }
            }

            if let Some(report) = self.process.terminate().await {
                info!(reason = %report.reason, "backend terminated");
            }

            self.sync.close()
        }
        .instrument(span)
        .await
    }

    /// `http://host:port` of the backend.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Port the backend serves on.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Current health.
    #[must_use]
    pub fn health(&self) -> Health {
        self.health.current()
    }

    /// Process id while the child is alive.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        if self.process.is_running() {
            self.process.pid()
        } else {
            None
        }
    }

    /// Directory the backend reads sources from.
    #[must_use]
    pub fn source_dir(&self) -> &Path {
        self.sync.root()
    }

    /// File currently backing `id`.
    #[must_use]
    pub fn source_path(&self, id: &StableId) -> Option<PathBuf> {
        self.sync.file_for(id).map(Path::to_path_buf)
    }

    /// Listing view.
    #[must_use]
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            document: self.key.document.clone(),
            dialect: self.key.dialect.clone(),
            address: self.address.clone(),
            health: self.health(),
            pid: self.pid(),
            units: self.sync.unit_count(),
        }
    }
}
