//! Global configuration parsing and validation.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::info;

use crate::backend::sync::validate_suffix;
use crate::models::session::Dialect;
use crate::{AppError, Result};

/// Environment variable that overrides `backend.command`.
pub const COMMAND_ENV_VAR: &str = "BACKEND_WARDEN_COMMAND";

/// How to launch a backend interpreter.
///
/// The supervisor appends its own arguments (`-p`, `-t`, `--sourcePath`,
/// `--ipcAddress`) after `args`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct BackendCommand {
    /// Executable to run (e.g. `java`).
    pub command: String,
    /// Leading arguments (e.g. `["-jar", "vdmj-remote.jar"]`).
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory for the child; inherits the supervisor's when unset.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Extra environment variables passed to the child.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Per-dialect overrides.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct DialectConfig {
    /// File suffix for unit sources; defaults to the dialect name.
    #[serde(default)]
    pub suffix: Option<String>,
    /// Replacement backend command for this dialect.
    #[serde(default)]
    pub backend: Option<BackendCommand>,
}

/// Timeout values, in seconds.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TimeoutConfig {
    /// Upper bound on waiting for a START signal.
    #[serde(default = "default_readiness_seconds")]
    pub readiness_seconds: u64,
    /// Upper bound on a reload request.
    #[serde(default = "default_reload_seconds")]
    pub reload_seconds: u64,
    /// Upper bound on the graceful stop request before the forced kill.
    #[serde(default = "default_stop_seconds")]
    pub stop_seconds: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            readiness_seconds: default_readiness_seconds(),
            reload_seconds: default_reload_seconds(),
            stop_seconds: default_stop_seconds(),
        }
    }
}

fn default_readiness_seconds() -> u64 {
    30
}

fn default_reload_seconds() -> u64 {
    10
}

fn default_stop_seconds() -> u64 {
    5
}

/// HTTP control endpoints exposed by a running backend.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct EndpointConfig {
    /// Re-read the source directory.
    #[serde(default = "default_reload_path")]
    pub reload: String,
    /// Graceful stop.
    #[serde(default = "default_stop_path")]
    pub stop: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            reload: default_reload_path(),
            stop: default_stop_path(),
        }
    }
}

fn default_reload_path() -> String {
    "/reload".into()
}

fn default_stop_path() -> String {
    "/stopMain".into()
}

fn default_host() -> String {
    "127.0.0.1".into()
}

fn default_ipc_name() -> String {
    "backend-warden".into()
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Loopback host the backends and the readiness listener bind to.
    #[serde(default = "default_host")]
    pub host: String,
    /// Named pipe / Unix socket identifier for the control surface.
    #[serde(default = "default_ipc_name")]
    pub ipc_name: String,
    /// Parent directory for session temp directories; system temp when unset.
    #[serde(default)]
    pub temp_root: Option<PathBuf>,
    /// Default backend launch command.
    pub backend: BackendCommand,
    /// Dialect-specific overrides keyed by dialect name.
    #[serde(default)]
    pub dialects: HashMap<String, DialectConfig>,
    /// Timeout configuration.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Backend control endpoints.
    #[serde(default)]
    pub endpoints: EndpointConfig,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and validate it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Replace `backend.command` with [`COMMAND_ENV_VAR`] when it is set.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(command) = env::var(COMMAND_ENV_VAR) {
            if !command.trim().is_empty() {
                info!(command, "backend command overridden from environment");
                self.backend.command = command;
            }
        }
    }

    /// Backend command to use for `dialect`.
    #[must_use]
    pub fn backend_for(&self, dialect: &Dialect) -> &BackendCommand {
        self.dialects
            .get(dialect.as_str())
            .and_then(|d| d.backend.as_ref())
            .unwrap_or(&self.backend)
    }

    /// Source file suffix for `dialect`.
    #[must_use]
    pub fn suffix_for(&self, dialect: &Dialect) -> String {
        self.dialects
            .get(dialect.as_str())
            .and_then(|d| d.suffix.clone())
            .unwrap_or_else(|| dialect.as_str().to_owned())
    }

    /// Readiness wait bound.
    #[must_use]
    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.readiness_seconds)
    }

    /// Reload request bound.
    #[must_use]
    pub fn reload_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.reload_seconds)
    }

    /// Graceful stop bound.
    #[must_use]
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.stop_seconds)
    }

    fn validate(&mut self) -> Result<()> {
        if self.backend.command.trim().is_empty() {
            return Err(AppError::Config("backend.command must not be empty".into()));
        }

        for (name, seconds) in [
            ("readiness_seconds", self.timeouts.readiness_seconds),
            ("reload_seconds", self.timeouts.reload_seconds),
            ("stop_seconds", self.timeouts.stop_seconds),
        ] {
            if seconds == 0 {
                return Err(AppError::Config(format!(
                    "timeouts.{name} must be greater than zero"
                )));
            }
        }

        for (name, dialect) in &self.dialects {
            Dialect::parse(name)?;
            if let Some(suffix) = &dialect.suffix {
                validate_suffix(suffix).map_err(|_| {
                    AppError::Config(format!(
                        "dialects.{name}.suffix '{suffix}' is not a plain file extension"
                    ))
                })?;
            }
            if let Some(backend) = &dialect.backend {
                if backend.command.trim().is_empty() {
                    return Err(AppError::Config(format!(
                        "dialects.{name}.backend.command must not be empty"
                    )));
                }
            }
        }

        for path in [&self.endpoints.reload, &self.endpoints.stop] {
            if !path.starts_with('/') {
                return Err(AppError::Config(format!(
                    "endpoint '{path}' must start with '/'"
                )));
            }
        }

        if let Some(root) = &self.temp_root {
            let canonical = root
                .canonicalize()
                .map_err(|err| AppError::Config(format!("temp_root invalid: {err}")))?;
            self.temp_root = Some(canonical);
        }

        Ok(())
    }
}
