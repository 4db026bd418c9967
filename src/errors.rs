//! Error types shared across the supervisor.

use std::fmt::{Display, Formatter};

/// Shared supervisor result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Error enumeration covering every supervisor failure mode.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// No free local port could be obtained.
    Port(String),
    /// The backend executable could not be launched.
    Spawn(String),
    /// The backend never became ready (timeout, early exit, STOP/ERROR signal).
    Readiness(String),
    /// Source file write or delete failure.
    Sync(String),
    /// Reload or stop request to a running backend failed.
    Control(String),
    /// Local IPC control surface failure.
    Ipc(String),
    /// Unit identity or file suffix would escape the session directory.
    PathViolation(String),
    /// File-system or socket I/O failure.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Port(msg) => write!(f, "port: {msg}"),
            Self::Spawn(msg) => write!(f, "spawn: {msg}"),
            Self::Readiness(msg) => write!(f, "readiness: {msg}"),
            Self::Sync(msg) => write!(f, "sync: {msg}"),
            Self::Control(msg) => write!(f, "control: {msg}"),
            Self::Ipc(msg) => write!(f, "ipc: {msg}"),
            Self::PathViolation(msg) => write!(f, "path violation: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        Self::Control(err.to_string())
    }
}
