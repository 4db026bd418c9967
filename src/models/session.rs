//! Session identity, health, and summary types.

use std::fmt::{Display, Formatter};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{AppError, Result};

static DIALECT_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_+-]{0,63}$").ok());

/// Identity of the document (notebook) that owns a set of sessions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    /// Wrap a document identifier such as a notebook URI.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for DocumentId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Source language interpreted by a backend (e.g. `vdmsl`).
///
/// Dialects travel to the child as a command-line argument and double as the
/// default file suffix, so they are restricted to a conservative charset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Dialect(String);

impl Dialect {
    /// Validate and wrap a dialect name.
    ///
    /// # Errors
    ///
    /// Returns `AppError::PathViolation` if the name is empty or contains
    /// characters outside `[A-Za-z0-9_+-]`.
    pub fn parse(name: &str) -> Result<Self> {
        let valid = DIALECT_PATTERN
            .as_ref()
            .is_some_and(|pattern| pattern.is_match(name));
        if valid {
            Ok(Self(name.to_owned()))
        } else {
            Err(AppError::PathViolation(format!("invalid dialect '{name}'")))
        }
    }

    /// Borrow the dialect name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Dialect {
    type Error = AppError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Dialect> for String {
    fn from(value: Dialect) -> Self {
        value.0
    }
}

impl Display for Dialect {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Registry key: at most one live session exists per pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionKey {
    /// Owning document.
    pub document: DocumentId,
    /// Backend dialect.
    pub dialect: Dialect,
}

impl SessionKey {
    /// Build a key from its parts.
    #[must_use]
    pub fn new(document: DocumentId, dialect: Dialect) -> Self {
        Self { document, dialect }
    }
}

impl Display for SessionKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.document, self.dialect)
    }
}

/// Health of a supervised backend.
///
/// `Starting → Healthy → Unhealthy → Terminated`; any state may move to
/// `Terminated`, and nothing leaves it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    /// Child spawned, no START yet.
    Starting,
    /// START received; reloads are expected to succeed.
    Healthy,
    /// Child reported STOP/ERROR, wrote to stderr, or exited.
    Unhealthy,
    /// Session disposed.
    Terminated,
}

impl Health {
    /// Whether a transition from `self` to `next` is permitted.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Starting, Self::Healthy | Self::Unhealthy)
                | (Self::Healthy, Self::Unhealthy)
                | (Self::Starting | Self::Healthy | Self::Unhealthy, Self::Terminated)
        )
    }
}

/// Point-in-time view of a session, for listings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionSummary {
    /// Owning document.
    pub document: DocumentId,
    /// Backend dialect.
    pub dialect: Dialect,
    /// `http://host:port` of the backend.
    pub address: String,
    /// Current health.
    pub health: Health,
    /// OS process id, while the child is alive.
    pub pid: Option<u32>,
    /// Number of unit files currently materialized.
    pub units: usize,
}
