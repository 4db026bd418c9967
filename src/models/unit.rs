//! Unit identity and execution requests.

use std::fmt::{Display, Formatter};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::session::{Dialect, DocumentId, SessionKey};
use crate::{AppError, Result};

static STABLE_ID_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]{0,127}$").ok());

/// Identity of a unit that survives reordering, insertion, and deletion.
///
/// Assigned once per unit and stored with the unit's metadata. The
/// identity is used verbatim as a file stem, so it may not contain path
/// separators or start with a dot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StableId(String);

impl StableId {
    /// Assign a fresh identity.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Validate an identity supplied by the editing surface.
    ///
    /// # Errors
    ///
    /// Returns `AppError::PathViolation` if the identity is empty, too long,
    /// starts with a dot, or contains characters other than
    /// `[A-Za-z0-9_.-]`.
    pub fn parse(raw: &str) -> Result<Self> {
        let valid = STABLE_ID_PATTERN
            .as_ref()
            .is_some_and(|pattern| pattern.is_match(raw));
        if valid {
            Ok(Self(raw.to_owned()))
        } else {
            Err(AppError::PathViolation(format!(
                "invalid stable id '{raw}'"
            )))
        }
    }

    /// Borrow the raw identity.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for StableId {
    type Error = AppError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<StableId> for String {
    fn from(value: StableId) -> Self {
        value.0
    }
}

impl Display for StableId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// "Run this unit" request delivered by the editing surface.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnitRequest {
    /// Document the unit belongs to.
    pub document: DocumentId,
    /// Dialect of the unit's source.
    pub dialect: Dialect,
    /// Stable identity of the unit.
    pub stable_id: StableId,
    /// Current position among sibling units.
    pub position: usize,
    /// Full source text.
    pub text: String,
    /// File suffix; the dialect's configured suffix when absent.
    #[serde(default)]
    pub suffix: Option<String>,
}

impl UnitRequest {
    /// Registry key this request routes to.
    #[must_use]
    pub fn key(&self) -> SessionKey {
        SessionKey::new(self.document.clone(), self.dialect.clone())
    }
}
