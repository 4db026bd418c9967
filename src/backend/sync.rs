//! Per-session source mirror.
//!
//! Each session owns one temporary directory holding one file per live
//! unit, named `<stable_id>.<suffix>`. The synchronizer is the only writer
//! of that directory. It tracks two maps:
//!
//! - stable id → file path, so rewrites land on the same file;
//! - position → stable id, so a unit that vanished from a position (deleted
//!   or moved away and replaced) has its orphaned file removed.
//!
//! Position → id is kept one-to-one: recording an id at a new position drops
//! its stale entry at the old one, so a reordered unit is never mistaken for
//! an orphan.

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use tempfile::{NamedTempFile, TempDir};
use tracing::{debug, warn};

use crate::models::unit::StableId;
use crate::{AppError, Result};

static SUFFIX_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_+-]{0,31}$").ok());

/// Check that `suffix` is a plain file extension.
///
/// # Errors
///
/// Returns `AppError::PathViolation` if it could name anything but a file
/// directly inside the session directory.
pub fn validate_suffix(suffix: &str) -> Result<()> {
    let valid = SUFFIX_PATTERN
        .as_ref()
        .is_some_and(|pattern| pattern.is_match(suffix));
    if valid {
        Ok(())
    } else {
        Err(AppError::PathViolation(format!(
            "invalid file suffix '{suffix}'"
        )))
    }
}

/// Prefix for session directories.
const DIR_PREFIX: &str = "warden-";

/// Writes unit sources into a session-owned temporary directory.
#[derive(Debug)]
pub struct SourceSynchronizer {
    dir: Option<TempDir>,
    root: PathBuf,
    files: HashMap<StableId, PathBuf>,
    positions: BTreeMap<usize, StableId>,
}

impl SourceSynchronizer {
    /// Create a fresh directory under `parent` (system temp when `None`).
    ///
    /// # Errors
    ///
    /// Returns `AppError::Sync` if the directory cannot be created.
    pub fn create(parent: Option<&Path>) -> Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(DIR_PREFIX);
        let dir = match parent {
            Some(parent) => builder.tempdir_in(parent),
            None => builder.tempdir(),
        }
        .map_err(|err| AppError::Sync(format!("failed to create session directory: {err}")))?;

        let root = dir.path().to_path_buf();
        debug!(root = %root.display(), "created session source directory");

        Ok(Self {
            dir: Some(dir),
            root,
            files: HashMap::new(),
            positions: BTreeMap::new(),
        })
    }

    /// Directory the backend reads sources from.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether [`close`](Self::close) has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.dir.is_none()
    }

    /// Deterministic path for a unit.
    ///
    /// # Errors
    ///
    /// Returns `AppError::PathViolation` if `suffix` is not a plain extension.
    pub fn path_for(&self, id: &StableId, suffix: &str) -> Result<PathBuf> {
        validate_suffix(suffix)?;
        Ok(self.root.join(format!("{id}.{suffix}")))
    }

    /// Write `text` as the source of unit `id`.
    ///
    /// Calling again with the same `id` overwrites the same file. If the
    /// suffix changed, the previous file is removed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Sync` if the synchronizer is closed or the write
    /// fails, and `AppError::PathViolation` for an invalid suffix.
    pub fn write_unit(&mut self, id: &StableId, text: &str, suffix: &str) -> Result<PathBuf> {
        if self.is_closed() {
            return Err(AppError::Sync("source directory already removed".into()));
        }
        let path = self.path_for(id, suffix)?;

        let mut tmp = NamedTempFile::new_in(&self.root)
            .map_err(|err| AppError::Sync(format!("failed to create temporary file: {err}")))?;
        tmp.write_all(text.as_bytes())
            .map_err(|err| AppError::Sync(format!("failed to write temporary file: {err}")))?;
        tmp.persist(&path).map_err(|err| {
            AppError::Sync(format!("failed to persist {}: {err}", path.display()))
        })?;

        if let Some(previous) = self.files.insert(id.clone(), path.clone()) {
            if previous != path {
                remove_best_effort(&previous);
            }
        }

        debug!(stable_id = %id, path = %path.display(), bytes = text.len(), "unit source written");
        Ok(path)
    }

    /// Record that `id` now occupies `position`.
    ///
    /// If a different id was recorded there, its file is deleted and its
    /// mapping dropped. Deletion failures are logged and do not stop the new
    /// mapping from being recorded.
    pub fn reconcile_position(&mut self, position: usize, id: &StableId) {
        if let Some(previous) = self.positions.get(&position) {
            if previous != id {
                let orphan = previous.clone();
                if let Some(path) = self.files.remove(&orphan) {
                    debug!(position, orphan = %orphan, replacement = %id, "removing orphaned unit");
                    remove_best_effort(&path);
                }
            }
        }

        self.positions.retain(|pos, recorded| *pos == position || recorded != id);
        self.positions.insert(position, id.clone());
    }

    /// Reconcile `position` and write the unit in one step.
    ///
    /// # Errors
    ///
    /// See [`write_unit`](Self::write_unit).
    pub fn store(
        &mut self,
        position: usize,
        id: &StableId,
        text: &str,
        suffix: &str,
    ) -> Result<PathBuf> {
        self.path_for(id, suffix)?;
        self.reconcile_position(position, id);
        self.write_unit(id, text, suffix)
    }

    /// File currently backing `id`.
    #[must_use]
    pub fn file_for(&self, id: &StableId) -> Option<&Path> {
        self.files.get(id).map(PathBuf::as_path)
    }

    /// Identity last recorded at `position`.
    #[must_use]
    pub fn unit_at(&self, position: usize) -> Option<&StableId> {
        self.positions.get(&position)
    }

    /// Number of unit files on disk.
    #[must_use]
    pub fn unit_count(&self) -> usize {
        self.files.len()
    }

    /// Delete the directory and everything in it. Safe to call twice.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Sync` if the directory could not be removed.
    pub fn close(&mut self) -> Result<()> {
        self.files.clear();
        self.positions.clear();
        let Some(dir) = self.dir.take() else {
            return Ok(());
        };
        dir.close().map_err(|err| {
            AppError::Sync(format!(
                "failed to remove {}: {err}",
                self.root.display()
            ))
        })?;
        debug!(root = %self.root.display(), "session source directory removed");
        Ok(())
    }
}

fn remove_best_effort(path: &Path) {
    if let Err(err) = std::fs::remove_file(path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), %err, "failed to delete stale unit source");
        }
    }
}
