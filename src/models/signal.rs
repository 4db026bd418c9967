//! Readiness channel records.
//!
//! Wire format, one JSON object per line:
//!
//! ```json
//! {"type": "START", "message": "listening", "properties": {"port": "41234"}}
//! {"type": "ERROR", "message": "parse failed", "errorLevel": "FATAL"}
//! {"type": "STOP", "message": "shutdown requested"}
//! ```

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{AppError, Result};

/// Kind of readiness record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalKind {
    /// Backend is serving on its port.
    Start,
    /// Backend is shutting down.
    Stop,
    /// Backend reports an error.
    Error,
}

/// Raw record as it appears on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SignalRecord {
    /// Record kind.
    #[serde(rename = "type")]
    pub kind: SignalKind,
    /// Human-readable text.
    #[serde(default)]
    pub message: String,
    /// Severity, meaningful for `ERROR` only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_level: Option<String>,
    /// Free-form string properties.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<HashMap<String, String>>,
}

/// A decoded readiness signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadinessSignal {
    /// Signal kind.
    pub kind: SignalKind,
    /// Human-readable text.
    pub message: String,
    /// Severity; always `None` unless `kind` is `Error`.
    pub severity: Option<String>,
    /// Properties sent along with the record.
    pub properties: HashMap<String, String>,
}

impl ReadinessSignal {
    /// Parse one line of the readiness channel.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Readiness("malformed signal: …")` when the line is
    /// not a JSON object with a known `type`.
    pub fn parse_line(line: &str) -> Result<Self> {
        let record: SignalRecord = serde_json::from_str(line.trim())
            .map_err(|err| AppError::Readiness(format!("malformed signal: {err}")))?;
        Ok(Self::from(record))
    }

    /// Port the backend claims to be serving on, if it said.
    #[must_use]
    pub fn reported_port(&self) -> Option<u16> {
        self.properties.get("port").and_then(|p| p.parse().ok())
    }

    /// Text suitable for an advisory.
    #[must_use]
    pub fn describe(&self) -> String {
        match (self.kind, &self.severity) {
            (SignalKind::Start, _) => format!("backend started: {}", self.message),
            (SignalKind::Stop, _) => format!("backend exited: {}", self.message),
            (SignalKind::Error, Some(level)) => {
                format!("backend gave {level} error: {}", self.message)
            }
            (SignalKind::Error, None) => format!("backend gave error: {}", self.message),
        }
    }
}

impl From<SignalRecord> for ReadinessSignal {
    fn from(record: SignalRecord) -> Self {
        let severity = match record.kind {
            SignalKind::Error => record.error_level,
            SignalKind::Start | SignalKind::Stop => None,
        };
        Self {
            kind: record.kind,
            message: record.message,
            severity,
            properties: record.properties.unwrap_or_default(),
        }
    }
}
