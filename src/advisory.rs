//! User-visible advisories raised by supervised backends.
//!
//! Post-readiness failures never surface as errors on an in-flight call.
//! They travel as [`Advisory`] values through an [`AdvisorySink`] to
//! whatever presents them, and are mirrored to `tracing`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::models::session::SessionKey;

/// Advisory severity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AdvisoryLevel {
    /// Informational (backend started).
    Info,
    /// Something odd that does not change health.
    Warning,
    /// Backend failure.
    Error,
}

/// A message for the user about one session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Advisory {
    /// Session the advisory concerns.
    pub key: SessionKey,
    /// Severity.
    pub level: AdvisoryLevel,
    /// Message text.
    pub message: String,
    /// When the advisory was raised.
    pub at: DateTime<Utc>,
}

/// Cloneable handle that delivers advisories.
///
/// A sink without a receiver only logs.
#[derive(Debug, Clone, Default)]
pub struct AdvisorySink {
    tx: Option<mpsc::UnboundedSender<Advisory>>,
}

impl AdvisorySink {
    /// Create a sink and the receiver that observes it.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Advisory>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A sink that only logs.
    #[must_use]
    pub fn log_only() -> Self {
        Self::default()
    }

    /// Raise an advisory for `key`.
    pub fn emit(&self, key: &SessionKey, level: AdvisoryLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            AdvisoryLevel::Info => info!(session = %key, %message, "advisory"),
            AdvisoryLevel::Warning => warn!(session = %key, %message, "advisory"),
            AdvisoryLevel::Error => error!(session = %key, %message, "advisory"),
        }

        if let Some(tx) = &self.tx {
            let advisory = Advisory {
                key: key.clone(),
                level,
                message,
                at: Utc::now(),
            };
            if tx.send(advisory).is_err() {
                warn!(session = %key, "advisory receiver dropped");
            }
        }
    }
}
