//! Shared health state for one session.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

use crate::models::session::Health;

/// Health cell shared between a session and its process monitor.
///
/// Transitions outside [`Health::can_transition_to`] are ignored, so a late
/// START cannot revive an unhealthy backend and nothing leaves `Terminated`.
#[derive(Debug, Clone)]
pub struct HealthState {
    tx: Arc<watch::Sender<Health>>,
}

impl HealthState {
    /// New cell in `Starting`.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Health::Starting);
        Self { tx: Arc::new(tx) }
    }

    /// Current health.
    #[must_use]
    pub fn current(&self) -> Health {
        *self.tx.borrow()
    }

    /// Whether the owning session has been disposed.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.current() == Health::Terminated
    }

    /// Move to `next` if the transition is legal; returns whether it happened.
    pub fn transition(&self, next: Health) -> bool {
        self.tx.send_if_modified(|current| {
            if current.can_transition_to(next) {
                debug!(from = ?*current, to = ?next, "health transition");
                *current = next;
                true
            } else {
                false
            }
        })
    }
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}
