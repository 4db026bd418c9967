//! Backend session supervision.
//!
//! Leaf-first:
//! - [`port`]: ephemeral port allocation.
//! - [`sync`]: per-session source mirror with stable-identity tracking.
//! - [`codec`] and [`readiness`]: the out-of-band readiness channel.
//! - [`control`]: reload/stop requests to a running backend.
//! - [`health`]: the per-session health state machine.
//! - [`supervisor`]: process spawning and monitoring.
//! - [`session`]: the composite unit the rest of the system holds.
//! - [`registry`]: at most one session per (document, dialect).

pub mod codec;
pub mod control;
pub mod health;
pub mod port;
pub mod readiness;
pub mod registry;
pub mod session;
pub mod supervisor;
pub mod sync;
