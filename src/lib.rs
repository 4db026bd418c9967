#![forbid(unsafe_code)]

//! Supervisor for notebook interpreter backends.
//!
//! Spawns one backend process per (document, dialect), waits for it to
//! report readiness over a local signal channel, mirrors unit sources into
//! a per-session directory, asks the backend to reload as units change,
//! and tears everything down deterministically.

pub mod advisory;
pub mod backend;
pub mod config;
pub mod errors;
pub mod ipc;
pub mod models;

pub use backend::registry::SessionRegistry;
pub use config::GlobalConfig;
pub use errors::{AppError, Result};
