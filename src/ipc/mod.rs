//! Local IPC control surface for `backend-warden-ctl` and editor glue.
//!
//! Provides a named pipe (Windows) or Unix domain socket (Linux/macOS)
//! server that accepts JSON-line commands and routes them to the
//! [`SessionRegistry`](crate::SessionRegistry).

pub mod server;
