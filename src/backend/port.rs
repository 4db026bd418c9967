//! Ephemeral port allocation.
//!
//! Binds a listener on port 0, reads back the OS-assigned port, and drops
//! the listener. The child binds the port later, so another process may
//! claim it in between; that window is accepted.

use tokio::net::TcpListener;
use tracing::debug;

use crate::{AppError, Result};

/// Obtain a currently-free local port on `host`.
///
/// # Errors
///
/// Returns `AppError::Port` if no listener can be bound or its address
/// cannot be read back.
pub async fn acquire(host: &str) -> Result<u16> {
    let listener = TcpListener::bind((host, 0))
        .await
        .map_err(|err| AppError::Port(format!("failed to bind {host}:0: {err}")))?;
    let port = listener
        .local_addr()
        .map_err(|err| AppError::Port(format!("failed to read bound address: {err}")))?
        .port();
    drop(listener);

    debug!(host, port, "allocated ephemeral port");
    Ok(port)
}
