//! Readiness channel: out-of-band status signals from a backend.
//!
//! Before a backend is spawned the supervisor binds a loopback listener on
//! an OS-assigned port and hands its `host:port` to the child. The child
//! connects and writes newline-delimited JSON records (see
//! [`crate::models::signal`]). Every decoded record is forwarded to the
//! session's process monitor, which decides what it means for readiness
//! and health.
//!
//! A backend may connect more than once (e.g. reconnect after a restart of
//! its logging component); all connections feed the same stream.

use std::net::SocketAddr;

use futures_util::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};

use crate::backend::codec::SignalCodec;
use crate::models::signal::ReadinessSignal;
use crate::{AppError, Result};

/// Buffered events between the listener and the monitor.
const EVENT_BUFFER: usize = 64;

/// Something that arrived on the readiness channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// A well-formed record.
    Signal(ReadinessSignal),
    /// A record that could not be decoded; carries the reason.
    Malformed(String),
}

/// Bound, not yet serving, readiness listener.
#[derive(Debug)]
pub struct ReadinessChannel {
    listener: TcpListener,
    address: SocketAddr,
}

impl ReadinessChannel {
    /// Bind a listener on `host` with an OS-assigned port.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Readiness` if the listener cannot be bound.
    pub async fn bind(host: &str) -> Result<Self> {
        let listener = TcpListener::bind((host, 0)).await.map_err(|err| {
            AppError::Readiness(format!("failed to bind readiness listener: {err}"))
        })?;
        let address = listener.local_addr().map_err(|err| {
            AppError::Readiness(format!("failed to read readiness listener address: {err}"))
        })?;
        Ok(Self { listener, address })
    }

    /// Address passed to the child as `--ipcAddress`.
    #[must_use]
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Start accepting connections.
    ///
    /// The accept task stops when `cancel` fires or the returned receiver is
    /// dropped; the listener is closed when the returned task completes.
    #[must_use]
    pub fn listen(
        self,
        cancel: CancellationToken,
    ) -> (mpsc::Receiver<ChannelEvent>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let span = info_span!("readiness_channel", address = %self.address);
        let listener = self.listener;

        let accept = tokio::spawn(
            async move {
                loop {
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        () = tx.closed() => break,
                        accepted = listener.accept() => match accepted {
                            Ok((stream, peer)) => {
                                debug!(%peer, "readiness connection accepted");
                                tokio::spawn(
                                    read_connection(stream, tx.clone(), cancel.clone())
                                        .in_current_span(),
                                );
                            }
                            Err(err) => warn!(%err, "readiness accept failed"),
                        }
                    }
                }
                debug!("readiness listener closed");
            }
            .instrument(span),
        );

        (rx, accept)
    }
}

async fn read_connection(
    stream: TcpStream,
    tx: mpsc::Sender<ChannelEvent>,
    cancel: CancellationToken,
) {
    let mut frames = FramedRead::new(stream, SignalCodec::new());

    loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => break,
            frame = frames.next() => frame,
        };

        let event = match frame {
            Some(Ok(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match ReadinessSignal::parse_line(&line) {
                    Ok(signal) => ChannelEvent::Signal(signal),
                    Err(err) => ChannelEvent::Malformed(err.to_string()),
                }
            }
            Some(Err(err)) => {
                let _ = tx.send(ChannelEvent::Malformed(err.to_string())).await;
                break;
            }
            None => break,
        };

        if tx.send(event).await.is_err() {
            break;
        }
    }

    debug!("readiness connection closed");
}
