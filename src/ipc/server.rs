//! Local IPC server through which an editing surface drives the registry.
//!
//! Listens on a named pipe (Windows) or Unix domain socket (Linux/macOS)
//! using the `interprocess` crate. Each connection may send any number of
//! requests; each request gets exactly one response line. Requests on one
//! connection are handled in order.
//!
//! ## Protocol
//!
//! Request (one JSON object per line):
//! ```json
//! {"command": "execute", "document": "file:///nb.vdmnb", "dialect": "vdmsl",
//!  "stable_id": "3f2a…", "position": 0, "text": "values x = 1"}
//! {"command": "dispose", "document": "file:///nb.vdmnb"}
//! {"command": "dispose", "document": "file:///nb.vdmnb", "dialect": "vdmsl"}
//! {"command": "list"}
//! ```
//!
//! Response (one JSON object per line):
//! ```json
//! {"ok": true, "data": {"address": "http://127.0.0.1:41234", "stable_id": "3f2a…"}}
//! {"ok": false, "error": "readiness: startup timeout: …"}
//! ```
//!
//! `stable_id` may be omitted on `execute`; a fresh identity is assigned and
//! returned so the caller can persist it with the unit.

use std::sync::Arc;

use interprocess::local_socket::{tokio::prelude::*, GenericNamespaced, ListenerOptions};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::backend::registry::SessionRegistry;
use crate::models::session::{Dialect, DocumentId, SessionKey};
use crate::models::unit::{StableId, UnitRequest};
use crate::{AppError, Result};

/// Inbound request.
#[derive(Debug, Deserialize)]
struct IpcRequest {
    /// Command verb.
    command: String,
    /// Document identifier (`execute`, `dispose`).
    document: Option<String>,
    /// Dialect (`execute`; optional narrowing for `dispose`).
    dialect: Option<String>,
    /// Unit identity (`execute`).
    stable_id: Option<String>,
    /// Unit position (`execute`).
    position: Option<usize>,
    /// Unit source (`execute`).
    text: Option<String>,
    /// File suffix override (`execute`).
    suffix: Option<String>,
}

/// Outbound response.
#[derive(Debug, Serialize)]
struct IpcResponse {
    /// Whether the command succeeded.
    ok: bool,
    /// Payload on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<serde_json::Value>,
    /// Error message on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl IpcResponse {
    fn success(data: serde_json::Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

impl From<AppError> for IpcResponse {
    fn from(err: AppError) -> Self {
        Self::error(err.to_string())
    }
}

/// Spawn the IPC server task on socket `name`.
///
/// # Errors
///
/// Returns `AppError::Ipc` if the listener cannot be created.
pub fn spawn_ipc_server(
    registry: Arc<SessionRegistry>,
    name: &str,
    ct: CancellationToken,
) -> Result<tokio::task::JoinHandle<()>> {
    let listener_name = name
        .to_owned()
        .to_ns_name::<GenericNamespaced>()
        .map_err(|err| AppError::Ipc(format!("invalid ipc socket name '{name}': {err}")))?;

    let listener = ListenerOptions::new()
        .name(listener_name)
        .create_tokio()
        .map_err(|err| AppError::Ipc(format!("failed to create ipc listener: {err}")))?;

    info!(ipc_name = %name, "IPC server listening");

    let span = info_span!("ipc_server", name = %name);
    let handle = tokio::spawn(
        async move {
            loop {
                tokio::select! {
                    () = ct.cancelled() => {
                        info!("IPC server shutting down");
                        break;
                    }
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok(stream) => {
                                let registry = Arc::clone(&registry);
                                tokio::spawn(handle_connection(stream, registry, ct.clone()));
                            }
                            Err(err) => {
                                warn!(%err, "IPC accept failed");
                            }
                        }
                    }
                }
            }
        }
        .instrument(span),
    );

    Ok(handle)
}

/// Handle a single client connection.
async fn handle_connection(
    stream: interprocess::local_socket::tokio::Stream,
    registry: Arc<SessionRegistry>,
    ct: CancellationToken,
) {
    let span = info_span!("ipc_conn");
    async move {
        let (reader, mut writer) = stream.split();
        let mut buf_reader = BufReader::new(reader);
        let mut line = String::new();

        loop {
            line.clear();
            let read = tokio::select! {
                () = ct.cancelled() => break,
                read = buf_reader.read_line(&mut line) => read,
            };
            match read {
                Ok(0) => break,
                Ok(_) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }

                    let response = match serde_json::from_str::<IpcRequest>(trimmed) {
                        Ok(request) => dispatch_command(request, &registry).await,
                        Err(err) => IpcResponse::error(format!("invalid json: {err}")),
                    };

                    let mut response_line = serde_json::to_string(&response).unwrap_or_else(|_| {
                        r#"{"ok":false,"error":"serialization failed"}"#.to_owned()
                    });
                    response_line.push('\n');

                    if let Err(err) = writer.write_all(response_line.as_bytes()).await {
                        warn!(%err, "failed to write ipc response");
                        break;
                    }
                }
                Err(err) => {
                    warn!(%err, "ipc read error");
                    break;
                }
            }
        }

        info!("IPC connection closed");
    }
    .instrument(span)
    .await;
}

/// Route a request to its handler.
async fn dispatch_command(request: IpcRequest, registry: &SessionRegistry) -> IpcResponse {
    let span = info_span!("ipc_command", command = %request.command);
    async move {
        let result = match request.command.as_str() {
            "execute" => handle_execute(request, registry).await,
            "dispose" => handle_dispose(request, registry).await,
            "list" => handle_list(registry).await,
            other => return IpcResponse::error(format!("unknown command: {other}")),
        };
        result.map_or_else(IpcResponse::from, IpcResponse::success)
    }
    .instrument(span)
    .await
}

fn required<T>(field: Option<T>, name: &str) -> Result<T> {
    field.ok_or_else(|| AppError::Ipc(format!("missing required '{name}' field")))
}

/// Run a unit and return the session address.
async fn handle_execute(
    request: IpcRequest,
    registry: &SessionRegistry,
) -> Result<serde_json::Value> {
    let document = DocumentId::new(required(request.document, "document")?);
    let dialect = Dialect::parse(&required(request.dialect, "dialect")?)?;
    let stable_id = match request.stable_id {
        Some(raw) => StableId::parse(&raw)?,
        None => StableId::generate(),
    };

    let unit = UnitRequest {
        document,
        dialect,
        stable_id,
        position: required(request.position, "position")?,
        text: required(request.text, "text")?,
        suffix: request.suffix,
    };

    let address = registry.get_or_create(&unit).await?;
    info!(session = %unit.key(), stable_id = %unit.stable_id, %address, "unit executed via IPC");
    Ok(serde_json::json!({ "address": address, "stable_id": unit.stable_id }))
}

/// Dispose one session or every session of a document.
async fn handle_dispose(
    request: IpcRequest,
    registry: &SessionRegistry,
) -> Result<serde_json::Value> {
    let document = DocumentId::new(required(request.document, "document")?);
    let disposed = match request.dialect {
        Some(raw) => {
            let key = SessionKey::new(document, Dialect::parse(&raw)?);
            usize::from(registry.dispose(&key).await?)
        }
        None => registry.dispose_all(&document).await,
    };
    Ok(serde_json::json!({ "disposed": disposed }))
}

/// List live sessions.
async fn handle_list(registry: &SessionRegistry) -> Result<serde_json::Value> {
    let sessions = registry.snapshot().await;
    serde_json::to_value(&sessions)
        .map(|sessions| serde_json::json!({ "sessions": sessions }))
        .map_err(|err| AppError::Ipc(format!("failed to serialize sessions: {err}")))
}
