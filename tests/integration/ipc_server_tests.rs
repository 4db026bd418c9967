//! IPC control surface: command dispatch over a local socket.

use std::sync::Arc;

use interprocess::local_socket::tokio::{prelude::*, RecvHalf, SendHalf, Stream};
use interprocess::local_socket::GenericNamespaced;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;

use backend_warden::advisory::AdvisorySink;
use backend_warden::ipc::server::spawn_ipc_server;
use backend_warden::SessionRegistry;

use super::test_helpers::Fixture;

struct Client {
    reader: BufReader<RecvHalf>,
    writer: SendHalf,
}

impl Client {
    async fn connect(name: &str) -> Self {
        let name = name
            .to_owned()
            .to_ns_name::<GenericNamespaced>()
            .expect("socket name");
        let stream = Stream::connect(name).await.expect("connect");
        let (reader, writer) = stream.split();
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }

    async fn send_raw(&mut self, line: &str) -> Value {
        self.writer
            .write_all(format!("{line}\n").as_bytes())
            .await
            .expect("write request");
        let mut response = String::new();
        self.reader
            .read_line(&mut response)
            .await
            .expect("read response");
        serde_json::from_str(&response).expect("json response")
    }

    async fn send(&mut self, request: &Value) -> Value {
        self.send_raw(&request.to_string()).await
    }
}

struct Server {
    registry: Arc<SessionRegistry>,
    name: String,
    ct: CancellationToken,
    _fixture: Fixture,
}

impl Server {
    fn start() -> Self {
        let fixture = Fixture::new("ready");
        let registry = Arc::new(SessionRegistry::new(
            Arc::new(fixture.config.clone()),
            AdvisorySink::log_only(),
        ));
        let name = format!("warden-test-{}", uuid::Uuid::new_v4());
        let ct = CancellationToken::new();
        spawn_ipc_server(Arc::clone(&registry), &name, ct.clone()).expect("ipc server");
        Self {
            registry,
            name,
            ct,
            _fixture: fixture,
        }
    }

    async fn stop(self) {
        self.ct.cancel();
        self.registry.shutdown().await;
    }
}

#[tokio::test]
async fn execute_list_and_dispose() {
    let server = Server::start();
    let mut client = Client::connect(&server.name).await;

    let executed = client
        .send(&json!({
            "command": "execute",
            "document": "file:///nb.vdmnb",
            "dialect": "vdmsl",
            "position": 0,
            "text": "values x = 1",
        }))
        .await;
    assert_eq!(executed["ok"], true, "{executed}");
    let address = executed["data"]["address"].as_str().expect("address");
    assert!(address.starts_with("http://127.0.0.1:"));
    let stable_id = executed["data"]["stable_id"].as_str().expect("assigned id");
    assert!(!stable_id.is_empty());

    let rerun = client
        .send(&json!({
            "command": "execute",
            "document": "file:///nb.vdmnb",
            "dialect": "vdmsl",
            "stable_id": stable_id,
            "position": 0,
            "text": "values x = 2",
        }))
        .await;
    assert_eq!(rerun["data"]["address"], address);
    assert_eq!(rerun["data"]["stable_id"], stable_id);

    let listed = client.send(&json!({ "command": "list" })).await;
    let sessions = listed["data"]["sessions"].as_array().expect("sessions");
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0]["dialect"], "vdmsl");
    assert_eq!(sessions[0]["health"], "healthy");
    assert_eq!(sessions[0]["units"], 1);

    let disposed = client
        .send(&json!({ "command": "dispose", "document": "file:///nb.vdmnb" }))
        .await;
    assert_eq!(disposed["data"]["disposed"], 1);

    let listed = client.send(&json!({ "command": "list" })).await;
    assert_eq!(listed["data"]["sessions"], json!([]));

    server.stop().await;
}

#[tokio::test]
async fn dispose_can_target_one_dialect() {
    let server = Server::start();
    let mut client = Client::connect(&server.name).await;

    for dialect in ["vdmsl", "vdmpp"] {
        let response = client
            .send(&json!({
                "command": "execute",
                "document": "nb",
                "dialect": dialect,
                "stable_id": "u1",
                "position": 0,
                "text": "x",
            }))
            .await;
        assert_eq!(response["ok"], true, "{response}");
    }

    let disposed = client
        .send(&json!({ "command": "dispose", "document": "nb", "dialect": "vdmpp" }))
        .await;
    assert_eq!(disposed["data"]["disposed"], 1);

    let listed = client.send(&json!({ "command": "list" })).await;
    let sessions = listed["data"]["sessions"].as_array().expect("sessions");
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0]["dialect"], "vdmsl");

    server.stop().await;
}

#[tokio::test]
async fn bad_requests_get_error_responses() {
    let server = Server::start();
    let mut client = Client::connect(&server.name).await;

    let invalid = client.send_raw("{not json").await;
    assert_eq!(invalid["ok"], false);
    assert!(invalid["error"].as_str().expect("error").starts_with("invalid json"));

    let unknown = client.send(&json!({ "command": "restart" })).await;
    assert_eq!(unknown["error"], "unknown command: restart");

    let missing = client
        .send(&json!({ "command": "execute", "document": "nb", "dialect": "vdmsl", "position": 0 }))
        .await;
    assert!(missing["error"].as_str().expect("error").contains("'text'"));

    let unsafe_id = client
        .send(&json!({
            "command": "execute",
            "document": "nb",
            "dialect": "vdmsl",
            "stable_id": "../escape",
            "position": 0,
            "text": "x",
        }))
        .await;
    assert!(unsafe_id["error"]
        .as_str()
        .expect("error")
        .starts_with("path violation"));

    // The connection stays usable after errors.
    let listed = client.send(&json!({ "command": "list" })).await;
    assert_eq!(listed["ok"], true);

    server.stop().await;
}
