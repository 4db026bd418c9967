//! Backend control client against an in-process HTTP stub.

use std::time::Duration;

use axum::http::StatusCode;
use axum::routing::post;
use axum::Router;
use tokio_util::sync::CancellationToken;

use backend_warden::backend::control::BackendControl;
use backend_warden::config::EndpointConfig;
use backend_warden::AppError;

/// Serve `router` on an ephemeral port; cancel `ct` to stop.
async fn spawn_stub(router: Router) -> (String, CancellationToken) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral");
    let addr = listener.local_addr().expect("local addr");
    let ct = CancellationToken::new();
    let server_ct = ct.clone();
    tokio::spawn(async move {
        let _ = axum::serve(listener, router)
            .with_graceful_shutdown(async move { server_ct.cancelled().await })
            .await;
    });
    (format!("http://{addr}"), ct)
}

fn control(address: &str) -> BackendControl {
    BackendControl::new(
        address,
        EndpointConfig::default(),
        Duration::from_millis(500),
        Duration::from_millis(500),
    )
    .expect("client")
}

#[tokio::test]
async fn reload_succeeds_on_2xx() {
    let router = Router::new().route("/reload", post(|| async { StatusCode::NO_CONTENT }));
    let (address, ct) = spawn_stub(router).await;

    control(&address).reload().await.expect("reload");
    ct.cancel();
}

#[tokio::test]
async fn non_success_status_is_control_error() {
    let router = Router::new()
        .route("/reload", post(|| async { StatusCode::INTERNAL_SERVER_ERROR }))
        .route("/stopMain", post(|| async { StatusCode::OK }));
    let (address, ct) = spawn_stub(router).await;
    let control = control(&address);

    let err = control.reload().await.unwrap_err();
    assert!(matches!(&err, AppError::Control(msg) if msg.contains("500")), "{err}");
    control.stop().await.expect("stop");
    ct.cancel();
}

#[tokio::test]
async fn slow_backend_times_out() {
    let router = Router::new().route(
        "/reload",
        post(|| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            StatusCode::OK
        }),
    );
    let (address, ct) = spawn_stub(router).await;

    let err = control(&address).reload().await.unwrap_err();
    assert!(matches!(err, AppError::Control(_)));
    ct.cancel();
}

#[tokio::test]
async fn unreachable_backend_is_control_error() {
    let port = backend_warden::backend::port::acquire("127.0.0.1")
        .await
        .expect("port");
    let err = control(&format!("http://127.0.0.1:{port}"))
        .stop()
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Control(_)));
}

#[tokio::test]
async fn custom_endpoint_paths_are_used() {
    let router = Router::new().route("/api/refresh", post(|| async { StatusCode::OK }));
    let (address, ct) = spawn_stub(router).await;
    let endpoints = EndpointConfig {
        reload: "/api/refresh".into(),
        stop: "/api/halt".into(),
    };
    let control = BackendControl::new(
        address.as_str(),
        endpoints,
        Duration::from_secs(1),
        Duration::from_secs(1),
    )
    .expect("client");

    control.reload().await.expect("custom reload path");
    assert!(control.stop().await.is_err(), "missing stop route answers 404");
    assert_eq!(control.address(), address);
    ct.cancel();
}
