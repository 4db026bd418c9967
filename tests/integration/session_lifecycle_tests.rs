//! Session start, failure, and teardown against the reference backend.

use std::time::Duration;

use backend_warden::advisory::{AdvisoryLevel, AdvisorySink};
use backend_warden::backend::port;
use backend_warden::backend::session::Session;
use backend_warden::models::session::Health;
use backend_warden::AppError;

use super::test_helpers::{
    assert_listener_closed, assert_process_gone, next_advisory, process_alive, reload_history,
    unit, wait_until, Fixture,
};

async fn free_port() -> u16 {
    port::acquire("127.0.0.1").await.expect("port")
}

#[tokio::test]
async fn start_materializes_unit_and_reports_ready() {
    let fixture = Fixture::new("ready");
    let (sink, mut advisories) = AdvisorySink::channel();
    let port = free_port().await;
    let first = unit("nb", "vdmsl", "u1", 0, "values x = 1");

    let mut session = Session::start(&first, port, &fixture.config, sink)
        .await
        .expect("session should start");

    assert_eq!(session.health(), Health::Healthy);
    assert_eq!(session.address(), format!("http://127.0.0.1:{port}"));
    assert_eq!(session.port(), port);
    assert!(session.pid().is_some());

    let path = session.source_path(&first.stable_id).expect("unit file");
    assert_eq!(path, session.source_dir().join("u1.vdmsl"));
    assert_eq!(std::fs::read_to_string(&path).expect("read"), "values x = 1");

    let started = next_advisory(&mut advisories, AdvisoryLevel::Info).await;
    assert!(started.message.starts_with("backend started"));

    let summary = session.summary();
    assert_eq!(summary.units, 1);
    assert_eq!(summary.health, Health::Healthy);

    // Creation does not reload; the backend read the unit at startup.
    assert!(reload_history(session.address()).await.is_empty());

    session.dispose().await.expect("dispose");
}

#[tokio::test]
async fn dispose_stops_process_and_removes_directory() {
    let fixture = Fixture::new("ready");
    let port = free_port().await;
    let mut session = Session::start(
        &unit("nb", "vdmsl", "u1", 0, "x"),
        port,
        &fixture.config,
        AdvisorySink::log_only(),
    )
    .await
    .expect("session should start");
    let pid = fixture.backend_pid().await;
    let dir = session.source_dir().to_path_buf();
    assert!(process_alive(pid));

    session.dispose().await.expect("dispose");

    assert_eq!(session.health(), Health::Terminated);
    assert!(session.pid().is_none());
    assert!(!dir.exists());
    assert_process_gone(pid).await;

    session.dispose().await.expect("second dispose is a no-op");
}

#[tokio::test]
async fn execute_after_dispose_is_rejected() {
    let fixture = Fixture::new("ready");
    let mut session = Session::start(
        &unit("nb", "vdmsl", "u1", 0, "x"),
        free_port().await,
        &fixture.config,
        AdvisorySink::log_only(),
    )
    .await
    .expect("session should start");
    session.dispose().await.expect("dispose");

    let err = session
        .execute(&unit("nb", "vdmsl", "u1", 0, "y"))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Control(_)));
}

#[tokio::test]
async fn error_signal_before_start_fails_creation() {
    let fixture = Fixture::new("error-before-start");
    let err = Session::start(
        &unit("nb", "vdmsl", "u1", 0, "x"),
        free_port().await,
        &fixture.config,
        AdvisorySink::log_only(),
    )
    .await
    .unwrap_err();

    assert!(
        matches!(&err, AppError::Readiness(msg) if msg.contains("FATAL")),
        "unexpected error: {err}"
    );
    assert_process_gone(fixture.backend_pid().await).await;
    assert_listener_closed(fixture.readiness_address().await).await;
    assert_eq!(fixture.session_dirs(), 0);
}

#[tokio::test]
async fn exit_before_start_fails_creation() {
    let fixture = Fixture::new("exit-before-start");
    let err = Session::start(
        &unit("nb", "vdmsl", "u1", 0, "x"),
        free_port().await,
        &fixture.config,
        AdvisorySink::log_only(),
    )
    .await
    .unwrap_err();

    assert!(
        matches!(&err, AppError::Readiness(msg) if msg.contains("exited before ready")),
        "unexpected error: {err}"
    );
    assert_process_gone(fixture.backend_pid().await).await;
    assert_listener_closed(fixture.readiness_address().await).await;
    assert_eq!(fixture.session_dirs(), 0);
}

#[tokio::test]
async fn missing_start_times_out() {
    let fixture = Fixture::with_readiness("never-ready", 1);
    let err = Session::start(
        &unit("nb", "vdmsl", "u1", 0, "x"),
        free_port().await,
        &fixture.config,
        AdvisorySink::log_only(),
    )
    .await
    .unwrap_err();

    assert!(
        matches!(&err, AppError::Readiness(msg) if msg.contains("startup timeout")),
        "unexpected error: {err}"
    );
    assert_process_gone(fixture.backend_pid().await).await;
    assert_listener_closed(fixture.readiness_address().await).await;
    assert_eq!(fixture.session_dirs(), 0);
}

#[tokio::test]
async fn mismatched_port_fails_creation() {
    let fixture = Fixture::new("wrong-port");
    let err = Session::start(
        &unit("nb", "vdmsl", "u1", 0, "x"),
        free_port().await,
        &fixture.config,
        AdvisorySink::log_only(),
    )
    .await
    .unwrap_err();

    assert!(
        matches!(&err, AppError::Readiness(msg) if msg.contains("reported port")),
        "unexpected error: {err}"
    );
    assert_process_gone(fixture.backend_pid().await).await;
    assert_listener_closed(fixture.readiness_address().await).await;
    assert_eq!(fixture.session_dirs(), 0);
}

#[tokio::test]
async fn stderr_before_start_fails_creation() {
    let fixture = Fixture::new("stderr-before-start");
    let (sink, mut advisories) = AdvisorySink::channel();
    let err = Session::start(
        &unit("nb", "vdmsl", "u1", 0, "x"),
        free_port().await,
        &fixture.config,
        sink,
    )
    .await
    .unwrap_err();

    assert!(
        matches!(
            &err,
            AppError::Readiness(msg) if msg.contains("gave error message: cannot load specification")
        ),
        "unexpected error: {err}"
    );
    let advisory = next_advisory(&mut advisories, AdvisoryLevel::Error).await;
    assert!(
        advisory.message.starts_with("VDMSL-backend gave error message"),
        "{}",
        advisory.message
    );
    assert_process_gone(fixture.backend_pid().await).await;
    assert_listener_closed(fixture.readiness_address().await).await;
    assert_eq!(fixture.session_dirs(), 0);
}

#[tokio::test]
async fn stderr_while_starting_marks_unhealthy() {
    let fixture = Fixture::new("stderr-before-start");
    let mut session = Session::launch(
        &unit("nb", "vdmsl", "u1", 0, "x"),
        free_port().await,
        &fixture.config,
        AdvisorySink::log_only(),
    )
    .await
    .expect("launch");

    assert!(session.wait_ready().await.is_err());
    assert_eq!(session.health(), Health::Unhealthy);

    // A START arriving after the error cannot revive the session.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(session.health(), Health::Unhealthy);

    session.dispose().await.expect("dispose");
    assert_eq!(fixture.session_dirs(), 0);
}

#[tokio::test]
async fn unlaunchable_command_is_spawn_error() {
    let mut fixture = Fixture::new("ready");
    fixture.config.backend.command = "/nonexistent/warden/backend".into();

    let err = Session::start(
        &unit("nb", "vdmsl", "u1", 0, "x"),
        free_port().await,
        &fixture.config,
        AdvisorySink::log_only(),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, AppError::Spawn(_)), "unexpected error: {err}");
    assert_eq!(fixture.session_dirs(), 0);
}

#[tokio::test]
async fn dispose_while_starting_kills_backend() {
    let fixture = Fixture::new("never-ready");
    let mut session = Session::launch(
        &unit("nb", "vdmsl", "u1", 0, "x"),
        free_port().await,
        &fixture.config,
        AdvisorySink::log_only(),
    )
    .await
    .expect("launch");
    let pid = fixture.backend_pid().await;
    assert_eq!(session.health(), Health::Starting);

    session.dispose().await.expect("dispose");

    assert_process_gone(pid).await;
    assert_eq!(fixture.session_dirs(), 0);
    assert_eq!(session.health(), Health::Terminated);
    assert!(session.wait_ready().await.is_err());
}

#[tokio::test]
async fn stderr_after_ready_marks_unhealthy() {
    let fixture = Fixture::new("stderr-on-reload");
    let (sink, mut advisories) = AdvisorySink::channel();
    let mut session = Session::start(
        &unit("nb", "vdmsl", "u1", 0, "x"),
        free_port().await,
        &fixture.config,
        sink,
    )
    .await
    .expect("session should start");

    session
        .execute(&unit("nb", "vdmsl", "u2", 1, "y"))
        .await
        .expect("reload itself succeeds");

    let advisory = next_advisory(&mut advisories, AdvisoryLevel::Error).await;
    assert!(
        advisory.message.starts_with("VDMSL-backend gave error message"),
        "{}",
        advisory.message
    );
    assert_eq!(session.health(), Health::Unhealthy);

    session.dispose().await.expect("dispose");
}

#[tokio::test]
async fn stop_signal_after_ready_raises_advisory() {
    let fixture = Fixture::new("ready");
    let (sink, mut advisories) = AdvisorySink::channel();
    let mut session = Session::start(
        &unit("nb", "vdmsl", "u1", 0, "x"),
        free_port().await,
        &fixture.config,
        sink,
    )
    .await
    .expect("session should start");

    // Stop the backend behind the supervisor's back.
    reqwest::Client::builder()
        .no_proxy()
        .build()
        .expect("client")
        .post(format!("{}/stopMain", session.address()))
        .send()
        .await
        .expect("POST /stopMain");

    let advisory = next_advisory(&mut advisories, AdvisoryLevel::Error).await;
    assert!(advisory.message.contains("exited"), "{}", advisory.message);
    let observed = &session;
    wait_until(Duration::from_secs(5), || async move { observed.pid().is_none() }).await;
    assert_eq!(session.health(), Health::Unhealthy);

    session.dispose().await.expect("dispose after unexpected exit");
    assert_eq!(fixture.session_dirs(), 0);
}
