//! Display format of `AppError` variants.

use backend_warden::AppError;

#[test]
fn display_prefixes_each_kind() {
    let cases = [
        (AppError::Config("x".into()), "config: x"),
        (AppError::Port("x".into()), "port: x"),
        (AppError::Spawn("x".into()), "spawn: x"),
        (AppError::Readiness("x".into()), "readiness: x"),
        (AppError::Sync("x".into()), "sync: x"),
        (AppError::Control("x".into()), "control: x"),
        (AppError::Ipc("x".into()), "ipc: x"),
        (AppError::PathViolation("x".into()), "path violation: x"),
        (AppError::Io("x".into()), "io: x"),
    ];
    for (err, expected) in cases {
        assert_eq!(err.to_string(), expected);
    }
}

#[test]
fn toml_errors_become_config_errors() {
    let parse_err = toml::from_str::<toml::Value>("not = = toml").unwrap_err();
    let err = AppError::from(parse_err);
    assert!(matches!(err, AppError::Config(_)));
    assert!(err.to_string().starts_with("config: invalid config"));
}

#[test]
fn io_errors_become_io_errors() {
    let err = AppError::from(std::io::Error::other("disk full"));
    assert!(matches!(err, AppError::Io(_)));
    assert_eq!(err.to_string(), "io: disk full");
}

#[test]
fn readiness_and_control_are_distinct() {
    let readiness = AppError::Readiness("backend exited".into());
    let control = AppError::Control("backend exited".into());
    assert_ne!(readiness.to_string(), control.to_string());
}
