use backend_warden::models::session::{Dialect, DocumentId, Health, SessionKey};
use backend_warden::models::unit::{StableId, UnitRequest};

#[test]
fn dialect_accepts_plain_names() {
    for name in ["vdmsl", "vdmpp", "vdmrt", "c++", "py_3"] {
        assert!(Dialect::parse(name).is_ok(), "{name:?}");
    }
}

#[test]
fn dialect_rejects_path_like_names() {
    for name in ["", "../vdm", "a/b", "-flag", "vdm sl"] {
        assert!(Dialect::parse(name).is_err(), "{name:?}");
    }
}

#[test]
fn dialect_deserialization_validates() {
    let ok: Dialect = serde_json::from_str("\"vdmsl\"").expect("valid");
    assert_eq!(ok.as_str(), "vdmsl");
    assert!(serde_json::from_str::<Dialect>("\"../x\"").is_err());
}

#[test]
fn session_key_display() {
    let key = SessionKey::new(
        DocumentId::new("file:///nb.vdmnb"),
        Dialect::parse("vdmsl").expect("dialect"),
    );
    assert_eq!(key.to_string(), "file:///nb.vdmnb#vdmsl");
}

#[test]
fn health_transitions() {
    use Health::{Healthy, Starting, Terminated, Unhealthy};

    assert!(Starting.can_transition_to(Healthy));
    assert!(Starting.can_transition_to(Unhealthy));
    assert!(Healthy.can_transition_to(Unhealthy));
    for from in [Starting, Healthy, Unhealthy] {
        assert!(from.can_transition_to(Terminated));
    }

    assert!(!Unhealthy.can_transition_to(Healthy));
    assert!(!Healthy.can_transition_to(Starting));
    for to in [Starting, Healthy, Unhealthy, Terminated] {
        assert!(!Terminated.can_transition_to(to));
    }
}

#[test]
fn stable_id_generation_is_unique() {
    let a = StableId::generate();
    let b = StableId::generate();
    assert_ne!(a, b);
}

#[test]
fn unit_request_deserializes_with_optional_suffix() {
    let unit: UnitRequest = serde_json::from_str(
        r#"{"document":"nb","dialect":"vdmsl","stable_id":"u1","position":2,"text":"x"}"#,
    )
    .expect("valid request");

    assert_eq!(unit.position, 2);
    assert!(unit.suffix.is_none());
    assert_eq!(unit.key().to_string(), "nb#vdmsl");
}

#[test]
fn unit_request_rejects_unsafe_stable_id() {
    let raw = r#"{"document":"nb","dialect":"vdmsl","stable_id":"../../etc","position":0,"text":""}"#;
    assert!(serde_json::from_str::<UnitRequest>(raw).is_err());
}
