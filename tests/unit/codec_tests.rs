use backend_warden::backend::codec::{SignalCodec, MAX_SIGNAL_BYTES};
use backend_warden::AppError;
use bytes::BytesMut;
use tokio_util::codec::Decoder;

#[test]
fn decodes_complete_lines_only() {
    let mut codec = SignalCodec::new();
    let mut buf = BytesMut::from(&b"{\"type\":\"START\"}\n{\"type\":"[..]);

    let first = codec.decode(&mut buf).expect("decode");
    assert_eq!(first.as_deref(), Some("{\"type\":\"START\"}"));
    assert_eq!(codec.decode(&mut buf).expect("decode"), None);

    buf.extend_from_slice(b"\"STOP\"}\n");
    let second = codec.decode(&mut buf).expect("decode");
    assert_eq!(second.as_deref(), Some("{\"type\":\"STOP\"}"));
}

#[test]
fn trailing_record_delivered_at_eof() {
    let mut codec = SignalCodec::new();
    let mut buf = BytesMut::from(&b"{\"type\":\"STOP\"}"[..]);

    assert_eq!(codec.decode(&mut buf).expect("decode"), None);
    let last = codec.decode_eof(&mut buf).expect("decode eof");
    assert_eq!(last.as_deref(), Some("{\"type\":\"STOP\"}"));
}

#[test]
fn oversized_record_is_rejected() {
    let mut codec = SignalCodec::new();
    let mut buf = BytesMut::from(vec![b'x'; MAX_SIGNAL_BYTES + 1].as_slice());

    let err = codec.decode(&mut buf).unwrap_err();
    assert!(matches!(err, AppError::Readiness(msg) if msg.contains("too long")));
}
