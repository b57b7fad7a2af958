//! Tests for H2Codec lifecycle (preface, reset, ignored frames)

use h2_mux::{is_h2c_preface, H2Codec, H2Event, CONNECTION_PREFACE};

use super::codec;

#[test]
fn test_connection_preface_handling() {
    let mut codec = H2Codec::new();

    let mut data = CONNECTION_PREFACE.to_vec();
    data.extend_from_slice(&[0, 0, 0, 4, 0, 0, 0, 0, 0]);

    let events = codec.process(&data).unwrap();
    assert!(codec.preface_received());
    assert_eq!(events.len(), 1);

    match &events[0] {
        H2Event::Settings { ack, .. } => assert!(!ack),
        _ => panic!("Expected Settings event"),
    }
}

#[test]
fn test_preface_optional_without_requirement() {
    // Client side: the server never sends a preface
    let mut codec = H2Codec::new();
    let events = codec.process(&H2Codec::create_settings(&[])).unwrap();
    assert_eq!(events.len(), 1);
    assert!(!codec.preface_received());
}

#[test]
fn test_required_preface_split_across_reads() {
    let mut codec = H2Codec::expecting_preface();
    assert!(codec.process(&CONNECTION_PREFACE[..5]).unwrap().is_empty());
    assert!(codec.process(&CONNECTION_PREFACE[5..20]).unwrap().is_empty());
    assert!(!codec.preface_received());

    let mut rest = CONNECTION_PREFACE[20..].to_vec();
    rest.extend_from_slice(&H2Codec::create_settings_ack());
    let events = codec.process(&rest).unwrap();
    assert!(codec.preface_received());
    assert!(matches!(events[0], H2Event::Settings { ack: true, .. }));
}

#[test]
fn test_h2c_preface_detection() {
    assert!(is_h2c_preface(CONNECTION_PREFACE));
    assert!(!is_h2c_preface(&CONNECTION_PREFACE[..10]));
    assert!(!is_h2c_preface(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n"));
}

#[test]
fn test_codec_reset_clears_pending_continuation() {
    let mut codec = codec();

    // Send HEADERS without END_HEADERS
    let mut headers_frame = vec![0, 0, 3, 1, 0, 0, 0, 0, 1];
    headers_frame.extend_from_slice(&[0x82, 0x86, 0x84]);
    let events = codec.process(&headers_frame).unwrap();
    assert!(events.is_empty());
    assert!(codec.is_awaiting_continuation());

    codec.reset();
    codec.set_preface_received(true);
    assert!(!codec.is_awaiting_continuation());

    // After reset, CONTINUATION should be unexpected
    let mut cont_frame = vec![0, 0, 2, 9, 4, 0, 0, 0, 1];
    cont_frame.extend_from_slice(&[0x41, 0x8a]);
    let result = codec.process(&cont_frame);
    assert!(result.is_err());
}

#[test]
fn test_codec_reset_drops_partial_frame() {
    let mut codec = codec();
    let frame = H2Codec::create_data(1, b"hello", false);
    assert!(codec.process(&frame[..7]).unwrap().is_empty());

    codec.reset();
    codec.set_preface_received(true);

    let events = codec.process(&H2Codec::create_data(3, b"world", true)).unwrap();
    assert_eq!(events.len(), 1);
    assert!(matches!(&events[0], H2Event::Data { stream_id: 3, .. }));
}

#[test]
fn test_codec_reset_allows_new_preface() {
    let mut codec = H2Codec::new();

    // First session
    let mut data = CONNECTION_PREFACE.to_vec();
    data.extend_from_slice(&[0, 0, 0, 4, 0, 0, 0, 0, 0]);
    let events = codec.process(&data).unwrap();
    assert_eq!(events.len(), 1);
    assert!(codec.preface_received());

    // Reset
    codec.reset();
    assert!(!codec.preface_received());

    // Second session
    let events = codec.process(&data).unwrap();
    assert_eq!(events.len(), 1);
    assert!(codec.preface_received());
}

#[test]
fn test_priority_frame_ignored() {
    let mut codec = codec();

    let mut frame = vec![0, 0, 5, 2, 0, 0, 0, 0, 1];
    frame.extend_from_slice(&[0, 0, 0, 0, 16]);

    let events = codec.process(&frame).unwrap();
    assert!(events.is_empty(), "PRIORITY frames should be silently ignored");
}

#[test]
fn test_unknown_frame_type_ignored() {
    let mut codec = codec();

    let mut frame = vec![0, 0, 3, 0xFF, 0, 0, 0, 0, 1];
    frame.extend_from_slice(&[1, 2, 3]);

    let events = codec.process(&frame).unwrap();
    assert!(events.is_empty(), "Unknown frame types should be silently ignored");
}
