//! Tests for HPACK decoding

use h2_mux::HpackDecoder;

#[test]
fn test_decode_indexed_header() {
    let mut decoder = HpackDecoder::new();

    // 0x82 = indexed header, index 2 = :method: GET
    let data = [0x82];
    let headers = decoder.decode(&data).unwrap();
    let headers = headers.as_slice();

    assert_eq!(headers.len(), 1);
    assert_eq!(headers[0].name, ":method");
    assert_eq!(headers[0].value, "GET");
}

#[test]
fn test_decode_multiple_indexed_headers() {
    let mut decoder = HpackDecoder::new();

    // 0x82 = :method: GET, 0x86 = :scheme: http, 0x84 = :path: /
    let data = [0x82, 0x86, 0x84];
    let headers = decoder.decode(&data).unwrap();
    let headers = headers.as_slice();

    assert_eq!(headers.len(), 3);
    assert_eq!(headers[0].name, ":method");
    assert_eq!(headers[0].value, "GET");
    assert_eq!(headers[1].name, ":scheme");
    assert_eq!(headers[1].value, "http");
    assert_eq!(headers[2].name, ":path");
    assert_eq!(headers[2].value, "/");
}

#[test]
fn test_decode_literal_with_indexing() {
    let mut decoder = HpackDecoder::new();

    // 0x40 = literal with indexing, new name
    let data = [
        0x40, // Literal with indexing, new name
        0x06, // Name length: 6
        b'c', b'u', b's', b't', b'o', b'm',
        0x05, // Value length: 5
        b'v', b'a', b'l', b'u', b'e',
    ];

    let headers = decoder.decode(&data).unwrap();
    let headers = headers.as_slice();

    assert_eq!(headers.len(), 1);
    assert_eq!(headers[0].name, "custom");
    assert_eq!(headers[0].value, "value");
}

#[test]
fn test_decode_literal_indexed_name() {
    let mut decoder = HpackDecoder::new();

    // 0x41 = literal with indexing, indexed name (index 1 = :authority)
    let data = [
        0x41, // Literal with indexing, name index 1
        0x0B, // Value length: 11
        b'e', b'x', b'a', b'm', b'p', b'l', b'e', b'.', b'c', b'o', b'm',
    ];

    let headers = decoder.decode(&data).unwrap();
    let headers = headers.as_slice();

    assert_eq!(headers.len(), 1);
    assert_eq!(headers[0].name, ":authority");
    assert_eq!(headers[0].value, "example.com");
}

#[test]
fn test_decode_dynamic_table_persists_across_blocks() {
    let mut decoder = HpackDecoder::new();

    // First block inserts "custom: value" at dynamic index 62
    let first = [
        0x40, 0x06, b'c', b'u', b's', b't', b'o', b'm', 0x05, b'v', b'a', b'l', b'u', b'e',
    ];
    decoder.decode(&first).unwrap();

    // Second block refers to it by index only
    let second = decoder.decode(&[0xBE]).unwrap();
    assert_eq!(second.get("custom"), Some("value"));
}

#[test]
fn test_decode_invalid_index_is_error() {
    let mut decoder = HpackDecoder::new();

    // Index 127 is outside both the static and the (empty) dynamic table
    let err = decoder.decode(&[0xFF, 0x00]).unwrap_err();
    assert!(err.to_string().contains("HPACK decode error"));
}

#[test]
fn test_decode_empty_block() {
    let mut decoder = HpackDecoder::new();
    let headers = decoder.decode(&[]).unwrap();
    assert!(headers.is_empty());
}
