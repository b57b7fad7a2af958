//! SETTINGS exchange and INITIAL_WINDOW_SIZE rebalancing.

use bytes::Bytes;
use h2_mux::{error_code, settings_id, Config, Connection, Error, H2Codec, H2Event, Lifecycle};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::support::{client_with_peer, request, server_with_peer, settle, within};

#[tokio::test]
async fn test_handshake_advertises_local_settings() {
    let config = Config::server().max_concurrent_streams(16).initial_window_size(1 << 20);
    let (ours, mut theirs) = tokio::io::duplex(1 << 16);
    let (_conn, _driver) = within(Connection::handshake(ours, config)).await.unwrap();

    // Handshake output is flushed in one write.
    let mut buf = vec![0u8; 1024];
    let n = within(theirs.read(&mut buf)).await.unwrap();
    let mut codec = H2Codec::new();
    codec.set_preface_received(true);
    let events = codec.process(&buf[..n]).unwrap();

    match &events[0] {
        H2Event::Settings { ack: false, settings } => {
            assert!(settings.contains(&(settings_id::MAX_CONCURRENT_STREAMS, 16)));
            assert!(settings.contains(&(settings_id::INITIAL_WINDOW_SIZE, 1 << 20)));
        }
        other => panic!("Expected SETTINGS, got {:?}", other),
    }
    // The connection window is raised to match the stream window.
    match &events[1] {
        H2Event::WindowUpdate { stream_id: 0, increment } => {
            assert_eq!(*increment, (1 << 20) - 65_535);
        }
        other => panic!("Expected WINDOW_UPDATE, got {:?}", other),
    }
}

#[tokio::test]
async fn test_peer_settings_visible_after_ready() {
    let (conn, _peer, _driver) = client_with_peer(
        Config::client(),
        &[
            (settings_id::MAX_CONCURRENT_STREAMS, 7),
            (settings_id::INITIAL_WINDOW_SIZE, 4096),
        ],
    )
    .await;

    let settings = conn.peer_settings();
    assert_eq!(settings.max_concurrent_streams(), Some(7));
    assert_eq!(settings.initial_window_size(), 4096);
    assert_eq!(settings.max_frame_size(), 16_384);
}

#[tokio::test]
async fn test_settings_are_acknowledged() {
    let (_conn, mut peer, _driver) = server_with_peer(Config::server(), &[]).await;
    peer.await_settings_ack().await;

    peer.send_settings(&[(settings_id::HEADER_TABLE_SIZE, 8192)]).await;
    peer.await_settings_ack().await;
}

#[tokio::test]
async fn test_initial_window_change_rebalances_open_streams() {
    let (conn, mut peer, _driver) =
        client_with_peer(Config::client(), &[(settings_id::INITIAL_WINDOW_SIZE, 100)]).await;
    peer.await_settings_ack().await;

    let stream = conn.open(request("POST", "/"), false).unwrap();
    within(stream.write(Bytes::from(vec![0u8; 60]))).await.unwrap();
    assert_eq!(stream.send_window(), Some(40));

    // Shrink by 50: the window goes negative.
    peer.send_settings(&[(settings_id::INITIAL_WINDOW_SIZE, 50)]).await;
    peer.await_settings_ack().await;
    assert_eq!(stream.send_window(), Some(-10));

    // Same value again: nothing moves.
    peer.send_settings(&[(settings_id::INITIAL_WINDOW_SIZE, 50)]).await;
    peer.await_settings_ack().await;
    assert_eq!(stream.send_window(), Some(-10));

    // Grow by 150.
    peer.send_settings(&[(settings_id::INITIAL_WINDOW_SIZE, 200)]).await;
    peer.await_settings_ack().await;
    assert_eq!(stream.send_window(), Some(140));

    // Streams opened later start from the new value.
    let later = conn.open(request("GET", "/"), true).unwrap();
    assert_eq!(later.send_window(), Some(200));
}

#[tokio::test]
async fn test_writer_blocked_by_negative_window_resumes_on_growth() {
    let (conn, mut peer, _driver) =
        client_with_peer(Config::client(), &[(settings_id::INITIAL_WINDOW_SIZE, 100)]).await;
    peer.await_settings_ack().await;

    let stream = conn.open(request("POST", "/"), false).unwrap();
    within(stream.write(Bytes::from(vec![0u8; 100]))).await.unwrap();
    peer.send_settings(&[(settings_id::INITIAL_WINDOW_SIZE, 50)]).await;
    peer.await_settings_ack().await;
    assert_eq!(stream.send_window(), Some(-50));

    let writer = tokio::spawn(async move { stream.write_end(Bytes::from_static(b"tail")).await });
    settle().await;
    assert!(!writer.is_finished());

    // Back to zero is still not enough.
    peer.send_settings(&[(settings_id::INITIAL_WINDOW_SIZE, 100)]).await;
    peer.await_settings_ack().await;
    settle().await;
    assert!(!writer.is_finished());

    peer.send_settings(&[(settings_id::INITIAL_WINDOW_SIZE, 104)]).await;
    within(writer).await.unwrap().unwrap();

    peer.expect_headers(1).await;
    assert_eq!(peer.expect_data(1).await.0.len(), 100);
    assert_eq!(peer.expect_data(1).await, (b"tail".to_vec(), true));
}

#[tokio::test]
async fn test_invalid_settings_fail_connection() {
    let (conn, mut peer, driver) = client_with_peer(Config::client(), &[]).await;

    peer.send_settings(&[(settings_id::MAX_FRAME_SIZE, 100)]).await;

    let (_, code) = peer.expect_goaway().await;
    assert_eq!(code, error_code::PROTOCOL_ERROR);
    assert!(matches!(within(driver).await.unwrap(), Err(Error::Protocol(_))));
    assert_eq!(conn.lifecycle(), Lifecycle::Closed);
}

#[tokio::test]
async fn test_first_frame_must_be_settings() {
    let (ours, mut theirs) = tokio::io::duplex(1 << 16);
    let (conn, driver) = within(Connection::handshake(ours, Config::client())).await.unwrap();
    let driver = tokio::spawn(driver.run());

    theirs.write_all(&H2Codec::create_ping([0; 8], false)).await.unwrap();

    assert!(matches!(within(driver).await.unwrap(), Err(Error::Protocol(_))));
    assert!(matches!(within(conn.ready()).await, Err(Error::Protocol(_))));
    drop(theirs);
}

// ============================================================================
// Header compression limits
// ============================================================================

#[tokio::test]
async fn test_peer_header_table_size_is_announced_once() {
    let (conn, mut peer, _driver) =
        client_with_peer(Config::client(), &[(settings_id::HEADER_TABLE_SIZE, 0)]).await;

    let _first = conn.open(request("GET", "/a"), true).unwrap();
    peer.expect_headers(1).await;
    assert_eq!(peer.last_header_block()[0], 0x20, "block opens with a size update to 0");

    let _second = conn.open(request("GET", "/b"), true).unwrap();
    let (block, _) = peer.expect_headers(3).await;
    assert_eq!(block.get(":path"), Some("/b"));
    assert_ne!(peer.last_header_block()[0] & 0xE0, 0x20);
}

#[tokio::test]
async fn test_header_list_over_advertised_limit_fails_connection() {
    let config = Config::server().max_header_list_size(256);
    let (_conn, mut peer, driver) = server_with_peer(config, &[]).await;

    let oversized = request("GET", "/").with("x-padding", "p".repeat(300));
    peer.send_headers(1, &oversized, true).await;

    let (_, code) = peer.expect_goaway().await;
    assert_eq!(code, error_code::PROTOCOL_ERROR);
    match within(driver).await.unwrap() {
        Err(Error::Protocol(msg)) => assert!(msg.contains("header list"), "got {msg}"),
        other => panic!("Expected protocol error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_table_size_update_above_advertised_fails_connection() {
    let config = Config::server().header_table_size(1024);
    let (_conn, mut peer, driver) = server_with_peer(config, &[]).await;

    // size update to 4096, then :method GET, :scheme http, :path /
    let block = [0x3F, 0xE1, 0x1F, 0x82, 0x86, 0x84];
    peer.send_raw(&H2Codec::create_headers(1, &block, true, 16_384)).await;

    let (_, code) = peer.expect_goaway().await;
    assert_eq!(code, error_code::PROTOCOL_ERROR);
    assert!(matches!(within(driver).await.unwrap(), Err(Error::Protocol(_))));
}
