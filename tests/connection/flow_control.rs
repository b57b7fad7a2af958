//! Two-level flow control: stream and connection windows, both directions.

use std::sync::Arc;

use bytes::Bytes;
use h2_mux::{error_code, settings_id, Config, Connection, Error, ErrorCode, StreamHandle};
use tokio::task::JoinHandle;

use super::support::{client_with_peer, request, server_with_peer, settle, within, RawPeer};

// ============================================================================
// Outbound
// ============================================================================

#[tokio::test]
async fn test_write_waits_for_stream_credit() {
    let (conn, mut peer, _driver) =
        client_with_peer(Config::client(), &[(settings_id::INITIAL_WINDOW_SIZE, 100)]).await;

    let stream = conn.open(request("POST", "/"), false).unwrap();
    assert_eq!(stream.send_window(), Some(100));
    let id = stream.id();
    let writer = tokio::spawn(async move {
        stream.write_end(Bytes::from(vec![b'a'; 250])).await?;
        Ok::<_, Error>(stream)
    });

    peer.expect_headers(id).await;
    let (data, end_stream) = peer.expect_data(id).await;
    assert_eq!(data.len(), 100);
    assert!(!end_stream);

    settle().await;
    assert!(!writer.is_finished(), "write must suspend on an exhausted stream window");

    peer.send_window_update(id, 150).await;
    let (data, end_stream) = peer.expect_data(id).await;
    assert_eq!(data.len(), 150);
    assert!(end_stream);

    let stream = within(writer).await.unwrap().unwrap();
    assert_eq!(stream.send_window(), Some(0));
}

#[tokio::test]
async fn test_write_waits_for_connection_credit() {
    let (conn, mut peer, _driver) =
        client_with_peer(Config::client(), &[(settings_id::INITIAL_WINDOW_SIZE, 1 << 20)]).await;

    let stream = conn.open(request("POST", "/"), false).unwrap();
    let writer = tokio::spawn(async move { stream.write_end(Bytes::from(vec![7u8; 70_000])).await });

    peer.expect_headers(1).await;
    let mut received = 0;
    while received < 65_535 {
        let (data, end_stream) = peer.expect_data(1).await;
        assert!(data.len() <= 16_384);
        assert!(!end_stream);
        received += data.len();
    }
    assert_eq!(received, 65_535, "connection window caps the first burst");

    settle().await;
    assert!(!writer.is_finished());

    peer.send_window_update(0, 10_000).await;
    let (data, end_stream) = peer.expect_data(1).await;
    assert_eq!(data.len(), 70_000 - 65_535);
    assert!(end_stream);
    within(writer).await.unwrap().unwrap();
}

/// Open a stream and start a 70 KB write that drains the connection window,
/// leaving the writer parked on connection credit with stream credit to spare.
async fn writer_parked_on_connection_credit(
    conn: &Connection,
    peer: &mut RawPeer,
) -> (Arc<StreamHandle>, JoinHandle<h2_mux::Result<()>>) {
    let stream = Arc::new(conn.open(request("POST", "/upload"), false).unwrap());
    let id = stream.id();
    let writing = stream.clone();
    let writer = tokio::spawn(async move { writing.write_end(Bytes::from(vec![7u8; 70_000])).await });

    peer.expect_headers(id).await;
    let mut received = 0;
    while received < 65_535 {
        received += peer.expect_data(id).await.0.len();
    }
    settle().await;
    assert!(!writer.is_finished(), "writer must be waiting for connection credit");
    assert!(stream.send_window().unwrap() > 0);
    (stream, writer)
}

#[tokio::test]
async fn test_peer_reset_releases_writer_parked_on_connection_credit() {
    let (conn, mut peer, _driver) =
        client_with_peer(Config::client(), &[(settings_id::INITIAL_WINDOW_SIZE, 1 << 20)]).await;
    let (stream, writer) = writer_parked_on_connection_credit(&conn, &mut peer).await;

    peer.send_reset(stream.id(), error_code::CANCEL).await;

    let err = within(writer).await.unwrap().unwrap_err();
    assert!(
        matches!(err, Error::Reset { code: ErrorCode::Cancel, remote: true, .. }),
        "got {err:?}"
    );
}

#[tokio::test]
async fn test_local_reset_releases_writer_parked_on_connection_credit() {
    let (conn, mut peer, _driver) =
        client_with_peer(Config::client(), &[(settings_id::INITIAL_WINDOW_SIZE, 1 << 20)]).await;
    let (stream, writer) = writer_parked_on_connection_credit(&conn, &mut peer).await;

    stream.reset(ErrorCode::Cancel);

    let err = within(writer).await.unwrap().unwrap_err();
    assert!(
        matches!(err, Error::Reset { code: ErrorCode::Cancel, remote: false, .. }),
        "got {err:?}"
    );
    assert_eq!(peer.expect_reset(stream.id()).await, error_code::CANCEL);
}

#[tokio::test]
async fn test_goaway_releases_writer_parked_on_connection_credit() {
    let (conn, mut peer, _driver) =
        client_with_peer(Config::client(), &[(settings_id::INITIAL_WINDOW_SIZE, 1 << 20)]).await;

    let _first = conn.open(request("GET", "/1"), true).unwrap();
    let _second = conn.open(request("GET", "/3"), true).unwrap();
    peer.expect_headers(1).await;
    peer.expect_headers(3).await;
    let (stream, writer) = writer_parked_on_connection_credit(&conn, &mut peer).await;
    assert_eq!(stream.id(), 5);

    peer.send_goaway(3, error_code::NO_ERROR).await;

    let err = within(writer).await.unwrap().unwrap_err();
    assert!(err.is_connection_error(), "got {err:?}");
    assert!(matches!(err, Error::GoAway { last_stream_id: 3, .. }));
}

#[tokio::test]
async fn test_data_frames_respect_peer_max_frame_size() {
    let (conn, mut peer, _driver) = client_with_peer(Config::client(), &[]).await;

    let stream = conn.open(request("POST", "/"), false).unwrap();
    within(stream.write_end(Bytes::from(vec![1u8; 40_000]))).await.unwrap();

    peer.expect_headers(1).await;
    let sizes = [
        peer.expect_data(1).await,
        peer.expect_data(1).await,
        peer.expect_data(1).await,
    ]
    .map(|(data, end_stream)| (data.len(), end_stream));
    assert_eq!(sizes, [(16_384, false), (16_384, false), (7_232, true)]);
}

#[tokio::test]
async fn test_window_update_overflow_fails_connection() {
    let (conn, mut peer, driver) = client_with_peer(Config::client(), &[]).await;

    peer.send_window_update(0, 0x7FFF_FFFF).await;

    let (_, code) = peer.expect_goaway().await;
    assert_eq!(code, error_code::FLOW_CONTROL_ERROR);
    let result = within(driver).await.unwrap();
    assert!(matches!(result, Err(Error::FlowControl(_))));
    assert!(conn.open(request("GET", "/"), true).is_err());
}

// ============================================================================
// Inbound
// ============================================================================

#[tokio::test]
async fn test_credit_returned_as_data_is_consumed() {
    let (conn, mut peer, _driver) = server_with_peer(Config::server(), &[]).await;

    peer.send_headers(1, &request("POST", "/"), false).await;
    for _ in 0..2 {
        peer.send_data(1, &[0u8; 16_384], false).await;
    }
    peer.send_data(1, &[0u8; 7_232], false).await;

    // Connection credit comes back on arrival, once half the window is used.
    assert_eq!(peer.expect_window_update().await, (0, 32_768));

    // Stream credit only once the application has read the bytes.
    let stream = within(conn.accept()).await.unwrap();
    settle().await;
    assert!(peer.is_quiet().await);

    let first = within(stream.read()).await.unwrap().unwrap();
    let second = within(stream.read()).await.unwrap().unwrap();
    assert_eq!(first.len() + second.len(), 32_768);
    assert_eq!(peer.expect_window_update().await, (1, 32_768));
}

#[tokio::test]
async fn test_peer_overrunning_stream_window_fails_connection() {
    let (_conn, mut peer, driver) = server_with_peer(Config::server(), &[]).await;

    peer.send_headers(1, &request("POST", "/"), false).await;
    for _ in 0..4 {
        peer.send_data(1, &[0u8; 16_384], false).await;
    }

    let (last_stream_id, code) = peer.expect_goaway().await;
    assert_eq!(last_stream_id, 1);
    assert_eq!(code, error_code::FLOW_CONTROL_ERROR);
    assert!(matches!(within(driver).await.unwrap(), Err(Error::FlowControl(_))));
}
