//! Stream lifecycle: open, exchange, half-close, reset, refusal.

use bytes::Bytes;
use h2_mux::{error_code, settings_id, Config, Error, ErrorCode, HeaderBlock, StreamHandle, StreamState};

use super::support::{client_with_peer, request, server_with_peer, settle, status, within};

// ============================================================================
// Client streams
// ============================================================================

#[tokio::test]
async fn test_get_with_body_in_two_frames() {
    let (conn, mut peer, _driver) = client_with_peer(Config::client(), &[]).await;

    let stream = conn.open(request("GET", "/"), true).unwrap();
    assert_eq!(stream.id(), 1);
    assert_eq!(stream.state(), StreamState::HalfClosedLocal);

    let (block, end_stream) = peer.expect_headers(1).await;
    assert_eq!(block.get(":method"), Some("GET"));
    assert!(end_stream, "GET without body carries END_STREAM on HEADERS");

    peer.send_headers(1, &status(200), false).await;
    peer.send_data(1, b"hello", false).await;
    peer.send_data(1, b" world", true).await;

    let headers = within(stream.headers()).await.unwrap();
    assert_eq!(headers.get(":status"), Some("200"));
    let body = within(stream.read_to_end()).await.unwrap();
    assert_eq!(&body[..], b"hello world");
    assert_eq!(stream.state(), StreamState::Closed);
}

#[tokio::test]
async fn test_client_stream_ids_are_odd_and_increasing() {
    let (conn, mut peer, _driver) = client_with_peer(Config::client(), &[]).await;

    let streams: Vec<StreamHandle> = (0..3)
        .map(|_| conn.open(request("GET", "/"), true).unwrap())
        .collect();
    let ids: Vec<u32> = streams.iter().map(StreamHandle::id).collect();
    assert_eq!(ids, vec![1, 3, 5]);

    for id in ids {
        peer.expect_headers(id).await;
    }
}

#[tokio::test]
async fn test_post_body_then_response_trailers() {
    let (conn, mut peer, _driver) = client_with_peer(Config::client(), &[]).await;

    let stream = conn.open(request("POST", "/upload"), false).unwrap();
    assert_eq!(stream.state(), StreamState::Open);
    within(stream.write_end(Bytes::from_static(b"payload"))).await.unwrap();
    assert_eq!(stream.state(), StreamState::HalfClosedLocal);

    let (_, end_stream) = peer.expect_headers(1).await;
    assert!(!end_stream);
    let (data, end_stream) = peer.expect_data(1).await;
    assert_eq!(data, b"payload");
    assert!(end_stream);

    peer.send_headers(1, &status(200), false).await;
    peer.send_data(1, b"ok", false).await;
    peer.send_headers(1, &HeaderBlock::new().with("grpc-status", "0"), true)
        .await;

    within(stream.headers()).await.unwrap();
    assert_eq!(&within(stream.read_to_end()).await.unwrap()[..], b"ok");
    assert_eq!(
        stream.trailers().and_then(|t| t.get("grpc-status").map(str::to_owned)),
        Some("0".to_owned())
    );
    assert_eq!(stream.state(), StreamState::Closed);
}

#[tokio::test]
async fn test_close_output_sends_empty_end_stream() {
    let (conn, mut peer, _driver) = client_with_peer(Config::client(), &[]).await;

    let stream = conn.open(request("POST", "/"), false).unwrap();
    within(stream.write(Bytes::from_static(b"abc"))).await.unwrap();
    within(stream.close_output()).await.unwrap();
    // Idempotent
    within(stream.close_output()).await.unwrap();

    peer.expect_headers(1).await;
    assert_eq!(peer.expect_data(1).await, (b"abc".to_vec(), false));
    assert_eq!(peer.expect_data(1).await, (Vec::new(), true));

    let err = within(stream.write(Bytes::from_static(b"late"))).await.unwrap_err();
    assert!(matches!(err, Error::StreamClosed(1)), "got {err:?}");
}

#[tokio::test]
async fn test_empty_write_is_a_no_op() {
    let (conn, mut peer, _driver) = client_with_peer(Config::client(), &[]).await;

    let stream = conn.open(request("POST", "/"), false).unwrap();
    within(stream.write(Bytes::new())).await.unwrap();
    within(stream.write_end(Bytes::from_static(b"x"))).await.unwrap();

    peer.expect_headers(1).await;
    assert_eq!(peer.expect_data(1).await, (b"x".to_vec(), true));
}

// ============================================================================
// Resets
// ============================================================================

#[tokio::test]
async fn test_dropping_live_handle_cancels_stream() {
    let (conn, mut peer, _driver) = client_with_peer(Config::client(), &[]).await;

    let stream = conn.open(request("GET", "/slow"), true).unwrap();
    peer.expect_headers(1).await;
    drop(stream);

    assert_eq!(peer.expect_reset(1).await, error_code::CANCEL);
}

#[tokio::test]
async fn test_dropping_finished_handle_sends_nothing() {
    let (conn, mut peer, _driver) = client_with_peer(Config::client(), &[]).await;

    let stream = conn.open(request("GET", "/"), true).unwrap();
    peer.expect_headers(1).await;
    peer.send_headers(1, &status(204), true).await;
    within(stream.headers()).await.unwrap();
    assert_eq!(stream.state(), StreamState::Closed);
    drop(stream);

    // The next stream's HEADERS is the next thing on the wire.
    let _next = conn.open(request("GET", "/"), true).unwrap();
    peer.expect_headers(3).await;
}

#[tokio::test]
async fn test_peer_reset_fails_pending_read() {
    let (conn, mut peer, _driver) = client_with_peer(Config::client(), &[]).await;

    let stream = conn.open(request("GET", "/"), true).unwrap();
    peer.expect_headers(1).await;
    peer.send_headers(1, &status(200), false).await;
    within(stream.headers()).await.unwrap();

    let body = stream.body();
    let pending = tokio::spawn(async move { body.read().await });
    settle().await;
    peer.send_reset(1, error_code::INTERNAL_ERROR).await;

    let err = within(pending).await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        Error::Reset {
            stream_id: 1,
            code: ErrorCode::InternalError,
            remote: true,
        }
    ));
    assert_eq!(stream.state(), StreamState::Reset);
}

#[tokio::test]
async fn test_reset_after_end_stream_keeps_body_readable() {
    let (conn, mut peer, _driver) = client_with_peer(Config::client(), &[]).await;

    let stream = conn.open(request("POST", "/"), false).unwrap();
    peer.expect_headers(1).await;
    peer.send_headers(1, &status(200), false).await;
    peer.send_data(1, b"early answer", true).await;
    peer.send_reset(1, error_code::NO_ERROR).await;

    within(stream.headers()).await.unwrap();
    settle().await;
    assert_eq!(stream.state(), StreamState::Reset);
    assert_eq!(&within(stream.read_to_end()).await.unwrap()[..], b"early answer");
}

#[tokio::test]
async fn test_local_reset_sends_rst_and_fails_writes() {
    let (conn, mut peer, _driver) = client_with_peer(Config::client(), &[]).await;

    let stream = conn.open(request("POST", "/"), false).unwrap();
    peer.expect_headers(1).await;
    stream.reset(ErrorCode::Cancel);
    assert_eq!(peer.expect_reset(1).await, error_code::CANCEL);

    let err = within(stream.write(Bytes::from_static(b"x"))).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Reset {
            code: ErrorCode::Cancel,
            remote: false,
            ..
        }
    ));
}

// ============================================================================
// Server streams
// ============================================================================

#[tokio::test]
async fn test_server_accepts_and_answers() {
    let (conn, mut peer, _driver) = server_with_peer(Config::server(), &[]).await;

    peer.send_headers(1, &request("POST", "/items"), false).await;
    peer.send_data(1, b"{}", true).await;

    let stream = within(conn.accept()).await.unwrap();
    assert_eq!(stream.id(), 1);
    let headers = within(stream.headers()).await.unwrap();
    assert_eq!(headers.get(":path"), Some("/items"));
    assert_eq!(&within(stream.read_to_end()).await.unwrap()[..], b"{}");
    assert_eq!(stream.state(), StreamState::HalfClosedRemote);

    stream.send_headers(status(201), false).unwrap();
    within(stream.write_end(Bytes::from_static(b"created"))).await.unwrap();
    assert_eq!(stream.state(), StreamState::Closed);

    let (block, end_stream) = peer.expect_headers(1).await;
    assert_eq!(block.get(":status"), Some("201"));
    assert!(!end_stream);
    assert_eq!(peer.expect_data(1).await, (b"created".to_vec(), true));
}

#[tokio::test]
async fn test_write_before_headers_is_rejected() {
    let (conn, mut peer, _driver) = server_with_peer(Config::server(), &[]).await;

    peer.send_headers(1, &request("GET", "/"), true).await;
    let stream = within(conn.accept()).await.unwrap();

    let err = within(stream.write(Bytes::from_static(b"body"))).await.unwrap_err();
    assert!(matches!(err, Error::User(_)));
}

#[tokio::test]
async fn test_streams_over_limit_are_refused() {
    let config = Config::server().max_concurrent_streams(1);
    let (conn, mut peer, _driver) = server_with_peer(config, &[]).await;

    peer.send_headers(1, &request("GET", "/a"), false).await;
    peer.send_headers(3, &request("GET", "/b"), false).await;

    assert_eq!(peer.expect_reset(3).await, error_code::REFUSED_STREAM);
    let stream = within(conn.accept()).await.unwrap();
    assert_eq!(stream.id(), 1);

    // Frames for the refused stream are ignored rather than fatal.
    peer.send_data(3, b"ignored", true).await;
    peer.send_data(1, b"kept", true).await;
    assert_eq!(&within(stream.read_to_end()).await.unwrap()[..], b"kept");
}

#[tokio::test]
async fn test_stream_reset_before_accept_is_skipped() {
    let (conn, mut peer, _driver) = server_with_peer(Config::server(), &[]).await;

    peer.send_headers(1, &request("POST", "/abandoned"), false).await;
    peer.send_reset(1, error_code::CANCEL).await;
    peer.send_headers(3, &request("GET", "/kept"), true).await;

    let stream = within(conn.accept()).await.unwrap();
    assert_eq!(stream.id(), 3);
    let headers = within(stream.headers()).await.unwrap();
    assert_eq!(headers.get(":path"), Some("/kept"));

    stream.send_headers(status(204), true).unwrap();
    let (block, end_stream) = peer.expect_headers(3).await;
    assert_eq!(block.get(":status"), Some("204"));
    assert!(end_stream);
    assert!(peer.is_quiet().await, "no RST for a stream the application never saw");
}

#[tokio::test]
async fn test_client_cannot_accept_and_server_cannot_open() {
    let (client, _peer, _driver) = client_with_peer(Config::client(), &[]).await;
    assert!(within(client.accept()).await.is_none());

    let (server, _peer, _driver) = server_with_peer(Config::server(), &[]).await;
    assert!(matches!(server.open(request("GET", "/"), true), Err(Error::User(_))));
}

#[tokio::test]
async fn test_peer_concurrency_limit_applies_to_local_opens() {
    let (conn, _peer, _driver) =
        client_with_peer(Config::client(), &[(settings_id::MAX_CONCURRENT_STREAMS, 1)]).await;

    let _first = conn.open(request("GET", "/"), true).unwrap();
    assert!(matches!(conn.open(request("GET", "/"), true), Err(Error::User(_))));
}
