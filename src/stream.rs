//! One logical exchange multiplexed over a connection.
//!
//! [`Stream`] is the record the connection keeps in its stream table:
//! header/trailer storage, the lifecycle state machine, the per-stream
//! flow-control windows and the two pipe halves. Applications never hold a
//! `Stream` directly; they get a [`StreamHandle`], which names the stream by
//! id and goes through the connection for every operation. Once the stream
//! is gone from the connection, handle operations fail with an error
//! instead of touching freed state.

use std::future::poll_fn;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use tracing::debug;

use crate::connection::Shared;
use crate::error::{Error, ErrorCode, Result};
use crate::flow_control::FlowWindow;
use crate::frame::StreamId;
use crate::hpack::HeaderBlock;
use crate::pipe::{RecvPipe, SendPipe};

/// Stream lifecycle (RFC 7540 Section 5.1, without the push states).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Open,
    /// We finished sending; the peer may still send.
    HalfClosedLocal,
    /// The peer finished sending; we may still send.
    HalfClosedRemote,
    Closed,
    Reset,
}

impl StreamState {
    pub fn is_terminal(self) -> bool {
        matches!(self, StreamState::Closed | StreamState::Reset)
    }
}

#[derive(Debug)]
pub struct Stream {
    id: StreamId,
    state: StreamState,
    headers: Option<HeaderBlock>,
    trailers: Option<HeaderBlock>,
    /// Credit we granted the peer.
    pub(crate) read_window: FlowWindow,
    /// Credit the peer granted us.
    pub(crate) write_window: FlowWindow,
    pub(crate) recv: RecvPipe,
    pub(crate) send: SendPipe,
    input_closed: bool,
    output_closed: bool,
    /// Set once the application handle is gone; nobody will read the
    /// stream's buffered state after it closes.
    detached: bool,
}

impl Stream {
    pub fn new(id: StreamId, recv_window: u32, send_window: u32) -> Self {
        Self {
            id,
            state: StreamState::Idle,
            headers: None,
            trailers: None,
            read_window: FlowWindow::new(recv_window),
            write_window: FlowWindow::new(send_window),
            recv: RecvPipe::new(recv_window),
            send: SendPipe::new(),
            input_closed: false,
            output_closed: false,
            detached: false,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn headers(&self) -> Option<&HeaderBlock> {
        self.headers.as_ref()
    }

    pub fn trailers(&self) -> Option<&HeaderBlock> {
        self.trailers.as_ref()
    }

    pub fn is_input_closed(&self) -> bool {
        self.input_closed
    }

    pub fn is_output_closed(&self) -> bool {
        self.output_closed
    }

    pub fn is_detached(&self) -> bool {
        self.detached
    }

    pub fn detach(&mut self) {
        self.detached = true;
    }

    /// Eligible for removal from the stream table.
    pub fn is_finished(&self) -> bool {
        self.state.is_terminal() || (self.input_closed && self.output_closed)
    }

    /// Local open: our HEADERS are about to go out.
    pub fn open(&mut self, output_finished: bool) {
        self.state = StreamState::Open;
        self.send.mark_headers_sent();
        if output_finished {
            self.close_output();
        }
    }

    /// Peer open: the first HEADERS for a peer-initiated id arrived.
    pub fn accept(&mut self) {
        self.state = StreamState::Open;
    }

    /// A header block from the peer: response/request headers first, then
    /// at most one trailer block, which must end the stream.
    pub fn recv_headers(&mut self, block: HeaderBlock, finished: bool) -> Result<()> {
        if self.input_closed {
            return Err(Error::protocol(format!(
                "HEADERS on stream {} after its input was closed",
                self.id
            )));
        }
        if self.headers.is_none() {
            self.headers = Some(block);
        } else if finished {
            self.trailers = Some(block);
        } else {
            return Err(Error::protocol(format!(
                "second header block on stream {} without END_STREAM",
                self.id
            )));
        }
        self.recv.wake();
        if finished {
            self.close_input();
        }
        Ok(())
    }

    /// DATA from the peer. `flow_len` includes padding, which is charged to
    /// the window but never handed to the reader.
    pub fn recv_data(&mut self, data: Bytes, flow_len: u32, finished: bool) -> Result<()> {
        if self.input_closed {
            return Err(Error::protocol(format!(
                "DATA on stream {} after END_STREAM",
                self.id
            )));
        }
        if self.headers.is_none() {
            return Err(Error::protocol(format!("DATA before HEADERS on stream {}", self.id)));
        }
        if i64::from(flow_len) > self.read_window.available() {
            return Err(Error::flow_control(format!(
                "stream {} received {} bytes with only {} bytes of window",
                self.id,
                flow_len,
                self.read_window.available()
            )));
        }
        self.read_window.reserve(flow_len as usize);
        let padding = flow_len.saturating_sub(data.len() as u32);
        if padding > 0 {
            self.recv.discard(padding);
        }
        self.recv.push(data);
        if finished {
            self.close_input();
        }
        Ok(())
    }

    pub fn close_input(&mut self) {
        if !self.input_closed {
            self.input_closed = true;
            self.recv.end();
            self.transition();
        }
    }

    pub fn close_output(&mut self) {
        if !self.output_closed {
            self.output_closed = true;
            self.send.close();
            self.transition();
        }
    }

    fn transition(&mut self) {
        if self.state == StreamState::Reset {
            return;
        }
        let next = match (self.input_closed, self.output_closed) {
            (true, true) => StreamState::Closed,
            (true, false) => StreamState::HalfClosedRemote,
            (false, true) => StreamState::HalfClosedLocal,
            (false, false) => StreamState::Open,
        };
        if next != self.state {
            debug!(stream_id = self.id, from = ?self.state, to = ?next, "stream state");
            self.state = next;
        }
    }

    /// Abort by RST_STREAM, sent or received. Terminal.
    pub fn reset(&mut self, code: ErrorCode, remote: bool) {
        debug!(stream_id = self.id, %code, remote, "stream reset");
        self.fail(Error::Reset {
            stream_id: self.id,
            code,
            remote,
        });
    }

    /// Resolve every pending operation on this stream with `err`. A body
    /// that already ended stays readable.
    pub fn fail(&mut self, err: Error) {
        self.state = StreamState::Reset;
        if !self.input_closed {
            self.recv.fail(err.clone());
        }
        self.input_closed = true;
        self.output_closed = true;
        self.send.fail(err);
        self.write_window.wake_all();
    }

    /// Ready with the first header block, or the reason none will come.
    pub fn poll_headers(&mut self, cx: &mut Context<'_>) -> Poll<Result<HeaderBlock>> {
        if let Some(headers) = &self.headers {
            return Poll::Ready(Ok(headers.clone()));
        }
        if let Some(err) = self.recv.error() {
            return Poll::Ready(Err(err.clone()));
        }
        if self.input_closed {
            return Poll::Ready(Err(Error::StreamClosed(self.id)));
        }
        self.recv.park(cx);
        Poll::Pending
    }
}

/// Application handle to one stream.
///
/// Dropping the handle while the stream is still live resets it with
/// `CANCEL`.
#[derive(Debug)]
pub struct StreamHandle {
    shared: Arc<Shared>,
    id: StreamId,
}

impl StreamHandle {
    pub(crate) fn new(shared: Arc<Shared>, id: StreamId) -> Self {
        Self { shared, id }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn state(&self) -> StreamState {
        self.shared.stream_state(self.id)
    }

    /// Wait for the peer's header block.
    pub async fn headers(&self) -> Result<HeaderBlock> {
        poll_fn(|cx| self.shared.poll_headers(cx, self.id)).await
    }

    /// Trailers, once the peer sent them.
    pub fn trailers(&self) -> Option<HeaderBlock> {
        self.shared.trailers(self.id)
    }

    /// Next chunk of the peer's body; `None` at end of stream.
    pub async fn read(&self) -> Result<Option<Bytes>> {
        poll_fn(|cx| self.shared.poll_read(cx, self.id)).await
    }

    pub async fn read_to_end(&self) -> Result<Bytes> {
        read_to_end(&self.shared, self.id).await
    }

    /// Send body bytes, suspending while either flow-control window is
    /// exhausted. Resolves once every byte has been handed to the transport.
    pub async fn write(&self, data: impl Into<Bytes>) -> Result<()> {
        self.shared.write(self.id, data.into(), false).await
    }

    /// Like [`write`](Self::write), with END_STREAM on the last DATA frame.
    pub async fn write_end(&self, data: impl Into<Bytes>) -> Result<()> {
        self.shared.write(self.id, data.into(), true).await
    }

    /// Credit the peer currently grants this stream; `None` once the stream
    /// has left the connection.
    pub fn send_window(&self) -> Option<i64> {
        self.shared.send_window(self.id)
    }

    /// Send a header block: response headers on a peer-initiated stream,
    /// or trailers (which must end the stream).
    pub fn send_headers(&self, block: HeaderBlock, end_stream: bool) -> Result<()> {
        self.shared.send_headers(self.id, block, end_stream)
    }

    /// Finish our side with an empty END_STREAM DATA frame. Idempotent.
    pub async fn close_output(&self) -> Result<()> {
        self.shared.close_output(self.id).await
    }

    /// Abort the stream. No frame is sent if the stream already left the
    /// connection.
    pub fn reset(&self, code: ErrorCode) {
        self.shared.reset_stream(self.id, code);
    }

    /// A read-only view of the inbound body that does not own the stream.
    pub fn body(&self) -> RecvBody {
        RecvBody {
            shared: self.shared.clone(),
            id: self.id,
        }
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.shared.release(self.id);
    }
}

/// Inbound half of a stream, detached from its ownership.
#[derive(Debug, Clone)]
pub struct RecvBody {
    shared: Arc<Shared>,
    id: StreamId,
}

impl RecvBody {
    pub async fn read(&self) -> Result<Option<Bytes>> {
        poll_fn(|cx| self.shared.poll_read(cx, self.id)).await
    }

    pub async fn read_to_end(&self) -> Result<Bytes> {
        read_to_end(&self.shared, self.id).await
    }
}

async fn read_to_end(shared: &Shared, id: StreamId) -> Result<Bytes> {
    let mut body = BytesMut::new();
    while let Some(chunk) = poll_fn(|cx| shared.poll_read(cx, id)).await? {
        body.extend_from_slice(&chunk);
    }
    Ok(body.freeze())
}
