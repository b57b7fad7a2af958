//! The multiplexed connection.
//!
//! One [`Connection`] owns the stream table, the connection-level flow
//! windows, both SETTINGS sets and the outbound frame queue. Every piece of
//! that state lives in a single [`State`] behind one mutex; inbound frames
//! and local operations each hold it for one short, non-blocking step, so
//! they never observe each other half-done.
//!
//! I/O happens in the [`Driver`], which the caller runs on its executor:
//!
//! ```text
//!            +-----------------+    handle_frame()    +-----------+
//!  socket -> | read loop       | -------------------> |  State    |
//!            | (FrameReader)   |                      |  (mutex)  |
//!            +-----------------+                      +-----------+
//!                                                          |
//!            +-----------------+   WriteOp (mpsc, FIFO)    |
//!  socket <- | write loop      | <-------------------------+-- stream ops
//!            | (FrameWriter)   |
//!            +-----------------+
//! ```
//!
//! The write loop is the only code that touches the outbound half of the
//! transport, so frames are emitted whole and in the order they were
//! queued. Queueing happens under the state lock, which keeps frame order
//! consistent with the state transitions that produced the frames.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::{poll_fn, Future};
use std::io;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, trace, warn};

use crate::config::{Config, Mode};
use crate::error::{Error, ErrorCode, Result};
use crate::flow_control::{FlowWindow, DEFAULT_WINDOW_SIZE};
use crate::frame::{Frame, StreamId};
use crate::h2_codec::H2Codec;
use crate::hpack::HeaderBlock;
use crate::settings::Settings;
use crate::stream::{RecvBody, Stream, StreamHandle, StreamState};
use crate::transport::{FrameReader, FrameWriter};

const MAX_STREAM_ID: StreamId = 0x7FFF_FFFF;

/// Opaque payload of our PINGs. Only one is ever outstanding.
const PING_PAYLOAD: [u8; 8] = *b"OKok\xf0\x9f\x8d\xa9";

/// Connection lifecycle. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Lifecycle {
    Active,
    /// GOAWAY sent or received: no new streams, existing ones may finish.
    ShuttingDown,
    /// All streams force-closed; nothing more goes on the wire.
    Closed,
}

/// A unit of work for the write loop.
#[derive(Debug)]
pub(crate) enum WriteOp {
    Frame(Frame),
    /// Frame whose sender waits until it has been flushed to the transport.
    Tracked(Frame, oneshot::Sender<Result<()>>),
    /// Peer changed SETTINGS_MAX_FRAME_SIZE or SETTINGS_HEADER_TABLE_SIZE;
    /// applies to frames queued after it.
    PeerFrameLimits {
        max_frame_size: u32,
        header_table_size: u32,
    },
    /// Flush, shut the transport down and stop.
    Close,
}

struct PendingPing {
    payload: [u8; 8],
    done: oneshot::Sender<Result<()>>,
}

struct State {
    lifecycle: Lifecycle,
    local_settings: Settings,
    peer_settings: Settings,
    settings_received: bool,
    next_stream_id: StreamId,
    /// Highest peer-initiated stream we acted on; reported in GOAWAY.
    last_good_stream_id: StreamId,
    /// Highest peer-initiated id seen at all, refused ones included.
    max_peer_stream_id: StreamId,
    streams: HashMap<StreamId, Stream>,
    /// Streams that left the table while their handle is still around, so
    /// buffered body, headers and the terminal error stay readable.
    retired: HashMap<StreamId, Stream>,
    send_window: FlowWindow,
    recv_window: FlowWindow,
    /// Inbound DATA bytes not yet returned to the peer at connection level.
    unacknowledged: u32,
    goaway_sent: bool,
    peer_goaway: Option<Error>,
    failure: Option<Error>,
    ping: Option<PendingPing>,
    accept_queue: VecDeque<StreamId>,
    /// Tasks waiting on connection-level events: first SETTINGS, new
    /// peer streams, the table draining, teardown.
    waiters: Vec<Waker>,
}

impl State {
    fn park(&mut self, cx: &mut Context<'_>) {
        if !self.waiters.iter().any(|w| w.will_wake(cx.waker())) {
            self.waiters.push(cx.waker().clone());
        }
    }

    fn wake(&mut self) {
        for waker in self.waiters.drain(..) {
            waker.wake();
        }
    }

    fn failure(&self) -> Error {
        self.failure.clone().unwrap_or(Error::ConnectionClosed)
    }

    /// Why a stream that is no longer live cannot be used.
    fn gone(&self, id: StreamId) -> Error {
        if let Some(stream) = self.retired.get(&id) {
            if let Err(err) = stream.send.check(id) {
                return err;
            }
        }
        self.failure.clone().unwrap_or(Error::StreamClosed(id))
    }
}

pub(crate) struct Shared {
    state: Mutex<State>,
    writes: mpsc::UnboundedSender<WriteOp>,
    stop_reader: watch::Sender<bool>,
    is_client: bool,
}

impl fmt::Debug for Shared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Shared")
            .field("is_client", &self.is_client)
            .field("lifecycle", &state.lifecycle)
            .field("streams", &state.streams.len())
            .finish()
    }
}

impl Shared {
    fn enqueue(&self, op: WriteOp) {
        if self.writes.send(op).is_err() {
            trace!("write loop gone, dropping frame");
        }
    }

    fn send_frame(&self, frame: Frame) {
        self.enqueue(WriteOp::Frame(frame));
    }

    fn send_tracked(&self, frame: Frame) -> oneshot::Receiver<Result<()>> {
        let (done, flushed) = oneshot::channel();
        self.enqueue(WriteOp::Tracked(frame, done));
        flushed
    }

    fn is_local(&self, id: StreamId) -> bool {
        (id % 2 == 1) == self.is_client
    }

    pub(crate) fn failure(&self) -> Error {
        self.state.lock().failure()
    }

    // ========================================================================
    // Inbound frames
    // ========================================================================

    /// Apply one inbound frame. An error means the connection must fail.
    pub(crate) fn handle_frame(&self, frame: Frame) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.lifecycle == Lifecycle::Closed {
            return Ok(());
        }
        if !state.settings_received && !matches!(frame, Frame::Settings { .. }) {
            return Err(Error::protocol(format!(
                "expected SETTINGS as first frame, got {}",
                frame.kind()
            )));
        }
        match frame {
            Frame::Data {
                stream_id,
                end_stream,
                data,
                flow_len,
            } => self.on_data(state, stream_id, data, flow_len, end_stream),
            Frame::Headers {
                stream_id,
                end_stream,
                block,
                ..
            } => self.on_headers(state, stream_id, block, end_stream),
            Frame::Reset { stream_id, code } => self.on_reset(state, stream_id, code),
            Frame::Settings {
                clear_previous,
                settings,
            } => self.on_settings(state, &settings, clear_previous),
            Frame::SettingsAck => {
                debug!("peer acknowledged SETTINGS");
                Ok(())
            }
            Frame::Ping { ack: false, payload } => {
                self.send_frame(Frame::Ping { ack: true, payload });
                Ok(())
            }
            Frame::Ping { ack: true, payload } => {
                match state.ping.take() {
                    Some(ping) if ping.payload == payload => {
                        let _ = ping.done.send(Ok(()));
                    }
                    other => {
                        trace!("ignoring unsolicited PING ack");
                        state.ping = other;
                    }
                }
                Ok(())
            }
            Frame::GoAway {
                last_stream_id,
                code,
                debug_data,
            } => {
                self.on_goaway(state, last_stream_id, code, &debug_data);
                Ok(())
            }
            Frame::WindowUpdate {
                stream_id,
                increment,
            } => self.on_window_update(state, stream_id, increment),
        }
    }

    /// A frame named a stream that is not in the table. Fine if the stream
    /// existed and has since closed (the peer may not know yet); a protocol
    /// error if the id was never opened.
    fn check_unknown(&self, state: &State, id: StreamId, kind: &str) -> Result<()> {
        let idle = if self.is_local(id) {
            id >= state.next_stream_id
        } else {
            id > state.max_peer_stream_id
        };
        if idle {
            return Err(Error::protocol(format!("{} on idle stream {}", kind, id)));
        }
        trace!(stream_id = id, kind, "frame for closed stream ignored");
        Ok(())
    }

    fn on_data(
        &self,
        state: &mut State,
        id: StreamId,
        data: Bytes,
        flow_len: u32,
        end_stream: bool,
    ) -> Result<()> {
        // Connection credit is consumed even when the stream is gone.
        if i64::from(flow_len) > state.recv_window.available() {
            return Err(Error::flow_control(format!(
                "DATA of {} bytes exceeds connection window of {}",
                flow_len,
                state.recv_window.available()
            )));
        }
        state.recv_window.reserve(flow_len as usize);
        state.unacknowledged += flow_len;
        if state.unacknowledged > state.local_settings.initial_window_size() / 2 {
            let increment = std::mem::take(&mut state.unacknowledged);
            state.recv_window.credit(i64::from(increment));
            self.send_frame(Frame::WindowUpdate {
                stream_id: 0,
                increment,
            });
        }

        match state.streams.get_mut(&id) {
            Some(stream) => {
                stream.recv_data(data, flow_len, end_stream)?;
                self.retire_if_finished(state, id);
                Ok(())
            }
            None => self.check_unknown(state, id, "DATA"),
        }
    }

    fn on_headers(&self, state: &mut State, id: StreamId, block: HeaderBlock, end_stream: bool) -> Result<()> {
        if let Some(stream) = state.streams.get_mut(&id) {
            stream.recv_headers(block, end_stream)?;
            self.retire_if_finished(state, id);
            return Ok(());
        }
        if self.is_local(id) || id <= state.max_peer_stream_id {
            return self.check_unknown(state, id, "HEADERS");
        }
        if self.is_client {
            return Err(Error::protocol(format!("server opened stream {}", id)));
        }

        state.max_peer_stream_id = id;
        let active = state.streams.keys().filter(|&&sid| !self.is_local(sid)).count();
        let limit = state.local_settings.max_concurrent_streams().unwrap_or(u32::MAX);
        if state.lifecycle != Lifecycle::Active || active >= limit as usize {
            debug!(stream_id = id, active, "refusing stream");
            self.send_frame(Frame::Reset {
                stream_id: id,
                code: ErrorCode::RefusedStream,
            });
            return Ok(());
        }

        let mut stream = Stream::new(
            id,
            state.local_settings.initial_window_size(),
            state.peer_settings.initial_window_size(),
        );
        stream.accept();
        stream.recv_headers(block, end_stream)?;
        debug!(stream_id = id, end_stream, "peer opened stream");
        state.last_good_stream_id = id;
        state.streams.insert(id, stream);
        state.accept_queue.push_back(id);
        state.wake();
        Ok(())
    }

    fn on_reset(&self, state: &mut State, id: StreamId, code: ErrorCode) -> Result<()> {
        match state.streams.remove(&id) {
            Some(mut stream) => {
                stream.reset(code, true);
                self.retire(state, stream);
                Ok(())
            }
            None => self.check_unknown(state, id, "RST_STREAM"),
        }
    }

    fn on_settings(&self, state: &mut State, settings: &Settings, clear_previous: bool) -> Result<()> {
        let delta = state.peer_settings.apply(settings, clear_previous)?;
        let first = !state.settings_received;
        state.settings_received = true;

        // Only stream windows move; the connection window is untouched.
        let shift = delta.initial_window_delta;
        if shift != 0 {
            if let Some(stream) = state.streams.values().find(|s| !s.write_window.check_credit(shift)) {
                return Err(Error::flow_control(format!(
                    "INITIAL_WINDOW_SIZE change overflows window of stream {}",
                    stream.id()
                )));
            }
            for stream in state.streams.values_mut() {
                stream.write_window.credit(shift);
            }
        }
        debug!(settings = ?state.peer_settings, window_delta = shift, "peer settings applied");

        self.enqueue(WriteOp::PeerFrameLimits {
            max_frame_size: delta.max_frame_size,
            header_table_size: delta.header_table_size,
        });
        self.send_frame(Frame::SettingsAck);
        if first {
            state.wake();
        }
        Ok(())
    }

    fn on_goaway(&self, state: &mut State, last_stream_id: StreamId, code: ErrorCode, debug_data: &[u8]) {
        if code == ErrorCode::NoError {
            debug!(last_stream_id, "peer sent GOAWAY");
        } else {
            warn!(
                last_stream_id,
                %code,
                debug_data = %String::from_utf8_lossy(debug_data),
                "peer sent GOAWAY"
            );
        }
        let err = Error::GoAway { last_stream_id, code };
        if state.lifecycle == Lifecycle::Active {
            state.lifecycle = Lifecycle::ShuttingDown;
        }
        state.peer_goaway = Some(err.clone());

        let doomed: Vec<StreamId> = state
            .streams
            .keys()
            .copied()
            .filter(|&id| self.is_local(id) && id > last_stream_id)
            .collect();
        for id in doomed {
            if let Some(mut stream) = state.streams.remove(&id) {
                stream.fail(err.clone());
                self.retire(state, stream);
            }
        }
        self.check_drained(state);
    }

    fn on_window_update(&self, state: &mut State, id: StreamId, increment: u32) -> Result<()> {
        if increment == 0 {
            return Err(Error::protocol(format!(
                "WINDOW_UPDATE with zero increment on stream {}",
                id
            )));
        }
        let delta = i64::from(increment);
        if id == 0 {
            if !state.send_window.check_credit(delta) {
                return Err(Error::flow_control("connection window overflow"));
            }
            state.send_window.credit(delta);
            return Ok(());
        }
        match state.streams.get_mut(&id) {
            Some(stream) => {
                if !stream.write_window.check_credit(delta) {
                    return Err(Error::flow_control(format!("stream {} window overflow", id)));
                }
                stream.write_window.credit(delta);
                Ok(())
            }
            None => self.check_unknown(state, id, "WINDOW_UPDATE"),
        }
    }

    // ========================================================================
    // Stream table maintenance
    // ========================================================================

    fn retire_if_finished(&self, state: &mut State, id: StreamId) {
        if !state.streams.get(&id).is_some_and(Stream::is_finished) {
            return;
        }
        if let Some(stream) = state.streams.remove(&id) {
            self.retire(state, stream);
        }
    }

    fn retire(&self, state: &mut State, stream: Stream) {
        debug!(stream_id = stream.id(), state = ?stream.state(), "stream removed");
        let id = stream.id();
        let queued = state.accept_queue.iter().position(|&queued| queued == id);
        if let Some(index) = queued {
            // Never handed to the application, so no handle will release it.
            state.accept_queue.remove(index);
        } else if !stream.is_detached() {
            state.retired.insert(id, stream);
        }
        // A writer of this stream may be parked on connection credit rather
        // than its own window; it has to observe the removal.
        state.send_window.wake_all();
        self.check_drained(state);
    }

    /// Once the table is empty, wake anyone waiting for a graceful drain and
    /// finish a peer-initiated shutdown.
    fn check_drained(&self, state: &mut State) {
        if !state.streams.is_empty() {
            return;
        }
        state.wake();
        if let Some(err) = state.peer_goaway.clone() {
            self.teardown(state, err);
        }
    }

    /// Enter `Closed`: every live stream fails with `err`, every waiter is
    /// released, the write loop is told to finish and the read loop to stop.
    fn teardown(&self, state: &mut State, err: Error) {
        if state.lifecycle == Lifecycle::Closed {
            return;
        }
        debug!(error = %err, streams = state.streams.len(), "closing connection");
        state.lifecycle = Lifecycle::Closed;
        state.failure = Some(err.clone());
        for (id, mut stream) in std::mem::take(&mut state.streams) {
            stream.fail(err.clone());
            if !stream.is_detached() && !state.accept_queue.contains(&id) {
                state.retired.insert(id, stream);
            }
        }
        if let Some(ping) = state.ping.take() {
            let _ = ping.done.send(Err(err));
        }
        state.accept_queue.clear();
        state.send_window.wake_all();
        state.wake();
        self.enqueue(WriteOp::Close);
        self.stop_reader.send_replace(true);
    }

    fn fail_locked(&self, state: &mut State, err: Error) {
        if state.lifecycle == Lifecycle::Closed {
            return;
        }
        warn!(error = %err, "connection failed");
        if !matches!(err, Error::Transport(_)) && !state.goaway_sent {
            state.goaway_sent = true;
            self.send_frame(Frame::GoAway {
                last_stream_id: state.last_good_stream_id,
                code: err.code(),
                debug_data: Bytes::from(err.to_string()),
            });
        }
        self.teardown(state, err);
    }

    /// Fail the whole connection. Every outstanding operation resolves with
    /// a clone of `err`.
    pub(crate) fn fail(&self, err: Error) {
        let mut state = self.state.lock();
        self.fail_locked(&mut state, err);
    }

    // ========================================================================
    // Local stream operations
    // ========================================================================

    fn open_local(&self, headers: HeaderBlock, output_finished: bool) -> Result<StreamId> {
        if !self.is_client {
            return Err(Error::User("only clients open streams"));
        }
        let mut guard = self.state.lock();
        let state = &mut *guard;
        match state.lifecycle {
            Lifecycle::Active => {}
            Lifecycle::ShuttingDown => {
                return Err(state.peer_goaway.clone().unwrap_or(Error::ConnectionClosed));
            }
            Lifecycle::Closed => return Err(state.failure()),
        }
        if let Some(limit) = state.peer_settings.max_concurrent_streams() {
            let active = state.streams.keys().filter(|&&id| self.is_local(id)).count();
            if active >= limit as usize {
                return Err(Error::User("peer's concurrent stream limit reached"));
            }
        }
        let id = state.next_stream_id;
        if id > MAX_STREAM_ID {
            return Err(Error::User("stream ids exhausted"));
        }
        state.next_stream_id += 2;

        let mut stream = Stream::new(
            id,
            state.local_settings.initial_window_size(),
            state.peer_settings.initial_window_size(),
        );
        stream.open(output_finished);
        debug!(stream_id = id, output_finished, "opened stream");
        state.streams.insert(id, stream);
        self.send_frame(Frame::headers(id, headers, output_finished));
        Ok(id)
    }

    pub(crate) fn stream_state(&self, id: StreamId) -> StreamState {
        let state = self.state.lock();
        state
            .streams
            .get(&id)
            .or_else(|| state.retired.get(&id))
            .map_or(StreamState::Closed, Stream::state)
    }

    pub(crate) fn send_window(&self, id: StreamId) -> Option<i64> {
        let state = self.state.lock();
        state.streams.get(&id).map(|s| s.write_window.available())
    }

    pub(crate) fn trailers(&self, id: StreamId) -> Option<HeaderBlock> {
        let state = self.state.lock();
        state
            .streams
            .get(&id)
            .or_else(|| state.retired.get(&id))
            .and_then(|s| s.trailers().cloned())
    }

    pub(crate) fn poll_headers(&self, cx: &mut Context<'_>, id: StreamId) -> Poll<Result<HeaderBlock>> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if let Some(stream) = state.streams.get_mut(&id) {
            return stream.poll_headers(cx);
        }
        if let Some(stream) = state.retired.get_mut(&id) {
            return stream.poll_headers(cx);
        }
        Poll::Ready(Err(state.gone(id)))
    }

    /// Read the next chunk. Consumption is what returns stream-level credit
    /// to the peer, once more than half the window is outstanding.
    pub(crate) fn poll_read(&self, cx: &mut Context<'_>, id: StreamId) -> Poll<Result<Option<Bytes>>> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if let Some(stream) = state.streams.get_mut(&id) {
            let polled = stream.recv.poll_read(cx);
            if matches!(polled, Poll::Ready(Ok(Some(_)))) && !stream.is_input_closed() {
                if let Some(increment) = stream.recv.take_acknowledgement() {
                    stream.read_window.credit(i64::from(increment));
                    self.send_frame(Frame::WindowUpdate {
                        stream_id: id,
                        increment,
                    });
                }
            }
            return polled;
        }
        if let Some(stream) = state.retired.get_mut(&id) {
            return stream.recv.poll_read(cx);
        }
        Poll::Ready(Err(state.gone(id)))
    }

    pub(crate) async fn write(&self, id: StreamId, mut data: Bytes, end_stream: bool) -> Result<()> {
        if data.is_empty() {
            return if end_stream { self.close_output(id).await } else { Ok(()) };
        }
        self.begin_write(id)?;
        let _slot = WriteSlot { shared: self, id };
        while !data.is_empty() {
            let flushed = poll_fn(|cx| self.poll_send_data(cx, id, &mut data, end_stream)).await?;
            match flushed.await {
                Ok(result) => result?,
                Err(_) => return Err(self.failure()),
            }
        }
        Ok(())
    }

    fn begin_write(&self, id: StreamId) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        match state.streams.get_mut(&id) {
            Some(stream) => {
                if !stream.send.headers_sent() {
                    return Err(Error::User("headers must be sent before body data"));
                }
                stream.send.begin_write(id)
            }
            None => Err(state.gone(id)),
        }
    }

    fn end_write(&self, id: StreamId) {
        if let Some(stream) = self.state.lock().streams.get_mut(&id) {
            stream.send.end_write();
        }
    }

    /// Admit as much of `data` as both windows and the peer's frame size
    /// allow, queue it as one DATA frame, and hand back its flush signal.
    fn poll_send_data(
        &self,
        cx: &mut Context<'_>,
        id: StreamId,
        data: &mut Bytes,
        end_stream: bool,
    ) -> Poll<Result<oneshot::Receiver<Result<()>>>> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let max_frame_size = state.peer_settings.max_frame_size() as usize;
        let stream = match state.streams.get_mut(&id) {
            Some(stream) => stream,
            None => return Poll::Ready(Err(state.gone(id))),
        };
        if let Err(err) = stream.send.check(id) {
            return Poll::Ready(Err(err));
        }
        if stream.write_window.poll_capacity(cx).is_pending() {
            trace!(stream_id = id, "waiting for stream credit");
            return Poll::Pending;
        }
        if state.send_window.poll_capacity(cx).is_pending() {
            trace!(stream_id = id, "waiting for connection credit");
            return Poll::Pending;
        }

        let wanted = data.len().min(max_frame_size);
        let admitted = stream
            .write_window
            .admissible(wanted)
            .min(state.send_window.admissible(wanted));
        stream.write_window.reserve(admitted);
        state.send_window.reserve(admitted);
        let chunk = data.split_to(admitted);
        let last = end_stream && data.is_empty();
        if last {
            stream.close_output();
        }
        trace!(stream_id = id, len = admitted, last, "data admitted");

        let flushed = self.send_tracked(Frame::data(id, chunk, last));
        if last {
            self.retire_if_finished(state, id);
        }
        Poll::Ready(Ok(flushed))
    }

    pub(crate) async fn close_output(&self, id: StreamId) -> Result<()> {
        let flushed = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let stream = match state.streams.get_mut(&id) {
                Some(stream) => stream,
                None => {
                    return match state.retired.get(&id) {
                        Some(stream) if stream.state() == StreamState::Closed => Ok(()),
                        _ => Err(state.gone(id)),
                    };
                }
            };
            if stream.is_output_closed() {
                return Ok(());
            }
            if stream.send.is_writing() {
                return Err(Error::ConcurrentWrite(id));
            }
            if !stream.send.headers_sent() {
                return Err(Error::User("headers must be sent before closing output"));
            }
            stream.close_output();
            let flushed = self.send_tracked(Frame::data(id, Bytes::new(), true));
            self.retire_if_finished(state, id);
            flushed
        };
        match flushed.await {
            Ok(result) => result,
            Err(_) => Err(self.failure()),
        }
    }

    pub(crate) fn send_headers(&self, id: StreamId, block: HeaderBlock, end_stream: bool) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let stream = match state.streams.get_mut(&id) {
            Some(stream) => stream,
            None => return Err(state.gone(id)),
        };
        stream.send.check(id)?;
        if stream.send.is_writing() {
            return Err(Error::ConcurrentWrite(id));
        }
        if stream.send.headers_sent() && !end_stream {
            return Err(Error::User("trailers must end the stream"));
        }
        stream.send.mark_headers_sent();
        if end_stream {
            stream.close_output();
        }
        self.send_frame(Frame::headers(id, block, end_stream));
        self.retire_if_finished(state, id);
        Ok(())
    }

    pub(crate) fn reset_stream(&self, id: StreamId, code: ErrorCode) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if let Some(mut stream) = state.streams.remove(&id) {
            stream.reset(code, false);
            self.send_frame(Frame::Reset { stream_id: id, code });
            self.retire(state, stream);
        }
    }

    /// The application handle is gone: forget retired state and cancel the
    /// stream if it is still live.
    pub(crate) fn release(&self, id: StreamId) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.retired.remove(&id);
        if let Some(mut stream) = state.streams.remove(&id) {
            debug!(stream_id = id, "handle dropped on live stream, cancelling");
            stream.reset(ErrorCode::Cancel, false);
            stream.detach();
            self.send_frame(Frame::Reset {
                stream_id: id,
                code: ErrorCode::Cancel,
            });
            self.retire(state, stream);
        }
    }

    // ========================================================================
    // Connection operations
    // ========================================================================

    fn poll_ready(&self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        let mut state = self.state.lock();
        if state.lifecycle == Lifecycle::Closed {
            return Poll::Ready(Err(state.failure()));
        }
        if state.settings_received {
            return Poll::Ready(Ok(()));
        }
        state.park(cx);
        Poll::Pending
    }

    fn poll_accept(&self, cx: &mut Context<'_>) -> Poll<Option<StreamId>> {
        if self.is_client {
            return Poll::Ready(None);
        }
        let mut state = self.state.lock();
        if let Some(id) = state.accept_queue.pop_front() {
            return Poll::Ready(Some(id));
        }
        if state.lifecycle != Lifecycle::Active {
            return Poll::Ready(None);
        }
        state.park(cx);
        Poll::Pending
    }

    fn start_ping(&self) -> Result<oneshot::Receiver<Result<()>>> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.lifecycle == Lifecycle::Closed {
            return Err(state.failure());
        }
        if state.ping.is_some() {
            self.fail_locked(state, Error::Timeout);
            return Err(Error::Timeout);
        }
        let (done, answered) = oneshot::channel();
        state.ping = Some(PendingPing {
            payload: PING_PAYLOAD,
            done,
        });
        self.send_frame(Frame::Ping {
            ack: false,
            payload: PING_PAYLOAD,
        });
        Ok(answered)
    }

    /// Send GOAWAY and stop taking new streams. False if already closed.
    fn begin_shutdown(&self) -> bool {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.lifecycle == Lifecycle::Closed {
            return false;
        }
        if state.lifecycle == Lifecycle::Active {
            state.lifecycle = Lifecycle::ShuttingDown;
        }
        if !state.goaway_sent {
            state.goaway_sent = true;
            debug!(last_stream_id = state.last_good_stream_id, "sending GOAWAY");
            self.send_frame(Frame::GoAway {
                last_stream_id: state.last_good_stream_id,
                code: ErrorCode::NoError,
                debug_data: Bytes::new(),
            });
        }
        state.wake();
        true
    }

    fn poll_drained(&self, cx: &mut Context<'_>) -> Poll<()> {
        let mut state = self.state.lock();
        if state.streams.is_empty() || state.lifecycle == Lifecycle::Closed {
            return Poll::Ready(());
        }
        state.park(cx);
        Poll::Pending
    }

    fn finish_close(&self) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.lifecycle == Lifecycle::Closed {
            return;
        }
        let mut remaining: Vec<StreamId> = state.streams.keys().copied().collect();
        remaining.sort_unstable();
        for id in remaining {
            self.send_frame(Frame::Reset {
                stream_id: id,
                code: ErrorCode::Cancel,
            });
        }
        self.teardown(state, Error::ConnectionClosed);
    }
}

/// Releases a stream's write slot when the write finishes or is dropped.
struct WriteSlot<'a> {
    shared: &'a Shared,
    id: StreamId,
}

impl Drop for WriteSlot<'_> {
    fn drop(&mut self) {
        self.shared.end_write(self.id);
    }
}

// ============================================================================
// Public API
// ============================================================================

/// Handle to a multiplexed connection. Cheap to clone; all clones drive
/// the same connection.
#[derive(Debug, Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// Start a connection over `io`.
    ///
    /// Writes the preface (client) and our SETTINGS, plus a connection
    /// WINDOW_UPDATE when our receive window is larger than the protocol
    /// default. The returned [`Driver`] performs all further I/O and must be
    /// run for the connection to make progress.
    pub async fn handshake<T>(io: T, config: Config) -> Result<(Connection, Driver<T>)>
    where
        T: AsyncRead + AsyncWrite,
    {
        let local_settings = config.local_settings();
        local_settings.validate()?;
        let is_client = config.mode.is_client();

        let codec = match config.mode {
            Mode::Server => H2Codec::expecting_preface(),
            Mode::Client | Mode::ServerSkipConnectionPreface => {
                let mut codec = H2Codec::new();
                codec.set_preface_received(true);
                codec
            }
        };
        let (read_half, write_half) = tokio::io::split(io);
        let mut reader = FrameReader::new(read_half, codec);
        reader.set_max_frame_size(config.max_frame_size);
        reader.set_header_limits(config.header_table_size, config.max_header_list_size);
        let mut writer = FrameWriter::new(write_half);
        if is_client {
            writer.write_preface();
        }
        writer.write_settings(&local_settings);
        let window = config.initial_window_size.max(DEFAULT_WINDOW_SIZE);
        if window > DEFAULT_WINDOW_SIZE {
            writer.write_window_update(0, window - DEFAULT_WINDOW_SIZE);
        }
        writer.flush().await?;
        debug!(mode = ?config.mode, settings = ?local_settings, "handshake sent");

        let (writes, queue) = mpsc::unbounded_channel();
        let (stop_reader, stopped) = watch::channel(false);
        let state = State {
            lifecycle: Lifecycle::Active,
            local_settings,
            peer_settings: Settings::new(),
            settings_received: false,
            next_stream_id: if is_client { 1 } else { 2 },
            last_good_stream_id: 0,
            max_peer_stream_id: 0,
            streams: HashMap::new(),
            retired: HashMap::new(),
            send_window: FlowWindow::new(DEFAULT_WINDOW_SIZE),
            recv_window: FlowWindow::new(window),
            unacknowledged: 0,
            goaway_sent: false,
            peer_goaway: None,
            failure: None,
            ping: None,
            accept_queue: VecDeque::new(),
            waiters: Vec::new(),
        };
        let shared = Arc::new(Shared {
            state: Mutex::new(state),
            writes,
            stop_reader,
            is_client,
        });
        let driver = Driver {
            shared: shared.clone(),
            reader,
            writer,
            queue,
            stopped,
        };
        Ok((Connection { shared }, driver))
    }

    pub fn is_client(&self) -> bool {
        self.shared.is_client
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.shared.state.lock().lifecycle
    }

    pub fn peer_settings(&self) -> Settings {
        self.shared.state.lock().peer_settings.clone()
    }

    /// Resolves once the peer's first SETTINGS has been applied.
    pub async fn ready(&self) -> Result<()> {
        poll_fn(|cx| self.shared.poll_ready(cx)).await
    }

    /// Open a client stream and queue its HEADERS. With `output_finished`
    /// the HEADERS frame carries END_STREAM and the stream starts
    /// half-closed (local).
    pub fn open(&self, headers: HeaderBlock, output_finished: bool) -> Result<StreamHandle> {
        let id = self.shared.open_local(headers, output_finished)?;
        Ok(StreamHandle::new(self.shared.clone(), id))
    }

    /// Open a client stream, send `body` if any, and wait for the response
    /// headers.
    pub async fn open_stream(&self, headers: HeaderBlock, body: Option<Bytes>) -> Result<StreamHandle> {
        self.ready().await?;
        let stream = self.open(headers, body.is_none())?;
        if let Some(body) = body {
            match stream.write_end(body).await {
                Ok(()) => {}
                // The server may answer early and cancel the rest of the upload.
                Err(Error::Reset {
                    code: ErrorCode::Cancel,
                    remote: true,
                    ..
                }) => debug!(stream_id = stream.id(), "upload cancelled by peer"),
                Err(err) => return Err(err),
            }
        }
        stream.headers().await?;
        Ok(stream)
    }

    /// Next peer-initiated stream with its headers available. `None` once
    /// the connection stops accepting streams, and always on a client.
    pub async fn accept(&self) -> Option<StreamHandle> {
        let id = poll_fn(|cx| self.shared.poll_accept(cx)).await?;
        Some(StreamHandle::new(self.shared.clone(), id))
    }

    /// Answer every peer-initiated stream with `handler`, each on its own
    /// task. A handler error is answered with `:status 500`. Returns when
    /// the connection stops accepting streams.
    pub async fn serve<F, Fut>(&self, handler: F) -> Result<()>
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response>> + Send + 'static,
    {
        if self.shared.is_client {
            return Err(Error::User("only servers accept streams"));
        }
        let handler = Arc::new(handler);
        while let Some(stream) = self.accept().await {
            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                let id = stream.id();
                if let Err(err) = respond(stream, handler.as_ref()).await {
                    debug!(stream_id = id, error = %err, "request not answered");
                }
            });
        }
        match self.shared.state.lock().failure.clone() {
            Some(err) if !is_clean_shutdown(&err) => Err(err),
            _ => Ok(()),
        }
    }

    /// Send a PING and wait for its acknowledgement. Asking again while a
    /// PING is still unanswered means the peer is unresponsive: the
    /// connection fails with [`Error::Timeout`].
    pub async fn ping(&self) -> Result<()> {
        let answered = self.shared.start_ping()?;
        match answered.await {
            Ok(result) => result,
            Err(_) => Err(self.shared.failure()),
        }
    }

    /// Send GOAWAY, optionally wait for the open streams to finish, then
    /// cancel whatever is left and tear the connection down.
    pub async fn close(&self, graceful: bool) -> Result<()> {
        if !self.shared.begin_shutdown() {
            return Ok(());
        }
        if graceful {
            poll_fn(|cx| self.shared.poll_drained(cx)).await;
        }
        self.shared.finish_close();
        Ok(())
    }
}

fn is_clean_shutdown(err: &Error) -> bool {
    matches!(
        err,
        Error::ConnectionClosed
            | Error::GoAway {
                code: ErrorCode::NoError,
                ..
            }
    )
}

async fn respond<F, Fut>(stream: StreamHandle, handler: &F) -> Result<()>
where
    F: Fn(Request) -> Fut,
    Fut: Future<Output = Result<Response>>,
{
    let headers = stream.headers().await?;
    let request = Request {
        stream_id: stream.id(),
        headers,
        body: stream.body(),
    };
    let response = match handler(request).await {
        Ok(response) => response,
        Err(err) => {
            warn!(stream_id = stream.id(), error = %err, "handler failed");
            Response::new(500)
        }
    };

    let Response {
        headers,
        body,
        trailers,
    } = response;
    let headers_end = body.is_none() && trailers.is_none();
    stream.send_headers(headers, headers_end)?;
    if let Some(body) = body {
        if trailers.is_some() {
            stream.write(body).await?;
        } else {
            stream.write_end(body).await?;
        }
    }
    if let Some(trailers) = trailers {
        stream.send_headers(trailers, true)?;
    }
    Ok(())
}

/// Runs the connection's I/O: the inbound frame loop and the outbound
/// write loop. Spawn [`run`](Driver::run) on the executor.
pub struct Driver<T> {
    shared: Arc<Shared>,
    reader: FrameReader<ReadHalf<T>>,
    writer: FrameWriter<WriteHalf<T>>,
    queue: mpsc::UnboundedReceiver<WriteOp>,
    stopped: watch::Receiver<bool>,
}

impl<T> fmt::Debug for Driver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Driver").field("shared", &self.shared).finish()
    }
}

impl<T: AsyncRead + AsyncWrite> Driver<T> {
    /// Drive the connection until it closes. Resolves with the failure
    /// cause, or `Ok` for a clean shutdown.
    pub async fn run(self) -> Result<()> {
        let Driver {
            shared,
            reader,
            writer,
            queue,
            stopped,
        } = self;
        tokio::join!(
            read_loop(shared.clone(), reader, stopped),
            write_loop(shared.clone(), writer, queue),
        );
        let failure = shared.failure();
        if is_clean_shutdown(&failure) {
            Ok(())
        } else {
            Err(failure)
        }
    }
}

async fn read_loop<R>(shared: Arc<Shared>, mut reader: FrameReader<R>, mut stopped: watch::Receiver<bool>)
where
    R: AsyncRead + Unpin,
{
    loop {
        let next = tokio::select! {
            biased;
            _ = stopped.changed() => break,
            next = reader.read_frame() => next,
        };
        let result = match next {
            Ok(Some(frame)) => shared.handle_frame(frame),
            Ok(None) => Err(io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed the transport").into()),
            Err(err) => Err(err),
        };
        if let Err(err) = result {
            shared.fail(err);
            break;
        }
    }
    trace!("read loop finished");
}

async fn write_loop<W>(shared: Arc<Shared>, mut writer: FrameWriter<W>, mut queue: mpsc::UnboundedReceiver<WriteOp>)
where
    W: AsyncWrite + Unpin,
{
    let mut flushed = Vec::new();
    let mut closing = false;
    while !closing {
        let Some(op) = queue.recv().await else {
            break;
        };
        // Encode everything queued so far, then flush once.
        let mut next = Some(op);
        while let Some(op) = next.take() {
            match op {
                WriteOp::Frame(frame) => writer.write_frame(&frame),
                WriteOp::Tracked(frame, done) => {
                    writer.write_frame(&frame);
                    flushed.push(done);
                }
                WriteOp::PeerFrameLimits {
                    max_frame_size,
                    header_table_size,
                } => {
                    writer.set_max_frame_size(max_frame_size);
                    writer.set_header_table_size(header_table_size);
                }
                WriteOp::Close => {
                    closing = true;
                    break;
                }
            }
            next = queue.try_recv().ok();
        }
        if let Err(err) = writer.flush().await {
            for done in flushed.drain(..) {
                let _ = done.send(Err(err.clone()));
            }
            shared.fail(err);
            break;
        }
        for done in flushed.drain(..) {
            let _ = done.send(Ok(()));
        }
    }
    if closing {
        if let Err(err) = writer.shutdown().await {
            debug!(error = %err, "transport shutdown failed");
        }
    }

    queue.close();
    let failure = shared.failure();
    while let Ok(op) = queue.try_recv() {
        if let WriteOp::Tracked(_, done) = op {
            let _ = done.send(Err(failure.clone()));
        }
    }
    trace!("write loop finished");
}

// ============================================================================
// Request / response views
// ============================================================================

/// What a [`Connection::serve`] handler sees of a peer-initiated stream.
#[derive(Debug)]
pub struct Request {
    stream_id: StreamId,
    headers: HeaderBlock,
    body: RecvBody,
}

impl Request {
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn headers(&self) -> &HeaderBlock {
        &self.headers
    }

    pub fn method(&self) -> Option<&str> {
        self.headers.get(":method")
    }

    pub fn path(&self) -> Option<&str> {
        self.headers.get(":path")
    }

    pub fn body(&self) -> &RecvBody {
        &self.body
    }

    pub fn into_body(self) -> RecvBody {
        self.body
    }
}

/// What a handler returns: headers, then an optional body and trailers.
#[derive(Debug, Clone)]
pub struct Response {
    headers: HeaderBlock,
    body: Option<Bytes>,
    trailers: Option<HeaderBlock>,
}

impl Response {
    pub fn new(status: u16) -> Self {
        Self {
            headers: HeaderBlock::new().with(":status", status.to_string()),
            body: None,
            trailers: None,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push(name, value);
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn trailers(mut self, trailers: HeaderBlock) -> Self {
        self.trailers = Some(trailers);
        self
    }

    pub fn status(&self) -> Option<u16> {
        self.headers.get(":status").and_then(|s| s.parse().ok())
    }

    pub fn headers(&self) -> &HeaderBlock {
        &self.headers
    }
}
