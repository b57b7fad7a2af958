//! Backpressured read/write halves that sit between a stream and its user.
//!
//! [`RecvPipe`] buffers DATA payloads until the application reads them and
//! decides when consumed bytes are handed back to the peer as credit.
//! [`SendPipe`] tracks the output side: whether it is finished, whether a
//! write is in flight, and the error pending writers must observe.
//!
//! Both are plain state; the connection holds them under its lock and
//! drives wakeups.

use std::collections::VecDeque;
use std::task::{Context, Poll, Waker};

use bytes::Bytes;

use crate::error::{Error, Result};

#[derive(Debug)]
pub struct RecvPipe {
    chunks: VecDeque<Bytes>,
    buffered: usize,
    ended: bool,
    error: Option<Error>,
    waiters: Vec<Waker>,
    /// Bytes consumed (or discarded as padding) but not yet credited back.
    unacknowledged: u32,
    /// Give-back happens once `unacknowledged` exceeds this.
    ack_threshold: u32,
}

impl RecvPipe {
    /// `initial_window` is our advertised receive window; credit goes back
    /// to the peer in batches of more than half of it.
    pub fn new(initial_window: u32) -> Self {
        Self {
            chunks: VecDeque::new(),
            buffered: 0,
            ended: false,
            error: None,
            waiters: Vec::new(),
            unacknowledged: 0,
            ack_threshold: initial_window / 2,
        }
    }

    pub fn buffered(&self) -> usize {
        self.buffered
    }

    pub fn is_ended(&self) -> bool {
        self.ended || self.error.is_some()
    }

    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    /// Queue a payload for the reader. Empty payloads are not queued.
    pub fn push(&mut self, data: Bytes) {
        if !data.is_empty() {
            self.buffered += data.len();
            self.chunks.push_back(data);
        }
        self.wake();
    }

    /// Count bytes the reader will never see (padding) toward the next give-back.
    pub fn discard(&mut self, len: u32) {
        self.unacknowledged = self.unacknowledged.saturating_add(len);
    }

    /// Mark end of input. Buffered data stays readable. Returns false if
    /// input had already ended.
    pub fn end(&mut self) -> bool {
        if self.is_ended() {
            return false;
        }
        self.ended = true;
        self.wake();
        true
    }

    /// Abort input: buffered data is dropped and every read fails with `err`.
    pub fn fail(&mut self, err: Error) -> bool {
        if self.error.is_some() {
            return false;
        }
        self.chunks.clear();
        self.buffered = 0;
        self.error = Some(err);
        self.wake();
        true
    }

    /// Next chunk, `None` at end of input, or the failure cause.
    pub fn poll_read(&mut self, cx: &mut Context<'_>) -> Poll<Result<Option<Bytes>>> {
        if let Some(err) = &self.error {
            return Poll::Ready(Err(err.clone()));
        }
        if let Some(chunk) = self.chunks.pop_front() {
            self.buffered -= chunk.len();
            self.unacknowledged = self.unacknowledged.saturating_add(chunk.len() as u32);
            return Poll::Ready(Ok(Some(chunk)));
        }
        if self.ended {
            return Poll::Ready(Ok(None));
        }
        self.park(cx);
        Poll::Pending
    }

    /// Credit to return to the peer, if enough has been consumed to be worth a frame.
    pub fn take_acknowledgement(&mut self) -> Option<u32> {
        if self.unacknowledged > self.ack_threshold {
            Some(std::mem::take(&mut self.unacknowledged))
        } else {
            None
        }
    }

    /// Register interest in any change (data, end, error, headers).
    pub fn park(&mut self, cx: &mut Context<'_>) {
        if !self.waiters.iter().any(|w| w.will_wake(cx.waker())) {
            self.waiters.push(cx.waker().clone());
        }
    }

    pub fn wake(&mut self) {
        for waker in self.waiters.drain(..) {
            waker.wake();
        }
    }
}

#[derive(Debug, Default)]
pub struct SendPipe {
    headers_sent: bool,
    closed: bool,
    writing: bool,
    error: Option<Error>,
}

impl SendPipe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn headers_sent(&self) -> bool {
        self.headers_sent
    }

    pub fn mark_headers_sent(&mut self) {
        self.headers_sent = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_writing(&self) -> bool {
        self.writing
    }

    /// Fail if the output can no longer accept data.
    pub fn check(&self, stream_id: u32) -> Result<()> {
        if let Some(err) = &self.error {
            return Err(err.clone());
        }
        if self.closed {
            return Err(Error::StreamClosed(stream_id));
        }
        Ok(())
    }

    /// Claim the single write slot for this stream.
    pub fn begin_write(&mut self, stream_id: u32) -> Result<()> {
        self.check(stream_id)?;
        if self.writing {
            return Err(Error::ConcurrentWrite(stream_id));
        }
        self.writing = true;
        Ok(())
    }

    pub fn end_write(&mut self) {
        self.writing = false;
    }

    /// Finish the output. Returns false if it was already finished.
    pub fn close(&mut self) -> bool {
        !std::mem::replace(&mut self.closed, true)
    }

    pub fn fail(&mut self, err: Error) {
        if self.error.is_none() {
            self.error = Some(err);
        }
    }
}
