//! Credit-based flow-control windows (RFC 7540 Section 5.2).
//!
//! A [`FlowWindow`] is a signed byte budget. Sends are admitted against it
//! with [`FlowWindow::reserve`], and WINDOW_UPDATE frames or SETTINGS deltas
//! replenish it with [`FlowWindow::credit`]. Writers that find the window
//! exhausted park a [`Waker`] on it; the waiters are drained as soon as a
//! credit lifts the window back above zero.

use std::task::{Context, Poll, Waker};

/// Window size every connection and stream starts with (RFC 7540 Section 6.9.2).
pub const DEFAULT_WINDOW_SIZE: u32 = 65_535;

/// Largest legal flow-control window: 2^31 - 1.
pub const MAX_WINDOW_SIZE: i64 = 0x7FFF_FFFF;

#[derive(Debug)]
pub struct FlowWindow {
    /// Remaining credit. Negative after a SETTINGS shrink outpaced consumption.
    available: i64,
    waiters: Vec<Waker>,
}

impl Default for FlowWindow {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_SIZE)
    }
}

impl FlowWindow {
    pub fn new(initial: u32) -> Self {
        Self {
            available: i64::from(initial),
            waiters: Vec::new(),
        }
    }

    pub fn available(&self) -> i64 {
        self.available
    }

    /// How much of `requested` the window would admit right now, without consuming it.
    pub fn admissible(&self, requested: usize) -> usize {
        if self.available <= 0 {
            return 0;
        }
        // available is bounded by MAX_WINDOW_SIZE, so the cast cannot truncate
        requested.min(self.available as usize)
    }

    /// Admit up to `requested` bytes and consume the admitted amount.
    pub fn reserve(&mut self, requested: usize) -> usize {
        let admitted = self.admissible(requested);
        self.available -= admitted as i64;
        admitted
    }

    /// Whether applying `delta` keeps the window within the protocol maximum.
    ///
    /// Callers must check this before [`credit`](Self::credit); an overflow
    /// is a FLOW_CONTROL_ERROR on the frame that caused it.
    pub fn check_credit(&self, delta: i64) -> bool {
        self.available.saturating_add(delta) <= MAX_WINDOW_SIZE
    }

    /// Apply a (possibly negative) credit and release parked writers if
    /// the window just became usable.
    pub fn credit(&mut self, delta: i64) {
        let was_exhausted = self.available <= 0;
        self.available = self.available.saturating_add(delta);
        if was_exhausted && self.available > 0 {
            self.wake_all();
        }
    }

    /// Ready when the window has credit; otherwise parks the caller.
    pub fn poll_capacity(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        if self.available > 0 {
            return Poll::Ready(());
        }
        if !self.waiters.iter().any(|w| w.will_wake(cx.waker())) {
            self.waiters.push(cx.waker().clone());
        }
        Poll::Pending
    }

    /// Wake every parked writer. Used on teardown so nobody stays blocked
    /// on credit that will never arrive.
    pub fn wake_all(&mut self) {
        for waker in self.waiters.drain(..) {
            waker.wake();
        }
    }

    pub fn has_waiters(&self) -> bool {
        !self.waiters.is_empty()
    }
}
