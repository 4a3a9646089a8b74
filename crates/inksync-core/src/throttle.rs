//! Rate-limited task queues.
//!
//! A [`Throttle`] coalesces calls within a window and releases the latest
//! arguments at most once per window. It owns no timer: the caller passes the
//! current [`Instant`] and polls, which keeps the timing contract testable.

use std::time::{Duration, Instant};

/// Coalescing rate limiter carrying the latest scheduled arguments.
#[derive(Debug)]
pub struct Throttle<T> {
    wait: Duration,
    /// Run immediately when the window is clear, instead of at its end.
    leading: bool,
    last_fired: Option<Instant>,
    deadline: Option<Instant>,
    pending: Option<T>,
}

impl<T> Throttle<T> {
    /// Throttle that fires on the leading edge and again on the trailing edge.
    pub fn new(wait: Duration) -> Self {
        Self {
            wait,
            leading: true,
            last_fired: None,
            deadline: None,
            pending: None,
        }
    }

    /// Throttle that only fires once the window has elapsed.
    pub fn trailing(wait: Duration) -> Self {
        Self {
            leading: false,
            ..Self::new(wait)
        }
    }

    pub fn wait(&self) -> Duration {
        self.wait
    }

    /// Schedule a run with `args`.
    ///
    /// Returns the arguments when they should run right now (leading edge).
    /// Otherwise they replace any pending arguments and run on a later [`poll`](Self::poll).
    pub fn schedule(&mut self, args: T, now: Instant) -> Option<T> {
        let window_clear = self
            .last_fired
            .is_none_or(|fired| now.duration_since(fired) >= self.wait);

        if self.leading && self.pending.is_none() && window_clear {
            self.last_fired = Some(now);
            return Some(args);
        }

        if self.deadline.is_none() {
            self.deadline = Some(match self.last_fired {
                Some(fired) if self.leading && !window_clear => fired + self.wait,
                _ => now + self.wait,
            });
        }
        self.pending = Some(args);
        None
    }

    /// Release the pending arguments if the window has elapsed.
    pub fn poll(&mut self, now: Instant) -> Option<T> {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                self.last_fired = Some(now);
                self.pending.take()
            }
            _ => None,
        }
    }

    /// Release the pending arguments immediately, regardless of the window.
    pub fn flush_now(&mut self, now: Instant) -> Option<T> {
        self.deadline = None;
        let pending = self.pending.take();
        if pending.is_some() {
            self.last_fired = Some(now);
        }
        pending
    }

    /// Drop pending arguments and forget the window.
    pub fn cancel(&mut self) {
        self.pending = None;
        self.deadline = None;
        self.last_fired = None;
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// When the pending arguments become due.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}
