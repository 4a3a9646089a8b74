//! Idle/active/away tracking driven by activity signals.

use crate::presence::UserIdleState;
use std::sync::mpsc::{Receiver, Sender, channel};
use std::time::{Duration, Instant};

/// Raw activity reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivitySignal {
    /// Pointer moved over the canvas
    PointerMove,
    /// Document became hidden
    Hidden,
    /// Document became visible again
    Visible,
}

/// Source of activity signals polled by the session.
pub trait ActivitySource {
    /// Take every signal observed since the last call.
    fn drain(&mut self) -> Vec<ActivitySignal>;
}

/// Activity source fed through a channel, usable from any thread.
pub struct ChannelActivitySource {
    rx: Receiver<ActivitySignal>,
}

impl ChannelActivitySource {
    /// Create the source together with the sender the host reports into.
    pub fn new() -> (Sender<ActivitySignal>, Self) {
        let (tx, rx) = channel();
        (tx, Self { rx })
    }
}

impl ActivitySource for ChannelActivitySource {
    fn drain(&mut self) -> Vec<ActivitySignal> {
        self.rx.try_iter().collect()
    }
}

/// Idle state machine.
///
/// Pointer activity reports `Active` (re-reported every `active_threshold`
/// while it continues) and arms an idle deadline. Hiding the document reports
/// `Away` and disarms both timers; showing it reports `Active` again.
#[derive(Debug)]
pub struct IdleDetector {
    idle_threshold: Duration,
    active_threshold: Duration,
    state: UserIdleState,
    idle_deadline: Option<Instant>,
    /// Next time an ongoing pointer stream re-reports `Active`.
    heartbeat_at: Option<Instant>,
}

impl IdleDetector {
    pub fn new(idle_threshold: Duration, active_threshold: Duration) -> Self {
        Self {
            idle_threshold,
            active_threshold,
            state: UserIdleState::Active,
            idle_deadline: None,
            heartbeat_at: None,
        }
    }

    pub fn state(&self) -> UserIdleState {
        self.state
    }

    /// Apply a signal, returning the state to broadcast if one is due.
    pub fn handle_signal(&mut self, signal: ActivitySignal, now: Instant) -> Option<UserIdleState> {
        match signal {
            ActivitySignal::PointerMove => {
                self.idle_deadline = Some(now + self.idle_threshold);
                let heartbeat_due = self.heartbeat_at.is_none_or(|at| now >= at);
                if self.state != UserIdleState::Active || heartbeat_due {
                    self.heartbeat_at = Some(now + self.active_threshold);
                    return Some(self.transition(UserIdleState::Active));
                }
                None
            }
            ActivitySignal::Hidden => {
                self.idle_deadline = None;
                self.heartbeat_at = None;
                Some(self.transition(UserIdleState::Away))
            }
            ActivitySignal::Visible => {
                self.idle_deadline = Some(now + self.idle_threshold);
                self.heartbeat_at = Some(now + self.active_threshold);
                Some(self.transition(UserIdleState::Active))
            }
        }
    }

    /// Advance timers; returns `Idle` once the pointer has been quiet long enough.
    pub fn tick(&mut self, now: Instant) -> Option<UserIdleState> {
        match self.idle_deadline {
            Some(deadline) if now >= deadline => {
                self.idle_deadline = None;
                self.heartbeat_at = None;
                Some(self.transition(UserIdleState::Idle))
            }
            _ => None,
        }
    }

    /// Disarm all timers and return to `Active` without reporting.
    pub fn reset(&mut self) {
        self.state = UserIdleState::Active;
        self.idle_deadline = None;
        self.heartbeat_at = None;
    }

    fn transition(&mut self, next: UserIdleState) -> UserIdleState {
        if self.state != next {
            log::debug!("Idle state {:?} -> {:?}", self.state, next);
        }
        self.state = next;
        next
    }
}
