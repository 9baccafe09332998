//! Cooperative event loop primitives
//!
//! Everything runs on one thread. Work that must not happen inside the
//! callback that triggered it (a state change requested from a state-change
//! handler, the next activation stage) goes on the ready queue and runs on
//! the next loop turn. Delayed work goes on the timer list.
//!
//! Per-device handles are single-slot: a [`Slot`] holds at most one pending
//! value plus the token of the queued [`Task`]. Re-arming with the same value
//! is a no-op; arming with a different value replaces it and the old task
//! becomes stale. A task whose token no longer matches its slot is dropped
//! when popped.

use crate::activation::Secrets;
use crate::transport::TransportEvent;
use crate::types::{CallId, DeviceId, IpFamily};
use std::collections::VecDeque;
use std::time::Instant;
use tokio::sync::mpsc;

/// Cancellation token of a queued task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(pub u64);

/// Work item run by the manager on the event loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Task {
    /// Deferred state transition for a device
    QueuedState { device: DeviceId, token: Token },
    /// Activation stage for one family slot of a device
    Stage {
        device: DeviceId,
        family: IpFamily,
        token: Token,
    },
    /// Policy auto-activation check for a device
    ActivationCheck { device: DeviceId },
    /// Policy retry-budget reset sweep
    ResetRetries,
}

/// Completion delivered by an asynchronous collaborator
#[derive(Debug)]
pub enum Event {
    Transport {
        device: DeviceId,
        family: IpFamily,
        attempt: u64,
        event: TransportEvent,
    },
    Secrets {
        device: DeviceId,
        call: CallId,
        result: Result<Secrets, String>,
    },
    Zone {
        device: DeviceId,
        family: IpFamily,
        call: CallId,
    },
    HostnameLookup {
        generation: u64,
        result: Option<String>,
    },
}

/// Sending half collaborators use to post completions back to the loop
pub type EventSink = mpsc::UnboundedSender<Event>;

/// Identifier of a scheduled timer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerId(u64);

#[derive(Debug)]
struct Timer {
    id: TimerId,
    deadline: Instant,
    task: Task,
}

/// Ready queue plus deadline-ordered timers
#[derive(Debug, Default)]
pub struct EventQueue {
    ready: VecDeque<Task>,
    timers: Vec<Timer>,
    next_id: u64,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh, never-reused token
    pub fn token(&mut self) -> Token {
        self.next_id += 1;
        Token(self.next_id)
    }

    /// Run on the next loop turn
    pub fn push(&mut self, task: Task) {
        self.ready.push_back(task);
    }

    pub fn pop(&mut self) -> Option<Task> {
        self.ready.pop_front()
    }

    /// True if an identical task is already waiting in the ready queue
    pub fn contains(&self, task: &Task) -> bool {
        self.ready.contains(task)
    }

    /// Run `task` once `deadline` has passed
    pub fn schedule_at(&mut self, deadline: Instant, task: Task) -> TimerId {
        self.next_id += 1;
        let id = TimerId(self.next_id);
        self.timers.push(Timer { id, deadline, task });
        id
    }

    pub fn cancel_timer(&mut self, id: TimerId) -> bool {
        let before = self.timers.len();
        self.timers.retain(|t| t.id != id);
        self.timers.len() != before
    }

    /// Drop queued and timed tasks matching `pred`
    pub fn cancel_where(&mut self, mut pred: impl FnMut(&Task) -> bool) {
        self.ready.retain(|t| !pred(t));
        self.timers.retain(|t| !pred(&t.task));
    }

    /// Move every timer due at `now` to the ready queue, earliest first
    pub fn fire_due(&mut self, now: Instant) -> usize {
        let (mut due, pending): (Vec<_>, Vec<_>) =
            self.timers.drain(..).partition(|t| t.deadline <= now);
        self.timers = pending;
        // Stable sort keeps insertion order for equal deadlines
        due.sort_by_key(|t| t.deadline);
        let fired = due.len();
        self.ready.extend(due.into_iter().map(|t| t.task));
        fired
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.iter().map(|t| t.deadline).min()
    }

    pub fn is_idle(&self) -> bool {
        self.ready.is_empty()
    }

    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }
}

/// Single-slot handle for one kind of deferred work
#[derive(Debug)]
pub struct Slot<T> {
    pending: Option<(T, Token)>,
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self { pending: None }
    }
}

impl<T: PartialEq> Slot<T> {
    /// Arm the slot; returns the token to queue, or `None` if the same
    /// value is already pending
    pub fn arm(&mut self, value: T, queue: &mut EventQueue) -> Option<Token> {
        if matches!(&self.pending, Some((current, _)) if *current == value) {
            return None;
        }
        let token = queue.token();
        self.pending = Some((value, token));
        Some(token)
    }

    /// Claim the pending value if `token` is still current
    pub fn take(&mut self, token: Token) -> Option<T> {
        match &self.pending {
            Some((_, current)) if *current == token => self.pending.take().map(|(v, _)| v),
            _ => None,
        }
    }

    /// Drop the pending value; the queued task becomes stale
    pub fn cancel(&mut self) -> bool {
        self.pending.take().is_some()
    }

    pub fn pending(&self) -> Option<&T> {
        self.pending.as_ref().map(|(v, _)| v)
    }

    pub fn is_armed(&self) -> bool {
        self.pending.is_some()
    }
}
