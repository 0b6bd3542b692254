//! Per-session timer bookkeeping.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use tokio_util::sync::CancellationToken;

/// One of the three timers a session can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerSlot {
    Reminder,
    FillDeadline,
    Completion,
}

impl TimerSlot {
    pub const ALL: [TimerSlot; 3] = [
        TimerSlot::Reminder,
        TimerSlot::FillDeadline,
        TimerSlot::Completion,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TimerSlot::Reminder => "reminder",
            TimerSlot::FillDeadline => "fill_deadline",
            TimerSlot::Completion => "completion",
        }
    }
}

impl fmt::Display for TimerSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A live one-shot timer. Cancelling the token stops it unless its
/// callback has already started.
#[derive(Debug)]
pub struct TimerHandle {
    pub fires_at: DateTime<Utc>,
    token: CancellationToken,
}

impl TimerHandle {
    pub fn new(fires_at: DateTime<Utc>, token: CancellationToken) -> Self {
        Self { fires_at, token }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }
}

/// Timers installed for one session by a single schedule call.
///
/// `generation` identifies the install; callbacks from an older install
/// must not touch a newer set.
#[derive(Debug)]
pub struct ScheduledTaskSet {
    pub generation: u64,
    timers: HashMap<TimerSlot, TimerHandle>,
}

impl ScheduledTaskSet {
    pub fn new(generation: u64) -> Self {
        Self {
            generation,
            timers: HashMap::new(),
        }
    }

    pub fn insert(&mut self, slot: TimerSlot, handle: TimerHandle) {
        if let Some(previous) = self.timers.insert(slot, handle) {
            previous.cancel();
        }
    }

    /// Drop `slot` without cancelling it (used once it has fired).
    pub fn release(&mut self, slot: TimerSlot) {
        self.timers.remove(&slot);
    }

    pub fn contains(&self, slot: TimerSlot) -> bool {
        self.timers.contains_key(&slot)
    }

    /// When the timer in `slot` is due, if one is held.
    pub fn fires_at(&self, slot: TimerSlot) -> Option<DateTime<Utc>> {
        self.timers.get(&slot).map(|handle| handle.fires_at)
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    /// Cancel every timer still held.
    pub fn cancel_all(&self) {
        for handle in self.timers.values() {
            handle.cancel();
        }
    }
}
