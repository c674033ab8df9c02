//! Cyclic replay of timed control directives.
//!
//! There is no timer: the owner calls [`PatternScheduler::tick`] on every
//! event and the scheduler advances when the current deadline has passed.

use crate::protocol::{Pattern, PatternEvent};

/// Fixed-point denominator for `WaitRel`.
pub const WAIT_REL_DENOM: u64 = 100;

#[derive(Debug, Clone, Default)]
pub struct PatternScheduler {
    events: Pattern,
    cursor: usize,
    deadline_us: u64,
}

impl PatternScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Swaps in a new sequence. The cursor parks on the last event so the
    /// first due tick lands on event 0; the deadline is `now_us`, so that
    /// tick is the next one.
    pub fn install(&mut self, events: Pattern, now_us: u64) {
        self.cursor = events.len().saturating_sub(1);
        self.events = events;
        self.deadline_us = now_us;
    }

    pub fn clear(&mut self) {
        self.events.clear();
        self.cursor = 0;
    }

    pub fn is_installed(&self) -> bool {
        !self.events.is_empty()
    }

    pub fn events(&self) -> &[PatternEvent] {
        &self.events
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn deadline_us(&self) -> u64 {
        self.deadline_us
    }

    /// Advances at most one event when `now_us` has reached the deadline and
    /// returns the event to dispatch.
    ///
    /// `WaitAbs(v)` sets the deadline `v` µs ahead, `WaitRel(v)` sets it
    /// `v / 100` RTTs ahead; every other event leaves the deadline in the past
    /// so the following tick advances again.
    #[inline]
    pub fn tick(&mut self, now_us: u64, rtt_us: u64) -> Option<PatternEvent> {
        if self.events.is_empty() || now_us < self.deadline_us {
            return None;
        }
        self.cursor = (self.cursor + 1) % self.events.len();
        let event = self.events[self.cursor];
        match event {
            PatternEvent::WaitAbs(us) => {
                self.deadline_us = now_us.saturating_add(us as u64);
            }
            PatternEvent::WaitRel(fraction) => {
                let wait = (fraction as u64).saturating_mul(rtt_us) / WAIT_REL_DENOM;
                self.deadline_us = now_us.saturating_add(wait);
            }
            _ => {}
        }
        Some(event)
    }
}
