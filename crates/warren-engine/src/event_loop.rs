//! Per-isolate timer scheduling.
//!
//! The host side tracks only (id, due time, interval); the callbacks
//! themselves live in the JS-side `__timers` table and are fired by the
//! isolate pump calling `__fireTimer(id)`. This keeps no engine value alive
//! across pump iterations.

use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// Intervals shorter than this are clamped to prevent busy loops.
pub const MIN_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
struct TimerEntry {
    id: u64,
    when: Instant,
    interval: Option<Duration>,
    /// Registration order, used to break ties between equal due times.
    seq: u64,
}

#[derive(Default)]
struct LoopState {
    timers: Vec<TimerEntry>,
    next_id: u64,
    next_seq: u64,
}

/// Cooperative timer scheduler for one isolate.
pub struct EventLoop {
    state: Mutex<LoopState>,
}

impl EventLoop {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LoopState {
                timers: Vec::new(),
                next_id: 1,
                next_seq: 0,
            }),
        }
    }

    /// Register a timer; returns its id. Intervals are floored at
    /// [`MIN_INTERVAL`].
    pub fn register(&self, delay: Duration, is_interval: bool) -> u64 {
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        let seq = state.next_seq;
        state.next_seq += 1;

        let interval = if is_interval {
            Some(delay.max(MIN_INTERVAL))
        } else {
            None
        };

        state.timers.push(TimerEntry {
            id,
            when: Instant::now() + delay,
            interval,
            seq,
        });
        id
    }

    /// Remove a timer. Unknown ids are ignored.
    pub fn clear(&self, id: u64) -> bool {
        let mut state = self.state.lock();
        if let Some(index) = state.timers.iter().position(|t| t.id == id) {
            state.timers.remove(index);
            true
        } else {
            false
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.state.lock().timers.is_empty()
    }

    /// Earliest due time among scheduled timers, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.state.lock().timers.iter().map(|t| t.when).min()
    }

    /// Pop all timers due at `now`, in registration order. Intervals are
    /// rescheduled at `now + interval` before being returned, so a slow
    /// callback cannot make an interval fire back-to-back.
    pub fn take_due(&self, now: Instant) -> Vec<u64> {
        let mut state = self.state.lock();
        let mut due: Vec<TimerEntry> = Vec::new();
        let mut index = 0;
        while index < state.timers.len() {
            if state.timers[index].when <= now {
                due.push(state.timers.remove(index));
            } else {
                index += 1;
            }
        }
        due.sort_by_key(|t| t.seq);

        let mut ids = Vec::with_capacity(due.len());
        for mut timer in due {
            ids.push(timer.id);
            if let Some(interval) = timer.interval {
                timer.when = now + interval;
                timer.seq = state.next_seq;
                state.next_seq += 1;
                state.timers.push(timer);
            }
        }
        ids
    }

    /// Discard all timers and reset the id counter.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.timers.clear();
        state.next_id = 1;
        state.next_seq = 0;
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_clear() {
        let el = EventLoop::new();
        let a = el.register(Duration::from_millis(5), false);
        let b = el.register(Duration::from_millis(5), false);
        assert_ne!(a, b);
        assert!(el.has_pending());
        assert!(el.clear(a));
        assert!(!el.clear(a));
        assert!(el.clear(b));
        assert!(!el.has_pending());
    }

    #[test]
    fn equal_deadlines_fire_in_registration_order() {
        let el = EventLoop::new();
        let a = el.register(Duration::ZERO, false);
        let b = el.register(Duration::ZERO, false);
        let c = el.register(Duration::ZERO, false);
        let due = el.take_due(Instant::now() + Duration::from_millis(1));
        assert_eq!(due, vec![a, b, c]);
        assert!(!el.has_pending());
    }

    #[test]
    fn interval_is_rescheduled() {
        let el = EventLoop::new();
        let id = el.register(Duration::ZERO, true);
        let due = el.take_due(Instant::now() + Duration::from_millis(1));
        assert_eq!(due, vec![id]);
        // Interval timers stay scheduled after firing.
        assert!(el.has_pending());
        // The floor keeps it from being immediately due again.
        assert!(el.take_due(Instant::now()).is_empty());
    }

    #[test]
    fn interval_floor_applies() {
        let el = EventLoop::new();
        el.register(Duration::from_millis(1), true);
        let deadline = el.next_deadline().unwrap();
        // First fire honors the requested delay, not the floor.
        assert!(deadline <= Instant::now() + Duration::from_millis(2));
    }

    #[test]
    fn reset_discards_everything() {
        let el = EventLoop::new();
        el.register(Duration::from_secs(10), false);
        el.register(Duration::from_secs(10), true);
        el.reset();
        assert!(!el.has_pending());
        assert!(el.next_deadline().is_none());
    }
}
