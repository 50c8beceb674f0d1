//! Virtual clock and timer registrations.
//!
//! The clock only moves when the scheduler finds every task blocked and at
//! least one timer pending. Timers due at the new instant are handed back to
//! the scheduler in the same step, so no task observes the clock between the
//! advance and the firing.

use crate::error::HarnessError;
use quiesce_env::TaskId;
use std::collections::BTreeMap;
use std::task::Waker;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Virtual time 0 maps to 2024-01-01 00:00:00 UTC.
const EPOCH_OFFSET_SECS: u64 = 1704067200;

/// Ordering key of a timer: earliest deadline first, registration order
/// among equal deadlines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerKey {
    deadline: Duration,
    seq: u64,
}

impl TimerKey {
    pub fn deadline(&self) -> Duration {
        self.deadline
    }
}

/// What happens when a timer fires.
pub enum TimerAction {
    /// Wake a sleeping task.
    Wake(Waker),

    /// Run a harness-side callback (context deadlines).
    Call(Box<dyn FnOnce()>),
}

/// A registered timer.
pub struct Timer {
    pub owner: TaskId,
    pub action: TimerAction,
}

/// Logical time source for one harness run.
pub struct VirtualClock {
    now: Duration,
    timers: BTreeMap<TimerKey, Timer>,
    next_seq: u64,
    fired: u64,
}

impl VirtualClock {
    /// Creates a clock at time zero with no timers.
    pub fn new() -> Self {
        Self {
            now: Duration::ZERO,
            timers: BTreeMap::new(),
            next_seq: 0,
            fired: 0,
        }
    }

    /// Current virtual time since run start.
    pub fn now(&self) -> Duration {
        self.now
    }

    /// Wall-clock-shaped view of the current virtual time.
    pub fn system_time(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(EPOCH_OFFSET_SECS) + self.now
    }

    /// Moves the clock forward to `target`.
    pub fn advance_to(&mut self, target: Duration) -> Result<(), HarnessError> {
        if target < self.now {
            return Err(HarnessError::BackwardTime {
                now: self.now,
                target,
            });
        }
        self.now = target;
        Ok(())
    }

    /// Registers a timer and returns its key.
    pub fn register(&mut self, deadline: Duration, owner: TaskId, action: TimerAction) -> TimerKey {
        let key = TimerKey {
            deadline,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.timers.insert(key, Timer { owner, action });
        key
    }

    /// Replaces the waker of a pending timer. Returns false if it already fired.
    pub fn update_waker(&mut self, key: TimerKey, waker: &Waker) -> bool {
        match self.timers.get_mut(&key) {
            Some(Timer {
                action: TimerAction::Wake(existing),
                ..
            }) => {
                if !existing.will_wake(waker) {
                    *existing = waker.clone();
                }
                true
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Removes a pending timer. Returns false if it already fired.
    pub fn cancel(&mut self, key: TimerKey) -> bool {
        self.timers.remove(&key).is_some()
    }

    /// Deadline of the earliest pending timer.
    pub fn next_deadline(&self) -> Option<Duration> {
        self.timers.keys().next().map(TimerKey::deadline)
    }

    /// Removes and returns every timer due at the current time, in firing order.
    pub fn take_due(&mut self) -> Vec<Timer> {
        let mut due = Vec::new();
        while let Some(entry) = self.timers.first_entry() {
            if entry.key().deadline > self.now {
                break;
            }
            due.push(entry.remove());
        }
        self.fired += due.len() as u64;
        due
    }

    /// Number of pending timers.
    pub fn pending(&self) -> usize {
        self.timers.len()
    }

    /// Total timers fired so far.
    pub fn fired(&self) -> u64 {
        self.fired
    }

    /// Drops every pending timer (run teardown).
    pub fn clear(&mut self) -> Vec<Timer> {
        std::mem::take(&mut self.timers).into_values().collect()
    }
}

impl Default for VirtualClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    fn noop() -> TimerAction {
        TimerAction::Call(Box::new(|| {}))
    }

    #[test]
    fn test_clock_starts_at_zero() {
        let clock = VirtualClock::new();
        assert_eq!(clock.now(), Duration::ZERO);
        assert_eq!(
            clock.system_time(),
            UNIX_EPOCH + Duration::from_secs(EPOCH_OFFSET_SECS)
        );
    }

    #[test]
    fn test_clock_rejects_backward_advance() {
        let mut clock = VirtualClock::new();
        clock.advance_to(Duration::from_secs(5)).unwrap();
        clock.advance_to(Duration::from_secs(5)).unwrap();

        let err = clock.advance_to(Duration::from_secs(4)).unwrap_err();
        assert_eq!(
            err,
            HarnessError::BackwardTime {
                now: Duration::from_secs(5),
                target: Duration::from_secs(4),
            }
        );
        assert_eq!(clock.now(), Duration::from_secs(5));
    }

    #[test]
    fn test_timers_fire_in_deadline_then_registration_order() {
        let mut clock = VirtualClock::new();
        let order = Rc::new(std::cell::RefCell::new(Vec::new()));

        for (label, secs) in [("b", 2), ("a", 1), ("c", 2)] {
            let order = order.clone();
            clock.register(
                Duration::from_secs(secs),
                TaskId::ROOT,
                TimerAction::Call(Box::new(move || order.borrow_mut().push(label))),
            );
        }

        assert_eq!(clock.next_deadline(), Some(Duration::from_secs(1)));
        clock.advance_to(Duration::from_secs(1)).unwrap();
        for timer in clock.take_due() {
            if let TimerAction::Call(f) = timer.action {
                f();
            }
        }
        assert_eq!(*order.borrow(), vec!["a"]);

        clock.advance_to(Duration::from_secs(2)).unwrap();
        for timer in clock.take_due() {
            if let TimerAction::Call(f) = timer.action {
                f();
            }
        }
        assert_eq!(*order.borrow(), vec!["a", "b", "c"]);
        assert_eq!(clock.fired(), 3);
        assert_eq!(clock.pending(), 0);
    }

    #[test]
    fn test_cancelled_timer_never_fires() {
        let mut clock = VirtualClock::new();
        let hit = Rc::new(Cell::new(false));
        let h = hit.clone();
        let key = clock.register(
            Duration::from_secs(1),
            TaskId(1),
            TimerAction::Call(Box::new(move || h.set(true))),
        );
        clock.register(Duration::from_secs(3), TaskId(1), noop());

        assert!(clock.cancel(key));
        assert!(!clock.cancel(key));
        assert_eq!(clock.next_deadline(), Some(Duration::from_secs(3)));

        clock.advance_to(Duration::from_secs(3)).unwrap();
        assert_eq!(clock.take_due().len(), 1);
        assert!(!hit.get());
    }
}
