//! One-shot timers driven by an injected timer service
//!
//! The engine owns many independent one-shot timers (five per routing
//! entry, one per outstanding route request, two for sequence number
//! loss). It never blocks on them: the driver calls
//! [`Engine::handle_timer_fired`](crate::engine::Engine::handle_timer_fired)
//! whenever a scheduled wake-up is due, and the engine then asks which
//! of its timers have expired.

use crate::time::Timestamp;
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

/// Handle of a scheduled wake-up
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(u64);

/// Clock and wake-up scheduler consumed by the engine
///
/// A timer is *running* while its deadline lies in the future and
/// *expired* once the deadline has been reached, until it is cancelled.
pub trait TimerService {
    /// Current time
    fn now(&self) -> Timestamp;

    /// Schedule a wake-up `after` from now
    fn schedule(&mut self, after: Duration) -> TimerId;

    /// Remove a pending wake-up without firing it
    fn cancel(&mut self, id: TimerId);

    /// Scheduled and deadline still in the future
    fn is_running(&self, id: TimerId) -> bool;

    /// Scheduled and deadline reached
    fn is_expired(&self, id: TimerId) -> bool;
}

/// A re-armable one-shot timer owned by protocol state
#[derive(Debug, Clone, Default)]
pub struct Timer {
    id: Option<TimerId>,
    interval: Duration,
}

impl Timer {
    /// Create an idle timer
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the timer, replacing any pending wake-up
    pub fn start<T: TimerService>(&mut self, timers: &mut T, interval: Duration) {
        self.cancel(timers);
        self.id = Some(timers.schedule(interval));
        self.interval = interval;
    }

    /// Disarm the timer
    pub fn cancel<T: TimerService>(&mut self, timers: &mut T) {
        if let Some(id) = self.id.take() {
            timers.cancel(id);
        }
    }

    /// Whether the timer is armed and has not yet expired
    pub fn is_running<T: TimerService>(&self, timers: &T) -> bool {
        self.id.is_some_and(|id| timers.is_running(id))
    }

    /// Whether the timer is armed and its deadline has passed
    pub fn is_expired<T: TimerService>(&self, timers: &T) -> bool {
        self.id.is_some_and(|id| timers.is_expired(id))
    }

    /// Interval the timer was last started with
    pub fn interval(&self) -> Duration {
        self.interval
    }
}

/// Deterministic timer service advanced explicitly by the driver
///
/// Every scheduled wake-up is reported by [`pop_due`](Self::pop_due)
/// exactly once, which mirrors a scheduler delivering one event per
/// timer.
#[derive(Debug, Default)]
pub struct ManualTimers {
    now: Timestamp,
    next_id: u64,
    deadlines: BTreeMap<TimerId, Timestamp>,
    announced: HashSet<TimerId>,
}

impl ManualTimers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a timer service starting at `now`
    pub fn at(now: Timestamp) -> Self {
        Self {
            now,
            ..Self::default()
        }
    }

    /// Move the clock; time never goes backwards
    pub fn set_now(&mut self, now: Timestamp) {
        if now > self.now {
            self.now = now;
        }
    }

    /// Advance the clock by `by`
    pub fn advance(&mut self, by: Duration) {
        self.now += by;
    }

    /// Earliest deadline that has not been announced yet
    pub fn next_deadline(&self) -> Option<Timestamp> {
        self.deadlines
            .iter()
            .filter(|(id, _)| !self.announced.contains(id))
            .map(|(_, at)| *at)
            .min()
    }

    /// Take one due wake-up that has not been announced yet
    pub fn pop_due(&mut self) -> Option<TimerId> {
        let now = self.now;
        let due = self
            .deadlines
            .iter()
            .filter(|(id, at)| **at <= now && !self.announced.contains(id))
            .min_by_key(|(id, at)| (**at, **id))
            .map(|(id, _)| *id)?;
        self.announced.insert(due);
        Some(due)
    }

    /// Number of armed timers whose deadline has been reached
    pub fn expired_count(&self) -> usize {
        self.deadlines.values().filter(|at| **at <= self.now).count()
    }

    /// Number of armed timers
    pub fn pending(&self) -> usize {
        self.deadlines.len()
    }
}

impl TimerService for ManualTimers {
    fn now(&self) -> Timestamp {
        self.now
    }

    fn schedule(&mut self, after: Duration) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        self.deadlines.insert(id, self.now + after);
        id
    }

    fn cancel(&mut self, id: TimerId) {
        self.deadlines.remove(&id);
        self.announced.remove(&id);
    }

    fn is_running(&self, id: TimerId) -> bool {
        self.deadlines.get(&id).is_some_and(|at| *at > self.now)
    }

    fn is_expired(&self, id: TimerId) -> bool {
        self.deadlines.get(&id).is_some_and(|at| *at <= self.now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_lifecycle() {
        let mut timers = ManualTimers::new();
        let mut timer = Timer::new();
        assert!(!timer.is_running(&timers));
        assert!(!timer.is_expired(&timers));

        timer.start(&mut timers, Duration::from_secs(5));
        assert!(timer.is_running(&timers));

        timers.advance(Duration::from_secs(5));
        assert!(!timer.is_running(&timers));
        assert!(timer.is_expired(&timers));

        timer.cancel(&mut timers);
        assert!(!timer.is_expired(&timers));
        assert_eq!(timers.pending(), 0);
    }

    #[test]
    fn test_restart_rearms() {
        let mut timers = ManualTimers::new();
        let mut timer = Timer::new();
        timer.start(&mut timers, Duration::from_secs(1));
        timers.advance(Duration::from_millis(900));
        timer.start(&mut timers, Duration::from_secs(1));
        timers.advance(Duration::from_millis(200));

        // Old deadline replaced, so still running
        assert!(timer.is_running(&timers));
        assert_eq!(timers.pending(), 1);
        assert_eq!(timer.interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_pop_due_announces_once() {
        let mut timers = ManualTimers::new();
        let a = timers.schedule(Duration::from_secs(2));
        let b = timers.schedule(Duration::from_secs(1));
        assert_eq!(timers.next_deadline(), Some(Timestamp::from_secs(1)));

        timers.set_now(Timestamp::from_secs(3));
        assert_eq!(timers.pop_due(), Some(b));
        assert_eq!(timers.pop_due(), Some(a));
        assert_eq!(timers.pop_due(), None);
        assert_eq!(timers.next_deadline(), None);

        // Still expired until cancelled
        assert!(timers.is_expired(a));
    }
}
