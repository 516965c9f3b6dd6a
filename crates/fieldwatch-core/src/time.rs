//! Wall-clock abstraction
//!
//! Everything that needs "now" (live/historical decisions, retention sweeps,
//! bootstrap windows) takes a [`Clock`] so tests can pin time explicitly.

use core::cell::Cell;

use crate::storage::Timestamp;

pub const SECONDS_PER_MINUTE: u64 = 60;
pub const SECONDS_PER_HOUR: u64 = 60 * SECONDS_PER_MINUTE;
pub const SECONDS_PER_DAY: u64 = 24 * SECONDS_PER_HOUR;
pub const SECONDS_PER_WEEK: u64 = 7 * SECONDS_PER_DAY;

/// Source of the current wall-clock time in Unix epoch seconds
pub trait Clock {
    fn now(&self) -> Timestamp;
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now(&self) -> Timestamp {
        (**self).now()
    }
}

/// A clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Cell<Timestamp>,
}

impl ManualClock {
    pub const fn new(now: Timestamp) -> Self {
        Self { now: Cell::new(now) }
    }

    pub fn set(&self, now: Timestamp) {
        self.now.set(now);
    }

    pub fn advance(&self, secs: u64) {
        self.now.set(self.now.get().saturating_add(secs));
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        self.now.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new(1_000);
        clock.advance(SECONDS_PER_MINUTE);
        assert_eq!(clock.now(), 1_060);

        fn read<C: Clock>(clock: C) -> Timestamp {
            clock.now()
        }
        assert_eq!(read(&clock), 1_060, "references forward to the inner clock");
    }
}
