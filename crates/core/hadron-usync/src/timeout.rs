//! Deadlines and the abs-timeout helper.
//!
//! Callers hand in a [`Timeout`] that is either relative or absolute against
//! a chosen [`ClockId`]. Blocking paths convert it once into an
//! [`AbsTimeout`] and ask it for the remaining duration after every wakeup,
//! so an early return from the scheduler never shortens the wait.

use core::time::Duration;

use crate::error::SyncError;
use crate::platform::Clock;

/// Clock a deadline is measured against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClockId {
    /// Wall-clock time; may jump.
    Realtime,
    /// Monotonic time since boot.
    Monotonic,
    /// Monotonic time that keeps counting across suspend.
    Boottime,
}

impl ClockId {
    /// Decodes a clock ID from its raw user-visible value.
    pub const fn from_raw(raw: u32) -> Result<Self, SyncError> {
        match raw {
            0 => Ok(Self::Realtime),
            1 => Ok(Self::Monotonic),
            7 => Ok(Self::Boottime),
            _ => Err(SyncError::InvalidArgument),
        }
    }

    /// Returns the raw user-visible value.
    pub const fn as_raw(self) -> u32 {
        match self {
            Self::Realtime => 0,
            Self::Monotonic => 1,
            Self::Boottime => 7,
        }
    }
}

/// A caller-supplied deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeout {
    /// Clock the deadline is measured on.
    pub clock: ClockId,
    /// `true` if `value` is an absolute time on `clock`.
    pub absolute: bool,
    /// Relative duration or absolute time.
    pub value: Duration,
}

impl Timeout {
    /// A deadline `value` from now on the monotonic clock.
    pub const fn relative(value: Duration) -> Self {
        Self {
            clock: ClockId::Monotonic,
            absolute: false,
            value,
        }
    }

    /// An absolute deadline on `clock`.
    pub const fn absolute(clock: ClockId, value: Duration) -> Self {
        Self {
            clock,
            absolute: true,
            value,
        }
    }
}

/// A deadline resolved against a clock.
#[derive(Debug, Clone, Copy)]
pub struct AbsTimeout {
    clock: ClockId,
    end: Duration,
    cur: Duration,
}

impl AbsTimeout {
    /// Samples `clock` and fixes the end time for `timeout`.
    pub fn new<C: Clock + ?Sized>(clock: &C, timeout: &Timeout) -> Self {
        let cur = clock.now(timeout.clock);
        let end = if timeout.absolute {
            timeout.value
        } else {
            cur.saturating_add(timeout.value)
        };
        Self {
            clock: timeout.clock,
            end,
            cur,
        }
    }

    /// Re-samples the clock.
    pub fn update<C: Clock + ?Sized>(&mut self, clock: &C) {
        self.cur = clock.now(self.clock);
    }

    /// Returns the time left as of the last sample, or `None` once expired.
    pub fn remaining(&self) -> Option<Duration> {
        match self.end.checked_sub(self.cur) {
            Some(left) if !left.is_zero() => Some(left),
            _ => None,
        }
    }
}
