//! Collaborator interfaces the synchronization manager consumes.
//!
//! The manager never touches user memory, thread state or clocks directly.
//! The embedding kernel implements these traits; tests implement them with
//! an in-memory mock.

use core::time::Duration;

use crate::error::Fault;
use crate::id::{ObjectId, Priority, SpaceId, ThreadId, UserAddr};
use crate::timeout::ClockId;

/// Atomic access to `u32` words in a user address space.
pub trait UserMemory {
    /// Reads the word at `addr`.
    fn read_u32(&self, space: SpaceId, addr: UserAddr) -> Result<u32, Fault>;

    /// Compares the word at `addr` with `expected` and, if equal, replaces it
    /// with `new`. Returns the value observed before the operation.
    fn cas_u32(&self, space: SpaceId, addr: UserAddr, expected: u32, new: u32)
    -> Result<u32, Fault>;
}

/// Why a [`Scheduler::park`] call returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParkOutcome {
    /// Another thread called [`Scheduler::unpark`], or the wakeup was spurious.
    Unparked,
    /// The timeout elapsed.
    TimedOut,
    /// A signal is pending for the thread.
    Interrupted,
}

/// Thread suspension and priority lending.
///
/// `park`/`unpark` follow permit semantics: an `unpark` delivered before the
/// matching `park` makes that `park` return immediately. Spurious returns
/// are allowed; every caller re-checks its condition under the chain lock.
pub trait Scheduler {
    /// Returns the thread's base (unboosted) priority.
    fn base_priority(&self, tid: ThreadId) -> Priority;

    /// Lends `lent` to the thread, or withdraws any loan when `None`.
    ///
    /// The thread runs at `max(base, lent)`. Called with the PI table lock
    /// held, which serializes all loans; implementations must not block.
    fn lend_priority(&self, tid: ThreadId, lent: Option<Priority>);

    /// Returns `true` if `tid` names a live thread visible to `space`
    /// (or to any space when `space` is `None`).
    fn thread_alive(&self, tid: ThreadId, space: Option<SpaceId>) -> bool;

    /// Suspends the calling thread `tid` until unparked or the timeout
    /// elapses. When `interruptible`, a pending signal also ends the sleep
    /// with [`ParkOutcome::Interrupted`].
    fn park(&self, tid: ThreadId, timeout: Option<Duration>, interruptible: bool) -> ParkOutcome;

    /// Makes `tid` runnable, or banks a permit if it is not parked.
    fn unpark(&self, tid: ThreadId);

    /// Gives up the CPU for a moment. Used as the progress point of CAS
    /// retry loops and busy spins.
    fn yield_now(&self);
}

/// Where a user address is backed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SharedMapping {
    /// The backing memory object.
    pub object: ObjectId,
    /// Byte offset of the address within `object`.
    pub offset: u64,
    /// Whether the mapping is shared with other address spaces.
    pub shared: bool,
}

/// Address-space and shared-object identity.
pub trait SharedRegistry {
    /// Looks up the memory object backing `addr` in `space`.
    fn lookup_shared(&self, space: SpaceId, addr: UserAddr) -> Result<SharedMapping, Fault>;

    /// Takes a reference on `object`.
    fn ref_object(&self, object: ObjectId);

    /// Drops a reference taken with [`ref_object`](Self::ref_object).
    fn unref_object(&self, object: ObjectId);
}

/// Time sources used to evaluate deadlines.
pub trait Clock {
    /// Returns the current time of `clock` as a duration since its epoch.
    fn now(&self, clock: ClockId) -> Duration;
}

/// Everything the manager needs from the kernel, in one bound.
pub trait Platform: UserMemory + Scheduler + SharedRegistry + Clock + Sync {}

impl<T> Platform for T where T: UserMemory + Scheduler + SharedRegistry + Clock + Sync {}
