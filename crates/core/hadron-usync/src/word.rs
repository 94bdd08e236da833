//! User-visible object layouts and CAS helpers.
//!
//! Every synchronization object is a small struct of `u32` words in user
//! memory. The constants here fix the offset of each word and the meaning
//! of its bits; the user-mode library uses the same layout for its fast
//! paths.
//!
//! ```text
//! mutex      owner@0  flags@4  ceiling@8
//! condvar    has_waiters@0  flags@4 (clock id in bits 8..16)
//! rwlock     state@0  flags@4  blocked_readers@8  blocked_writers@12
//! semaphore  count@0  flags@4
//! ```

use bitflags::bitflags;

use crate::error::{Fault, SyncError};
use crate::id::{SpaceId, ThreadId, UserAddr};
use crate::platform::{Scheduler, UserMemory};

// ---------------------------------------------------------------------------
// Mutex
// ---------------------------------------------------------------------------

/// Mutex word layout.
pub mod mutex {
    /// Offset of the owner word.
    pub const OWNER: u64 = 0;
    /// Offset of the flags word.
    pub const FLAGS: u64 = 4;
    /// Offset of the ceiling word (PP mutexes).
    pub const CEILING: u64 = 8;

    /// Owner word of an unowned mutex.
    pub const UNOWNED: u32 = 0;
    /// Set in the owner word when release must enter the kernel.
    pub const CONTESTED: u32 = 0x8000_0000;

    /// Returns the owner ID stored in an owner word.
    pub const fn owner_of(word: u32) -> u32 {
        word & !CONTESTED
    }
}

bitflags! {
    /// Mutex flags word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MutexFlags: u32 {
        /// Mapped into several address spaces.
        const SHARED = 0x0001;
        /// Report a self-relock as `Deadlock` instead of blocking.
        const ERROR_CHECK = 0x0002;
        /// Priority-inheritance protocol.
        const PRIO_INHERIT = 0x0004;
        /// Priority-ceiling protocol.
        const PRIO_PROTECT = 0x0008;
    }
}

// ---------------------------------------------------------------------------
// Condition variable
// ---------------------------------------------------------------------------

/// Condition-variable word layout.
pub mod cond {
    /// Offset of the has-waiters word.
    pub const HAS_WAITERS: u64 = 0;
    /// Offset of the flags word.
    pub const FLAGS: u64 = 4;

    /// Shift of the clock id within the flags word.
    pub const CLOCK_SHIFT: u32 = 8;
    /// Mask of the clock id after shifting.
    pub const CLOCK_MASK: u32 = 0xff;
}

bitflags! {
    /// Condition-variable flags word. Bits 8..16 carry the clock id.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CondFlags: u32 {
        /// Mapped into several address spaces.
        const SHARED = 0x0001;
        const _ = !0;
    }
}

impl CondFlags {
    /// Returns the raw clock id carried in bits 8..16.
    pub const fn clock_raw(self) -> u32 {
        (self.bits() >> cond::CLOCK_SHIFT) & cond::CLOCK_MASK
    }
}

// ---------------------------------------------------------------------------
// Reader-writer lock
// ---------------------------------------------------------------------------

/// Reader-writer lock word layout.
pub mod rwlock {
    /// Offset of the state word.
    pub const STATE: u64 = 0;
    /// Offset of the flags word.
    pub const FLAGS: u64 = 4;
    /// Offset of the blocked-readers counter.
    pub const BLOCKED_READERS: u64 = 8;
    /// Offset of the blocked-writers counter.
    pub const BLOCKED_WRITERS: u64 = 12;

    /// Largest reader count the state word can hold.
    pub const MAX_READERS: u32 = 0x1fff_ffff;

    /// Returns the reader count held in a state word.
    pub const fn readers(state: u32) -> u32 {
        state & MAX_READERS
    }
}

bitflags! {
    /// Reader-writer lock state bits above the reader count.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RwState: u32 {
        /// A writer holds the lock.
        const WRITE_OWNER = 0x8000_0000;
        /// Writers are queued in the kernel.
        const WRITE_WAITERS = 0x4000_0000;
        /// Readers are queued in the kernel.
        const READ_WAITERS = 0x2000_0000;
        const _ = rwlock::MAX_READERS;
    }
}

bitflags! {
    /// Reader-writer lock flags word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RwFlags: u32 {
        /// Mapped into several address spaces.
        const SHARED = 0x0001;
        /// Let new readers in while writers wait, and wake readers first.
        const PREFER_READER = 0x0002;
    }
}

// ---------------------------------------------------------------------------
// Semaphore
// ---------------------------------------------------------------------------

/// Semaphore word layout.
pub mod sem {
    /// Offset of the count word.
    pub const COUNT: u64 = 0;
    /// Offset of the flags word.
    pub const FLAGS: u64 = 4;

    /// Set in the count word while threads sleep in the kernel.
    pub const HAS_WAITERS: u32 = 0x8000_0000;
    /// Largest count the word can hold.
    pub const MAX_COUNT: u32 = 0x7fff_ffff;

    /// Returns the count held in a count word.
    pub const fn count(word: u32) -> u32 {
        word & MAX_COUNT
    }
}

bitflags! {
    /// Semaphore flags word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SemFlags: u32 {
        /// Mapped into several address spaces.
        const SHARED = 0x0001;
    }
}

/// Returns the value `tid` writes into a mutex owner word.
///
/// Zero means unowned and the top bit is the contested flag, so neither may
/// appear in a thread ID.
pub fn owner_id(tid: ThreadId) -> Result<u32, SyncError> {
    let id = tid.as_u32();
    if id == mutex::UNOWNED || id & mutex::CONTESTED != 0 {
        return Err(SyncError::InvalidArgument);
    }
    Ok(id)
}

// ---------------------------------------------------------------------------
// Access helpers
// ---------------------------------------------------------------------------

/// One `u32` word in a user address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserWord {
    space: SpaceId,
    addr: UserAddr,
}

impl UserWord {
    /// Names the word at `addr` in `space`.
    pub const fn new(space: SpaceId, addr: UserAddr) -> Self {
        Self { space, addr }
    }

    /// Returns the word `offset` bytes past this one.
    #[must_use]
    pub const fn field(self, offset: u64) -> Self {
        Self {
            space: self.space,
            addr: self.addr.offset(offset),
        }
    }

    /// Returns the word's address.
    pub const fn addr(self) -> UserAddr {
        self.addr
    }

    /// Reads the word.
    pub fn read<M: UserMemory + ?Sized>(self, mem: &M) -> Result<u32, Fault> {
        mem.read_u32(self.space, self.addr)
    }

    /// Compares and swaps the word, returning the value observed.
    pub fn cas<M: UserMemory + ?Sized>(self, mem: &M, expected: u32, new: u32) -> Result<u32, Fault> {
        mem.cas_u32(self.space, self.addr, expected, new)
    }

    /// Applies `f` to the word until a CAS succeeds or `f` declines.
    ///
    /// Returns `Ok(old)` with the value that was replaced, or `Err(current)`
    /// with the value `f` declined to change.
    pub fn update<P, F>(
        self,
        p: &P,
        backoff: &mut Backoff,
        mut f: F,
    ) -> Result<Result<u32, u32>, Fault>
    where
        P: UserMemory + Scheduler + ?Sized,
        F: FnMut(u32) -> Option<u32>,
    {
        let mut cur = self.read(p)?;
        loop {
            let Some(new) = f(cur) else {
                return Ok(Err(cur));
            };
            let old = self.cas(p, cur, new)?;
            if old == cur {
                return Ok(Ok(old));
            }
            cur = old;
            backoff.fail(p);
        }
    }

    /// Replaces the word with `f(word)` in a CAS loop. Returns the previous
    /// value.
    pub fn modify<P, F>(self, p: &P, backoff: &mut Backoff, mut f: F) -> Result<u32, Fault>
    where
        P: UserMemory + Scheduler + ?Sized,
        F: FnMut(u32) -> u32,
    {
        self.update(p, backoff, |v| Some(f(v)))
            .map(|r| r.unwrap_or_else(|v| v))
    }

    /// Clears `bits` if any of them is set. A word that already has them
    /// clear is left alone.
    pub fn clear_bits<P>(self, p: &P, backoff: &mut Backoff, bits: u32) -> Result<(), Fault>
    where
        P: UserMemory + Scheduler + ?Sized,
    {
        self.update(p, backoff, |v| (v & bits != 0).then_some(v & !bits))
            .map(|_| ())
    }

    /// Stores `value` with a CAS loop. Returns the previous value.
    pub fn store<P>(self, p: &P, backoff: &mut Backoff, value: u32) -> Result<u32, Fault>
    where
        P: UserMemory + Scheduler + ?Sized,
    {
        self.modify(p, backoff, |_| value)
    }
}

/// Bounded retry budget for CAS loops against user memory.
///
/// Each failed CAS spends one retry; once the budget is gone the loop
/// yields the CPU and the budget refills. A thread hammering a contended
/// word therefore always lets the other side run.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    budget: u32,
    left: u32,
    yields: u32,
}

impl Backoff {
    /// Creates a budget of `retries` failures between yields.
    pub const fn new(retries: u32) -> Self {
        let budget = if retries == 0 { 1 } else { retries };
        Self {
            budget,
            left: budget,
            yields: 0,
        }
    }

    /// Records one failed attempt.
    pub fn fail<S: Scheduler + ?Sized>(&mut self, sched: &S) {
        self.left -= 1;
        if self.left == 0 {
            self.left = self.budget;
            self.yields += 1;
            sched.yield_now();
        }
    }

    /// Returns how many times the loop has yielded.
    pub const fn yields(&self) -> u32 {
        self.yields
    }
}
