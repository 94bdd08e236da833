//! Per-thread waiter records.
//!
//! Every thread that ever blocks in the manager gets one [`Waiter`], created
//! on first use and reused for the thread's lifetime. Wait queues hold
//! `Arc<Waiter>` clones, so linking a record into a queue never allocates.
//! The membership flags are only written while holding the lock of the
//! chain whose queue the record sits in.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use bitflags::bitflags;

use crate::id::ThreadId;
use crate::sync::SpinLock;
use crate::sync::compat::{AtomicU32, Ordering};

bitflags! {
    /// Queue membership of a waiter.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WaiterFlags: u32 {
        /// Linked into a chain's shared queue.
        const QUEUED_SHARED = 1 << 0;
        /// Linked into a chain's exclusive queue.
        const QUEUED_EXCLUSIVE = 1 << 1;
        /// Waiting for a chain's busy flag to clear.
        const BUSY_WAIT = 1 << 2;
    }
}

impl WaiterFlags {
    /// Either queue bit.
    pub const QUEUED: Self = Self::QUEUED_SHARED.union(Self::QUEUED_EXCLUSIVE);
}

/// Which of a chain's two queue tables a waiter sits in.
///
/// Plain objects use [`Shared`](QueueKind::Shared). The rwlock parks readers
/// there and writers in [`Exclusive`](QueueKind::Exclusive), so waking all
/// readers never disturbs writers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    /// Shared-semantics queue.
    Shared = 0,
    /// Exclusive-semantics queue.
    Exclusive = 1,
}

impl QueueKind {
    /// Index into a chain's queue tables.
    pub const fn index(self) -> usize {
        self as usize
    }

    pub(crate) const fn flag(self) -> WaiterFlags {
        match self {
            Self::Shared => WaiterFlags::QUEUED_SHARED,
            Self::Exclusive => WaiterFlags::QUEUED_EXCLUSIVE,
        }
    }
}

/// One thread's waiter record.
#[derive(Debug)]
pub struct Waiter {
    tid: ThreadId,
    flags: AtomicU32,
}

impl Waiter {
    /// Creates an unlinked record for `tid`.
    pub fn new(tid: ThreadId) -> Self {
        Self {
            tid,
            flags: AtomicU32::new(0),
        }
    }

    /// Returns the owning thread.
    pub fn tid(&self) -> ThreadId {
        self.tid
    }

    /// Returns the current membership flags.
    pub fn flags(&self) -> WaiterFlags {
        WaiterFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    /// Returns `true` if the record is linked into a wait queue.
    pub fn is_queued(&self) -> bool {
        self.flags().intersects(WaiterFlags::QUEUED)
    }

    /// Sets `flags`. Caller holds the relevant chain lock.
    pub(crate) fn insert_flags(&self, flags: WaiterFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    /// Clears `flags`. Caller holds the relevant chain lock.
    pub(crate) fn remove_flags(&self, flags: WaiterFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }
}

/// Owner of every live thread's [`Waiter`].
pub struct ThreadTable {
    waiters: SpinLock<BTreeMap<ThreadId, Arc<Waiter>>>,
}

impl ThreadTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self {
            waiters: SpinLock::named("usync_threads", BTreeMap::new()),
        }
    }

    /// Returns `tid`'s record, creating it on first use.
    pub fn waiter(&self, tid: ThreadId) -> Arc<Waiter> {
        if let Some(w) = self.waiters.lock().get(&tid) {
            return Arc::clone(w);
        }
        // Allocate outside the lock.
        let fresh = Arc::new(Waiter::new(tid));
        let mut waiters = self.waiters.lock();
        Arc::clone(waiters.entry(tid).or_insert(fresh))
    }

    /// Drops `tid`'s record. The record must not be queued.
    pub fn remove(&self, tid: ThreadId) -> Option<Arc<Waiter>> {
        let removed = self.waiters.lock().remove(&tid);
        if let Some(w) = &removed {
            debug_assert!(!w.is_queued(), "thread {tid} exiting while queued");
        }
        removed
    }

    /// Returns the number of threads with a record.
    pub fn len(&self) -> usize {
        self.waiters.lock().len()
    }

    /// Returns `true` if no thread has a record.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ThreadTable {
    fn default() -> Self {
        Self::new()
    }
}
