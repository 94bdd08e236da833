//! The chain table: sharded wait queues keyed by [`SyncKey`].
//!
//! A [`ChainTable`] is a fixed power-of-two array of [`Chain`]s. A key's
//! precomputed hash picks its chain, so one logical object is always served
//! by exactly one chain and every queue operation on it is linearized by
//! that chain's [`SpinLock`].
//!
//! ## Queue nodes
//!
//! Each chain owns an arena of [`QueueNode`]s plus a free list. A node is
//! bound to a key while its FIFO is non-empty; the instant the last waiter
//! leaves, the node is unbound and pushed onto the free list for reuse, so
//! steady-state insert/remove does not allocate under the lock.
//!
//! ## Busy flag
//!
//! Some protocol steps must touch user memory, which may fault or sleep, in
//! the middle of a queue manipulation. The chain lock cannot be held across
//! that, so a second-level `busy` flag serializes such sequences.
//! [`Chain::busy`] spins for a bounded number of iterations and then sleeps
//! until [`Chain::unbusy`] hands the flag on.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::config::SyncConfig;
use crate::key::SyncKey;
use crate::pi::PiHandle;
use crate::platform::Scheduler;
use crate::sync::compat::{AtomicBool, Ordering, spin_loop};
use crate::sync::{SpinLock, SpinLockGuard};
use crate::waiter::{QueueKind, Waiter, WaiterFlags};

/// Index of a node in a chain's queue arena.
type NodeIdx = usize;

/// A FIFO of waiters sharing one key.
#[derive(Debug, Default)]
pub struct QueueNode {
    key: Option<SyncKey>,
    waiters: VecDeque<Arc<Waiter>>,
}

/// Lock-protected contents of a [`Chain`].
#[derive(Debug, Default)]
pub struct ChainInner {
    /// Key → node bindings, one table per [`QueueKind`].
    tables: [Vec<(SyncKey, NodeIdx)>; 2],
    nodes: Vec<QueueNode>,
    free: Vec<NodeIdx>,
    busy: bool,
    busy_waiters: VecDeque<Arc<Waiter>>,
    /// Live PI states whose key hashes to this chain.
    pi: Vec<(SyncKey, PiHandle)>,
}

impl ChainInner {
    fn node_for(&self, key: &SyncKey, kind: QueueKind) -> Option<NodeIdx> {
        self.tables[kind.index()]
            .iter()
            .find(|(k, _)| k == key)
            .map(|&(_, idx)| idx)
    }

    fn bind_node(&mut self, key: SyncKey, kind: QueueKind) -> NodeIdx {
        let idx = if let Some(idx) = self.free.pop() {
            idx
        } else {
            self.nodes.push(QueueNode::default());
            self.nodes.len() - 1
        };
        self.nodes[idx].key = Some(key);
        self.tables[kind.index()].push((key, idx));
        idx
    }

    fn unbind_node(&mut self, kind: QueueKind, idx: NodeIdx) {
        let table = &mut self.tables[kind.index()];
        if let Some(pos) = table.iter().position(|&(_, i)| i == idx) {
            table.swap_remove(pos);
        }
        debug_assert!(self.nodes[idx].waiters.is_empty());
        self.nodes[idx].key = None;
        self.free.push(idx);
    }

    /// Links `waiter` at the tail of `key`'s `kind` queue.
    pub fn insert(&mut self, key: SyncKey, kind: QueueKind, waiter: &Arc<Waiter>) {
        debug_assert!(!waiter.is_queued(), "waiter {} double-queued", waiter.tid());
        let idx = match self.node_for(&key, kind) {
            Some(idx) => idx,
            None => self.bind_node(key, kind),
        };
        self.nodes[idx].waiters.push_back(Arc::clone(waiter));
        waiter.insert_flags(kind.flag());
        log::trace!("usync: queued {} on {key}", waiter.tid());
    }

    /// Unlinks `waiter` from `key`'s queue if it is still there. Returns
    /// `true` if it was removed.
    pub fn remove(&mut self, key: &SyncKey, waiter: &Arc<Waiter>) -> bool {
        let flags = waiter.flags();
        let kind = if flags.contains(WaiterFlags::QUEUED_SHARED) {
            QueueKind::Shared
        } else if flags.contains(WaiterFlags::QUEUED_EXCLUSIVE) {
            QueueKind::Exclusive
        } else {
            return false;
        };
        let Some(idx) = self.node_for(key, kind) else {
            return false;
        };
        let node = &mut self.nodes[idx];
        let Some(pos) = node.waiters.iter().position(|w| Arc::ptr_eq(w, waiter)) else {
            return false;
        };
        node.waiters.remove(pos);
        waiter.remove_flags(WaiterFlags::QUEUED);
        if node.waiters.is_empty() {
            self.unbind_node(kind, idx);
        }
        true
    }

    /// Returns the number of waiters queued on `key`.
    pub fn count(&self, key: &SyncKey, kind: QueueKind) -> usize {
        self.node_for(key, kind)
            .map_or(0, |idx| self.nodes[idx].waiters.len())
    }

    /// Returns the waiters queued on `key`, oldest first.
    pub fn waiters(&self, key: &SyncKey, kind: QueueKind) -> impl Iterator<Item = &Arc<Waiter>> {
        self.node_for(key, kind)
            .into_iter()
            .flat_map(move |idx| self.nodes[idx].waiters.iter())
    }

    /// Dequeues and wakes up to `n` waiters of `key`, oldest first. Returns
    /// how many were woken.
    pub fn signal<S: Scheduler + ?Sized>(
        &mut self,
        key: &SyncKey,
        kind: QueueKind,
        n: usize,
        sched: &S,
    ) -> usize {
        let Some(idx) = self.node_for(key, kind) else {
            return 0;
        };
        let mut woken = 0;
        while woken < n {
            let Some(w) = self.nodes[idx].waiters.pop_front() else {
                break;
            };
            w.remove_flags(WaiterFlags::QUEUED);
            sched.unpark(w.tid());
            woken += 1;
        }
        if self.nodes[idx].waiters.is_empty() {
            self.unbind_node(kind, idx);
        }
        if woken > 0 {
            log::trace!("usync: woke {woken} on {key}");
        }
        woken
    }

    /// Dequeues and wakes one specific waiter.
    pub fn signal_waiter<S: Scheduler + ?Sized>(
        &mut self,
        key: &SyncKey,
        waiter: &Arc<Waiter>,
        sched: &S,
    ) -> bool {
        let removed = self.remove(key, waiter);
        if removed {
            sched.unpark(waiter.tid());
        }
        removed
    }

    /// Returns `true` if a busy sequence is in progress.
    pub fn is_busy(&self) -> bool {
        self.busy
    }

    /// Looks up the PI state registered for `key`.
    pub fn pi_lookup(&self, key: &SyncKey) -> Option<PiHandle> {
        self.pi.iter().find(|(k, _)| k == key).map(|&(_, h)| h)
    }

    /// Registers a PI state for `key`.
    pub fn pi_insert(&mut self, key: SyncKey, handle: PiHandle) {
        debug_assert!(self.pi_lookup(&key).is_none());
        self.pi.push((key, handle));
    }

    /// Unregisters the PI state of `key`.
    pub fn pi_remove(&mut self, key: &SyncKey) -> Option<PiHandle> {
        let pos = self.pi.iter().position(|(k, _)| k == key)?;
        Some(self.pi.swap_remove(pos).1)
    }

    /// Returns the number of bound queue nodes across both tables.
    pub fn bound_queues(&self) -> usize {
        self.tables[0].len() + self.tables[1].len()
    }

    /// Returns the number of recycled nodes on the free list.
    pub fn free_nodes(&self) -> usize {
        self.free.len()
    }

    /// Returns the number of PI states hashed to this chain.
    pub fn pi_states(&self) -> usize {
        self.pi.len()
    }
}

/// One shard of the chain table.
pub struct Chain {
    inner: SpinLock<ChainInner>,
    /// Mirror of `inner.busy` for the lock-free spin phase.
    busy_hint: AtomicBool,
    busy_spins: u32,
}

impl Chain {
    fn new(busy_spins: u32) -> Self {
        Self {
            inner: SpinLock::named("usync_chain", ChainInner::default()),
            busy_hint: AtomicBool::new(false),
            busy_spins,
        }
    }

    /// Locks the chain.
    pub fn lock(&self) -> SpinLockGuard<'_, ChainInner> {
        self.inner.lock()
    }

    /// Marks the chain busy, waiting for any current holder to finish.
    ///
    /// Takes and returns the chain guard: the lock is dropped while spinning
    /// or sleeping and re-acquired before returning. The sleep is not
    /// interruptible.
    pub fn busy<'a, S: Scheduler + ?Sized>(
        &'a self,
        mut guard: SpinLockGuard<'a, ChainInner>,
        waiter: &Arc<Waiter>,
        sched: &S,
    ) -> SpinLockGuard<'a, ChainInner> {
        while guard.busy {
            drop(guard);
            let mut spins = self.busy_spins;
            while spins > 0 && self.busy_hint.load(Ordering::Relaxed) {
                spin_loop();
                spins -= 1;
            }
            guard = self.inner.lock();
            if !guard.busy {
                break;
            }

            log::trace!("usync: {} sleeping on busy chain", waiter.tid());
            guard.busy_waiters.push_back(Arc::clone(waiter));
            waiter.insert_flags(WaiterFlags::BUSY_WAIT);
            drop(guard);
            loop {
                sched.park(waiter.tid(), None, false);
                guard = self.inner.lock();
                if !waiter.flags().contains(WaiterFlags::BUSY_WAIT) {
                    break;
                }
                drop(guard);
            }
        }
        guard.busy = true;
        self.busy_hint.store(true, Ordering::Relaxed);
        guard
    }

    /// Clears the busy flag and hands it to one sleeping contender.
    pub fn unbusy<S: Scheduler + ?Sized>(&self, inner: &mut ChainInner, sched: &S) {
        debug_assert!(inner.busy, "unbusy on a chain that is not busy");
        inner.busy = false;
        self.busy_hint.store(false, Ordering::Relaxed);
        if let Some(w) = inner.busy_waiters.pop_front() {
            w.remove_flags(WaiterFlags::BUSY_WAIT);
            sched.unpark(w.tid());
        }
    }

    /// Locks the chain and clears the busy flag.
    pub fn unbusy_unlocked<S: Scheduler + ?Sized>(&self, sched: &S) {
        let mut inner = self.lock();
        self.unbusy(&mut inner, sched);
    }
}

/// Fixed-size array of chains selected by key hash.
pub struct ChainTable {
    chains: Box<[Chain]>,
    mask: usize,
}

impl ChainTable {
    /// Allocates `config.chain_count()` empty chains.
    pub fn new(config: &SyncConfig) -> Self {
        let n = config.chain_count();
        let chains: Vec<Chain> = (0..n).map(|_| Chain::new(config.busy_spins)).collect();
        Self {
            chains: chains.into_boxed_slice(),
            mask: n - 1,
        }
    }

    /// Returns the chain that serves `key`.
    pub fn chain_for(&self, key: &SyncKey) -> &Chain {
        &self.chains[key.hash() as usize & self.mask]
    }

    /// Returns the number of chains.
    pub fn len(&self) -> usize {
        self.chains.len()
    }

    /// Always `false`; a table has at least one chain.
    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }

    /// Iterates over all chains.
    pub fn iter(&self) -> impl Iterator<Item = &Chain> {
        self.chains.iter()
    }
}
