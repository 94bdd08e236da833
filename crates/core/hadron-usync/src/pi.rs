//! Priority-inheritance bookkeeping.
//!
//! A [`PiState`] exists for every contended PI mutex. It records the kernel's
//! view of the owner and the threads blocked on the mutex, ordered by
//! effective priority (ties in arrival order). Threads and PI states point at
//! each other (owner ↔ held list, waiter ↔ blocked-on), so states live in a
//! generational arena and are referred to by [`PiHandle`]; a stale handle
//! simply fails to resolve.
//!
//! All of it sits behind one table-wide lock, taken after the chain lock.
//! Priority loans flow through [`Scheduler::lend_priority`] only from here,
//! so the lent value cached per thread always matches what the scheduler
//! was last told.
//!
//! ## Propagation
//!
//! [`PiTable::propagate`] walks `blocked_on → owner → blocked_on → …` from a
//! newly blocked thread, raising each owner that runs below the waiter.
//! [`PiTable::repropagate`] recomputes an owner's loan from scratch after a
//! waiter leaves, which may lower it. Both refuse to walk a cyclic owner
//! graph, detected with Floyd's two-pointer check.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::error::SyncError;
use crate::id::{Priority, ThreadId};
use crate::key::SyncKey;
use crate::platform::Scheduler;
use crate::waiter::Waiter;

/// Generational handle to a [`PiState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PiHandle {
    index: usize,
    generation: u32,
}

/// A thread blocked on a PI mutex.
#[derive(Debug, Clone)]
struct PiBlocked {
    waiter: Arc<Waiter>,
    /// Effective priority when last sorted.
    pri: Priority,
    /// Arrival order, for FIFO among equal priorities.
    seq: u64,
}

/// Kernel-side state of one contended PI mutex.
#[derive(Debug)]
pub struct PiState {
    key: SyncKey,
    owner: Option<ThreadId>,
    refcount: u32,
    blocked: Vec<PiBlocked>,
}

impl PiState {
    /// Returns the mutex key.
    pub fn key(&self) -> SyncKey {
        self.key
    }

    /// Returns the owner the kernel knows about.
    pub fn owner(&self) -> Option<ThreadId> {
        self.owner
    }

    /// Returns the number of in-flight calls holding a reference.
    pub fn refcount(&self) -> u32 {
        self.refcount
    }

    /// Returns the blocked threads with their sort priority, head first.
    pub fn blocked(&self) -> impl Iterator<Item = (ThreadId, Priority)> + '_ {
        self.blocked.iter().map(|b| (b.waiter.tid(), b.pri))
    }

    /// Returns the priority of the head waiter, if any.
    pub fn top_priority(&self) -> Option<Priority> {
        self.blocked.first().map(|b| b.pri)
    }

    fn insert_sorted(&mut self, entry: PiBlocked) {
        let pos = self
            .blocked
            .iter()
            .position(|b| b.pri < entry.pri || (b.pri == entry.pri && b.seq > entry.seq))
            .unwrap_or(self.blocked.len());
        self.blocked.insert(pos, entry);
    }

    fn take_blocked(&mut self, tid: ThreadId) -> Option<PiBlocked> {
        let pos = self.blocked.iter().position(|b| b.waiter.tid() == tid)?;
        Some(self.blocked.remove(pos))
    }
}

/// PI and PP bookkeeping of one thread.
#[derive(Debug, Default)]
struct PiThread {
    /// Contested PI mutexes this thread owns.
    held: Vec<PiHandle>,
    /// PI mutex this thread sleeps on.
    blocked_on: Option<PiHandle>,
    /// Ceilings of the PP mutexes this thread owns or is acquiring.
    ceilings: Vec<(SyncKey, Priority)>,
    /// Loan last handed to the scheduler.
    lent: Option<Priority>,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    state: Option<PiState>,
}

/// Arena of PI states plus per-thread PI/PP bookkeeping.
#[derive(Debug, Default)]
pub struct PiTable {
    slots: Vec<Slot>,
    free: Vec<usize>,
    threads: BTreeMap<ThreadId, PiThread>,
    next_seq: u64,
}

impl PiTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    // -----------------------------------------------------------------------
    // Arena
    // -----------------------------------------------------------------------

    /// Allocates an unowned state for `key` with a zero refcount.
    pub fn alloc(&mut self, key: SyncKey) -> PiHandle {
        let state = PiState {
            key,
            owner: None,
            refcount: 0,
            blocked: Vec::new(),
        };
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index];
            slot.state = Some(state);
            PiHandle {
                index,
                generation: slot.generation,
            }
        } else {
            let index = self.slots.len();
            self.slots.push(Slot {
                generation: 0,
                state: Some(state),
            });
            PiHandle {
                index,
                generation: 0,
            }
        }
    }

    /// Resolves a handle.
    pub fn get(&self, h: PiHandle) -> Option<&PiState> {
        let slot = self.slots.get(h.index)?;
        if slot.generation == h.generation {
            slot.state.as_ref()
        } else {
            None
        }
    }

    fn get_mut(&mut self, h: PiHandle) -> Option<&mut PiState> {
        let slot = self.slots.get_mut(h.index)?;
        if slot.generation == h.generation {
            slot.state.as_mut()
        } else {
            None
        }
    }

    fn free_slot(&mut self, h: PiHandle) {
        let slot = &mut self.slots[h.index];
        slot.state = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(h.index);
    }

    /// Returns the number of live PI states.
    pub fn live(&self) -> usize {
        self.slots.iter().filter(|s| s.state.is_some()).count()
    }

    /// Takes a reference on `h`.
    pub fn acquire_ref(&mut self, h: PiHandle) {
        if let Some(state) = self.get_mut(h) {
            state.refcount += 1;
        }
    }

    /// Drops a reference on `h`. On the last reference the state is
    /// disowned and destroyed; returns `true` so the caller can unregister
    /// it from its chain.
    pub fn release_ref(&mut self, h: PiHandle) -> bool {
        let Some(state) = self.get_mut(h) else {
            return false;
        };
        debug_assert!(state.refcount > 0, "PI refcount underflow");
        state.refcount -= 1;
        if state.refcount > 0 {
            return false;
        }
        debug_assert!(state.blocked.is_empty(), "PI state freed with blocked waiters");
        if let Some(owner) = state.owner.take() {
            if let Some(t) = self.threads.get_mut(&owner) {
                t.held.retain(|&x| x != h);
            }
        }
        self.free_slot(h);
        true
    }

    // -----------------------------------------------------------------------
    // Priorities
    // -----------------------------------------------------------------------

    fn thread(&mut self, tid: ThreadId) -> &mut PiThread {
        self.threads.entry(tid).or_default()
    }

    fn blocked_on(&self, tid: ThreadId) -> Option<PiHandle> {
        self.threads.get(&tid).and_then(|t| t.blocked_on)
    }

    /// Returns the loan currently recorded for `tid`.
    pub fn lent(&self, tid: ThreadId) -> Option<Priority> {
        self.threads.get(&tid).and_then(|t| t.lent)
    }

    /// Returns the PI states `tid` owns in contested mode.
    pub fn held(&self, tid: ThreadId) -> &[PiHandle] {
        self.threads.get(&tid).map_or(&[], |t| t.held.as_slice())
    }

    /// Returns `tid`'s effective priority: base, raised by any loan.
    pub fn effective<S: Scheduler + ?Sized>(&self, tid: ThreadId, sched: &S) -> Priority {
        let base = sched.base_priority(tid);
        match self.lent(tid) {
            Some(lent) if lent > base => lent,
            _ => base,
        }
    }

    fn lend<S: Scheduler + ?Sized>(&mut self, tid: ThreadId, lent: Option<Priority>, sched: &S) {
        let t = self.thread(tid);
        if t.lent != lent {
            t.lent = lent;
            sched.lend_priority(tid, lent);
        }
    }

    /// Recomputes `tid`'s loan from what it still holds: the head waiter of
    /// every contested PI mutex and the ceiling of every PP mutex.
    pub fn recompute_lent<S: Scheduler + ?Sized>(&mut self, tid: ThreadId, sched: &S) {
        let mut best: Option<Priority> = None;
        if let Some(t) = self.threads.get(&tid) {
            for &h in &t.held {
                if let Some(top) = self.get(h).and_then(PiState::top_priority) {
                    best = best.max(Some(top));
                }
            }
            for &(_, ceiling) in &t.ceilings {
                best = best.max(Some(ceiling));
            }
        }
        self.lend(tid, best, sched);
    }

    // -----------------------------------------------------------------------
    // Ownership
    // -----------------------------------------------------------------------

    /// Records `tid` as owner of `h` without checks. Used when a sleeper
    /// learns the owner from the lock word.
    pub fn set_owner(&mut self, h: PiHandle, tid: ThreadId) {
        let Some(state) = self.get_mut(h) else {
            return;
        };
        debug_assert!(state.owner.is_none());
        state.owner = Some(tid);
        self.thread(tid).held.push(h);
    }

    /// Claims `h` for `tid` after it legitimately took the lock word.
    ///
    /// Immediately lends the head waiter's priority, so the new owner never
    /// runs below anyone already waiting on it.
    pub fn claim<S: Scheduler + ?Sized>(
        &mut self,
        h: PiHandle,
        tid: ThreadId,
        sched: &S,
    ) -> Result<(), SyncError> {
        let Some(state) = self.get(h) else {
            return Err(SyncError::ProtocolViolation);
        };
        let key = state.key;
        match state.owner {
            Some(owner) if owner == tid => return Ok(()),
            Some(owner) => {
                log::warn!("usync: {tid} claims PI lock owned by {owner}");
                return Err(SyncError::ProtocolViolation);
            }
            None => {}
        }
        self.set_owner(h, tid);
        self.recompute_lent(tid, sched);
        log::debug!("usync: {tid} claimed PI lock {key}");
        Ok(())
    }

    /// Detaches `h` from its owner and recomputes the former owner's loan.
    /// Returns the former owner.
    pub fn disown<S: Scheduler + ?Sized>(&mut self, h: PiHandle, sched: &S) -> Option<ThreadId> {
        let owner = self.get_mut(h)?.owner.take()?;
        self.thread(owner).held.retain(|&x| x != h);
        self.recompute_lent(owner, sched);
        Some(owner)
    }

    // -----------------------------------------------------------------------
    // Blocking
    // -----------------------------------------------------------------------

    /// Links `waiter` into `h`'s blocked list and lends its priority down
    /// the owner chain.
    pub fn block<S: Scheduler + ?Sized>(&mut self, h: PiHandle, waiter: &Arc<Waiter>, sched: &S) {
        let tid = waiter.tid();
        let pri = self.effective(tid, sched);
        let seq = self.next_seq;
        self.next_seq += 1;
        let Some(state) = self.get_mut(h) else {
            return;
        };
        state.insert_sorted(PiBlocked {
            waiter: Arc::clone(waiter),
            pri,
            seq,
        });
        let t = self.thread(tid);
        debug_assert!(t.blocked_on.is_none(), "{tid} already PI-blocked");
        t.blocked_on = Some(h);
        self.propagate(tid, sched);
    }

    /// Unlinks `tid` from `h`'s blocked list and undoes any over-boost.
    pub fn unblock<S: Scheduler + ?Sized>(&mut self, h: PiHandle, tid: ThreadId, sched: &S) {
        if let Some(state) = self.get_mut(h) {
            state.take_blocked(tid);
        }
        self.thread(tid).blocked_on = None;
        self.repropagate(h, sched);
    }

    /// Returns the highest-priority waiter of `h` that is still asleep in
    /// its wait queue. Caller holds the chain lock.
    pub fn first_queued(&self, h: PiHandle) -> Option<Arc<Waiter>> {
        self.get(h)?
            .blocked
            .iter()
            .find(|b| b.waiter.is_queued())
            .map(|b| Arc::clone(&b.waiter))
    }

    /// Re-sorts `tid` within `h`'s blocked list after its priority changed.
    /// Returns `false` if the owner graph through `h` is cyclic.
    fn adjust<S: Scheduler + ?Sized>(&mut self, h: PiHandle, tid: ThreadId, sched: &S) -> bool {
        if self.has_cycle(h) {
            return false;
        }
        let pri = self.effective(tid, sched);
        if let Some(state) = self.get_mut(h) {
            if let Some(mut entry) = state.take_blocked(tid) {
                entry.pri = pri;
                state.insert_sorted(entry);
            }
        }
        true
    }

    /// Lends `tid`'s effective priority to every owner down its blocked-on
    /// chain that runs below it.
    pub fn propagate<S: Scheduler + ?Sized>(&mut self, tid: ThreadId, sched: &S) {
        let pri = self.effective(tid, sched);
        let Some(mut h) = self.blocked_on(tid) else {
            return;
        };
        loop {
            if self.has_cycle(h) {
                log::warn!("usync: PI owner cycle through {tid}, not propagating");
                return;
            }
            let Some(owner) = self.get(h).and_then(PiState::owner) else {
                return;
            };
            if owner == tid || self.effective(owner, sched) >= pri {
                return;
            }
            let lent = self.lent(owner).max(Some(pri));
            self.lend(owner, lent, sched);
            log::trace!("usync: lent {pri} to {owner}");

            let Some(next) = self.blocked_on(owner) else {
                return;
            };
            if !self.adjust(next, owner, sched) {
                return;
            }
            h = next;
        }
    }

    /// Recomputes the loan of `h`'s owner, and of every owner further down
    /// the chain, after a waiter left `h`.
    pub fn repropagate<S: Scheduler + ?Sized>(&mut self, h: PiHandle, sched: &S) {
        let mut h = h;
        loop {
            if self.has_cycle(h) {
                log::warn!("usync: PI owner cycle during repropagation");
                return;
            }
            let Some(owner) = self.get(h).and_then(PiState::owner) else {
                return;
            };
            self.recompute_lent(owner, sched);
            let Some(next) = self.blocked_on(owner) else {
                return;
            };
            if !self.adjust(next, owner, sched) {
                return;
            }
            h = next;
        }
    }

    fn next_hop(&self, h: PiHandle) -> Option<PiHandle> {
        let owner = self.get(h)?.owner?;
        self.blocked_on(owner)
    }

    /// Floyd's cycle check over `state → owner → blocked-on state`.
    pub fn has_cycle(&self, h: PiHandle) -> bool {
        let mut slow = Some(h);
        let mut fast = Some(h);
        loop {
            slow = slow.and_then(|x| self.next_hop(x));
            fast = fast
                .and_then(|x| self.next_hop(x))
                .and_then(|x| self.next_hop(x));
            match (slow, fast) {
                (Some(a), Some(b)) if a == b => return true,
                (Some(_), Some(_)) => {}
                _ => return false,
            }
        }
    }

    // -----------------------------------------------------------------------
    // Priority ceiling
    // -----------------------------------------------------------------------

    /// Raises `tid` to `ceiling` for the PP mutex `key`.
    pub fn push_ceiling<S: Scheduler + ?Sized>(
        &mut self,
        tid: ThreadId,
        key: SyncKey,
        ceiling: Priority,
        sched: &S,
    ) {
        self.thread(tid).ceilings.push((key, ceiling));
        self.recompute_lent(tid, sched);
        self.propagate(tid, sched);
    }

    /// Drops the most recent ceiling recorded for `key` and restores `tid`'s
    /// loan from whatever it still holds.
    pub fn pop_ceiling<S: Scheduler + ?Sized>(&mut self, tid: ThreadId, key: &SyncKey, sched: &S) {
        let t = self.thread(tid);
        if let Some(pos) = t.ceilings.iter().rposition(|(k, _)| k == key) {
            t.ceilings.remove(pos);
        }
        self.recompute_lent(tid, sched);
    }

    // -----------------------------------------------------------------------
    // Thread exit
    // -----------------------------------------------------------------------

    /// Forgets `tid`: disowns every PI state it still holds and withdraws
    /// its loan. Returns the keys of the disowned states.
    pub fn thread_exit<S: Scheduler + ?Sized>(&mut self, tid: ThreadId, sched: &S) -> Vec<SyncKey> {
        let Some(t) = self.threads.remove(&tid) else {
            return Vec::new();
        };
        debug_assert!(t.blocked_on.is_none(), "{tid} exiting while PI-blocked");
        let mut disowned = Vec::with_capacity(t.held.len());
        for &h in &t.held {
            if let Some(state) = self.get_mut(h) {
                state.owner = None;
                disowned.push(state.key);
            }
        }
        if t.lent.is_some() {
            sched.lend_priority(tid, None);
        }
        if !t.held.is_empty() {
            log::warn!("usync: {tid} exited owning {} contested PI locks", t.held.len());
        }
        disowned
    }

    #[cfg(test)]
    pub(crate) fn force_blocked_on(&mut self, tid: ThreadId, h: Option<PiHandle>) {
        self.thread(tid).blocked_on = h;
    }
}

#[cfg(all(test, not(loom), not(shuttle)))]
mod tests {
    use super::*;
    use crate::id::{SpaceId, UserAddr};
    use crate::key::{KeyIdentity, KeyKind};
    use crate::tests::platform::MockPlatform;

    fn key(addr: u64) -> SyncKey {
        SyncKey::new(
            KeyKind::PiMutex,
            KeyIdentity::Private {
                space: SpaceId::new(1),
                addr: UserAddr::new(addr),
            },
        )
    }

    fn tid(n: u32) -> ThreadId {
        ThreadId::new(n)
    }

    fn waiter(n: u32) -> Arc<Waiter> {
        Arc::new(Waiter::new(tid(n)))
    }

    #[test]
    fn stale_handle_does_not_resolve() {
        let mut table = PiTable::new();
        let h = table.alloc(key(0x10));
        table.acquire_ref(h);
        assert!(table.release_ref(h));
        assert!(table.get(h).is_none());
        let h2 = table.alloc(key(0x20));
        assert_ne!(h, h2);
        assert_eq!(table.get(h2).unwrap().key(), key(0x20));
        assert_eq!(table.live(), 1);
    }

    #[test]
    fn blocked_list_sorted_with_fifo_ties() {
        let p = MockPlatform::new();
        p.set_base(tid(1), 10);
        p.set_base(tid(2), 20);
        p.set_base(tid(3), 15);
        p.set_base(tid(4), 20);
        let mut table = PiTable::new();
        let h = table.alloc(key(0x10));
        table.set_owner(h, tid(9));
        for n in [1, 2, 3, 4] {
            table.block(h, &waiter(n), &p);
        }
        let order: Vec<_> = table.get(h).unwrap().blocked().map(|(t, _)| t.as_u32()).collect();
        assert_eq!(order, [2, 4, 3, 1]);
    }

    #[test]
    fn owner_boosted_to_top_waiter_and_restored() {
        let p = MockPlatform::new();
        p.set_base(tid(1), 10);
        p.set_base(tid(2), 20);
        p.set_base(tid(3), 15);
        let mut table = PiTable::new();
        let h = table.alloc(key(0x10));
        table.set_owner(h, tid(1));

        table.block(h, &waiter(2), &p);
        assert_eq!(table.effective(tid(1), &p), Priority::new(20));
        table.block(h, &waiter(3), &p);
        assert_eq!(table.effective(tid(1), &p), Priority::new(20));

        table.unblock(h, tid(2), &p);
        assert_eq!(table.effective(tid(1), &p), Priority::new(15));
        table.unblock(h, tid(3), &p);
        assert_eq!(table.effective(tid(1), &p), Priority::new(10));
        assert_eq!(p.lent(tid(1)), None);
    }

    #[test]
    fn propagation_is_transitive() {
        // 3 blocks on B (owned by 2), 2 blocks on A (owned by 1).
        let p = MockPlatform::new();
        p.set_base(tid(1), 5);
        p.set_base(tid(2), 6);
        p.set_base(tid(3), 30);
        let mut table = PiTable::new();
        let a = table.alloc(key(0x10));
        let b = table.alloc(key(0x20));
        table.set_owner(a, tid(1));
        table.set_owner(b, tid(2));
        table.block(a, &waiter(2), &p);
        assert_eq!(table.effective(tid(1), &p), Priority::new(6));

        table.block(b, &waiter(3), &p);
        assert_eq!(table.effective(tid(2), &p), Priority::new(30));
        assert_eq!(table.effective(tid(1), &p), Priority::new(30));
        assert_eq!(table.get(a).unwrap().top_priority(), Some(Priority::new(30)));

        table.unblock(b, tid(3), &p);
        assert_eq!(table.effective(tid(2), &p), Priority::new(6));
        assert_eq!(table.effective(tid(1), &p), Priority::new(6));
    }

    #[test]
    fn owner_keeps_loan_from_other_held_lock() {
        let p = MockPlatform::new();
        p.set_base(tid(1), 1);
        p.set_base(tid(2), 40);
        p.set_base(tid(3), 25);
        let mut table = PiTable::new();
        let a = table.alloc(key(0x10));
        let b = table.alloc(key(0x20));
        table.set_owner(a, tid(1));
        table.set_owner(b, tid(1));
        table.block(a, &waiter(2), &p);
        table.block(b, &waiter(3), &p);
        assert_eq!(table.effective(tid(1), &p), Priority::new(40));

        // Releasing A keeps the loan coming from B's waiter.
        table.disown(a, &p);
        assert_eq!(table.effective(tid(1), &p), Priority::new(25));
        assert_eq!(table.held(tid(1)), &[b]);
    }

    #[test]
    fn claim_lends_head_waiter_priority() {
        let p = MockPlatform::new();
        p.set_base(tid(1), 3);
        p.set_base(tid(2), 12);
        let mut table = PiTable::new();
        let h = table.alloc(key(0x10));
        table.block(h, &waiter(2), &p);
        assert_eq!(table.claim(h, tid(1), &p), Ok(()));
        assert_eq!(table.effective(tid(1), &p), Priority::new(12));
        assert_eq!(table.claim(h, tid(1), &p), Ok(()));
        assert_eq!(table.claim(h, tid(5), &p), Err(SyncError::ProtocolViolation));
    }

    #[test]
    fn cycle_is_detected_and_propagation_terminates() {
        // 1 owns A and waits on B; 2 owns B and waits on A.
        let p = MockPlatform::new();
        p.set_base(tid(1), 5);
        p.set_base(tid(2), 6);
        p.set_base(tid(3), 50);
        let mut table = PiTable::new();
        let a = table.alloc(key(0x10));
        let b = table.alloc(key(0x20));
        table.set_owner(a, tid(1));
        table.set_owner(b, tid(2));
        table.force_blocked_on(tid(1), Some(b));
        table.force_blocked_on(tid(2), Some(a));
        assert!(table.has_cycle(a));
        assert!(table.has_cycle(b));

        // An outside thread blocking on A must not loop or lend into the cycle.
        table.block(a, &waiter(3), &p);
        assert_eq!(table.effective(tid(1), &p), Priority::new(5));
        assert_eq!(table.effective(tid(2), &p), Priority::new(6));
        table.unblock(a, tid(3), &p);
    }

    #[test]
    fn acyclic_chain_has_no_cycle() {
        let mut table = PiTable::new();
        let a = table.alloc(key(0x10));
        table.set_owner(a, tid(1));
        assert!(!table.has_cycle(a));
    }

    #[test]
    fn ceilings_restore_to_max_remaining() {
        let p = MockPlatform::new();
        p.set_base(tid(1), 2);
        let mut table = PiTable::new();
        table.push_ceiling(tid(1), key(0x10), Priority::new(30), &p);
        table.push_ceiling(tid(1), key(0x20), Priority::new(20), &p);
        assert_eq!(table.effective(tid(1), &p), Priority::new(30));
        table.pop_ceiling(tid(1), &key(0x10), &p);
        assert_eq!(table.effective(tid(1), &p), Priority::new(20));
        table.pop_ceiling(tid(1), &key(0x20), &p);
        assert_eq!(table.effective(tid(1), &p), Priority::new(2));
        assert_eq!(p.lent(tid(1)), None);
    }

    #[test]
    fn pop_ceiling_takes_the_latest_entry_for_a_key() {
        let p = MockPlatform::new();
        let mut table = PiTable::new();
        table.push_ceiling(tid(1), key(0x10), Priority::new(30), &p);
        table.push_ceiling(tid(1), key(0x10), Priority::new(40), &p);
        assert_eq!(table.effective(tid(1), &p), Priority::new(40));
        table.pop_ceiling(tid(1), &key(0x10), &p);
        assert_eq!(table.effective(tid(1), &p), Priority::new(30));
    }

    #[test]
    fn last_unref_disowns() {
        let p = MockPlatform::new();
        let mut table = PiTable::new();
        let h = table.alloc(key(0x10));
        table.acquire_ref(h);
        table.acquire_ref(h);
        table.claim(h, tid(1), &p).unwrap();
        assert!(!table.release_ref(h));
        assert_eq!(table.get(h).unwrap().refcount(), 1);
        assert!(table.release_ref(h));
        assert!(table.held(tid(1)).is_empty());
    }

    #[test]
    fn thread_exit_disowns_everything() {
        let p = MockPlatform::new();
        p.set_base(tid(1), 1);
        p.set_base(tid(2), 9);
        let mut table = PiTable::new();
        let h = table.alloc(key(0x10));
        table.set_owner(h, tid(1));
        let w = waiter(2);
        table.block(h, &w, &p);
        assert_eq!(p.lent(tid(1)), Some(Priority::new(9)));
        assert_eq!(table.thread_exit(tid(1), &p), [key(0x10)]);
        assert!(table.thread_exit(tid(1), &p).is_empty());
        assert_eq!(table.get(h).unwrap().owner(), None);
        assert_eq!(p.lent(tid(1)), None);
    }
}
