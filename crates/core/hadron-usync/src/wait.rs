//! One blocking call's walk through a chain.
//!
//! Every protocol that may sleep drives a [`WaitCall`] through
//!
//! ```text
//! Idle ──busy──▶ Busy ──enqueue──▶ Queued ──sleep──▶ Sleeping ──▶ Reconciled
//!   ▲                                                                  │
//!   └──────────────────────────── reset ───────────────────────────────┘
//! ```
//!
//! The busy flag is tracked separately from the state because a call keeps
//! it while queueing and drops it just before sleeping. Dropping a
//! `WaitCall` unlinks the waiter and releases the busy flag if the call
//! still holds either, so an early `?` return never leaves a record in a
//! queue it no longer owns.

use alloc::sync::Arc;

use crate::chain::{Chain, ChainInner};
use crate::error::SyncError;
use crate::key::SyncKey;
use crate::platform::{Clock, ParkOutcome, Scheduler};
use crate::sync::SpinLockGuard;
use crate::timeout::AbsTimeout;
use crate::waiter::{QueueKind, Waiter};

/// Where a [`WaitCall`] is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitState {
    /// Not linked anywhere.
    Idle,
    /// Holds the chain's busy flag, not queued.
    Busy,
    /// Linked into a wait queue.
    Queued,
    /// Parked in the scheduler.
    Sleeping,
    /// Woken and unlinked; the outcome is known.
    Reconciled,
}

/// Why a sleep ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    /// Dequeued by a waker.
    Woken,
    /// The deadline passed while still queued.
    TimedOut,
    /// A signal arrived while still queued.
    Interrupted,
}

impl Wake {
    /// Maps the outcome to the error a protocol reports.
    pub fn into_result(self) -> Result<(), SyncError> {
        match self {
            Self::Woken => Ok(()),
            Self::TimedOut => Err(SyncError::TimedOut),
            Self::Interrupted => Err(SyncError::Interrupted),
        }
    }
}

/// A blocking call against one key.
pub struct WaitCall<'d, P: Scheduler + Clock + ?Sized> {
    platform: &'d P,
    chain: &'d Chain,
    key: SyncKey,
    waiter: Arc<Waiter>,
    state: WaitState,
    busy: bool,
}

impl<'d, P: Scheduler + Clock + ?Sized> WaitCall<'d, P> {
    /// Starts an idle call for `waiter` on `key`, served by `chain`.
    pub fn new(platform: &'d P, chain: &'d Chain, key: SyncKey, waiter: Arc<Waiter>) -> Self {
        Self {
            platform,
            chain,
            key,
            waiter,
            state: WaitState::Idle,
            busy: false,
        }
    }

    /// Returns the current state.
    pub fn state(&self) -> WaitState {
        self.state
    }

    /// Returns `true` while the call holds the chain's busy flag.
    pub fn holds_busy(&self) -> bool {
        self.busy
    }

    /// Returns the key.
    pub fn key(&self) -> SyncKey {
        self.key
    }

    /// Returns the calling thread's waiter record.
    pub fn waiter(&self) -> &Arc<Waiter> {
        &self.waiter
    }

    /// Returns the chain serving the key.
    pub fn chain(&self) -> &'d Chain {
        self.chain
    }

    /// Locks the chain.
    pub fn lock(&self) -> SpinLockGuard<'d, ChainInner> {
        self.chain.lock()
    }

    /// Takes the busy flag and returns with the chain locked.
    pub fn busy_locked(&mut self) -> SpinLockGuard<'d, ChainInner> {
        debug_assert!(!self.busy, "busy flag taken twice");
        let guard = self.chain.busy(self.chain.lock(), &self.waiter, self.platform);
        self.busy = true;
        if self.state == WaitState::Idle {
            self.state = WaitState::Busy;
        }
        guard
    }

    /// Takes the busy flag.
    pub fn busy(&mut self) {
        drop(self.busy_locked());
    }

    /// Releases the busy flag with the chain already locked.
    pub fn unbusy_locked(&mut self, inner: &mut ChainInner) {
        if self.busy {
            self.chain.unbusy(inner, self.platform);
            self.busy = false;
            if self.state == WaitState::Busy {
                self.state = WaitState::Idle;
            }
        }
    }

    /// Releases the busy flag.
    pub fn unbusy(&mut self) {
        if self.busy {
            let mut inner = self.chain.lock();
            self.unbusy_locked(&mut inner);
        }
    }

    /// Links the waiter into `kind` with the chain already locked.
    pub fn enqueue_locked(&mut self, inner: &mut ChainInner, kind: QueueKind) {
        debug_assert!(
            matches!(self.state, WaitState::Idle | WaitState::Busy),
            "enqueue from {:?}",
            self.state
        );
        inner.insert(self.key, kind, &self.waiter);
        self.state = WaitState::Queued;
    }

    /// Links the waiter into `kind`.
    pub fn enqueue(&mut self, kind: QueueKind) {
        let mut inner = self.chain.lock();
        self.enqueue_locked(&mut inner, kind);
    }

    /// Unlinks the waiter if it is still queued, with the chain locked.
    /// Returns `true` if it was still there.
    pub fn dequeue_locked(&mut self, inner: &mut ChainInner) -> bool {
        let removed = inner.remove(&self.key, &self.waiter);
        self.state = if self.busy {
            WaitState::Busy
        } else {
            WaitState::Idle
        };
        removed
    }

    /// Unlinks the waiter if it is still queued.
    pub fn dequeue(&mut self) -> bool {
        let mut inner = self.chain.lock();
        self.dequeue_locked(&mut inner)
    }

    /// Sleeps until dequeued by a waker, the deadline passes, or (when
    /// `interruptible`) a signal arrives, then unlinks the waiter and
    /// returns with the chain locked.
    ///
    /// The waiter must be queued and the busy flag released. A wakeup that
    /// races the deadline or a signal counts as [`Wake::Woken`]: membership
    /// is decided under the chain lock.
    pub fn sleep_locked(
        &mut self,
        mut timeout: Option<&mut AbsTimeout>,
        interruptible: bool,
    ) -> (Wake, SpinLockGuard<'d, ChainInner>) {
        debug_assert_eq!(self.state, WaitState::Queued);
        debug_assert!(!self.busy, "sleeping with the chain busy");
        self.state = WaitState::Sleeping;

        let tid = self.waiter.tid();
        let mut pending = Wake::Woken;
        loop {
            {
                let _inner = self.chain.lock();
                if !self.waiter.is_queued() {
                    break;
                }
            }
            let remaining = match timeout.as_deref() {
                Some(t) => match t.remaining() {
                    Some(left) => Some(left),
                    None => {
                        pending = Wake::TimedOut;
                        break;
                    }
                },
                None => None,
            };
            if self.platform.park(tid, remaining, interruptible) == ParkOutcome::Interrupted {
                pending = Wake::Interrupted;
                break;
            }
            if let Some(t) = timeout.as_deref_mut() {
                t.update(self.platform);
            }
        }

        let mut inner = self.chain.lock();
        let wake = if inner.remove(&self.key, &self.waiter) {
            pending
        } else {
            Wake::Woken
        };
        self.state = WaitState::Reconciled;
        if wake != Wake::Woken {
            log::trace!("usync: {tid} stopped waiting on {}: {wake:?}", self.key);
        }
        (wake, inner)
    }

    /// Like [`sleep_locked`](Self::sleep_locked), dropping the chain lock.
    pub fn sleep(&mut self, timeout: Option<&mut AbsTimeout>, interruptible: bool) -> Wake {
        self.sleep_locked(timeout, interruptible).0
    }

    /// Returns a reconciled call to `Idle` (or `Busy`) for another round.
    pub fn reset(&mut self) {
        debug_assert!(
            !matches!(self.state, WaitState::Queued | WaitState::Sleeping),
            "reset while queued"
        );
        self.state = if self.busy {
            WaitState::Busy
        } else {
            WaitState::Idle
        };
    }
}

impl<P: Scheduler + Clock + ?Sized> Drop for WaitCall<'_, P> {
    fn drop(&mut self) {
        let queued = matches!(self.state, WaitState::Queued | WaitState::Sleeping);
        if !queued && !self.busy {
            return;
        }
        let mut inner = self.chain.lock();
        if queued {
            inner.remove(&self.key, &self.waiter);
        }
        if self.busy {
            self.chain.unbusy(&mut inner, self.platform);
        }
    }
}

#[cfg(all(test, not(loom), not(shuttle)))]
mod tests {
    use core::time::Duration;

    use super::*;
    use crate::config::SyncConfig;
    use crate::chain::ChainTable;
    use crate::id::{SpaceId, ThreadId, UserAddr};
    use crate::key::{KeyIdentity, KeyKind};
    use crate::tests::platform::MockPlatform;
    use crate::timeout::Timeout;

    fn key() -> SyncKey {
        SyncKey::new(
            KeyKind::Legacy,
            KeyIdentity::Private {
                space: SpaceId::new(1),
                addr: UserAddr::new(0x40),
            },
        )
    }

    fn waiter(n: u32) -> Arc<Waiter> {
        Arc::new(Waiter::new(ThreadId::new(n)))
    }

    #[test]
    fn walks_the_states() {
        let table = ChainTable::new(&SyncConfig::default().with_chains(4));
        let p = MockPlatform::new();
        let w = waiter(1);
        let mut call = WaitCall::new(&p, table.chain_for(&key()), key(), Arc::clone(&w));
        assert_eq!(call.state(), WaitState::Idle);
        call.busy();
        assert_eq!(call.state(), WaitState::Busy);
        call.enqueue(QueueKind::Shared);
        assert_eq!(call.state(), WaitState::Queued);
        call.unbusy();
        assert!(!call.holds_busy());

        // A waker dequeues before the sleep starts; the banked permit and
        // the membership check both see it.
        table.chain_for(&key()).lock().signal(&key(), QueueKind::Shared, 1, &p);
        assert_eq!(call.sleep(None, true), Wake::Woken);
        assert_eq!(call.state(), WaitState::Reconciled);
        call.reset();
        assert_eq!(call.state(), WaitState::Idle);
    }

    #[test]
    fn times_out_and_unlinks() {
        let table = ChainTable::new(&SyncConfig::default().with_chains(4));
        let p = MockPlatform::new();
        let w = waiter(2);
        let mut call = WaitCall::new(&p, table.chain_for(&key()), key(), Arc::clone(&w));
        call.enqueue(QueueKind::Shared);
        let mut deadline = AbsTimeout::new(&p, &Timeout::relative(Duration::from_millis(5)));
        assert_eq!(call.sleep(Some(&mut deadline), true), Wake::TimedOut);
        assert!(!w.is_queued());
        assert_eq!(table.chain_for(&key()).lock().count(&key(), QueueKind::Shared), 0);
    }

    #[test]
    fn interrupted_while_queued() {
        let table = ChainTable::new(&SyncConfig::default().with_chains(4));
        let p = MockPlatform::new();
        let w = waiter(3);
        p.interrupt(w.tid());
        let mut call = WaitCall::new(&p, table.chain_for(&key()), key(), Arc::clone(&w));
        call.enqueue(QueueKind::Shared);
        assert_eq!(call.sleep(None, true), Wake::Interrupted);
        assert!(!w.is_queued());
    }

    #[test]
    fn drop_unwinds_queue_and_busy() {
        let table = ChainTable::new(&SyncConfig::default().with_chains(4));
        let p = MockPlatform::new();
        let w = waiter(4);
        {
            let mut call = WaitCall::new(&p, table.chain_for(&key()), key(), Arc::clone(&w));
            call.busy();
            call.enqueue(QueueKind::Exclusive);
            assert!(w.is_queued());
        }
        let inner = table.chain_for(&key()).lock();
        assert!(!w.is_queued());
        assert!(!inner.is_busy());
        assert_eq!(inner.bound_queues(), 0);
    }

    #[test]
    fn wake_results() {
        assert_eq!(Wake::Woken.into_result(), Ok(()));
        assert_eq!(Wake::TimedOut.into_result(), Err(SyncError::TimedOut));
        assert_eq!(Wake::Interrupted.into_result(), Err(SyncError::Interrupted));
    }
}
