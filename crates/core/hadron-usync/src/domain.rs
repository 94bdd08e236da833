//! The synchronization domain: one chain table, one PI table and the
//! per-thread waiter records, plus the public operations on top of them.
//!
//! A [`SyncDomain`] is constructed explicitly and shared by reference; a
//! kernel creates one at boot, tests create as many as they like.

use alloc::sync::Arc;

use crate::chain::ChainTable;
use crate::config::SyncConfig;
use crate::error::SyncResult;
use crate::id::{Priority, SpaceId, ThreadId, UserAddr};
use crate::key::{self, HeldKey, KeyKind, KeyScope, SyncKey};
use crate::pi::PiTable;
use crate::platform::Platform;
use crate::protocol::{self, LockMode};
use crate::sync::SpinLock;
use crate::timeout::{AbsTimeout, Timeout};
use crate::wait::WaitCall;
use crate::waiter::{ThreadTable, Waiter};
use crate::word::{Backoff, UserWord};

/// The thread issuing an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    /// Calling thread.
    pub tid: ThreadId,
    /// Its address space.
    pub space: SpaceId,
}

impl Caller {
    /// Creates a caller context.
    pub const fn new(tid: ThreadId, space: SpaceId) -> Self {
        Self { tid, space }
    }

    /// Names the word at `addr` in the caller's address space.
    pub const fn word(self, addr: UserAddr) -> UserWord {
        UserWord::new(self.space, addr)
    }
}

/// User-level synchronization manager.
pub struct SyncDomain<P: Platform> {
    platform: P,
    config: SyncConfig,
    chains: ChainTable,
    pi: SpinLock<PiTable>,
    threads: ThreadTable,
}

impl<P: Platform> SyncDomain<P> {
    /// Creates a domain over `platform`.
    pub fn new(platform: P, config: SyncConfig) -> Self {
        log::debug!(
            "usync: domain with {} chains, {} busy spins",
            config.chain_count(),
            config.busy_spins
        );
        Self {
            chains: ChainTable::new(&config),
            pi: SpinLock::named("usync_pi", PiTable::new()),
            threads: ThreadTable::new(),
            platform,
            config,
        }
    }

    /// Returns the platform.
    pub fn platform(&self) -> &P {
        &self.platform
    }

    /// Returns the chain table.
    pub fn chains(&self) -> &ChainTable {
        &self.chains
    }

    /// Returns the PI table.
    pub fn pi(&self) -> &SpinLock<PiTable> {
        &self.pi
    }

    /// Returns the table of waiter records.
    pub fn threads(&self) -> &ThreadTable {
        &self.threads
    }

    /// Returns `tid`'s effective priority, including any loan.
    pub fn effective_priority(&self, tid: ThreadId) -> Priority {
        self.pi.lock().effective(tid, &self.platform)
    }

    pub(crate) fn waiter(&self, tid: ThreadId) -> Arc<Waiter> {
        self.threads.waiter(tid)
    }

    pub(crate) fn resolve(
        &self,
        caller: Caller,
        addr: UserAddr,
        kind: KeyKind,
        scope: KeyScope,
    ) -> SyncResult<HeldKey<'_, P>> {
        Ok(key::resolve(&self.platform, caller.space, addr, kind, scope)?)
    }

    pub(crate) fn wait_call(&self, caller: Caller, key: SyncKey) -> WaitCall<'_, P> {
        WaitCall::new(
            &self.platform,
            self.chains.chain_for(&key),
            key,
            self.waiter(caller.tid),
        )
    }

    pub(crate) fn backoff(&self) -> Backoff {
        Backoff::new(self.config.cas_retries)
    }

    pub(crate) fn deadline(&self, timeout: Option<&Timeout>) -> Option<AbsTimeout> {
        timeout.map(|t| AbsTimeout::new(&self.platform, t))
    }

    // -----------------------------------------------------------------------
    // Mutexes
    // -----------------------------------------------------------------------

    /// Locks the mutex at `addr`, blocking until acquired or `timeout`
    /// passes. The protocol (plain, PI or PP) comes from the mutex's flags
    /// word.
    pub fn mutex_lock(&self, caller: Caller, addr: UserAddr, timeout: Option<Timeout>) -> SyncResult<()> {
        restartable(timeout.as_ref(), || {
            protocol::mutex_lock(self, caller, addr, timeout.as_ref(), LockMode::Block)
        })
    }

    /// Locks the mutex at `addr` only if that needs no sleep.
    pub fn mutex_trylock(&self, caller: Caller, addr: UserAddr) -> SyncResult<()> {
        protocol::mutex_lock(self, caller, addr, None, LockMode::Try)
    }

    /// Unlocks the mutex at `addr`, waking one waiter if any.
    pub fn mutex_unlock(&self, caller: Caller, addr: UserAddr) -> SyncResult<()> {
        protocol::mutex_unlock(self, caller, addr)
    }

    /// Hands a plain mutex released in user mode to one kernel waiter.
    pub fn mutex_wake(&self, caller: Caller, addr: UserAddr) -> SyncResult<()> {
        protocol::normal::wake(self, caller, addr)
    }

    /// Replaces the ceiling of the PP mutex at `addr`, returning the old one.
    pub fn mutex_set_ceiling(&self, caller: Caller, addr: UserAddr, ceiling: u32) -> SyncResult<u32> {
        restartable(None, || protocol::pp::set_ceiling(self, caller, addr, ceiling))
    }

    // -----------------------------------------------------------------------
    // Condition variables
    // -----------------------------------------------------------------------

    /// Releases `mutex` and waits on the condition variable at `cv`.
    ///
    /// Signal, broadcast, interruption and spurious wakeups all return
    /// `Ok(())`; only an expired deadline is reported. The mutex is not
    /// reacquired.
    pub fn cv_wait(
        &self,
        caller: Caller,
        cv: UserAddr,
        mutex: UserAddr,
        timeout: Option<Timeout>,
    ) -> SyncResult<()> {
        protocol::cond::wait(self, caller, cv, mutex, timeout.as_ref())
    }

    /// Wakes one waiter of the condition variable at `cv`.
    pub fn cv_signal(&self, caller: Caller, cv: UserAddr) -> SyncResult<usize> {
        protocol::cond::signal(self, caller, cv, 1)
    }

    /// Wakes every waiter of the condition variable at `cv`.
    pub fn cv_broadcast(&self, caller: Caller, cv: UserAddr) -> SyncResult<usize> {
        protocol::cond::signal(self, caller, cv, usize::MAX)
    }

    // -----------------------------------------------------------------------
    // Reader-writer locks
    // -----------------------------------------------------------------------

    /// Takes the rwlock at `addr` for reading.
    pub fn rw_rdlock(&self, caller: Caller, addr: UserAddr, timeout: Option<Timeout>) -> SyncResult<()> {
        restartable(timeout.as_ref(), || {
            protocol::rwlock::rdlock(self, caller, addr, timeout.as_ref(), LockMode::Block)
        })
    }

    /// Takes the rwlock at `addr` for reading without sleeping.
    pub fn rw_tryrdlock(&self, caller: Caller, addr: UserAddr) -> SyncResult<()> {
        protocol::rwlock::rdlock(self, caller, addr, None, LockMode::Try)
    }

    /// Takes the rwlock at `addr` for writing.
    pub fn rw_wrlock(&self, caller: Caller, addr: UserAddr, timeout: Option<Timeout>) -> SyncResult<()> {
        restartable(timeout.as_ref(), || {
            protocol::rwlock::wrlock(self, caller, addr, timeout.as_ref(), LockMode::Block)
        })
    }

    /// Takes the rwlock at `addr` for writing without sleeping.
    pub fn rw_trywrlock(&self, caller: Caller, addr: UserAddr) -> SyncResult<()> {
        protocol::rwlock::wrlock(self, caller, addr, None, LockMode::Try)
    }

    /// Releases one read hold or the write hold of the rwlock at `addr`.
    pub fn rw_unlock(&self, caller: Caller, addr: UserAddr) -> SyncResult<()> {
        protocol::rwlock::unlock(self, caller, addr)
    }

    // -----------------------------------------------------------------------
    // Semaphores
    // -----------------------------------------------------------------------

    /// Decrements the semaphore at `addr`, sleeping while it is zero.
    pub fn sem_wait(&self, caller: Caller, addr: UserAddr, timeout: Option<Timeout>) -> SyncResult<()> {
        restartable(timeout.as_ref(), || {
            protocol::sem::wait(self, caller, addr, timeout.as_ref(), LockMode::Block)
        })
    }

    /// Decrements the semaphore at `addr` if it is positive.
    pub fn sem_trywait(&self, caller: Caller, addr: UserAddr) -> SyncResult<()> {
        protocol::sem::wait(self, caller, addr, None, LockMode::Try)
    }

    /// Increments the semaphore at `addr`, waking one sleeper.
    pub fn sem_post(&self, caller: Caller, addr: UserAddr) -> SyncResult<()> {
        protocol::sem::post(self, caller, addr)
    }

    // -----------------------------------------------------------------------
    // Simple words
    // -----------------------------------------------------------------------

    /// Sleeps while the word at `addr` equals `expected`.
    pub fn wait_word(
        &self,
        caller: Caller,
        addr: UserAddr,
        expected: u32,
        shared: bool,
        timeout: Option<Timeout>,
    ) -> SyncResult<()> {
        restartable(timeout.as_ref(), || {
            protocol::simple::wait(self, caller, addr, expected, shared, timeout.as_ref())
        })
    }

    /// Wakes up to `n` threads sleeping on the word at `addr`.
    pub fn wake_word(&self, caller: Caller, addr: UserAddr, n: usize, shared: bool) -> SyncResult<usize> {
        protocol::simple::wake(self, caller, addr, n, shared)
    }

    // -----------------------------------------------------------------------
    // Threads
    // -----------------------------------------------------------------------

    /// Forgets `tid`: disowns its contested PI locks, withdraws its loan
    /// and frees its waiter record.
    ///
    /// The scheduler must already report `tid` as dead. The most urgent
    /// sleeper on each disowned lock is woken to re-read the owner word; it
    /// only gets the lock once the library has cleared the dead owner from
    /// that word.
    pub fn thread_exit(&self, tid: ThreadId) {
        let disowned = self.pi.lock().thread_exit(tid, &self.platform);
        for key in disowned {
            let mut inner = self.chains.chain_for(&key).lock();
            let next = inner
                .pi_lookup(&key)
                .and_then(|h| self.pi.lock().first_queued(h));
            if let Some(w) = next {
                log::debug!("usync: {tid} exited, waking {} on {key}", w.tid());
                inner.signal_waiter(&key, &w, &self.platform);
            }
        }
        self.threads.remove(tid);
    }
}

/// Runs `op` again after an interruption when the caller gave no deadline.
fn restartable<T>(timeout: Option<&Timeout>, mut op: impl FnMut() -> SyncResult<T>) -> SyncResult<T> {
    loop {
        match op() {
            Err(crate::error::SyncError::Interrupted) if timeout.is_none() => {
                log::trace!("usync: restarting interrupted call");
            }
            r => return r,
        }
    }
}
