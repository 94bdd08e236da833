//! Priority-inheritance mutex.
//!
//! Same owner word as the plain mutex, but contention is tracked in a
//! [`PiState`](crate::pi::PiState): while a thread sleeps on the mutex, the
//! owner (and transitively whoever that owner waits on) runs at least at
//! the sleeper's priority. Release wakes the most urgent sleeper rather
//! than the oldest.

use crate::domain::{Caller, SyncDomain};
use crate::error::{SyncError, SyncResult};
use crate::id::{ThreadId, UserAddr};
use crate::key::{KeyKind, SyncKey};
use crate::pi::{PiHandle, PiState};
use crate::platform::Platform;
use crate::protocol::{LockMode, scope};
use crate::timeout::Timeout;
use crate::waiter::QueueKind;
use crate::word::{MutexFlags, mutex, owner_id};

/// A counted reference to the PI state of one mutex.
///
/// Looked up or created under the chain lock; dropping it releases the
/// reference and destroys the state once nobody uses it.
struct PiRef<'d, P: Platform> {
    d: &'d SyncDomain<P>,
    key: SyncKey,
    handle: PiHandle,
}

impl<'d, P: Platform> PiRef<'d, P> {
    fn get(d: &'d SyncDomain<P>, key: SyncKey) -> Self {
        let mut inner = d.chains().chain_for(&key).lock();
        let mut table = d.pi().lock();
        let handle = match inner.pi_lookup(&key) {
            Some(h) => h,
            None => {
                let h = table.alloc(key);
                inner.pi_insert(key, h);
                h
            }
        };
        table.acquire_ref(handle);
        Self { d, key, handle }
    }
}

impl<P: Platform> Drop for PiRef<'_, P> {
    fn drop(&mut self) {
        let mut inner = self.d.chains().chain_for(&self.key).lock();
        let mut table = self.d.pi().lock();
        if table.release_ref(self.handle) {
            inner.pi_remove(&self.key);
        }
    }
}

/// Locks a PI mutex.
pub fn lock<P: Platform>(
    d: &SyncDomain<P>,
    caller: Caller,
    addr: UserAddr,
    flags: MutexFlags,
    timeout: Option<&Timeout>,
    mode: LockMode,
) -> SyncResult<()> {
    let id = owner_id(caller.tid)?;
    let p = d.platform();
    let shared = flags.contains(MutexFlags::SHARED);
    let word = caller.word(addr).field(mutex::OWNER);
    let held = d.resolve(caller, addr, KeyKind::PiMutex, scope(shared))?;
    let key = held.key();
    let pi = PiRef::get(d, key);
    let mut deadline = d.deadline(timeout);
    let mut backoff = d.backoff();

    loop {
        let owner = word.cas(p, mutex::UNOWNED, id)?;
        if owner == mutex::UNOWNED {
            return Ok(());
        }

        // Unowned but contested: take it and tell the PI state who we are.
        if owner == mutex::CONTESTED {
            if word.cas(p, mutex::CONTESTED, id | mutex::CONTESTED)? != mutex::CONTESTED {
                backoff.fail(p);
                continue;
            }
            let mut call = d.wait_call(caller, key);
            let mut inner = call.busy_locked();
            let claimed = d.pi().lock().claim(pi.handle, caller.tid, p);
            call.unbusy_locked(&mut inner);
            drop(inner);
            if claimed.is_err() {
                // Leave the word as we found it rather than compound the damage.
                let _ = word.cas(p, id | mutex::CONTESTED, mutex::CONTESTED);
            }
            return claimed;
        }

        if mutex::owner_of(owner) == id {
            return Err(SyncError::Deadlock);
        }
        if mode == LockMode::Try {
            return Err(SyncError::WouldBlock);
        }

        let mut call = d.wait_call(caller, key);
        call.busy();
        let old = word.cas(p, owner, owner | mutex::CONTESTED)?;
        if old != owner {
            call.unbusy();
            backoff.fail(p);
            continue;
        }

        {
            let mut inner = call.lock();
            call.enqueue_locked(&mut inner, QueueKind::Shared);
            let mut table = d.pi().lock();
            if table.get(pi.handle).and_then(PiState::owner).is_none() {
                // The owner took the lock in user mode; learn it from the word.
                let owner_tid = ThreadId::new(mutex::owner_of(owner));
                let space = if shared { None } else { Some(caller.space) };
                if p.thread_alive(owner_tid, space) {
                    table.set_owner(pi.handle, owner_tid);
                }
            }
            table.block(pi.handle, call.waiter(), p);
            drop(table);
            call.unbusy_locked(&mut inner);
        }

        let (wake, inner) = call.sleep_locked(deadline.as_mut(), true);
        d.pi().lock().unblock(pi.handle, caller.tid, p);
        drop(inner);
        wake.into_result()?;
    }
}

/// Unlocks a PI mutex owned by the caller.
pub fn unlock<P: Platform>(
    d: &SyncDomain<P>,
    caller: Caller,
    addr: UserAddr,
    flags: MutexFlags,
) -> SyncResult<()> {
    let id = owner_id(caller.tid)?;
    let p = d.platform();
    let word = caller.word(addr).field(mutex::OWNER);
    let mut backoff = d.backoff();

    let mut owner = word.read(p)?;
    loop {
        if mutex::owner_of(owner) != id {
            return Err(SyncError::NotOwner);
        }
        if owner & mutex::CONTESTED != 0 {
            break;
        }
        let old = word.cas(p, owner, mutex::UNOWNED)?;
        if old == owner {
            return Ok(());
        }
        owner = old;
        backoff.fail(p);
    }

    let held = d.resolve(caller, addr, KeyKind::PiMutex, scope(flags.contains(MutexFlags::SHARED)))?;
    let key = held.key();
    let mut call = d.wait_call(caller, key);

    let count = {
        let mut inner = call.busy_locked();
        let count = inner.count(&key, QueueKind::Shared);
        let mut table = d.pi().lock();
        match inner.pi_lookup(&key) {
            Some(h) if count > 0 => {
                if table.get(h).and_then(PiState::owner) != Some(caller.tid) {
                    drop(table);
                    call.unbusy_locked(&mut inner);
                    log::warn!("usync: {} releases {key} it does not own in the PI table", caller.tid);
                    return Err(SyncError::ProtocolViolation);
                }
                table.disown(h, p);
                let next = table.first_queued(h);
                drop(table);
                if let Some(w) = next {
                    log::debug!("usync: {} hands {key} to {}", caller.tid, w.tid());
                    inner.signal_waiter(&key, &w, p);
                }
            }
            // A timed-out waiter can leave the state behind with nobody
            // queued; the owner still has to let go of it.
            Some(h) => {
                if table.get(h).and_then(PiState::owner) == Some(caller.tid) {
                    table.disown(h, p);
                }
            }
            None => {}
        }
        count
    };

    let new = if count > 1 {
        mutex::CONTESTED
    } else {
        mutex::UNOWNED
    };
    let old = word.cas(p, owner, new)?;
    call.unbusy();
    if old != owner {
        log::warn!("usync: {key} owner word changed under its owner {}", caller.tid);
        return Err(SyncError::ProtocolViolation);
    }
    Ok(())
}

