//! Priority-ceiling mutex.
//!
//! The kernel owns the owner word of a PP mutex outright: unowned is
//! `CONTESTED`, owned is `tid|CONTESTED`, so user mode never completes a
//! lock or unlock on its own. While holding the mutex the owner runs at the
//! ceiling stored in the mutex; on release it drops back to the highest
//! ceiling (or PI loan) it still holds.

use crate::domain::{Caller, SyncDomain};
use crate::error::{Fault, SyncError, SyncResult};
use crate::id::{Priority, ThreadId, UserAddr};
use crate::key::{KeyKind, SyncKey};
use crate::platform::Platform;
use crate::protocol::{LockMode, MutexKind, mutex_flags, scope};
use crate::timeout::Timeout;
use crate::waiter::QueueKind;
use crate::word::{MutexFlags, UserWord, mutex, owner_id};

/// Validates a raw ceiling word.
fn ceiling_of(raw: u32) -> SyncResult<Priority> {
    u8::try_from(raw)
        .map(Priority::new)
        .map_err(|_| SyncError::InvalidCeiling)
}

/// Tries to move the owner word from unowned to `id|CONTESTED`.
///
/// Returns `CONTESTED` on success, else the owner word observed. A word
/// still at zero (never handed to the kernel) also counts as unowned.
fn try_take<P: Platform>(word: UserWord, p: &P, id: u32) -> Result<u32, Fault> {
    let owner = word.cas(p, mutex::CONTESTED, id | mutex::CONTESTED)?;
    if owner != mutex::UNOWNED {
        return Ok(owner);
    }
    Ok(match word.cas(p, mutex::UNOWNED, id | mutex::CONTESTED)? {
        mutex::UNOWNED => mutex::CONTESTED,
        other => other,
    })
}

/// A ceiling lent for the duration of an acquire attempt. Dropping it
/// withdraws the ceiling unless the mutex was acquired.
struct CeilingLoan<'d, P: Platform> {
    d: &'d SyncDomain<P>,
    tid: ThreadId,
    key: SyncKey,
    armed: bool,
}

impl<'d, P: Platform> CeilingLoan<'d, P> {
    fn lend(d: &'d SyncDomain<P>, tid: ThreadId, key: SyncKey, ceiling: Priority) -> SyncResult<Self> {
        let mut table = d.pi().lock();
        if table.effective(tid, d.platform()) > ceiling {
            return Err(SyncError::InvalidCeiling);
        }
        table.push_ceiling(tid, key, ceiling, d.platform());
        Ok(Self {
            d,
            tid,
            key,
            armed: true,
        })
    }

    fn keep(mut self) {
        self.armed = false;
    }
}

impl<P: Platform> Drop for CeilingLoan<'_, P> {
    fn drop(&mut self) {
        if self.armed {
            self.d.pi().lock().pop_ceiling(self.tid, &self.key, self.d.platform());
        }
    }
}

/// Locks a PP mutex.
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
    let base = caller.word(addr);
    let owner_w = base.field(mutex::OWNER);
    let ceiling_w = base.field(mutex::CEILING);
    let held = d.resolve(caller, addr, KeyKind::PpMutex, scope(flags.contains(MutexFlags::SHARED)))?;
    let key = held.key();
    let mut deadline = d.deadline(timeout);

    loop {
        let mut call = d.wait_call(caller, key);
        call.busy();
        if mutex::owner_of(owner_w.read(p)?) == id {
            return Err(SyncError::Deadlock);
        }
        let ceiling = ceiling_of(ceiling_w.read(p)?)?;
        let loan = CeilingLoan::lend(d, caller.tid, key, ceiling)?;

        let owner = try_take(owner_w, p, id)?;
        if owner == mutex::CONTESTED {
            loan.keep();
            log::trace!("usync: {} took {key} at ceiling {ceiling}", caller.tid);
            return Ok(());
        }
        if mutex::owner_of(owner) == id {
            return Err(SyncError::Deadlock);
        }
        if mode == LockMode::Try {
            return Err(SyncError::WouldBlock);
        }

        {
            let mut inner = call.lock();
            call.enqueue_locked(&mut inner, QueueKind::Shared);
            call.unbusy_locked(&mut inner);
        }
        // Sleep at our own priority; the ceiling is re-lent on the next try.
        drop(loan);
        call.sleep(deadline.as_mut(), true).into_result()?;
    }
}

/// Unlocks a PP mutex owned by the caller.
pub fn unlock<P: Platform>(
    d: &SyncDomain<P>,
    caller: Caller,
    addr: UserAddr,
    flags: MutexFlags,
) -> SyncResult<()> {
    let id = owner_id(caller.tid)?;
    let p = d.platform();
    let owner_w = caller.word(addr).field(mutex::OWNER);
    let owner = owner_w.read(p)?;
    if mutex::owner_of(owner) != id {
        return Err(SyncError::NotOwner);
    }

    let held = d.resolve(caller, addr, KeyKind::PpMutex, scope(flags.contains(MutexFlags::SHARED)))?;
    let key = held.key();
    let mut call = d.wait_call(caller, key);
    call.busy();
    if owner_w.cas(p, owner, mutex::CONTESTED)? != owner {
        log::warn!("usync: {key} owner word changed under its owner {}", caller.tid);
        return Err(SyncError::ProtocolViolation);
    }
    {
        let mut inner = call.lock();
        inner.signal(&key, QueueKind::Shared, 1, p);
        call.unbusy_locked(&mut inner);
    }
    d.pi().lock().pop_ceiling(caller.tid, &key, p);
    Ok(())
}

/// Replaces the ceiling of a PP mutex, waiting for it to become free
/// unless the caller owns it. Returns the previous ceiling and wakes every
/// waiter so each re-checks its priority against the new value.
pub fn set_ceiling<P: Platform>(
    d: &SyncDomain<P>,
    caller: Caller,
    addr: UserAddr,
    ceiling: u32,
) -> SyncResult<u32> {
    ceiling_of(ceiling)?;
    let (kind, flags) = mutex_flags(d, caller, addr)?;
    if kind != MutexKind::Protect {
        return Err(SyncError::InvalidArgument);
    }
    let id = owner_id(caller.tid)?;
    let p = d.platform();
    let base = caller.word(addr);
    let owner_w = base.field(mutex::OWNER);
    let ceiling_w = base.field(mutex::CEILING);
    let held = d.resolve(caller, addr, KeyKind::PpMutex, scope(flags.contains(MutexFlags::SHARED)))?;
    let key = held.key();
    let mut backoff = d.backoff();

    loop {
        let mut call = d.wait_call(caller, key);
        call.busy();
        let saved = ceiling_w.read(p)?;
        let owner = try_take(owner_w, p, id)?;

        let done = if owner == mutex::CONTESTED {
            let stored = ceiling_w.store(p, &mut backoff, ceiling);
            owner_w.cas(p, id | mutex::CONTESTED, mutex::CONTESTED)?;
            stored?;
            true
        } else if mutex::owner_of(owner) == id {
            ceiling_w.store(p, &mut backoff, ceiling)?;
            true
        } else {
            false
        };

        let mut inner = call.lock();
        if done {
            inner.signal(&key, QueueKind::Shared, usize::MAX, p);
            call.unbusy_locked(&mut inner);
            log::debug!("usync: {key} ceiling {saved} -> {ceiling}");
            return Ok(saved);
        }
        call.enqueue_locked(&mut inner, QueueKind::Shared);
        call.unbusy_locked(&mut inner);
        drop(inner);
        call.sleep(None, true).into_result()?;
    }
}
