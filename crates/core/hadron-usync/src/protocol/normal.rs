//! Plain mutex.
//!
//! The owner word moves `UNOWNED → tid → tid|CONTESTED → UNOWNED`. User
//! mode handles the uncontested cases alone; the kernel only sees a lock
//! call once the CAS from `UNOWNED` has failed and an unlock call once the
//! contested bit is set. One release wakes one waiter, in no particular
//! order of priority.

use crate::domain::{Caller, SyncDomain};
use crate::error::{SyncError, SyncResult};
use crate::id::UserAddr;
use crate::key::{HeldKey, KeyKind};
use crate::platform::Platform;
use crate::protocol::{LockMode, MutexKind, mutex_flags, scope};
use crate::timeout::Timeout;
use crate::waiter::QueueKind;
use crate::word::{MutexFlags, mutex, owner_id};

/// Locks a plain mutex.
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
    let word = caller.word(addr).field(mutex::OWNER);
    let mut deadline = d.deadline(timeout);
    let mut backoff = d.backoff();
    let mut held: Option<HeldKey<'_, P>> = None;

    loop {
        let owner = word.cas(p, mutex::UNOWNED, id)?;
        if owner == mutex::UNOWNED {
            return Ok(());
        }

        // Released by its last owner while waiters remain: take it and keep
        // the contested bit so our own unlock wakes them.
        if owner == mutex::CONTESTED {
            if word.cas(p, mutex::CONTESTED, id | mutex::CONTESTED)? == mutex::CONTESTED {
                return Ok(());
            }
            backoff.fail(p);
            continue;
        }

        if mutex::owner_of(owner) == id && flags.contains(MutexFlags::ERROR_CHECK) {
            return Err(SyncError::Deadlock);
        }
        if mode == LockMode::Try {
            return Err(SyncError::WouldBlock);
        }

        let key = match &held {
            Some(k) => k.key(),
            None => held
                .insert(d.resolve(caller, addr, KeyKind::Mutex, scope(flags.contains(MutexFlags::SHARED)))?)
                .key(),
        };
        log::trace!("usync: {} contends {key} held by {}", caller.tid, mutex::owner_of(owner));

        let mut call = d.wait_call(caller, key);
        {
            let mut inner = call.busy_locked();
            call.enqueue_locked(&mut inner, QueueKind::Shared);
        }

        // Publish the contention. If the owner changed meanwhile, retry
        // from the top instead of sleeping on a stale view.
        let old = word.cas(p, owner, owner | mutex::CONTESTED)?;
        call.unbusy();
        if old == owner {
            call.sleep(deadline.as_mut(), true).into_result()?;
        } else {
            call.dequeue();
        }
    }
}

/// Unlocks a plain mutex owned by the caller.
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

    let held = d.resolve(caller, addr, KeyKind::Mutex, scope(flags.contains(MutexFlags::SHARED)))?;
    let key = held.key();
    let mut call = d.wait_call(caller, key);

    // Inserting requires the busy flag, so a count taken under it cannot
    // miss a waiter. A concurrent timeout may still shrink the queue, which
    // only costs a spurious trip through this path.
    let count = call.busy_locked().count(&key, QueueKind::Shared);
    let new = if count > 1 {
        mutex::CONTESTED
    } else {
        mutex::UNOWNED
    };
    let old = word.cas(p, owner, new)?;
    {
        let mut inner = call.lock();
        inner.signal(&key, QueueKind::Shared, 1, p);
        call.unbusy_locked(&mut inner);
    }

    if old != owner {
        log::warn!("usync: {key} owner word changed under its owner {}", caller.tid);
        return Err(SyncError::ProtocolViolation);
    }
    Ok(())
}

/// Wakes one waiter of a plain mutex that user mode released while
/// contested, dropping the contested bit if no one else waits.
pub fn wake<P: Platform>(d: &SyncDomain<P>, caller: Caller, addr: UserAddr) -> SyncResult<()> {
    let (kind, flags) = mutex_flags(d, caller, addr)?;
    if kind != MutexKind::Normal {
        return Err(SyncError::InvalidArgument);
    }
    let p = d.platform();
    let word = caller.word(addr).field(mutex::OWNER);
    if mutex::owner_of(word.read(p)?) != 0 {
        return Ok(());
    }

    let held = d.resolve(caller, addr, KeyKind::Mutex, scope(flags.contains(MutexFlags::SHARED)))?;
    let key = held.key();
    let mut call = d.wait_call(caller, key);
    let count = call.busy_locked().count(&key, QueueKind::Shared);

    let owner = if count <= 1 {
        let mut backoff = d.backoff();
        match word.update(p, &mut backoff, |w| (w == mutex::CONTESTED).then_some(mutex::UNOWNED))? {
            Ok(_) => mutex::UNOWNED,
            Err(cur) => cur,
        }
    } else {
        word.read(p)?
    };

    let mut inner = call.lock();
    if count != 0 && mutex::owner_of(owner) == 0 {
        inner.signal(&key, QueueKind::Shared, 1, p);
    }
    call.unbusy_locked(&mut inner);
    Ok(())
}
