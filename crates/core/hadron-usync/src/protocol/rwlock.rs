//! Reader-writer lock.
//!
//! The state word packs the writer bit, both waiter bits and the reader
//! count. Readers sleep in the chain's shared queue and writers in the
//! exclusive queue, so waking every reader never disturbs a writer. The
//! blocked-reader and blocked-writer counters live in user memory next to
//! the state word; the last sleeper of a kind clears its waiter bit.
//!
//! By default a waiting writer holds off new readers and is woken first.
//! `PREFER_READER` flips both.

use crate::domain::{Caller, SyncDomain};
use crate::error::{SyncError, SyncResult};
use crate::id::UserAddr;
use crate::key::KeyKind;
use crate::platform::Platform;
use crate::protocol::{LockMode, scope};
use crate::timeout::Timeout;
use crate::waiter::QueueKind;
use crate::word::{RwFlags, RwState, UserWord, rwlock};

fn flags<P: Platform>(d: &SyncDomain<P>, base: UserWord) -> SyncResult<RwFlags> {
    Ok(RwFlags::from_bits_truncate(base.field(rwlock::FLAGS).read(d.platform())?))
}

/// Takes a read hold.
pub fn rdlock<P: Platform>(
    d: &SyncDomain<P>,
    caller: Caller,
    addr: UserAddr,
    timeout: Option<&Timeout>,
    mode: LockMode,
) -> SyncResult<()> {
    let p = d.platform();
    let base = caller.word(addr);
    let state_w = base.field(rwlock::STATE);
    let readers_w = base.field(rwlock::BLOCKED_READERS);
    let flags = flags(d, base)?;
    let held = d.resolve(caller, addr, KeyKind::RwLock, scope(flags.contains(RwFlags::SHARED)))?;
    let key = held.key();
    let mut deadline = d.deadline(timeout);
    let mut backoff = d.backoff();

    let mut blockers = RwState::WRITE_OWNER;
    if !flags.contains(RwFlags::PREFER_READER) {
        blockers |= RwState::WRITE_WAITERS;
    }
    let blocked = |state: u32| state & blockers.bits() != 0;
    let read_waiters = RwState::READ_WAITERS.bits();

    loop {
        let mut state = state_w.read(p)?;
        while !blocked(state) {
            if rwlock::readers(state) == rwlock::MAX_READERS {
                return Err(SyncError::LimitExceeded);
            }
            let old = state_w.cas(p, state, state + 1)?;
            if old == state {
                return Ok(());
            }
            state = old;
            backoff.fail(p);
        }
        if mode == LockMode::Try {
            return Err(SyncError::WouldBlock);
        }

        let mut call = d.wait_call(caller, key);
        call.busy();

        // Re-read under busy and publish READ_WAITERS while still blocked.
        let mut state = match state_w.update(p, &mut backoff, |s| {
            (blocked(s) && s & read_waiters == 0).then_some(s | read_waiters)
        })? {
            Ok(old) => old | read_waiters,
            Err(cur) => cur,
        };
        if !blocked(state) {
            continue;
        }

        readers_w.modify(p, &mut backoff, |n| n.wrapping_add(1))?;
        let mut result = Ok(());
        while blocked(state) {
            {
                let mut inner = call.lock();
                call.enqueue_locked(&mut inner, QueueKind::Shared);
                call.unbusy_locked(&mut inner);
            }
            let wake = call.sleep(deadline.as_mut(), true);
            call.reset();
            call.busy();
            if let Err(e) = wake.into_result() {
                result = Err(e);
                break;
            }
            match state_w.read(p) {
                Ok(s) => state = s,
                Err(f) => {
                    result = Err(f.into());
                    break;
                }
            }
        }

        let before = readers_w.modify(p, &mut backoff, |n| n.wrapping_sub(1))?;
        if before == 1 {
            state_w.clear_bits(p, &mut backoff, read_waiters)?;
        }
        call.unbusy();
        result?;
    }
}

/// Takes the write hold.
pub fn wrlock<P: Platform>(
    d: &SyncDomain<P>,
    caller: Caller,
    addr: UserAddr,
    timeout: Option<&Timeout>,
    mode: LockMode,
) -> SyncResult<()> {
    let p = d.platform();
    let base = caller.word(addr);
    let state_w = base.field(rwlock::STATE);
    let readers_w = base.field(rwlock::BLOCKED_READERS);
    let writers_w = base.field(rwlock::BLOCKED_WRITERS);
    let flags = flags(d, base)?;
    let held = d.resolve(caller, addr, KeyKind::RwLock, scope(flags.contains(RwFlags::SHARED)))?;
    let key = held.key();
    let mut deadline = d.deadline(timeout);
    let mut backoff = d.backoff();

    let write_owner = RwState::WRITE_OWNER.bits();
    let write_waiters = RwState::WRITE_WAITERS.bits();
    let owned = |s: u32| s & write_owner != 0 || rwlock::readers(s) != 0;

    loop {
        let mut state = state_w.read(p)?;
        while !owned(state) {
            let old = state_w.cas(p, state, state | write_owner)?;
            if old == state {
                return Ok(());
            }
            state = old;
            backoff.fail(p);
        }
        if mode == LockMode::Try {
            return Err(SyncError::WouldBlock);
        }

        let mut call = d.wait_call(caller, key);
        call.busy();

        let mut state = match state_w.update(p, &mut backoff, |s| {
            (owned(s) && s & write_waiters == 0).then_some(s | write_waiters)
        })? {
            Ok(old) => old | write_waiters,
            Err(cur) => cur,
        };
        if !owned(state) {
            continue;
        }

        writers_w.modify(p, &mut backoff, |n| n.wrapping_add(1))?;
        let mut result = Ok(());
        while owned(state) {
            {
                let mut inner = call.lock();
                call.enqueue_locked(&mut inner, QueueKind::Exclusive);
                call.unbusy_locked(&mut inner);
            }
            let wake = call.sleep(deadline.as_mut(), true);
            call.reset();
            call.busy();
            if let Err(e) = wake.into_result() {
                result = Err(e);
                break;
            }
            match state_w.read(p) {
                Ok(s) => state = s,
                Err(f) => {
                    result = Err(f.into());
                    break;
                }
            }
        }

        let before = writers_w.modify(p, &mut backoff, |n| n.wrapping_sub(1))?;
        let mut blocked_readers = 0;
        if before == 1 {
            state_w.clear_bits(p, &mut backoff, write_waiters)?;
            blocked_readers = readers_w.read(p)?;
        }

        if let Err(e) = result {
            // A writer giving up may be all that kept readers asleep.
            let s = state_w.read(p)?;
            if s & (write_owner | write_waiters) == 0 && blocked_readers != 0 {
                let mut inner = call.lock();
                inner.signal(&key, QueueKind::Shared, usize::MAX, p);
                call.unbusy_locked(&mut inner);
            }
            return Err(e);
        }
        call.unbusy();
    }
}

/// Releases the write hold or one read hold.
pub fn unlock<P: Platform>(d: &SyncDomain<P>, caller: Caller, addr: UserAddr) -> SyncResult<()> {
    let p = d.platform();
    let base = caller.word(addr);
    let state_w = base.field(rwlock::STATE);
    let flags = flags(d, base)?;
    let mut backoff = d.backoff();
    let write_owner = RwState::WRITE_OWNER.bits();

    let mut state = state_w.read(p)?;
    if state & write_owner != 0 {
        loop {
            let old = state_w.cas(p, state, state & !write_owner)?;
            if old == state {
                break;
            }
            if old & write_owner == 0 {
                return Err(SyncError::NotOwner);
            }
            state = old;
            backoff.fail(p);
        }
    } else if rwlock::readers(state) != 0 {
        loop {
            let old = state_w.cas(p, state, state - 1)?;
            if old == state {
                break;
            }
            if rwlock::readers(old) == 0 {
                return Err(SyncError::NotOwner);
            }
            state = old;
            backoff.fail(p);
        }
    } else {
        return Err(SyncError::NotOwner);
    }

    let bits = RwState::from_bits_retain(state);
    let writers = bits.contains(RwState::WRITE_WAITERS).then_some((1, QueueKind::Exclusive));
    let readers = bits
        .contains(RwState::READ_WAITERS)
        .then_some((usize::MAX, QueueKind::Shared));
    let wake = if flags.contains(RwFlags::PREFER_READER) {
        readers.or(writers)
    } else {
        writers.or(readers)
    };
    let Some((n, queue)) = wake else {
        return Ok(());
    };

    let held = d.resolve(caller, addr, KeyKind::RwLock, scope(flags.contains(RwFlags::SHARED)))?;
    let key = held.key();
    let mut call = d.wait_call(caller, key);
    let mut inner = call.busy_locked();
    inner.signal(&key, queue, n, p);
    call.unbusy_locked(&mut inner);
    Ok(())
}
