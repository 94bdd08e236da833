//! Counting semaphore.
//!
//! The count word's top bit tells a poster that someone may be asleep in
//! the kernel. Waiters set it only while the count is zero; a poster that
//! sees it wakes one sleeper and clears it once the queue holds no one
//! else.

use crate::domain::{Caller, SyncDomain};
use crate::error::{SyncError, SyncResult};
use crate::id::UserAddr;
use crate::key::{HeldKey, KeyKind};
use crate::platform::Platform;
use crate::protocol::{LockMode, scope};
use crate::timeout::Timeout;
use crate::waiter::QueueKind;
use crate::word::{SemFlags, sem};

/// Decrements the semaphore, sleeping while it is zero.
pub fn wait<P: Platform>(
    d: &SyncDomain<P>,
    caller: Caller,
    addr: UserAddr,
    timeout: Option<&Timeout>,
    mode: LockMode,
) -> SyncResult<()> {
    let p = d.platform();
    let base = caller.word(addr);
    let count_w = base.field(sem::COUNT);
    let mut deadline = d.deadline(timeout);
    let mut backoff = d.backoff();
    let mut held: Option<HeldKey<'_, P>> = None;

    loop {
        let taken = count_w.update(p, &mut backoff, |c| (sem::count(c) > 0).then(|| c - 1))?;
        if taken.is_ok() {
            return Ok(());
        }
        if mode == LockMode::Try {
            return Err(SyncError::WouldBlock);
        }

        let key = match &held {
            Some(k) => k.key(),
            None => {
                let flags = SemFlags::from_bits_truncate(base.field(sem::FLAGS).read(p)?);
                held.insert(d.resolve(caller, addr, KeyKind::Sem, scope(flags.contains(SemFlags::SHARED)))?)
                    .key()
            }
        };

        let mut call = d.wait_call(caller, key);
        {
            let mut inner = call.busy_locked();
            call.enqueue_locked(&mut inner, QueueKind::Shared);
        }
        let marked = count_w.update(p, &mut backoff, |c| (c == 0).then_some(sem::HAS_WAITERS))?;
        let empty = match marked {
            Ok(_) => true,
            Err(cur) => sem::count(cur) == 0,
        };
        if !empty {
            // Posted meanwhile; dropping the call unlinks us.
            continue;
        }
        call.unbusy();
        call.sleep(deadline.as_mut(), true).into_result()?;
    }
}

/// Increments the semaphore and wakes one sleeper if any.
pub fn post<P: Platform>(d: &SyncDomain<P>, caller: Caller, addr: UserAddr) -> SyncResult<()> {
    let p = d.platform();
    let base = caller.word(addr);
    let count_w = base.field(sem::COUNT);
    let mut backoff = d.backoff();

    let old = count_w
        .update(p, &mut backoff, |c| (sem::count(c) < sem::MAX_COUNT).then(|| c + 1))?
        .map_err(|_| SyncError::LimitExceeded)?;
    if old & sem::HAS_WAITERS == 0 {
        return Ok(());
    }

    let flags = SemFlags::from_bits_truncate(base.field(sem::FLAGS).read(p)?);
    let held = d.resolve(caller, addr, KeyKind::Sem, scope(flags.contains(SemFlags::SHARED)))?;
    let key = held.key();
    let mut call = d.wait_call(caller, key);
    let queued = call.busy_locked().count(&key, QueueKind::Shared);
    if queued <= 1 {
        count_w.clear_bits(p, &mut backoff, sem::HAS_WAITERS)?;
    }
    let mut inner = call.lock();
    inner.signal(&key, QueueKind::Shared, 1, p);
    call.unbusy_locked(&mut inner);
    Ok(())
}
