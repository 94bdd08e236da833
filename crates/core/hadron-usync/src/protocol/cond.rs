//! Condition variable.
//!
//! The has-waiters word lets user mode skip the kernel on signal when
//! nobody sleeps. A waiter sets it before dropping the mutex; whoever
//! drains the queue clears it.

use crate::domain::{Caller, SyncDomain};
use crate::error::{SyncError, SyncResult};
use crate::id::UserAddr;
use crate::key::KeyKind;
use crate::platform::Platform;
use crate::protocol::{self, scope};
use crate::timeout::{ClockId, Timeout};
use crate::wait::Wake;
use crate::waiter::QueueKind;
use crate::word::{CondFlags, cond};

/// Releases `mutex` and sleeps on the condition variable at `cv`.
///
/// Deadlines are measured on the clock named in the condition variable's
/// flags word.
pub fn wait<P: Platform>(
    d: &SyncDomain<P>,
    caller: Caller,
    cv: UserAddr,
    mutex: UserAddr,
    timeout: Option<&Timeout>,
) -> SyncResult<()> {
    let p = d.platform();
    let base = caller.word(cv);
    let has_waiters = base.field(cond::HAS_WAITERS);
    let flags = CondFlags::from_bits_retain(base.field(cond::FLAGS).read(p)?);
    let clock = ClockId::from_raw(flags.clock_raw())?;
    let held = d.resolve(caller, cv, KeyKind::Cond, scope(flags.contains(CondFlags::SHARED)))?;
    let key = held.key();

    let mut call = d.wait_call(caller, key);
    {
        let mut inner = call.busy_locked();
        call.enqueue_locked(&mut inner, QueueKind::Shared);
    }
    if has_waiters.read(p)? == 0 {
        has_waiters.cas(p, 0, 1)?;
    }
    call.unbusy();

    protocol::mutex_unlock(d, caller, mutex)?;

    let timeout = timeout.map(|t| Timeout { clock, ..*t });
    let mut deadline = d.deadline(timeout.as_ref());
    let wake = call.sleep(deadline.as_mut(), true);
    if wake == Wake::Woken {
        return Ok(());
    }

    // We unlinked ourselves. If that drained the queue, nobody else will
    // clear the flag.
    call.reset();
    let drained = call.busy_locked().count(&key, QueueKind::Shared) == 0;
    if drained {
        has_waiters.store(p, &mut d.backoff(), 0)?;
    }
    call.unbusy();

    match wake {
        Wake::TimedOut => Err(SyncError::TimedOut),
        Wake::Woken | Wake::Interrupted => Ok(()),
    }
}

/// Wakes up to `n` waiters of the condition variable at `cv`. Returns how
/// many were woken.
pub fn signal<P: Platform>(d: &SyncDomain<P>, caller: Caller, cv: UserAddr, n: usize) -> SyncResult<usize> {
    let p = d.platform();
    let base = caller.word(cv);
    let flags = CondFlags::from_bits_retain(base.field(cond::FLAGS).read(p)?);
    let held = d.resolve(caller, cv, KeyKind::Cond, scope(flags.contains(CondFlags::SHARED)))?;
    let key = held.key();

    let mut call = d.wait_call(caller, key);
    let (count, woken) = {
        let mut inner = call.busy_locked();
        let count = inner.count(&key, QueueKind::Shared);
        (count, inner.signal(&key, QueueKind::Shared, n, p))
    };
    if count <= woken {
        base.field(cond::HAS_WAITERS).store(p, &mut d.backoff(), 0)?;
    }
    call.unbusy();
    Ok(woken)
}
