//! Futex-style wait/wake on a bare word.

use crate::domain::{Caller, SyncDomain};
use crate::error::{SyncError, SyncResult};
use crate::id::UserAddr;
use crate::key::KeyKind;
use crate::platform::Platform;
use crate::protocol::scope;
use crate::timeout::Timeout;
use crate::waiter::QueueKind;

/// Sleeps while the word at `addr` holds `expected`.
///
/// The waiter is queued before the word is read, so a waker that changes
/// the word and then calls [`wake`] cannot slip between the two. Returns
/// [`SyncError::WouldBlock`] if the word already differs.
pub fn wait<P: Platform>(
    d: &SyncDomain<P>,
    caller: Caller,
    addr: UserAddr,
    expected: u32,
    shared: bool,
    timeout: Option<&Timeout>,
) -> SyncResult<()> {
    let p = d.platform();
    let held = d.resolve(caller, addr, KeyKind::Legacy, scope(shared))?;
    let key = held.key();
    let mut call = d.wait_call(caller, key);
    {
        let mut inner = call.busy_locked();
        call.enqueue_locked(&mut inner, QueueKind::Shared);
    }
    let current = caller.word(addr).read(p)?;
    call.unbusy();
    if current != expected {
        call.dequeue();
        return Err(SyncError::WouldBlock);
    }
    let mut deadline = d.deadline(timeout);
    call.sleep(deadline.as_mut(), true).into_result()
}

/// Wakes up to `n` sleepers on the word at `addr`. Returns how many woke.
pub fn wake<P: Platform>(
    d: &SyncDomain<P>,
    caller: Caller,
    addr: UserAddr,
    n: usize,
    shared: bool,
) -> SyncResult<usize> {
    let held = d.resolve(caller, addr, KeyKind::Legacy, scope(shared))?;
    let key = held.key();
    let woken = d
        .chains()
        .chain_for(&key)
        .lock()
        .signal(&key, QueueKind::Shared, n, d.platform());
    Ok(woken)
}
