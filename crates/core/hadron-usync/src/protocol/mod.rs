//! Protocol algorithms.
//!
//! Each submodule implements one object type on top of the chain table:
//!
//! - [`normal`]: plain mutex
//! - [`pi`]: priority-inheritance mutex
//! - [`pp`]: priority-ceiling mutex
//! - [`cond`]: condition variable
//! - [`rwlock`]: reader-writer lock
//! - [`sem`]: counting semaphore
//! - [`simple`]: futex-style wait/wake on a bare word
//!
//! All of them follow the same shape: resolve the key, try the user-mode
//! fast path with a CAS, and on contention busy the chain, publish the
//! contention in the user word, queue, release busy and sleep.

pub mod cond;
pub mod normal;
pub mod pi;
pub mod pp;
pub mod rwlock;
pub mod sem;
pub mod simple;

use crate::domain::{Caller, SyncDomain};
use crate::error::{SyncError, SyncResult};
use crate::id::UserAddr;
use crate::key::KeyScope;
use crate::platform::Platform;
use crate::timeout::Timeout;
use crate::word::{MutexFlags, mutex};

/// Whether an acquire may sleep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Sleep until acquired, the deadline passes or a signal arrives.
    Block,
    /// Fail with [`SyncError::WouldBlock`] instead of sleeping.
    Try,
}

/// Mutex protocol selected by the flags word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexKind {
    /// Plain mutex.
    Normal,
    /// Priority inheritance.
    Inherit,
    /// Priority ceiling.
    Protect,
}

/// Reads and validates a mutex's flags word.
pub fn mutex_flags<P: Platform>(
    d: &SyncDomain<P>,
    caller: Caller,
    addr: UserAddr,
) -> SyncResult<(MutexKind, MutexFlags)> {
    let raw = caller.word(addr).field(mutex::FLAGS).read(d.platform())?;
    let flags = MutexFlags::from_bits(raw).ok_or(SyncError::InvalidArgument)?;
    let kind = match (
        flags.contains(MutexFlags::PRIO_INHERIT),
        flags.contains(MutexFlags::PRIO_PROTECT),
    ) {
        (false, false) => MutexKind::Normal,
        (true, false) => MutexKind::Inherit,
        (false, true) => MutexKind::Protect,
        (true, true) => return Err(SyncError::InvalidArgument),
    };
    Ok((kind, flags))
}

/// Returns the key scope a `SHARED` bit asks for.
pub(crate) fn scope(shared: bool) -> KeyScope {
    if shared {
        KeyScope::Shared
    } else {
        KeyScope::Private
    }
}

/// Locks a mutex of any protocol.
pub fn mutex_lock<P: Platform>(
    d: &SyncDomain<P>,
    caller: Caller,
    addr: UserAddr,
    timeout: Option<&Timeout>,
    mode: LockMode,
) -> SyncResult<()> {
    let (kind, flags) = mutex_flags(d, caller, addr)?;
    match kind {
        MutexKind::Normal => normal::lock(d, caller, addr, flags, timeout, mode),
        MutexKind::Inherit => pi::lock(d, caller, addr, flags, timeout, mode),
        MutexKind::Protect => pp::lock(d, caller, addr, flags, timeout, mode),
    }
}

/// Unlocks a mutex of any protocol.
pub fn mutex_unlock<P: Platform>(d: &SyncDomain<P>, caller: Caller, addr: UserAddr) -> SyncResult<()> {
    let (kind, flags) = mutex_flags(d, caller, addr)?;
    match kind {
        MutexKind::Normal => normal::unlock(d, caller, addr, flags),
        MutexKind::Inherit => pi::unlock(d, caller, addr, flags),
        MutexKind::Protect => pp::unlock(d, caller, addr, flags),
    }
}
