//! Synchronization object identity.
//!
//! A [`SyncKey`] names a synchronization object independently of which
//! thread, or which mapping, names it. Private objects are keyed by
//! `(address space, address)`; shared objects by `(memory object, offset)`,
//! so two processes mapping the same page at different addresses still meet
//! on the same wait queue.
//!
//! [`resolve`] produces a [`HeldKey`]: an RAII handle that owns the
//! shared-object reference (if any) and drops it exactly once.

use core::fmt;

use crate::error::Fault;
use crate::id::{ObjectId, SpaceId, UserAddr};
use crate::platform::SharedRegistry;

/// Multiplier for Fibonacci hashing of key identities.
const GOLDEN_RATIO: u64 = 0x9E37_79B9_7F4A_7C15;

/// Which kind of object a key names.
///
/// Part of key equality, so a plain mutex and a PI mutex at the same address
/// never share queues or PI state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum KeyKind {
    /// Plain mutex.
    Mutex,
    /// Priority-inheritance mutex.
    PiMutex,
    /// Priority-ceiling mutex.
    PpMutex,
    /// Condition variable.
    Cond,
    /// Reader-writer lock.
    RwLock,
    /// Counting semaphore.
    Sem,
    /// Bare word used with wait/wake.
    Legacy,
}

/// Sharing scope requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyScope {
    /// The object is private to the caller's address space.
    Private,
    /// The object may be mapped by other address spaces.
    Shared,
    /// Shared if the backing mapping is shared, private otherwise.
    Auto,
}

/// Location part of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum KeyIdentity {
    /// `(address space, address)`.
    Private {
        /// Owning address space.
        space: SpaceId,
        /// Address within it.
        addr: UserAddr,
    },
    /// `(memory object, offset)`.
    Shared {
        /// Backing memory object.
        object: ObjectId,
        /// Byte offset within it.
        offset: u64,
    },
}

impl KeyIdentity {
    fn hash_input(self) -> u64 {
        match self {
            Self::Private { space, addr } => space.as_u64().wrapping_add(addr.as_u64()),
            Self::Shared { object, offset } => object.as_u64().wrapping_add(offset),
        }
    }
}

/// Canonical identity of a synchronization object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SyncKey {
    kind: KeyKind,
    identity: KeyIdentity,
    hash: u32,
}

impl SyncKey {
    /// Builds a key and precomputes its bucket hash.
    pub fn new(kind: KeyKind, identity: KeyIdentity) -> Self {
        let n = identity.hash_input();
        #[allow(clippy::cast_possible_truncation)]
        let hash = (n.wrapping_mul(GOLDEN_RATIO) >> 32) as u32;
        Self {
            kind,
            identity,
            hash,
        }
    }

    /// Returns the object kind.
    pub fn kind(&self) -> KeyKind {
        self.kind
    }

    /// Returns the location part.
    pub fn identity(&self) -> KeyIdentity {
        self.identity
    }

    /// Returns the precomputed bucket selector.
    pub fn hash(&self) -> u32 {
        self.hash
    }

    /// Returns `true` for a cross-address-space key.
    pub fn is_shared(&self) -> bool {
        matches!(self.identity, KeyIdentity::Shared { .. })
    }
}

impl fmt::Display for SyncKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.identity {
            KeyIdentity::Private { space, addr } => write!(f, "{:?}@{space}:{addr}", self.kind),
            KeyIdentity::Shared { object, offset } => {
                write!(f, "{:?}@{object}+{offset:#x}", self.kind)
            }
        }
    }
}

/// A resolved key that owns its shared-object reference.
///
/// Dropping it releases the reference, so every exit path of a protocol
/// call, error paths included, balances the registry.
pub struct HeldKey<'r, R: SharedRegistry + ?Sized> {
    key: SyncKey,
    registry: &'r R,
}

impl<R: SharedRegistry + ?Sized> HeldKey<'_, R> {
    /// Returns the key.
    pub fn key(&self) -> SyncKey {
        self.key
    }

    /// Releases the key. Equivalent to dropping it.
    pub fn release(self) {}
}

impl<R: SharedRegistry + ?Sized> Drop for HeldKey<'_, R> {
    fn drop(&mut self) {
        if let KeyIdentity::Shared { object, .. } = self.key.identity {
            self.registry.unref_object(object);
        }
    }
}

impl<R: SharedRegistry + ?Sized> fmt::Debug for HeldKey<'_, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HeldKey").field(&self.key).finish()
    }
}

/// Resolves `addr` in `space` into a canonical key.
///
/// Private keys are formed directly. Shared and auto-detected keys go
/// through the registry, which may fault if `addr` is unmapped; a shared
/// key takes a reference on its backing object.
pub fn resolve<'r, R: SharedRegistry + ?Sized>(
    registry: &'r R,
    space: SpaceId,
    addr: UserAddr,
    kind: KeyKind,
    scope: KeyScope,
) -> Result<HeldKey<'r, R>, Fault> {
    if !addr.is_word_aligned() {
        return Err(Fault);
    }

    let identity = match scope {
        KeyScope::Private => KeyIdentity::Private { space, addr },
        KeyScope::Shared | KeyScope::Auto => {
            let mapping = registry.lookup_shared(space, addr)?;
            if scope == KeyScope::Auto && !mapping.shared {
                KeyIdentity::Private { space, addr }
            } else {
                registry.ref_object(mapping.object);
                log::debug!(
                    "usync: {addr} in {space} resolves to {}+{:#x}",
                    mapping.object,
                    mapping.offset
                );
                KeyIdentity::Shared {
                    object: mapping.object,
                    offset: mapping.offset,
                }
            }
        }
    };

    Ok(HeldKey {
        key: SyncKey::new(kind, identity),
        registry,
    })
}
