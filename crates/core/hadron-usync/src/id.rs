//! Type-safe identifiers used by the synchronization manager.
//!
//! These newtypes keep thread IDs, address-space handles, shared-object
//! handles and user addresses from being mixed up at compile time.

use core::fmt;

/// Kernel thread identifier.
///
/// The raw value is what a lock owner writes into a mutex word, so it must
/// fit below the contested bit (`0x8000_0000`) and must not be zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ThreadId(u32);

impl ThreadId {
    /// Creates a new `ThreadId`.
    pub const fn new(val: u32) -> Self {
        Self(val)
    }

    /// Returns the raw `u32` value.
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque handle to an address space (one per process).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct SpaceId(u64);

impl SpaceId {
    /// Creates a new `SpaceId`.
    pub const fn new(val: u64) -> Self {
        Self(val)
    }

    /// Returns the raw `u64` value.
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "as{}", self.0)
    }
}

/// Handle to a shared memory object that may be mapped into several
/// address spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ObjectId(u64);

impl ObjectId {
    /// Creates a new `ObjectId`.
    pub const fn new(val: u64) -> Self {
        Self(val)
    }

    /// Returns the raw `u64` value.
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj{}", self.0)
    }
}

/// A virtual address in a user address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct UserAddr(u64);

impl UserAddr {
    /// Creates a new `UserAddr`.
    pub const fn new(val: u64) -> Self {
        Self(val)
    }

    /// Returns the raw address.
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the address `bytes` past this one.
    #[must_use]
    pub const fn offset(self, bytes: u64) -> Self {
        Self(self.0.wrapping_add(bytes))
    }

    /// Returns `true` if the address is aligned for a `u32` access.
    pub const fn is_word_aligned(self) -> bool {
        self.0 % 4 == 0
    }
}

impl fmt::Display for UserAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Scheduling priority of a user thread.
///
/// A larger value is more urgent. Effective priority is the maximum of a
/// thread's base priority and whatever has been lent to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct Priority(u8);

impl Priority {
    /// Least urgent priority.
    pub const MIN: Self = Self(0);
    /// Most urgent priority.
    pub const MAX: Self = Self(u8::MAX);

    /// Creates a new `Priority`.
    pub const fn new(val: u8) -> Self {
        Self(val)
    }

    /// Returns the raw value.
    pub const fn as_u8(self) -> u8 {
        self.0
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}
