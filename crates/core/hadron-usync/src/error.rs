//! Error types for synchronization operations.

use core::fmt;

/// A user memory access failed: the address is unmapped, misaligned, or
/// lacks the required permission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fault;

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("bad user address")
    }
}

/// Errors returned by synchronization operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncError {
    /// User memory backing the object was inaccessible.
    Fault,
    /// The caller tried to relock a mutex it already owns (error-checking mode).
    Deadlock,
    /// The caller's priority is above a priority-ceiling mutex's ceiling,
    /// or the ceiling value itself is malformed.
    InvalidCeiling,
    /// Kernel ownership bookkeeping disagrees with the user-visible word.
    ProtocolViolation,
    /// The deadline passed before the object became available.
    TimedOut,
    /// The sleep was interrupted by a signal.
    Interrupted,
    /// A bounded resource (reader count, semaphore count) would overflow.
    LimitExceeded,
    /// A non-blocking attempt found the object unavailable.
    WouldBlock,
    /// The caller does not own the object it tried to release.
    NotOwner,
    /// Flags, timeout or object state were malformed.
    InvalidArgument,
}

impl SyncError {
    /// Returns the POSIX errno the user-mode library reports for this error.
    pub const fn errno(self) -> i32 {
        match self {
            Self::Fault => 14,             // EFAULT
            Self::Deadlock => 35,          // EDEADLK
            Self::InvalidCeiling => 22,    // EINVAL
            Self::ProtocolViolation => 1,  // EPERM
            Self::TimedOut => 110,         // ETIMEDOUT
            Self::Interrupted => 4,        // EINTR
            Self::LimitExceeded => 11,     // EAGAIN
            Self::WouldBlock => 16,        // EBUSY
            Self::NotOwner => 1,           // EPERM
            Self::InvalidArgument => 22,   // EINVAL
        }
    }
}

impl From<Fault> for SyncError {
    fn from(_: Fault) -> Self {
        Self::Fault
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fault => f.write_str("bad user address"),
            Self::Deadlock => f.write_str("resource deadlock avoided"),
            Self::InvalidCeiling => f.write_str("priority above mutex ceiling"),
            Self::ProtocolViolation => f.write_str("lock ownership bookkeeping mismatch"),
            Self::TimedOut => f.write_str("operation timed out"),
            Self::Interrupted => f.write_str("interrupted"),
            Self::LimitExceeded => f.write_str("resource limit exceeded"),
            Self::WouldBlock => f.write_str("resource busy"),
            Self::NotOwner => f.write_str("not the owner"),
            Self::InvalidArgument => f.write_str("invalid argument"),
        }
    }
}

/// Result alias for synchronization operations.
pub type SyncResult<T> = Result<T, SyncError>;
