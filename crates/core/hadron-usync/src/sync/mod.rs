//! Low-level locking used inside the manager.
//!
//! [`SpinLock`] protects each chain and the PI table. It is held only for
//! short pointer-chasing sections, never across a user-memory access or a
//! sleep.

pub(crate) mod compat;
mod spinlock;

pub use spinlock::{SpinLock, SpinLockGuard};
