//! User-level synchronization object manager for the Hadron kernel.
//!
//! This crate backs the user-mode threading library's mutexes, condition
//! variables, reader-writer locks and semaphores. A synchronization object
//! is a handful of `u32` words in the caller's address space; the manager
//! resolves the address into a canonical [`SyncKey`](key::SyncKey), routes
//! it to one shard of a [`ChainTable`](chain::ChainTable) and parks the
//! caller on a wait queue there when the user-mode fast path fails.
//!
//! Three mutex protocols are provided: plain, priority inheritance (PI) and
//! priority ceiling (PP). PI ownership is tracked in [`pi`] and priority is
//! lent along chains of transitively blocked threads.
//!
//! Everything the manager needs from the rest of the kernel (user memory
//! access, the scheduler, the shared-object registry and clocks) comes in
//! through the traits in [`platform`], so the whole crate runs on the host
//! under `cargo test`, shuttle and loom.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

extern crate alloc;

pub mod chain;
pub mod config;
pub mod domain;
pub mod error;
pub mod id;
pub mod key;
pub mod pi;
pub mod platform;
pub mod protocol;
pub mod sync;
pub mod timeout;
pub mod wait;
pub mod waiter;
pub mod word;

#[cfg(test)]
mod tests;

pub use config::SyncConfig;
pub use domain::{Caller, SyncDomain};
pub use error::{Fault, SyncError};
pub use id::{ObjectId, Priority, SpaceId, ThreadId, UserAddr};
pub use timeout::{ClockId, Timeout};
