//! Model-checker compatibility shim.
//!
//! Under `cfg(loom)` or `cfg(shuttle)` test builds, re-exports the checker's
//! atomics and turns spin hints into scheduler yields so that spinning
//! threads let the checker run someone else. Otherwise re-exports
//! `core::sync::atomic` and `core::hint::spin_loop`.

// ---------------------------------------------------------------------------
// Loom mode
// ---------------------------------------------------------------------------

#[cfg(all(test, loom))]
pub(crate) use loom::sync::atomic::{AtomicBool, AtomicU32, Ordering};

#[cfg(all(test, loom))]
#[inline]
pub(crate) fn spin_loop() {
    loom::thread::yield_now();
}

// ---------------------------------------------------------------------------
// Shuttle mode
// ---------------------------------------------------------------------------

#[cfg(all(test, shuttle, not(loom)))]
pub(crate) use shuttle::sync::atomic::{AtomicBool, AtomicU32, Ordering};

#[cfg(all(test, shuttle, not(loom)))]
#[inline]
pub(crate) fn spin_loop() {
    shuttle::thread::yield_now();
}

// ---------------------------------------------------------------------------
// Normal mode
// ---------------------------------------------------------------------------

#[cfg(not(all(test, any(loom, shuttle))))]
pub(crate) use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

#[cfg(not(all(test, any(loom, shuttle))))]
#[inline]
pub(crate) fn spin_loop() {
    core::hint::spin_loop();
}
