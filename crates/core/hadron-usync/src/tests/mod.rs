//! Host test support and cross-module scenarios.
//!
//! Scenario tests drive a whole [`SyncDomain`] from real threads against
//! [`MockPlatform`](platform::MockPlatform). Each object lives at a fixed
//! address in [`SPACE`]; the test seeds its flags words and then calls the
//! public operations the way the user-mode library would after its fast
//! path failed.


#[cfg(all(not(loom), not(shuttle)))]
mod cond;
#[cfg(all(not(loom), not(shuttle)))]
mod pp;
#[cfg(all(not(loom), not(shuttle)))]
mod word;

#[cfg(all(not(loom), not(shuttle)))]
pub(crate) use support::*;

#[cfg(all(not(loom), not(shuttle)))]
mod support {
    use std::sync::Arc;
    use std::thread::JoinHandle;
    use std::time::{Duration, Instant};

    use super::platform::MockPlatform;
    use crate::config::SyncConfig;
    use crate::domain::{Caller, SyncDomain};
    use crate::id::{SpaceId, ThreadId, UserAddr};
    use crate::word::mutex;

    /// The address space every scenario runs in unless it says otherwise.
    pub(crate) const SPACE: SpaceId = SpaceId::new(1);

    pub(crate) type Domain = Arc<SyncDomain<MockPlatform>>;

    pub(crate) fn domain() -> Domain {
        Arc::new(SyncDomain::new(
            MockPlatform::new(),
            SyncConfig::default().with_chains(16),
        ))
    }

    pub(crate) fn tid(n: u32) -> ThreadId {
        ThreadId::new(n)
    }

    pub(crate) fn caller(n: u32) -> Caller {
        Caller::new(tid(n), SPACE)
    }

    pub(crate) fn at(addr: u64) -> UserAddr {
        UserAddr::new(addr)
    }

    /// Seeds a mutex's flags and ceiling words.
    pub(crate) fn init_mutex(d: &Domain, addr: u64, flags: u32, ceiling: u32) {
        let p = d.platform();
        p.write(SPACE, at(addr), mutex::UNOWNED);
        p.write(SPACE, at(addr + mutex::FLAGS), flags);
        p.write(SPACE, at(addr + mutex::CEILING), ceiling);
    }

    /// Runs `f` on a new thread with its own handle to the domain.
    pub(crate) fn spawn<T, F>(d: &Domain, f: F) -> JoinHandle<T>
    where
        T: Send + 'static,
        F: FnOnce(Domain) -> T + Send + 'static,
    {
        let d = Arc::clone(d);
        std::thread::spawn(move || f(d))
    }

    /// Polls `cond` until it holds, failing the test after five seconds.
    pub(crate) fn wait_until(what: &str, cond: impl Fn() -> bool) {
        let end = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < end, "timed out waiting for {what}");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Waits until thread `n` is asleep in the scheduler.
    pub(crate) fn wait_parked(d: &Domain, n: u32) {
        wait_until(&format!("thread {n} to park"), || d.platform().is_parked(tid(n)));
    }
}
