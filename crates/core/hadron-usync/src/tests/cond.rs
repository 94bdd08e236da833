use std::time::{Duration, Instant};

use super::*;
use crate::error::SyncError;
use crate::platform::Clock;
use crate::timeout::{ClockId, Timeout};
use crate::word::{cond, mutex};

const M: u64 = 0x1000;
const CV: u64 = 0x2000;

fn setup(clock: ClockId) -> Domain {
    let d = domain();
    init_mutex(&d, M, 0, 0);
    d.platform().write(SPACE, at(CV + cond::HAS_WAITERS), 0);
    d.platform().write(SPACE, at(CV + cond::FLAGS), clock.as_raw() << cond::CLOCK_SHIFT);
    d
}

fn has_waiters(d: &Domain) -> u32 {
    d.platform().peek(SPACE, at(CV + cond::HAS_WAITERS))
}

/// Locks the mutex, waits once, and relocks it the way the library does.
fn waiter(d: &Domain, n: u32, timeout: Option<Timeout>) -> std::thread::JoinHandle<Result<(), SyncError>> {
    spawn(d, move |d| {
        d.mutex_lock(caller(n), at(M), None)?;
        let woke = d.cv_wait(caller(n), at(CV), at(M), timeout);
        d.mutex_lock(caller(n), at(M), None)?;
        d.mutex_unlock(caller(n), at(M))?;
        woke
    })
}

#[test]
fn signal_wakes_one_waiter() {
    let d = setup(ClockId::Monotonic);
    let t = waiter(&d, 2, None);
    wait_parked(&d, 2);
    assert_eq!(d.platform().peek(SPACE, at(M)), mutex::UNOWNED);
    assert_eq!(has_waiters(&d), 1);

    assert_eq!(d.cv_signal(caller(1), at(CV)), Ok(1));
    assert_eq!(has_waiters(&d), 0);
    assert_eq!(t.join().unwrap(), Ok(()));
}

#[test]
fn signal_leaves_flag_while_others_wait() {
    let d = setup(ClockId::Monotonic);
    let a = waiter(&d, 2, None);
    wait_parked(&d, 2);
    let b = waiter(&d, 3, None);
    wait_parked(&d, 3);

    assert_eq!(d.cv_signal(caller(1), at(CV)), Ok(1));
    assert_eq!(has_waiters(&d), 1);
    assert_eq!(a.join().unwrap(), Ok(()));
    assert_eq!(d.cv_signal(caller(1), at(CV)), Ok(1));
    assert_eq!(has_waiters(&d), 0);
    assert_eq!(b.join().unwrap(), Ok(()));
}

#[test]
fn broadcast_wakes_everyone() {
    let d = setup(ClockId::Monotonic);
    let waiters: Vec<_> = (2..=4)
        .map(|n| {
            let t = waiter(&d, n, None);
            wait_parked(&d, n);
            t
        })
        .collect();
    assert_eq!(d.cv_broadcast(caller(1), at(CV)), Ok(3));
    assert_eq!(has_waiters(&d), 0);
    for t in waiters {
        assert_eq!(t.join().unwrap(), Ok(()));
    }
}

#[test]
fn signal_racing_expiring_deadlines_counts_each_waiter_once() {
    let d = setup(ClockId::Monotonic);
    for round in 0..50u64 {
        let waiters: Vec<_> = (2..=4u32)
            .map(|n| {
                let budget = Duration::from_micros(40 * (u64::from(n) + round % 4));
                waiter(&d, n, Some(Timeout::relative(budget)))
            })
            .collect();
        let mut woken = 0;
        for _ in 0..3 {
            std::thread::sleep(Duration::from_micros(70));
            woken += d.cv_signal(caller(1), at(CV)).unwrap();
        }
        let results: Vec<_> = waiters.into_iter().map(|t| t.join().unwrap()).collect();
        let ok = results.iter().filter(|r| r.is_ok()).count();
        let timed_out = results.iter().filter(|r| **r == Err(SyncError::TimedOut)).count();
        assert_eq!(ok + timed_out, 3, "round {round}: {results:?}");
        assert_eq!(woken, ok, "round {round}: {results:?}");
    }
    assert_eq!(has_waiters(&d), 0);
    assert_eq!(d.platform().peek(SPACE, at(M)), mutex::UNOWNED);
}

#[test]
fn signal_with_nobody_waiting() {
    let d = setup(ClockId::Monotonic);
    assert_eq!(d.cv_signal(caller(1), at(CV)), Ok(0));
    assert_eq!(d.cv_broadcast(caller(1), at(CV)), Ok(0));
    assert_eq!(has_waiters(&d), 0);
}

#[test]
fn timeout_clears_flag_behind_itself() {
    let d = setup(ClockId::Monotonic);
    let t = waiter(&d, 2, Some(Timeout::relative(Duration::from_millis(30))));
    assert_eq!(t.join().unwrap(), Err(SyncError::TimedOut));
    assert_eq!(has_waiters(&d), 0);
    assert_eq!(d.platform().peek(SPACE, at(M)), mutex::UNOWNED);
}

#[test]
fn deadline_is_measured_on_the_condvar_clock() {
    let d = setup(ClockId::Monotonic);
    let end = d.platform().now(ClockId::Monotonic) + Duration::from_millis(30);
    // Read against the realtime clock this deadline would be long gone.
    let start = Instant::now();
    let t = waiter(&d, 2, Some(Timeout::absolute(ClockId::Realtime, end)));
    assert_eq!(t.join().unwrap(), Err(SyncError::TimedOut));
    assert!(start.elapsed() >= Duration::from_millis(25));
}

#[test]
fn unknown_clock_is_rejected() {
    let d = setup(ClockId::Monotonic);
    d.platform().write(SPACE, at(CV + cond::FLAGS), 5 << cond::CLOCK_SHIFT);
    d.mutex_lock(caller(1), at(M), None).unwrap();
    assert_eq!(d.cv_wait(caller(1), at(CV), at(M), None), Err(SyncError::InvalidArgument));
    // Nothing was released.
    assert_eq!(d.platform().peek(SPACE, at(M)), 1);
}

#[test]
fn interruption_reads_as_a_wakeup() {
    let d = setup(ClockId::Monotonic);
    let t = waiter(&d, 2, None);
    wait_parked(&d, 2);
    d.platform().interrupt(tid(2));
    assert_eq!(t.join().unwrap(), Ok(()));
    assert_eq!(has_waiters(&d), 0);
}

#[test]
fn wait_without_owning_the_mutex() {
    let d = setup(ClockId::Monotonic);
    assert_eq!(d.cv_wait(caller(1), at(CV), at(M), None), Err(SyncError::NotOwner));
    assert_eq!(d.cv_signal(caller(1), at(CV)), Ok(0));
    assert_eq!(has_waiters(&d), 0);
}
