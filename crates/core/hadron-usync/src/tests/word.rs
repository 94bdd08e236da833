use std::time::{Duration, Instant};

use super::*;
use crate::domain::Caller;
use crate::error::SyncError;
use crate::id::{ObjectId, SpaceId};
use crate::timeout::Timeout;

const W: u64 = 0x6000;

#[test]
fn mismatch_returns_at_once() {
    let d = domain();
    d.platform().write(SPACE, at(W), 5);
    assert_eq!(d.wait_word(caller(1), at(W), 4, false, None), Err(SyncError::WouldBlock));
    assert_eq!(d.wake_word(caller(2), at(W), usize::MAX, false), Ok(0));
}

#[test]
fn wake_counts_and_limits() {
    let d = domain();
    let sleepers: Vec<_> = (2..=4)
        .map(|n| {
            let t = spawn(&d, move |d| d.wait_word(caller(n), at(W), 0, false, None));
            wait_parked(&d, n);
            t
        })
        .collect();

    assert_eq!(d.wake_word(caller(1), at(W), 2, false), Ok(2));
    assert_eq!(d.wake_word(caller(1), at(W), usize::MAX, false), Ok(1));
    for t in sleepers {
        assert_eq!(t.join().unwrap(), Ok(()));
    }
    assert_eq!(d.wake_word(caller(1), at(W), usize::MAX, false), Ok(0));
}

#[test]
fn timed_wait_lasts_until_the_deadline() {
    let d = domain();
    let start = Instant::now();
    let r = d.wait_word(caller(1), at(W), 0, false, Some(Timeout::relative(Duration::from_millis(30))));
    assert_eq!(r, Err(SyncError::TimedOut));
    let waited = start.elapsed();
    assert!(waited >= Duration::from_millis(30));
    assert!(waited < Duration::from_secs(1), "woke {waited:?} after a 30ms deadline");
}

#[test]
fn wake_racing_expiring_deadlines_counts_each_waiter_once() {
    let d = domain();
    for round in 0..50u64 {
        let sleepers: Vec<_> = (2..=4u32)
            .map(|n| {
                let budget = Duration::from_micros(40 * (u64::from(n) + round % 4));
                spawn(&d, move |d| {
                    d.wait_word(caller(n), at(W), 0, false, Some(Timeout::relative(budget)))
                })
            })
            .collect();
        let mut woken = 0;
        for _ in 0..3 {
            std::thread::sleep(Duration::from_micros(70));
            woken += d.wake_word(caller(1), at(W), 1, false).unwrap();
        }
        let results: Vec<_> = sleepers.into_iter().map(|t| t.join().unwrap()).collect();
        let ok = results.iter().filter(|r| r.is_ok()).count();
        let timed_out = results.iter().filter(|r| **r == Err(SyncError::TimedOut)).count();
        assert_eq!(ok + timed_out, 3, "round {round}: {results:?}");
        assert_eq!(woken, ok, "round {round}: {results:?}");
    }
    assert_eq!(d.wake_word(caller(1), at(W), usize::MAX, false), Ok(0));
}

#[test]
fn private_words_do_not_cross_spaces() {
    let d = domain();
    let t = spawn(&d, |d| d.wait_word(caller(2), at(W), 0, false, None));
    wait_parked(&d, 2);
    let elsewhere = Caller::new(tid(3), SpaceId::new(9));
    assert_eq!(d.wake_word(elsewhere, at(W), 1, false), Ok(0));
    assert_eq!(d.wake_word(caller(3), at(W), 1, false), Ok(1));
    assert_eq!(t.join().unwrap(), Ok(()));
}

#[test]
fn shared_word_meets_across_spaces() {
    let d = domain();
    let obj = ObjectId::new(3);
    let (s1, s2) = (SpaceId::new(1), SpaceId::new(2));
    d.platform().share(s1, at(0x4000), 0x1000, obj, 0x100);
    d.platform().share(s2, at(0x8000), 0x1000, obj, 0x100);

    let b = Caller::new(tid(2), s2);
    let t = spawn(&d, move |d| d.wait_word(b, at(0x8010), 0, true, None));
    wait_parked(&d, 2);
    assert_eq!(d.platform().refs(obj), 1);

    let a = Caller::new(tid(1), s1);
    // Private lookups never see the shared sleeper.
    assert_eq!(d.wake_word(a, at(0x4010), 1, false), Ok(0));
    assert_eq!(d.wake_word(a, at(0x4010), 1, true), Ok(1));
    assert_eq!(t.join().unwrap(), Ok(()));
    assert_eq!(d.platform().refs(obj), 0);
}
