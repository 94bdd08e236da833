use super::*;
use crate::error::SyncError;
use crate::id::Priority;
use crate::word::{MutexFlags, mutex};

const M: u64 = 0x1000;
const M2: u64 = 0x1100;

fn pp_mutex(d: &Domain, addr: u64, ceiling: u32) {
    init_mutex(d, addr, MutexFlags::PRIO_PROTECT.bits(), ceiling);
}

#[test]
fn owner_runs_at_the_ceiling() {
    let d = domain();
    pp_mutex(&d, M, 40);
    let p = d.platform();
    p.set_base(tid(1), 10);

    d.mutex_lock(caller(1), at(M), None).unwrap();
    assert_eq!(p.peek(SPACE, at(M)), 1 | mutex::CONTESTED);
    assert_eq!(d.effective_priority(tid(1)), Priority::new(40));
    assert_eq!(p.lent(tid(1)), Some(Priority::new(40)));

    d.mutex_unlock(caller(1), at(M)).unwrap();
    assert_eq!(p.peek(SPACE, at(M)), mutex::CONTESTED);
    assert_eq!(d.effective_priority(tid(1)), Priority::new(10));
    assert_eq!(p.lent(tid(1)), None);
}

#[test]
fn priority_above_ceiling_is_refused() {
    let d = domain();
    pp_mutex(&d, M, 5);
    d.platform().set_base(tid(1), 10);
    assert_eq!(d.mutex_lock(caller(1), at(M), None), Err(SyncError::InvalidCeiling));
    assert_eq!(d.platform().peek(SPACE, at(M)), mutex::UNOWNED);

    pp_mutex(&d, M2, 300);
    assert_eq!(d.mutex_lock(caller(1), at(M2), None), Err(SyncError::InvalidCeiling));
    assert_eq!(d.platform().lent(tid(1)), None);
}

#[test]
fn nested_ceilings_unwind() {
    let d = domain();
    pp_mutex(&d, M, 30);
    pp_mutex(&d, M2, 50);
    d.platform().set_base(tid(1), 1);

    d.mutex_lock(caller(1), at(M), None).unwrap();
    d.mutex_lock(caller(1), at(M2), None).unwrap();
    assert_eq!(d.effective_priority(tid(1)), Priority::new(50));
    d.mutex_unlock(caller(1), at(M2)).unwrap();
    assert_eq!(d.effective_priority(tid(1)), Priority::new(30));

    // Running at 50 already rules out a mutex with ceiling 30.
    d.mutex_lock(caller(1), at(M2), None).unwrap();
    d.mutex_unlock(caller(1), at(M)).unwrap();
    assert_eq!(d.mutex_lock(caller(1), at(M), None), Err(SyncError::InvalidCeiling));
    d.mutex_unlock(caller(1), at(M2)).unwrap();
    assert_eq!(d.effective_priority(tid(1)), Priority::new(1));
}

#[test]
fn relock_and_trylock() {
    let d = domain();
    pp_mutex(&d, M, 20);
    d.mutex_lock(caller(1), at(M), None).unwrap();
    assert_eq!(d.mutex_lock(caller(1), at(M), None), Err(SyncError::Deadlock));
    assert_eq!(d.mutex_trylock(caller(2), at(M)), Err(SyncError::WouldBlock));
    assert_eq!(d.platform().lent(tid(2)), None);
    // The failed relock withdrew only its own ceiling.
    assert_eq!(d.effective_priority(tid(1)), Priority::new(20));
}

#[test]
fn failed_relock_after_raising_the_ceiling_keeps_the_running_ceiling() {
    let d = domain();
    pp_mutex(&d, M, 30);
    d.platform().set_base(tid(1), 5);
    d.mutex_lock(caller(1), at(M), None).unwrap();
    assert_eq!(d.mutex_set_ceiling(caller(1), at(M), 40), Ok(30));
    assert_eq!(d.effective_priority(tid(1)), Priority::new(30));

    assert_eq!(d.mutex_lock(caller(1), at(M), None), Err(SyncError::Deadlock));
    assert_eq!(d.mutex_trylock(caller(1), at(M)), Err(SyncError::Deadlock));
    assert_eq!(d.effective_priority(tid(1)), Priority::new(30));
    assert_eq!(d.platform().lent(tid(1)), Some(Priority::new(30)));

    d.mutex_unlock(caller(1), at(M)).unwrap();
    assert_eq!(d.effective_priority(tid(1)), Priority::new(5));
    assert_eq!(d.platform().lent(tid(1)), None);
}

#[test]
fn sleeper_gets_the_mutex_on_unlock() {
    let d = domain();
    pp_mutex(&d, M, 40);
    d.platform().set_base(tid(2), 7);
    d.mutex_lock(caller(1), at(M), None).unwrap();
    let b = spawn(&d, |d| {
        d.mutex_lock(caller(2), at(M), None)?;
        let running = d.effective_priority(tid(2));
        d.mutex_unlock(caller(2), at(M))?;
        Ok::<_, SyncError>(running)
    });
    wait_parked(&d, 2);
    assert_eq!(d.platform().lent(tid(2)), None);

    d.mutex_unlock(caller(1), at(M)).unwrap();
    assert_eq!(b.join().unwrap(), Ok(Priority::new(40)));
    assert_eq!(d.effective_priority(tid(2)), Priority::new(7));
}

#[test]
fn set_ceiling_on_free_and_owned_mutex() {
    let d = domain();
    pp_mutex(&d, M, 40);
    let p = d.platform();

    assert_eq!(d.mutex_set_ceiling(caller(1), at(M), 60), Ok(40));
    assert_eq!(p.peek(SPACE, at(M + mutex::CEILING)), 60);
    assert_eq!(p.peek(SPACE, at(M)), mutex::CONTESTED);

    d.mutex_lock(caller(1), at(M), None).unwrap();
    assert_eq!(d.mutex_set_ceiling(caller(1), at(M), 45), Ok(60));
    assert_eq!(p.peek(SPACE, at(M)), 1 | mutex::CONTESTED);
    d.mutex_unlock(caller(1), at(M)).unwrap();

    assert_eq!(d.mutex_set_ceiling(caller(1), at(M), 256), Err(SyncError::InvalidCeiling));
    init_mutex(&d, M2, 0, 0);
    assert_eq!(d.mutex_set_ceiling(caller(1), at(M2), 10), Err(SyncError::InvalidArgument));
}

#[test]
fn set_ceiling_waits_for_the_owner() {
    let d = domain();
    pp_mutex(&d, M, 40);
    d.mutex_lock(caller(1), at(M), None).unwrap();
    let b = spawn(&d, |d| d.mutex_set_ceiling(caller(2), at(M), 70));
    wait_parked(&d, 2);
    assert_eq!(d.platform().peek(SPACE, at(M + mutex::CEILING)), 40);

    d.mutex_unlock(caller(1), at(M)).unwrap();
    assert_eq!(b.join().unwrap(), Ok(40));
    assert_eq!(d.platform().peek(SPACE, at(M + mutex::CEILING)), 70);
    assert_eq!(d.platform().peek(SPACE, at(M)), mutex::CONTESTED);
}
