//! Integration tests for the distributed mutex across World members.

use fusion::{Error, Skirmish, World, WorldConfig};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn config(dir: &TempDir) -> WorldConfig {
    WorldConfig::new(0)
        .with_shm_dir(dir.path())
        .with_main_pool_size(1 << 20)
        .with_liveness_poll(Duration::from_millis(20))
}

#[test]
fn test_mutual_exclusion_across_members() {
    let dir = TempDir::new().unwrap();
    let a = World::enter(config(&dir)).unwrap();
    let b = World::enter(config(&dir)).unwrap();

    let lock_a = Skirmish::new(&a, "counter").unwrap();
    let lock_b = Skirmish::open(&b, lock_a.ptr()).unwrap();
    assert_eq!(lock_b.name().unwrap(), "counter");

    let inside = Arc::new(AtomicU32::new(0));
    let total = Arc::new(AtomicU32::new(0));
    let mut handles = Vec::new();
    for lock in [lock_a.clone(), lock_a, lock_b.clone(), lock_b] {
        let inside = Arc::clone(&inside);
        let total = Arc::clone(&total);
        handles.push(thread::spawn(move || {
            for _ in 0..200 {
                let _guard = lock.guard().unwrap();
                assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                total.fetch_add(1, Ordering::Relaxed);
                inside.fetch_sub(1, Ordering::SeqCst);
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(total.load(Ordering::Relaxed), 800);
}

#[test]
fn test_recursion_needs_equal_dismisses() {
    let dir = TempDir::new().unwrap();
    let a = World::enter(config(&dir)).unwrap();
    let b = World::enter(config(&dir)).unwrap();
    let lock = Skirmish::new(&a, "recursive").unwrap();
    let other = Skirmish::open(&b, lock.ptr()).unwrap();

    lock.prevail().unwrap();
    lock.prevail().unwrap();
    assert_eq!(lock.lock_count().unwrap(), 2);

    lock.dismiss().unwrap();
    assert!(matches!(other.swoop(), Err(Error::Busy)));
    lock.dismiss().unwrap();
    other.swoop().unwrap();
    assert!(matches!(lock.dismiss(), Err(Error::NotHolder)));
    other.dismiss().unwrap();
}

#[test]
fn test_wait_times_out_with_lock_held() {
    let dir = TempDir::new().unwrap();
    let a = World::enter(config(&dir)).unwrap();
    let lock = Skirmish::new(&a, "timeout").unwrap();

    lock.prevail().unwrap();
    let start = Instant::now();
    assert!(matches!(
        lock.wait(Some(Duration::from_millis(100))),
        Err(Error::Timeout)
    ));
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed < Duration::from_millis(200));
    assert_eq!(lock.lock_count().unwrap(), 1);
    lock.dismiss().unwrap();
}

#[test]
fn test_notify_crosses_members() {
    let dir = TempDir::new().unwrap();
    let a = World::enter(config(&dir)).unwrap();
    let b = World::enter(config(&dir)).unwrap();
    let lock = Skirmish::new(&a, "condition").unwrap();
    let remote = Skirmish::open(&b, lock.ptr()).unwrap();

    let ready = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&ready);
    let waiter = thread::spawn(move || {
        let guard = remote.guard().unwrap();
        while !flag.load(Ordering::SeqCst) {
            guard.wait(Some(Duration::from_secs(5))).unwrap();
        }
    });

    thread::sleep(Duration::from_millis(30));
    {
        let guard = lock.guard().unwrap();
        ready.store(true, Ordering::SeqCst);
        guard.notify().unwrap();
    }
    waiter.join().unwrap();
}

#[test]
fn test_lock_of_departed_member_is_broken() {
    let dir = TempDir::new().unwrap();
    let a = World::enter(config(&dir)).unwrap();
    let b = World::enter(config(&dir)).unwrap();
    let lock = Skirmish::new(&a, "orphaned").unwrap();
    let remote = Skirmish::open(&b, lock.ptr()).unwrap();

    remote.prevail().unwrap();
    b.exit();

    let start = Instant::now();
    lock.prevail().unwrap();
    assert!(start.elapsed() < Duration::from_secs(2));
    assert_eq!(lock.lock_count().unwrap(), 1);
    lock.dismiss().unwrap();
}

#[test]
fn test_destroy_fails_later_operations() {
    let dir = TempDir::new().unwrap();
    let a = World::enter(config(&dir)).unwrap();
    let lock = Skirmish::new(&a, "short-lived").unwrap();
    lock.destroy().unwrap();
    assert!(lock.prevail().is_err());
    assert!(Skirmish::open(&a, lock.ptr()).is_err());
}
