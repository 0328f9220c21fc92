//! Integration tests for notification delivery between World members.

use fusion::{ReactionResult, Reactor, World, WorldConfig};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn config(dir: &TempDir) -> WorldConfig {
    WorldConfig::new(0)
        .with_shm_dir(dir.path())
        .with_main_pool_size(1 << 20)
        .with_liveness_poll(Duration::from_millis(20))
}

fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn test_dispatch_reaches_attached_members() {
    let dir = TempDir::new().unwrap();
    let a = World::enter(config(&dir)).unwrap();
    let b = World::enter(config(&dir)).unwrap();
    let c = World::enter(config(&dir)).unwrap();

    let reactor = Reactor::new(&a, 32).unwrap();
    let received = Arc::new(Mutex::new(Vec::new()));
    for (name, world) in [("b", &b), ("c", &c)] {
        let log = Arc::clone(&received);
        Reactor::open(world, reactor.ptr())
            .unwrap()
            .attach(move |msg| {
                log.lock().unwrap().push((name, msg.to_vec()));
                ReactionResult::Ok
            })
            .unwrap();
    }

    reactor.dispatch(b"focus", false).unwrap();
    wait_until("both members", || received.lock().unwrap().len() == 2);

    let mut got = received.lock().unwrap().clone();
    got.sort();
    assert_eq!(got, vec![("b", b"focus".to_vec()), ("c", b"focus".to_vec())]);
    assert_eq!(reactor.dispatch_count().unwrap(), 1);
}

#[test]
fn test_self_only_stays_local() {
    let dir = TempDir::new().unwrap();
    let a = World::enter(config(&dir)).unwrap();
    let b = World::enter(config(&dir)).unwrap();

    let reactor = Reactor::new(&a, 8).unwrap();
    let local = Arc::new(AtomicUsize::new(0));
    let remote = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&local);
    reactor
        .attach(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            ReactionResult::Ok
        })
        .unwrap();
    let counter = Arc::clone(&remote);
    Reactor::open(&b, reactor.ptr())
        .unwrap()
        .attach(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            ReactionResult::Ok
        })
        .unwrap();

    reactor.dispatch(b"x", true).unwrap();
    assert_eq!(local.load(Ordering::SeqCst), 1);
    thread::sleep(Duration::from_millis(100));
    assert_eq!(remote.load(Ordering::SeqCst), 0);

    reactor.dispatch(b"y", false).unwrap();
    wait_until("remote delivery", || remote.load(Ordering::SeqCst) == 1);
}

#[test]
fn test_global_reactions_resolve_per_process() {
    let dir = TempDir::new().unwrap();
    let a = World::enter(config(&dir)).unwrap();
    let b = World::enter(config(&dir)).unwrap();

    let contexts = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&contexts);
    b.register_global_reaction(2, move |_, ctx| {
        log.lock().unwrap().push(ctx);
        ReactionResult::Ok
    })
    .unwrap();

    let reactor = Reactor::new(&a, 8).unwrap();
    let remote = Reactor::open(&b, reactor.ptr()).unwrap();
    remote.attach_global(2, 0xfeed).unwrap();

    // Index 2 is unknown in `a`; only `b` runs it.
    reactor.dispatch(&[1], false).unwrap();
    wait_until("global reaction", || contexts.lock().unwrap().len() == 1);
    assert_eq!(contexts.lock().unwrap()[0], 0xfeed);
}

#[test]
fn test_departed_member_is_skipped() {
    let dir = TempDir::new().unwrap();
    let a = World::enter(config(&dir)).unwrap();
    let b = World::enter(config(&dir)).unwrap();

    let reactor = Reactor::new(&a, 8).unwrap();
    Reactor::open(&b, reactor.ptr())
        .unwrap()
        .attach(|_| ReactionResult::Ok)
        .unwrap();
    b.exit();

    let allocations = a.main_pool().stats().allocations;
    reactor.dispatch(b"z", false).unwrap();
    reactor.dispatch(b"z", false).unwrap();
    assert_eq!(a.main_pool().stats().allocations, allocations);
}

#[test]
fn test_destroyed_reactor_drops_queued_deliveries() {
    let dir = TempDir::new().unwrap();
    let a = World::enter(config(&dir)).unwrap();
    let b = World::enter(config(&dir)).unwrap();

    let reactor = Reactor::new(&a, 8).unwrap();
    let remote = Reactor::open(&b, reactor.ptr()).unwrap();
    remote.attach(|_| ReactionResult::Ok).unwrap();

    reactor.destroy().unwrap();
    assert!(remote.is_destroyed());
    assert!(remote.dispatch(b"late", false).is_err());
}
