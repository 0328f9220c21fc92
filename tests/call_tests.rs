//! Integration tests for cross-process calls between World members.

use fusion::{CallContext, CallFlags, CallOutcome, EXECUTE, Error, FusionCall, ResultRegistry, World, WorldConfig};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
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
fn test_blocking_call_returns_handler_value() {
    let dir = TempDir::new().unwrap();
    let owner = World::enter(config(&dir)).unwrap();
    let caller = World::enter(config(&dir)).unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&seen);
    let call = FusionCall::new(&owner, move |ctx: &CallContext<'_>| {
        log.lock().unwrap().push((ctx.caller, ctx.serial));
        Ok(CallOutcome::Return(ctx.call_arg * 100 + ctx.payload.len() as i32))
    })
    .unwrap();
    call.add_permissions(caller.fusion_id(), EXECUTE).unwrap();

    let remote = FusionCall::open(&caller, call.ptr()).unwrap();
    assert_eq!(remote.execute(CallFlags::Blocking, 3, b"four").unwrap(), 304);
    assert_eq!(remote.execute(CallFlags::Blocking, 1, &[]).unwrap(), 100);

    assert_eq!(
        *seen.lock().unwrap(),
        vec![(caller.fusion_id(), 1), (caller.fusion_id(), 2)]
    );
}

#[test]
fn test_execute_without_permission_is_denied() {
    let dir = TempDir::new().unwrap();
    let owner = World::enter(config(&dir)).unwrap();
    let caller = World::enter(config(&dir)).unwrap();

    let ran = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&ran);
    let call = FusionCall::new(&owner, move |_: &CallContext<'_>| {
        flag.store(true, Ordering::SeqCst);
        Ok(CallOutcome::Return(0))
    })
    .unwrap();

    let remote = FusionCall::open(&caller, call.ptr()).unwrap();
    assert!(matches!(
        remote.execute(CallFlags::Blocking, 0, &[]),
        Err(Error::AccessDenied)
    ));
    assert!(matches!(
        remote.execute(CallFlags::Oneway, 0, &[]),
        Err(Error::AccessDenied)
    ));
    // Only the owner may grant.
    assert!(matches!(
        remote.add_permissions(caller.fusion_id(), EXECUTE),
        Err(Error::AccessDenied)
    ));
    thread::sleep(Duration::from_millis(50));
    assert!(!ran.load(Ordering::SeqCst));
}

#[test]
fn test_insecure_world_skips_permissions() {
    let dir = TempDir::new().unwrap();
    let owner = World::enter(config(&dir).with_secure_calls(false)).unwrap();
    let caller = World::enter(config(&dir)).unwrap();
    let call = FusionCall::new(&owner, |_: &CallContext<'_>| Ok(CallOutcome::Return(7))).unwrap();
    let remote = FusionCall::open(&caller, call.ptr()).unwrap();
    assert_eq!(remote.execute(CallFlags::Blocking, 0, &[]).unwrap(), 7);
}

#[test]
fn test_oneway_returns_before_handler_runs() {
    let dir = TempDir::new().unwrap();
    let owner = World::enter(config(&dir)).unwrap();
    let caller = World::enter(config(&dir)).unwrap();

    let release = Arc::new(AtomicBool::new(false));
    let done = Arc::new(AtomicUsize::new(0));
    let (gate, counter) = (Arc::clone(&release), Arc::clone(&done));
    let call = FusionCall::new(&owner, move |_: &CallContext<'_>| {
        while !gate.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(1));
        }
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(CallOutcome::Return(0))
    })
    .unwrap();
    call.add_permissions(caller.fusion_id(), EXECUTE).unwrap();

    let remote = FusionCall::open(&caller, call.ptr()).unwrap();
    assert_eq!(remote.execute(CallFlags::Oneway, 0, &[]).unwrap(), 0);
    assert_eq!(done.load(Ordering::SeqCst), 0);

    release.store(true, Ordering::SeqCst);
    wait_until("one-way handler", || done.load(Ordering::SeqCst) == 1);
}

#[test]
fn test_handler_errors_travel_back() {
    let dir = TempDir::new().unwrap();
    let owner = World::enter(config(&dir)).unwrap();
    let caller = World::enter(config(&dir)).unwrap();
    caller
        .results()
        .register(ResultRegistry::EXTENSION_BASE, &["window locked"])
        .unwrap();

    let call = FusionCall::new(&owner, |ctx: &CallContext<'_>| match ctx.call_arg {
        0 => Err(Error::Busy),
        _ => Err(Error::Remote {
            code: ResultRegistry::EXTENSION_BASE,
            description: String::new(),
        }),
    })
    .unwrap();
    call.add_permissions(caller.fusion_id(), EXECUTE).unwrap();
    let remote = FusionCall::open(&caller, call.ptr()).unwrap();

    assert!(matches!(remote.execute(CallFlags::Blocking, 0, &[]), Err(Error::Busy)));
    match remote.execute(CallFlags::Blocking, 1, &[]) {
        Err(Error::Remote { code, description }) => {
            assert_eq!(code, ResultRegistry::EXTENSION_BASE);
            assert_eq!(description, "window locked");
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_retained_request_answered_later() {
    let dir = TempDir::new().unwrap();
    let owner = World::enter(config(&dir)).unwrap();
    let caller = World::enter(config(&dir)).unwrap();

    let serial = Arc::new(AtomicI32::new(0));
    let slot = Arc::clone(&serial);
    let call = FusionCall::new(&owner, move |ctx: &CallContext<'_>| {
        slot.store(ctx.serial as i32, Ordering::SeqCst);
        Ok(CallOutcome::Retain)
    })
    .unwrap();
    call.add_permissions(caller.fusion_id(), EXECUTE).unwrap();

    let remote = FusionCall::open(&caller, call.ptr()).unwrap();
    let requester = thread::spawn(move || remote.execute(CallFlags::Blocking, 0, &[]));

    wait_until("retained request", || serial.load(Ordering::SeqCst) == 1);
    loop {
        match call.return_value(1, 55) {
            Ok(()) => break,
            Err(Error::ItemNotFound(_)) => thread::sleep(Duration::from_millis(1)),
            Err(e) => panic!("unexpected {:?}", e),
        }
    }
    assert_eq!(requester.join().unwrap().unwrap(), 55);
}

#[test]
fn test_quota_bounds_requests_in_flight() {
    let dir = TempDir::new().unwrap();
    let owner = World::enter(config(&dir)).unwrap();
    let caller = World::enter(config(&dir)).unwrap();

    let call = FusionCall::new(&owner, |ctx: &CallContext<'_>| {
        Ok(if ctx.call_arg == 0 {
            CallOutcome::Retain
        } else {
            CallOutcome::Return(ctx.call_arg)
        })
    })
    .unwrap();
    call.add_permissions(caller.fusion_id(), EXECUTE).unwrap();
    call.set_quota(caller.fusion_id(), 1).unwrap();

    let remote = FusionCall::open(&caller, call.ptr()).unwrap();
    let first = {
        let remote = remote.clone();
        thread::spawn(move || remote.execute(CallFlags::Blocking, 0, &[]))
    };
    wait_until("first request", || call.serial().unwrap() == 1);

    let second_done = Arc::new(AtomicBool::new(false));
    let second = {
        let remote = remote.clone();
        let flag = Arc::clone(&second_done);
        thread::spawn(move || {
            let value = remote.execute(CallFlags::Blocking, 9, &[]);
            flag.store(true, Ordering::SeqCst);
            value
        })
    };

    thread::sleep(Duration::from_millis(100));
    assert!(!second_done.load(Ordering::SeqCst));
    assert_eq!(call.serial().unwrap(), 1);

    loop {
        match call.return_value(1, 1) {
            Ok(()) => break,
            Err(Error::ItemNotFound(_)) => thread::sleep(Duration::from_millis(1)),
            Err(e) => panic!("unexpected {:?}", e),
        }
    }
    assert_eq!(first.join().unwrap().unwrap(), 1);
    assert_eq!(second.join().unwrap().unwrap(), 9);
}

#[test]
fn test_departed_owner_fails_dead() {
    let dir = TempDir::new().unwrap();
    let owner = World::enter(config(&dir)).unwrap();
    let caller = World::enter(config(&dir)).unwrap();

    let entered = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&entered);
    let call = FusionCall::new(&owner, move |_: &CallContext<'_>| {
        flag.store(true, Ordering::SeqCst);
        Ok(CallOutcome::Retain)
    })
    .unwrap();
    call.add_permissions(caller.fusion_id(), EXECUTE).unwrap();

    let remote = FusionCall::open(&caller, call.ptr()).unwrap();
    let requester = {
        let remote = remote.clone();
        thread::spawn(move || remote.execute(CallFlags::Blocking, 0, &[]))
    };
    wait_until("handler", || entered.load(Ordering::SeqCst));
    // Let the dispatcher file the retained request.
    thread::sleep(Duration::from_millis(20));
    owner.exit();

    assert!(matches!(requester.join().unwrap(), Err(Error::Dead)));
    assert!(matches!(remote.execute(CallFlags::Blocking, 0, &[]), Err(Error::Dead)));
}

#[test]
fn test_queued_request_skips_call_reusing_its_memory() {
    let dir = TempDir::new().unwrap();
    let owner = World::enter(config(&dir)).unwrap();
    let caller = World::enter(config(&dir)).unwrap();

    // call_arg 1 holds the owner's dispatcher until released.
    let release = Arc::new(AtomicBool::new(false));
    let gate = Arc::clone(&release);
    let busy = FusionCall::new(&owner, move |ctx: &CallContext<'_>| {
        while ctx.call_arg == 1 && !gate.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(1));
        }
        Ok(CallOutcome::Return(0))
    })
    .unwrap();
    busy.add_permissions(caller.fusion_id(), EXECUTE).unwrap();
    let first = FusionCall::new(&owner, |_: &CallContext<'_>| Ok(CallOutcome::Return(0))).unwrap();
    first.add_permissions(caller.fusion_id(), EXECUTE).unwrap();

    let remote_busy = FusionCall::open(&caller, busy.ptr()).unwrap();
    remote_busy.execute(CallFlags::Oneway, 1, &[]).unwrap();
    FusionCall::open(&caller, first.ptr())
        .unwrap()
        .execute(CallFlags::Oneway, 123, &[])
        .unwrap();

    first.destroy().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&seen);
    let second = FusionCall::new(&owner, move |ctx: &CallContext<'_>| {
        log.lock().unwrap().push(ctx.call_arg);
        Ok(CallOutcome::Return(0))
    })
    .unwrap();
    second.add_permissions(caller.fusion_id(), EXECUTE).unwrap();

    release.store(true, Ordering::SeqCst);
    // The dispatcher drains in order, so this returns after the stale request.
    assert_eq!(remote_busy.execute(CallFlags::Blocking, 0, &[]).unwrap(), 0);
    assert!(seen.lock().unwrap().is_empty());

    let remote_second = FusionCall::open(&caller, second.ptr()).unwrap();
    remote_second.execute(CallFlags::Blocking, 7, &[]).unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![7]);
}

#[test]
fn test_destroy_by_other_member_fails_retained_requests() {
    let dir = TempDir::new().unwrap();
    let owner = World::enter(config(&dir)).unwrap();
    let caller = World::enter(config(&dir)).unwrap();

    let retained = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&retained);
    let call = FusionCall::new(&owner, move |_: &CallContext<'_>| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(CallOutcome::Retain)
    })
    .unwrap();
    call.add_permissions(caller.fusion_id(), EXECUTE).unwrap();

    let remote = FusionCall::open(&caller, call.ptr()).unwrap();
    let requester = {
        let remote = remote.clone();
        thread::spawn(move || remote.execute(CallFlags::Blocking, 0, &[]))
    };
    wait_until("retained request", || retained.load(Ordering::SeqCst) == 1);

    remote.destroy().unwrap();
    assert!(matches!(requester.join().unwrap(), Err(Error::Destroyed)));
    assert!(matches!(call.return_value(1, 0), Err(Error::Destroyed)));
}
