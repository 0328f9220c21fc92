//! Integration tests for pooled shared objects.

use fusion::{Error, FusionCall, Object, ObjectPool, ObjectState, ReactionResult, World, WorldConfig};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn config(dir: &TempDir) -> WorldConfig {
    WorldConfig::new(0)
        .with_shm_dir(dir.path())
        .with_main_pool_size(2 << 20)
        .with_liveness_poll(Duration::from_millis(20))
}

fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(5));
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
struct Geometry {
    x: i32,
    y: i32,
    width: u32,
    height: u32,
}

// SAFETY: plain integers, no padding.
unsafe impl fusion::memory::Plain for Geometry {}

#[test]
fn test_lifecycle_scenario() {
    let dir = TempDir::new().unwrap();
    let world = World::enter(config(&dir)).unwrap();
    let destroyed = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&destroyed);
    let pool = ObjectPool::create(&world, "P", 64, 0, move |object: &Object, zombie: bool| {
        assert!(!zombie);
        assert_eq!(object.id(), 1);
        counter.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();

    let object = pool.new_object().unwrap();
    object.activate().unwrap();
    assert_eq!(object.id(), 1);
    assert_eq!(object.state().unwrap(), ObjectState::Active);

    object.add_ref().unwrap();
    assert_eq!(object.refs().unwrap(), 2);

    object.unref().unwrap();
    object.unref().unwrap();
    assert_eq!(destroyed.load(Ordering::SeqCst), 1);
    assert!(matches!(pool.get(1), Err(Error::Dead)));
    assert!(matches!(object.unref(), Err(Error::Dead)));
    assert_eq!(destroyed.load(Ordering::SeqCst), 1);
}

#[test]
fn test_objects_visible_to_other_members() {
    let dir = TempDir::new().unwrap();
    let a = World::enter(config(&dir)).unwrap();
    let b = World::enter(config(&dir)).unwrap();

    let pool_a = ObjectPool::create(&a, "windows", 16, 8, |_, _| {}).unwrap();
    let pool_b = ObjectPool::open(&b, "windows", |_, _| {}).unwrap();

    let window = pool_a.new_object().unwrap();
    window
        .write(&Geometry {
            x: 10,
            y: 20,
            width: 640,
            height: 480,
        })
        .unwrap();

    // Not visible before activation.
    let mut count = 0;
    pool_b.enumerate(|_| {
        count += 1;
        true
    })
    .unwrap();
    assert_eq!(count, 0);

    window.activate().unwrap();
    let seen = pool_b.get(window.id()).unwrap();
    assert_eq!(seen.creator().unwrap(), a.fusion_id());
    assert_eq!(seen.read::<Geometry>().unwrap().width, 640);
    assert_eq!(window.refs().unwrap(), 2);

    let by_ptr = pool_b.object_at(window.ptr()).unwrap();
    assert_eq!(by_ptr.id(), window.id());

    seen.unref().unwrap();
    window.unref().unwrap();
    assert!(pool_a.is_empty().unwrap());
}

#[test]
fn test_concurrent_ref_unref_destroys_once() {
    let dir = TempDir::new().unwrap();
    let world = World::enter(config(&dir)).unwrap();
    let destroyed = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&destroyed);
    let pool = ObjectPool::create(&world, "contended", 8, 0, move |_: &Object, _: bool| {
        counter.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();

    let object = pool.new_object().unwrap();
    object.activate().unwrap();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let pool = pool.clone();
            let id = object.id();
            thread::spawn(move || {
                for _ in 0..100 {
                    let object = pool.get(id).unwrap();
                    object.unref().unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(object.refs().unwrap(), 1);
    assert_eq!(destroyed.load(Ordering::SeqCst), 0);
    object.unref().unwrap();
    assert_eq!(destroyed.load(Ordering::SeqCst), 1);
}

#[test]
fn test_object_notifications_reach_other_member() {
    let dir = TempDir::new().unwrap();
    let a = World::enter(config(&dir)).unwrap();
    let b = World::enter(config(&dir)).unwrap();
    let pool_a = ObjectPool::create(&a, "layers", 8, 16, |_, _| {}).unwrap();
    let pool_b = ObjectPool::open(&b, "layers", |_, _| {}).unwrap();

    let layer = pool_a.new_object().unwrap();
    layer.activate().unwrap();
    let remote = pool_b.get(layer.id()).unwrap();

    let received = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&received);
    remote
        .attach(move |msg| {
            log.lock().unwrap().push(msg.to_vec());
            ReactionResult::Ok
        })
        .unwrap();

    layer.dispatch(b"resized", false).unwrap();
    wait_until("notification", || received.lock().unwrap().len() == 1);
    assert_eq!(received.lock().unwrap()[0], b"resized");

    remote.unref().unwrap();
    layer.unref().unwrap();
}

#[test]
fn test_bound_call_destroyed_with_object() {
    let dir = TempDir::new().unwrap();
    let world = World::enter(config(&dir)).unwrap();
    let pool = ObjectPool::create(&world, "surfaces", 8, 0, |_, _| {}).unwrap();
    let surface = pool.new_object().unwrap();

    let call = FusionCall::new(&world, |_: &fusion::CallContext<'_>| Ok(fusion::CallOutcome::Return(1))).unwrap();
    surface.bind_call(&call).unwrap();
    assert_eq!(surface.call().unwrap().unwrap().id(), call.id());

    surface.unref().unwrap();
    assert!(matches!(
        call.execute(fusion::CallFlags::Blocking, 0, &[]),
        Err(Error::Destroyed)
    ));
}

#[test]
fn test_bound_call_released_in_owner_when_other_member_destroys() {
    let dir = TempDir::new().unwrap();
    let a = World::enter(config(&dir)).unwrap();
    let b = World::enter(config(&dir)).unwrap();
    let pool_a = ObjectPool::create(&a, "buffers", 8, 0, |_, _| {}).unwrap();
    let pool_b = ObjectPool::open(&b, "buffers", |_, _| {}).unwrap();

    let token = Arc::new(());
    let held = Arc::clone(&token);
    let call = FusionCall::new(&a, move |_: &fusion::CallContext<'_>| {
        let _ = &held;
        Ok(fusion::CallOutcome::Return(0))
    })
    .unwrap();
    let buffer = pool_a.new_object().unwrap();
    buffer.bind_call(&call).unwrap();
    buffer.activate().unwrap();
    assert_eq!(Arc::strong_count(&token), 2);

    // The last reference goes away in `b`, which destroys the bound call.
    let remote = pool_b.get(buffer.id()).unwrap();
    buffer.unref().unwrap();
    remote.unref().unwrap();

    wait_until("owner to drop the handler", || Arc::strong_count(&token) == 1);
    assert!(matches!(
        call.execute(fusion::CallFlags::Blocking, 0, &[]),
        Err(Error::Destroyed)
    ));
}

#[test]
fn test_pool_destroy_reports_zombies() {
    let dir = TempDir::new().unwrap();
    let world = World::enter(config(&dir)).unwrap();
    let zombies = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&zombies);
    let pool = ObjectPool::create(&world, "leaky", 8, 0, move |object: &Object, zombie: bool| {
        log.lock().unwrap().push((object.id(), zombie));
    })
    .unwrap();

    let kept = pool.new_object().unwrap();
    kept.activate().unwrap();
    kept.add_ref().unwrap();
    pool.new_object().unwrap().unref().unwrap();

    pool.destroy().unwrap();
    assert_eq!(*zombies.lock().unwrap(), vec![(2, false), (1, true)]);
    assert!(matches!(pool.new_object(), Err(Error::Destroyed)));
}

#[test]
fn test_main_pool_reclaimed_after_objects() {
    let dir = TempDir::new().unwrap();
    let world = World::enter(config(&dir)).unwrap();
    let before = world.main_pool().stats().allocations;

    let pool = ObjectPool::create(&world, "scratch", 256, 64, |_, _| {}).unwrap();
    let objects: Vec<_> = (0..10).map(|_| pool.new_object().unwrap()).collect();
    for object in objects {
        object.unref().unwrap();
    }
    pool.destroy().unwrap();

    assert_eq!(world.main_pool().stats().allocations, before);
}
