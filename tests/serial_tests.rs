//! Integration tests for shared serials.

use fusion::{SerialStamp, SharedSerial, World, WorldConfig};
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

fn config(dir: &TempDir) -> WorldConfig {
    WorldConfig::new(0)
        .with_shm_dir(dir.path())
        .with_main_pool_size(1 << 20)
}

#[test]
fn test_serial_shared_between_members() {
    let dir = TempDir::new().unwrap();
    let a = World::enter(config(&dir)).unwrap();
    let b = World::enter(config(&dir)).unwrap();

    let frames = SharedSerial::new(&a).unwrap();
    let seen = SharedSerial::open(&b, frames.ptr()).unwrap();

    for _ in 0..3 {
        frames.serial().unwrap().increase();
    }
    assert_eq!(seen.serial().unwrap().get(), SerialStamp::new(0, 3));
}

#[test]
fn test_wait_for_other_member() {
    let dir = TempDir::new().unwrap();
    let a = World::enter(config(&dir)).unwrap();
    let b = World::enter(config(&dir)).unwrap();

    let frames = SharedSerial::new(&a).unwrap();
    let seen = SharedSerial::open(&b, frames.ptr()).unwrap();
    let target = SerialStamp::new(0, 5);

    let waiter = thread::spawn(move || {
        seen.serial()
            .unwrap()
            .wait(target, Some(Duration::from_secs(5)))
    });
    thread::sleep(Duration::from_millis(30));
    frames.serial().unwrap().notify(target);
    waiter.join().unwrap().unwrap();

    // Monotonic: notifying an older stamp changes nothing.
    frames.serial().unwrap().notify(SerialStamp::new(0, 2));
    assert_eq!(frames.serial().unwrap().get(), target);
    frames.destroy().unwrap();
}
