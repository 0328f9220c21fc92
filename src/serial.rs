//! Overflow-safe version counters.
//!
//! A [`Serial`] is a 32-bit value plus a 32-bit overflow count, packed into
//! one 64-bit word so that incrementing carries into the overflow count and
//! comparing two stamps is a plain integer comparison.

use crate::error::{Error, Result};
use crate::futex::{self, Deadline};
use crate::memory::ShmPtr;
use crate::world::World;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

/// A snapshot of a serial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SerialStamp {
    overflow: u32,
    value: u32,
}

impl SerialStamp {
    /// Build a stamp from its parts.
    pub const fn new(overflow: u32, value: u32) -> Self {
        Self { overflow, value }
    }

    /// Low part.
    pub fn value(self) -> u32 {
        self.value
    }

    /// How often `value` wrapped around.
    pub fn overflow(self) -> u32 {
        self.overflow
    }

    /// Whether `self` is strictly newer than `other`.
    pub fn is_ahead_of(self, other: SerialStamp) -> bool {
        self > other
    }

    fn to_raw(self) -> u64 {
        ((self.overflow as u64) << 32) | self.value as u64
    }

    fn from_raw(raw: u64) -> Self {
        Self {
            overflow: (raw >> 32) as u32,
            value: raw as u32,
        }
    }
}

impl fmt::Display for SerialStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.overflow, self.value)
    }
}

/// A version counter whose waiters may live in any process sharing it.
#[repr(C)]
#[derive(Debug, Default)]
pub struct Serial {
    stamp: AtomicU64,
    waiting: AtomicU32,
    wakeup: AtomicU32,
}

impl Serial {
    /// A serial at `0:0`.
    pub const fn new() -> Self {
        Self {
            stamp: AtomicU64::new(0),
            waiting: AtomicU32::new(0),
            wakeup: AtomicU32::new(0),
        }
    }

    /// Current stamp.
    pub fn get(&self) -> SerialStamp {
        SerialStamp::from_raw(self.stamp.load(Ordering::SeqCst))
    }

    /// Advance by one and return the new stamp. Wrapping the value bumps
    /// the overflow count.
    pub fn increase(&self) -> SerialStamp {
        SerialStamp::from_raw(self.stamp.fetch_add(1, Ordering::SeqCst).wrapping_add(1))
    }

    /// Move forward to `source` if it is ahead. Returns whether it moved.
    pub fn update(&self, source: SerialStamp) -> bool {
        let previous = self.stamp.fetch_max(source.to_raw(), Ordering::SeqCst);
        previous < source.to_raw()
    }

    /// Block until this serial has caught up with `source`.
    ///
    /// Fails [`Error::Timeout`] if it has not within `timeout`.
    pub fn wait(&self, source: SerialStamp, timeout: Option<Duration>) -> Result<()> {
        let deadline = Deadline::after(timeout);
        loop {
            let wakeup = self.wakeup.load(Ordering::SeqCst);
            if self.get() >= source {
                return Ok(());
            }
            self.waiting.fetch_add(1, Ordering::SeqCst);
            // Re-check after registering so a concurrent notify cannot
            // miss us.
            if self.get() >= source {
                self.waiting.fetch_sub(1, Ordering::SeqCst);
                return Ok(());
            }
            let Some(slice) = deadline.next_slice(Duration::MAX) else {
                self.waiting.fetch_sub(1, Ordering::SeqCst);
                return Err(Error::Timeout);
            };
            futex::wait(&self.wakeup, wakeup, timeout.map(|_| slice));
            self.waiting.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Merge `source` into this serial and wake its waiters.
    pub fn notify(&self, source: SerialStamp) {
        self.update(source);
        if self.waiting.load(Ordering::SeqCst) > 0 {
            self.wakeup.fetch_add(1, Ordering::SeqCst);
            futex::wake_all(&self.wakeup);
        }
    }
}

/// A [`Serial`] in the main pool, usable from every member.
///
/// ```rust
/// use fusion::{SharedSerial, World, WorldConfig};
///
/// let world = World::enter(WorldConfig::local()).unwrap();
/// let frames = SharedSerial::new(&world).unwrap();
/// let stamp = frames.serial().unwrap().increase();
/// assert_eq!(stamp.value(), 1);
/// frames.destroy().unwrap();
/// ```
#[derive(Clone)]
pub struct SharedSerial {
    world: World,
    ptr: ShmPtr,
}

impl SharedSerial {
    /// Allocate a serial at `0:0`.
    pub fn new(world: &World) -> Result<SharedSerial> {
        let ptr = world.alloc(std::mem::size_of::<Serial>())?;
        Ok(SharedSerial {
            world: world.clone(),
            ptr,
        })
    }

    /// Open a serial allocated by any member.
    pub fn open(world: &World, ptr: ShmPtr) -> Result<SharedSerial> {
        let serial = SharedSerial {
            world: world.clone(),
            ptr,
        };
        serial.serial()?;
        Ok(serial)
    }

    /// Shared pointer to hand to other members.
    pub fn ptr(&self) -> ShmPtr {
        self.ptr
    }

    /// The serial itself.
    pub fn serial(&self) -> Result<&Serial> {
        // SAFETY: allocated zeroed by `new`; all-zero is a valid Serial.
        unsafe { self.world.shared::<Serial>(self.ptr) }
    }

    /// Free the serial.
    pub fn destroy(self) -> Result<()> {
        self.world.free(self.ptr)
    }
}

impl fmt::Debug for SharedSerial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedSerial").field("ptr", &self.ptr).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn test_increase_carries_into_overflow() {
        let serial = Serial::new();
        serial.update(SerialStamp::new(0, u32::MAX));
        let next = serial.increase();
        assert_eq!(next, SerialStamp::new(1, 0));
        assert!(next.is_ahead_of(SerialStamp::new(0, u32::MAX)));
    }

    #[test]
    fn test_compare_overflow_first() {
        assert!(SerialStamp::new(2, 0) > SerialStamp::new(1, 500));
        assert!(SerialStamp::new(1, 6) > SerialStamp::new(1, 5));
        assert!(!SerialStamp::new(1, 5).is_ahead_of(SerialStamp::new(1, 5)));
    }

    #[test]
    fn test_update_is_idempotent_and_monotonic() {
        let serial = Serial::new();
        let target = SerialStamp::new(0, 10);
        assert!(serial.update(target));
        assert!(!serial.update(target));
        assert!(!serial.update(SerialStamp::new(0, 3)));
        assert_eq!(serial.get(), target);
    }

    #[test]
    fn test_wait_returns_immediately_when_caught_up() {
        let serial = Serial::new();
        serial.increase();
        serial.wait(SerialStamp::new(0, 1), Some(Duration::ZERO)).unwrap();
    }

    #[test]
    fn test_wait_times_out() {
        let serial = Serial::new();
        let start = Instant::now();
        let err = serial
            .wait(SerialStamp::new(0, 1), Some(Duration::from_millis(30)))
            .unwrap_err();
        assert!(matches!(err, Error::Timeout));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_notify_wakes_waiter() {
        let serial = Arc::new(Serial::new());
        let waiter = {
            let serial = Arc::clone(&serial);
            std::thread::spawn(move || serial.wait(SerialStamp::new(0, 3), Some(Duration::from_secs(5))))
        };
        std::thread::sleep(Duration::from_millis(20));
        serial.notify(SerialStamp::new(0, 3));
        waiter.join().unwrap().unwrap();
        assert_eq!(serial.get(), SerialStamp::new(0, 3));
    }
}
