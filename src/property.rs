//! Lease/purchase arbitration of an exclusive resource.
//!
//! A [`Property`] is either available, leased, or purchased by one
//! identity. Leasing and purchasing both exclude everybody else; a
//! purchase additionally marks the owner as not expected to give the
//! property back soon, and [`Property::holdup`] is the only way to take it
//! back by force.

use crate::error::{Error, Result};
use crate::futex::{self, Deadline, RawLock};
use crate::memory::ShmPtr;
use crate::world::World;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

const PROPERTY_MAGIC: u64 = 0x4655_5350_524F_5031; // "FUSPROP1"

/// Ownership state of a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum PropertyState {
    /// Nobody owns it.
    Available = 0,
    /// Owned for a short while.
    Leased = 1,
    /// Owned until ceded or held up.
    Purchased = 2,
}

impl PropertyState {
    fn from_raw(raw: u32) -> Self {
        match raw {
            1 => PropertyState::Leased,
            2 => PropertyState::Purchased,
            _ => PropertyState::Available,
        }
    }
}

#[repr(C)]
struct PropertyShared {
    magic: AtomicU64,
    owner: AtomicU64,
    lock: RawLock,
    state: AtomicU32,
    owner_pid: AtomicU32,
    /// Bumped on every release.
    seq: AtomicU32,
    waiters: AtomicU32,
    destroyed: AtomicU32,
}

impl PropertyShared {
    /// Reset to available and wake one or all waiters. Caller holds the lock.
    fn release(&self, wake_all: bool) {
        self.state.store(PropertyState::Available as u32, Ordering::Relaxed);
        self.owner.store(0, Ordering::Relaxed);
        self.owner_pid.store(0, Ordering::Relaxed);
        self.seq.fetch_add(1, Ordering::Release);
        if self.waiters.load(Ordering::Relaxed) > 0 {
            if wake_all {
                futex::wake_all(&self.seq);
            } else {
                futex::wake_one(&self.seq);
            }
        }
    }
}

/// A shared exclusive resource.
///
/// # Example
///
/// ```rust
/// use fusion::{Property, PropertyState, World, WorldConfig};
///
/// let world = World::enter(WorldConfig::local()).unwrap();
/// let layer = Property::new(&world).unwrap();
///
/// layer.purchase(None).unwrap();
/// assert_eq!(layer.state().unwrap(), PropertyState::Purchased);
/// layer.cede().unwrap();
/// ```
#[derive(Clone)]
pub struct Property {
    world: World,
    ptr: ShmPtr,
}

impl Property {
    /// Create an available property.
    pub fn new(world: &World) -> Result<Property> {
        let ptr = world.alloc(std::mem::size_of::<PropertyShared>())?;
        // SAFETY: freshly zeroed allocation of the right size.
        let shared = unsafe { world.shared::<PropertyShared>(ptr)? };
        shared.lock.init();
        shared.magic.store(PROPERTY_MAGIC, Ordering::Release);
        Ok(Property {
            world: world.clone(),
            ptr,
        })
    }

    /// Open a property created by any member.
    pub fn open(world: &World, ptr: ShmPtr) -> Result<Property> {
        let property = Property {
            world: world.clone(),
            ptr,
        };
        property
            .shared()
            .map_err(|_| Error::InvalidSegment(format!("{:?} is not a property", ptr)))?;
        Ok(property)
    }

    fn shared(&self) -> Result<&PropertyShared> {
        // SAFETY: checked for the property magic below.
        let shared = unsafe { self.world.shared::<PropertyShared>(self.ptr)? };
        if shared.magic.load(Ordering::Acquire) != PROPERTY_MAGIC {
            return Err(Error::Destroyed);
        }
        Ok(shared)
    }

    /// Shared pointer to hand to other members.
    pub fn ptr(&self) -> ShmPtr {
        self.ptr
    }

    /// Current state (snapshot).
    pub fn state(&self) -> Result<PropertyState> {
        Ok(PropertyState::from_raw(self.shared()?.state.load(Ordering::Acquire)))
    }

    /// Whether the calling identity owns the property.
    pub fn is_owner(&self) -> Result<bool> {
        let shared = self.shared()?;
        let _guard = shared.lock.guard();
        Ok(shared.state.load(Ordering::Relaxed) != PropertyState::Available as u32
            && shared.owner.load(Ordering::Relaxed) == self.world.identity())
    }

    /// Lease, waiting up to `timeout` (forever for `None`) while another
    /// identity owns it.
    pub fn lease(&self, timeout: Option<Duration>) -> Result<()> {
        self.acquire(PropertyState::Leased, Some(Deadline::after(timeout)))
    }

    /// Lease without waiting; fails [`Error::Busy`].
    pub fn try_lease(&self) -> Result<()> {
        self.acquire(PropertyState::Leased, None)
    }

    /// Purchase, waiting up to `timeout` (forever for `None`). A lessee
    /// upgrades its lease.
    pub fn purchase(&self, timeout: Option<Duration>) -> Result<()> {
        self.acquire(PropertyState::Purchased, Some(Deadline::after(timeout)))
    }

    /// Purchase without waiting; fails [`Error::Busy`].
    pub fn try_purchase(&self) -> Result<()> {
        self.acquire(PropertyState::Purchased, None)
    }

    fn acquire(&self, want: PropertyState, deadline: Option<Deadline>) -> Result<()> {
        let shared = self.shared()?;
        let me = self.world.identity();
        let poll = self.world.config().liveness_poll;

        loop {
            let seq = {
                let _guard = shared.lock.guard();
                if shared.destroyed.load(Ordering::Relaxed) != 0 {
                    return Err(Error::Destroyed);
                }
                let state = PropertyState::from_raw(shared.state.load(Ordering::Relaxed));
                if state == PropertyState::Available || shared.owner.load(Ordering::Relaxed) == me {
                    shared.state.store(state.max(want) as u32, Ordering::Relaxed);
                    shared.owner.store(me, Ordering::Relaxed);
                    shared.owner_pid.store(std::process::id(), Ordering::Relaxed);
                    return Ok(());
                }
                let Some(deadline) = &deadline else {
                    return Err(Error::Busy);
                };
                if deadline.expired() {
                    return Err(Error::Timeout);
                }
                shared.waiters.fetch_add(1, Ordering::Relaxed);
                shared.seq.load(Ordering::Relaxed)
            };

            let slice = deadline.as_ref().and_then(|d| d.next_slice(poll));
            if let Some(slice) = slice {
                futex::wait(&shared.seq, seq, Some(slice));
            }
            shared.waiters.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Give the property back and wake one waiter. Fails
    /// [`Error::NotHolder`] unless the calling identity owns it.
    pub fn cede(&self) -> Result<()> {
        let shared = self.shared()?;
        let _guard = shared.lock.guard();
        if shared.state.load(Ordering::Relaxed) == PropertyState::Available as u32
            || shared.owner.load(Ordering::Relaxed) != self.world.identity()
        {
            return Err(Error::NotHolder);
        }
        shared.release(false);
        Ok(())
    }

    /// Take a purchased property back by killing its owner's process.
    ///
    /// The calling process is never signalled: if it is the purchaser
    /// itself, the property is only reset. Leased or available properties
    /// are left alone.
    pub fn holdup(&self) -> Result<()> {
        let shared = self.shared()?;
        let _guard = shared.lock.guard();
        if shared.state.load(Ordering::Relaxed) != PropertyState::Purchased as u32 {
            return Ok(());
        }
        let pid = shared.owner_pid.load(Ordering::Relaxed);
        if pid != 0 && pid != std::process::id() {
            tracing::warn!(pid, owner = shared.owner.load(Ordering::Relaxed), "holdup: killing purchaser");
            // SAFETY: plain signal delivery to another process.
            let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGKILL) };
            if rc != 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ESRCH) {
                    return Err(Error::Io(err));
                }
            }
        }
        shared.release(true);
        Ok(())
    }

    /// Destroy the property; waiters fail [`Error::Destroyed`].
    pub fn destroy(&self) -> Result<()> {
        let shared = self.shared()?;
        {
            let _guard = shared.lock.guard();
            if shared.destroyed.swap(1, Ordering::AcqRel) != 0 {
                return Err(Error::Destroyed);
            }
            shared.seq.fetch_add(1, Ordering::Release);
            futex::wake_all(&shared.seq);
        }
        let deadline = Deadline::after(Some(Duration::from_secs(1)));
        while shared.waiters.load(Ordering::Acquire) > 0 && !deadline.expired() {
            std::thread::sleep(Duration::from_millis(1));
        }
        shared.magic.store(0, Ordering::Release);
        self.world.free(self.ptr)
    }
}

impl fmt::Debug for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Property")
            .field("ptr", &self.ptr)
            .field("state", &self.state().ok())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WorldConfig;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;
    use std::time::Instant;

    fn world() -> World {
        World::enter(WorldConfig::local()).unwrap()
    }

    #[test]
    fn test_lease_and_cede() {
        let world = world();
        let property = Property::new(&world).unwrap();
        assert_eq!(property.state().unwrap(), PropertyState::Available);
        property.lease(None).unwrap();
        assert_eq!(property.state().unwrap(), PropertyState::Leased);
        assert!(property.is_owner().unwrap());
        // Owner repeating is a no-op.
        property.try_lease().unwrap();
        property.cede().unwrap();
        assert_eq!(property.state().unwrap(), PropertyState::Available);
        assert!(matches!(property.cede(), Err(Error::NotHolder)));
    }

    #[test]
    fn test_lessee_upgrades_to_purchase() {
        let world = world();
        let property = Property::new(&world).unwrap();
        property.lease(None).unwrap();
        property.purchase(None).unwrap();
        assert_eq!(property.state().unwrap(), PropertyState::Purchased);
        // A later lease does not downgrade.
        property.lease(None).unwrap();
        assert_eq!(property.state().unwrap(), PropertyState::Purchased);
    }

    #[test]
    fn test_other_identity_is_busy_or_times_out() {
        let world = world();
        let property = Property::new(&world).unwrap();
        property.purchase(None).unwrap();

        let other = property.clone();
        std::thread::spawn(move || {
            assert!(matches!(other.try_lease(), Err(Error::Busy)));
            assert!(matches!(other.cede(), Err(Error::NotHolder)));
            let start = Instant::now();
            assert!(matches!(
                other.purchase(Some(Duration::from_millis(50))),
                Err(Error::Timeout)
            ));
            assert!(start.elapsed() >= Duration::from_millis(50));
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_cede_wakes_blocked_lessee() {
        let world = world();
        let property = Property::new(&world).unwrap();
        property.purchase(None).unwrap();

        let leased = Arc::new(AtomicBool::new(false));
        let other = property.clone();
        let flag = Arc::clone(&leased);
        let waiter = std::thread::spawn(move || {
            other.lease(Some(Duration::from_secs(5))).unwrap();
            flag.store(true, Ordering::SeqCst);
            other.cede().unwrap();
        });

        std::thread::sleep(Duration::from_millis(50));
        assert!(!leased.load(Ordering::SeqCst));
        property.cede().unwrap();
        waiter.join().unwrap();
        assert!(leased.load(Ordering::SeqCst));
    }

    #[test]
    fn test_holdup_resets_own_process() {
        let world = world();
        let property = Property::new(&world).unwrap();
        let other = property.clone();
        std::thread::spawn(move || other.purchase(None).unwrap())
            .join()
            .unwrap();
        assert!(matches!(property.try_lease(), Err(Error::Busy)));
        property.holdup().unwrap();
        assert_eq!(property.state().unwrap(), PropertyState::Available);
        property.try_lease().unwrap();
    }
}
