//! Skirmish: distributed recursive mutex with a wait/notify queue.
//!
//! The holder is identified by `(FusionID, thread tag)` packed into one
//! word, so recursion works across handles and processes without comparing
//! pointers. All bookkeeping fields are guarded by an inner [`RawLock`];
//! blocked parties sleep on sequence words that are bumped under that lock.
//!
//! A contended [`prevail`](Skirmish::prevail) re-checks every
//! `liveness_poll` whether the holder's member is still in the World and
//! takes the lock over if it is not.

use crate::error::{Error, Result};
use crate::futex::{self, Deadline, RawLock};
use crate::memory::{FixedName, ShmPtr};
use crate::observability;
use crate::world::{FusionId, World};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

const SKIRMISH_MAGIC: u32 = 0x534B_524D; // "SKRM"

/// Longest single sleep of a waiter that has no deadline to honour.
const NOTIFY_SLICE: Duration = Duration::from_secs(1);

/// The shared state of one skirmish.
///
/// Embeddable in other shared structures; all-zero bytes followed by
/// [`SkirmishShared::init`] is a valid unlocked skirmish.
#[repr(C)]
pub struct SkirmishShared {
    magic: AtomicU32,
    destroyed: AtomicU32,
    lock: RawLock,
    count: AtomicU32,
    holder: AtomicU64,
    waiters: AtomicU32,
    release_seq: AtomicU32,
    notify_seq: AtomicU32,
    notify_waiters: AtomicU32,
    notify_tokens: AtomicU32,
    _reserved: AtomicU32,
    name: FixedName,
}

impl SkirmishShared {
    /// Initialize in place. Only valid while no other party can see it.
    pub fn init(&self, name: &str) -> Result<()> {
        self.name.store(name)?;
        self.lock.init();
        self.holder.store(0, Ordering::Relaxed);
        self.count.store(0, Ordering::Relaxed);
        self.waiters.store(0, Ordering::Relaxed);
        self.notify_waiters.store(0, Ordering::Relaxed);
        self.notify_tokens.store(0, Ordering::Relaxed);
        self.destroyed.store(0, Ordering::Relaxed);
        self.magic.store(SKIRMISH_MAGIC, Ordering::Release);
        Ok(())
    }
}

fn holder_member(holder: u64) -> FusionId {
    FusionId((holder >> 32) as u32)
}

/// A handle on a skirmish, usable from any thread of any member.
///
/// # Example
///
/// ```rust
/// use fusion::{Skirmish, World, WorldConfig};
///
/// let world = World::enter(WorldConfig::local()).unwrap();
/// let lock = Skirmish::new(&world, "layers").unwrap();
///
/// lock.prevail().unwrap();
/// lock.prevail().unwrap(); // recursive
/// assert_eq!(lock.lock_count().unwrap(), 2);
/// lock.dismiss().unwrap();
/// lock.dismiss().unwrap();
/// ```
#[derive(Clone)]
pub struct Skirmish {
    world: World,
    ptr: ShmPtr,
    /// Freed by `destroy` when set; embedded skirmishes belong to their
    /// enclosing structure.
    standalone: bool,
}

impl Skirmish {
    /// Allocate a skirmish in the main pool.
    pub fn new(world: &World, name: &str) -> Result<Skirmish> {
        let ptr = world.alloc(std::mem::size_of::<SkirmishShared>())?;
        // SAFETY: zeroed allocation of the right size.
        let shared = unsafe { world.shared::<SkirmishShared>(ptr)? };
        if let Err(e) = shared.init(name) {
            let _ = world.free(ptr);
            return Err(e);
        }
        Ok(Skirmish {
            world: world.clone(),
            ptr,
            standalone: true,
        })
    }

    /// Open a skirmish published by another member.
    pub fn open(world: &World, ptr: ShmPtr) -> Result<Skirmish> {
        let skirmish = Skirmish {
            world: world.clone(),
            ptr,
            standalone: true,
        };
        skirmish.shared()?;
        Ok(skirmish)
    }

    /// A handle on a skirmish embedded at `ptr` inside another structure.
    pub(crate) fn embedded(world: &World, ptr: ShmPtr) -> Skirmish {
        Skirmish {
            world: world.clone(),
            ptr,
            standalone: false,
        }
    }

    fn shared(&self) -> Result<&SkirmishShared> {
        // SAFETY: checked for the skirmish magic before use.
        let shared = unsafe { self.world.shared::<SkirmishShared>(self.ptr)? };
        if shared.magic.load(Ordering::Acquire) != SKIRMISH_MAGIC {
            debug_assert!(
                shared.destroyed.load(Ordering::Relaxed) != 0,
                "{:?} is not a skirmish",
                self.ptr
            );
            return Err(Error::Destroyed);
        }
        Ok(shared)
    }

    /// Shared pointer to hand to other members.
    pub fn ptr(&self) -> ShmPtr {
        self.ptr
    }

    /// Name given at creation.
    pub fn name(&self) -> Result<String> {
        Ok(self.shared()?.name.load())
    }

    /// Acquire, blocking while another identity holds it.
    pub fn prevail(&self) -> Result<()> {
        let shared = self.shared()?;
        let me = self.world.identity();
        self.acquire(shared, me, 1, true).map(|_| ())
    }

    /// Acquire without blocking; fails [`Error::Busy`] when held by another.
    pub fn swoop(&self) -> Result<()> {
        let shared = self.shared()?;
        let me = self.world.identity();
        let _guard = shared.lock.guard();
        if shared.destroyed.load(Ordering::Relaxed) != 0 {
            return Err(Error::Destroyed);
        }
        match shared.holder.load(Ordering::Relaxed) {
            0 => {
                shared.holder.store(me, Ordering::Relaxed);
                shared.count.store(1, Ordering::Relaxed);
                Ok(())
            }
            holder if holder == me => {
                shared.count.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            _ => Err(Error::Busy),
        }
    }

    /// Take the lock for `me`, setting the count to `count` on a fresh
    /// acquisition.
    fn acquire(&self, shared: &SkirmishShared, me: u64, count: u32, recursive: bool) -> Result<()> {
        let poll = self.world.config().liveness_poll;
        let mut contended = false;

        loop {
            let guard = shared.lock.guard();
            if shared.destroyed.load(Ordering::Relaxed) != 0 {
                return Err(Error::Destroyed);
            }
            let holder = shared.holder.load(Ordering::Relaxed);
            if holder == 0 {
                shared.holder.store(me, Ordering::Relaxed);
                shared.count.store(count, Ordering::Relaxed);
                return Ok(());
            }
            if holder == me && recursive {
                shared.count.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
            if contended && !self.world.is_alive(holder_member(holder)) {
                let name = shared.name.load();
                observability::trace_lock_broken(&name, holder_member(holder).0, self.world.fusion_id().0);
                observability::record_skirmish_broken(&name);
                shared.holder.store(me, Ordering::Relaxed);
                shared.count.store(count, Ordering::Relaxed);
                return Ok(());
            }
            if !contended {
                contended = true;
                observability::record_skirmish_contended(&shared.name.load());
            }

            let seq = shared.release_seq.load(Ordering::Relaxed);
            shared.waiters.fetch_add(1, Ordering::Relaxed);
            drop(guard);

            futex::wait(&shared.release_seq, seq, Some(poll));
            shared.waiters.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Release one level of recursion; at zero the lock is free and one
    /// blocked party is woken.
    pub fn dismiss(&self) -> Result<()> {
        let shared = self.shared()?;
        let me = self.world.identity();
        let _guard = shared.lock.guard();
        if shared.holder.load(Ordering::Relaxed) != me {
            return Err(Error::NotHolder);
        }
        if shared.count.fetch_sub(1, Ordering::Relaxed) == 1 {
            Self::release(shared);
        }
        Ok(())
    }

    /// Clear the holder and wake one prevailer. Caller holds the inner lock.
    fn release(shared: &SkirmishShared) {
        shared.holder.store(0, Ordering::Relaxed);
        shared.count.store(0, Ordering::Relaxed);
        shared.release_seq.fetch_add(1, Ordering::Release);
        if shared.waiters.load(Ordering::Relaxed) > 0 {
            futex::wake_one(&shared.release_seq);
        }
    }

    /// How many times the calling identity holds the lock (0 if it does
    /// not).
    pub fn lock_count(&self) -> Result<u32> {
        let shared = self.shared()?;
        let me = self.world.identity();
        let _guard = shared.lock.guard();
        if shared.holder.load(Ordering::Relaxed) == me {
            Ok(shared.count.load(Ordering::Relaxed))
        } else {
            Ok(0)
        }
    }

    /// Whether anyone holds the lock (snapshot).
    pub fn is_locked(&self) -> Result<bool> {
        Ok(self.shared()?.holder.load(Ordering::Relaxed) != 0)
    }

    /// Prevail and return a guard that dismisses on drop.
    pub fn guard(&self) -> Result<SkirmishGuard<'_>> {
        self.prevail()?;
        Ok(SkirmishGuard { skirmish: self })
    }

    /// Release the lock completely, wait for a notification, then take it
    /// back at the same recursion depth.
    ///
    /// Fails [`Error::Timeout`] if no notification arrived within `timeout`;
    /// the lock is held again on both paths (unless the skirmish was
    /// destroyed meanwhile).
    pub fn wait(&self, timeout: Option<Duration>) -> Result<()> {
        let shared = self.shared()?;
        let me = self.world.identity();
        let deadline = Deadline::after(timeout);

        let saved = {
            let _guard = shared.lock.guard();
            if shared.holder.load(Ordering::Relaxed) != me {
                return Err(Error::NotHolder);
            }
            let saved = shared.count.load(Ordering::Relaxed);
            shared.notify_waiters.fetch_add(1, Ordering::Relaxed);
            Self::release(shared);
            saved
        };

        let notified = loop {
            let guard = shared.lock.guard();
            if shared.notify_tokens.load(Ordering::Relaxed) > 0 {
                shared.notify_tokens.fetch_sub(1, Ordering::Relaxed);
                shared.notify_waiters.fetch_sub(1, Ordering::Relaxed);
                break Ok(());
            }
            if shared.destroyed.load(Ordering::Relaxed) != 0 {
                shared.notify_waiters.fetch_sub(1, Ordering::Relaxed);
                return Err(Error::Destroyed);
            }
            let Some(slice) = deadline.next_slice(NOTIFY_SLICE) else {
                shared.notify_waiters.fetch_sub(1, Ordering::Relaxed);
                break Err(Error::Timeout);
            };
            let seq = shared.notify_seq.load(Ordering::Relaxed);
            drop(guard);
            futex::wait(&shared.notify_seq, seq, Some(slice));
        };

        self.acquire(shared, me, saved, false)?;
        notified
    }

    /// Wake one party blocked in [`wait`](Self::wait). The caller must hold
    /// the lock and keeps it.
    pub fn notify(&self) -> Result<()> {
        self.signal(false)
    }

    /// Wake every party blocked in [`wait`](Self::wait).
    pub fn notify_all(&self) -> Result<()> {
        self.signal(true)
    }

    fn signal(&self, all: bool) -> Result<()> {
        let shared = self.shared()?;
        let me = self.world.identity();
        let _guard = shared.lock.guard();
        if shared.holder.load(Ordering::Relaxed) != me {
            return Err(Error::NotHolder);
        }
        let waiting = shared.notify_waiters.load(Ordering::Relaxed);
        let tokens = shared.notify_tokens.load(Ordering::Relaxed);
        if waiting > tokens {
            let grant = if all { waiting } else { tokens + 1 };
            shared.notify_tokens.store(grant, Ordering::Relaxed);
            shared.notify_seq.fetch_add(1, Ordering::Release);
            futex::wake_all(&shared.notify_seq);
        }
        Ok(())
    }

    /// Destroy the skirmish, failing every blocked party with
    /// [`Error::Destroyed`].
    pub fn destroy(&self) -> Result<()> {
        let shared = self.shared()?;
        {
            let _guard = shared.lock.guard();
            if shared.destroyed.swap(1, Ordering::AcqRel) != 0 {
                return Err(Error::Destroyed);
            }
            shared.release_seq.fetch_add(1, Ordering::Release);
            shared.notify_seq.fetch_add(1, Ordering::Release);
        }
        futex::wake_all(&shared.release_seq);
        futex::wake_all(&shared.notify_seq);

        // Let woken parties observe the flag before the memory goes away.
        let drain = Deadline::after(Some(Duration::from_secs(1)));
        while (shared.waiters.load(Ordering::Acquire) > 0
            || shared.notify_waiters.load(Ordering::Acquire) > 0)
            && !drain.expired()
        {
            std::thread::sleep(Duration::from_millis(1));
        }

        shared.magic.store(0, Ordering::Release);
        if self.standalone {
            self.world.free(self.ptr)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Skirmish {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Skirmish").field("ptr", &self.ptr).finish()
    }
}

/// RAII guard returned by [`Skirmish::guard`].
#[must_use = "the skirmish is dismissed as soon as the guard is dropped"]
pub struct SkirmishGuard<'a> {
    skirmish: &'a Skirmish,
}

impl SkirmishGuard<'_> {
    /// Wait on the guarded skirmish; see [`Skirmish::wait`].
    pub fn wait(&self, timeout: Option<Duration>) -> Result<()> {
        self.skirmish.wait(timeout)
    }

    /// Notify one waiter; see [`Skirmish::notify`].
    pub fn notify(&self) -> Result<()> {
        self.skirmish.notify()
    }
}

impl Drop for SkirmishGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.skirmish.dismiss() {
            tracing::debug!(error = %e, "dismiss on guard drop failed");
        }
    }
}
