//! Block-and-wake on a 32-bit word in shared memory.
//!
//! Every blocking primitive in Fusion follows the same pattern: read a
//! sequence word under the lock that guards the awaited state, drop the lock,
//! then sleep on the word with [`wait`] as long as it still holds the value
//! that was read. Writers change the state, bump the sequence word under the
//! same lock and call [`wake`]. Because the kernel compares the word before
//! sleeping, a wakeup between "drop the lock" and "sleep" is never lost.
//!
//! The futex operations used here are the non-private variants, so they work
//! on words mapped `MAP_SHARED` by several processes.
//!
//! [`RawLock`] is the non-reentrant mutex built directly on top of this. It
//! guards allocator metadata and the bookkeeping fields of the higher level
//! primitives.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// Outcome of a single [`wait`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// Woken by [`wake`] (or spuriously).
    Woken,
    /// The word no longer held the expected value.
    Changed,
    /// The timeout elapsed.
    TimedOut,
}

/// Sleep while `word == expected`, at most `timeout` if given.
pub fn wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) -> WaitStatus {
    let ts = timeout.map(|t| libc::timespec {
        tv_sec: t.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
        tv_nsec: t.subsec_nanos() as libc::c_long,
    });
    let ts_ptr = ts
        .as_ref()
        .map_or(std::ptr::null(), |ts| ts as *const libc::timespec);

    // SAFETY: `word` is a valid, aligned u32 for the duration of the call and
    // FUTEX_WAIT only reads it.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAIT,
            expected,
            ts_ptr,
            std::ptr::null::<u32>(),
            0u32,
        )
    };

    if rc == 0 {
        return WaitStatus::Woken;
    }
    match std::io::Error::last_os_error().raw_os_error() {
        Some(libc::EAGAIN) => WaitStatus::Changed,
        Some(libc::ETIMEDOUT) => WaitStatus::TimedOut,
        // EINTR and anything unexpected: let the caller re-check its condition.
        _ => WaitStatus::Woken,
    }
}

/// Wake up to `count` sleepers on `word`. Returns how many were woken.
pub fn wake(word: &AtomicU32, count: u32) -> usize {
    let count = count.min(i32::MAX as u32);
    // SAFETY: FUTEX_WAKE does not access the word's contents.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAKE,
            count,
            std::ptr::null::<libc::timespec>(),
            std::ptr::null::<u32>(),
            0u32,
        )
    };
    if rc < 0 { 0 } else { rc as usize }
}

/// Wake one sleeper.
#[inline]
pub fn wake_one(word: &AtomicU32) -> usize {
    wake(word, 1)
}

/// Wake every sleeper.
#[inline]
pub fn wake_all(word: &AtomicU32) -> usize {
    wake(word, u32::MAX)
}

/// An optional point in time after which a blocking operation gives up.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    /// A deadline `timeout` from now, or none for `None`.
    pub fn after(timeout: Option<Duration>) -> Self {
        Self {
            at: timeout.map(|t| Instant::now() + t),
        }
    }

    /// A deadline that never expires.
    pub fn never() -> Self {
        Self { at: None }
    }

    /// Whether the deadline has passed.
    pub fn expired(&self) -> bool {
        self.at.is_some_and(|at| Instant::now() >= at)
    }

    /// How long to sleep next: the time left, capped at `slice`.
    ///
    /// Returns `None` once the deadline has passed.
    pub fn next_slice(&self, slice: Duration) -> Option<Duration> {
        match self.at {
            None => Some(slice),
            Some(at) => {
                let left = at.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    None
                } else {
                    Some(left.min(slice))
                }
            }
        }
    }
}

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;
const CONTENDED: u32 = 2;

/// A non-reentrant mutex word living in shared memory.
///
/// Three states: unlocked, locked, locked with sleepers. Only the transition
/// out of the contended state issues a wake syscall.
#[repr(C)]
#[derive(Debug)]
pub struct RawLock {
    state: AtomicU32,
}

impl RawLock {
    /// An unlocked lock.
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(UNLOCKED),
        }
    }

    /// Reset to unlocked. Only valid while no other party can see the word.
    pub fn init(&self) {
        self.state.store(UNLOCKED, Ordering::Release);
    }

    /// Acquire, sleeping while another party holds it.
    pub fn lock(&self) {
        if self
            .state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }

        // Short spin before sleeping; critical sections are tiny.
        for _ in 0..64 {
            std::hint::spin_loop();
            if self
                .state
                .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }

        while self.state.swap(CONTENDED, Ordering::Acquire) != UNLOCKED {
            wait(&self.state, CONTENDED, None);
        }
    }

    /// Acquire without blocking.
    pub fn try_lock(&self) -> bool {
        self.state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Release. Must only be called by the party that locked it.
    pub fn unlock(&self) {
        if self.state.swap(UNLOCKED, Ordering::Release) == CONTENDED {
            wake_one(&self.state);
        }
    }

    /// Acquire and return a guard that releases on drop.
    pub fn guard(&self) -> RawLockGuard<'_> {
        self.lock();
        RawLockGuard { lock: self }
    }

    /// Whether the lock is currently held by anyone (snapshot).
    pub fn is_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) != UNLOCKED
    }
}

impl Default for RawLock {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard for [`RawLock`].
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct RawLockGuard<'a> {
    lock: &'a RawLock,
}

impl Drop for RawLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}
