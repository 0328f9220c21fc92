//! Per-member message queues in the main pool.
//!
//! Every World member owns one mailbox. Other members append messages to it
//! (reactor deliveries, call requests) and bump its sequence word; the
//! member's dispatcher thread sleeps on that word and drains the queue.
//! Messages are allocated from the main pool by the sender and linked into
//! the queue by their [`ShmPtr`], so the queue itself never copies payloads.

use crate::error::{Error, Result};
use crate::futex::{self, RawLock};
use crate::memory::{AtomicShmPtr, SharedMemoryPool, ShmPtr};
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

/// A notification for a reactor.
pub(crate) const KIND_REACTION: u32 = 1;
/// A request for a call owned by the receiving member.
pub(crate) const KIND_CALL: u32 = 2;
/// Another member destroyed a call owned by the receiving member.
pub(crate) const KIND_CALL_DESTROYED: u32 = 3;

/// The sender does not wait for a result.
pub(crate) const FLAG_ONEWAY: u32 = 1 << 0;
/// The request occupies one quota slot of its caller.
pub(crate) const FLAG_QUOTA: u32 = 1 << 1;

/// The request has not been answered yet.
pub(crate) const STATE_PENDING: u32 = 0;
/// The result fields are valid.
pub(crate) const STATE_DONE: u32 = 1;
/// The requester gave up; whoever finishes the request frees it.
pub(crate) const STATE_ABANDONED: u32 = 2;

#[repr(C)]
pub(crate) struct MailboxShared {
    lock: RawLock,
    /// Bumped on every post; the dispatcher sleeps on it.
    seq: AtomicU32,
    pending: AtomicU32,
    closed: AtomicU32,
    head: AtomicShmPtr,
    tail: AtomicShmPtr,
}

#[repr(C)]
pub(crate) struct MessageHeader {
    pub next: AtomicShmPtr,
    pub kind: AtomicU32,
    pub flags: AtomicU32,
    pub sender: AtomicU32,
    pub call_arg: AtomicI32,
    /// Reactor or call the message is addressed to.
    pub target: AtomicShmPtr,
    pub serial: AtomicU64,
    /// Futex word of a blocking request.
    pub state: AtomicU32,
    pub result: AtomicU32,
    pub ret_val: AtomicI32,
    pub len: AtomicU32,
    /// Id of the addressed call; the target block may have been reused.
    pub call_id: AtomicU32,
}

/// Header size rounded up so payloads start 16-aligned.
const MESSAGE_HEADER: usize = (std::mem::size_of::<MessageHeader>() + 15) & !15;

/// A message resolved in this process.
pub(crate) struct Message<'a> {
    pub ptr: ShmPtr,
    pub header: &'a MessageHeader,
    pool: &'a SharedMemoryPool,
}

impl<'a> Message<'a> {
    /// Allocate a message in `pool` and copy `payload` behind its header.
    pub fn create(
        pool: &'a SharedMemoryPool,
        kind: u32,
        sender: u32,
        target: ShmPtr,
        payload: &[u8],
    ) -> Result<Self> {
        let len = u32::try_from(payload.len())
            .map_err(|_| Error::InvalidArgument("message payload too large".into()))?;
        let ptr = pool.allocate(MESSAGE_HEADER + payload.len(), true)?;
        let message = match Self::open(pool, ptr) {
            Ok(message) => message,
            Err(e) => {
                let _ = pool.deallocate(ptr);
                return Err(e);
            }
        };

        let h = message.header;
        h.kind.store(kind, Ordering::Relaxed);
        h.sender.store(sender, Ordering::Relaxed);
        h.target.store(target);
        h.state.store(STATE_PENDING, Ordering::Relaxed);
        h.len.store(len, Ordering::Relaxed);
        if !payload.is_empty() {
            let dst = pool.resolve(ptr.add(MESSAGE_HEADER as u64), payload.len())?;
            // SAFETY: fresh allocation of MESSAGE_HEADER + len bytes.
            unsafe {
                std::ptr::copy_nonoverlapping(payload.as_ptr(), dst.as_ptr(), payload.len());
            }
        }
        Ok(message)
    }

    /// Resolve an existing message.
    pub fn open(pool: &'a SharedMemoryPool, ptr: ShmPtr) -> Result<Self> {
        // SAFETY: messages are only ever linked by `create`, whose header
        // consists of atomics.
        let header = unsafe { pool.get::<MessageHeader>(ptr)? };
        Ok(Self { ptr, header, pool })
    }

    /// The payload bytes.
    pub fn payload(&self) -> Result<&'a [u8]> {
        let len = self.header.len.load(Ordering::Relaxed) as usize;
        if len == 0 {
            return Ok(&[]);
        }
        let data = self.pool.resolve(self.ptr.add(MESSAGE_HEADER as u64), len)?;
        // SAFETY: written once by the sender before posting, never mutated
        // afterwards.
        Ok(unsafe { std::slice::from_raw_parts(data.as_ptr(), len) })
    }

    /// Mark a blocking request as answered and wake its requester.
    ///
    /// Returns false if the requester had already given up; the caller then
    /// owns the message and must free it.
    pub fn complete(&self, result: u32, ret_val: i32) -> bool {
        let h = self.header;
        h.result.store(result, Ordering::Relaxed);
        h.ret_val.store(ret_val, Ordering::Relaxed);
        let done = h
            .state
            .compare_exchange(STATE_PENDING, STATE_DONE, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if done {
            futex::wake_all(&h.state);
        }
        done
    }

    /// Return the message to the pool.
    pub fn free(self) -> Result<()> {
        self.pool.deallocate(self.ptr)
    }

    /// Like [`free`](Self::free), logging instead of failing.
    pub fn discard(self) {
        let ptr = self.ptr;
        if let Err(e) = self.free() {
            tracing::debug!(message = ?ptr, error = %e, "freeing message failed");
        }
    }
}

/// One member's queue, resolved in this process.
pub(crate) struct Mailbox<'a> {
    shared: &'a MailboxShared,
    pool: &'a SharedMemoryPool,
}

impl<'a> Mailbox<'a> {
    /// Allocate an empty mailbox in `pool`.
    pub fn create(pool: &SharedMemoryPool) -> Result<ShmPtr> {
        // All-zero is an empty, open mailbox.
        pool.allocate(std::mem::size_of::<MailboxShared>(), true)
    }

    /// Resolve the mailbox at `ptr`.
    pub fn open(pool: &'a SharedMemoryPool, ptr: ShmPtr) -> Result<Self> {
        if ptr.is_null() {
            return Err(Error::Dead);
        }
        // SAFETY: mailboxes are created by `create` and consist of atomics.
        let shared = unsafe { pool.get::<MailboxShared>(ptr)? };
        Ok(Self { shared, pool })
    }

    /// Append a message. Fails [`Error::Dead`] once the mailbox is closed.
    pub fn post(&self, message: ShmPtr) -> Result<()> {
        let m = Message::open(self.pool, message)?;
        m.header.next.store(ShmPtr::NULL);

        {
            let _guard = self.shared.lock.guard();
            if self.shared.closed.load(Ordering::Relaxed) != 0 {
                return Err(Error::Dead);
            }
            let tail = self.shared.tail.load();
            if tail.is_null() {
                self.shared.head.store(message);
            } else {
                Message::open(self.pool, tail)?.header.next.store(message);
            }
            self.shared.tail.store(message);
            self.shared.pending.fetch_add(1, Ordering::Relaxed);
            self.shared.seq.fetch_add(1, Ordering::Release);
        }

        futex::wake_one(&self.shared.seq);
        Ok(())
    }

    /// Unlink the oldest message.
    pub fn take(&self) -> Result<Option<ShmPtr>> {
        let _guard = self.shared.lock.guard();
        let head = self.shared.head.load();
        if head.is_null() {
            return Ok(None);
        }
        let next = Message::open(self.pool, head)?.header.next.load();
        self.shared.head.store(next);
        if next.is_null() {
            self.shared.tail.store(ShmPtr::NULL);
        }
        self.shared.pending.fetch_sub(1, Ordering::Relaxed);
        Ok(Some(head))
    }

    /// Refuse further posts and wake the dispatcher.
    pub fn close(&self) {
        {
            let _guard = self.shared.lock.guard();
            self.shared.closed.store(1, Ordering::Relaxed);
            self.shared.seq.fetch_add(1, Ordering::Release);
        }
        futex::wake_all(&self.shared.seq);
    }

    /// Current sequence value; read before draining.
    pub fn seq(&self) -> u32 {
        self.shared.seq.load(Ordering::Acquire)
    }

    /// Sleep until the sequence moves past `seen`, at most `timeout`.
    pub fn wait(&self, seen: u32, timeout: Duration) {
        futex::wait(&self.shared.seq, seen, Some(timeout));
    }

    /// Number of queued messages.
    pub fn pending(&self) -> u32 {
        self.shared.pending.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{HeapSegment, MemorySegment, PoolId};
    use std::sync::Arc;

    fn pool() -> SharedMemoryPool {
        let segment: Arc<dyn MemorySegment> = Arc::new(HeapSegment::new(256 * 1024).unwrap());
        SharedMemoryPool::init(PoolId(0), segment, "main", false, 1).unwrap()
    }

    #[test]
    fn test_fifo_order() {
        let pool = pool();
        let mailbox_ptr = Mailbox::create(&pool).unwrap();
        let mailbox = Mailbox::open(&pool, mailbox_ptr).unwrap();

        for i in 0..3u8 {
            let m = Message::create(&pool, KIND_REACTION, 1, ShmPtr::NULL, &[i; 5]).unwrap();
            mailbox.post(m.ptr).unwrap();
        }
        assert_eq!(mailbox.pending(), 3);

        for i in 0..3u8 {
            let ptr = mailbox.take().unwrap().unwrap();
            let m = Message::open(&pool, ptr).unwrap();
            assert_eq!(m.payload().unwrap(), &[i; 5]);
            m.free().unwrap();
        }
        assert!(mailbox.take().unwrap().is_none());
        assert_eq!(pool.stats().allocations, 1);
    }

    #[test]
    fn test_closed_mailbox_rejects_posts() {
        let pool = pool();
        let mailbox = Mailbox::open(&pool, Mailbox::create(&pool).unwrap()).unwrap();
        mailbox.close();
        let m = Message::create(&pool, KIND_CALL, 1, ShmPtr::NULL, &[]).unwrap();
        assert!(matches!(mailbox.post(m.ptr), Err(Error::Dead)));
        assert!(m.payload().unwrap().is_empty());
    }

    #[test]
    fn test_post_bumps_sequence() {
        let pool = pool();
        let mailbox = Mailbox::open(&pool, Mailbox::create(&pool).unwrap()).unwrap();
        let seen = mailbox.seq();
        let m = Message::create(&pool, KIND_REACTION, 1, ShmPtr::NULL, b"x").unwrap();
        mailbox.post(m.ptr).unwrap();
        assert_ne!(mailbox.seq(), seen);
        // Sequence already moved: returns immediately.
        mailbox.wait(seen, Duration::from_secs(5));
    }

    #[test]
    fn test_complete_and_abandon() {
        let pool = pool();
        let m = Message::create(&pool, KIND_CALL, 1, ShmPtr::NULL, &[]).unwrap();
        assert!(m.complete(0, 42));
        assert_eq!(m.header.ret_val.load(Ordering::Relaxed), 42);

        let m = Message::create(&pool, KIND_CALL, 1, ShmPtr::NULL, &[]).unwrap();
        m.header.state.store(STATE_ABANDONED, Ordering::Relaxed);
        assert!(!m.complete(0, 1));
    }

    #[test]
    fn test_discard_tolerates_freed_message() {
        let pool = pool();
        let before = pool.stats().allocations;
        let m = Message::create(&pool, KIND_CALL, 1, ShmPtr::NULL, b"req").unwrap();
        let again = Message::open(&pool, m.ptr).unwrap();
        m.discard();
        assert_eq!(pool.stats().allocations, before);
        // Second free fails and is only logged.
        again.discard();
        assert_eq!(pool.stats().allocations, before);
    }
}
