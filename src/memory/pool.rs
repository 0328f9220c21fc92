//! Shared memory pool: a first-fit allocator over one segment.
//!
//! # Layout
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ PoolHeader (cache-line aligned)                              │
//! │   magic, version, pool id, name, attach count, lock,         │
//! │   free list head, usage counters, root pointer               │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Block │ Block │ Block │ ...                     up to max_size│
//! │ ┌───────────────────────────┐                                │
//! │ │ BlockHeader (32 bytes)    │  size, next_free, flags,       │
//! │ │                           │  owner FusionID, sequence      │
//! │ ├───────────────────────────┤                                │
//! │ │ user data (16-aligned)    │                                │
//! │ └───────────────────────────┘                                │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Blocks tile the heap region without gaps, so the whole heap can be
//! walked by size. Free blocks form a singly linked list ordered by address;
//! freeing coalesces with both neighbours. All metadata changes happen under
//! the pool's [`RawLock`], which lives in the header and is shared by every
//! member that maps the pool.

use super::{AtomicShmPtr, FixedName, MemorySegment, PoolId, ShmPtr};
use crate::error::{Error, Result};
use crate::futex::{RawLock, RawLockGuard};
use crate::observability;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Magic number identifying an initialized pool header ("FUSPOOL1").
const POOL_MAGIC: u64 = 0x4655_5350_4F4F_4C31;

/// Current pool format version.
const POOL_VERSION: u32 = 1;

/// Alignment of every allocation.
pub const ALLOC_ALIGN: u64 = 16;

/// Size of the per-block header.
const BLOCK_HEADER: u64 = std::mem::size_of::<BlockHeader>() as u64;

/// Blocks are never split into pieces smaller than this.
const MIN_BLOCK: u64 = 64;

const BLOCK_USED: u32 = 0x5553_4544; // "USED"
const BLOCK_FREE: u32 = 0x4652_4545; // "FREE"

#[repr(C, align(64))]
struct PoolHeader {
    magic: AtomicU64,
    version: AtomicU32,
    pool_id: AtomicU32,
    max_size: AtomicU64,
    heap_start: AtomicU64,
    heap_end: AtomicU64,
    debug: AtomicU32,
    attached: AtomicU32,
    lock: RawLock,
    destroyed: AtomicU32,
    free_head: AtomicU64,
    bytes_used: AtomicU64,
    allocations: AtomicU64,
    alloc_seq: AtomicU64,
    root: AtomicShmPtr,
    name: FixedName,
}

#[repr(C)]
struct BlockHeader {
    /// Total block size including this header.
    size: AtomicU64,
    /// Next free block (free blocks only), 0 terminates.
    next_free: AtomicU64,
    flags: AtomicU32,
    /// FusionID of the allocating member.
    owner: AtomicU32,
    /// Allocation sequence number, for leak reports.
    seq: AtomicU64,
}

/// Usage snapshot of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Size of the whole pool segment.
    pub max_size: usize,
    /// Bytes in allocated blocks, headers included.
    pub bytes_used: usize,
    /// Bytes in free blocks, headers included.
    pub free_bytes: usize,
    /// Number of live allocations.
    pub allocations: usize,
}

/// One entry of the allocation manifest kept by debug pools.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeakRecord {
    /// Pointer handed out by the allocator.
    pub ptr: ShmPtr,
    /// Usable size of the block.
    pub size: usize,
    /// FusionID of the member that allocated it.
    pub owner: u32,
    /// Allocation sequence number within the pool.
    pub seq: u64,
}

/// A named arena allocator over one shared segment.
///
/// Handles are cheap to clone; all clones in one process share the mapping.
/// Different processes have different handles onto the same memory.
#[derive(Clone)]
pub struct SharedMemoryPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    id: PoolId,
    segment: Arc<dyn MemorySegment>,
    /// FusionID stamped into blocks allocated through this handle.
    owner: u32,
}

fn block_size_for(size: usize) -> Option<u64> {
    let user = (size as u64).checked_add(ALLOC_ALIGN - 1)? & !(ALLOC_ALIGN - 1);
    Some(user.checked_add(BLOCK_HEADER)?.max(MIN_BLOCK))
}

impl SharedMemoryPool {
    /// Format a fresh segment as an empty pool.
    ///
    /// The segment must be zeroed and not yet visible to other members.
    pub fn init(
        id: PoolId,
        segment: Arc<dyn MemorySegment>,
        name: &str,
        debug: bool,
        owner: u32,
    ) -> Result<Self> {
        let len = segment.len() as u64;
        let heap_start = (std::mem::size_of::<PoolHeader>() as u64 + 63) & !63;
        let heap_end = len & !(ALLOC_ALIGN - 1);
        if heap_end < heap_start + MIN_BLOCK {
            return Err(Error::InvalidArgument(format!(
                "pool {:?} of {} bytes is too small",
                name, len
            )));
        }

        let pool = Self {
            inner: Arc::new(PoolInner { id, segment, owner }),
        };

        let h = pool.header();
        h.name.store(name)?;
        h.version.store(POOL_VERSION, Ordering::Relaxed);
        h.pool_id.store(id.0 as u32, Ordering::Relaxed);
        h.max_size.store(len, Ordering::Relaxed);
        h.heap_start.store(heap_start, Ordering::Relaxed);
        h.heap_end.store(heap_end, Ordering::Relaxed);
        h.debug.store(debug as u32, Ordering::Relaxed);
        h.attached.store(1, Ordering::Relaxed);
        h.lock.init();
        h.destroyed.store(0, Ordering::Relaxed);
        h.bytes_used.store(0, Ordering::Relaxed);
        h.allocations.store(0, Ordering::Relaxed);
        h.alloc_seq.store(0, Ordering::Relaxed);
        h.root.store(ShmPtr::NULL);

        let first = pool.block(heap_start)?;
        first.size.store(heap_end - heap_start, Ordering::Relaxed);
        first.next_free.store(0, Ordering::Relaxed);
        first.flags.store(BLOCK_FREE, Ordering::Relaxed);
        h.free_head.store(heap_start, Ordering::Relaxed);

        // Publish last.
        h.magic.store(POOL_MAGIC, Ordering::Release);

        let debug_pool = debug;
        tracing::debug!(pool = %id, name, size = len, debug_pool, "pool initialized");
        Ok(pool)
    }

    /// Open a pool formatted by another member (or earlier by this one).
    pub fn open(id: PoolId, segment: Arc<dyn MemorySegment>, owner: u32) -> Result<Self> {
        if segment.len() < std::mem::size_of::<PoolHeader>() {
            return Err(Error::InvalidSegment(format!(
                "segment of {} too small for pool header",
                id
            )));
        }
        let pool = Self {
            inner: Arc::new(PoolInner { id, segment, owner }),
        };
        pool.validate()?;
        Ok(pool)
    }

    fn validate(&self) -> Result<()> {
        let h = self.header();
        let magic = h.magic.load(Ordering::Acquire);
        if magic != POOL_MAGIC {
            return Err(Error::InvalidSegment(format!(
                "invalid pool magic: expected {:x}, got {:x}",
                POOL_MAGIC, magic
            )));
        }
        let version = h.version.load(Ordering::Acquire);
        if version != POOL_VERSION {
            return Err(Error::InvalidSegment(format!(
                "unsupported pool version: expected {}, got {}",
                POOL_VERSION, version
            )));
        }
        let id = h.pool_id.load(Ordering::Acquire);
        if id != self.inner.id.0 as u32 {
            return Err(Error::InvalidSegment(format!(
                "pool id mismatch: expected {}, got {}",
                self.inner.id.0, id
            )));
        }
        Ok(())
    }

    fn header(&self) -> &PoolHeader {
        // SAFETY: the segment is at least header-sized (checked in init/open),
        // page aligned, and the header only contains atomics.
        unsafe { &*(self.inner.segment.as_ptr() as *const PoolHeader) }
    }

    fn block(&self, offset: u64) -> Result<&BlockHeader> {
        let h = self.header();
        let heap_start = h.heap_start.load(Ordering::Relaxed);
        let heap_end = h.heap_end.load(Ordering::Relaxed);
        if offset < heap_start
            || offset % ALLOC_ALIGN != 0
            || offset + BLOCK_HEADER > heap_end
        {
            debug_assert!(false, "block offset {:#x} out of heap", offset);
            return Err(Error::InvalidSegment(format!(
                "block offset {:#x} outside heap of {}",
                offset, self.inner.id
            )));
        }
        // SAFETY: bounds and alignment checked above.
        Ok(unsafe { &*(self.inner.segment.as_ptr().add(offset as usize) as *const BlockHeader) })
    }

    /// Block offset for a pointer handed out by this pool.
    fn block_offset(&self, ptr: ShmPtr) -> Result<u64> {
        if ptr.pool() != self.inner.id {
            return Err(Error::InvalidArgument(format!(
                "{:?} does not belong to {}",
                ptr, self.inner.id
            )));
        }
        let offset = ptr
            .offset()
            .checked_sub(BLOCK_HEADER)
            .ok_or_else(|| Error::InvalidArgument(format!("{:?} is not a block", ptr)))?;
        Ok(offset)
    }

    fn used_block(&self, ptr: ShmPtr) -> Result<(u64, &BlockHeader)> {
        let offset = self.block_offset(ptr)?;
        let block = self.block(offset)?;
        if block.flags.load(Ordering::Relaxed) != BLOCK_USED {
            return Err(Error::InvalidArgument(format!(
                "{:?} is not an allocated block",
                ptr
            )));
        }
        Ok((offset, block))
    }

    fn link(&self, prev: u64, next: u64) -> Result<()> {
        if prev == 0 {
            self.header().free_head.store(next, Ordering::Relaxed);
        } else {
            self.block(prev)?.next_free.store(next, Ordering::Relaxed);
        }
        Ok(())
    }

    fn write_free_block(&self, offset: u64, size: u64, next: u64) -> Result<()> {
        let block = self.block(offset)?;
        block.size.store(size, Ordering::Relaxed);
        block.next_free.store(next, Ordering::Relaxed);
        block.flags.store(BLOCK_FREE, Ordering::Relaxed);
        block.owner.store(0, Ordering::Relaxed);
        block.seq.store(0, Ordering::Relaxed);
        Ok(())
    }

    fn alloc_locked(&self, size: usize, clear: bool) -> Result<ShmPtr> {
        let h = self.header();
        let need = block_size_for(size).ok_or(Error::NoSharedMemory { requested: size })?;

        let mut prev = 0u64;
        let mut cur = h.free_head.load(Ordering::Relaxed);
        while cur != 0 {
            let block = self.block(cur)?;
            let have = block.size.load(Ordering::Relaxed);
            let next = block.next_free.load(Ordering::Relaxed);

            if have >= need {
                let taken = if have - need >= MIN_BLOCK {
                    let rest = cur + need;
                    self.write_free_block(rest, have - need, next)?;
                    self.link(prev, rest)?;
                    need
                } else {
                    self.link(prev, next)?;
                    have
                };

                block.size.store(taken, Ordering::Relaxed);
                block.next_free.store(0, Ordering::Relaxed);
                block.flags.store(BLOCK_USED, Ordering::Relaxed);
                block.owner.store(self.inner.owner, Ordering::Relaxed);
                let seq = h.alloc_seq.fetch_add(1, Ordering::Relaxed) + 1;
                block.seq.store(seq, Ordering::Relaxed);

                let used = h.bytes_used.fetch_add(taken, Ordering::Relaxed) + taken;
                h.allocations.fetch_add(1, Ordering::Relaxed);
                observability::record_pool_bytes_used(self.inner.id.0, used);

                let data = cur + BLOCK_HEADER;
                if clear {
                    // SAFETY: [data, cur + taken) lies inside the heap and is
                    // exclusively ours now.
                    unsafe {
                        std::ptr::write_bytes(
                            self.inner.segment.as_ptr().add(data as usize),
                            0,
                            (taken - BLOCK_HEADER) as usize,
                        );
                    }
                }

                tracing::trace!(pool = %self.inner.id, offset = data, size, "allocated");
                return Ok(ShmPtr::new(self.inner.id, data));
            }

            prev = cur;
            cur = next;
        }

        tracing::debug!(pool = %self.inner.id, size, "shared pool exhausted");
        observability::record_pool_exhausted(self.inner.id.0);
        Err(Error::NoSharedMemory { requested: size })
    }

    fn free_locked(&self, ptr: ShmPtr) -> Result<()> {
        let h = self.header();
        let (offset, block) = self.used_block(ptr)?;
        let size = block.size.load(Ordering::Relaxed);

        let used = h.bytes_used.fetch_sub(size, Ordering::Relaxed) - size;
        h.allocations.fetch_sub(1, Ordering::Relaxed);
        observability::record_pool_bytes_used(self.inner.id.0, used);

        // Find neighbours in the address-ordered free list.
        let mut prev = 0u64;
        let mut cur = h.free_head.load(Ordering::Relaxed);
        while cur != 0 && cur < offset {
            prev = cur;
            cur = self.block(cur)?.next_free.load(Ordering::Relaxed);
        }

        let mut merged = size;
        let mut next = cur;
        if cur != 0 && offset + size == cur {
            let right = self.block(cur)?;
            merged += right.size.load(Ordering::Relaxed);
            next = right.next_free.load(Ordering::Relaxed);
            right.flags.store(0, Ordering::Relaxed);
        }

        if prev != 0 {
            let left = self.block(prev)?;
            let left_size = left.size.load(Ordering::Relaxed);
            if prev + left_size == offset {
                left.size.store(left_size + merged, Ordering::Relaxed);
                left.next_free.store(next, Ordering::Relaxed);
                block.flags.store(0, Ordering::Relaxed);
                tracing::trace!(pool = %self.inner.id, offset = ptr.offset(), "freed");
                return Ok(());
            }
        }

        self.write_free_block(offset, merged, next)?;
        self.link(prev, offset)?;
        tracing::trace!(pool = %self.inner.id, offset = ptr.offset(), "freed");
        Ok(())
    }

    fn realloc_locked(&self, ptr: ShmPtr, size: usize) -> Result<ShmPtr> {
        if ptr.is_null() {
            return self.alloc_locked(size, false);
        }

        let h = self.header();
        let (offset, block) = self.used_block(ptr)?;
        let have = block.size.load(Ordering::Relaxed);
        let need = block_size_for(size).ok_or(Error::NoSharedMemory { requested: size })?;
        if need <= have {
            return Ok(ptr);
        }

        // Grow in place when the right neighbour is free and big enough.
        let right = offset + have;
        let mut prev = 0u64;
        let mut cur = h.free_head.load(Ordering::Relaxed);
        while cur != 0 && cur < right {
            prev = cur;
            cur = self.block(cur)?.next_free.load(Ordering::Relaxed);
        }
        if cur == right {
            let neighbour = self.block(cur)?;
            let total = have + neighbour.size.load(Ordering::Relaxed);
            let next = neighbour.next_free.load(Ordering::Relaxed);
            if total >= need {
                let grown = if total - need >= MIN_BLOCK {
                    let rest = offset + need;
                    self.write_free_block(rest, total - need, next)?;
                    self.link(prev, rest)?;
                    need
                } else {
                    neighbour.flags.store(0, Ordering::Relaxed);
                    self.link(prev, next)?;
                    total
                };
                block.size.store(grown, Ordering::Relaxed);
                h.bytes_used.fetch_add(grown - have, Ordering::Relaxed);
                tracing::trace!(pool = %self.inner.id, offset = ptr.offset(), size, "grown in place");
                return Ok(ptr);
            }
        }

        let moved = self.alloc_locked(size, false)?;
        // SAFETY: both ranges are live blocks of this pool and do not overlap.
        unsafe {
            let base = self.inner.segment.as_ptr();
            std::ptr::copy_nonoverlapping(
                base.add(ptr.offset() as usize),
                base.add(moved.offset() as usize),
                (have - BLOCK_HEADER) as usize,
            );
        }
        self.free_locked(ptr)?;
        Ok(moved)
    }

    /// Allocate `size` bytes, zeroing them if `clear` is set.
    ///
    /// Fails with [`Error::NoSharedMemory`] when no free block is large
    /// enough.
    pub fn allocate(&self, size: usize, clear: bool) -> Result<ShmPtr> {
        let _guard = self.header().lock.guard();
        self.alloc_locked(size, clear)
    }

    /// Resize an allocation, preserving its contents.
    ///
    /// A null `ptr` behaves like [`allocate`](Self::allocate).
    pub fn reallocate(&self, ptr: ShmPtr, size: usize) -> Result<ShmPtr> {
        let _guard = self.header().lock.guard();
        self.realloc_locked(ptr, size)
    }

    /// Return an allocation to the pool.
    pub fn deallocate(&self, ptr: ShmPtr) -> Result<()> {
        let _guard = self.header().lock.guard();
        self.free_locked(ptr)
    }

    /// Take the pool lock for a batch of operations.
    pub fn lock(&self) -> PoolGuard<'_> {
        PoolGuard {
            pool: self,
            _guard: self.header().lock.guard(),
        }
    }

    /// Usable size of an allocation.
    pub fn usable_size(&self, ptr: ShmPtr) -> Result<usize> {
        let _guard = self.header().lock.guard();
        let (_, block) = self.used_block(ptr)?;
        Ok((block.size.load(Ordering::Relaxed) - BLOCK_HEADER) as usize)
    }

    /// Resolve `len` bytes at `ptr` to an address in this process.
    pub fn resolve(&self, ptr: ShmPtr, len: usize) -> Result<NonNull<u8>> {
        if ptr.pool() != self.inner.id {
            return Err(Error::InvalidArgument(format!(
                "{:?} does not belong to {}",
                ptr, self.inner.id
            )));
        }
        let end = ptr.offset().checked_add(len as u64);
        if ptr.is_null() || end.is_none_or(|end| end > self.inner.segment.len() as u64) {
            return Err(Error::InvalidSegment(format!(
                "{:?} (+{} bytes) outside {}",
                ptr, len, self.inner.id
            )));
        }
        // SAFETY: in bounds of the mapping; the mapping is non-null.
        Ok(unsafe {
            NonNull::new_unchecked(self.inner.segment.as_ptr().add(ptr.offset() as usize))
        })
    }

    /// Borrow the shared structure at `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must point at an initialized `T` that is safe to access from
    /// several processes at once (atomics only), and the caller must not use
    /// the reference after the block is deallocated.
    pub unsafe fn get<T>(&self, ptr: ShmPtr) -> Result<&T> {
        let raw = self.resolve(ptr, std::mem::size_of::<T>())?;
        if raw.as_ptr() as usize % std::mem::align_of::<T>() != 0 {
            return Err(Error::InvalidSegment(format!(
                "{:?} misaligned for {}",
                ptr,
                std::any::type_name::<T>()
            )));
        }
        // SAFETY: in bounds and aligned; validity is the caller's contract.
        Ok(unsafe { &*(raw.as_ptr() as *const T) })
    }

    /// Increment the attach count. Returns the new count.
    pub fn attach(&self) -> u32 {
        self.header().attached.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrement the attach count. Returns the remaining count.
    pub fn detach(&self) -> u32 {
        let h = self.header();
        let mut current = h.attached.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return 0;
            }
            match h.attached.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return current - 1,
                Err(actual) => current = actual,
            }
        }
    }

    /// Current attach count.
    pub fn attach_count(&self) -> u32 {
        self.header().attached.load(Ordering::Acquire)
    }

    /// Mark the pool as torn down. Returns false if it already was.
    pub fn mark_destroyed(&self) -> bool {
        self.header().destroyed.swap(1, Ordering::AcqRel) == 0
    }

    /// Whether the pool was torn down.
    pub fn is_destroyed(&self) -> bool {
        self.header().destroyed.load(Ordering::Acquire) != 0
    }

    /// Publish the pool's root structure.
    pub fn set_root(&self, root: ShmPtr) {
        self.header().root.store(root);
    }

    /// The pool's root structure, null if none was published.
    pub fn root(&self) -> ShmPtr {
        self.header().root.load()
    }

    /// Pool id.
    pub fn id(&self) -> PoolId {
        self.inner.id
    }

    /// Pool name.
    pub fn name(&self) -> String {
        self.header().name.load()
    }

    /// Size of the whole pool segment.
    pub fn max_size(&self) -> usize {
        self.header().max_size.load(Ordering::Relaxed) as usize
    }

    /// Whether the pool keeps an allocation manifest.
    pub fn is_debug(&self) -> bool {
        self.header().debug.load(Ordering::Relaxed) != 0
    }

    /// The mapped segment.
    pub fn segment(&self) -> &Arc<dyn MemorySegment> {
        &self.inner.segment
    }

    /// Usage snapshot.
    pub fn stats(&self) -> PoolStats {
        let h = self.header();
        let _guard = h.lock.guard();
        let heap = h.heap_end.load(Ordering::Relaxed) - h.heap_start.load(Ordering::Relaxed);
        let used = h.bytes_used.load(Ordering::Relaxed);
        PoolStats {
            max_size: h.max_size.load(Ordering::Relaxed) as usize,
            bytes_used: used as usize,
            free_bytes: (heap - used) as usize,
            allocations: h.allocations.load(Ordering::Relaxed) as usize,
        }
    }

    /// Walk the heap and list every live allocation.
    ///
    /// Only debug pools keep the manifest; other pools return an empty list.
    pub fn leaks(&self) -> Vec<LeakRecord> {
        if !self.is_debug() {
            return Vec::new();
        }

        let h = self.header();
        let _guard = h.lock.guard();
        let heap_end = h.heap_end.load(Ordering::Relaxed);
        let mut offset = h.heap_start.load(Ordering::Relaxed);
        let mut records = Vec::new();

        while offset < heap_end {
            let Ok(block) = self.block(offset) else { break };
            let size = block.size.load(Ordering::Relaxed);
            if size < MIN_BLOCK || size % ALLOC_ALIGN != 0 {
                tracing::warn!(pool = %self.inner.id, offset, size, "corrupt block while walking heap");
                break;
            }
            if block.flags.load(Ordering::Relaxed) == BLOCK_USED {
                records.push(LeakRecord {
                    ptr: ShmPtr::new(self.inner.id, offset + BLOCK_HEADER),
                    size: (size - BLOCK_HEADER) as usize,
                    owner: block.owner.load(Ordering::Relaxed),
                    seq: block.seq.load(Ordering::Relaxed),
                });
            }
            offset += size;
        }

        records
    }
}

impl std::fmt::Debug for SharedMemoryPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMemoryPool")
            .field("id", &self.inner.id)
            .field("name", &self.name())
            .field("max_size", &self.max_size())
            .finish()
    }
}

/// The pool lock held across several allocator operations.
#[must_use = "the pool lock is released as soon as the guard is dropped"]
pub struct PoolGuard<'a> {
    pool: &'a SharedMemoryPool,
    _guard: RawLockGuard<'a>,
}

impl PoolGuard<'_> {
    /// [`SharedMemoryPool::allocate`] under the held lock.
    pub fn allocate(&self, size: usize, clear: bool) -> Result<ShmPtr> {
        self.pool.alloc_locked(size, clear)
    }

    /// [`SharedMemoryPool::reallocate`] under the held lock.
    pub fn reallocate(&self, ptr: ShmPtr, size: usize) -> Result<ShmPtr> {
        self.pool.realloc_locked(ptr, size)
    }

    /// [`SharedMemoryPool::deallocate`] under the held lock.
    pub fn deallocate(&self, ptr: ShmPtr) -> Result<()> {
        self.pool.free_locked(ptr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::HeapSegment;

    fn heap_pool(size: usize, debug: bool) -> SharedMemoryPool {
        let segment: Arc<dyn MemorySegment> = Arc::new(HeapSegment::new(size).unwrap());
        SharedMemoryPool::init(PoolId(3), segment, "test", debug, 1).unwrap()
    }

    fn bytes(pool: &SharedMemoryPool, ptr: ShmPtr, len: usize) -> &mut [u8] {
        let p = pool.resolve(ptr, len).unwrap();
        unsafe { std::slice::from_raw_parts_mut(p.as_ptr(), len) }
    }

    #[test]
    fn test_allocate_and_free_restores_stats() {
        let pool = heap_pool(64 * 1024, false);
        let before = pool.stats();
        assert_eq!(before.allocations, 0);
        assert_eq!(before.bytes_used, 0);

        let a = pool.allocate(100, true).unwrap();
        let b = pool.allocate(2000, false).unwrap();
        assert_eq!(a.pool(), PoolId(3));
        assert_eq!(a.offset() % ALLOC_ALIGN, 0);
        assert_eq!(b.offset() % ALLOC_ALIGN, 0);
        assert_ne!(a, b);
        assert!(pool.usable_size(a).unwrap() >= 100);
        assert_eq!(pool.stats().allocations, 2);

        pool.deallocate(a).unwrap();
        pool.deallocate(b).unwrap();
        let after = pool.stats();
        assert_eq!(after, before);
    }

    #[test]
    fn test_clear_zeroes_reused_memory() {
        let pool = heap_pool(64 * 1024, false);
        let a = pool.allocate(256, false).unwrap();
        bytes(&pool, a, 256).fill(0xAB);
        pool.deallocate(a).unwrap();

        let b = pool.allocate(256, true).unwrap();
        assert_eq!(a, b, "first fit reuses the same block");
        assert!(bytes(&pool, b, 256).iter().all(|&x| x == 0));
    }

    #[test]
    fn test_exhaustion_reports_no_shared_memory() {
        let pool = heap_pool(64 * 1024, false);
        match pool.allocate(1024 * 1024, false) {
            Err(Error::NoSharedMemory { requested }) => assert_eq!(requested, 1024 * 1024),
            other => panic!("unexpected {:?}", other),
        }

        let mut held = Vec::new();
        while let Ok(ptr) = pool.allocate(1000, false) {
            held.push(ptr);
        }
        assert!(!held.is_empty());
        for ptr in held {
            pool.deallocate(ptr).unwrap();
        }
        // Fully coalesced again: one big allocation fits.
        assert!(pool.allocate(60 * 1024, false).is_ok());
    }

    #[test]
    fn test_double_free_is_rejected() {
        let pool = heap_pool(64 * 1024, false);
        let a = pool.allocate(64, false).unwrap();
        pool.deallocate(a).unwrap();
        assert!(pool.deallocate(a).is_err());
    }

    #[test]
    fn test_foreign_pointer_is_rejected() {
        let pool = heap_pool(64 * 1024, false);
        let foreign = ShmPtr::new(PoolId(9), 4096);
        assert!(pool.deallocate(foreign).is_err());
        assert!(pool.resolve(foreign, 8).is_err());
        assert!(pool.resolve(ShmPtr::new(PoolId(3), 1 << 30), 8).is_err());
    }

    #[test]
    fn test_reallocate_grows_in_place_and_moves() {
        let pool = heap_pool(64 * 1024, false);
        let a = pool.allocate(32, false).unwrap();
        bytes(&pool, a, 32).copy_from_slice(&[7u8; 32]);

        // Right neighbour is the free remainder: grows in place.
        let grown = pool.reallocate(a, 512).unwrap();
        assert_eq!(grown, a);
        assert_eq!(&bytes(&pool, grown, 32)[..], &[7u8; 32]);

        // Block the right side, then growing must move.
        let blocker = pool.allocate(32, false).unwrap();
        let moved = pool.reallocate(grown, 4096).unwrap();
        assert_ne!(moved, grown);
        assert_eq!(&bytes(&pool, moved, 32)[..], &[7u8; 32]);
        assert_eq!(pool.stats().allocations, 2);

        // Shrinking keeps the block.
        assert_eq!(pool.reallocate(moved, 16).unwrap(), moved);

        pool.deallocate(moved).unwrap();
        pool.deallocate(blocker).unwrap();
        assert_eq!(pool.stats().allocations, 0);
    }

    #[test]
    fn test_guard_batches_operations() {
        let pool = heap_pool(64 * 1024, false);
        let guard = pool.lock();
        let a = guard.allocate(64, true).unwrap();
        let b = guard.allocate(64, true).unwrap();
        guard.deallocate(a).unwrap();
        let b = guard.reallocate(b, 128).unwrap();
        guard.deallocate(b).unwrap();
        drop(guard);
        assert_eq!(pool.stats().allocations, 0);
    }

    #[test]
    fn test_debug_manifest_lists_live_allocations() {
        let pool = heap_pool(64 * 1024, true);
        assert!(pool.is_debug());
        let a = pool.allocate(10, false).unwrap();
        let b = pool.allocate(20, false).unwrap();
        pool.deallocate(a).unwrap();

        let leaks = pool.leaks();
        assert_eq!(leaks.len(), 1);
        assert_eq!(leaks[0].ptr, b);
        assert_eq!(leaks[0].owner, 1);
        assert_eq!(leaks[0].seq, 2);
        assert!(leaks[0].size >= 20);

        let quiet = heap_pool(64 * 1024, false);
        quiet.allocate(10, false).unwrap();
        assert!(quiet.leaks().is_empty());
    }

    #[test]
    fn test_attach_detach_refcount() {
        let pool = heap_pool(64 * 1024, false);
        assert_eq!(pool.attach_count(), 1);
        assert_eq!(pool.attach(), 2);
        assert_eq!(pool.detach(), 1);
        assert_eq!(pool.detach(), 0);
        assert_eq!(pool.detach(), 0);
    }

    #[test]
    fn test_open_validates_header() {
        let segment: Arc<dyn MemorySegment> = Arc::new(HeapSegment::new(64 * 1024).unwrap());
        assert!(SharedMemoryPool::open(PoolId(1), Arc::clone(&segment), 1).is_err());

        let pool = SharedMemoryPool::init(PoolId(1), Arc::clone(&segment), "main", false, 1).unwrap();
        let root = pool.allocate(64, true).unwrap();
        pool.set_root(root);

        let other = SharedMemoryPool::open(PoolId(1), Arc::clone(&segment), 2).unwrap();
        assert_eq!(other.name(), "main");
        assert_eq!(other.root(), root);
        assert!(SharedMemoryPool::open(PoolId(2), segment, 2).is_err());
    }

    #[test]
    fn test_concurrent_allocations() {
        let pool = heap_pool(1024 * 1024, false);
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    for n in 0..200 {
                        let ptr = pool.allocate(16 + (n % 7) * 24, true).unwrap();
                        bytes(&pool, ptr, 16).fill(i as u8);
                        assert!(bytes(&pool, ptr, 16).iter().all(|&b| b == i as u8));
                        pool.deallocate(ptr).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(pool.stats().allocations, 0);
        assert_eq!(pool.stats().bytes_used, 0);
    }
}
