//! Memory management for Fusion.
//!
//! This module provides the memory layer every other primitive sits on:
//! segments that several processes map at different addresses, and the
//! allocator that carves them up.
//!
//! # Architecture
//!
//! - [`MemorySegment`]: Trait for memory backends (shared file mapping, heap)
//! - [`SharedMemoryPool`]: First-fit allocator over one segment
//! - [`ShmPtr`]: Position-independent pointer (pool id + offset)
//!
//! # Example
//!
//! ```rust
//! use fusion::memory::{HeapSegment, MemorySegment, PoolId, SharedMemoryPool};
//! use std::sync::Arc;
//!
//! let segment: Arc<dyn MemorySegment> = Arc::new(HeapSegment::new(64 * 1024).unwrap());
//! let pool = SharedMemoryPool::init(PoolId(1), segment, "scratch", false, 1).unwrap();
//!
//! let ptr = pool.allocate(128, true).unwrap();
//! assert_eq!(pool.stats().allocations, 1);
//! pool.deallocate(ptr).unwrap();
//! ```

mod heap;
mod pool;
mod ptr;
mod segment;
mod shared;

pub use heap::HeapSegment;
pub use pool::{ALLOC_ALIGN, LeakRecord, PoolGuard, PoolStats, SharedMemoryPool};
pub use ptr::{AtomicShmPtr, FixedName, NAME_LEN, Plain, PoolId, ShmPtr};
pub use segment::{MemorySegment, MemoryType};
pub use shared::SharedMemorySegment;
