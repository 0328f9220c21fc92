//! Heap-backed memory segment.

use super::{MemorySegment, MemoryType};
use crate::error::{Error, Result};
use std::alloc::Layout;
use std::ptr::NonNull;

/// Alignment of heap segments; matches what `mmap` gives shared segments.
const SEGMENT_ALIGN: usize = 4096;

/// A memory segment backed by a zeroed heap allocation.
///
/// Used by [`MemoryPolicy::Local`](crate::MemoryPolicy::Local) Worlds: the
/// same allocator and primitives run on top of it, without any cross-process
/// guarantee.
///
/// # Example
///
/// ```rust
/// use fusion::memory::{HeapSegment, MemorySegment};
///
/// let segment = HeapSegment::new(1024).unwrap();
/// assert_eq!(segment.len(), 1024);
/// ```
pub struct HeapSegment {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl HeapSegment {
    /// Create a new zero-initialized heap segment.
    ///
    /// # Errors
    ///
    /// Returns an error if size is 0, and [`Error::NoLocalMemory`] if the
    /// allocation fails.
    pub fn new(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::InvalidArgument(
                "segment size must be greater than 0".into(),
            ));
        }

        let layout = Layout::from_size_align(size, SEGMENT_ALIGN)
            .map_err(|e| Error::InvalidArgument(e.to_string()))?;

        // SAFETY: layout has non-zero size.
        let raw = unsafe { std::alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(Error::NoLocalMemory)?;

        Ok(Self { ptr, layout })
    }
}

impl MemorySegment for HeapSegment {
    fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    fn len(&self) -> usize {
        self.layout.size()
    }

    fn memory_type(&self) -> MemoryType {
        MemoryType::Heap
    }
}

impl Drop for HeapSegment {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with the same layout.
        unsafe { std::alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

// SAFETY: plain memory; structures inside synchronize through atomics.
unsafe impl Send for HeapSegment {}
unsafe impl Sync for HeapSegment {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heap_segment_creation() {
        let segment = HeapSegment::new(1024).unwrap();
        assert_eq!(segment.len(), 1024);
        assert_eq!(segment.memory_type(), MemoryType::Heap);
        assert!(segment.path().is_none());
        assert_eq!(segment.as_ptr() as usize % SEGMENT_ALIGN, 0);
    }

    #[test]
    fn test_heap_segment_zero_size_fails() {
        assert!(HeapSegment::new(0).is_err());
    }

    #[test]
    fn test_heap_segment_is_zeroed() {
        let segment = HeapSegment::new(1024).unwrap();
        unsafe {
            assert!(segment.as_slice().iter().all(|&b| b == 0));
        }
    }
}
