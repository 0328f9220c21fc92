//! Memory segment trait and types.

use std::path::Path;

/// Type of memory backing a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MemoryType {
    /// File on a (normally tmpfs) filesystem, mapped `MAP_SHARED` by every
    /// World member.
    Shared,
    /// Process-local heap memory (single-process Worlds only).
    Heap,
}

impl MemoryType {
    /// Whether other processes can map the same memory.
    #[inline]
    pub fn supports_ipc(&self) -> bool {
        match self {
            MemoryType::Shared => true,
            MemoryType::Heap => false,
        }
    }
}

/// Trait for memory segment backends.
///
/// A segment is one contiguous mapping backing one pool. Different members
/// of a World map the same segment at different addresses, so nothing stored
/// inside a segment may contain an absolute address.
///
/// # Safety
///
/// Implementations must ensure that:
/// - The pointer stays valid and the mapping stays in place for the lifetime
///   of the segment
/// - The mapping is aligned to at least 64 bytes
/// - Thread-safety requirements are met (Send + Sync)
pub trait MemorySegment: Send + Sync {
    /// Base address of the mapping in this process.
    fn as_ptr(&self) -> *mut u8;

    /// Total size of the segment in bytes.
    fn len(&self) -> usize;

    /// Returns true if the segment has zero length.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The type of memory backing this segment.
    fn memory_type(&self) -> MemoryType;

    /// Backing file, if any.
    fn path(&self) -> Option<&Path> {
        None
    }

    /// Get the segment as a byte slice.
    ///
    /// # Safety
    ///
    /// The caller must ensure no other party writes the memory while the
    /// slice is alive.
    unsafe fn as_slice(&self) -> &[u8] {
        // SAFETY: Caller guarantees no concurrent writers.
        unsafe { std::slice::from_raw_parts(self.as_ptr(), self.len()) }
    }
}
