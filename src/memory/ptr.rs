//! Position-independent pointers and fixed-size shared fields.

use crate::error::{Error, Result};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

const OFFSET_BITS: u32 = 48;
const OFFSET_MASK: u64 = (1 << OFFSET_BITS) - 1;

/// Identifier of a pool within a World. Never reused while the World exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolId(pub u16);

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pool({})", self.0)
    }
}

/// A pointer into a shared pool: pool id in the upper 16 bits, byte offset
/// from the pool base in the lower 48.
///
/// Every member maps pools at its own address, so shared structures store
/// `ShmPtr`s and each process resolves them through its own base table.
/// Offset 0 is always the pool header, which makes the all-zero value a
/// usable null.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[repr(transparent)]
pub struct ShmPtr(u64);

impl ShmPtr {
    /// The null pointer.
    pub const NULL: ShmPtr = ShmPtr(0);

    /// Build a pointer from a pool id and offset.
    pub fn new(pool: PoolId, offset: u64) -> Self {
        debug_assert!(offset <= OFFSET_MASK, "offset out of range");
        Self(((pool.0 as u64) << OFFSET_BITS) | (offset & OFFSET_MASK))
    }

    /// Pool the pointer refers into.
    #[inline]
    pub fn pool(self) -> PoolId {
        PoolId((self.0 >> OFFSET_BITS) as u16)
    }

    /// Offset from the pool base.
    #[inline]
    pub fn offset(self) -> u64 {
        self.0 & OFFSET_MASK
    }

    /// Whether this is [`ShmPtr::NULL`].
    #[inline]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// A pointer `bytes` further into the same pool.
    #[inline]
    pub fn add(self, bytes: u64) -> Self {
        Self::new(self.pool(), self.offset() + bytes)
    }

    /// The raw 64-bit encoding, for storing in shared atomics.
    #[inline]
    pub fn to_raw(self) -> u64 {
        self.0
    }

    /// Rebuild from [`to_raw`](Self::to_raw).
    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Debug for ShmPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "ShmPtr(null)")
        } else {
            write!(f, "ShmPtr({}:{:#x})", self.pool().0, self.offset())
        }
    }
}

/// An atomic [`ShmPtr`] slot inside a shared structure.
#[repr(transparent)]
#[derive(Debug, Default)]
pub struct AtomicShmPtr(AtomicU64);

impl AtomicShmPtr {
    /// A null slot.
    pub const fn null() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Load the pointer.
    #[inline]
    pub fn load(&self) -> ShmPtr {
        ShmPtr(self.0.load(Ordering::Acquire))
    }

    /// Store a pointer.
    #[inline]
    pub fn store(&self, ptr: ShmPtr) {
        self.0.store(ptr.0, Ordering::Release);
    }

    /// Store a pointer and return the previous one.
    #[inline]
    pub fn swap(&self, ptr: ShmPtr) -> ShmPtr {
        ShmPtr(self.0.swap(ptr.0, Ordering::AcqRel))
    }
}

/// Maximum length in bytes of a [`FixedName`].
pub const NAME_LEN: usize = 32;

/// A short UTF-8 name stored inline in shared memory.
///
/// Stored as four atomic words so it can be rewritten in place while other
/// members may be reading it (readers take the owning lock to get a
/// consistent value).
#[repr(C)]
#[derive(Debug, Default)]
pub struct FixedName {
    words: [AtomicU64; NAME_LEN / 8],
}

impl FixedName {
    /// Store `name`, failing if it is longer than [`NAME_LEN`] bytes or
    /// contains NUL.
    pub fn store(&self, name: &str) -> Result<()> {
        let bytes = name.as_bytes();
        if bytes.len() > NAME_LEN {
            return Err(Error::InvalidArgument(format!(
                "name {:?} longer than {} bytes",
                name, NAME_LEN
            )));
        }
        if bytes.contains(&0) {
            return Err(Error::InvalidArgument(format!("name {:?} contains NUL", name)));
        }

        let mut buf = [0u8; NAME_LEN];
        buf[..bytes.len()].copy_from_slice(bytes);
        for (word, chunk) in self.words.iter().zip(buf.chunks_exact(8)) {
            let mut le = [0u8; 8];
            le.copy_from_slice(chunk);
            word.store(u64::from_le_bytes(le), Ordering::Release);
        }
        Ok(())
    }

    /// Reset to the empty name.
    pub fn clear(&self) {
        for word in &self.words {
            word.store(0, Ordering::Release);
        }
    }

    /// Load the name.
    pub fn load(&self) -> String {
        let mut buf = [0u8; NAME_LEN];
        for (word, chunk) in self.words.iter().zip(buf.chunks_exact_mut(8)) {
            chunk.copy_from_slice(&word.load(Ordering::Acquire).to_le_bytes());
        }
        let len = buf.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
        String::from_utf8_lossy(&buf[..len]).into_owned()
    }

    /// Whether the stored name equals `name`.
    pub fn matches(&self, name: &str) -> bool {
        !name.is_empty() && self.load() == name
    }

    /// Whether no name is stored.
    pub fn is_empty(&self) -> bool {
        self.words[0].load(Ordering::Acquire) == 0
    }
}

/// Types that can be copied into and out of shared memory byte for byte.
///
/// # Safety
///
/// Implementors must be `#[repr(C)]` (or primitive), contain no pointers,
/// references or padding-sensitive invariants, and every bit pattern must
/// be a valid value.
pub unsafe trait Plain: Copy + Send + Sync + 'static {}

macro_rules! impl_plain {
    ($($t:ty),*) => {
        $(unsafe impl Plain for $t {})*
    };
}

impl_plain!(u8, u16, u32, u64, i8, i16, i32, i64, f32, f64, usize, isize);

unsafe impl<T: Plain, const N: usize> Plain for [T; N] {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shm_ptr_encoding() {
        let ptr = ShmPtr::new(PoolId(7), 0x1234_5678);
        assert_eq!(ptr.pool(), PoolId(7));
        assert_eq!(ptr.offset(), 0x1234_5678);
        assert!(!ptr.is_null());
        assert_eq!(ShmPtr::from_raw(ptr.to_raw()), ptr);
        assert_eq!(ptr.add(16).offset(), 0x1234_5688);
        assert!(ShmPtr::NULL.is_null());
        assert_eq!(format!("{:?}", ptr), "ShmPtr(7:0x12345678)");
    }

    #[test]
    fn test_atomic_shm_ptr() {
        let slot = AtomicShmPtr::null();
        assert!(slot.load().is_null());
        let ptr = ShmPtr::new(PoolId(1), 64);
        slot.store(ptr);
        assert_eq!(slot.swap(ShmPtr::NULL), ptr);
        assert!(slot.load().is_null());
    }

    #[test]
    fn test_fixed_name() {
        let name = FixedName::default();
        assert!(name.is_empty());
        name.store("surface-pool").unwrap();
        assert_eq!(name.load(), "surface-pool");
        assert!(name.matches("surface-pool"));
        assert!(!name.matches("surface"));

        let exact = "x".repeat(NAME_LEN);
        name.store(&exact).unwrap();
        assert_eq!(name.load(), exact);

        assert!(name.store(&"x".repeat(NAME_LEN + 1)).is_err());
        assert!(name.store("a\0b").is_err());

        name.clear();
        assert!(name.is_empty());
        assert!(!name.matches(""));
    }
}
