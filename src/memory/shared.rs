//! File-backed shared memory segment.
//!
//! Pools of a shared World are plain files in a tmpfs directory (`/dev/shm`
//! by default). Any member can map a pool knowing only the World index and
//! the pool id, which is what makes lazy resolution of [`ShmPtr`]s possible
//! without passing file descriptors around.
//!
//! [`ShmPtr`]: super::ShmPtr

use super::{MemorySegment, MemoryType};
use crate::error::{Error, Result};
use rustix::fd::{AsFd, BorrowedFd, OwnedFd};
use rustix::fs::{Mode, OFlags};
use rustix::mm::{MapFlags, ProtFlags};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

/// A shared mapping of a pool backing file.
pub struct SharedMemorySegment {
    /// The open backing file.
    fd: OwnedFd,
    /// Pointer to the mmap'd region.
    ptr: NonNull<u8>,
    /// Size of the segment.
    len: usize,
    /// Backing file path.
    path: PathBuf,
}

impl SharedMemorySegment {
    /// Create a new backing file of `size` bytes and map it.
    ///
    /// Fails with `EEXIST` (as [`Error::System`]) if the file already exists,
    /// which is how the first member of a World is elected.
    pub fn create<P: AsRef<Path>>(path: P, size: usize) -> Result<Self> {
        let path = path.as_ref();

        if size == 0 {
            return Err(Error::InvalidArgument(
                "segment size must be greater than 0".into(),
            ));
        }

        let fd = rustix::fs::open(
            path,
            OFlags::RDWR | OFlags::CREATE | OFlags::EXCL | OFlags::CLOEXEC,
            Mode::from_raw_mode(0o600),
        )?;

        // Sparse on tmpfs: pages are only backed once touched.
        if let Err(e) = rustix::fs::ftruncate(&fd, size as u64) {
            let _ = rustix::fs::unlink(path);
            return Err(e.into());
        }

        match Self::map(fd, size, path) {
            Ok(segment) => Ok(segment),
            Err(e) => {
                let _ = rustix::fs::unlink(path);
                Err(e)
            }
        }
    }

    /// Map an existing backing file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let fd = rustix::fs::open(path, OFlags::RDWR | OFlags::CLOEXEC, Mode::empty())?;

        let stat = rustix::fs::fstat(&fd)?;
        let size = stat.st_size as usize;
        if size == 0 {
            return Err(Error::InvalidSegment(format!(
                "{} is empty",
                path.display()
            )));
        }

        Self::map(fd, size, path)
    }

    fn map(fd: OwnedFd, size: usize, path: &Path) -> Result<Self> {
        let ptr = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )?
        };

        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| Error::InvalidSegment("mmap returned null".into()))?;

        Ok(Self {
            fd,
            ptr,
            len: size,
            path: path.to_path_buf(),
        })
    }

    /// Remove the backing file. Existing mappings stay valid.
    pub fn unlink(&self) -> Result<()> {
        match rustix::fs::unlink(&self.path) {
            Ok(()) | Err(rustix::io::Errno::NOENT) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl MemorySegment for SharedMemorySegment {
    fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    fn len(&self) -> usize {
        self.len
    }

    fn memory_type(&self) -> MemoryType {
        MemoryType::Shared
    }

    fn path(&self) -> Option<&Path> {
        Some(&self.path)
    }
}

impl Drop for SharedMemorySegment {
    fn drop(&mut self) {
        unsafe {
            let _ = rustix::mm::munmap(self.ptr.as_ptr().cast(), self.len);
        }
    }
}

// SAFETY: the mapping is plain shared memory; all structures placed in it
// synchronize through atomics.
unsafe impl Send for SharedMemorySegment {}
unsafe impl Sync for SharedMemorySegment {}

impl AsFd for SharedMemorySegment {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}
