//! File-backed shared memory segment.
//!
//! A segment is a plain file on a tmpfs-class mount, mapped `MAP_SHARED`
//! into every attaching process. The master creates and truncates the file;
//! slaves attach to it by path. The mapping base differs between processes,
//! which is why everything stored inside a segment uses offsets.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

use rustix::fd::OwnedFd;
use rustix::fs::{Mode, OFlags};
use rustix::mm::{MapFlags, ProtFlags};

use crate::error::{Error, Result};

/// A file-backed shared memory segment.
pub struct Segment {
    /// The backing file descriptor.
    fd: OwnedFd,
    /// Pointer to the mmap'd region.
    ptr: NonNull<u8>,
    /// Size of the mapping.
    len: usize,
    /// Path of the backing file.
    path: PathBuf,
    /// Whether this process created the file (and unlinks it on destroy).
    creator: bool,
    /// Whether the mapping is writable.
    writable: bool,
}

impl Segment {
    /// Create a new segment file and map it read-write.
    ///
    /// The file is created with the given mode bits and truncated to `size`
    /// up front; tmpfs commits pages lazily, so a large maximum size costs
    /// nothing until touched.
    pub fn create(path: &Path, size: usize, gid: Option<u32>, mode: u32) -> Result<Self> {
        if size == 0 {
            return Err(Error::InvalidArg("segment size must be greater than 0"));
        }

        let fd = rustix::fs::open(
            path,
            OFlags::RDWR | OFlags::CREATE | OFlags::TRUNC | OFlags::CLOEXEC,
            Mode::from_raw_mode(mode),
        )?;

        if let Some(gid) = gid {
            if rustix::fs::fchown(&fd, None, Some(unsafe { rustix::fs::Gid::from_raw(gid) }))
                .is_err()
            {
                tracing::warn!(path = %path.display(), "changing group ownership failed");
            }
        }
        rustix::fs::fchmod(&fd, Mode::from_raw_mode(mode))?;

        rustix::fs::ftruncate(&fd, size as u64)?;

        let ptr = map(&fd, size, true)?;

        Ok(Self {
            fd,
            ptr,
            len: size,
            path: path.to_path_buf(),
            creator: true,
            writable: true,
        })
    }

    /// Attach to an existing segment file.
    ///
    /// `writable` is false for secure-fusion slaves: the mapping is then
    /// `PROT_READ` only and any mutation has to be routed through a call to
    /// the master.
    pub fn attach(path: &Path, size: usize, writable: bool) -> Result<Self> {
        if size == 0 {
            return Err(Error::InvalidArg("segment size must be greater than 0"));
        }

        let flags = if writable { OFlags::RDWR } else { OFlags::RDONLY };
        let fd = rustix::fs::open(path, flags | OFlags::CLOEXEC, Mode::empty())?;

        let ptr = map(&fd, size, writable)?;

        Ok(Self {
            fd,
            ptr,
            len: size,
            path: path.to_path_buf(),
            creator: false,
            writable,
        })
    }

    /// Base pointer of the mapping.
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Size of the mapping in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the mapping is empty (never true for a live segment).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether this mapping is writable.
    #[inline]
    pub fn writable(&self) -> bool {
        self.writable
    }

    /// Path of the backing file.
    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File name of the backing file.
    pub fn file_name(&self) -> Option<&OsStr> {
        self.path.file_name()
    }

    /// Unlink the backing file.
    ///
    /// Called by the creator on world shutdown; attached mappings stay valid
    /// until unmapped.
    pub fn unlink(&self) {
        if self.creator {
            if let Err(err) = rustix::fs::unlink(&self.path) {
                tracing::warn!(path = %self.path.display(), %err, "unlinking segment failed");
            }
        }
    }
}

fn map(fd: &OwnedFd, size: usize, writable: bool) -> Result<NonNull<u8>> {
    let prot = if writable {
        ProtFlags::READ | ProtFlags::WRITE
    } else {
        ProtFlags::READ
    };

    let ptr = unsafe { rustix::mm::mmap(std::ptr::null_mut(), size, prot, MapFlags::SHARED, fd, 0)? };

    NonNull::new(ptr.cast::<u8>()).ok_or(Error::InvalidArg("mmap returned null"))
}

impl Drop for Segment {
    fn drop(&mut self) {
        unsafe {
            let _ = rustix::mm::munmap(self.ptr.as_ptr().cast(), self.len);
        }
        // fd is closed when OwnedFd drops; the file itself is only removed
        // by an explicit unlink() from the creator.
    }
}

// SAFETY: the mapping is shared memory accessible from any thread; the fd is
// reference-counted by the kernel and no thread-local state is held.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_attach() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fusion.test.seg");

        let seg = Segment::create(&path, 4096, None, 0o660).unwrap();
        assert_eq!(seg.len(), 4096);

        unsafe {
            *seg.as_ptr() = 42;
            *seg.as_ptr().add(4095) = 7;
        }

        let other = Segment::attach(&path, 4096, true).unwrap();
        unsafe {
            assert_eq!(*other.as_ptr(), 42);
            assert_eq!(*other.as_ptr().add(4095), 7);

            *other.as_ptr().add(1) = 13;
            assert_eq!(*seg.as_ptr().add(1), 13);
        }

        seg.unlink();
    }

    #[test]
    fn test_readonly_attach() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fusion.ro.seg");

        let seg = Segment::create(&path, 4096, None, 0o660).unwrap();
        let ro = Segment::attach(&path, 4096, false).unwrap();
        assert!(!ro.writable());

        unsafe {
            *seg.as_ptr() = 99;
            assert_eq!(*ro.as_ptr(), 99);
        }

        seg.unlink();
    }

    #[test]
    fn test_zero_size_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fusion.zero.seg");
        assert!(Segment::create(&path, 0, None, 0o660).is_err());
    }
}
