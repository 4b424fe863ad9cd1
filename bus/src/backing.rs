//! Ether backing buffers.
//!
//! The Ether binds to memory it does not allocate itself: either a private
//! 64-byte-aligned heap region, or a POSIX shared-memory object mapped by
//! path so that cooperating processes can attach to the same ring. The
//! shared object is deliberately *not* unlinked on drop: surviving the
//! process is what makes the signature check in the header meaningful.

use std::alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout};
use std::ffi::CString;
use std::io;
use std::ptr::NonNull;

/// Cache-line alignment for the header and slot array.
pub const BUFFER_ALIGN: usize = 64;

/// An owned byte region backing one Ether.
#[derive(Debug)]
pub enum Backing {
    /// Process-private heap allocation, zeroed.
    Private(PrivateBacking),
    /// Mapping of a named POSIX shared-memory object.
    Shared(SharedBacking),
}

impl Backing {
    /// Allocate a zeroed private region of `len` bytes.
    #[must_use]
    pub fn private(len: usize) -> Self {
        Self::Private(PrivateBacking::new(len))
    }

    /// Create or attach to the shared-memory object at `path`
    /// (POSIX name, e.g. `/md-ether`) and map `len` bytes of it.
    pub fn shared(path: &str, len: usize) -> io::Result<Self> {
        Ok(Self::Shared(SharedBacking::new(path, len)?))
    }

    /// Base pointer of the region.
    #[must_use]
    pub fn as_ptr(&self) -> NonNull<u8> {
        match self {
            Self::Private(b) => b.ptr,
            Self::Shared(b) => b.ptr,
        }
    }

    /// Region length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Private(b) => b.layout.size(),
            Self::Shared(b) => b.len,
        }
    }

    /// True when the region is zero-sized (never, in practice).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Zeroed, cache-line-aligned heap region.
#[derive(Debug)]
pub struct PrivateBacking {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: exclusively owned allocation.
unsafe impl Send for PrivateBacking {}
unsafe impl Sync for PrivateBacking {}

impl PrivateBacking {
    fn new(len: usize) -> Self {
        assert!(len > 0, "backing length must be non-zero");
        let layout =
            Layout::from_size_align(len, BUFFER_ALIGN).expect("backing layout overflow");
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(raw) else {
            handle_alloc_error(layout)
        };
        Self { ptr, layout }
    }
}

impl Drop for PrivateBacking {
    fn drop(&mut self) {
        // SAFETY: allocated with this exact layout in new().
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// Mapping of a named shared-memory object.
#[derive(Debug)]
pub struct SharedBacking {
    ptr: NonNull<u8>,
    len: usize,
    path: CString,
}

// SAFETY: the mapping is owned; concurrent access goes through the Ether's
// atomics.
unsafe impl Send for SharedBacking {}
unsafe impl Sync for SharedBacking {}

impl SharedBacking {
    fn new(path: &str, len: usize) -> io::Result<Self> {
        assert!(len > 0, "backing length must be non-zero");
        let cpath =
            CString::new(path).map_err(|_| io::Error::other("shm path contains NUL"))?;

        // SAFETY: plain syscalls over a valid C string and an owned fd.
        unsafe {
            let fd = libc::shm_open(cpath.as_ptr(), libc::O_CREAT | libc::O_RDWR, 0o600);
            if fd == -1 {
                return Err(io::Error::last_os_error());
            }
            if libc::ftruncate(fd, len as libc::off_t) == -1 {
                let err = io::Error::last_os_error();
                libc::close(fd);
                return Err(err);
            }
            let raw = libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            );
            // The mapping stays valid after close.
            libc::close(fd);
            if raw == libc::MAP_FAILED {
                return Err(io::Error::last_os_error());
            }
            let ptr = NonNull::new(raw.cast::<u8>())
                .ok_or_else(|| io::Error::other("mmap returned null"))?;
            Ok(Self {
                ptr,
                len,
                path: cpath,
            })
        }
    }

    /// POSIX name this backing is mapped from.
    #[must_use]
    pub fn path(&self) -> &std::ffi::CStr {
        &self.path
    }

    /// Remove the underlying object by name. Host teardown helper; existing
    /// mappings stay valid until unmapped.
    pub fn unlink(path: &str) -> io::Result<()> {
        let cpath =
            CString::new(path).map_err(|_| io::Error::other("shm path contains NUL"))?;
        // SAFETY: plain syscall over a valid C string.
        if unsafe { libc::shm_unlink(cpath.as_ptr()) } == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for SharedBacking {
    fn drop(&mut self) {
        // SAFETY: we own this mapping of len bytes.
        unsafe { libc::munmap(self.ptr.as_ptr().cast(), self.len) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_backing_is_zeroed_and_aligned() {
        let backing = Backing::private(4096);
        assert_eq!(backing.len(), 4096);
        assert_eq!(backing.as_ptr().as_ptr() as usize % BUFFER_ALIGN, 0);
        // SAFETY: freshly allocated region of 4096 bytes.
        let bytes = unsafe { std::slice::from_raw_parts(backing.as_ptr().as_ptr(), 4096) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn shared_backing_persists_across_mappings() -> io::Result<()> {
        let path = format!("/aether-backing-test-{}", std::process::id());
        {
            let backing = Backing::shared(&path, 4096)?;
            // SAFETY: mapped read-write region.
            unsafe { backing.as_ptr().as_ptr().write(0xAB) };
        }
        {
            let backing = Backing::shared(&path, 4096)?;
            // SAFETY: mapped read-write region.
            let first = unsafe { backing.as_ptr().as_ptr().read() };
            assert_eq!(first, 0xAB, "object did not persist across mappings");
        }
        SharedBacking::unlink(&path)?;
        Ok(())
    }
}
