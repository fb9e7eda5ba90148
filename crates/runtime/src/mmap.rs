//! Low-level abstraction for allocating and managing zero-filled pages
//! of memory.

use anyhow::{Context, Result};
use rustix::mm::{MprotectFlags, mprotect};
use std::ops::Range;
use std::ptr::{self, NonNull};

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        // Guard reservations are never meant to be touched, so don't reserve
        // swap for them.
        const MMAP_NORESERVE_FLAG: rustix::mm::MapFlags = rustix::mm::MapFlags::NORESERVE;
    } else {
        const MMAP_NORESERVE_FLAG: rustix::mm::MapFlags = rustix::mm::MapFlags::empty();
    }
}

/// Returns the host page size.
pub fn page_size() -> usize {
    rustix::param::page_size()
}

/// Rounds `size` up to a multiple of the host page size.
pub fn round_up_to_page_size(size: usize) -> usize {
    let page_size = page_size();
    (size + (page_size - 1)) & !(page_size - 1)
}

/// A simple struct consisting of a page-aligned pointer to page-aligned
/// and initially-zeroed memory and a length.
#[derive(Debug)]
pub struct Mmap {
    ptr: NonNull<u8>,
    len: usize,
}

// The mapping is plain memory owned by this value.
unsafe impl Send for Mmap {}
unsafe impl Sync for Mmap {}

impl Mmap {
    /// Maps `size` bytes of readable and writable memory.
    pub fn new(size: usize) -> Result<Mmap> {
        let ptr = unsafe {
            rustix::mm::mmap_anonymous(
                ptr::null_mut(),
                size,
                rustix::mm::ProtFlags::READ | rustix::mm::ProtFlags::WRITE,
                rustix::mm::MapFlags::PRIVATE,
            )
            .with_context(|| format!("failed to map {size:#x} bytes"))?
        };
        Ok(Mmap {
            ptr: NonNull::new(ptr.cast()).context("mmap returned null")?,
            len: size,
        })
    }

    /// Reserves `size` bytes of address space with no access rights.
    pub fn reserve(size: usize) -> Result<Mmap> {
        let ptr = unsafe {
            rustix::mm::mmap_anonymous(
                ptr::null_mut(),
                size,
                rustix::mm::ProtFlags::empty(),
                rustix::mm::MapFlags::PRIVATE | MMAP_NORESERVE_FLAG,
            )
            .with_context(|| format!("failed to reserve {size:#x} bytes of address space"))?
        };
        Ok(Mmap {
            ptr: NonNull::new(ptr.cast()).context("mmap returned null")?,
            len: size,
        })
    }

    /// Takes ownership of a mapping previously released with
    /// [`Mmap::into_raw_parts`].
    ///
    /// # Safety
    ///
    /// `ptr` and `len` must describe exactly one live mapping that nothing
    /// else will unmap.
    pub unsafe fn from_raw_parts(ptr: NonNull<u8>, len: usize) -> Mmap {
        Mmap { ptr, len }
    }

    /// Releases ownership of the mapping without unmapping it.
    pub fn into_raw_parts(self) -> (NonNull<u8>, usize) {
        let parts = (self.ptr, self.len);
        std::mem::forget(self);
        parts
    }

    /// Makes `range` (relative to the start of the mapping) readable and
    /// writable.
    pub fn make_accessible(&mut self, range: Range<usize>) -> Result<()> {
        assert!(range.start <= range.end && range.end <= self.len);
        unsafe { make_accessible(self.ptr.as_ptr().add(range.start), range.len()) }
    }

    /// Makes `range` readable and executable, dropping write access.
    pub fn make_executable(&self, range: Range<usize>) -> Result<()> {
        assert!(range.start <= range.end && range.end <= self.len);
        unsafe {
            mprotect(
                self.ptr.as_ptr().add(range.start).cast(),
                range.len(),
                MprotectFlags::READ | MprotectFlags::EXEC,
            )
            .context("failed to make memory executable")
        }
    }

    /// Return the allocated memory as a mutable pointer to u8.
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Return the length of the allocated memory.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Return whether any memory has been allocated.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Makes `len` bytes at `ptr` readable and writable.
///
/// # Safety
///
/// The range must lie within a mapping owned by the caller.
pub unsafe fn make_accessible(ptr: *mut u8, len: usize) -> Result<()> {
    if len == 0 {
        return Ok(());
    }
    unsafe {
        mprotect(
            ptr.cast(),
            len,
            MprotectFlags::READ | MprotectFlags::WRITE,
        )
        .with_context(|| format!("failed to make {len:#x} bytes at {ptr:p} accessible"))
    }
}

impl Drop for Mmap {
    fn drop(&mut self) {
        if self.len == 0 {
            return;
        }
        unsafe {
            let r = rustix::mm::munmap(self.ptr.as_ptr().cast(), self.len);
            debug_assert!(r.is_ok(), "munmap failed: {r:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn rounding() {
        let page = page_size();
        assert_eq!(round_up_to_page_size(0), 0);
        assert_eq!(round_up_to_page_size(1), page);
        assert_eq!(round_up_to_page_size(page), page);
        assert_eq!(round_up_to_page_size(page + 1), 2 * page);
    }

    #[test]
    fn reserve_then_open() -> Result<()> {
        let page = page_size();
        let mut mmap = Mmap::reserve(4 * page)?;
        mmap.make_accessible(0..page)?;
        unsafe {
            *mmap.as_mut_ptr() = 7;
            assert_eq!(*mmap.as_mut_ptr(), 7);
            assert_eq!(*mmap.as_mut_ptr().add(page - 1), 0);
        }
        Ok(())
    }

    #[test]
    fn raw_parts_round_trip() -> Result<()> {
        let mmap = Mmap::new(page_size())?;
        let (ptr, len) = mmap.into_raw_parts();
        let mmap = unsafe { Mmap::from_raw_parts(ptr, len) };
        assert_eq!(mmap.len(), page_size());
        Ok(())
    }
}
