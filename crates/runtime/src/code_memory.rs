//! Memory management for executable code.

use crate::mmap::{self, Mmap};
use crate::vmcontext::VMFunctionBody;
use anyhow::{Result, bail};
use std::ops::Range;

/// A page-rounded read-execute mapping holding one blob of machine code.
#[derive(Debug)]
pub struct CodeMemory {
    mmap: Mmap,
    len: usize,
}

impl CodeMemory {
    /// Copies `code` into fresh memory and makes it executable.
    pub fn new(code: &[u8]) -> Result<CodeMemory> {
        if code.is_empty() {
            bail!("cannot publish an empty code blob");
        }
        let size = mmap::round_up_to_page_size(code.len());
        let mmap = Mmap::new(size)?;
        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), mmap.as_mut_ptr(), code.len());
        }
        // Remove write access before anything can run.
        mmap.make_executable(0..size)?;
        unsafe { clear_cache(mmap.as_mut_ptr(), code.len()) };
        log::trace!("published {:#x} bytes of code at {:p}", code.len(), mmap.as_mut_ptr());
        Ok(CodeMemory {
            mmap,
            len: code.len(),
        })
    }

    /// The start of the code.
    pub fn as_ptr(&self) -> *const VMFunctionBody {
        self.mmap.as_mut_ptr().cast_const().cast()
    }

    /// Length of the code in bytes, without page padding.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Always false; empty code is rejected by [`CodeMemory::new`].
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Addresses covered by the code.
    pub fn range(&self) -> Range<usize> {
        let start = self.mmap.as_mut_ptr() as usize;
        start..start + self.len
    }
}

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "aarch64", target_os = "macos"))] {
        unsafe extern "C" {
            fn sys_icache_invalidate(start: *mut std::ffi::c_void, len: usize);
        }

        unsafe fn clear_cache(ptr: *mut u8, len: usize) {
            unsafe { sys_icache_invalidate(ptr.cast(), len) }
        }
    } else if #[cfg(target_arch = "aarch64")] {
        unsafe extern "C" {
            fn __clear_cache(start: *mut std::ffi::c_char, end: *mut std::ffi::c_char);
        }

        unsafe fn clear_cache(ptr: *mut u8, len: usize) {
            unsafe { __clear_cache(ptr.cast(), ptr.add(len).cast()) }
        }
    } else {
        // Instruction and data caches are coherent.
        unsafe fn clear_cache(_ptr: *mut u8, _len: usize) {}
    }
}
