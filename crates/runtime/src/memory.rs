//! Linear memories.
//!
//! A memory is described by a [`VMMemoryDefinition`] which generated code
//! reads directly. Two backing strategies exist:
//!
//! * Guarded memories reserve a fixed 8 GiB (plus one wasm page) range of
//!   address space up front and only open the pages that are in bounds. Any
//!   32-bit address plus 32-bit static offset lands inside the reservation,
//!   so compiled code may skip bounds checks entirely and let the trap
//!   handler turn the resulting fault into a heap-out-of-bounds trap.
//! * Plain memories are ordinary zeroed heap allocations which are
//!   reallocated on growth. Generated code must bounds-check every access.

use crate::config::RuntimeConfig;
use crate::mmap::{self, Mmap};
use crate::trap::TrapCode;
use crate::vmcontext::VMContext;
use anyhow::{Context, Result};
use std::alloc::{self, Layout};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Size of a WebAssembly page with the default page size.
pub const WASM_PAGE_SIZE: usize = 1 << DEFAULT_PAGE_SIZE_LOG2;

const DEFAULT_PAGE_SIZE_LOG2: u8 = 16;

/// Maximum number of pages of a 32-bit memory.
pub const WASM32_MAX_PAGES: usize = 65536;

/// Bytes reserved for every guarded memory: two 4 GiB spans, covering any
/// 32-bit address plus 32-bit offset, and one page of slack.
pub const GUARDED_RESERVATION: usize = 2 * (4 << 30) + WASM_PAGE_SIZE;

const PLAIN_ALIGN: usize = 16;

/// Errors from host-side memory operations.
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    /// An access fell outside the current byte length.
    #[error("memory access out of bounds: {offset:#x}+{len:#x} exceeds {size:#x} bytes")]
    OutOfBounds {
        /// Start of the access.
        offset: usize,
        /// Length of the access.
        len: usize,
        /// Current byte length of the memory.
        size: usize,
    },
    /// Reserving address space failed.
    #[error("failed to reserve {size:#x} bytes of address space for a linear memory")]
    Reserve {
        /// Size of the attempted reservation.
        size: usize,
    },
    /// Changing page protections failed.
    #[error("failed to make linear memory pages accessible")]
    Protect,
    /// Growth was refused by a limit or by the allocator.
    #[error("memory cannot grow by {delta} pages")]
    LimitExceeded {
        /// Requested growth in pages.
        delta: u64,
    },
}

/// The fields compiled code needs to access a linear memory.
///
/// `base` and `current_length` are loaded by generated code on every access;
/// the rest is runtime bookkeeping about how the memory was allocated.
#[derive(Debug)]
#[repr(C)]
pub struct VMMemoryDefinition {
    /// The start address.
    pub base: *mut u8,
    /// The current logical size of this linear memory in bytes.
    pub current_length: AtomicUsize,
    /// Maximum size in pages, `usize::MAX` for unlimited.
    pub max_pages: usize,
    /// Whether this is a 64-bit memory.
    pub is_memory64: bool,
    /// Log2 of the page size.
    pub page_size_log2: u8,
    /// Start of the underlying allocation or reservation.
    pub alloc_base: *mut u8,
    /// Size of the underlying allocation or reservation.
    pub alloc_size: usize,
    /// Offset from `alloc_base` where the inaccessible region begins.
    pub guard_start: usize,
    /// Whether the memory lives in a guarded reservation.
    pub is_guarded: bool,
    /// Whether the memory is shared between threads.
    pub is_shared: bool,
}

impl VMMemoryDefinition {
    /// Current byte length.
    pub fn current_length(&self) -> usize {
        self.current_length.load(Ordering::Relaxed)
    }

    /// Bytes per page.
    pub fn page_size(&self) -> usize {
        1 << self.page_size_log2
    }

    /// Current length in pages.
    pub fn pages(&self) -> usize {
        self.current_length() >> self.page_size_log2
    }

    /// The largest page count this memory may ever reach: its declared
    /// maximum, or the architectural limit when unlimited.
    pub fn max_pages(&self) -> usize {
        if self.max_pages != usize::MAX {
            return self.max_pages;
        }
        if self.is_memory64 {
            i32::MAX as usize
        } else {
            (4usize << 30) >> self.page_size_log2
        }
    }

    /// Whether `addr` falls in the inaccessible tail of a guarded
    /// reservation.
    pub fn is_guard_fault(&self, addr: usize) -> bool {
        if !self.is_guarded || self.alloc_base.is_null() {
            return false;
        }
        let base = self.alloc_base as usize;
        let guard_start = base + self.guard_start;
        let end = base + self.alloc_size;
        addr >= guard_start && addr < end
    }

    /// Grows by `delta` pages, returning the previous page count or -1.
    ///
    /// `max_pages`, when given, further limits growth but can never raise the
    /// stored maximum.
    pub fn grow(&mut self, delta: i64, max_pages: Option<usize>) -> i32 {
        if delta < 0 {
            return -1;
        }
        let old_pages = self.pages();
        let stored_max = self.max_pages();
        let effective_max = max_pages.map_or(stored_max, |m| m.min(stored_max));
        let Some(new_pages) = old_pages.checked_add(delta as usize) else {
            return -1;
        };
        if new_pages > effective_max {
            return -1;
        }
        if delta == 0 {
            return old_pages as i32;
        }
        let old_size = self.current_length();
        let Some(new_size) = new_pages.checked_mul(self.page_size()) else {
            return -1;
        };

        let grown = if self.is_guarded {
            self.grow_guarded(old_size, new_size)
        } else {
            self.grow_plain(old_size, new_size)
        };
        if !grown {
            return -1;
        }
        log::trace!("memory grew from {old_pages} to {new_pages} pages");
        old_pages as i32
    }

    fn grow_guarded(&mut self, old_size: usize, new_size: usize) -> bool {
        if new_size > self.alloc_size {
            return false;
        }
        let old_open = mmap::round_up_to_page_size(old_size);
        let new_open = mmap::round_up_to_page_size(new_size);
        if new_open > old_open {
            // Freshly opened anonymous pages are already zero.
            let opened = unsafe {
                mmap::make_accessible(self.alloc_base.add(old_open), new_open - old_open)
            };
            if opened.is_err() {
                return false;
            }
        }
        self.guard_start = new_open;
        self.current_length.store(new_size, Ordering::Relaxed);
        true
    }

    fn grow_plain(&mut self, old_size: usize, new_size: usize) -> bool {
        if new_size > self.alloc_size {
            let Ok(layout) = Layout::from_size_align(self.alloc_size, PLAIN_ALIGN) else {
                return false;
            };
            let new_base = unsafe { alloc::realloc(self.alloc_base, layout, new_size) };
            if new_base.is_null() {
                return false;
            }
            self.alloc_base = new_base;
            self.alloc_size = new_size;
            self.base = new_base;
        }
        unsafe {
            ptr::write_bytes(self.base.add(old_size), 0, new_size - old_size);
        }
        self.current_length.store(new_size, Ordering::Relaxed);
        true
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<(), MemoryError> {
        let size = self.current_length();
        match offset.checked_add(len) {
            Some(end) if end <= size => Ok(()),
            _ => Err(MemoryError::OutOfBounds { offset, len, size }),
        }
    }
}

/// An owned linear memory together with its definition.
#[derive(Debug)]
pub struct Memory {
    def: NonNull<VMMemoryDefinition>,
}

// The definition and its storage are exclusively owned by this value.
unsafe impl Send for Memory {}
unsafe impl Sync for Memory {}

impl Memory {
    /// Creates a plain, zero-filled memory of `initial_bytes` with no
    /// maximum.
    pub fn new(initial_bytes: usize) -> Result<Memory> {
        let alloc_size = initial_bytes.max(PLAIN_ALIGN);
        let layout = Layout::from_size_align(alloc_size, PLAIN_ALIGN)
            .context("invalid linear memory size")?;
        let base = unsafe { alloc::alloc_zeroed(layout) };
        if base.is_null() {
            anyhow::bail!("failed to allocate {initial_bytes:#x} bytes of linear memory");
        }
        Ok(Memory::from_definition(VMMemoryDefinition {
            base,
            current_length: AtomicUsize::new(initial_bytes),
            max_pages: usize::MAX,
            is_memory64: false,
            page_size_log2: DEFAULT_PAGE_SIZE_LOG2,
            alloc_base: base,
            alloc_size,
            guard_start: 0,
            is_guarded: false,
            is_shared: false,
        }))
    }

    /// Creates a guarded memory with `initial_pages` accessible pages.
    ///
    /// `max_pages` is clamped to the 32-bit limit; `None` means that limit.
    pub fn new_guarded(initial_pages: usize, max_pages: Option<usize>) -> Result<Memory> {
        if initial_pages > WASM32_MAX_PAGES {
            anyhow::bail!("initial memory size of {initial_pages} pages exceeds the 32-bit limit");
        }
        let max_pages = max_pages.map_or(WASM32_MAX_PAGES, |m| m.min(WASM32_MAX_PAGES));
        let initial_bytes = initial_pages * WASM_PAGE_SIZE;
        let reserve_size = mmap::round_up_to_page_size(GUARDED_RESERVATION);

        let mut mapping =
            Mmap::reserve(reserve_size).context(MemoryError::Reserve { size: reserve_size })?;
        let open = mmap::round_up_to_page_size(initial_bytes);
        if open > 0 {
            mapping
                .make_accessible(0..open)
                .context(MemoryError::Protect)?;
        }
        log::debug!(
            "reserved guarded memory of {reserve_size:#x} bytes, {initial_pages} pages accessible"
        );

        let (base, alloc_size) = mapping.into_raw_parts();
        Ok(Memory::from_definition(VMMemoryDefinition {
            base: base.as_ptr(),
            current_length: AtomicUsize::new(initial_bytes),
            max_pages,
            is_memory64: false,
            page_size_log2: DEFAULT_PAGE_SIZE_LOG2,
            alloc_base: base.as_ptr(),
            alloc_size,
            guard_start: open,
            is_guarded: true,
            is_shared: false,
        }))
    }

    /// Creates a memory of `initial_pages` pages using the strategy selected
    /// by `config`.
    pub fn new_with_config(
        config: &RuntimeConfig,
        initial_pages: usize,
        max_pages: Option<usize>,
    ) -> Result<Memory> {
        if config.guard_pages {
            return Memory::new_guarded(initial_pages, max_pages);
        }
        let bytes = initial_pages
            .checked_mul(WASM_PAGE_SIZE)
            .context("initial memory size overflows")?;
        let mut memory = Memory::new(bytes)?;
        memory.def_mut().max_pages = max_pages.unwrap_or(usize::MAX);
        Ok(memory)
    }

    fn from_definition(def: VMMemoryDefinition) -> Memory {
        let raw = Box::into_raw(Box::new(def));
        Memory {
            // SAFETY: `Box::into_raw` never returns null.
            def: unsafe { NonNull::new_unchecked(raw) },
        }
    }

    fn def(&self) -> &VMMemoryDefinition {
        unsafe { self.def.as_ref() }
    }

    fn def_mut(&mut self) -> &mut VMMemoryDefinition {
        unsafe { self.def.as_mut() }
    }

    /// The definition to publish to generated code.
    pub fn vmmemory(&self) -> *mut VMMemoryDefinition {
        self.def.as_ptr()
    }

    /// Current base address. Plain memories move when they grow.
    pub fn base(&self) -> *mut u8 {
        self.def().base
    }

    /// Current byte length.
    pub fn byte_size(&self) -> usize {
        self.def().current_length()
    }

    /// Current size in pages.
    pub fn pages(&self) -> usize {
        self.def().pages()
    }

    /// Whether the memory lives in a guarded reservation.
    pub fn is_guarded(&self) -> bool {
        self.def().is_guarded
    }

    /// Marks the memory as a 64-bit memory, which changes its architectural
    /// page limit.
    pub fn set_memory64(&mut self, memory64: bool) {
        self.def_mut().is_memory64 = memory64;
    }

    /// Marks the memory as shared.
    pub fn set_shared(&mut self, shared: bool) {
        self.def_mut().is_shared = shared;
    }

    /// Grows by `delta` pages and returns the previous page count.
    pub fn grow(&mut self, delta: u64) -> Result<usize, MemoryError> {
        let Ok(signed) = i64::try_from(delta) else {
            return Err(MemoryError::LimitExceeded { delta });
        };
        match self.def_mut().grow(signed, None) {
            -1 => Err(MemoryError::LimitExceeded { delta }),
            old => Ok(old as usize),
        }
    }

    /// Copies bytes starting at `offset` into `buf`.
    pub fn read(&self, offset: usize, buf: &mut [u8]) -> Result<(), MemoryError> {
        self.def().check_range(offset, buf.len())?;
        unsafe {
            ptr::copy_nonoverlapping(self.base().add(offset), buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }

    /// Copies `data` into memory starting at `offset`.
    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), MemoryError> {
        self.def().check_range(offset, data.len())?;
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), self.base().add(offset), data.len());
        }
        Ok(())
    }

    /// Copies `len` bytes from `src` to `dst`; the ranges may overlap.
    pub fn copy_within(&mut self, src: usize, dst: usize, len: usize) -> Result<(), MemoryError> {
        self.def().check_range(src, len)?;
        self.def().check_range(dst, len)?;
        unsafe {
            ptr::copy(self.base().add(src), self.base().add(dst), len);
        }
        Ok(())
    }

    /// Sets `len` bytes starting at `offset` to `val`.
    pub fn fill(&mut self, offset: usize, val: u8, len: usize) -> Result<(), MemoryError> {
        self.def().check_range(offset, len)?;
        unsafe {
            ptr::write_bytes(self.base().add(offset), val, len);
        }
        Ok(())
    }
}

impl Drop for Memory {
    fn drop(&mut self) {
        unsafe {
            let def = Box::from_raw(self.def.as_ptr());
            let Some(alloc_base) = NonNull::new(def.alloc_base) else {
                return;
            };
            if def.is_guarded {
                drop(Mmap::from_raw_parts(alloc_base, def.alloc_size));
            } else if let Ok(layout) = Layout::from_size_align(def.alloc_size, PLAIN_ALIGN) {
                alloc::dealloc(alloc_base.as_ptr(), layout);
            }
        }
    }
}

/// Resolves memory `idx` of `vmctx`.
pub(crate) unsafe fn memory_of<'a>(vmctx: *mut VMContext, idx: i32) -> Option<&'a mut VMMemoryDefinition> {
    let ctx = unsafe { vmctx.as_ref()? };
    let idx = u32::try_from(idx).ok()?;
    let def = ctx.memory(idx)?;
    Some(unsafe { &mut *def.as_ptr() })
}

/// Implementation of `memory.grow`: the old page count, or -1.
///
/// A negative `max_pages` defers to the memory's stored maximum.
pub(crate) unsafe fn memory_grow(vmctx: *mut VMContext, idx: i32, delta: i32, max_pages: i32) -> i32 {
    let Some(mem) = (unsafe { memory_of(vmctx, idx) }) else {
        return -1;
    };
    let max = usize::try_from(max_pages).ok();
    mem.grow(i64::from(delta), max)
}

/// Implementation of `memory.size` in pages; 0 for an unknown memory.
pub(crate) unsafe fn memory_size(vmctx: *mut VMContext, idx: i32) -> i32 {
    match unsafe { memory_of(vmctx, idx) } {
        Some(mem) => mem.pages() as i32,
        None => 0,
    }
}

fn checked_range(offset: i64, len: i64, size: usize) -> Result<usize, TrapCode> {
    let (Ok(offset), Ok(len)) = (usize::try_from(offset), usize::try_from(len)) else {
        return Err(TrapCode::HeapOutOfBounds);
    };
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(offset),
        _ => Err(TrapCode::HeapOutOfBounds),
    }
}

/// Implementation of `memory.fill`.
pub(crate) unsafe fn memory_fill(
    vmctx: *mut VMContext,
    idx: i32,
    dst: i64,
    val: i32,
    len: i64,
) -> Result<(), TrapCode> {
    let mem = unsafe { memory_of(vmctx, idx) }.ok_or(TrapCode::HeapOutOfBounds)?;
    if mem.base.is_null() {
        return Err(TrapCode::HeapOutOfBounds);
    }
    let dst = checked_range(dst, len, mem.current_length())?;
    unsafe {
        ptr::write_bytes(mem.base.add(dst), val as u8, len as usize);
    }
    Ok(())
}

/// Implementation of `memory.copy`, possibly between two memories.
pub(crate) unsafe fn memory_copy(
    vmctx: *mut VMContext,
    dst_idx: i32,
    src_idx: i32,
    dst: i64,
    src: i64,
    len: i64,
) -> Result<(), TrapCode> {
    let (dst_base, dst_size) = unsafe { memory_of(vmctx, dst_idx) }
        .map(|m| (m.base, m.current_length()))
        .ok_or(TrapCode::HeapOutOfBounds)?;
    let (src_base, src_size) = unsafe { memory_of(vmctx, src_idx) }
        .map(|m| (m.base, m.current_length()))
        .ok_or(TrapCode::HeapOutOfBounds)?;
    if dst_base.is_null() || src_base.is_null() {
        return Err(TrapCode::HeapOutOfBounds);
    }
    let dst = checked_range(dst, len, dst_size)?;
    let src = checked_range(src, len, src_size)?;
    unsafe {
        ptr::copy(src_base.add(src), dst_base.add(dst), len as usize);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::offset_of;
    use test_log::test;

    #[test]
    fn check_vmmemory_definition_offsets() {
        assert_eq!(offset_of!(VMMemoryDefinition, base), 0);
        assert_eq!(offset_of!(VMMemoryDefinition, current_length), 8);
    }

    #[test]
    fn plain_memory_grows_and_zeroes() -> Result<()> {
        let mut mem = Memory::new(WASM_PAGE_SIZE)?;
        assert!(!mem.is_guarded());
        mem.write(10, &[1, 2, 3])?;
        assert_eq!(mem.grow(2)?, 1);
        assert_eq!(mem.pages(), 3);

        let mut buf = [0xffu8; 3];
        mem.read(10, &mut buf)?;
        assert_eq!(buf, [1, 2, 3]);
        mem.read(2 * WASM_PAGE_SIZE, &mut buf)?;
        assert_eq!(buf, [0, 0, 0]);
        Ok(())
    }

    #[test]
    fn guarded_memory_grows_in_place() -> Result<()> {
        let mut mem = Memory::new_guarded(1, Some(4))?;
        let base = mem.base();
        assert!(mem.is_guarded());
        assert_eq!(mem.grow(0)?, 1);
        assert_eq!(mem.grow(3)?, 1);
        assert_eq!(mem.base(), base);
        assert!(mem.grow(1).is_err());
        mem.write(4 * WASM_PAGE_SIZE - 1, &[9])?;

        let def = unsafe { &*mem.vmmemory() };
        let base = base as usize;
        assert!(!def.is_guard_fault(base + 4 * WASM_PAGE_SIZE - 1));
        assert!(def.is_guard_fault(base + 4 * WASM_PAGE_SIZE));
        assert!(def.is_guard_fault(base + (4 << 30)));
        assert!(!def.is_guard_fault(base + def.alloc_size));
        Ok(())
    }

    #[test]
    fn guarded_limits() {
        assert!(Memory::new_guarded(WASM32_MAX_PAGES + 1, None).is_err());
        let mem = Memory::new_guarded(0, Some(1 << 20)).unwrap();
        assert_eq!(unsafe { (*mem.vmmemory()).max_pages }, WASM32_MAX_PAGES);
        assert_eq!(mem.byte_size(), 0);
    }

    #[test]
    fn grow_rejects_bad_deltas() -> Result<()> {
        let mem = Memory::new(0)?;
        let def = unsafe { &mut *mem.vmmemory() };
        assert_eq!(def.grow(-1, None), -1);
        assert_eq!(def.grow((WASM32_MAX_PAGES + 1) as i64, None), -1);
        assert_eq!(def.grow(1, Some(0)), -1);
        assert_eq!(def.grow(1, Some(1)), 0);
        assert_eq!(def.pages(), 1);
        Ok(())
    }

    #[test]
    fn memory64_limit() -> Result<()> {
        let mut mem = Memory::new(0)?;
        mem.set_memory64(true);
        let def = unsafe { &*mem.vmmemory() };
        assert_eq!(def.max_pages(), i32::MAX as usize);
        assert!(mem.grow(i32::MAX as u64 + 1).is_err());
        Ok(())
    }

    #[test]
    fn host_accessors_check_bounds() -> Result<()> {
        let mut mem = Memory::new(16)?;
        assert!(matches!(
            mem.write(15, &[1, 2]),
            Err(MemoryError::OutOfBounds { offset: 15, len: 2, size: 16 })
        ));
        mem.write(0, b"hello")?;
        mem.copy_within(0, 2, 5)?;
        mem.fill(0, b'x', 2)?;
        let mut buf = [0u8; 7];
        mem.read(0, &mut buf)?;
        assert_eq!(&buf, b"xxhello");
        assert!(mem.fill(usize::MAX, 0, 2).is_err());
        Ok(())
    }

    #[test]
    fn libcalls_dispatch_by_index() -> Result<()> {
        let mut ctx = VMContext::new(0);
        let other = Memory::new(WASM_PAGE_SIZE)?;
        ctx.alloc_guarded_memory(1, None)?;
        let mem0 = ctx.memory0();
        ctx.set_memory_pointers(&[mem0, other.vmmemory()]);
        let vmctx: *mut VMContext = &mut *ctx;

        unsafe {
            assert_eq!(memory_size(vmctx, 0), 1);
            assert_eq!(memory_size(vmctx, 1), 1);
            assert_eq!(memory_size(vmctx, 2), 0);
            assert_eq!(memory_grow(vmctx, 1, 1, -1), 1);
            assert_eq!(memory_grow(vmctx, 3, 1, -1), -1);

            memory_fill(vmctx, 1, 0, 0x1ab, 4).unwrap();
            memory_copy(vmctx, 0, 1, 100, 0, 4).unwrap();
            assert_eq!(*ctx.get_memory_ptr(0).add(103), 0xab);
            assert_eq!(
                memory_fill(vmctx, 0, WASM_PAGE_SIZE as i64, 0, 1),
                Err(TrapCode::HeapOutOfBounds)
            );
            assert_eq!(memory_fill(vmctx, 0, -1, 0, 1), Err(TrapCode::HeapOutOfBounds));
            assert_eq!(memory_copy(vmctx, 0, 1, 0, 0, -1), Err(TrapCode::HeapOutOfBounds));
            assert_eq!(memory_copy(vmctx, 0, 4, 0, 0, 0), Err(TrapCode::HeapOutOfBounds));
        }
        Ok(())
    }
}
