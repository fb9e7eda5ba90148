//! Indirect-call tables.
//!
//! Every table entry is two pointer-sized slots: the callee and its
//! signature type index. Table 0 is mirrored into the context's fast-path
//! fields so `call_indirect` against it needs a single load.

use crate::segments;
use crate::trap::TrapCode;
use crate::vmcontext::{VMArray, VMContext, VMFunctionBody};
use std::ptr;

/// One slot of an indirect-call table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct VMTableEntry {
    /// The function to call, or null.
    pub callee: *const VMFunctionBody,
    /// Signature type index, or -1 when unknown.
    pub type_index: isize,
}

impl VMTableEntry {
    /// An empty slot.
    pub const NULL: VMTableEntry = VMTableEntry {
        callee: ptr::null(),
        type_index: -1,
    };

    /// A slot holding a raw reference value whose signature is unknown.
    pub fn untyped(value: i64) -> VMTableEntry {
        VMTableEntry {
            callee: value as usize as *const VMFunctionBody,
            type_index: -1,
        }
    }
}

/// Backing storage of a table owned by a context.
pub(crate) type TableAllocation = VMArray<VMTableEntry>;

/// An indirect table owned outside of any context, which several contexts
/// can borrow through [`VMContext::use_shared_table`].
pub struct SharedTable {
    entries: TableAllocation,
}

impl SharedTable {
    /// Creates a table of `count` empty slots.
    pub fn new(count: usize) -> SharedTable {
        SharedTable {
            entries: TableAllocation::new(count, VMTableEntry::NULL),
        }
    }

    /// Stores `func` with signature `type_idx` in slot `idx`. Out-of-range
    /// slots are ignored.
    pub fn set(&mut self, idx: usize, func: *const VMFunctionBody, type_idx: i32) {
        if idx < self.entries.len() {
            unsafe {
                *self.entries.as_ptr().add(idx) = VMTableEntry {
                    callee: func,
                    type_index: type_idx as isize,
                };
            }
        }
    }

    /// Reads slot `idx`.
    pub fn get(&self, idx: usize) -> Option<VMTableEntry> {
        if idx < self.entries.len() {
            Some(unsafe { *self.entries.as_ptr().add(idx) })
        } else {
            None
        }
    }

    /// Base of the entry array.
    pub fn as_ptr(&self) -> *mut VMTableEntry {
        self.entries.as_ptr()
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table has no slots.
    pub fn is_empty(&self) -> bool {
        self.entries.len() == 0
    }
}

impl VMContext {
    /// Implementation of `table.grow`: grows table `idx` by `delta` entries
    /// initialized to `init`, returning the old size or -1.
    ///
    /// The grown table is owned by the context. The table it replaces is
    /// released only if the context owned it.
    pub fn table_grow(&mut self, idx: i32, delta: i64, init: *const VMFunctionBody) -> i32 {
        if idx < 0 || delta < 0 || idx >= self.table_count {
            return -1;
        }
        if self.tables.is_null() || self.table_sizes.is_null() {
            return -1;
        }
        let i = idx as usize;
        let old_size = unsafe { *self.table_sizes.add(i) };
        let Some(new_size) = old_size.checked_add(delta as usize) else {
            return -1;
        };
        let max = if self.table_max_sizes.is_null() {
            usize::MAX
        } else {
            unsafe { *self.table_max_sizes.add(i) }
        };
        if new_size > max {
            return -1;
        }
        if delta == 0 {
            return old_size as i32;
        }

        let mut entries = Vec::new();
        if entries.try_reserve_exact(new_size).is_err() {
            return -1;
        }
        let old_base = unsafe { *self.tables.add(i) };
        if !old_base.is_null() {
            entries.extend_from_slice(unsafe { std::slice::from_raw_parts(old_base, old_size) });
        } else {
            entries.resize(old_size, VMTableEntry::NULL);
        }
        entries.resize(
            new_size,
            VMTableEntry {
                callee: init,
                type_index: -1,
            },
        );
        let table = TableAllocation::from_vec(entries);

        unsafe {
            *self.tables.add(i) = table.as_ptr();
            *self.table_sizes.add(i) = new_size;
        }
        if i == 0 {
            self.table0_base = table.as_ptr();
            self.table0_elements = new_size;
            self.owned_table0 = None;
        }
        if self.grown_tables.len() <= i {
            self.grown_tables.resize_with(i + 1, || None);
        }
        self.grown_tables[i] = Some(table);
        log::trace!("table {idx} grew from {old_size} to {new_size} entries");
        old_size as i32
    }
}

/// Resolves table `idx` as a mutable slice.
unsafe fn table_entries<'a>(vmctx: *mut VMContext, idx: i32) -> Result<&'a mut [VMTableEntry], TrapCode> {
    let ctx = unsafe { vmctx.as_ref() }.ok_or(TrapCode::HeapOutOfBounds)?;
    let idx = u32::try_from(idx).map_err(|_| TrapCode::HeapOutOfBounds)?;
    let (base, len) = ctx.table(idx).ok_or(TrapCode::HeapOutOfBounds)?;
    if base.is_null() {
        return Ok(&mut []);
    }
    Ok(unsafe { std::slice::from_raw_parts_mut(base, len) })
}

/// Checks `start..start+len` against `size` and returns it as a range.
pub(crate) fn checked_range(
    start: i32,
    len: i32,
    size: usize,
) -> Result<std::ops::Range<usize>, TrapCode> {
    let (Ok(start), Ok(len)) = (usize::try_from(start), usize::try_from(len)) else {
        return Err(TrapCode::HeapOutOfBounds);
    };
    match start.checked_add(len) {
        Some(end) if end <= size => Ok(start..end),
        _ => Err(TrapCode::HeapOutOfBounds),
    }
}

/// Implementation of `table.grow` for generated code.
pub(crate) unsafe fn table_grow(vmctx: *mut VMContext, idx: i32, delta: i64, init: i64) -> i32 {
    match unsafe { vmctx.as_mut() } {
        Some(ctx) => ctx.table_grow(idx, delta, init as usize as *const VMFunctionBody),
        None => -1,
    }
}

/// Implementation of `table.fill`.
pub(crate) unsafe fn table_fill(
    vmctx: *mut VMContext,
    idx: i32,
    dst: i32,
    val: i64,
    len: i32,
) -> Result<(), TrapCode> {
    let table = unsafe { table_entries(vmctx, idx)? };
    let range = checked_range(dst, len, table.len())?;
    table[range].fill(VMTableEntry::untyped(val));
    Ok(())
}

/// Implementation of `table.copy`; the ranges may overlap.
pub(crate) unsafe fn table_copy(
    vmctx: *mut VMContext,
    dst_idx: i32,
    src_idx: i32,
    dst: i32,
    src: i32,
    len: i32,
) -> Result<(), TrapCode> {
    let (src_base, src_len) = {
        let table = unsafe { table_entries(vmctx, src_idx)? };
        (table.as_ptr(), table.len())
    };
    let (dst_base, dst_len) = {
        let table = unsafe { table_entries(vmctx, dst_idx)? };
        (table.as_mut_ptr(), table.len())
    };
    let src = checked_range(src, len, src_len)?;
    let dst = checked_range(dst, len, dst_len)?;
    if !src.is_empty() {
        unsafe {
            ptr::copy(src_base.add(src.start), dst_base.add(dst.start), src.len());
        }
    }
    Ok(())
}

/// Implementation of `table.init` from a passive element segment.
pub(crate) unsafe fn table_init(
    vmctx: *mut VMContext,
    idx: i32,
    elem: i32,
    dst: i32,
    src: i32,
    len: i32,
) -> Result<(), TrapCode> {
    segments::with_elem_range(elem, src, len, |values| {
        let table = unsafe { table_entries(vmctx, idx)? };
        let range = checked_range(dst, len, table.len())?;
        for (slot, &value) in table[range].iter_mut().zip(values) {
            *slot = VMTableEntry::untyped(value);
        }
        Ok(())
    })
}
