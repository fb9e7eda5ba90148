//! Implementations of the GC libcalls.
//!
//! Each function returns `Err(code)` for a trap; the raw `extern "C"`
//! wrappers in `libcalls` raise it once every borrow taken here has been
//! released.

use super::{GcError, GcHeap, GcRef, RefValue, with_context_heap, with_heap, with_type_cache};
use crate::trap::TrapCode;
use crate::vmcontext::VMContext;

impl From<GcError> for TrapCode {
    fn from(e: GcError) -> TrapCode {
        match e {
            GcError::InvalidRef => TrapCode::UnreachableCodeReached,
            GcError::OutOfBounds => TrapCode::HeapOutOfBounds,
            GcError::OutOfMemory => TrapCode::AllocationFailure,
        }
    }
}

/// Runs `f` on the thread's current heap; a missing heap traps like a null
/// dereference.
pub(crate) fn on_heap<R>(f: impl FnOnce(&mut GcHeap) -> Result<R, TrapCode>) -> Result<R, TrapCode> {
    with_heap(|heap| match heap {
        Some(heap) => f(heap),
        None => Err(TrapCode::UnreachableCodeReached),
    })
}

/// Decodes a non-null heap reference.
pub(crate) fn heap_ref(value: i64) -> Result<GcRef, TrapCode> {
    match RefValue::decode(value) {
        RefValue::Heap(r) => Ok(r),
        _ => Err(TrapCode::UnreachableCodeReached),
    }
}

pub(crate) fn index(value: i32) -> Result<usize, TrapCode> {
    usize::try_from(value).map_err(|_| TrapCode::HeapOutOfBounds)
}

unsafe fn values<'a>(ptr: *const i64, len: i32) -> &'a [i64] {
    match usize::try_from(len) {
        Ok(len) if len > 0 && !ptr.is_null() => unsafe { std::slice::from_raw_parts(ptr, len) },
        _ => &[],
    }
}

fn alloc_struct(heap: &mut GcHeap, type_idx: i32, fields: &[i64]) -> Result<i64, TrapCode> {
    let ty = type_idx as u32;
    let r = if fields.is_empty() {
        let count = with_type_cache(|cache| cache.field_count(type_idx));
        heap.alloc_struct_zeroed(ty, count)?
    } else {
        heap.alloc_struct(ty, fields)?
    };
    Ok(r.encode())
}

/// `struct.new`: with no fields given the struct is zero-filled with as many
/// fields as the type cache records.
pub(crate) unsafe fn struct_new(type_idx: i32, fields: *const i64, num_fields: i32) -> Result<i64, TrapCode> {
    let fields = unsafe { values(fields, num_fields) };
    on_heap(|heap| alloc_struct(heap, type_idx, fields))
}

pub(crate) fn struct_get(value: i64, _type_idx: i32, field: i32) -> Result<i64, TrapCode> {
    on_heap(|heap| Ok(heap.struct_get(heap_ref(value)?, index(field)?)?))
}

pub(crate) fn struct_set(value: i64, _type_idx: i32, field: i32, new: i64) -> Result<(), TrapCode> {
    on_heap(|heap| Ok(heap.struct_set(heap_ref(value)?, index(field)?, new)?))
}

pub(crate) fn array_new(type_idx: i32, len: i32, fill: i64) -> Result<i64, TrapCode> {
    on_heap(|heap| Ok(heap.alloc_array(type_idx as u32, index(len)?, fill)?.encode()))
}

pub(crate) unsafe fn array_new_fixed(type_idx: i32, elems: *const i64, len: i32) -> Result<i64, TrapCode> {
    let elems = unsafe { values(elems, len) };
    on_heap(|heap| Ok(heap.alloc_array_from_values(type_idx as u32, elems)?.encode()))
}

pub(crate) fn array_get(value: i64, _type_idx: i32, idx: i32) -> Result<i64, TrapCode> {
    on_heap(|heap| Ok(heap.array_get(heap_ref(value)?, index(idx)?)?))
}

pub(crate) fn array_set(value: i64, _type_idx: i32, idx: i32, new: i64) -> Result<(), TrapCode> {
    on_heap(|heap| Ok(heap.array_set(heap_ref(value)?, index(idx)?, new)?))
}

pub(crate) fn array_len(value: i64) -> Result<i32, TrapCode> {
    on_heap(|heap| Ok(heap.array_len(heap_ref(value)?)? as i32))
}

pub(crate) fn array_fill(value: i64, start: i32, fill: i64, count: i32) -> Result<(), TrapCode> {
    on_heap(|heap| {
        let r = heap_ref(value)?;
        Ok(heap.array_fill(r, index(start)?, fill, index(count)?)?)
    })
}

pub(crate) fn array_copy(
    dst: i64,
    dst_start: i32,
    src: i64,
    src_start: i32,
    count: i32,
) -> Result<(), TrapCode> {
    on_heap(|heap| {
        let (dst, src) = (heap_ref(dst)?, heap_ref(src)?);
        Ok(heap.array_copy(dst, index(dst_start)?, src, index(src_start)?, index(count)?)?)
    })
}

/// `ref.test`: 1 if `value` is an instance of `type_idx`, else 0.
pub(crate) fn ref_test(value: i64, type_idx: i32, nullable: i32) -> i32 {
    with_heap(|heap| {
        let heap = heap.map(|h| &*h);
        with_type_cache(|cache| cache.ref_test(heap, value, type_idx, nullable != 0))
    }) as i32
}

/// `ref.cast`: returns `value` unchanged, or traps with a bad signature.
pub(crate) fn ref_cast(value: i64, type_idx: i32, nullable: i32) -> Result<i64, TrapCode> {
    if ref_test(value, type_idx, nullable) != 0 {
        Ok(value)
    } else {
        Err(TrapCode::BadSignature)
    }
}

/// Signature check of `call_indirect`.
pub(crate) fn check_indirect_call_type(actual: i32, expected: i32) -> Result<(), TrapCode> {
    if with_type_cache(|cache| cache.is_subtype(actual, expected)) {
        Ok(())
    } else {
        Err(TrapCode::BadSignature)
    }
}

/// Registers an object generated code bump-allocated at `obj` in the
/// context's heap.
pub(crate) unsafe fn register_inline(vmctx: *mut VMContext, obj: *mut u8, size: i32) -> Result<i64, TrapCode> {
    if vmctx.is_null() || obj.is_null() {
        return Err(TrapCode::UnreachableCodeReached);
    }
    let size = index(size)?;
    with_context_heap(vmctx, |heap| {
        let heap = heap.ok_or(TrapCode::UnreachableCodeReached)?;
        let offset = (obj as usize)
            .checked_sub(heap.base() as usize)
            .ok_or(TrapCode::HeapOutOfBounds)?;
        Ok(heap.register_inline(offset, size)?.encode())
    })
}

/// Publishes the heap's current bump window to `vmctx` after the slow path
/// may have moved the heap, adopting the thread's heap if the context had
/// none.
unsafe fn refresh_context(vmctx: *mut VMContext) {
    if let Some(ctx) = unsafe { vmctx.as_mut() } {
        if ctx.gc_heap.is_null() {
            ctx.gc_heap = super::current_heap_ptr();
        }
        ctx.update_gc_heap_ptr();
    }
}

/// Out-of-line struct allocation when the inline bump window is exhausted.
pub(crate) unsafe fn alloc_struct_slow(
    vmctx: *mut VMContext,
    type_idx: i32,
    fields: *const i64,
    num_fields: i32,
) -> Result<i64, TrapCode> {
    let fields = unsafe { values(fields, num_fields) };
    let r = with_context_heap(vmctx, |heap| {
        alloc_struct(heap.ok_or(TrapCode::UnreachableCodeReached)?, type_idx, fields)
    })?;
    unsafe { refresh_context(vmctx) };
    Ok(r)
}

/// Out-of-line array allocation when the inline bump window is exhausted.
pub(crate) unsafe fn alloc_array_slow(
    vmctx: *mut VMContext,
    type_idx: i32,
    len: i32,
    fill: i64,
) -> Result<i64, TrapCode> {
    let r = with_context_heap(vmctx, |heap| {
        let heap = heap.ok_or(TrapCode::UnreachableCodeReached)?;
        Ok::<i64, TrapCode>(heap.alloc_array(type_idx as u32, index(len)?, fill)?.encode())
    })?;
    unsafe { refresh_context(vmctx) };
    Ok(r)
}

/// Collects the context's heap with the given roots and returns the number
/// of objects freed.
pub(crate) unsafe fn gc_collect(vmctx: *mut VMContext, roots: *const i64, num_roots: i32) -> i32 {
    let roots = unsafe { values(roots, num_roots) };
    let collected = with_context_heap(vmctx, |heap| heap.map_or(0, |h| h.collect(roots)));
    if let Some(ctx) = unsafe { vmctx.as_mut() } {
        ctx.update_gc_heap_ptr();
    }
    i32::try_from(collected).unwrap_or(i32::MAX)
}
