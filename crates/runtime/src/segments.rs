//! Passive data and element segments.
//!
//! The embedder loads a module's passive segments into thread-local storage
//! before calling into generated code; `memory.init`, `table.init`, the
//! `array.*_data`/`array.*_elem` instructions and the two `drop`
//! instructions then refer to them by index.

use crate::gc::ops::{heap_ref, on_heap};
use crate::memory::memory_of;
use crate::table::checked_range;
use crate::trap::TrapCode;
use crate::vmcontext::VMContext;
use std::cell::RefCell;
use std::ptr;

struct Segment<T> {
    data: Vec<T>,
    dropped: bool,
}

impl<T> Default for Segment<T> {
    fn default() -> Segment<T> {
        Segment {
            data: Vec::new(),
            dropped: false,
        }
    }
}

impl<T> Segment<T> {
    /// The `count * unit` items starting at `offset`.
    ///
    /// A dropped segment only accepts empty ranges and yields `None` for
    /// them, which callers treat as a no-op.
    fn slice(&self, offset: i32, count: i32, unit: usize) -> Result<Option<&[T]>, TrapCode> {
        if self.dropped {
            return if count == 0 {
                Ok(None)
            } else {
                Err(TrapCode::HeapOutOfBounds)
            };
        }
        let (Ok(offset), Ok(count)) = (usize::try_from(offset), usize::try_from(count)) else {
            return Err(TrapCode::HeapOutOfBounds);
        };
        let len = count.checked_mul(unit).ok_or(TrapCode::HeapOutOfBounds)?;
        match offset.checked_add(len) {
            Some(end) if end <= self.data.len() => Ok(Some(&self.data[offset..end])),
            _ => Err(TrapCode::HeapOutOfBounds),
        }
    }
}

struct Segments {
    data: Vec<Segment<u8>>,
    elems: Vec<Segment<i64>>,
}

thread_local! {
    static SEGMENTS: RefCell<Segments> = const {
        RefCell::new(Segments {
            data: Vec::new(),
            elems: Vec::new(),
        })
    };
}

fn with_segments<R>(f: impl FnOnce(&mut Segments) -> R) -> R {
    SEGMENTS.with(|s| f(&mut s.borrow_mut()))
}

/// Discards all data segments and makes room for `count` empty ones.
pub fn init_data_segments(count: usize) {
    with_segments(|s| {
        s.data.clear();
        s.data.resize_with(count, Segment::default);
    });
}

/// Stores a copy of `bytes` as data segment `idx`. Indices beyond the count
/// given to [`init_data_segments`] are ignored.
pub fn add_data_segment(idx: usize, bytes: &[u8]) {
    with_segments(|s| {
        if let Some(seg) = s.data.get_mut(idx) {
            *seg = Segment {
                data: bytes.to_vec(),
                dropped: false,
            };
        }
    });
}

/// Discards all element segments and makes room for `count` empty ones.
pub fn init_elem_segments(count: usize) {
    with_segments(|s| {
        s.elems.clear();
        s.elems.resize_with(count, Segment::default);
    });
}

/// Stores a copy of `values` as element segment `idx`. Indices beyond the
/// count given to [`init_elem_segments`] are ignored.
pub fn add_elem_segment(idx: usize, values: &[i64]) {
    with_segments(|s| {
        if let Some(seg) = s.elems.get_mut(idx) {
            *seg = Segment {
                data: values.to_vec(),
                dropped: false,
            };
        }
    });
}

/// Releases every segment held by the calling thread.
pub fn clear_segments() {
    with_segments(|s| {
        s.data = Vec::new();
        s.elems = Vec::new();
    });
}

/// Runs `f` on `len` values of element segment `elem` starting at `src`.
///
/// `f` is skipped for an empty range of a dropped segment.
pub(crate) fn with_elem_range(
    elem: i32,
    src: i32,
    len: i32,
    f: impl FnOnce(&[i64]) -> Result<(), TrapCode>,
) -> Result<(), TrapCode> {
    with_segments(|s| {
        let seg = usize::try_from(elem)
            .ok()
            .and_then(|i| s.elems.get(i))
            .ok_or(TrapCode::HeapOutOfBounds)?;
        match seg.slice(src, len, 1)? {
            Some(values) => f(values),
            None => Ok(()),
        }
    })
}

/// Runs `f` on `count` items of `unit` bytes each of data segment `seg`
/// starting at byte `src`.
///
/// `f` is skipped for an empty range of a dropped segment.
pub(crate) fn with_data_range(
    seg: i32,
    src: i32,
    count: i32,
    unit: usize,
    f: impl FnOnce(&[u8]) -> Result<(), TrapCode>,
) -> Result<(), TrapCode> {
    with_segments(|s| {
        let seg = usize::try_from(seg)
            .ok()
            .and_then(|i| s.data.get(i))
            .ok_or(TrapCode::HeapOutOfBounds)?;
        match seg.slice(src, count, unit)? {
            Some(bytes) => f(bytes),
            None => Ok(()),
        }
    })
}

/// Byte width of the elements of a data-backed array type: the low two bits
/// of the type index select 1, 2, 4 or 8 bytes.
pub fn data_element_size(type_idx: i32) -> usize {
    1 << (type_idx & 3)
}

/// Decodes little-endian elements of `width` bytes, sign-extending each to
/// 64 bits.
fn decode_elements(bytes: &[u8], width: usize) -> Vec<i64> {
    let shift = 64 - 8 * width as u32;
    bytes
        .chunks_exact(width)
        .map(|chunk| {
            let mut buf = [0u8; 8];
            buf[..width].copy_from_slice(chunk);
            (i64::from_le_bytes(buf) << shift) >> shift
        })
        .collect()
}

/// Implementation of `memory.init`.
pub unsafe fn memory_init(
    vmctx: *mut VMContext,
    mem: i32,
    seg: i32,
    dst: i32,
    src: i32,
    len: i32,
) -> Result<(), TrapCode> {
    with_data_range(seg, src, len, 1, |bytes| {
        let mem = unsafe { memory_of(vmctx, mem) }.ok_or(TrapCode::HeapOutOfBounds)?;
        if mem.base.is_null() {
            return Err(TrapCode::HeapOutOfBounds);
        }
        let dst = checked_range(dst, len, mem.current_length())?;
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), mem.base.add(dst.start), bytes.len());
        }
        Ok(())
    })
}

/// Implementation of `data.drop`; out-of-range indices are ignored.
pub fn data_drop(_vmctx: *mut VMContext, seg: i32) {
    with_segments(|s| {
        if let Some(seg) = usize::try_from(seg).ok().and_then(|i| s.data.get_mut(i)) {
            seg.data = Vec::new();
            seg.dropped = true;
        }
    });
}

/// Implementation of `elem.drop`; out-of-range indices are ignored.
pub fn elem_drop(_vmctx: *mut VMContext, seg: i32) {
    with_segments(|s| {
        if let Some(seg) = usize::try_from(seg).ok().and_then(|i| s.elems.get_mut(i)) {
            seg.data = Vec::new();
            seg.dropped = true;
        }
    });
}

/// Implementation of `array.new_data`. An empty range of a dropped segment
/// yields an empty array.
pub(crate) fn array_new_data(
    _vmctx: *mut VMContext,
    type_idx: i32,
    seg: i32,
    offset: i32,
    len: i32,
) -> Result<i64, TrapCode> {
    let width = data_element_size(type_idx);
    let mut values = Vec::new();
    with_data_range(seg, offset, len, width, |bytes| {
        values = decode_elements(bytes, width);
        Ok(())
    })?;
    on_heap(|heap| Ok(heap.alloc_array_from_values(type_idx as u32, &values)?.encode()))
}

/// Implementation of `array.new_elem`.
pub(crate) fn array_new_elem(
    _vmctx: *mut VMContext,
    type_idx: i32,
    seg: i32,
    offset: i32,
    len: i32,
) -> Result<i64, TrapCode> {
    let mut values = Vec::new();
    with_elem_range(seg, offset, len, |elems| {
        values = elems.to_vec();
        Ok(())
    })?;
    on_heap(|heap| Ok(heap.alloc_array_from_values(type_idx as u32, &values)?.encode()))
}

fn copy_into_array(array: i64, start: i32, values: &[i64]) -> Result<(), TrapCode> {
    on_heap(|heap| {
        let r = heap_ref(array)?;
        let range = checked_range(start, values.len() as i32, heap.array_len(r)?)?;
        for (i, &value) in range.zip(values) {
            heap.array_set(r, i, value)?;
        }
        Ok(())
    })
}

/// Implementation of `array.init_data`.
pub(crate) fn array_init_data(
    _vmctx: *mut VMContext,
    type_idx: i32,
    seg: i32,
    array: i64,
    arr_offset: i32,
    seg_offset: i32,
    len: i32,
) -> Result<(), TrapCode> {
    let width = data_element_size(type_idx);
    with_data_range(seg, seg_offset, len, width, |bytes| {
        copy_into_array(array, arr_offset, &decode_elements(bytes, width))
    })
}

/// Implementation of `array.init_elem`.
pub(crate) fn array_init_elem(
    _vmctx: *mut VMContext,
    _type_idx: i32,
    seg: i32,
    array: i64,
    arr_offset: i32,
    seg_offset: i32,
    len: i32,
) -> Result<(), TrapCode> {
    with_elem_range(seg, seg_offset, len, |values| {
        copy_into_array(array, arr_offset, values)
    })
}
