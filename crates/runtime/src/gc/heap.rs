//! The object store: a bump-allocated byte buffer plus an object table,
//! collected by mark, sweep and sliding compaction.

use super::{GcRef, RefValue};
use crate::config::RuntimeConfig;
use std::ptr;

const HEADER_SIZE: usize = 16;
const OBJECT_ALIGN: usize = 16;
/// Bytes between the header and the first element of an array: the `i32`
/// length and 4 bytes of padding.
const ARRAY_LEN_SIZE: usize = 8;

fn align_up(size: usize) -> usize {
    (size + OBJECT_ALIGN - 1) & !(OBJECT_ALIGN - 1)
}

/// Errors from heap operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum GcError {
    /// The reference does not name a live object of the expected kind.
    #[error("invalid or dangling GC reference")]
    InvalidRef,
    /// A field or element index was out of bounds.
    #[error("GC object access out of bounds")]
    OutOfBounds,
    /// The heap or its object table could not grow.
    #[error("GC heap allocation failed")]
    OutOfMemory,
}

/// What a heap slot holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GcKind {
    /// Freed, or no object at all.
    Free = 0,
    /// A struct.
    Struct = 1,
    /// An array.
    Array = 2,
}

impl GcKind {
    fn from_u8(kind: u8) -> GcKind {
        match kind {
            1 => GcKind::Struct,
            2 => GcKind::Array,
            _ => GcKind::Free,
        }
    }
}

bitflags::bitflags! {
    /// Per-object collector flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[repr(transparent)]
    pub struct GcFlags: u8 {
        /// Reached during the current mark phase.
        const MARKED = 1 << 0;
    }
}

/// The 16-byte header preceding every object's payload.
///
/// Generated code that allocates inline writes this header itself before
/// registering the object.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct GcHeader {
    /// A [`GcKind`] discriminant.
    pub kind: u8,
    /// Collector flags.
    pub flags: GcFlags,
    /// The object's type index.
    pub type_idx: u16,
    /// Total size including the header, a multiple of 16.
    pub size: u32,
    /// Field count for structs; unused for arrays.
    pub field_count: u64,
}

/// Allocation and collection counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    /// Objects allocated over the heap's lifetime.
    pub total_allocations: u64,
    /// Completed collections.
    pub total_collections: u64,
}

#[derive(Clone, Copy, Default)]
#[repr(C, align(16))]
struct Chunk([u8; OBJECT_ALIGN]);

/// A heap of GC structs and arrays.
pub struct GcHeap {
    /// Always fully initialized; its length is the capacity in 16-byte units.
    data: Vec<Chunk>,
    used: usize,
    /// Byte offset of each object, `None` once freed.
    objects: Vec<Option<u32>>,
    stats: GcStats,
}

impl GcHeap {
    /// Creates a heap with `capacity` bytes, or the default capacity for 0.
    pub fn new(capacity: usize) -> GcHeap {
        GcHeap::with_capacity(capacity, super::DEFAULT_OBJECT_CAPACITY)
    }

    /// Creates a heap with explicit byte and object-table capacities.
    pub fn with_capacity(capacity: usize, objects: usize) -> GcHeap {
        let capacity = if capacity == 0 {
            super::DEFAULT_HEAP_CAPACITY
        } else {
            align_up(capacity)
        };
        GcHeap {
            data: vec![Chunk::default(); capacity / OBJECT_ALIGN],
            used: 0,
            objects: Vec::with_capacity(objects.max(1)),
            stats: GcStats::default(),
        }
    }

    /// Creates a heap sized by `config`.
    pub fn with_config(config: &RuntimeConfig) -> GcHeap {
        GcHeap::with_capacity(config.gc_heap_capacity, config.gc_object_capacity)
    }

    /// Start of the object buffer. Moves when the heap grows.
    pub fn base(&self) -> *const u8 {
        self.data.as_ptr().cast()
    }

    /// Bytes in use.
    pub fn used(&self) -> usize {
        self.used
    }

    /// Bytes available before the buffer must grow.
    pub fn capacity(&self) -> usize {
        self.data.len() * OBJECT_ALIGN
    }

    /// Number of object-table slots handed out, including freed ones.
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// Allocation and collection counters.
    pub fn stats(&self) -> GcStats {
        self.stats
    }

    /// The bump-allocation cursor and limit generated code may allocate
    /// between before calling back into the runtime.
    pub fn bump_bounds(&mut self) -> (*mut u8, *mut u8) {
        let capacity = self.capacity();
        let base = self.data.as_mut_ptr().cast::<u8>();
        unsafe { (base.add(self.used), base.add(capacity)) }
    }

    /// Byte offset of `r`'s header, if it is live.
    pub fn offset(&self, r: GcRef) -> Option<usize> {
        let slot = *self.objects.get(r.index() as usize - 1)?;
        slot.map(|off| off as usize)
    }

    fn bytes(&self) -> *const u8 {
        self.data.as_ptr().cast()
    }

    fn bytes_mut(&mut self) -> *mut u8 {
        self.data.as_mut_ptr().cast()
    }

    fn header_at(&self, offset: usize) -> GcHeader {
        debug_assert!(offset + HEADER_SIZE <= self.capacity());
        unsafe { ptr::read_unaligned(self.bytes().add(offset).cast()) }
    }

    fn write_header(&mut self, offset: usize, header: GcHeader) {
        debug_assert!(offset + HEADER_SIZE <= self.capacity());
        unsafe { ptr::write_unaligned(self.bytes_mut().add(offset).cast(), header) }
    }

    fn read_i64(&self, offset: usize) -> i64 {
        debug_assert!(offset + 8 <= self.capacity());
        unsafe { ptr::read_unaligned(self.bytes().add(offset).cast()) }
    }

    fn write_i64(&mut self, offset: usize, value: i64) {
        debug_assert!(offset + 8 <= self.capacity());
        unsafe { ptr::write_unaligned(self.bytes_mut().add(offset).cast(), value) }
    }

    /// The header of live object `r`.
    pub fn header(&self, r: GcRef) -> Option<GcHeader> {
        self.offset(r).map(|off| self.header_at(off))
    }

    fn ensure_capacity(&mut self, needed: usize) -> Result<(), GcError> {
        let required = self.used.checked_add(needed).ok_or(GcError::OutOfMemory)?;
        if required <= self.capacity() {
            return Ok(());
        }
        let mut new_capacity = self.capacity().max(OBJECT_ALIGN);
        while new_capacity < required {
            new_capacity = new_capacity.checked_mul(2).ok_or(GcError::OutOfMemory)?;
        }
        let chunks = new_capacity / OBJECT_ALIGN;
        self.data
            .try_reserve_exact(chunks - self.data.len())
            .map_err(|_| GcError::OutOfMemory)?;
        self.data.resize(chunks, Chunk::default());
        log::trace!("GC heap grew to {new_capacity:#x} bytes");
        Ok(())
    }

    fn push_object(&mut self, offset: usize) -> Result<GcRef, GcError> {
        let offset = u32::try_from(offset).map_err(|_| GcError::OutOfMemory)?;
        self.objects.try_reserve(1).map_err(|_| GcError::OutOfMemory)?;
        self.objects.push(Some(offset));
        self.stats.total_allocations += 1;
        let index = u32::try_from(self.objects.len()).map_err(|_| GcError::OutOfMemory)?;
        GcRef::new(index).ok_or(GcError::OutOfMemory)
    }

    /// Reserves a zeroed object of `payload` bytes and writes its header.
    fn alloc_raw(
        &mut self,
        kind: GcKind,
        type_idx: u32,
        payload: usize,
        field_count: u64,
    ) -> Result<(GcRef, usize), GcError> {
        let total = HEADER_SIZE
            .checked_add(payload)
            .map(align_up)
            .ok_or(GcError::OutOfMemory)?;
        let size = u32::try_from(total).map_err(|_| GcError::OutOfMemory)?;
        self.ensure_capacity(total)?;
        let offset = self.used;
        let r = self.push_object(offset)?;
        unsafe {
            ptr::write_bytes(self.bytes_mut().add(offset), 0, total);
        }
        self.write_header(
            offset,
            GcHeader {
                kind: kind as u8,
                flags: GcFlags::empty(),
                type_idx: type_idx as u16,
                size,
                field_count,
            },
        );
        self.used += total;
        Ok((r, offset + HEADER_SIZE))
    }

    /// Allocates a struct holding `fields`.
    pub fn alloc_struct(&mut self, type_idx: u32, fields: &[i64]) -> Result<GcRef, GcError> {
        let (r, payload) = self.alloc_raw(
            GcKind::Struct,
            type_idx,
            fields.len() * 8,
            fields.len() as u64,
        )?;
        for (i, &value) in fields.iter().enumerate() {
            self.write_i64(payload + i * 8, value);
        }
        Ok(r)
    }

    /// Allocates a struct of `num_fields` zeroed fields.
    pub fn alloc_struct_zeroed(&mut self, type_idx: u32, num_fields: usize) -> Result<GcRef, GcError> {
        let (r, _) = self.alloc_raw(GcKind::Struct, type_idx, num_fields * 8, num_fields as u64)?;
        Ok(r)
    }

    fn alloc_array_raw(&mut self, type_idx: u32, len: usize) -> Result<(GcRef, usize), GcError> {
        let len32 = i32::try_from(len).map_err(|_| GcError::OutOfMemory)?;
        let payload = len
            .checked_mul(8)
            .and_then(|n| n.checked_add(ARRAY_LEN_SIZE))
            .ok_or(GcError::OutOfMemory)?;
        let (r, data) = self.alloc_raw(GcKind::Array, type_idx, payload, 0)?;
        unsafe {
            ptr::write_unaligned(self.bytes_mut().add(data).cast::<i32>(), len32);
        }
        Ok((r, data + ARRAY_LEN_SIZE))
    }

    /// Allocates an array of `len` copies of `fill`.
    pub fn alloc_array(&mut self, type_idx: u32, len: usize, fill: i64) -> Result<GcRef, GcError> {
        let (r, elems) = self.alloc_array_raw(type_idx, len)?;
        if fill != 0 {
            for i in 0..len {
                self.write_i64(elems + i * 8, fill);
            }
        }
        Ok(r)
    }

    /// Allocates an array holding `values`.
    pub fn alloc_array_from_values(&mut self, type_idx: u32, values: &[i64]) -> Result<GcRef, GcError> {
        let (r, elems) = self.alloc_array_raw(type_idx, values.len())?;
        for (i, &value) in values.iter().enumerate() {
            self.write_i64(elems + i * 8, value);
        }
        Ok(r)
    }

    /// Payload offset and field capacity of live struct `r`.
    ///
    /// The capacity comes from the object size rather than the recorded
    /// field count, which inline-allocated structs may leave at 0.
    fn struct_fields(&self, r: GcRef) -> Result<(usize, usize), GcError> {
        let offset = self.offset(r).ok_or(GcError::InvalidRef)?;
        let header = self.header_at(offset);
        if GcKind::from_u8(header.kind) != GcKind::Struct {
            return Err(GcError::InvalidRef);
        }
        let capacity = (header.size as usize).saturating_sub(HEADER_SIZE) / 8;
        Ok((offset + HEADER_SIZE, capacity))
    }

    /// Reads field `field` of struct `r`.
    pub fn struct_get(&self, r: GcRef, field: usize) -> Result<i64, GcError> {
        let (payload, capacity) = self.struct_fields(r)?;
        if field >= capacity {
            return Err(GcError::OutOfBounds);
        }
        Ok(self.read_i64(payload + field * 8))
    }

    /// Writes field `field` of struct `r`.
    pub fn struct_set(&mut self, r: GcRef, field: usize, value: i64) -> Result<(), GcError> {
        let (payload, capacity) = self.struct_fields(r)?;
        if field >= capacity {
            return Err(GcError::OutOfBounds);
        }
        self.write_i64(payload + field * 8, value);
        Ok(())
    }

    /// Element offset and length of live array `r`.
    fn array_elems(&self, r: GcRef) -> Result<(usize, usize), GcError> {
        let offset = self.offset(r).ok_or(GcError::InvalidRef)?;
        let header = self.header_at(offset);
        if GcKind::from_u8(header.kind) != GcKind::Array {
            return Err(GcError::InvalidRef);
        }
        let data = offset + HEADER_SIZE;
        let len: i32 = unsafe { ptr::read_unaligned(self.bytes().add(data).cast()) };
        // Never trust a length that doesn't fit in the object.
        let room = (header.size as usize).saturating_sub(HEADER_SIZE + ARRAY_LEN_SIZE) / 8;
        let len = usize::try_from(len).unwrap_or(0).min(room);
        Ok((data + ARRAY_LEN_SIZE, len))
    }

    fn array_range(&self, r: GcRef, start: usize, count: usize) -> Result<usize, GcError> {
        let (elems, len) = self.array_elems(r)?;
        match start.checked_add(count) {
            Some(end) if end <= len => Ok(elems + start * 8),
            _ => Err(GcError::OutOfBounds),
        }
    }

    /// Length of array `r`.
    pub fn array_len(&self, r: GcRef) -> Result<usize, GcError> {
        self.array_elems(r).map(|(_, len)| len)
    }

    /// Reads element `idx` of array `r`.
    pub fn array_get(&self, r: GcRef, idx: usize) -> Result<i64, GcError> {
        let at = self.array_range(r, idx, 1)?;
        Ok(self.read_i64(at))
    }

    /// Writes element `idx` of array `r`.
    pub fn array_set(&mut self, r: GcRef, idx: usize, value: i64) -> Result<(), GcError> {
        let at = self.array_range(r, idx, 1)?;
        self.write_i64(at, value);
        Ok(())
    }

    /// Sets `count` elements of `r` starting at `start` to `value`.
    pub fn array_fill(&mut self, r: GcRef, start: usize, value: i64, count: usize) -> Result<(), GcError> {
        let at = self.array_range(r, start, count)?;
        for i in 0..count {
            self.write_i64(at + i * 8, value);
        }
        Ok(())
    }

    /// Copies `count` elements between arrays; the ranges may overlap.
    pub fn array_copy(
        &mut self,
        dst: GcRef,
        dst_start: usize,
        src: GcRef,
        src_start: usize,
        count: usize,
    ) -> Result<(), GcError> {
        let to = self.array_range(dst, dst_start, count)?;
        let from = self.array_range(src, src_start, count)?;
        unsafe {
            let base = self.bytes_mut();
            ptr::copy(base.add(from), base.add(to), count * 8);
        }
        Ok(())
    }

    /// Type index of `r`, or -1 if it is not live.
    pub fn type_idx(&self, r: GcRef) -> i32 {
        self.header(r).map_or(-1, |h| i32::from(h.type_idx))
    }

    /// Kind of `r`, [`GcKind::Free`] if it is not live.
    pub fn kind(&self, r: GcRef) -> GcKind {
        self.header(r).map_or(GcKind::Free, |h| GcKind::from_u8(h.kind))
    }

    /// Whether `r` names a live object.
    pub fn is_valid(&self, r: GcRef) -> bool {
        self.offset(r).is_some()
    }

    /// Marks the object encoded in `value`, and everything reachable from
    /// it. Non-heap values are ignored.
    pub fn mark(&mut self, value: i64) {
        let mut worklist = Vec::new();
        self.mark_value(value, &mut worklist);
        while let Some(offset) = worklist.pop() {
            let header = self.header_at(offset);
            let (first, count) = match GcKind::from_u8(header.kind) {
                GcKind::Struct => {
                    let room = (header.size as usize).saturating_sub(HEADER_SIZE) / 8;
                    let count = usize::try_from(header.field_count).unwrap_or(room);
                    (offset + HEADER_SIZE, count.min(room))
                }
                GcKind::Array => {
                    let data = offset + HEADER_SIZE;
                    let len: i32 = unsafe { ptr::read_unaligned(self.bytes().add(data).cast()) };
                    let room =
                        (header.size as usize).saturating_sub(HEADER_SIZE + ARRAY_LEN_SIZE) / 8;
                    (data + ARRAY_LEN_SIZE, usize::try_from(len).unwrap_or(0).min(room))
                }
                GcKind::Free => continue,
            };
            for i in 0..count {
                let child = self.read_i64(first + i * 8);
                self.mark_value(child, &mut worklist);
            }
        }
    }

    fn mark_value(&mut self, value: i64, worklist: &mut Vec<usize>) {
        let RefValue::Heap(r) = RefValue::decode(value) else {
            return;
        };
        let Some(offset) = self.offset(r) else {
            return;
        };
        let mut header = self.header_at(offset);
        if header.flags.contains(GcFlags::MARKED) {
            return;
        }
        header.flags.insert(GcFlags::MARKED);
        self.write_header(offset, header);
        worklist.push(offset);
    }

    /// Marks every object reachable from `roots`.
    pub fn mark_roots(&mut self, roots: &[i64]) {
        for &root in roots {
            self.mark(root);
        }
    }

    /// Frees every unmarked object and clears the marks of the survivors.
    /// Returns the number of objects freed.
    pub fn sweep(&mut self) -> usize {
        let mut collected = 0;
        for i in 0..self.objects.len() {
            let Some(offset) = self.objects[i] else {
                continue;
            };
            let offset = offset as usize;
            let mut header = self.header_at(offset);
            if header.flags.contains(GcFlags::MARKED) {
                header.flags.remove(GcFlags::MARKED);
            } else {
                header.kind = GcKind::Free as u8;
                self.objects[i] = None;
                collected += 1;
            }
            self.write_header(offset, header);
        }
        collected
    }

    /// Slides live objects down over freed space, in object-table order.
    /// References stay valid; addresses do not.
    pub fn compact(&mut self) {
        let mut next = 0usize;
        for i in 0..self.objects.len() {
            let Some(old) = self.objects[i] else {
                continue;
            };
            let old = old as usize;
            let size = align_up(self.header_at(old).size as usize);
            if old != next {
                unsafe {
                    let base = self.bytes_mut();
                    ptr::copy(base.add(old), base.add(next), size);
                }
                self.objects[i] = Some(next as u32);
            }
            next += size;
        }
        self.used = next;
    }

    /// Runs a full collection with `roots` and returns the number of objects
    /// freed.
    pub fn collect(&mut self, roots: &[i64]) -> usize {
        self.mark_roots(roots);
        let collected = self.sweep();
        self.compact();
        self.stats.total_collections += 1;
        log::debug!(
            "GC collection {} freed {collected} objects, {:#x} bytes in use",
            self.stats.total_collections,
            self.used
        );
        collected
    }

    /// Adds an object that generated code bump-allocated at `offset` to the
    /// object table. The header must already be written.
    ///
    /// `offset` must lie at or past the bump cursor: compaction relies on the
    /// object table being sorted by offset.
    pub fn register_inline(&mut self, offset: usize, size: usize) -> Result<GcRef, GcError> {
        let end = offset
            .checked_add(align_up(size.max(HEADER_SIZE)))
            .ok_or(GcError::OutOfBounds)?;
        if offset < self.used || offset % OBJECT_ALIGN != 0 || end > self.capacity() {
            return Err(GcError::OutOfBounds);
        }
        let r = self.push_object(offset)?;
        self.used = self.used.max(end);
        Ok(r)
    }
}

impl std::fmt::Debug for GcHeap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcHeap")
            .field("used", &self.used)
            .field("capacity", &self.capacity())
            .field("objects", &self.objects.len())
            .field("stats", &self.stats)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn header_layout() {
        assert_eq!(std::mem::size_of::<GcHeader>(), HEADER_SIZE);
        assert_eq!(std::mem::offset_of!(GcHeader, type_idx), 2);
        assert_eq!(std::mem::offset_of!(GcHeader, size), 4);
        assert_eq!(std::mem::offset_of!(GcHeader, field_count), 8);
    }

    #[test]
    fn structs() -> Result<(), GcError> {
        let mut heap = GcHeap::new(0);
        let s = heap.alloc_struct(3, &[10, 20, 30])?;
        assert_eq!(s.index(), 1);
        assert_eq!(heap.kind(s), GcKind::Struct);
        assert_eq!(heap.type_idx(s), 3);
        assert_eq!(heap.struct_get(s, 2)?, 30);
        heap.struct_set(s, 0, -1)?;
        assert_eq!(heap.struct_get(s, 0)?, -1);
        // Three fields round up to a 48-byte object with room for four.
        assert_eq!(heap.struct_get(s, 3)?, 0);
        assert_eq!(heap.struct_get(s, 4), Err(GcError::OutOfBounds));
        assert_eq!(heap.used(), 48);

        let z = heap.alloc_struct_zeroed(1, 2)?;
        assert_eq!(heap.struct_get(z, 1)?, 0);
        assert_eq!(heap.array_len(z), Err(GcError::InvalidRef));
        Ok(())
    }

    #[test]
    fn arrays() -> Result<(), GcError> {
        let mut heap = GcHeap::new(64);
        let a = heap.alloc_array(0, 5, 7)?;
        assert_eq!(heap.kind(a), GcKind::Array);
        assert_eq!(heap.array_len(a)?, 5);
        assert_eq!(heap.array_get(a, 4)?, 7);
        assert_eq!(heap.array_get(a, 5), Err(GcError::OutOfBounds));
        heap.array_fill(a, 1, 9, 2)?;
        assert_eq!(heap.array_fill(a, 4, 0, 2), Err(GcError::OutOfBounds));

        let b = heap.alloc_array_from_values(0, &[1, 2, 3, 4, 5])?;
        heap.array_copy(b, 1, b, 0, 4)?;
        assert_eq!(heap.array_get(b, 4)?, 4);
        heap.array_copy(a, 0, b, 0, 2)?;
        assert_eq!(heap.array_get(a, 1)?, 1);
        assert_eq!(heap.array_get(a, 2)?, 9);
        assert!(heap.capacity() > 64);
        assert_eq!(heap.stats().total_allocations, 2);
        Ok(())
    }

    #[test]
    fn cycles_are_collected_once_unreachable() -> Result<(), GcError> {
        let mut heap = GcHeap::new(0);
        let a = heap.alloc_struct(0, &[0])?;
        let b = heap.alloc_struct(0, &[a.encode()])?;
        heap.struct_set(a, 0, b.encode())?;
        let lone = heap.alloc_array(0, 3, 0)?;

        assert_eq!(heap.collect(&[a.encode()]), 1);
        assert!(heap.is_valid(a) && heap.is_valid(b));
        assert!(!heap.is_valid(lone));
        assert_eq!(heap.kind(lone), GcKind::Free);
        assert_eq!(heap.type_idx(lone), -1);

        assert_eq!(heap.collect(&[]), 2);
        assert_eq!(heap.used(), 0);
        assert_eq!(heap.stats().total_collections, 2);
        Ok(())
    }

    #[test]
    fn compaction_preserves_contents() -> Result<(), GcError> {
        let mut heap = GcHeap::new(0);
        let garbage = heap.alloc_array(0, 10, 1)?;
        let kept = heap.alloc_array_from_values(4, &[5, 6, 7])?;
        let before = heap.offset(kept).unwrap();
        heap.collect(&[kept.encode()]);
        assert!(!heap.is_valid(garbage));
        assert!(heap.offset(kept).unwrap() < before);
        assert_eq!(heap.array_get(kept, 2)?, 7);
        assert_eq!(heap.type_idx(kept), 4);
        Ok(())
    }

    #[test]
    fn deep_chains_mark_without_recursion() -> Result<(), GcError> {
        let mut heap = GcHeap::new(0);
        let mut head = 0;
        for _ in 0..100_000 {
            head = heap.alloc_struct(0, &[head])?.encode();
        }
        assert_eq!(heap.collect(&[head]), 0);
        Ok(())
    }

    #[test]
    fn inline_registration() -> Result<(), GcError> {
        let mut heap = GcHeap::new(0);
        heap.alloc_struct(0, &[1])?;
        let (cursor, limit) = heap.bump_bounds();
        let offset = cursor as usize - heap.base() as usize;
        assert_eq!(limit as usize - heap.base() as usize, heap.capacity());

        let header = GcHeader {
            kind: GcKind::Struct as u8,
            flags: GcFlags::empty(),
            type_idx: 9,
            size: 32,
            field_count: 2,
        };
        unsafe {
            ptr::write_unaligned(cursor.cast::<GcHeader>(), header);
            ptr::write_unaligned(cursor.add(HEADER_SIZE).cast::<i64>(), 77);
        }
        let r = heap.register_inline(offset, 32)?;
        assert_eq!(r.index(), 2);
        assert_eq!(heap.used(), offset + 32);
        assert_eq!(heap.type_idx(r), 9);
        assert_eq!(heap.struct_get(r, 0)?, 77);
        assert_eq!(heap.register_inline(8, 32), Err(GcError::OutOfBounds));
        assert_eq!(heap.register_inline(heap.capacity(), 16), Err(GcError::OutOfBounds));
        Ok(())
    }

    #[test]
    fn inline_registration_cannot_alias_live_objects() -> Result<(), GcError> {
        let mut heap = GcHeap::new(0);
        heap.alloc_struct(0, &[7])?;
        let b = heap.alloc_struct(0, &[8])?;
        let used = heap.used();
        assert_eq!(heap.register_inline(0, 32), Err(GcError::OutOfBounds));
        assert_eq!(heap.register_inline(used - 16, 16), Err(GcError::OutOfBounds));
        assert_eq!(heap.object_count(), 2);

        assert_eq!(heap.collect(&[b.encode()]), 1);
        assert!(heap.is_valid(b));
        assert_eq!(heap.struct_get(b, 0)?, 8);
        Ok(())
    }

    proptest! {
        #[test]
        fn references_survive_collection(
            sizes in prop::collection::vec(0usize..16, 1..40),
            keep in prop::collection::vec(any::<bool>(), 40),
        ) {
            let mut heap = GcHeap::new(256);
            let mut live = Vec::new();
            let mut roots = Vec::new();
            for (i, &len) in sizes.iter().enumerate() {
                let values = (0..len as i64).map(|v| v * 2 + 1).collect::<Vec<_>>();
                let r = heap.alloc_array_from_values(i as u32, &values).unwrap();
                if keep[i] {
                    roots.push(r.encode());
                    live.push((r, values, i as i32));
                }
            }
            let freed = heap.collect(&roots);
            prop_assert_eq!(freed, sizes.len() - live.len());
            for (r, values, ty) in &live {
                prop_assert!(heap.is_valid(*r));
                prop_assert_eq!(heap.type_idx(*r), *ty);
                prop_assert_eq!(heap.array_len(*r).unwrap(), values.len());
                for (i, v) in values.iter().enumerate() {
                    prop_assert_eq!(heap.array_get(*r, i).unwrap(), *v);
                }
            }
        }

        #[test]
        fn sweep_frees_exactly_the_unreachable(
            edges in prop::collection::vec((0usize..20, 0usize..20), 0..40),
            roots in prop::collection::vec(0usize..20, 0..5),
        ) {
            let mut heap = GcHeap::new(0);
            let refs = (0..20)
                .map(|_| heap.alloc_struct_zeroed(0, 4).unwrap())
                .collect::<Vec<_>>();
            let mut adjacency = vec![Vec::new(); 20];
            for &(from, to) in &edges {
                if adjacency[from].len() < 4 {
                    heap.struct_set(refs[from], adjacency[from].len(), refs[to].encode()).unwrap();
                    adjacency[from].push(to);
                }
            }

            let mut reachable = vec![false; 20];
            let mut stack = roots.clone();
            while let Some(n) = stack.pop() {
                if !std::mem::replace(&mut reachable[n], true) {
                    stack.extend(&adjacency[n]);
                }
            }

            let encoded = roots.iter().map(|&n| refs[n].encode()).collect::<Vec<_>>();
            heap.mark_roots(&encoded);
            let freed = heap.sweep();
            prop_assert_eq!(freed, reachable.iter().filter(|r| !**r).count());
            for (n, r) in refs.iter().enumerate() {
                prop_assert_eq!(heap.is_valid(*r), reachable[n]);
            }
        }
    }
}
