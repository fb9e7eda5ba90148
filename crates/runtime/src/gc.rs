//! Garbage-collected structs and arrays.
//!
//! Objects live in a [`GcHeap`]. Generated code never sees object addresses
//! as references: it passes around `i64` values whose encoding is described
//! by [`RefValue`], and a heap reference is a 1-based index into the heap's
//! object table shifted left by one. Compaction may move objects but never
//! changes their index.

mod heap;
pub(crate) mod ops;
mod types;

pub use heap::{GcError, GcFlags, GcHeader, GcHeap, GcKind, GcStats};
pub use types::{AbstractHeapType, TypeCache, TypeInfo};

use crate::vmcontext::VMContext;
use std::cell::RefCell;
use std::num::NonZeroU32;

/// Default initial byte capacity of a heap.
pub const DEFAULT_HEAP_CAPACITY: usize = 1024 * 1024;

/// Default initial number of object-table slots of a heap.
pub const DEFAULT_OBJECT_CAPACITY: usize = 1024;

/// Tag bit carried by function references that hold a code pointer.
pub const FUNCREF_TAG: i64 = 1 << 61;

/// Tag bit carried by external references.
pub const EXTERNREF_TAG: i64 = 1 << 62;

const REF_TAGS_MASK: i64 = FUNCREF_TAG | EXTERNREF_TAG;

/// A reference to an object in a [`GcHeap`]: a 1-based object-table index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GcRef(NonZeroU32);

impl GcRef {
    /// Creates a reference from an object-table index; `None` for 0.
    pub fn new(index: u32) -> Option<GcRef> {
        NonZeroU32::new(index).map(GcRef)
    }

    /// The 1-based object-table index.
    pub fn index(self) -> u32 {
        self.0.get()
    }

    /// The value generated code uses for this reference.
    pub fn encode(self) -> i64 {
        i64::from(self.0.get()) << 1
    }

    /// Decodes a value produced by [`GcRef::encode`].
    pub fn decode(raw: i64) -> Option<GcRef> {
        match RefValue::decode(raw) {
            RefValue::Heap(r) => Some(r),
            _ => None,
        }
    }
}

/// A decoded reference value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefValue {
    /// The null reference, encoded as 0.
    Null,
    /// An `i31ref`, encoded as `(payload << 1) | 1`.
    I31(u32),
    /// A heap object, encoded as `index << 1`.
    Heap(GcRef),
    /// A function by index, encoded as `-(index + 1)`.
    FuncIndex(u64),
    /// A function by code pointer, tagged with [`FUNCREF_TAG`].
    FuncPtr(usize),
    /// An external reference, tagged with [`EXTERNREF_TAG`].
    Extern(i64),
    /// An untagged even value too large to be an object index.
    Invalid(i64),
}

impl RefValue {
    /// Classifies a raw reference value.
    pub fn decode(raw: i64) -> RefValue {
        if raw == 0 {
            RefValue::Null
        } else if raw < 0 {
            RefValue::FuncIndex((-(raw + 1)) as u64)
        } else if raw & EXTERNREF_TAG != 0 {
            RefValue::Extern(raw)
        } else if raw & FUNCREF_TAG != 0 {
            RefValue::FuncPtr((raw & !FUNCREF_TAG) as usize)
        } else if raw & 1 == 1 {
            RefValue::I31(((raw >> 1) & 0x7fff_ffff) as u32)
        } else {
            match u32::try_from(raw >> 1).ok().and_then(GcRef::new) {
                Some(r) => RefValue::Heap(r),
                None => RefValue::Invalid(raw),
            }
        }
    }

    /// The raw encoding of this value.
    pub fn encode(self) -> i64 {
        match self {
            RefValue::Null => 0,
            RefValue::I31(payload) => (i64::from(payload & 0x7fff_ffff) << 1) | 1,
            RefValue::Heap(r) => r.encode(),
            RefValue::FuncIndex(idx) => -(idx as i64) - 1,
            RefValue::FuncPtr(ptr) => (ptr as i64 & !REF_TAGS_MASK) | FUNCREF_TAG,
            RefValue::Extern(raw) | RefValue::Invalid(raw) => raw,
        }
    }
}

thread_local! {
    static HEAP: RefCell<Option<Box<GcHeap>>> = const { RefCell::new(None) };
}

/// Installs `heap` as the calling thread's current heap, returning the
/// previous one.
///
/// Libcalls without a context, and contexts without a heap of their own,
/// allocate here.
pub fn set_heap(heap: Option<GcHeap>) -> Option<GcHeap> {
    HEAP.with(|h| h.replace(heap.map(Box::new)).map(|b| *b))
}

/// Removes and returns the calling thread's current heap.
pub fn take_heap() -> Option<GcHeap> {
    set_heap(None)
}

/// A stable pointer to the calling thread's current heap, suitable for
/// [`VMContext::set_gc_heap`], or null when none is installed.
pub fn current_heap_ptr() -> *mut GcHeap {
    HEAP.with(|h| match h.borrow_mut().as_mut() {
        Some(heap) => &mut **heap as *mut GcHeap,
        None => std::ptr::null_mut(),
    })
}

/// Runs `f` with the calling thread's current heap.
pub fn with_heap<R>(f: impl FnOnce(Option<&mut GcHeap>) -> R) -> R {
    HEAP.with(|h| match h.try_borrow_mut() {
        Ok(mut heap) => f(heap.as_deref_mut()),
        Err(_) => f(None),
    })
}

/// Runs `f` with the heap `vmctx` allocates in: its own heap if it has one,
/// otherwise the thread's current heap.
pub(crate) fn with_context_heap<R>(
    vmctx: *mut VMContext,
    f: impl FnOnce(Option<&mut GcHeap>) -> R,
) -> R {
    let own = unsafe { vmctx.as_ref() }.map_or(std::ptr::null_mut(), |ctx| ctx.gc_heap);
    match unsafe { own.as_mut() } {
        Some(heap) => f(Some(heap)),
        None => with_heap(f),
    }
}

/// Installs `cache` as the calling thread's type cache, returning the
/// previous one.
pub fn set_type_cache(cache: TypeCache) -> TypeCache {
    types::set_type_cache(cache)
}

/// Runs `f` with the calling thread's type cache.
pub fn with_type_cache<R>(f: impl FnOnce(&mut TypeCache) -> R) -> R {
    types::with_type_cache(f)
}
