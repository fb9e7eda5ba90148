//! Per-thread type information consulted by casts and indirect-call
//! signature checks.

use super::{GcHeap, GcKind, RefValue};
use crate::vmcontext::VMFunctionBody;
use std::cell::RefCell;

/// Abstract heap types, encoded as negative type indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum AbstractHeapType {
    /// `any`
    Any = -1,
    /// `eq`
    Eq = -2,
    /// `i31`
    I31 = -3,
    /// `struct`
    Struct = -4,
    /// `array`
    Array = -5,
    /// `func`
    Func = -6,
    /// `extern`
    Extern = -7,
    /// `none`
    None = -8,
    /// `nofunc`
    NoFunc = -9,
    /// `noextern`
    NoExtern = -10,
}

impl AbstractHeapType {
    /// Decodes a negative type index.
    pub fn from_raw(raw: i32) -> Option<AbstractHeapType> {
        Some(match raw {
            -1 => AbstractHeapType::Any,
            -2 => AbstractHeapType::Eq,
            -3 => AbstractHeapType::I31,
            -4 => AbstractHeapType::Struct,
            -5 => AbstractHeapType::Array,
            -6 => AbstractHeapType::Func,
            -7 => AbstractHeapType::Extern,
            -8 => AbstractHeapType::None,
            -9 => AbstractHeapType::NoFunc,
            -10 => AbstractHeapType::NoExtern,
            _ => return None,
        })
    }

    /// The encoded type index.
    pub fn as_raw(self) -> i32 {
        self as i32
    }
}

/// One defined type as the cache sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeInfo {
    /// Index of the declared supertype, or negative for none.
    pub super_idx: i32,
    /// Kind of the type (struct, array or func) as assigned by the compiler.
    pub kind: i32,
    /// Number of fields for struct types.
    pub field_count: i32,
}

/// Subtyping and signature information for the module executing on this
/// thread.
#[derive(Debug, Default)]
pub struct TypeCache {
    types: Vec<TypeInfo>,
    canonical: Vec<i32>,
    func_types: Vec<i32>,
    func_table: Option<(*const *const VMFunctionBody, usize)>,
}

impl TypeCache {
    /// An empty cache.
    pub fn new() -> TypeCache {
        TypeCache::default()
    }

    /// Sets the defined types from `(super, kind, field_count)` triples.
    pub fn set_types(&mut self, types: &[(i32, i32, i32)]) {
        self.types = types
            .iter()
            .map(|&(super_idx, kind, field_count)| TypeInfo {
                super_idx,
                kind,
                field_count,
            })
            .collect();
    }

    /// Sets the canonical index of each defined type; types with equal
    /// canonical indices are structurally identical.
    pub fn set_canonical_indices(&mut self, canonical: &[i32]) {
        self.canonical = canonical.to_vec();
    }

    /// Sets the signature type index of each function.
    pub fn set_func_type_indices(&mut self, indices: &[i32]) {
        self.func_types = indices.to_vec();
    }

    /// Sets the function table used to resolve code-pointer function
    /// references back to function indices.
    ///
    /// # Safety
    ///
    /// `table` must stay valid for `len` entries while this cache is
    /// installed.
    pub unsafe fn set_func_table(&mut self, table: *const *const VMFunctionBody, len: usize) {
        self.func_table = if table.is_null() { None } else { Some((table, len)) };
    }

    /// Forgets everything.
    pub fn clear(&mut self) {
        *self = TypeCache::default();
    }

    /// Information about type `idx`.
    pub fn type_info(&self, idx: i32) -> Option<TypeInfo> {
        self.types.get(usize::try_from(idx).ok()?).copied()
    }

    /// Field count of struct type `idx`, 0 if unknown.
    pub fn field_count(&self, idx: i32) -> usize {
        self.type_info(idx)
            .and_then(|t| usize::try_from(t.field_count).ok())
            .unwrap_or(0)
    }

    fn canonical(&self, idx: usize) -> i32 {
        self.canonical.get(idx).copied().unwrap_or(idx as i32)
    }

    fn in_range(&self, idx: i32) -> Option<usize> {
        usize::try_from(idx).ok().filter(|&i| i < self.types.len())
    }

    /// Whether `sub` is `sup` or declares it, transitively, as a
    /// supertype.
    pub fn is_subtype(&self, sub: i32, sup: i32) -> bool {
        if sub == sup {
            return true;
        }
        let (Some(sub_i), Some(sup_i)) = (self.in_range(sub), self.in_range(sup)) else {
            return false;
        };
        if sub_i < self.canonical.len()
            && sup_i < self.canonical.len()
            && self.canonical[sub_i] == self.canonical[sup_i]
        {
            return true;
        }
        let mut current = sub_i;
        for _ in 0..=self.types.len() {
            if current == sup_i {
                return true;
            }
            match self.in_range(self.types[current].super_idx) {
                Some(next) if next != current => current = next,
                _ => break,
            }
        }
        false
    }

    /// Walks the supertype chain of `from` comparing canonical indices
    /// against `target`.
    fn canonical_chain_contains(&self, from: i32, target: i32) -> bool {
        let (Some(mut current), Some(target)) = (self.in_range(from), self.in_range(target)) else {
            return false;
        };
        let target = self.canonical(target);
        for _ in 0..=self.types.len() {
            if self.canonical(current) == target {
                return true;
            }
            match self.in_range(self.types[current].super_idx) {
                Some(next) if next != current => current = next,
                _ => break,
            }
        }
        false
    }

    fn func_index_of(&self, value: RefValue) -> Option<usize> {
        match value {
            RefValue::FuncIndex(idx) => usize::try_from(idx).ok(),
            RefValue::FuncPtr(ptr) => {
                let (table, len) = self.func_table?;
                (0..len).find(|&i| unsafe { *table.add(i) } as usize == ptr)
            }
            _ => None,
        }
    }

    /// Whether `value` is an instance of heap type `type_idx`. Heap objects
    /// are looked up in `heap`.
    pub fn ref_test(&self, heap: Option<&GcHeap>, value: i64, type_idx: i32, nullable: bool) -> bool {
        use AbstractHeapType as A;
        let abs = AbstractHeapType::from_raw(type_idx);
        match RefValue::decode(value) {
            RefValue::Null => nullable,
            RefValue::Extern(_) => matches!(abs, Some(A::Any | A::Extern)),
            v @ (RefValue::FuncIndex(_) | RefValue::FuncPtr(_)) => match abs {
                Some(A::Func) => true,
                Some(_) => false,
                None => {
                    let Some(func) = self.func_index_of(v) else {
                        return false;
                    };
                    match self.func_types.get(func) {
                        Some(&sig) => self.canonical_chain_contains(sig, type_idx),
                        None => false,
                    }
                }
            },
            RefValue::I31(_) => matches!(abs, Some(A::Any | A::Eq | A::I31 | A::Extern)),
            RefValue::Heap(r) => {
                let Some(heap) = heap else {
                    return false;
                };
                let kind = heap.kind(r);
                let is_object = matches!(kind, GcKind::Struct | GcKind::Array);
                match abs {
                    Some(A::Any) => true,
                    Some(A::Eq | A::Extern) => is_object,
                    Some(A::Struct) => kind == GcKind::Struct,
                    Some(A::Array) => kind == GcKind::Array,
                    Some(_) => false,
                    None => self.canonical_chain_contains(heap.type_idx(r), type_idx),
                }
            }
            RefValue::Invalid(_) => false,
        }
    }
}

thread_local! {
    static TYPE_CACHE: RefCell<TypeCache> = RefCell::new(TypeCache::new());
}

pub(super) fn set_type_cache(cache: TypeCache) -> TypeCache {
    TYPE_CACHE.with(|c| c.replace(cache))
}

pub(super) fn with_type_cache<R>(f: impl FnOnce(&mut TypeCache) -> R) -> R {
    TYPE_CACHE.with(|c| f(&mut c.borrow_mut()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::{EXTERNREF_TAG, FUNCREF_TAG};
    use proptest::prelude::*;

    // 0 <: 1 <: 2, 3 is canonically equal to 1, 4 loops to itself.
    fn cache() -> TypeCache {
        let mut cache = TypeCache::new();
        cache.set_types(&[(1, 0, 2), (2, 0, 1), (-1, 0, 0), (-1, 0, 1), (4, 0, 0)]);
        cache.set_canonical_indices(&[0, 1, 2, 1, 4]);
        cache
    }

    #[test]
    fn subtyping() {
        let cache = cache();
        assert!(cache.is_subtype(0, 2));
        assert!(cache.is_subtype(0, 1));
        assert!(!cache.is_subtype(2, 0));
        assert!(cache.is_subtype(3, 1));
        assert!(cache.is_subtype(1, 3));
        assert!(!cache.is_subtype(4, 0));
        assert!(!cache.is_subtype(0, 9));
        assert!(cache.is_subtype(9, 9));
        assert_eq!(cache.field_count(0), 2);
        assert_eq!(cache.field_count(7), 0);
    }

    #[test]
    fn abstract_tests() {
        let cache = cache();
        let i31 = 5;
        let ext = EXTERNREF_TAG | 2;
        let func = -1;
        assert!(cache.ref_test(None, 0, -1, true));
        assert!(!cache.ref_test(None, 0, -1, false));
        assert!(cache.ref_test(None, ext, AbstractHeapType::Extern.as_raw(), false));
        assert!(cache.ref_test(None, ext, AbstractHeapType::Any.as_raw(), false));
        assert!(!cache.ref_test(None, ext, AbstractHeapType::Eq.as_raw(), false));
        assert!(cache.ref_test(None, i31, AbstractHeapType::I31.as_raw(), false));
        assert!(cache.ref_test(None, i31, AbstractHeapType::Eq.as_raw(), false));
        assert!(!cache.ref_test(None, i31, AbstractHeapType::Struct.as_raw(), false));
        assert!(cache.ref_test(None, func, AbstractHeapType::Func.as_raw(), false));
        assert!(!cache.ref_test(None, func, AbstractHeapType::Any.as_raw(), false));
    }

    #[test]
    fn heap_objects() {
        let cache = cache();
        let mut heap = GcHeap::new(0);
        let s = heap.alloc_struct(0, &[1, 2]).unwrap().encode();
        let a = heap.alloc_array(3, 1, 0).unwrap().encode();
        assert!(cache.ref_test(Some(&heap), s, AbstractHeapType::Struct.as_raw(), false));
        assert!(!cache.ref_test(Some(&heap), s, AbstractHeapType::Array.as_raw(), false));
        assert!(cache.ref_test(Some(&heap), a, AbstractHeapType::Eq.as_raw(), false));
        assert!(cache.ref_test(Some(&heap), s, 2, false));
        assert!(!cache.ref_test(Some(&heap), a, 0, false));
        assert!(cache.ref_test(Some(&heap), a, 1, false));
        assert!(!cache.ref_test(None, s, AbstractHeapType::Any.as_raw(), false));
    }

    #[test]
    fn function_references() {
        let bodies = [0x1000usize, 0x2000, 0x3000].map(|p| p as *const VMFunctionBody);
        let mut cache = cache();
        cache.set_func_type_indices(&[2, 0, 3]);
        unsafe { cache.set_func_table(bodies.as_ptr(), bodies.len()) };

        assert!(cache.ref_test(None, -2, 1, false));
        assert!(!cache.ref_test(None, -1, 1, false));
        assert!(cache.ref_test(None, FUNCREF_TAG | 0x3000, 1, false));
        assert!(!cache.ref_test(None, FUNCREF_TAG | 0x4000, 1, false));

        cache.clear();
        assert!(!cache.ref_test(None, -2, 1, false));
    }

    proptest! {
        #[test]
        fn subtyping_is_reflexive(supers in prop::collection::vec(-1i32..8, 1..8), idx in -20i32..20) {
            let mut cache = TypeCache::new();
            let types = supers.iter().map(|&s| (s, 0, 0)).collect::<Vec<_>>();
            cache.set_types(&types);
            prop_assert!(cache.is_subtype(idx, idx));
        }

        #[test]
        fn subtyping_terminates_on_cycles(supers in prop::collection::vec(0i32..8, 8), a in 0i32..8, b in 0i32..8) {
            let mut cache = TypeCache::new();
            let types = supers.iter().map(|&s| (s, 0, 0)).collect::<Vec<_>>();
            cache.set_types(&types);
            let _ = cache.is_subtype(a, b);
        }
    }
}
