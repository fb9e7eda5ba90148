//! This file declares `VMContext` and several related structs which contain
//! fields that compiled wasm code accesses directly.

use crate::config::RuntimeConfig;
use crate::exception::ExceptionState;
use crate::gc::GcHeap;
use crate::memory::{Memory, VMMemoryDefinition};
use crate::stack::WasmStack;
use crate::table::{TableAllocation, VMTableEntry};
use crate::wasi::WasiState;
use anyhow::Result;
use std::ptr::{self, NonNull};

/// A placeholder byte-sized type which is just used to provide some amount of
/// type safety when dealing with pointers to JIT-compiled function bodies.
/// Note that it's deliberately not Copy, as we shouldn't be carelessly copying
/// function body bytes around.
#[repr(C)]
pub struct VMFunctionBody(u8);

/// The signature of the entry trampolines the code generator emits for each
/// exported function.
///
/// The trampoline reads arguments from and writes results to `values`, then
/// returns 0 on success.
pub type VMTrampoline =
    unsafe extern "C" fn(*mut VMContext, *mut i64, *const VMFunctionBody) -> i32;

/// Byte offsets of the fields generated code loads from a `VMContext`.
///
/// These only hold on 64-bit hosts, which is all the code generator targets.
pub mod offsets {
    /// `*mut VMMemoryDefinition` for memory 0.
    pub const MEMORY0: u32 = 0;
    /// `*mut *const VMFunctionBody`, indexed by function index.
    pub const FUNC_TABLE: u32 = 8;
    /// `*mut VMTableEntry` for table 0.
    pub const TABLE0_BASE: u32 = 16;
    /// Element count of table 0.
    pub const TABLE0_ELEMENTS: u32 = 24;
    /// Base of the globals area.
    pub const GLOBALS: u32 = 32;
    /// `*mut *mut VMTableEntry`, indexed by table index.
    pub const TABLES: u32 = 40;
    /// `i32` number of tables.
    pub const TABLE_COUNT: u32 = 48;
    /// `i32` number of functions.
    pub const FUNC_COUNT: u32 = 52;
    /// `*mut usize` current table sizes.
    pub const TABLE_SIZES: u32 = 56;
    /// `*mut usize` table maximum sizes.
    pub const TABLE_MAX_SIZES: u32 = 64;
    /// `*mut *mut VMMemoryDefinition`, indexed by memory index.
    pub const MEMORIES: u32 = 72;
    /// `i32` number of memories.
    pub const MEMORY_COUNT: u32 = 80;
    /// `i32` index of the executing function, written by generated code.
    pub const DEBUG_CURRENT_FUNC_IDX: u32 = 84;
    /// GC bump-allocation cursor.
    pub const GC_HEAP_PTR: u32 = 88;
    /// GC bump-allocation limit.
    pub const GC_HEAP_LIMIT: u32 = 96;
    /// `*mut GcHeap`.
    pub const GC_HEAP: u32 = 104;
}

/// Heap storage whose address is published to generated code.
///
/// Unlike a `Box<[T]>` this never asserts unique access, so compiled code may
/// write through the published pointer while the runtime still owns it.
pub(crate) struct VMArray<T: Copy> {
    ptr: NonNull<T>,
    len: usize,
}

impl<T: Copy> VMArray<T> {
    pub(crate) fn new(len: usize, fill: T) -> VMArray<T> {
        VMArray::from_vec(vec![fill; len])
    }

    pub(crate) fn from_vec(items: Vec<T>) -> VMArray<T> {
        let len = items.len();
        let raw = Box::into_raw(items.into_boxed_slice());
        VMArray {
            // SAFETY: `Box::into_raw` never returns null.
            ptr: unsafe { NonNull::new_unchecked(raw.cast::<T>()) },
            len,
        }
    }

    pub(crate) fn as_ptr(&self) -> *mut T {
        self.ptr.as_ptr()
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }
}

impl<T: Copy> Drop for VMArray<T> {
    fn drop(&mut self) {
        unsafe {
            drop(Box::from_raw(ptr::slice_from_raw_parts_mut(
                self.ptr.as_ptr(),
                self.len,
            )));
        }
    }
}

/// The VM "context", which is pointed to by the `vmctx` arg in generated
/// code.
///
/// The leading fields are read and written by compiled code at the offsets in
/// [`offsets`]; everything after `gc_heap` is runtime bookkeeping that records
/// which of the published resources this context owns.
#[repr(C)]
pub struct VMContext {
    pub(crate) memory0: *mut VMMemoryDefinition,
    pub(crate) func_table: *mut *const VMFunctionBody,
    pub(crate) table0_base: *mut VMTableEntry,
    pub(crate) table0_elements: usize,
    pub(crate) globals: *mut u8,
    pub(crate) tables: *mut *mut VMTableEntry,
    pub(crate) table_count: i32,
    pub(crate) func_count: i32,
    pub(crate) table_sizes: *mut usize,
    pub(crate) table_max_sizes: *mut usize,
    pub(crate) memories: *mut *mut VMMemoryDefinition,
    pub(crate) memory_count: i32,
    pub(crate) debug_current_func_idx: i32,
    pub(crate) gc_heap_ptr: *mut u8,
    pub(crate) gc_heap_limit: *mut u8,
    pub(crate) gc_heap: *mut GcHeap,

    owned_memory0: Option<Memory>,
    func_storage: VMArray<*const VMFunctionBody>,
    pub(crate) owned_table0: Option<TableAllocation>,
    table_ptr_storage: Option<VMArray<*mut VMTableEntry>>,
    table_size_storage: Option<VMArray<usize>>,
    table_max_storage: Option<VMArray<usize>>,
    /// Tables created by `table.grow`, by table index.
    pub(crate) grown_tables: Vec<Option<TableAllocation>>,
    memory_ptr_storage: Option<VMArray<*mut VMMemoryDefinition>>,
    globals_storage: Option<VMArray<u64>>,
    pub(crate) exceptions: ExceptionState,
    pub(crate) wasm_stack: Option<WasmStack>,
    pub(crate) wasi: WasiState,
}

impl VMContext {
    /// Allocates a context for a module with `func_count` functions.
    ///
    /// Every published pointer starts out null and the context owns nothing
    /// besides its function table.
    pub fn new(func_count: usize) -> Box<VMContext> {
        let func_storage = VMArray::new(func_count, ptr::null());
        Box::new(VMContext {
            memory0: ptr::null_mut(),
            func_table: func_storage.as_ptr(),
            table0_base: ptr::null_mut(),
            table0_elements: 0,
            globals: ptr::null_mut(),
            tables: ptr::null_mut(),
            table_count: 0,
            func_count: i32::try_from(func_count).unwrap_or(i32::MAX),
            table_sizes: ptr::null_mut(),
            table_max_sizes: ptr::null_mut(),
            memories: ptr::null_mut(),
            memory_count: 0,
            debug_current_func_idx: -1,
            gc_heap_ptr: ptr::null_mut(),
            gc_heap_limit: ptr::null_mut(),
            gc_heap: ptr::null_mut(),

            owned_memory0: None,
            func_storage,
            owned_table0: None,
            table_ptr_storage: None,
            table_size_storage: None,
            table_max_storage: None,
            grown_tables: Vec::new(),
            memory_ptr_storage: None,
            globals_storage: None,
            exceptions: ExceptionState::default(),
            wasm_stack: None,
            wasi: WasiState::default(),
        })
    }

    /// Number of functions this context was sized for.
    pub fn func_count(&self) -> usize {
        usize::try_from(self.func_count).unwrap_or(0)
    }

    /// Publishes the entry point of function `idx`. Out-of-range indices are
    /// ignored.
    pub fn set_func(&mut self, idx: usize, body: *const VMFunctionBody) {
        if idx < self.func_storage.len() {
            unsafe {
                *self.func_storage.as_ptr().add(idx) = body;
            }
        }
    }

    /// Returns the entry point of function `idx`, or null.
    pub fn func(&self, idx: usize) -> *const VMFunctionBody {
        if idx < self.func_storage.len() {
            unsafe { *self.func_storage.as_ptr().add(idx) }
        } else {
            ptr::null()
        }
    }

    /// The function-pointer table generated code indexes directly.
    pub fn func_table(&self) -> *mut *const VMFunctionBody {
        self.func_table
    }

    /// Installs `memory` as memory 0.
    ///
    /// Re-installing the current memory 0 is a no-op that keeps ownership.
    /// Any other pointer releases a context-owned memory 0 and is borrowed.
    pub fn set_memory(&mut self, memory: *mut VMMemoryDefinition) {
        if memory == self.memory0 {
            return;
        }
        self.owned_memory0 = None;
        self.memory0 = memory;
        if let Some(storage) = &self.memory_ptr_storage {
            if storage.len() > 0 {
                unsafe { *storage.as_ptr() = memory };
            }
        }
    }

    /// Transfers ownership of `memory` to the context and installs it as
    /// memory 0.
    pub fn set_owned_memory(&mut self, memory: Memory) {
        let def = memory.vmmemory();
        self.set_memory(def);
        self.owned_memory0 = Some(memory);
    }

    /// Allocates a guarded memory 0 owned by this context.
    pub fn alloc_guarded_memory(&mut self, initial_pages: usize, max_pages: Option<usize>) -> Result<()> {
        let memory = Memory::new_guarded(initial_pages, max_pages)?;
        self.set_owned_memory(memory);
        Ok(())
    }

    /// Allocates memory 0 according to `config`: guarded if guard pages are
    /// enabled, a plain heap allocation otherwise.
    pub fn alloc_memory(
        &mut self,
        config: &RuntimeConfig,
        initial_pages: usize,
        max_pages: Option<usize>,
    ) -> Result<()> {
        let memory = Memory::new_with_config(config, initial_pages, max_pages)?;
        self.set_owned_memory(memory);
        Ok(())
    }

    /// Whether memory 0 is owned by the context.
    pub fn owns_memory0(&self) -> bool {
        self.owned_memory0.is_some()
    }

    /// Memory 0, or null.
    pub fn memory0(&self) -> *mut VMMemoryDefinition {
        self.memory0
    }

    /// Installs the multi-memory array; `memories[0]` becomes memory 0.
    ///
    /// A context-owned memory 0 stays owned only if it is also the new
    /// memory 0. Empty input is ignored.
    pub fn set_memory_pointers(&mut self, memories: &[*mut VMMemoryDefinition]) {
        let Some(&first) = memories.first() else {
            return;
        };
        if first != self.memory0 {
            self.owned_memory0 = None;
        }
        let storage = VMArray::from_vec(memories.to_vec());
        self.memories = storage.as_ptr();
        self.memory_count = i32::try_from(storage.len()).unwrap_or(i32::MAX);
        self.memory_ptr_storage = Some(storage);
        self.memory0 = first;
    }

    /// Resolves a memory index, with index 0 taken from the fast-path field.
    pub fn memory(&self, idx: u32) -> Option<NonNull<VMMemoryDefinition>> {
        if idx == 0 {
            return NonNull::new(self.memory0);
        }
        if self.memories.is_null() || i64::from(idx) >= i64::from(self.memory_count) {
            return None;
        }
        NonNull::new(unsafe { *self.memories.add(idx as usize) })
    }

    /// Base address of memory `idx`, or null.
    pub fn get_memory_ptr(&self, idx: u32) -> *mut u8 {
        match self.memory(idx) {
            Some(mem) => unsafe { mem.as_ref().base },
            None => ptr::null_mut(),
        }
    }

    /// Current byte length of memory `idx`, or 0.
    pub fn get_memory_size(&self, idx: u32) -> usize {
        match self.memory(idx) {
            Some(mem) => unsafe { mem.as_ref().current_length() },
            None => 0,
        }
    }

    /// Installs `count` zeroed 8-byte global slots owned by the context and
    /// returns their base.
    pub fn alloc_globals(&mut self, count: usize) -> *mut u64 {
        let storage = VMArray::new(count, 0u64);
        self.globals = storage.as_ptr().cast();
        let base = storage.as_ptr();
        self.globals_storage = Some(storage);
        base
    }

    /// Publishes an externally-owned globals area.
    pub fn set_globals(&mut self, globals: *mut u8) {
        self.globals_storage = None;
        self.globals = globals;
    }

    /// Base of the globals area.
    pub fn globals(&self) -> *mut u8 {
        self.globals
    }

    /// Allocates a context-owned table 0 with `count` null entries, releasing
    /// any previously owned table 0.
    pub fn alloc_indirect_table(&mut self, count: usize) {
        let table = TableAllocation::new(count, VMTableEntry::NULL);
        self.table0_base = table.as_ptr();
        self.table0_elements = table.len();
        self.owned_table0 = Some(table);
        self.mirror_table0_into_tables();
    }

    /// Copies function `func_idx` from the function table into slot
    /// `table_idx` of table 0 with the given signature type.
    pub fn set_indirect(&mut self, table_idx: usize, func_idx: usize, type_idx: i32) {
        if self.table0_base.is_null() || table_idx >= self.table0_elements {
            return;
        }
        let callee = self.func(func_idx);
        unsafe {
            *self.table0_base.add(table_idx) = VMTableEntry {
                callee,
                type_index: type_idx as isize,
            };
        }
    }

    /// Borrows `table` as table 0, releasing any owned table 0.
    pub fn use_shared_table(&mut self, table: &crate::table::SharedTable) {
        self.owned_table0 = None;
        self.table0_base = table.as_ptr();
        self.table0_elements = table.len();
        self.mirror_table0_into_tables();
    }

    /// Table 0 and its element count.
    pub fn table0(&self) -> (*mut VMTableEntry, usize) {
        (self.table0_base, self.table0_elements)
    }

    /// Whether table 0 is owned by the context.
    pub fn owns_indirect_table(&self) -> bool {
        self.owned_table0.is_some()
    }

    /// Installs the multi-table arrays. `max_sizes` entries that are
    /// negative, or missing entirely, mean "unlimited". Table 0 is mirrored
    /// into the fast-path fields when non-null.
    pub fn set_table_pointers(
        &mut self,
        tables: &[*mut VMTableEntry],
        sizes: &[usize],
        max_sizes: Option<&[i64]>,
    ) {
        if tables.is_empty() {
            return;
        }
        let sizes = (0..tables.len())
            .map(|i| sizes.get(i).copied().unwrap_or(0))
            .collect::<Vec<_>>();
        let maxes = (0..tables.len())
            .map(|i| match max_sizes.and_then(|m| m.get(i)) {
                Some(&max) if max >= 0 => max as usize,
                _ => usize::MAX,
            })
            .collect::<Vec<_>>();

        let ptrs = VMArray::from_vec(tables.to_vec());
        let sizes = VMArray::from_vec(sizes);
        let maxes = VMArray::from_vec(maxes);
        self.tables = ptrs.as_ptr();
        self.table_sizes = sizes.as_ptr();
        self.table_max_sizes = maxes.as_ptr();
        self.table_count = i32::try_from(ptrs.len()).unwrap_or(i32::MAX);
        self.grown_tables = (0..ptrs.len()).map(|_| None).collect();
        self.table_ptr_storage = Some(ptrs);
        self.table_size_storage = Some(sizes);
        self.table_max_storage = Some(maxes);

        let first = tables[0];
        if !first.is_null() && first != self.table0_base {
            self.owned_table0 = None;
            self.table0_base = first;
            self.table0_elements = unsafe { *self.table_sizes };
        }
    }

    /// Keeps slot 0 of the multi-table arrays pointing at table 0.
    fn mirror_table0_into_tables(&mut self) {
        if self.tables.is_null() || self.table_count <= 0 {
            return;
        }
        unsafe {
            *self.tables = self.table0_base;
            *self.table_sizes = self.table0_elements;
        }
        if let Some(slot) = self.grown_tables.first_mut() {
            *slot = None;
        }
    }

    /// Resolves a table index to its base and current element count.
    pub fn table(&self, idx: u32) -> Option<(*mut VMTableEntry, usize)> {
        if idx == 0 && !self.table0_base.is_null() {
            return Some((self.table0_base, self.table0_elements));
        }
        if self.tables.is_null() || i64::from(idx) >= i64::from(self.table_count) {
            return None;
        }
        unsafe {
            let base = *self.tables.add(idx as usize);
            let size = *self.table_sizes.add(idx as usize);
            Some((base, size))
        }
    }

    /// Number of tables in the multi-table arrays.
    pub fn table_count(&self) -> usize {
        usize::try_from(self.table_count).unwrap_or(0)
    }

    /// Points the context at `heap` and refreshes the bump-allocation
    /// cursor and limit from it.
    pub fn set_gc_heap(&mut self, heap: *mut GcHeap) {
        self.gc_heap = heap;
        self.update_gc_heap_ptr();
    }

    /// Refreshes the bump-allocation cursor and limit after the heap's
    /// backing store may have moved.
    pub fn update_gc_heap_ptr(&mut self) {
        match unsafe { self.gc_heap.as_mut() } {
            Some(heap) => {
                let (ptr, limit) = heap.bump_bounds();
                self.gc_heap_ptr = ptr;
                self.gc_heap_limit = limit;
            }
            None => {
                self.gc_heap_ptr = ptr::null_mut();
                self.gc_heap_limit = ptr::null_mut();
            }
        }
    }

    /// The GC heap this context allocates in, or null.
    pub fn gc_heap(&self) -> *mut GcHeap {
        self.gc_heap
    }

    /// Current bump-allocation cursor and limit.
    pub fn gc_bump_bounds(&self) -> (*mut u8, *mut u8) {
        (self.gc_heap_ptr, self.gc_heap_limit)
    }

    /// Allocates a fresh independent stack of `size` bytes, replacing any
    /// previous one.
    pub fn alloc_wasm_stack(&mut self, size: usize) -> Result<()> {
        self.wasm_stack = None;
        self.wasm_stack = Some(WasmStack::new(size)?);
        Ok(())
    }

    /// Allocates an independent stack sized by `config`.
    pub fn alloc_wasm_stack_with_config(&mut self, config: &RuntimeConfig) -> Result<()> {
        self.alloc_wasm_stack(config.wasm_stack_size)
    }

    /// The 16-byte aligned top of the independent stack, or null.
    pub fn wasm_stack_top(&self) -> *mut u8 {
        self.wasm_stack
            .as_ref()
            .map_or(ptr::null_mut(), |s| s.top())
    }

    /// The independent stack, if one is allocated.
    pub fn wasm_stack(&self) -> Option<&WasmStack> {
        self.wasm_stack.as_ref()
    }

    /// The function index most recently published by generated code.
    pub fn current_func_index(&self) -> Option<u32> {
        u32::try_from(self.debug_current_func_idx).ok()
    }

    /// Publishes the executing function index, as generated code does on
    /// function entry.
    pub fn set_current_func_index(&mut self, idx: i32) {
        self.debug_current_func_idx = idx;
    }
}

impl Drop for VMContext {
    fn drop(&mut self) {
        // Handler nodes are raw allocations linked through the chain.
        crate::exception::free_handler_chain(self);
    }
}
